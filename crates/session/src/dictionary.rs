//! Field and enum-type dictionaries.
//!
//! Payload data arrives as bare field ids; the dictionaries map them to
//! names and types for display. Both dictionaries can be pre-loaded from
//! local files or downloaded from the provider as multi-part refreshes.
//! The on-disk format here is a plain whitespace-separated line format
//! owned by this crate, not the vendor's.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::error::DictionaryError;

/// Conventional local file name for field definitions.
pub const FIELD_DICTIONARY_FILE: &str = "RDMFieldDictionary";
/// Conventional local file name for enumerated types.
pub const ENUM_TYPE_DICTIONARY_FILE: &str = "enumtype.def";
/// Download name a provider advertises for field definitions.
pub const FIELD_DICTIONARY_DOWNLOAD_NAME: &str = "RWFFld";
/// Download name a provider advertises for enum tables.
pub const ENUM_TYPE_DOWNLOAD_NAME: &str = "RWFEnum";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DictionaryKind {
    FieldDefinitions,
    EnumTables,
}

impl DictionaryKind {
    pub fn download_name(&self) -> &'static str {
        match self {
            DictionaryKind::FieldDefinitions => FIELD_DICTIONARY_DOWNLOAD_NAME,
            DictionaryKind::EnumTables => ENUM_TYPE_DOWNLOAD_NAME,
        }
    }

    /// Type tag a download's first part declares in its header.
    fn type_tag(&self) -> &'static str {
        match self {
            DictionaryKind::FieldDefinitions => "field_definitions",
            DictionaryKind::EnumTables => "enum_tables",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub fid: u16,
    pub name: String,
    pub field_type: String,
}

pub trait DictionaryStore: Send {
    fn load_from_file(&mut self, kind: DictionaryKind, path: &Path) -> Result<(), DictionaryError>;

    /// Apply one download part. The first part of a download carries a type
    /// tag that must match `kind`. Returns true once the dictionary is
    /// fully loaded (refresh-complete observed); re-delivery of a complete
    /// part is idempotent.
    fn apply_part(
        &mut self,
        kind: DictionaryKind,
        payload: &serde_json::Value,
        complete: bool,
    ) -> Result<bool, DictionaryError>;

    fn is_loaded(&self, kind: DictionaryKind) -> bool;

    fn lookup(&self, fid: u16) -> Option<&FieldDef>;

    fn enum_display(&self, fid: u16, value: i64) -> Option<&str>;
}

#[derive(Debug, Deserialize)]
struct FieldEntry {
    fid: u16,
    name: String,
    #[serde(rename = "type")]
    field_type: String,
}

#[derive(Debug, Deserialize)]
struct EnumEntry {
    fid: u16,
    value: i64,
    display: String,
}

#[derive(Debug, Deserialize)]
struct DictionaryPart {
    /// Declared on the first part of a download only.
    #[serde(rename = "type")]
    type_tag: Option<String>,
    #[serde(default)]
    entries: serde_json::Value,
}

/// In-memory dictionary store.
#[derive(Debug, Default)]
pub struct DataDictionary {
    fields: HashMap<u16, FieldDef>,
    enums: HashMap<(u16, i64), String>,
    field_dictionary_loaded: bool,
    enum_type_dictionary_loaded: bool,
    field_first_part_seen: bool,
    enum_first_part_seen: bool,
}

impl DataDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    fn loaded_flag(&mut self, kind: DictionaryKind) -> &mut bool {
        match kind {
            DictionaryKind::FieldDefinitions => &mut self.field_dictionary_loaded,
            DictionaryKind::EnumTables => &mut self.enum_type_dictionary_loaded,
        }
    }

    fn first_part_flag(&mut self, kind: DictionaryKind) -> &mut bool {
        match kind {
            DictionaryKind::FieldDefinitions => &mut self.field_first_part_seen,
            DictionaryKind::EnumTables => &mut self.enum_first_part_seen,
        }
    }

    fn apply_entries(
        &mut self,
        kind: DictionaryKind,
        entries: &serde_json::Value,
    ) -> Result<usize, DictionaryError> {
        if entries.is_null() {
            return Ok(0);
        }
        match kind {
            DictionaryKind::FieldDefinitions => {
                let parsed: Vec<FieldEntry> = serde_json::from_value(entries.clone())
                    .map_err(|e| DictionaryError::MalformedPart(e.to_string()))?;
                let count = parsed.len();
                for entry in parsed {
                    self.fields.insert(
                        entry.fid,
                        FieldDef {
                            fid: entry.fid,
                            name: entry.name,
                            field_type: entry.field_type,
                        },
                    );
                }
                Ok(count)
            }
            DictionaryKind::EnumTables => {
                let parsed: Vec<EnumEntry> = serde_json::from_value(entries.clone())
                    .map_err(|e| DictionaryError::MalformedPart(e.to_string()))?;
                let count = parsed.len();
                for entry in parsed {
                    self.enums.insert((entry.fid, entry.value), entry.display);
                }
                Ok(count)
            }
        }
    }
}

impl DictionaryStore for DataDictionary {
    fn load_from_file(&mut self, kind: DictionaryKind, path: &Path) -> Result<(), DictionaryError> {
        let content = std::fs::read_to_string(path)?;
        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            match kind {
                DictionaryKind::FieldDefinitions => {
                    // FID NAME TYPE
                    if parts.len() < 3 {
                        return Err(DictionaryError::Parse {
                            line: idx + 1,
                            reason: "expected: <fid> <name> <type>".to_string(),
                        });
                    }
                    let fid = parts[0].parse::<u16>().map_err(|e| DictionaryError::Parse {
                        line: idx + 1,
                        reason: e.to_string(),
                    })?;
                    self.fields.insert(
                        fid,
                        FieldDef {
                            fid,
                            name: parts[1].to_string(),
                            field_type: parts[2].to_string(),
                        },
                    );
                }
                DictionaryKind::EnumTables => {
                    // FID VALUE DISPLAY
                    if parts.len() < 3 {
                        return Err(DictionaryError::Parse {
                            line: idx + 1,
                            reason: "expected: <fid> <value> <display>".to_string(),
                        });
                    }
                    let fid = parts[0].parse::<u16>().map_err(|e| DictionaryError::Parse {
                        line: idx + 1,
                        reason: e.to_string(),
                    })?;
                    let value = parts[1].parse::<i64>().map_err(|e| DictionaryError::Parse {
                        line: idx + 1,
                        reason: e.to_string(),
                    })?;
                    self.enums.insert((fid, value), parts[2].to_string());
                }
            }
        }
        *self.loaded_flag(kind) = true;
        debug!(path = %path.display(), kind = ?kind, "loaded dictionary from file");
        Ok(())
    }

    fn apply_part(
        &mut self,
        kind: DictionaryKind,
        payload: &serde_json::Value,
        complete: bool,
    ) -> Result<bool, DictionaryError> {
        // Re-delivery after completion must not corrupt loaded state.
        if *self.loaded_flag(kind) {
            return Ok(true);
        }

        let part: DictionaryPart = serde_json::from_value(payload.clone())
            .map_err(|e| DictionaryError::MalformedPart(e.to_string()))?;

        if !*self.first_part_flag(kind) {
            let declared = part
                .type_tag
                .as_deref()
                .ok_or_else(|| {
                    DictionaryError::MalformedPart("first part missing type tag".to_string())
                })?;
            if declared != kind.type_tag() {
                return Err(DictionaryError::KindMismatch {
                    declared: declared.to_string(),
                    expected: kind.type_tag().to_string(),
                });
            }
            *self.first_part_flag(kind) = true;
        }

        let count = self.apply_entries(kind, &part.entries)?;
        debug!(kind = ?kind, entries = count, complete, "applied dictionary part");

        if complete {
            *self.loaded_flag(kind) = true;
        }
        Ok(*self.loaded_flag(kind))
    }

    fn is_loaded(&self, kind: DictionaryKind) -> bool {
        match kind {
            DictionaryKind::FieldDefinitions => self.field_dictionary_loaded,
            DictionaryKind::EnumTables => self.enum_type_dictionary_loaded,
        }
    }

    fn lookup(&self, fid: u16) -> Option<&FieldDef> {
        self.fields.get(&fid)
    }

    fn enum_display(&self, fid: u16, value: i64) -> Option<&str> {
        self.enums.get(&(fid, value)).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn field_part(first: bool, entries: serde_json::Value) -> serde_json::Value {
        if first {
            serde_json::json!({"type": "field_definitions", "entries": entries})
        } else {
            serde_json::json!({"entries": entries})
        }
    }

    #[test]
    fn test_load_field_dictionary_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# fid name type").unwrap();
        writeln!(file, "22 BID real").unwrap();
        writeln!(file, "25 ASK real").unwrap();

        let mut dict = DataDictionary::new();
        dict.load_from_file(DictionaryKind::FieldDefinitions, file.path())
            .unwrap();

        assert!(dict.is_loaded(DictionaryKind::FieldDefinitions));
        assert_eq!(dict.lookup(22).unwrap().name, "BID");
        assert_eq!(dict.lookup(25).unwrap().field_type, "real");
        assert!(dict.lookup(99).is_none());
    }

    #[test]
    fn test_multi_part_download_order_preserving() {
        let mut dict = DataDictionary::new();

        let loaded = dict
            .apply_part(
                DictionaryKind::FieldDefinitions,
                &field_part(true, serde_json::json!([{"fid": 22, "name": "BID", "type": "real"}])),
                false,
            )
            .unwrap();
        assert!(!loaded);

        let loaded = dict
            .apply_part(
                DictionaryKind::FieldDefinitions,
                &field_part(false, serde_json::json!([{"fid": 25, "name": "ASK", "type": "real"}])),
                true,
            )
            .unwrap();
        assert!(loaded);
        assert_eq!(dict.field_count(), 2);
    }

    #[test]
    fn test_complete_redelivery_is_idempotent() {
        let mut dict = DataDictionary::new();
        let part =
            field_part(true, serde_json::json!([{"fid": 22, "name": "BID", "type": "real"}]));
        assert!(dict
            .apply_part(DictionaryKind::FieldDefinitions, &part, true)
            .unwrap());

        // Applying "complete" again must not corrupt loaded state.
        assert!(dict
            .apply_part(DictionaryKind::FieldDefinitions, &part, true)
            .unwrap());
        assert_eq!(dict.field_count(), 1);
        assert!(dict.is_loaded(DictionaryKind::FieldDefinitions));
    }

    #[test]
    fn test_first_part_type_mismatch_rejected() {
        let mut dict = DataDictionary::new();
        let wrong = serde_json::json!({"type": "enum_tables", "entries": []});
        let err = dict
            .apply_part(DictionaryKind::FieldDefinitions, &wrong, false)
            .unwrap_err();
        assert!(matches!(err, DictionaryError::KindMismatch { .. }));
    }

    #[test]
    fn test_enum_tables_lookup() {
        let mut dict = DataDictionary::new();
        dict.apply_part(
            DictionaryKind::EnumTables,
            &serde_json::json!({
                "type": "enum_tables",
                "entries": [{"fid": 4, "value": 2, "display": "NYSE"}]
            }),
            true,
        )
        .unwrap();

        assert_eq!(dict.enum_display(4, 2), Some("NYSE"));
        assert_eq!(dict.enum_display(4, 3), None);
    }
}
