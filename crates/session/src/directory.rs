//! Source directory payload model.
//!
//! A directory refresh advertises the provider's services; the consumer
//! scans it for the configured target service and latches the service id,
//! capability set, advertised dictionaries and up/accepting flags.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::BootstrapError;

/// Capability names a service can advertise.
pub const CAP_DICTIONARY: &str = "dictionary";
pub const CAP_MARKET_PRICE: &str = "market_price";

/// Bounds applied while scanning directory payloads. The training-era hard
/// caps become configuration here; exceeding a bound truncates with a
/// warning instead of failing the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryBounds {
    #[serde(default = "default_max_services")]
    pub max_services: usize,
    #[serde(default = "default_max_capabilities")]
    pub max_capabilities: usize,
    #[serde(default = "default_max_dictionaries")]
    pub max_dictionaries: usize,
    #[serde(default = "default_max_qos")]
    pub max_qos: usize,
}

fn default_max_services() -> usize {
    64
}
fn default_max_capabilities() -> usize {
    32
}
fn default_max_dictionaries() -> usize {
    16
}
fn default_max_qos() -> usize {
    16
}

impl Default for DirectoryBounds {
    fn default() -> Self {
        Self {
            max_services: default_max_services(),
            max_capabilities: default_max_capabilities(),
            max_dictionaries: default_max_dictionaries(),
            max_qos: default_max_qos(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QosInfo {
    pub timeliness: String,
    pub rate: String,
}

/// One service entry from a directory refresh/update, after bounds are
/// applied.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServiceInfo {
    pub service_id: u16,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub dictionaries_provided: Vec<String>,
    #[serde(default)]
    pub qos: Vec<QosInfo>,
    #[serde(default)]
    pub service_up: bool,
    #[serde(default)]
    pub accepting_requests: bool,
}

impl ServiceInfo {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    pub fn provides_dictionary(&self, download_name: &str) -> bool {
        self.dictionaries_provided.iter().any(|d| d == download_name)
    }
}

#[derive(Debug, Deserialize)]
struct DirectoryPayload {
    #[serde(default)]
    services: Vec<ServiceInfo>,
}

/// Extract the service list from a directory payload, truncating any list
/// that exceeds the configured bounds.
pub fn parse_services(
    payload: &serde_json::Value,
    bounds: &DirectoryBounds,
) -> Result<Vec<ServiceInfo>, BootstrapError> {
    let parsed: DirectoryPayload =
        serde_json::from_value(payload.clone()).map_err(|e| BootstrapError::Malformed {
            domain: "directory".to_string(),
            reason: e.to_string(),
        })?;

    let mut services = parsed.services;
    if services.len() > bounds.max_services {
        warn!(
            advertised = services.len(),
            max = bounds.max_services,
            "directory advertises more services than the configured bound, truncating"
        );
        services.truncate(bounds.max_services);
    }

    for service in &mut services {
        truncate_with_warning(
            &mut service.capabilities,
            bounds.max_capabilities,
            "capabilities",
            &service.name,
        );
        truncate_with_warning(
            &mut service.dictionaries_provided,
            bounds.max_dictionaries,
            "dictionaries_provided",
            &service.name,
        );
        if service.qos.len() > bounds.max_qos {
            warn!(
                service = %service.name,
                advertised = service.qos.len(),
                max = bounds.max_qos,
                "truncating qos list"
            );
            service.qos.truncate(bounds.max_qos);
        }
    }

    Ok(services)
}

fn truncate_with_warning(list: &mut Vec<String>, max: usize, what: &str, service: &str) {
    if list.len() > max {
        warn!(
            service = %service,
            list = %what,
            advertised = list.len(),
            max,
            "truncating directory list"
        );
        list.truncate(max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> serde_json::Value {
        serde_json::json!({
            "services": [{
                "service_id": 1,
                "name": "DIRECT_FEED",
                "capabilities": ["dictionary", "market_price"],
                "dictionaries_provided": ["RWFFld", "RWFEnum"],
                "qos": [{"timeliness": "realtime", "rate": "tick_by_tick"}],
                "service_up": true,
                "accepting_requests": true
            }]
        })
    }

    #[test]
    fn test_parse_single_service() {
        let services = parse_services(&sample_payload(), &DirectoryBounds::default()).unwrap();
        assert_eq!(services.len(), 1);
        let svc = &services[0];
        assert_eq!(svc.service_id, 1);
        assert_eq!(svc.name, "DIRECT_FEED");
        assert!(svc.supports(CAP_DICTIONARY));
        assert!(svc.supports(CAP_MARKET_PRICE));
        assert!(svc.provides_dictionary("RWFFld"));
        assert!(svc.service_up && svc.accepting_requests);
    }

    #[test]
    fn test_bounds_truncate_instead_of_failing() {
        let mut payload = sample_payload();
        let caps: Vec<String> = (0..40).map(|i| format!("cap_{i}")).collect();
        payload["services"][0]["capabilities"] = serde_json::json!(caps);

        let bounds = DirectoryBounds {
            max_capabilities: 4,
            ..Default::default()
        };
        let services = parse_services(&payload, &bounds).unwrap();
        assert_eq!(services[0].capabilities.len(), 4);
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        let payload = serde_json::json!({"services": "not-a-list"});
        assert!(parse_services(&payload, &DirectoryBounds::default()).is_err());
    }
}
