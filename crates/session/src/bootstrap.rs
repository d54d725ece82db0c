//! Session bootstrap state machine.
//!
//! Sequences Login -> Directory -> Dictionary -> Ready over an active
//! session. Each inbound message either advances the phase, emits follow-up
//! requests for the driver to send, or fails the bootstrap; failures are
//! terminal for the run, never retried. After Ready the machine stays
//! routed on directory traffic so a service withdrawal can tear down the
//! session instead of silently continuing.

use serde_json::json;
use tracing::{debug, info, warn};

use crate::dictionary::{DictionaryKind, DictionaryStore};
use crate::directory::{
    parse_services, DirectoryBounds, ServiceInfo, CAP_DICTIONARY, CAP_MARKET_PRICE,
};
use crate::error::BootstrapError;
use crate::message::{
    DataState, DomainType, MessageClass, StreamState, TypedMessage,
    ENUM_TYPE_DICTIONARY_STREAM_ID, FIELD_DICTIONARY_STREAM_ID, LOGIN_STREAM_ID, SRCDIR_STREAM_ID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapPhase {
    AwaitConnection,
    AwaitLogin,
    AwaitDirectory,
    AwaitDictionary,
    Ready,
    Failed,
}

pub struct Bootstrap {
    phase: BootstrapPhase,
    target_service: String,
    user_name: String,
    bounds: DirectoryBounds,
    discovered: Option<ServiceInfo>,
}

impl Bootstrap {
    pub fn new(
        target_service: impl Into<String>,
        user_name: impl Into<String>,
        bounds: DirectoryBounds,
    ) -> Self {
        Self {
            phase: BootstrapPhase::AwaitConnection,
            target_service: target_service.into(),
            user_name: user_name.into(),
            bounds,
            discovered: None,
        }
    }

    pub fn phase(&self) -> BootstrapPhase {
        self.phase
    }

    /// Service latched from the directory, available once discovery ran.
    pub fn discovered_service(&self) -> Option<&ServiceInfo> {
        self.discovered.as_ref()
    }

    fn fail(&mut self, err: BootstrapError) -> BootstrapError {
        self.phase = BootstrapPhase::Failed;
        err
    }

    fn login_request(&self) -> TypedMessage {
        TypedMessage::request(
            DomainType::Login,
            LOGIN_STREAM_ID,
            json!({
                "name": self.user_name,
                "application_id": "256",
                "application_name": "omc consumer",
                "role": "consumer",
            }),
        )
    }

    fn directory_request() -> TypedMessage {
        TypedMessage::request(
            DomainType::Directory,
            SRCDIR_STREAM_ID,
            json!({"filter": ["info", "state", "group"]}),
        )
    }

    fn dictionary_request(kind: DictionaryKind, service_id: u16) -> TypedMessage {
        let stream_id = match kind {
            DictionaryKind::FieldDefinitions => FIELD_DICTIONARY_STREAM_ID,
            DictionaryKind::EnumTables => ENUM_TYPE_DICTIONARY_STREAM_ID,
        };
        TypedMessage::request(
            DomainType::Dictionary,
            stream_id,
            json!({
                "dictionary_name": kind.download_name(),
                "service_id": service_id,
                "verbosity": "normal",
            }),
        )
    }

    /// Session reached Active: emit the login request.
    pub fn on_session_active(&mut self) -> Result<Vec<TypedMessage>, BootstrapError> {
        debug_assert_eq!(self.phase, BootstrapPhase::AwaitConnection);
        self.phase = BootstrapPhase::AwaitLogin;
        info!(user = %self.user_name, "sending login request");
        Ok(vec![self.login_request()])
    }

    /// Route one inbound login/directory/dictionary message. Returns any
    /// follow-up requests to send. Errors are fatal and latch Failed.
    pub fn on_message(
        &mut self,
        msg: &TypedMessage,
        dictionary: &mut dyn DictionaryStore,
    ) -> Result<Vec<TypedMessage>, BootstrapError> {
        match (msg.domain, self.phase) {
            (DomainType::Login, BootstrapPhase::AwaitLogin) => self.on_login(msg),
            (DomainType::Login, _) => {
                self.check_login_health(msg)?;
                Ok(Vec::new())
            }
            (DomainType::Directory, BootstrapPhase::AwaitDirectory) => {
                self.on_directory(msg, dictionary)
            }
            (DomainType::Directory, _) => {
                // Pass-through after discovery: watch for the bound service
                // going away underneath open streams.
                self.on_directory_update(msg)?;
                Ok(Vec::new())
            }
            (DomainType::Dictionary, BootstrapPhase::AwaitDictionary) => {
                self.on_dictionary(msg, dictionary)
            }
            (domain, phase) => {
                warn!(domain = %domain.as_str(), phase = ?phase, "ignoring unexpected message");
                Ok(Vec::new())
            }
        }
    }

    fn on_login(&mut self, msg: &TypedMessage) -> Result<Vec<TypedMessage>, BootstrapError> {
        match msg.class {
            MessageClass::Refresh => {
                let state = msg.state.as_ref().ok_or_else(|| {
                    self.fail(BootstrapError::Malformed {
                        domain: "login".to_string(),
                        reason: "refresh without state".to_string(),
                    })
                })?;
                let accepted = state.stream_state == StreamState::Open
                    && state.data_state == DataState::Ok
                    && msg.solicited;
                if !accepted {
                    let reason = format!(
                        "stream {:?}, data {:?}, solicited {}: {}",
                        state.stream_state,
                        state.data_state,
                        msg.solicited,
                        state.text()
                    );
                    return Err(self.fail(BootstrapError::LoginDenied(reason)));
                }
                if let Some(payload) = &msg.payload {
                    debug!(attributes = %payload, "login refresh accepted");
                }
                info!("login accepted, requesting source directory");
                self.phase = BootstrapPhase::AwaitDirectory;
                Ok(vec![Self::directory_request()])
            }
            MessageClass::Status => {
                self.check_login_health(msg)?;
                Ok(Vec::new())
            }
            other => {
                warn!(class = ?other, "unexpected login message class");
                Ok(Vec::new())
            }
        }
    }

    /// Login status traffic in any phase: a closed login stream takes the
    /// whole session down.
    fn check_login_health(&mut self, msg: &TypedMessage) -> Result<(), BootstrapError> {
        if let Some(state) = &msg.state {
            if state.stream_state.is_final() {
                let reason = format!("login stream closed: {}", state.text());
                return Err(self.fail(BootstrapError::LoginDenied(reason)));
            }
            if state.data_state == DataState::Suspect {
                warn!(text = %state.text(), "login stream suspect");
            }
        }
        Ok(())
    }

    fn on_directory(
        &mut self,
        msg: &TypedMessage,
        dictionary: &mut dyn DictionaryStore,
    ) -> Result<Vec<TypedMessage>, BootstrapError> {
        if !matches!(msg.class, MessageClass::Refresh | MessageClass::Update) {
            warn!(class = ?msg.class, "unexpected directory message class");
            return Ok(Vec::new());
        }
        let payload = msg.payload.as_ref().ok_or_else(|| {
            self.fail(BootstrapError::Malformed {
                domain: "directory".to_string(),
                reason: "missing payload".to_string(),
            })
        })?;
        let services = match parse_services(payload, &self.bounds) {
            Ok(services) => services,
            Err(e) => return Err(self.fail(e)),
        };

        let Some(service) = services.into_iter().find(|s| s.name == self.target_service) else {
            // A complete refresh is the provider's full service list; the
            // target being absent from it is terminal. An update may simply
            // not mention the service yet.
            if msg.class == MessageClass::Refresh && msg.complete {
                return Err(self.fail(BootstrapError::ServiceNotFound(self.target_service.clone())));
            }
            return Ok(Vec::new());
        };

        if !service.service_up || !service.accepting_requests {
            return Err(self.fail(BootstrapError::ServiceDown(service.name)));
        }
        if !service.supports(CAP_MARKET_PRICE) {
            return Err(self.fail(BootstrapError::DomainNotSupported {
                service: service.name,
                domain: CAP_MARKET_PRICE.to_string(),
            }));
        }

        info!(
            service = %service.name,
            service_id = service.service_id,
            qos = service.qos.len(),
            "target service discovered"
        );
        let service_id = service.service_id;
        self.discovered = Some(service);

        let missing = self.missing_dictionaries(dictionary);
        if missing.is_empty() {
            info!("dictionaries already loaded, bootstrap ready");
            self.phase = BootstrapPhase::Ready;
            return Ok(Vec::new());
        }

        // Downloading requires the service to carry the dictionary domain
        // and advertise the specific dictionaries we need.
        let service = self.discovered.clone().ok_or_else(|| BootstrapError::Malformed {
            domain: "directory".to_string(),
            reason: "service vanished mid-discovery".to_string(),
        })?;
        if !service.supports(CAP_DICTIONARY) {
            return Err(self.fail(BootstrapError::DomainNotSupported {
                service: service.name,
                domain: CAP_DICTIONARY.to_string(),
            }));
        }
        for kind in &missing {
            if !service.provides_dictionary(kind.download_name()) {
                let name = kind.download_name().to_string();
                return Err(self.fail(BootstrapError::DictionaryUnavailable(name)));
            }
        }

        info!(missing = missing.len(), "requesting dictionary downloads");
        self.phase = BootstrapPhase::AwaitDictionary;
        Ok(missing
            .into_iter()
            .map(|kind| Self::dictionary_request(kind, service_id))
            .collect())
    }

    fn missing_dictionaries(&self, dictionary: &dyn DictionaryStore) -> Vec<DictionaryKind> {
        [DictionaryKind::FieldDefinitions, DictionaryKind::EnumTables]
            .into_iter()
            .filter(|kind| !dictionary.is_loaded(*kind))
            .collect()
    }

    fn on_dictionary(
        &mut self,
        msg: &TypedMessage,
        dictionary: &mut dyn DictionaryStore,
    ) -> Result<Vec<TypedMessage>, BootstrapError> {
        let kind = match msg.stream_id {
            FIELD_DICTIONARY_STREAM_ID => DictionaryKind::FieldDefinitions,
            ENUM_TYPE_DICTIONARY_STREAM_ID => DictionaryKind::EnumTables,
            other => {
                warn!(stream_id = other, "dictionary message on unknown stream");
                return Ok(Vec::new());
            }
        };

        match msg.class {
            MessageClass::Refresh => {
                let payload = msg.payload.as_ref().ok_or_else(|| {
                    self.fail(BootstrapError::Malformed {
                        domain: "dictionary".to_string(),
                        reason: "refresh without payload".to_string(),
                    })
                })?;
                let loaded = dictionary
                    .apply_part(kind, payload, msg.complete)
                    .map_err(|e| self.fail(BootstrapError::Dictionary(e)))?;
                if loaded {
                    info!(kind = ?kind, "dictionary download complete");
                }
                if dictionary.is_loaded(DictionaryKind::FieldDefinitions)
                    && dictionary.is_loaded(DictionaryKind::EnumTables)
                {
                    info!("all dictionaries loaded, bootstrap ready");
                    self.phase = BootstrapPhase::Ready;
                }
                Ok(Vec::new())
            }
            MessageClass::Status => {
                if let Some(state) = &msg.state {
                    if state.stream_state.is_final() {
                        let name = kind.download_name().to_string();
                        return Err(self.fail(BootstrapError::DictionaryUnavailable(name)));
                    }
                }
                Ok(Vec::new())
            }
            other => {
                warn!(class = ?other, "unexpected dictionary message class");
                Ok(Vec::new())
            }
        }
    }

    /// Directory traffic after discovery. Losing the bound service while
    /// streams may be open is fatal, not a silent continuation.
    fn on_directory_update(&mut self, msg: &TypedMessage) -> Result<(), BootstrapError> {
        if !matches!(msg.class, MessageClass::Refresh | MessageClass::Update) {
            return Ok(());
        }
        let Some(payload) = msg.payload.as_ref() else {
            return Ok(());
        };
        let Some(bound) = self.discovered.as_ref() else {
            return Ok(());
        };
        let services = parse_services(payload, &self.bounds)?;
        if let Some(service) = services.iter().find(|s| s.service_id == bound.service_id) {
            if !service.service_up || !service.accepting_requests {
                let name = service.name.clone();
                return Err(self.fail(BootstrapError::ServiceWithdrawn(name)));
            }
        }
        Ok(())
    }
}
