//! Consumer event loop.
//!
//! Single-task cooperative driver: waits for readiness with a bounded
//! timeout so liveness deadlines are checked even on an idle connection,
//! drains inbound frames until would-block, routes decoded messages by
//! domain, flushes queued output on write readiness, and observes the run
//! deadline and shutdown signal at iteration granularity. Fatal errors
//! tear the session down once, without masking the original error with
//! cleanup failures.

use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::bootstrap::{Bootstrap, BootstrapPhase};
use crate::codec::{JsonCodec, MessageCodec};
use crate::config::ConsumerConfig;
use crate::dictionary::{
    DataDictionary, DictionaryKind, DictionaryStore, ENUM_TYPE_DICTIONARY_FILE,
    FIELD_DICTIONARY_FILE,
};
use crate::error::ConsumerError;
use crate::liveness::{LivenessCheck, LivenessMonitor};
use crate::message::{DomainType, TypedMessage, LOGIN_STREAM_ID};
use crate::session::TcpSession;
use crate::subscription::SubscriptionManager;
use crate::transport::{
    FlushOutcome, HandshakeStatus, ReadOutcome, SendOutcome, SessionState, Transport,
};

/// Bounded readiness wait per loop iteration.
const LOOP_WAIT: Duration = Duration::from_secs(1);
/// Wait between flush attempts while draining during shutdown.
const SHUTDOWN_FLUSH_WAIT: Duration = Duration::from_millis(100);

pub struct Consumer<T: Transport, C: MessageCodec, D: DictionaryStore> {
    config: ConsumerConfig,
    transport: T,
    codec: C,
    dictionary: D,
    bootstrap: Bootstrap,
    subscriptions: SubscriptionManager,
    liveness: Option<LivenessMonitor>,
    item_opened: bool,
    login_open: bool,
}

impl<T: Transport, C: MessageCodec, D: DictionaryStore> Consumer<T, C, D> {
    pub fn new(config: ConsumerConfig, transport: T, codec: C, dictionary: D) -> Self {
        let bootstrap = Bootstrap::new(
            config.service_name.clone(),
            config.user_name.clone(),
            config.directory_bounds.clone(),
        );
        Self {
            config,
            transport,
            codec,
            dictionary,
            bootstrap,
            subscriptions: SubscriptionManager::new(),
            liveness: None,
            item_opened: false,
            login_open: false,
        }
    }

    pub fn bootstrap_phase(&self) -> BootstrapPhase {
        self.bootstrap.phase()
    }

    /// Run until the configured run time expires, the shutdown signal
    /// fires, or a fatal error occurs. A clean expiry returns `Ok`.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        let result = self.run_inner(shutdown).await;
        if let Err(e) = &result {
            error!(error = %e, "fatal error, tearing down session");
            // Best-effort stream closes; failures here never mask the
            // original error.
            self.teardown_streams().await;
        }
        self.transport.close();
        result
    }

    async fn run_inner(&mut self, shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.run_time_secs);

        if !self.await_active(&shutdown, deadline).await? {
            return Ok(());
        }

        let requests = self.bootstrap.on_session_active()?;
        self.login_open = true;
        self.send_messages(requests)?;

        loop {
            if *shutdown.borrow() || Instant::now() >= deadline {
                return self.graceful_shutdown().await;
            }

            let want_write = self.transport.has_pending_output();
            let readiness = self
                .transport
                .ready(want_write, LOOP_WAIT)
                .await
                .map_err(ConsumerError::Session)?;

            if readiness.readable {
                self.drain_inbound()?;
            }
            if readiness.writable && self.transport.has_pending_output() {
                match self.transport.flush() {
                    FlushOutcome::Drained => trace!("outbound queue drained"),
                    FlushOutcome::Pending => {}
                    FlushOutcome::Fatal(e) => return Err(ConsumerError::Session(e)),
                }
            }

            self.liveness_tick()?;
        }
    }

    /// Drive the handshake to Active. Returns false when the run ended
    /// before the session came up (shutdown or deadline), which is not an
    /// error.
    async fn await_active(
        &mut self,
        shutdown: &watch::Receiver<bool>,
        deadline: Instant,
    ) -> Result<bool, ConsumerError> {
        loop {
            if *shutdown.borrow() || Instant::now() >= deadline {
                info!("stopping before the session became active");
                return Ok(false);
            }
            match self.transport.advance_handshake().await {
                HandshakeStatus::InProgress => {}
                HandshakeStatus::DescriptorChanged { old, new } => {
                    // Registration swap: with the readiness wait bound to
                    // the owned socket, observing the event is the swap.
                    info!(old, new, "handshake moved to a new descriptor");
                }
                HandshakeStatus::Active(negotiated) => {
                    info!(
                        major = negotiated.major,
                        minor = negotiated.minor,
                        ping_interval_secs = negotiated.ping_interval.as_secs(),
                        "session active"
                    );
                    self.liveness =
                        Some(LivenessMonitor::new(negotiated.ping_interval, Instant::now()));
                    return Ok(true);
                }
                HandshakeStatus::Failed(e) => return Err(ConsumerError::ConnectFailed(e)),
            }
        }
    }

    fn drain_inbound(&mut self) -> Result<(), ConsumerError> {
        loop {
            match self.transport.receive() {
                ReadOutcome::Frame(frame) => {
                    self.observe_traffic();
                    let msg = self.codec.decode(&frame)?;
                    self.route(msg)?;
                }
                ReadOutcome::Ping => {
                    self.observe_traffic();
                    trace!("ping received");
                }
                ReadOutcome::WouldBlock => return Ok(()),
                ReadOutcome::Fatal(e) => return Err(ConsumerError::Session(e)),
            }
        }
    }

    fn route(&mut self, msg: TypedMessage) -> Result<(), ConsumerError> {
        match msg.domain {
            DomainType::Login | DomainType::Directory | DomainType::Dictionary => {
                let follow_ups = self.bootstrap.on_message(&msg, &mut self.dictionary)?;
                self.send_messages(follow_ups)?;
                if self.bootstrap.phase() == BootstrapPhase::Ready && !self.item_opened {
                    self.open_item()?;
                }
                Ok(())
            }
            DomainType::MarketPrice => {
                let decoded = self.subscriptions.on_message(&msg, &self.dictionary);
                for field in decoded {
                    info!(
                        stream_id = msg.stream_id,
                        field = %field.name,
                        value = %field.value,
                        "item field"
                    );
                }
                Ok(())
            }
        }
    }

    fn open_item(&mut self) -> Result<(), ConsumerError> {
        let Some(service) = self.bootstrap.discovered_service() else {
            return Ok(());
        };
        let service_id = service.service_id;
        let (stream_id, request) =
            self.subscriptions
                .open(service_id, &self.config.item_name, true);
        self.item_opened = true;
        debug!(stream_id, "item request issued");
        self.send_messages(vec![request])
    }

    fn send_messages(&mut self, msgs: Vec<TypedMessage>) -> Result<(), ConsumerError> {
        for msg in &msgs {
            let bytes = self.codec.encode(msg)?;
            match self.transport.send(&bytes) {
                SendOutcome::Sent => {}
                SendOutcome::PartiallySent => debug!("request partially sent, flush pending"),
                SendOutcome::WouldBlock => {
                    // One bounded retry after pushing queued bytes out.
                    if let FlushOutcome::Fatal(e) = self.transport.flush() {
                        return Err(ConsumerError::Session(e));
                    }
                    match self.transport.send(&bytes) {
                        SendOutcome::Sent | SendOutcome::PartiallySent => {}
                        SendOutcome::WouldBlock => return Err(ConsumerError::Backpressure),
                        SendOutcome::Fatal(e) => return Err(ConsumerError::Session(e)),
                    }
                }
                SendOutcome::Fatal(e) => return Err(ConsumerError::Session(e)),
            }
            if let Some(liveness) = self.liveness.as_mut() {
                liveness.mark_sent(Instant::now());
            }
        }
        Ok(())
    }

    fn observe_traffic(&mut self) {
        if let Some(liveness) = self.liveness.as_mut() {
            liveness.observe_traffic(Instant::now());
        }
    }

    fn liveness_tick(&mut self) -> Result<(), ConsumerError> {
        let Some(liveness) = self.liveness.as_mut() else {
            return Ok(());
        };
        match liveness.tick(Instant::now()) {
            LivenessCheck::Ok => Ok(()),
            LivenessCheck::SendHeartbeat => {
                match self.transport.send_ping() {
                    SendOutcome::Sent | SendOutcome::PartiallySent => {
                        if let Some(liveness) = self.liveness.as_mut() {
                            liveness.mark_sent(Instant::now());
                        }
                    }
                    SendOutcome::WouldBlock => {
                        warn!("heartbeat delayed by outbound backpressure");
                    }
                    SendOutcome::Fatal(e) => return Err(ConsumerError::Session(e)),
                }
                Ok(())
            }
            LivenessCheck::Violated => {
                error!("no traffic from peer within the negotiated ping interval");
                Err(ConsumerError::LivenessViolation)
            }
        }
    }

    /// Orderly end of run: close open streams, drain output with a bounded
    /// number of flush attempts, close the session.
    async fn graceful_shutdown(&mut self) -> Result<(), ConsumerError> {
        info!(
            open_streams = self.subscriptions.open_count(),
            "run ending, closing open streams"
        );
        self.teardown_streams().await;
        self.transport.close();
        info!("session closed");
        Ok(())
    }

    /// Best-effort close of open item streams and the login stream,
    /// followed by a bounded flush drain. Runs on both the orderly and the
    /// fatal path; send failures are logged and cut the sequence short.
    async fn teardown_streams(&mut self) {
        if self.transport.state() != SessionState::Active {
            return;
        }

        let mut closes = self.subscriptions.close_all();
        if self.login_open {
            self.login_open = false;
            closes.push(TypedMessage::close(DomainType::Login, LOGIN_STREAM_ID));
        }
        for close_msg in closes {
            match self.codec.encode(&close_msg) {
                Ok(bytes) => {
                    if let SendOutcome::Fatal(e) = self.transport.send(&bytes) {
                        // Best effort: local teardown already happened.
                        warn!(error = %e, "close send failed during teardown");
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "could not encode close message"),
            }
        }

        for attempt in 0..self.config.shutdown_flush_attempts {
            if !self.transport.has_pending_output() {
                break;
            }
            match self.transport.flush() {
                FlushOutcome::Drained => break,
                FlushOutcome::Pending => {
                    let _ = self.transport.ready(true, SHUTDOWN_FLUSH_WAIT).await;
                }
                FlushOutcome::Fatal(e) => {
                    warn!(error = %e, attempt, "flush failed during teardown");
                    break;
                }
            }
        }
    }
}

/// Wire a consumer from configuration and run it: TCP transport, JSON
/// codec, in-memory dictionaries pre-loaded from local files when present.
pub async fn run_consumer(
    config: ConsumerConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ConsumerError> {
    let transport = TcpSession::connect(&config).map_err(ConsumerError::ConnectFailed)?;

    let mut dictionary = DataDictionary::new();
    if let Some(dir) = config.dictionary_dir.clone() {
        preload(
            &mut dictionary,
            DictionaryKind::FieldDefinitions,
            &dir.join(FIELD_DICTIONARY_FILE),
        );
        preload(
            &mut dictionary,
            DictionaryKind::EnumTables,
            &dir.join(ENUM_TYPE_DICTIONARY_FILE),
        );
    }

    let mut consumer = Consumer::new(config, transport, JsonCodec, dictionary);
    consumer.run(shutdown).await
}

fn preload(dictionary: &mut DataDictionary, kind: DictionaryKind, path: &std::path::Path) {
    match dictionary.load_from_file(kind, path) {
        Ok(()) => info!(path = %path.display(), "pre-loaded dictionary from file"),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "local dictionary not loaded, will download")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BootstrapError, SessionError};
    use crate::message::{
        DataState, MessageClass, MsgState, StreamState, LOGIN_STREAM_ID, SRCDIR_STREAM_ID,
    };
    use crate::transport::{Negotiated, Readiness, SessionState};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct MockTransport {
        handshake: VecDeque<HandshakeStatus>,
        inbound: VecDeque<ReadOutcome>,
        sent: Arc<Mutex<Vec<TypedMessage>>>,
        negotiated: Option<Negotiated>,
        state: SessionState,
    }

    impl MockTransport {
        fn new(ping_interval: Duration) -> (Self, Arc<Mutex<Vec<TypedMessage>>>) {
            let negotiated = Negotiated {
                major: 14,
                minor: 1,
                ping_interval,
                max_fragment_size: 6144,
            };
            let sent = Arc::new(Mutex::new(Vec::new()));
            let mut handshake = VecDeque::new();
            handshake.push_back(HandshakeStatus::InProgress);
            handshake.push_back(HandshakeStatus::Active(negotiated));
            (
                Self {
                    handshake,
                    inbound: VecDeque::new(),
                    sent: Arc::clone(&sent),
                    negotiated: Some(negotiated),
                    state: SessionState::Connecting,
                },
                sent,
            )
        }

        fn queue_message(&mut self, msg: &TypedMessage) {
            let bytes = JsonCodec.encode(msg).unwrap();
            self.inbound.push_back(ReadOutcome::Frame(bytes));
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn advance_handshake(&mut self) -> HandshakeStatus {
            match self.handshake.pop_front() {
                Some(status) => {
                    if matches!(status, HandshakeStatus::Active(_)) {
                        self.state = SessionState::Active;
                    }
                    status
                }
                None => HandshakeStatus::Failed(SessionError::NotActive),
            }
        }

        async fn ready(
            &mut self,
            _want_write: bool,
            max_wait: Duration,
        ) -> Result<Readiness, SessionError> {
            if !self.inbound.is_empty() {
                return Ok(Readiness {
                    readable: true,
                    writable: true,
                    timed_out: false,
                });
            }
            tokio::time::sleep(max_wait.min(Duration::from_millis(10))).await;
            Ok(Readiness::timeout())
        }

        fn send(&mut self, frame: &[u8]) -> SendOutcome {
            let msg = JsonCodec.decode(frame).unwrap();
            self.sent.lock().unwrap().push(msg);
            SendOutcome::Sent
        }

        fn send_ping(&mut self) -> SendOutcome {
            SendOutcome::Sent
        }

        fn flush(&mut self) -> FlushOutcome {
            FlushOutcome::Drained
        }

        fn receive(&mut self) -> ReadOutcome {
            self.inbound.pop_front().unwrap_or(ReadOutcome::WouldBlock)
        }

        fn has_pending_output(&self) -> bool {
            false
        }

        fn state(&self) -> SessionState {
            self.state
        }

        fn negotiated(&self) -> Option<&Negotiated> {
            self.negotiated.as_ref()
        }

        fn close(&mut self) {
            self.state = SessionState::Closed;
        }
    }

    fn login_ok() -> TypedMessage {
        TypedMessage {
            class: MessageClass::Refresh,
            domain: DomainType::Login,
            stream_id: LOGIN_STREAM_ID,
            state: Some(MsgState::open_ok()),
            solicited: true,
            complete: true,
            payload: None,
        }
    }

    fn directory_with(services: serde_json::Value) -> TypedMessage {
        TypedMessage {
            class: MessageClass::Refresh,
            domain: DomainType::Directory,
            stream_id: SRCDIR_STREAM_ID,
            state: Some(MsgState::open_ok()),
            solicited: true,
            complete: true,
            payload: Some(serde_json::json!({ "services": services })),
        }
    }

    fn direct_feed() -> serde_json::Value {
        serde_json::json!({
            "service_id": 7,
            "name": "DIRECT_FEED",
            "capabilities": ["dictionary", "market_price"],
            "dictionaries_provided": ["RWFFld", "RWFEnum"],
            "service_up": true,
            "accepting_requests": true
        })
    }

    fn loaded_dictionary() -> DataDictionary {
        let mut dict = DataDictionary::new();
        for (kind, tag) in [
            (DictionaryKind::FieldDefinitions, "field_definitions"),
            (DictionaryKind::EnumTables, "enum_tables"),
        ] {
            dict.apply_part(kind, &serde_json::json!({"type": tag, "entries": []}), true)
                .unwrap();
        }
        dict
    }

    fn test_config(run_time_secs: u64) -> ConsumerConfig {
        ConsumerConfig {
            run_time_secs,
            ..Default::default()
        }
    }

    fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn test_missing_service_fails_without_item_request() {
        // Scenario: target service absent from the directory refresh.
        let (mut transport, sent) = MockTransport::new(Duration::from_secs(60));
        transport.queue_message(&login_ok());
        transport.queue_message(&directory_with(serde_json::json!([{
            "service_id": 1,
            "name": "OTHER_FEED",
            "capabilities": ["market_price"],
            "service_up": true,
            "accepting_requests": true
        }])));

        let mut consumer =
            Consumer::new(test_config(10), transport, JsonCodec, DataDictionary::new());
        let (_tx, rx) = shutdown_channel();
        let err = consumer.run(rx).await.unwrap_err();

        assert!(matches!(
            err,
            ConsumerError::Bootstrap(BootstrapError::ServiceNotFound(_))
        ));
        assert_eq!(consumer.bootstrap_phase(), BootstrapPhase::Failed);
        let sent = sent.lock().unwrap();
        assert!(!sent.iter().any(|m| m.domain == DomainType::MarketPrice));
    }

    #[tokio::test]
    async fn test_login_denial_stops_before_directory_request() {
        // Scenario: login refresh arrives with stream-state Closed.
        let (mut transport, sent) = MockTransport::new(Duration::from_secs(60));
        let mut denial = login_ok();
        denial.state = Some(MsgState {
            stream_state: StreamState::Closed,
            data_state: DataState::Suspect,
            text: Some("not entitled".to_string()),
        });
        transport.queue_message(&denial);

        let mut consumer =
            Consumer::new(test_config(10), transport, JsonCodec, DataDictionary::new());
        let (_tx, rx) = shutdown_channel();
        let err = consumer.run(rx).await.unwrap_err();

        assert!(matches!(
            err,
            ConsumerError::Bootstrap(BootstrapError::LoginDenied(_))
        ));
        let sent = sent.lock().unwrap();
        assert!(!sent.iter().any(|m| m.domain == DomainType::Directory));
    }

    #[tokio::test]
    async fn test_run_expiry_closes_open_streams_cleanly() {
        // Scenario: dictionaries pre-loaded, item stream opens, run-time
        // expiry produces a close and a clean exit.
        let (mut transport, sent) = MockTransport::new(Duration::from_secs(60));
        transport.queue_message(&login_ok());
        transport.queue_message(&directory_with(serde_json::json!([direct_feed()])));

        let mut consumer =
            Consumer::new(test_config(1), transport, JsonCodec, loaded_dictionary());
        let (_tx, rx) = shutdown_channel();
        consumer.run(rx).await.unwrap();

        assert_eq!(consumer.bootstrap_phase(), BootstrapPhase::Ready);
        let sent = sent.lock().unwrap();
        let item_request = sent
            .iter()
            .find(|m| m.domain == DomainType::MarketPrice && m.class == MessageClass::Request)
            .expect("item request sent after Ready");
        assert_eq!(
            item_request.payload.as_ref().unwrap()["item_name"],
            serde_json::json!("TRI")
        );
        assert!(sent
            .iter()
            .any(|m| m.domain == DomainType::MarketPrice && m.class == MessageClass::Close));
        assert!(sent
            .iter()
            .any(|m| m.domain == DomainType::Login && m.class == MessageClass::Close));
    }

    #[tokio::test]
    async fn test_fatal_error_still_closes_login_and_item_streams() {
        // Service withdrawn after Ready: the run fails, but the open item
        // stream and the login stream still get best-effort closes before
        // the session goes down.
        let (mut transport, sent) = MockTransport::new(Duration::from_secs(60));
        transport.queue_message(&login_ok());
        transport.queue_message(&directory_with(serde_json::json!([direct_feed()])));
        let mut withdrawn = direct_feed();
        withdrawn["service_up"] = serde_json::json!(false);
        transport.queue_message(&TypedMessage {
            class: MessageClass::Update,
            domain: DomainType::Directory,
            stream_id: SRCDIR_STREAM_ID,
            state: None,
            solicited: false,
            complete: false,
            payload: Some(serde_json::json!({ "services": [withdrawn] })),
        });

        let mut consumer =
            Consumer::new(test_config(10), transport, JsonCodec, loaded_dictionary());
        let (_tx, rx) = shutdown_channel();
        let err = consumer.run(rx).await.unwrap_err();

        assert!(matches!(
            err,
            ConsumerError::Bootstrap(BootstrapError::ServiceWithdrawn(_))
        ));
        let sent = sent.lock().unwrap();
        assert!(sent
            .iter()
            .any(|m| m.domain == DomainType::MarketPrice && m.class == MessageClass::Close));
        assert!(sent
            .iter()
            .any(|m| m.domain == DomainType::Login && m.class == MessageClass::Close));
    }

    #[tokio::test]
    async fn test_preloaded_dictionaries_skip_download_requests() {
        let (mut transport, sent) = MockTransport::new(Duration::from_secs(60));
        transport.queue_message(&login_ok());
        transport.queue_message(&directory_with(serde_json::json!([direct_feed()])));

        let mut consumer =
            Consumer::new(test_config(1), transport, JsonCodec, loaded_dictionary());
        let (_tx, rx) = shutdown_channel();
        consumer.run(rx).await.unwrap();

        let sent = sent.lock().unwrap();
        assert!(!sent.iter().any(|m| m.domain == DomainType::Dictionary));
    }

    #[tokio::test]
    async fn test_silent_peer_trips_liveness_violation() {
        let (transport, _sent) = MockTransport::new(Duration::from_millis(200));

        let mut consumer =
            Consumer::new(test_config(30), transport, JsonCodec, DataDictionary::new());
        let (_tx, rx) = shutdown_channel();
        let err = consumer.run(rx).await.unwrap_err();

        assert!(matches!(err, ConsumerError::LivenessViolation));
    }

    #[tokio::test]
    async fn test_shutdown_signal_ends_run_cleanly() {
        let (mut transport, _sent) = MockTransport::new(Duration::from_secs(60));
        transport.queue_message(&login_ok());

        let mut consumer =
            Consumer::new(test_config(30), transport, JsonCodec, DataDictionary::new());
        let (tx, rx) = shutdown_channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(true).ok();
        });

        consumer.run(rx).await.unwrap();
    }
}
