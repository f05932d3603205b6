//! Per-transport connection state machine.
//!
//! A [`ConnectionSupervisor`] owns at most one transport connection and
//! drives it through connect, open, reconnect with backoff, and close. It has
//! no task of its own: the manager's dispatch loop feeds it commands,
//! transport signals and the current time, and collects the
//! [`SupervisorOutput`]s it produces. Timers are deadline slots, so cancelling
//! a timer is just clearing its slot.

use std::sync::Arc;

use notiflow_shared::{
    AuthOutcome, ConnectionError, InboundEvent, Notification, OutboundMessage, TransportKind,
    UpdateKind, CLOSE_ABNORMAL, CLOSE_NORMAL,
};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use url::Url;

use crate::auth::AuthLookup;
use crate::config::ConnectionConfig;
use crate::dispatcher::EventDispatcher;
use crate::transport::{
    EventSink, OpenRequest, TransportConnection, TransportConnector, TransportEvent,
    TransportSignal,
};

/// Lifecycle of one supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
    Destroyed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }
}

/// What the supervisor asks the manager to do.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorOutput {
    Notification(Notification),
    Update { id: String, kind: UpdateKind },
    /// Connected flag changed.
    Status(bool),
    /// The transport reached `Open`; ends any failure episode.
    Opened,
    /// The supervisor gave up; the manager may fall back.
    FailureEpisode(ConnectionError),
}

/// State kept from `connect()` until `disconnect()`/`destroy()`.
#[derive(Debug)]
pub struct TransportSession {
    pub user_id: String,
    pub resume_token: Option<String>,
    pub attempt_count: u32,
    token: Option<String>,
    /// Generation of the live connection; `None` between attempts.
    generation: Option<u64>,
}

impl TransportSession {
    fn new(user_id: String) -> Self {
        Self {
            user_id,
            resume_token: None,
            attempt_count: 0,
            token: None,
            generation: None,
        }
    }
}

#[derive(Debug, Default)]
struct Timers {
    connect_timeout: Option<Instant>,
    heartbeat: Option<Instant>,
    reconnect: Option<Instant>,
    ping: Option<Instant>,
}

impl Timers {
    fn cancel_all(&mut self) {
        *self = Timers::default();
    }

    fn cancel_liveness(&mut self) {
        self.connect_timeout = None;
        self.heartbeat = None;
        self.ping = None;
    }

    fn next(&self) -> Option<Instant> {
        [
            self.connect_timeout,
            self.heartbeat,
            self.reconnect,
            self.ping,
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

fn due(slot: &mut Option<Instant>, now: Instant) -> bool {
    match *slot {
        Some(deadline) if deadline <= now => {
            *slot = None;
            true
        }
        _ => false,
    }
}

/// Build the endpoint URL for one connection attempt.
///
/// Streaming: `{base}/notifications/stream?userId=..&token=..&lastEventId=..`.
/// Socket: `{base}/notifications/ws?userId=..&token=..`, with an `http(s)`
/// base rewritten to `ws(s)`.
pub fn endpoint(
    kind: TransportKind,
    base_url: &str,
    user_id: &str,
    token: Option<&str>,
    resume_token: Option<&str>,
) -> Result<Url, ConnectionError> {
    let invalid = |message: String| ConnectionError::Construction { kind, message };

    let mut url =
        Url::parse(base_url).map_err(|e| invalid(format!("invalid base URL `{base_url}`: {e}")))?;
    let path = match kind {
        TransportKind::Streaming => "notifications/stream",
        TransportKind::Socket => "notifications/ws",
    };
    let joined = format!("{}/{}", url.path().trim_end_matches('/'), path);
    url.set_path(&joined);

    if kind == TransportKind::Socket {
        let scheme = match url.scheme() {
            "http" => Some("ws"),
            "https" => Some("wss"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            url.set_scheme(scheme)
                .map_err(|_| invalid(format!("cannot use `{scheme}` with `{base_url}`")))?;
        }
    }

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("userId", user_id);
        if let Some(token) = token {
            query.append_pair("token", token);
        }
        if kind == TransportKind::Streaming {
            if let Some(resume) = resume_token {
                query.append_pair("lastEventId", resume);
            }
        }
    }
    Ok(url)
}

pub struct ConnectionSupervisor {
    kind: TransportKind,
    config: ConnectionConfig,
    connector: Box<dyn TransportConnector>,
    auth: Arc<dyn AuthLookup>,
    dispatcher: Arc<EventDispatcher>,
    signals: UnboundedSender<TransportSignal>,
    state: ConnectionState,
    session: Option<TransportSession>,
    connection: Option<Box<dyn TransportConnection>>,
    timers: Timers,
    next_generation: u64,
    reported_connected: bool,
    ping_sent_at: Option<Instant>,
}

impl ConnectionSupervisor {
    pub fn new(
        config: ConnectionConfig,
        connector: Box<dyn TransportConnector>,
        auth: Arc<dyn AuthLookup>,
        dispatcher: Arc<EventDispatcher>,
        signals: UnboundedSender<TransportSignal>,
    ) -> Self {
        Self {
            kind: connector.kind(),
            config,
            connector,
            auth,
            dispatcher,
            signals,
            state: ConnectionState::Idle,
            session: None,
            connection: None,
            timers: Timers::default(),
            next_generation: 0,
            reported_connected: false,
            ping_sent_at: None,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn is_supported(&self) -> bool {
        self.connector.is_supported()
    }

    pub fn session(&self) -> Option<&TransportSession> {
        self.session.as_ref()
    }

    /// Earliest pending timer, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next()
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            crate::log_debug!("{} supervisor: {:?} -> {:?}", self.kind, self.state, next);
            self.state = next;
        }
    }

    fn report_status(&mut self, connected: bool, out: &mut Vec<SupervisorOutput>) {
        if self.reported_connected != connected {
            self.reported_connected = connected;
            out.push(SupervisorOutput::Status(connected));
        }
    }

    /// Close the live connection, if any. Timers must already be cancelled.
    fn release_connection(&mut self, code: u16, reason: &str) {
        if let Some(session) = self.session.as_mut() {
            session.generation = None;
        }
        if let Some(mut connection) = self.connection.take() {
            connection.close(code, reason);
        }
        self.ping_sent_at = None;
    }

    /// Start a session for `user_id`. A no-op while already open or
    /// connecting for the same user.
    pub fn connect(&mut self, user_id: &str, now: Instant, out: &mut Vec<SupervisorOutput>) {
        if self.state == ConnectionState::Destroyed {
            crate::log_debug!("{} supervisor destroyed; ignoring connect", self.kind);
            return;
        }
        let same_user = self
            .session
            .as_ref()
            .is_some_and(|s| s.user_id == user_id);
        if same_user && (self.state.is_connected() || self.state == ConnectionState::Connecting) {
            crate::log_debug!("{} already active for user {}", self.kind, user_id);
            return;
        }

        let resume_token = match self.session.take() {
            Some(previous) if previous.user_id == user_id => previous.resume_token,
            _ => None,
        };
        self.timers.cancel_all();
        self.release_connection(CLOSE_NORMAL, "reconnecting");
        self.report_status(false, out);

        let mut session = TransportSession::new(user_id.to_string());
        session.resume_token = resume_token;
        self.session = Some(session);
        self.attempt(now, out);
    }

    /// Open one connection for the current session.
    fn attempt(&mut self, now: Instant, out: &mut Vec<SupervisorOutput>) {
        let token = self.auth.credentials().map(|c| c.token);
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let url = match endpoint(
            self.kind,
            &self.config.base_url,
            &session.user_id,
            token.as_deref(),
            session.resume_token.as_deref(),
        ) {
            Ok(url) => url,
            Err(e) => return self.construction_failed(e, out),
        };

        self.next_generation += 1;
        let generation = self.next_generation;
        session.token = token;
        session.generation = Some(generation);

        let request = OpenRequest {
            url,
            protocols: match self.kind {
                TransportKind::Socket => self.config.transport_protocols.clone(),
                TransportKind::Streaming => Vec::new(),
            },
            resume_token: session.resume_token.clone(),
        };
        let attempt = session.attempt_count;
        crate::log_debug!("{} connecting (attempt {}): {}", self.kind, attempt, request.url);

        let sink = EventSink::new(self.kind, generation, self.signals.clone());
        match self.connector.open(request, sink) {
            Ok(connection) => {
                self.connection = Some(connection);
                self.timers.connect_timeout = Some(now + self.config.connection_timeout);
                self.set_state(ConnectionState::Connecting);
            }
            Err(e) => self.construction_failed(e, out),
        }
    }

    fn construction_failed(&mut self, error: ConnectionError, out: &mut Vec<SupervisorOutput>) {
        crate::log_error!("{} transport unavailable: {}", self.kind, error);
        self.timers.cancel_all();
        self.release_connection(CLOSE_ABNORMAL, "construction failed");
        self.set_state(ConnectionState::Closed);
        self.report_status(false, out);
        out.push(SupervisorOutput::FailureEpisode(error));
    }

    /// Runtime failure: schedule the next attempt or give up.
    fn fail(&mut self, error: ConnectionError, out: &mut Vec<SupervisorOutput>, now: Instant) {
        self.timers.cancel_liveness();
        self.release_connection(CLOSE_NORMAL, "reconnecting");
        self.report_status(false, out);

        let Some(session) = self.session.as_ref() else {
            self.set_state(ConnectionState::Closed);
            return;
        };
        let attempt = session.attempt_count;
        let policy = &self.config.reconnection;

        if policy.allows(attempt) {
            let delay = policy.delay_for_attempt(attempt);
            crate::log_info!(
                kind = %self.kind,
                attempt = attempt + 1,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "scheduling reconnect"
            );
            self.timers.reconnect = Some(now + delay);
            self.set_state(ConnectionState::Reconnecting);
        } else {
            crate::log_error!(
                "{} giving up after {} reconnection attempts: {}",
                self.kind,
                attempt,
                error
            );
            self.timers.cancel_all();
            self.set_state(ConnectionState::Closed);
            out.push(SupervisorOutput::FailureEpisode(ConnectionError::Exhausted {
                kind: self.kind,
                attempts: attempt,
                last_error: error.to_string(),
            }));
        }
    }

    /// Feed one transport signal. Signals from a replaced connection are ignored.
    pub fn handle_transport(
        &mut self,
        signal: TransportSignal,
        now: Instant,
        out: &mut Vec<SupervisorOutput>,
    ) {
        let live = self
            .session
            .as_ref()
            .and_then(|s| s.generation)
            .is_some_and(|g| g == signal.generation);
        if signal.kind != self.kind || !live {
            crate::log_debug!(
                "{} dropping stale signal from generation {}",
                self.kind,
                signal.generation
            );
            return;
        }

        match signal.event {
            TransportEvent::Open => self.on_open(now, out),
            TransportEvent::Message {
                data,
                event_name,
                event_id,
            } => self.on_message(&data, event_name.as_deref(), event_id.as_deref(), now, out),
            TransportEvent::Error { message } => {
                crate::log_warn!("{} transport error: {}", self.kind, message);
                let error = ConnectionError::Transport {
                    kind: self.kind,
                    message,
                };
                self.fail(error, out, now);
            }
            TransportEvent::Close { code, reason } => {
                if code == CLOSE_NORMAL && self.state.is_connected() {
                    crate::log_info!("{} closed normally by server: {}", self.kind, reason);
                    self.timers.cancel_all();
                    self.release_connection(CLOSE_NORMAL, "");
                    self.set_state(ConnectionState::Closed);
                    self.report_status(false, out);
                    return;
                }
                let message = if reason.is_empty() {
                    format!("closed with code {code}")
                } else {
                    format!("closed with code {code}: {reason}")
                };
                crate::log_warn!("{} transport {}", self.kind, message);
                let error = ConnectionError::Transport {
                    kind: self.kind,
                    message,
                };
                self.fail(error, out, now);
            }
        }
    }

    fn on_open(&mut self, now: Instant, out: &mut Vec<SupervisorOutput>) {
        let heartbeat = self.config.heartbeat_interval;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.attempt_count = 0;
        let token = session.token.clone();

        crate::log_info!("{} connected for user {}", self.kind, session.user_id);
        self.timers.connect_timeout = None;
        self.timers.heartbeat = Some(now + heartbeat * 2);
        self.set_state(ConnectionState::Open);

        if self.kind == TransportKind::Socket {
            self.send(&OutboundMessage::Auth { token });
            self.timers.ping = Some(now + heartbeat);
        }

        out.push(SupervisorOutput::Opened);
        self.report_status(true, out);
    }

    fn on_message(
        &mut self,
        data: &str,
        event_name: Option<&str>,
        event_id: Option<&str>,
        now: Instant,
        out: &mut Vec<SupervisorOutput>,
    ) {
        // Any inbound activity counts as liveness.
        if self.state.is_connected() {
            self.timers.heartbeat = Some(now + self.config.heartbeat_interval * 2);
        }

        let envelope = match self.dispatcher.decode(data, event_name, event_id) {
            Ok(envelope) => envelope,
            Err(e) => {
                crate::log_warn!("{} dropping malformed payload: {}", self.kind, e);
                return;
            }
        };

        if let (Some(token), Some(session)) = (envelope.resume_token, self.session.as_mut()) {
            session.resume_token = Some(token);
        }

        match envelope.event {
            InboundEvent::NewItem(notification) => {
                out.push(SupervisorOutput::Notification(notification));
            }
            InboundEvent::ItemUpdated { id, kind } => {
                out.push(SupervisorOutput::Update { id, kind });
            }
            InboundEvent::Heartbeat => {}
            InboundEvent::Ping => {
                if self.kind == TransportKind::Socket {
                    self.send(&OutboundMessage::Pong);
                }
            }
            InboundEvent::Pong => {
                if let Some(sent) = self.ping_sent_at.take() {
                    let latency = now.saturating_duration_since(sent);
                    crate::log_debug!(
                        kind = %self.kind,
                        latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                        "pong received"
                    );
                }
            }
            InboundEvent::AuthResult(AuthOutcome::Accepted) => {
                crate::log_info!("{} authenticated", self.kind);
            }
            InboundEvent::AuthResult(AuthOutcome::Rejected { message }) => {
                if self.kind != TransportKind::Socket {
                    crate::log_warn!("{} ignoring auth result: {}", self.kind, message);
                    return;
                }
                crate::log_error!("{} authentication rejected: {}", self.kind, message);
                self.timers.cancel_all();
                self.release_connection(CLOSE_NORMAL, "authentication rejected");
                self.set_state(ConnectionState::Closed);
                self.report_status(false, out);
                out.push(SupervisorOutput::FailureEpisode(ConnectionError::AuthRejected {
                    kind: self.kind,
                    message,
                }));
            }
        }
    }

    fn send(&self, message: &OutboundMessage) {
        if let Some(connection) = self.connection.as_ref() {
            if let Err(e) = connection.send(message) {
                crate::log_warn!("{} failed to send {:?}: {}", self.kind, message, e);
            }
        }
    }

    /// Fire every timer whose deadline has passed.
    pub fn on_timers(&mut self, now: Instant, out: &mut Vec<SupervisorOutput>) {
        if due(&mut self.timers.connect_timeout, now) {
            let after = self.config.connection_timeout;
            crate::log_warn!("{} connection timed out after {:?}", self.kind, after);
            self.fail(
                ConnectionError::ConnectionTimeout {
                    kind: self.kind,
                    after,
                },
                out,
                now,
            );
        }

        if due(&mut self.timers.heartbeat, now) {
            let after = self.config.heartbeat_interval * 2;
            crate::log_warn!("{} heartbeat timed out: no activity for {:?}", self.kind, after);
            self.fail(
                ConnectionError::HeartbeatTimeout {
                    kind: self.kind,
                    after,
                },
                out,
                now,
            );
        }

        if due(&mut self.timers.reconnect, now) {
            if let Some(session) = self.session.as_mut() {
                session.attempt_count += 1;
            }
            self.attempt(now, out);
        }

        if due(&mut self.timers.ping, now) {
            self.send(&OutboundMessage::Ping);
            self.ping_sent_at = Some(now);
            self.timers.ping = Some(now + self.config.heartbeat_interval);
        }
    }

    /// Cancel every timer, close the transport and end the session.
    pub fn disconnect(&mut self, out: &mut Vec<SupervisorOutput>) {
        self.timers.cancel_all();
        self.release_connection(CLOSE_NORMAL, "client disconnect");
        self.session = None;
        if self.state != ConnectionState::Destroyed {
            self.set_state(ConnectionState::Closed);
        }
        self.report_status(false, out);
    }

    /// Like [`disconnect`](Self::disconnect), but permanent.
    pub fn destroy(&mut self, out: &mut Vec<SupervisorOutput>) {
        self.disconnect(out);
        self.set_state(ConnectionState::Destroyed);
    }

    /// Close without scheduling a reconnect. The session survives so the
    /// next `network_online` can resume it.
    pub fn network_offline(&mut self, out: &mut Vec<SupervisorOutput>) {
        if self.session.is_none() || self.state == ConnectionState::Destroyed {
            return;
        }
        crate::log_info!("{} network offline; closing without reconnect", self.kind);
        self.timers.cancel_all();
        self.release_connection(CLOSE_NORMAL, "network offline");
        self.set_state(ConnectionState::Closed);
        self.report_status(false, out);
    }

    /// Reset the attempt counter and reconnect unless already open or connecting.
    pub fn network_online(&mut self, now: Instant, out: &mut Vec<SupervisorOutput>) {
        if self.state == ConnectionState::Destroyed {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.attempt_count = 0;
        if self.state.is_connected() || self.state == ConnectionState::Connecting {
            return;
        }
        crate::log_info!("{} network online; reconnecting", self.kind);
        self.timers.cancel_all();
        self.attempt(now, out);
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuth;
    use crate::config::ReconnectionPolicy;
    use crate::testing::ScriptedConnector;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct Harness {
        supervisor: ConnectionSupervisor,
        connector: ScriptedConnector,
        signals: UnboundedReceiver<TransportSignal>,
        out: Vec<SupervisorOutput>,
    }

    impl Harness {
        fn new(kind: TransportKind) -> Self {
            let config = ConnectionConfig::new("http://localhost:8080/api")
                .reconnection(ReconnectionPolicy::default().max_attempts(3))
                .heartbeat_interval(Duration::from_secs(10))
                .connection_timeout(Duration::from_secs(5));
            Self::with_config(kind, config)
        }

        fn with_config(kind: TransportKind, config: ConnectionConfig) -> Self {
            let connector = ScriptedConnector::new(kind);
            let (tx, rx) = unbounded_channel();
            let supervisor = ConnectionSupervisor::new(
                config,
                Box::new(connector.clone()),
                Arc::new(StaticAuth::new("42", "abc")),
                Arc::new(EventDispatcher::default()),
                tx,
            );
            Self {
                supervisor,
                connector,
                signals: rx,
                out: Vec::new(),
            }
        }

        /// Deliver every queued transport signal.
        fn pump(&mut self, now: Instant) {
            while let Ok(signal) = self.signals.try_recv() {
                self.supervisor.handle_transport(signal, now, &mut self.out);
            }
        }

        fn drain(&mut self) -> Vec<SupervisorOutput> {
            std::mem::take(&mut self.out)
        }
    }

    #[test]
    fn endpoint_query_parameters() {
        let url = endpoint(
            TransportKind::Streaming,
            "http://localhost:8080/api/",
            "42",
            Some("abc"),
            Some("99"),
        )
        .expect("valid");
        assert_eq!(url.path(), "/api/notifications/stream");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("userId".to_string(), "42".to_string())));
        assert!(pairs.contains(&("token".to_string(), "abc".to_string())));
        assert!(pairs.contains(&("lastEventId".to_string(), "99".to_string())));
    }

    #[test]
    fn socket_endpoint_rewrites_scheme() {
        let url = endpoint(
            TransportKind::Socket,
            "https://push.example.com",
            "42",
            Some("abc"),
            Some("99"),
        )
        .expect("valid");
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/notifications/ws");
        assert!(!url.query_pairs().any(|(k, _)| k == "lastEventId"));
    }

    #[test]
    fn endpoint_rejects_bad_base() {
        assert!(matches!(
            endpoint(TransportKind::Streaming, "::nope::", "1", None, None),
            Err(ConnectionError::Construction { .. })
        ));
    }

    #[tokio::test]
    async fn open_resets_attempts_and_reports_status() {
        let mut h = Harness::new(TransportKind::Streaming);
        let now = Instant::now();
        h.supervisor.connect("42", now, &mut h.out);
        assert_eq!(h.supervisor.state(), ConnectionState::Connecting);

        h.connector.emit_open();
        h.pump(now);
        assert_eq!(h.supervisor.state(), ConnectionState::Open);
        assert_eq!(
            h.drain(),
            vec![SupervisorOutput::Opened, SupervisorOutput::Status(true)]
        );
        assert_eq!(h.supervisor.next_deadline(), Some(now + Duration::from_secs(20)));
    }

    #[tokio::test]
    async fn socket_authenticates_and_answers_ping() {
        let mut h = Harness::new(TransportKind::Socket);
        let now = Instant::now();
        h.supervisor.connect("42", now, &mut h.out);
        h.connector.emit_open();
        h.pump(now);
        h.connector.emit_message(r#"{"type":"ping"}"#);
        h.pump(now);

        assert_eq!(
            h.connector.sent(),
            vec![
                OutboundMessage::Auth {
                    token: Some("abc".to_string())
                },
                OutboundMessage::Pong
            ]
        );
        let request = h.connector.last_request().expect("opened");
        assert_eq!(request.protocols, Vec::<String>::new());
    }

    #[tokio::test]
    async fn socket_pings_every_heartbeat_interval() {
        let mut h = Harness::new(TransportKind::Socket);
        let now = Instant::now();
        h.supervisor.connect("42", now, &mut h.out);
        h.connector.emit_open();
        h.pump(now);

        let ping_at = now + Duration::from_secs(10);
        h.supervisor.on_timers(ping_at, &mut h.out);
        assert_eq!(h.connector.sent().last(), Some(&OutboundMessage::Ping));

        h.connector.emit_message(r#"{"type":"pong"}"#);
        h.pump(ping_at + Duration::from_millis(30));
        assert!(h.supervisor.is_connected());
    }

    #[tokio::test]
    async fn backoff_then_exhaustion_reports_once() {
        let mut h = Harness::new(TransportKind::Streaming);
        let mut now = Instant::now();
        h.supervisor.connect("42", now, &mut h.out);

        for expected in [1000u64, 1500, 2250] {
            h.connector.emit_error("connection refused");
            h.pump(now);
            assert_eq!(h.supervisor.state(), ConnectionState::Reconnecting);
            let deadline = h.supervisor.next_deadline().expect("reconnect scheduled");
            assert_eq!(deadline - now, Duration::from_millis(expected));
            now = deadline;
            h.supervisor.on_timers(now, &mut h.out);
            assert_eq!(h.supervisor.state(), ConnectionState::Connecting);
        }

        h.connector.emit_error("connection refused");
        h.pump(now);
        assert_eq!(h.supervisor.state(), ConnectionState::Closed);
        assert_eq!(h.supervisor.next_deadline(), None);

        let failures: Vec<_> = h
            .drain()
            .into_iter()
            .filter(|o| matches!(o, SupervisorOutput::FailureEpisode(_)))
            .collect();
        assert_eq!(
            failures,
            vec![SupervisorOutput::FailureEpisode(ConnectionError::Exhausted {
                kind: TransportKind::Streaming,
                attempts: 3,
                last_error: "streaming transport failed: connection refused".to_string(),
            })]
        );
        assert_eq!(h.connector.open_count(), 4);
    }

    #[tokio::test]
    async fn stale_generation_is_ignored() {
        let mut h = Harness::new(TransportKind::Streaming);
        let now = Instant::now();
        h.supervisor.connect("42", now, &mut h.out);
        h.connector.emit_error("boom");
        // Second event from the same, already failed connection.
        h.connector.emit_close(1006, "boom");
        h.pump(now);

        assert_eq!(h.supervisor.state(), ConnectionState::Reconnecting);
        assert_eq!(
            h.supervisor.next_deadline(),
            Some(now + Duration::from_millis(1000))
        );
    }

    #[tokio::test]
    async fn heartbeat_window_resets_on_any_message() {
        let mut h = Harness::new(TransportKind::Streaming);
        let start = Instant::now();
        h.supervisor.connect("42", start, &mut h.out);
        h.connector.emit_open();
        h.pump(start);

        let later = start + Duration::from_secs(15);
        h.connector.emit_message(r#"{"type":"unknown_kind"}"#);
        h.pump(later);

        h.supervisor.on_timers(start + Duration::from_secs(20), &mut h.out);
        assert!(h.supervisor.is_connected());

        h.supervisor.on_timers(later + Duration::from_secs(20), &mut h.out);
        assert_eq!(h.supervisor.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test]
    async fn connection_timeout_enters_reconnecting() {
        let mut h = Harness::new(TransportKind::Streaming);
        let now = Instant::now();
        h.supervisor.connect("42", now, &mut h.out);
        h.supervisor
            .on_timers(now + Duration::from_secs(5), &mut h.out);
        assert_eq!(h.supervisor.state(), ConnectionState::Reconnecting);
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn normal_close_does_not_reconnect() {
        let mut h = Harness::new(TransportKind::Socket);
        let now = Instant::now();
        h.supervisor.connect("42", now, &mut h.out);
        h.connector.emit_open();
        h.connector.emit_close(1000, "bye");
        h.pump(now);
        assert_eq!(h.supervisor.state(), ConnectionState::Closed);
        assert_eq!(h.supervisor.next_deadline(), None);
    }

    #[tokio::test]
    async fn auth_rejection_is_a_failure_episode() {
        let mut h = Harness::new(TransportKind::Socket);
        let now = Instant::now();
        h.supervisor.connect("42", now, &mut h.out);
        h.connector.emit_open();
        h.connector
            .emit_message(r#"{"type":"auth_error","message":"token expired"}"#);
        h.pump(now);

        assert_eq!(h.supervisor.state(), ConnectionState::Closed);
        assert!(h.drain().contains(&SupervisorOutput::FailureEpisode(
            ConnectionError::AuthRejected {
                kind: TransportKind::Socket,
                message: "token expired".to_string(),
            }
        )));
    }

    #[tokio::test]
    async fn resume_token_carries_into_reconnect_url() {
        let mut h = Harness::new(TransportKind::Streaming);
        let now = Instant::now();
        h.supervisor.connect("42", now, &mut h.out);
        h.connector.emit_open();
        h.connector.emit_sse(r#"{"type":"heartbeat"}"#, None, Some("99"));
        h.connector.emit_error("reset");
        h.pump(now);
        h.supervisor
            .on_timers(now + Duration::from_secs(1), &mut h.out);

        let request = h.connector.last_request().expect("reconnected");
        assert_eq!(request.resume_token.as_deref(), Some("99"));
        assert!(request
            .url
            .query_pairs()
            .any(|(k, v)| k == "lastEventId" && v == "99"));
    }

    #[tokio::test]
    async fn offline_then_online_reconnects_from_zero() {
        let mut h = Harness::new(TransportKind::Streaming);
        let now = Instant::now();
        h.supervisor.connect("42", now, &mut h.out);
        h.connector.emit_error("flaky");
        h.pump(now);
        assert_eq!(h.supervisor.session().map(|s| s.attempt_count), Some(0));

        h.supervisor.network_offline(&mut h.out);
        assert_eq!(h.supervisor.state(), ConnectionState::Closed);
        assert_eq!(h.supervisor.next_deadline(), None);

        h.supervisor.network_online(now, &mut h.out);
        assert_eq!(h.supervisor.state(), ConnectionState::Connecting);
        assert_eq!(h.connector.open_count(), 2);
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn disconnect_cancels_everything() {
        let mut h = Harness::new(TransportKind::Socket);
        let now = Instant::now();
        h.supervisor.connect("42", now, &mut h.out);
        h.connector.emit_open();
        h.pump(now);
        h.drain();

        h.supervisor.disconnect(&mut h.out);
        assert_eq!(h.supervisor.state(), ConnectionState::Closed);
        assert_eq!(h.supervisor.next_deadline(), None);
        assert_eq!(h.drain(), vec![SupervisorOutput::Status(false)]);
        assert_eq!(h.connector.closes(), vec![(1000, "client disconnect".to_string())]);

        // Late events from the closed connection change nothing.
        h.connector.emit_message(r#"{"type":"heartbeat"}"#);
        h.pump(now);
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn destroyed_supervisor_ignores_connect() {
        let mut h = Harness::new(TransportKind::Streaming);
        let now = Instant::now();
        h.supervisor.destroy(&mut h.out);
        h.supervisor.connect("42", now, &mut h.out);
        assert_eq!(h.supervisor.state(), ConnectionState::Destroyed);
        assert_eq!(h.connector.open_count(), 0);
    }

    #[tokio::test]
    async fn construction_failure_is_immediate_episode() {
        let mut h = Harness::new(TransportKind::Socket);
        h.connector.fail_constructions(1);
        h.supervisor.connect("42", Instant::now(), &mut h.out);
        assert_eq!(h.supervisor.state(), ConnectionState::Closed);
        assert!(matches!(
            h.drain().as_slice(),
            [SupervisorOutput::FailureEpisode(ConnectionError::Construction { .. })]
        ));
    }
}
