//! The public connection manager.
//!
//! One dispatch task per manager owns both supervisors, so every transport
//! event, timer and caller command is handled on a single cooperative loop.
//! The [`ConnectionManager`] handle only sends commands to that loop and reads
//! the snapshot it publishes.

use std::collections::HashSet;
use std::sync::Arc;

use notiflow_shared::{ConnectionError, Notification, TransportKind, UpdateKind};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use crate::auth::AuthLookup;
use crate::config::{ConfigError, ConnectionPreference, ManagerConfig};
use crate::dispatcher::{EventDispatcher, NotificationValidator, RequiredFields};
use crate::handlers::{Handlers, Subscription};
use crate::network::{NetworkEvent, NetworkSignal, NetworkSubscription};
use crate::supervisor::{ConnectionState, ConnectionSupervisor, SupervisorOutput};
use crate::transport::{default_connectors, TransportConnector, TransportSignal};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no {0} connector configured")]
    MissingConnector(TransportKind),

    #[error("connection manager needs a tokio runtime: {0}")]
    NoRuntime(String),
}

/// Point-in-time view of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerSnapshot {
    /// Kind currently in use, `None` before `connect` and after `disconnect`.
    pub kind: Option<TransportKind>,
    pub state: ConnectionState,
    pub connected: bool,
}

impl Default for ManagerSnapshot {
    fn default() -> Self {
        Self {
            kind: None,
            state: ConnectionState::Idle,
            connected: false,
        }
    }
}

enum Command {
    Connect {
        user_id: String,
        preference: Option<ConnectionPreference>,
        ack: oneshot::Sender<()>,
    },
    Disconnect {
        ack: oneshot::Sender<()>,
    },
    Destroy {
        ack: oneshot::Sender<()>,
    },
}

/// Builder for [`ConnectionManager`].
pub struct ConnectionManagerBuilder {
    config: ManagerConfig,
    auth: Arc<dyn AuthLookup>,
    network: Arc<dyn NetworkSignal>,
    validator: Box<dyn NotificationValidator>,
    connectors: Vec<Box<dyn TransportConnector>>,
}

impl ConnectionManagerBuilder {
    /// Replace the default notification validator.
    #[must_use]
    pub fn validator(mut self, validator: impl NotificationValidator + 'static) -> Self {
        self.validator = Box::new(validator);
        self
    }

    /// Replace the connectors. One per kind; later entries win.
    #[must_use]
    pub fn connectors(mut self, connectors: Vec<Box<dyn TransportConnector>>) -> Self {
        self.connectors = connectors;
        self
    }

    /// Validate the config, subscribe to the network signal and spawn the
    /// dispatch task on the current runtime.
    pub fn build(self) -> Result<ConnectionManager, BuildError> {
        self.config.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|e| BuildError::NoRuntime(e.to_string()))?;

        let mut streaming = None;
        let mut socket = None;
        for connector in self.connectors {
            match connector.kind() {
                TransportKind::Streaming => streaming = Some(connector),
                TransportKind::Socket => socket = Some(connector),
            }
        }
        let streaming = streaming.ok_or(BuildError::MissingConnector(TransportKind::Streaming))?;
        let socket = socket.ok_or(BuildError::MissingConnector(TransportKind::Socket))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (network_tx, network_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ManagerSnapshot::default());

        let dispatcher = Arc::new(EventDispatcher::new(self.validator));
        let handlers = Arc::new(Handlers::default());

        let network_subscription = self.network.subscribe(Arc::new(move |event: NetworkEvent| {
            let _ = network_tx.send(event);
        }));

        let dispatch = DispatchLoop {
            fallback_enabled: self.config.fallback_enabled,
            fallback_grace: self.config.fallback_grace,
            preferred: self.config.preferred,
            streaming: ConnectionSupervisor::new(
                self.config.streaming,
                streaming,
                self.auth.clone(),
                dispatcher.clone(),
                signal_tx.clone(),
            ),
            socket: ConnectionSupervisor::new(
                self.config.socket,
                socket,
                self.auth,
                dispatcher,
                signal_tx,
            ),
            active: None,
            user_id: None,
            fallback_attempted: HashSet::new(),
            fallback: None,
            last_status: false,
            destroyed: false,
            handlers: handlers.clone(),
            snapshot: snapshot_tx,
            network_subscription,
        };
        runtime.spawn(dispatch.run(command_rx, signal_rx, network_rx));

        Ok(ConnectionManager {
            commands: command_tx,
            snapshot: snapshot_rx,
            handlers,
        })
    }
}

/// Handle to a running connection manager.
///
/// Cheap to clone. When the last clone is dropped the manager destroys
/// itself as if [`ConnectionManager::destroy`] had been called.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ManagerSnapshot>,
    handlers: Arc<Handlers>,
}

impl ConnectionManager {
    pub fn builder(
        config: ManagerConfig,
        auth: impl AuthLookup + 'static,
        network: impl NetworkSignal + 'static,
    ) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            config,
            auth: Arc::new(auth),
            network: Arc::new(network),
            validator: Box::new(RequiredFields),
            connectors: default_connectors(),
        }
    }

    /// A manager using the built-in streaming and socket transports.
    pub fn new(
        config: ManagerConfig,
        auth: impl AuthLookup + 'static,
        network: impl NetworkSignal + 'static,
    ) -> Result<Self, BuildError> {
        Self::builder(config, auth, network).build()
    }

    /// A manager using the given connectors, one per transport kind.
    pub fn with_connectors(
        config: ManagerConfig,
        auth: impl AuthLookup + 'static,
        network: impl NetworkSignal + 'static,
        connectors: Vec<Box<dyn TransportConnector>>,
    ) -> Result<Self, BuildError> {
        Self::builder(config, auth, network)
            .connectors(connectors)
            .build()
    }

    async fn request(&self, command: impl FnOnce(oneshot::Sender<()>) -> Command) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(command(ack)).is_err() {
            crate::log_debug!("connection manager already stopped");
            return;
        }
        let _ = done.await;
    }

    /// Connect `user_id` using the configured preference.
    pub async fn connect(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        self.request(|ack| Command::Connect {
            user_id,
            preference: None,
            ack,
        })
        .await;
    }

    /// Connect `user_id` starting with an explicit transport preference.
    pub async fn connect_with(&self, user_id: impl Into<String>, preference: ConnectionPreference) {
        let user_id = user_id.into();
        self.request(|ack| Command::Connect {
            user_id,
            preference: Some(preference),
            ack,
        })
        .await;
    }

    /// Close the connection and cancel every pending timer. Returns once
    /// the teardown has been applied.
    pub async fn disconnect(&self) {
        self.request(|ack| Command::Disconnect { ack }).await;
    }

    /// Permanently shut down. Idempotent; later `connect` calls do nothing.
    pub async fn destroy(&self) {
        self.request(|ack| Command::Destroy { ack }).await;
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot.borrow().connected
    }

    pub fn connection_type(&self) -> Option<TransportKind> {
        self.snapshot.borrow().kind
    }

    pub fn state(&self) -> ManagerSnapshot {
        *self.snapshot.borrow()
    }

    /// Receiver that observes every published snapshot.
    pub fn watch(&self) -> watch::Receiver<ManagerSnapshot> {
        self.snapshot.clone()
    }

    pub fn set_notification_handler(
        &self,
        handler: impl Fn(&Notification) + Send + Sync + 'static,
    ) -> Subscription {
        self.handlers.add_notification(Arc::new(handler))
    }

    pub fn set_update_handler(
        &self,
        handler: impl Fn(&str, UpdateKind) + Send + Sync + 'static,
    ) -> Subscription {
        self.handlers.add_update(Arc::new(handler))
    }

    pub fn set_connection_status_handler(
        &self,
        handler: impl Fn(bool) + Send + Sync + 'static,
    ) -> Subscription {
        self.handlers.add_status(Arc::new(handler))
    }

    pub fn set_error_handler(
        &self,
        handler: impl Fn(&ConnectionError) + Send + Sync + 'static,
    ) -> Subscription {
        self.handlers.add_error(Arc::new(handler))
    }
}

/// Pending switch to the other transport kind.
struct PendingFallback {
    target: TransportKind,
    at: Instant,
}

struct DispatchLoop {
    fallback_enabled: bool,
    fallback_grace: std::time::Duration,
    preferred: ConnectionPreference,
    streaming: ConnectionSupervisor,
    socket: ConnectionSupervisor,
    active: Option<TransportKind>,
    user_id: Option<String>,
    /// Kinds tried in the current failure episode.
    fallback_attempted: HashSet<TransportKind>,
    fallback: Option<PendingFallback>,
    last_status: bool,
    destroyed: bool,
    handlers: Arc<Handlers>,
    snapshot: watch::Sender<ManagerSnapshot>,
    network_subscription: NetworkSubscription,
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl DispatchLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<TransportSignal>,
        mut network: mpsc::UnboundedReceiver<NetworkEvent>,
    ) {
        crate::log_debug!("connection manager started");
        while !self.destroyed {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        crate::log_debug!("all manager handles dropped; destroying");
                        self.destroy();
                    }
                },
                Some(event) = network.recv() => self.handle_network(event),
                Some(signal) = signals.recv() => {
                    let kind = signal.kind;
                    let mut out = Vec::new();
                    self.supervisor(kind).handle_transport(signal, Instant::now(), &mut out);
                    self.route(kind, out);
                }
                _ = sleep_until_deadline(deadline) => self.handle_timers(),
            }
            self.publish();
        }
        crate::log_debug!("connection manager stopped");
    }

    fn supervisor(&mut self, kind: TransportKind) -> &mut ConnectionSupervisor {
        match kind {
            TransportKind::Streaming => &mut self.streaming,
            TransportKind::Socket => &mut self.socket,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.streaming.next_deadline(),
            self.socket.next_deadline(),
            self.fallback.as_ref().map(|f| f.at),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn publish(&self) {
        let snapshot = match self.active {
            _ if self.destroyed => ManagerSnapshot {
                kind: None,
                state: ConnectionState::Destroyed,
                connected: false,
            },
            Some(kind) => {
                let supervisor = match kind {
                    TransportKind::Streaming => &self.streaming,
                    TransportKind::Socket => &self.socket,
                };
                ManagerSnapshot {
                    kind: Some(kind),
                    state: supervisor.state(),
                    connected: supervisor.is_connected(),
                }
            }
            None => ManagerSnapshot {
                kind: None,
                state: if self.user_id.is_some() {
                    ConnectionState::Closed
                } else {
                    ConnectionState::Idle
                },
                connected: false,
            },
        };
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn handle_command(&mut self, command: Command) {
        let ack = match command {
            Command::Connect {
                user_id,
                preference,
                ack,
            } => {
                self.connect(user_id, preference);
                ack
            }
            Command::Disconnect { ack } => {
                self.disconnect();
                ack
            }
            Command::Destroy { ack } => {
                self.destroy();
                ack
            }
        };
        // Callers observe the new state as soon as their call returns.
        self.publish();
        let _ = ack.send(());
    }

    fn detect(&self) -> Option<TransportKind> {
        if self.streaming.is_supported() {
            Some(TransportKind::Streaming)
        } else if self.socket.is_supported() {
            Some(TransportKind::Socket)
        } else {
            None
        }
    }

    fn connect(&mut self, user_id: String, preference: Option<ConnectionPreference>) {
        if self.destroyed {
            crate::log_debug!("connect after destroy ignored");
            return;
        }

        let kind = match preference.unwrap_or(self.preferred) {
            ConnectionPreference::Streaming => TransportKind::Streaming,
            ConnectionPreference::Socket => TransportKind::Socket,
            ConnectionPreference::Auto => match self.detect() {
                Some(kind) => kind,
                None => {
                    let error = ConnectionError::Unsupported {
                        message: "neither streaming nor socket transport is available".to_string(),
                    };
                    crate::log_error!("{}", error);
                    self.disconnect();
                    self.handlers.error(&error);
                    return;
                }
            },
        };

        // Only one supervisor may hold a session.
        self.release_other(kind);

        crate::log_info!("connecting user {} via {}", user_id, kind);
        self.fallback = None;
        self.fallback_attempted.clear();
        self.fallback_attempted.insert(kind);
        self.active = Some(kind);
        self.user_id = Some(user_id.clone());

        let mut out = Vec::new();
        self.supervisor(kind).connect(&user_id, Instant::now(), &mut out);
        self.route(kind, out);
    }

    fn disconnect(&mut self) {
        self.fallback = None;
        self.fallback_attempted.clear();

        let mut out = Vec::new();
        if let Some(kind) = self.active {
            self.supervisor(kind).disconnect(&mut out);
            self.route(kind, out);
            let mut discarded = Vec::new();
            self.supervisor(kind.other()).disconnect(&mut discarded);
        } else {
            self.streaming.disconnect(&mut out);
            self.socket.disconnect(&mut out);
        }
        self.report_status(false);
        self.active = None;
        self.user_id = None;
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.disconnect();
        let mut discarded = Vec::new();
        self.streaming.destroy(&mut discarded);
        self.socket.destroy(&mut discarded);
        self.destroyed = true;
        self.network_subscription.unsubscribe();
        self.handlers.clear();
        crate::log_info!("connection manager destroyed");
    }

    fn handle_network(&mut self, event: NetworkEvent) {
        let now = Instant::now();
        match event {
            NetworkEvent::Offline => {
                self.fallback = None;
                for kind in [TransportKind::Streaming, TransportKind::Socket] {
                    let mut out = Vec::new();
                    self.supervisor(kind).network_offline(&mut out);
                    self.route(kind, out);
                }
            }
            NetworkEvent::Online => {
                if let Some(kind) = self.active {
                    let mut out = Vec::new();
                    self.supervisor(kind).network_online(now, &mut out);
                    self.route(kind, out);
                }
            }
            NetworkEvent::PageHide => {
                crate::log_info!("page hide; disconnecting");
                self.disconnect();
            }
        }
    }

    fn handle_timers(&mut self) {
        let now = Instant::now();
        for kind in [TransportKind::Streaming, TransportKind::Socket] {
            let mut out = Vec::new();
            self.supervisor(kind).on_timers(now, &mut out);
            self.route(kind, out);
        }

        if self.fallback.as_ref().is_some_and(|f| f.at <= now) {
            if let Some(pending) = self.fallback.take() {
                self.switch_to(pending.target, now);
            }
        }
    }

    /// Tear down the supervisor of the kind other than `kind`. Its own
    /// output is dropped; if it was the active one, the caller still sees
    /// the connection go down.
    fn release_other(&mut self, kind: TransportKind) {
        let mut discarded = Vec::new();
        self.supervisor(kind.other()).disconnect(&mut discarded);
        if self.active == Some(kind.other()) {
            self.report_status(false);
        }
    }

    fn report_status(&mut self, connected: bool) {
        if self.last_status != connected {
            self.last_status = connected;
            self.handlers.status(connected);
        }
    }

    /// Forward supervisor output to the caller. Output from a supervisor
    /// that is no longer active is dropped.
    fn route(&mut self, kind: TransportKind, outputs: Vec<SupervisorOutput>) {
        for output in outputs {
            if self.active != Some(kind) {
                crate::log_debug!("discarding {:?} from inactive {} supervisor", output, kind);
                continue;
            }
            match output {
                SupervisorOutput::Notification(notification) => {
                    self.handlers.notification(&notification);
                }
                SupervisorOutput::Update { id, kind: update } => self.handlers.update(&id, update),
                SupervisorOutput::Status(connected) => self.report_status(connected),
                SupervisorOutput::Opened => {
                    self.fallback = None;
                    self.fallback_attempted.clear();
                    self.fallback_attempted.insert(kind);
                }
                SupervisorOutput::FailureEpisode(error) => self.on_failure_episode(kind, error),
            }
        }
    }

    fn on_failure_episode(&mut self, kind: TransportKind, error: ConnectionError) {
        let alternate = kind.other();
        if self.fallback_enabled && !self.fallback_attempted.contains(&alternate) {
            crate::log_info!(
                "{} failed ({}); falling back to {} in {:?}",
                kind,
                error,
                alternate,
                self.fallback_grace
            );
            self.fallback = Some(PendingFallback {
                target: alternate,
                at: Instant::now() + self.fallback_grace,
            });
            return;
        }

        crate::log_error!("{} connection failed: {}", kind, error);
        self.handlers.error(&error);
    }

    fn switch_to(&mut self, target: TransportKind, now: Instant) {
        let Some(user_id) = self.user_id.clone() else {
            return;
        };
        crate::log_info!("switching to {} transport", target);

        self.release_other(target);
        self.fallback_attempted.insert(target);
        self.active = Some(target);

        let mut out = Vec::new();
        self.supervisor(target).connect(&user_id, now, &mut out);
        self.route(target, out);
    }
}
