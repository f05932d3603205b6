//! Notiflow Client - real-time notification delivery
//!
//! Keeps a client continuously receiving server-pushed notifications over
//! either a server-sent event stream or a WebSocket, with reconnection,
//! heartbeat staleness detection and fallback between the two.

pub mod logging;

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod handlers;
pub mod manager;
pub mod network;
pub mod supervisor;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use auth::{AuthLookup, Credentials, StaticAuth};
pub use config::{
    ConfigError, ConnectionConfig, ConnectionPreference, ManagerConfig, ReconnectionPolicy,
};
pub use dispatcher::{EventDispatcher, NotificationValidator, RequiredFields};
pub use handlers::Subscription;
pub use manager::{BuildError, ConnectionManager, ConnectionManagerBuilder, ManagerSnapshot};
pub use network::{NetworkEvent, NetworkMonitor, NetworkSignal, NetworkSubscription};
pub use supervisor::ConnectionState;
pub use transport::{TransportConnection, TransportConnector, TransportError, TransportEvent};

pub use notiflow_shared::{
    ConnectionError, Notification, NotificationLevel, OutboundMessage, TransportKind, UpdateKind,
};
