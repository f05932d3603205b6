//! Transport abstraction.
//!
//! A [`TransportConnector`] starts one network attempt per call to
//! [`TransportConnector::open`] and reports what happens to it through an
//! [`EventSink`]. Every event is tagged with the transport kind and the
//! generation of the attempt, so the supervisor can ignore events from a
//! connection it has already replaced.

use notiflow_shared::{ConnectionError, OutboundMessage, TransportKind};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use url::Url;

pub mod socket;
pub mod sse;
pub mod streaming;

pub use socket::SocketConnector;
pub use streaming::StreamingConnector;

/// Lifecycle and message events of one transport connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message {
        data: String,
        /// Named event type (streaming kind only).
        event_name: Option<String>,
        /// Transport-level event identifier (streaming kind only).
        event_id: Option<String>,
    },
    Error {
        message: String,
    },
    Close {
        code: u16,
        reason: String,
    },
}

impl TransportEvent {
    pub fn message(data: impl Into<String>) -> Self {
        TransportEvent::Message {
            data: data.into(),
            event_name: None,
            event_id: None,
        }
    }
}

/// A [`TransportEvent`] tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSignal {
    pub kind: TransportKind,
    pub generation: u64,
    pub event: TransportEvent,
}

/// Where a connection reports its events.
#[derive(Debug, Clone)]
pub struct EventSink {
    kind: TransportKind,
    generation: u64,
    tx: UnboundedSender<TransportSignal>,
}

impl EventSink {
    pub fn new(kind: TransportKind, generation: u64, tx: UnboundedSender<TransportSignal>) -> Self {
        Self {
            kind,
            generation,
            tx,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the receiving manager is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TransportSignal {
                kind: self.kind,
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Everything a connector needs to start one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub url: Url,
    /// Requested subprotocols (socket kind only).
    pub protocols: Vec<String>,
    /// Last-seen event identifier, sent as `Last-Event-ID` by the streaming kind.
    pub resume_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection is not open")]
    NotOpen,

    #[error("{0} transport cannot send messages")]
    SendUnsupported(TransportKind),

    #[error("connection closed")]
    Closed,

    #[error("failed to serialize message: {0}")]
    Serialize(String),
}

/// Factory for connections of one transport kind.
pub trait TransportConnector: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Capability check used by `auto` detection.
    fn is_supported(&self) -> bool {
        true
    }

    /// Start a connection attempt. Never blocks; progress is reported
    /// through `sink`. An `Err` here is a construction failure.
    fn open(
        &self,
        request: OpenRequest,
        sink: EventSink,
    ) -> Result<Box<dyn TransportConnection>, ConnectionError>;
}

/// A live (or starting) connection. Dropping it aborts its network task.
pub trait TransportConnection: Send {
    /// Send a message. Only the socket kind supports this.
    fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;

    /// Close the connection. No further events are emitted afterwards.
    fn close(&mut self, code: u16, reason: &str);

    fn is_open(&self) -> bool;
}

/// Both built-in connectors.
pub fn default_connectors() -> Vec<Box<dyn TransportConnector>> {
    vec![
        Box::new(StreamingConnector::new()),
        Box::new(SocketConnector::new()),
    ]
}

/// Spawn a network task on the current runtime, or report a construction
/// failure when there is none.
pub(crate) fn spawn_on_current<F>(
    kind: TransportKind,
    future: F,
) -> Result<tokio::task::JoinHandle<()>, ConnectionError>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let handle =
        tokio::runtime::Handle::try_current().map_err(|e| ConnectionError::Construction {
            kind,
            message: e.to_string(),
        })?;
    Ok(handle.spawn(future))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn sink_tags_events() {
        let (tx, mut rx) = unbounded_channel();
        let sink = EventSink::new(TransportKind::Socket, 3, tx);
        assert!(sink.emit(TransportEvent::Open));

        let signal = rx.try_recv().expect("signal queued");
        assert_eq!(signal.kind, TransportKind::Socket);
        assert_eq!(signal.generation, 3);
        assert_eq!(signal.event, TransportEvent::Open);

        drop(rx);
        assert!(!sink.emit(TransportEvent::Open));
    }

    #[test]
    fn spawn_without_runtime_is_construction_failure() {
        let err = spawn_on_current(TransportKind::Streaming, async {}).expect_err("no runtime");
        assert!(matches!(err, ConnectionError::Construction { .. }));
    }
}
