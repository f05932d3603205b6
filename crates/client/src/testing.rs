//! Scriptable in-memory transport for tests.
//!
//! A [`ScriptedConnector`] never touches the network. It records every
//! attempt and lets the test play the server's side by emitting events on
//! the most recent connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use notiflow_shared::{ConnectionError, OutboundMessage, TransportKind};
use url::Url;

use crate::transport::{
    EventSink, OpenRequest, TransportConnection, TransportConnector, TransportError,
    TransportEvent,
};

#[derive(Default)]
struct Script {
    supported: bool,
    construction_failures: u32,
    requests: Vec<OpenRequest>,
    sinks: Vec<(EventSink, Arc<AtomicBool>)>,
    sent: Vec<OutboundMessage>,
    closes: Vec<(u16, String)>,
}

/// Cloning shares the script, so a test keeps one clone while the manager
/// owns another.
#[derive(Clone)]
pub struct ScriptedConnector {
    kind: TransportKind,
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            script: Arc::new(Mutex::new(Script {
                supported: true,
                ..Default::default()
            })),
        }
    }

    /// A connector whose capability check fails.
    pub fn unsupported(kind: TransportKind) -> Self {
        let connector = Self::new(kind);
        connector.lock().supported = false;
        connector
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Flip the capability check, e.g. to simulate losing support mid-run.
    pub fn set_supported(&self, supported: bool) {
        self.lock().supported = supported;
    }

    /// Make the next `count` calls to `open` fail synchronously.
    pub fn fail_constructions(&self, count: u32) {
        self.lock().construction_failures = count;
    }

    pub fn open_count(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn last_request(&self) -> Option<OpenRequest> {
        self.lock().requests.last().cloned()
    }

    pub fn opened_urls(&self) -> Vec<Url> {
        self.lock().requests.iter().map(|r| r.url.clone()).collect()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.lock().sent.clone()
    }

    pub fn closes(&self) -> Vec<(u16, String)> {
        self.lock().closes.clone()
    }

    fn emit(&self, event: TransportEvent) -> bool {
        let script = self.lock();
        let Some((sink, open)) = script.sinks.last() else {
            return false;
        };
        match &event {
            TransportEvent::Open => open.store(true, Ordering::SeqCst),
            TransportEvent::Close { .. } => open.store(false, Ordering::SeqCst),
            _ => {}
        }
        sink.emit(event)
    }

    pub fn emit_open(&self) -> bool {
        self.emit(TransportEvent::Open)
    }

    pub fn emit_message(&self, data: &str) -> bool {
        self.emit(TransportEvent::message(data))
    }

    /// A message with streaming-style framing.
    pub fn emit_sse(&self, data: &str, event_name: Option<&str>, event_id: Option<&str>) -> bool {
        self.emit(TransportEvent::Message {
            data: data.to_string(),
            event_name: event_name.map(str::to_string),
            event_id: event_id.map(str::to_string),
        })
    }

    pub fn emit_error(&self, message: &str) -> bool {
        self.emit(TransportEvent::Error {
            message: message.to_string(),
        })
    }

    pub fn emit_close(&self, code: u16, reason: &str) -> bool {
        self.emit(TransportEvent::Close {
            code,
            reason: reason.to_string(),
        })
    }
}

impl TransportConnector for ScriptedConnector {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn is_supported(&self) -> bool {
        self.lock().supported
    }

    fn open(
        &self,
        request: OpenRequest,
        sink: EventSink,
    ) -> Result<Box<dyn TransportConnection>, ConnectionError> {
        let mut script = self.lock();
        script.requests.push(request);

        if !script.supported {
            return Err(ConnectionError::Construction {
                kind: self.kind,
                message: "transport not supported".to_string(),
            });
        }
        if script.construction_failures > 0 {
            script.construction_failures -= 1;
            return Err(ConnectionError::Construction {
                kind: self.kind,
                message: "scripted construction failure".to_string(),
            });
        }

        let open = Arc::new(AtomicBool::new(false));
        script.sinks.push((sink, open.clone()));
        Ok(Box::new(ScriptedConnection {
            kind: self.kind,
            script: self.script.clone(),
            open,
        }))
    }
}

struct ScriptedConnection {
    kind: TransportKind,
    script: Arc<Mutex<Script>>,
    open: Arc<AtomicBool>,
}

impl ScriptedConnection {
    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TransportConnection for ScriptedConnection {
    fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        if self.kind == TransportKind::Streaming {
            return Err(TransportError::SendUnsupported(self.kind));
        }
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.lock().sent.push(message.clone());
        Ok(())
    }

    fn close(&mut self, code: u16, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        self.lock().closes.push((code, reason.to_string()));
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
