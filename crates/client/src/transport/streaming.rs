//! Server-sent event transport over `reqwest`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use notiflow_shared::{ConnectionError, OutboundMessage, TransportKind, CLOSE_ABNORMAL};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio::task::JoinHandle;

use super::sse::SseDecoder;
use super::{
    spawn_on_current, EventSink, OpenRequest, TransportConnection, TransportConnector,
    TransportError, TransportEvent,
};

const LAST_EVENT_ID: &str = "Last-Event-ID";

/// Opens `text/event-stream` GET requests.
#[derive(Debug, Clone, Default)]
pub struct StreamingConnector {
    client: reqwest::Client,
}

impl StreamingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured client (proxies, TLS roots, ...).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl TransportConnector for StreamingConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Streaming
    }

    fn open(
        &self,
        request: OpenRequest,
        sink: EventSink,
    ) -> Result<Box<dyn TransportConnection>, ConnectionError> {
        if !matches!(request.url.scheme(), "http" | "https") {
            return Err(ConnectionError::Construction {
                kind: TransportKind::Streaming,
                message: format!("unsupported URL scheme `{}`", request.url.scheme()),
            });
        }

        let open = Arc::new(AtomicBool::new(false));
        let task = spawn_on_current(
            TransportKind::Streaming,
            run_stream(self.client.clone(), request, sink, open.clone()),
        )?;
        Ok(Box::new(StreamingConnection { task, open }))
    }
}

/// A running event stream.
pub struct StreamingConnection {
    task: JoinHandle<()>,
    open: Arc<AtomicBool>,
}

impl TransportConnection for StreamingConnection {
    fn send(&self, _message: &OutboundMessage) -> Result<(), TransportError> {
        Err(TransportError::SendUnsupported(TransportKind::Streaming))
    }

    fn close(&mut self, _code: u16, _reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        self.task.abort();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for StreamingConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn fail(sink: &EventSink, open: &AtomicBool, message: String) {
    open.store(false, Ordering::SeqCst);
    sink.emit(TransportEvent::Error {
        message: message.clone(),
    });
    sink.emit(TransportEvent::Close {
        code: CLOSE_ABNORMAL,
        reason: message,
    });
}

async fn run_stream(
    client: reqwest::Client,
    request: OpenRequest,
    sink: EventSink,
    open: Arc<AtomicBool>,
) {
    let mut builder = client
        .get(request.url.clone())
        .header(ACCEPT, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache");
    if let Some(token) = &request.resume_token {
        builder = builder.header(LAST_EVENT_ID, token.as_str());
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            fail(&sink, &open, format!("request failed: {e}"));
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        fail(&sink, &open, format!("unexpected status {status}"));
        return;
    }

    crate::log_debug!("event stream opened: {}", request.url.path());
    open.store(true, Ordering::SeqCst);
    if !sink.emit(TransportEvent::Open) {
        return;
    }

    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                fail(&sink, &open, format!("stream read error: {e}"));
                return;
            }
        };
        for frame in decoder.feed(&bytes) {
            let delivered = sink.emit(TransportEvent::Message {
                data: frame.data,
                event_name: frame.event,
                event_id: frame.id,
            });
            if !delivered {
                return;
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    sink.emit(TransportEvent::Close {
        code: CLOSE_ABNORMAL,
        reason: "stream ended".to_string(),
    });
}
