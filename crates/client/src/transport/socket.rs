//! WebSocket transport over `tokio-tungstenite`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use notiflow_shared::{ConnectionError, OutboundMessage, TransportKind, CLOSE_ABNORMAL};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use super::{
    spawn_on_current, EventSink, OpenRequest, TransportConnection, TransportConnector,
    TransportError, TransportEvent,
};

/// Close code reported for a close frame without a status.
const CLOSE_NO_STATUS: u16 = 1005;

/// How long a closing socket may spend flushing its close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Opens WebSocket connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketConnector;

impl SocketConnector {
    pub fn new() -> Self {
        Self
    }
}

fn construction(message: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::Construction {
        kind: TransportKind::Socket,
        message: message.to_string(),
    }
}

impl TransportConnector for SocketConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn open(
        &self,
        request: OpenRequest,
        sink: EventSink,
    ) -> Result<Box<dyn TransportConnection>, ConnectionError> {
        if !matches!(request.url.scheme(), "ws" | "wss") {
            return Err(construction(format!(
                "unsupported URL scheme `{}`",
                request.url.scheme()
            )));
        }

        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(construction)?;
        if !request.protocols.is_empty() {
            let protocols =
                HeaderValue::from_str(&request.protocols.join(", ")).map_err(construction)?;
            ws_request
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, protocols);
        }

        let (outbound, outbound_rx) = unbounded();
        let open = Arc::new(AtomicBool::new(false));
        let task = spawn_on_current(
            TransportKind::Socket,
            run_socket(ws_request, outbound_rx, sink, open.clone()),
        )?;

        Ok(Box::new(SocketConnection {
            outbound,
            task: Some(task),
            open,
        }))
    }
}

/// A running WebSocket connection.
pub struct SocketConnection {
    outbound: UnboundedSender<Message>,
    task: Option<JoinHandle<()>>,
    open: Arc<AtomicBool>,
}

impl TransportConnection for SocketConnection {
    fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        let json =
            serde_json::to_string(message).map_err(|e| TransportError::Serialize(e.to_string()))?;
        self.outbound
            .unbounded_send(Message::Text(json.into()))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self, code: u16, reason: &str) {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        let Some(task) = self.task.take() else {
            return;
        };
        if was_open {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            };
            let _ = self.outbound.unbounded_send(Message::Close(Some(frame)));
            abort_after(task, CLOSE_GRACE);
        } else {
            task.abort();
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Let `task` finish on its own for up to `grace`, then abort it. A peer
/// that stops reading cannot keep the writer alive past that.
fn abort_after(mut task: JoinHandle<()>, grace: Duration) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if tokio::time::timeout(grace, &mut task).await.is_err() {
                    crate::log_debug!("socket close frame not flushed in {:?}; aborting", grace);
                    task.abort();
                }
            });
        }
        Err(_) => task.abort(),
    }
}

impl Drop for SocketConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
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

async fn run_socket(
    request: Request,
    mut outbound: UnboundedReceiver<Message>,
    sink: EventSink,
    open: Arc<AtomicBool>,
) {
    let ws_stream = match connect_async(request).await {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            fail(&sink, &open, format!("handshake failed: {e}"));
            return;
        }
    };

    open.store(true, Ordering::SeqCst);
    if !sink.emit(TransportEvent::Open) {
        return;
    }

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if !sink.emit(TransportEvent::message(text.as_str())) {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    crate::log_debug!("socket received close frame ({})", code);
                    open.store(false, Ordering::SeqCst);
                    sink.emit(TransportEvent::Close { code, reason });
                    break;
                }
                Some(Ok(Message::Ping(data))) => {
                    // Pong is handled automatically by tungstenite
                    crate::log_debug!("socket received protocol ping: {:?}", data);
                }
                Some(Ok(_)) => {
                    // Ignore binary, pong, etc.
                }
                Some(Err(e)) => {
                    fail(&sink, &open, format!("read error: {e}"));
                    break;
                }
                None => {
                    fail(&sink, &open, "connection dropped".to_string());
                    break;
                }
            },
            queued = outbound.next() => match queued {
                Some(message) => {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(e) = write.send(message).await {
                        fail(&sink, &open, format!("send failed: {e}"));
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                None => {
                    let _ = write.close().await;
                    break;
                }
            },
        }
    }

    open.store(false, Ordering::SeqCst);
}
