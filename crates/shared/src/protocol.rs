//! Wire protocol of the real-time notification stream.
//!
//! Both transports carry the same JSON event shape:
//!
//! ```json
//! {"type": "new_notification", "notification": {...}, "userId": 42}
//! {"type": "notification_read", "notificationId": "n-1", "userId": 42}
//! {"type": "heartbeat"}
//! ```
//!
//! Older socket servers wrap data events as
//! `{"type": "notification", "eventType": "new_notification", ...}`; both
//! shapes are accepted.

use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::models::{opt_string_or_number, Notification, UpdateKind};

/// Inbound `type` values.
pub const EVENT_NEW_NOTIFICATION: &str = "new_notification";
pub const EVENT_NOTIFICATION_READ: &str = "notification_read";
pub const EVENT_NOTIFICATION_DELETED: &str = "notification_deleted";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_PING: &str = "ping";
pub const EVENT_PONG: &str = "pong";
pub const EVENT_AUTH_SUCCESS: &str = "auth_success";
pub const EVENT_AUTH_ERROR: &str = "auth_error";

/// Envelope `type` values used by the wrapped socket shape.
const WRAPPED_NOTIFICATION: &str = "notification";
const WRAPPED_NOTIFICATION_UPDATE: &str = "notification_update";

/// WebSocket close code for a normal, intentional closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code reported when a connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// The two interchangeable transport kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Unidirectional server-sent event stream.
    Streaming,
    /// Bidirectional WebSocket.
    Socket,
}

impl TransportKind {
    /// The kind to fall back to when this one fails.
    pub fn other(self) -> Self {
        match self {
            TransportKind::Streaming => TransportKind::Socket,
            TransportKind::Socket => TransportKind::Streaming,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Streaming => "streaming",
            TransportKind::Socket => "socket",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the post-open authentication handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    Accepted,
    Rejected { message: String },
}

/// A parsed inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NewItem(Notification),
    ItemUpdated { id: String, kind: UpdateKind },
    Heartbeat,
    AuthResult(AuthOutcome),
    Ping,
    Pong,
}

/// An inbound event together with the identifier used to resume the
/// stream after a reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub event: InboundEvent,
    pub resume_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    #[serde(rename = "type")]
    kind: Option<String>,
    event_type: Option<String>,
    notification: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    notification_id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    user_id: Option<String>,
    message: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    event_id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    id: Option<String>,
}

/// Parse one inbound JSON payload.
///
/// Data events (`new_notification`, `notification_read`,
/// `notification_deleted`) must name the `userId` they are addressed to;
/// control events (heartbeat, ping/pong, auth results) carry no required
/// fields beyond `type`.
pub fn parse_inbound(text: &str) -> Result<InboundEnvelope, ParseError> {
    let raw: RawEvent = serde_json::from_str(text)?;
    let envelope_type = raw.kind.ok_or(ParseError::MissingField("type"))?;

    let event_type = if matches!(
        envelope_type.as_str(),
        WRAPPED_NOTIFICATION | WRAPPED_NOTIFICATION_UPDATE
    ) {
        raw.event_type.ok_or(ParseError::MissingField("eventType"))?
    } else {
        envelope_type
    };

    let event = match event_type.as_str() {
        EVENT_NEW_NOTIFICATION => {
            raw.user_id.ok_or(ParseError::MissingField("userId"))?;
            let value = raw
                .notification
                .ok_or(ParseError::MissingField("notification"))?;
            let notification = serde_json::from_value::<Notification>(value)
                .map_err(|e| ParseError::InvalidNotification(e.to_string()))?;
            InboundEvent::NewItem(notification)
        }
        EVENT_NOTIFICATION_READ | EVENT_NOTIFICATION_DELETED => {
            raw.user_id.ok_or(ParseError::MissingField("userId"))?;
            let id = raw
                .notification_id
                .filter(|id| !id.is_empty())
                .ok_or(ParseError::MissingField("notificationId"))?;
            let kind = if event_type == EVENT_NOTIFICATION_READ {
                UpdateKind::Read
            } else {
                UpdateKind::Deleted
            };
            InboundEvent::ItemUpdated { id, kind }
        }
        EVENT_HEARTBEAT => InboundEvent::Heartbeat,
        EVENT_PING => InboundEvent::Ping,
        EVENT_PONG => InboundEvent::Pong,
        EVENT_AUTH_SUCCESS => InboundEvent::AuthResult(AuthOutcome::Accepted),
        EVENT_AUTH_ERROR => InboundEvent::AuthResult(AuthOutcome::Rejected {
            message: raw
                .message
                .unwrap_or_else(|| "authentication failed".to_string()),
        }),
        _ => return Err(ParseError::UnknownType(event_type.clone())),
    };

    Ok(InboundEnvelope {
        event,
        resume_token: raw.event_id.or(raw.id),
    })
}

/// Messages the client sends over the socket transport.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Sent immediately after the socket opens.
    Auth { token: Option<String> },
    /// Client-side liveness probe.
    Ping,
    /// Reply to a server `ping`.
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTIFICATION: &str = r#"{
        "id": "n-1",
        "userId": "42",
        "title": "Evaluation ready",
        "message": "Your supervisor submitted an evaluation",
        "createdAt": "2024-03-01T10:00:00Z"
    }"#;

    #[test]
    fn parses_new_notification() {
        let text = format!(
            r#"{{"type":"new_notification","userId":42,"notification":{NOTIFICATION}}}"#
        );
        let envelope = parse_inbound(&text).expect("valid event");
        match envelope.event {
            InboundEvent::NewItem(n) => {
                assert_eq!(n.id, "n-1");
                assert_eq!(n.title, "Evaluation ready");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(envelope.resume_token.is_none());
    }

    #[test]
    fn parses_read_and_deleted_updates() {
        let read = parse_inbound(r#"{"type":"notification_read","notificationId":"n-1","userId":42}"#)
            .expect("valid read");
        assert_eq!(
            read.event,
            InboundEvent::ItemUpdated {
                id: "n-1".to_string(),
                kind: UpdateKind::Read
            }
        );

        let deleted =
            parse_inbound(r#"{"type":"notification_deleted","notificationId":9,"userId":42}"#)
                .expect("valid delete");
        assert_eq!(
            deleted.event,
            InboundEvent::ItemUpdated {
                id: "9".to_string(),
                kind: UpdateKind::Deleted
            }
        );
    }

    #[test]
    fn parses_wrapped_socket_shape() {
        let envelope = parse_inbound(
            r#"{"type":"notification_update","eventType":"notification_read","notificationId":"n-3","userId":"42"}"#,
        )
        .expect("valid wrapped event");
        assert_eq!(
            envelope.event,
            InboundEvent::ItemUpdated {
                id: "n-3".to_string(),
                kind: UpdateKind::Read
            }
        );
    }

    #[test]
    fn control_events_need_no_user() {
        assert_eq!(
            parse_inbound(r#"{"type":"heartbeat"}"#).map(|e| e.event),
            Ok(InboundEvent::Heartbeat)
        );
        assert_eq!(
            parse_inbound(r#"{"type":"ping"}"#).map(|e| e.event),
            Ok(InboundEvent::Ping)
        );
        assert_eq!(
            parse_inbound(r#"{"type":"auth_error","message":"expired"}"#).map(|e| e.event),
            Ok(InboundEvent::AuthResult(AuthOutcome::Rejected {
                message: "expired".to_string()
            }))
        );
    }

    #[test]
    fn resume_token_prefers_event_id() {
        let envelope =
            parse_inbound(r#"{"type":"heartbeat","eventId":"99","id":"12"}"#).expect("valid");
        assert_eq!(envelope.resume_token.as_deref(), Some("99"));
    }

    #[test]
    fn rejects_missing_fields() {
        assert_eq!(
            parse_inbound(r#"{"notificationId":"n-1"}"#),
            Err(ParseError::MissingField("type"))
        );
        assert_eq!(
            parse_inbound(r#"{"type":"notification_read","userId":1}"#),
            Err(ParseError::MissingField("notificationId"))
        );
        assert_eq!(
            parse_inbound(r#"{"type":"notification_read","notificationId":"n-1"}"#),
            Err(ParseError::MissingField("userId"))
        );
        assert_eq!(
            parse_inbound(r#"{"type":"new_notification","userId":1}"#),
            Err(ParseError::MissingField("notification"))
        );
    }

    #[test]
    fn rejects_malformed_notification_and_unknown_types() {
        let err = parse_inbound(
            r#"{"type":"new_notification","userId":1,"notification":{"id":"n-1"}}"#,
        )
        .expect_err("notification lacks fields");
        assert!(matches!(err, ParseError::InvalidNotification(_)));

        assert_eq!(
            parse_inbound(r#"{"type":"presence"}"#),
            Err(ParseError::UnknownType("presence".to_string()))
        );
        assert!(matches!(parse_inbound("not json"), Err(ParseError::Json(_))));
    }

    #[test]
    fn outbound_wire_shape() {
        let auth = OutboundMessage::Auth {
            token: Some("abc".to_string()),
        };
        assert_eq!(
            serde_json::to_string(&auth).expect("serialize"),
            r#"{"type":"auth","token":"abc"}"#
        );
        assert_eq!(
            serde_json::to_string(&OutboundMessage::Ping).expect("serialize"),
            r#"{"type":"ping"}"#
        );
        assert_eq!(
            serde_json::to_string(&OutboundMessage::Pong).expect("serialize"),
            r#"{"type":"pong"}"#
        );
    }

    #[test]
    fn transport_kind_alternates() {
        assert_eq!(TransportKind::Streaming.other(), TransportKind::Socket);
        assert_eq!(TransportKind::Socket.other(), TransportKind::Streaming);
        assert_eq!(TransportKind::Socket.to_string(), "socket");
    }
}
