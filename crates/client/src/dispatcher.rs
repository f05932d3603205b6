//! Inbound payload decoding and validation.

use notiflow_shared::{
    parse_inbound, InboundEnvelope, InboundEvent, Notification, ParseError, EVENT_HEARTBEAT,
};

/// Shape check applied to every notification before it reaches the caller.
pub trait NotificationValidator: Send + Sync {
    fn validate(&self, notification: &Notification) -> Result<(), String>;
}

impl<F> NotificationValidator for F
where
    F: Fn(&Notification) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, notification: &Notification) -> Result<(), String> {
        self(notification)
    }
}

/// Requires `id`, `userId`, `title` and `message` to be non-blank.
/// `createdAt` is already enforced by deserialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequiredFields;

impl NotificationValidator for RequiredFields {
    fn validate(&self, n: &Notification) -> Result<(), String> {
        let fields = [
            ("id", &n.id),
            ("userId", &n.user_id),
            ("title", &n.title),
            ("message", &n.message),
        ];
        match fields.iter().find(|(_, value)| value.trim().is_empty()) {
            Some((name, _)) => Err(format!("`{name}` is empty")),
            None => Ok(()),
        }
    }
}

/// Turns raw transport messages into typed events.
pub struct EventDispatcher {
    validator: Box<dyn NotificationValidator>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(Box::new(RequiredFields))
    }
}

impl EventDispatcher {
    pub fn new(validator: Box<dyn NotificationValidator>) -> Self {
        Self { validator }
    }

    /// Decode one message.
    ///
    /// `event_name` and `event_id` come from the streaming transport's
    /// framing: a named `heartbeat` event needs no JSON body, and the
    /// frame id takes precedence over any id inside the payload.
    pub fn decode(
        &self,
        data: &str,
        event_name: Option<&str>,
        event_id: Option<&str>,
    ) -> Result<InboundEnvelope, ParseError> {
        let mut envelope = if event_name == Some(EVENT_HEARTBEAT) {
            InboundEnvelope {
                event: InboundEvent::Heartbeat,
                resume_token: None,
            }
        } else {
            parse_inbound(data)?
        };

        if let InboundEvent::NewItem(notification) = &envelope.event {
            self.validator
                .validate(notification)
                .map_err(ParseError::InvalidNotification)?;
        }

        if let Some(id) = event_id.filter(|id| !id.is_empty()) {
            envelope.resume_token = Some(id.to_string());
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notiflow_shared::UpdateKind;

    fn new_item(title: &str) -> String {
        format!(
            r#"{{"type":"new_notification","userId":42,"notification":{{"id":"n-1","userId":42,"title":"{title}","message":"body","createdAt":"2024-03-01T10:00:00Z"}}}}"#
        )
    }

    #[test]
    fn decodes_and_validates() {
        let dispatcher = EventDispatcher::default();
        let envelope = dispatcher
            .decode(&new_item("Hello"), None, Some("5"))
            .expect("valid");
        assert!(matches!(envelope.event, InboundEvent::NewItem(_)));
        assert_eq!(envelope.resume_token.as_deref(), Some("5"));
    }

    #[test]
    fn default_validator_rejects_blank_title() {
        let dispatcher = EventDispatcher::default();
        assert_eq!(
            dispatcher.decode(&new_item("  "), None, None),
            Err(ParseError::InvalidNotification("`title` is empty".to_string()))
        );
    }

    #[test]
    fn custom_validator() {
        let dispatcher = EventDispatcher::new(Box::new(|n: &Notification| {
            if n.title.starts_with("[spam]") {
                Err("spam".to_string())
            } else {
                Ok(())
            }
        }));
        assert!(dispatcher.decode(&new_item("[spam] win"), None, None).is_err());
        assert!(dispatcher.decode(&new_item("Report due"), None, None).is_ok());
    }

    #[test]
    fn named_heartbeat_needs_no_body() {
        let dispatcher = EventDispatcher::default();
        let envelope = dispatcher
            .decode("", Some("heartbeat"), None)
            .expect("heartbeat");
        assert_eq!(envelope.event, InboundEvent::Heartbeat);
    }

    #[test]
    fn payload_id_used_without_frame_id() {
        let dispatcher = EventDispatcher::default();
        let envelope = dispatcher
            .decode(
                r#"{"type":"notification_deleted","notificationId":"n-2","userId":1,"eventId":"44"}"#,
                None,
                None,
            )
            .expect("valid");
        assert_eq!(
            envelope.event,
            InboundEvent::ItemUpdated {
                id: "n-2".to_string(),
                kind: UpdateKind::Deleted
            }
        );
        assert_eq!(envelope.resume_token.as_deref(), Some("44"));
    }
}
