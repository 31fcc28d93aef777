use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Message;
use crate::{time, ProtoError, ProtoResult};

/// Raw JSON frame as it travels on the socket.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

/// A single message exchanged over the persistent connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: Message,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
}

/// Result of decoding one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Envelope(Envelope),
    /// A well-formed frame whose kind this client does not understand.
    Unknown { kind: String },
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            timestamp: Utc::now(),
            user_id: None,
            request_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attaches a fresh random correlation id, which the server echoes on
    /// its reply.
    pub fn correlated(self) -> Self {
        self.with_request_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn kind(&self) -> &'static str {
        self.message.kind()
    }

    pub fn encode(&self) -> ProtoResult<String> {
        let wire = WireEnvelope {
            kind: self.kind().to_string(),
            payload: self.message.payload().map_err(ProtoError::Encode)?,
            timestamp: Some(Value::String(self.timestamp.to_rfc3339())),
            user_id: self.user_id.clone(),
            request_id: self.request_id.clone(),
        };
        serde_json::to_string(&wire).map_err(ProtoError::Encode)
    }

    /// Decodes a text frame. A frame that is not an envelope at all, or whose
    /// payload does not match its kind, is an error; an unknown kind is not.
    pub fn decode(text: &str) -> ProtoResult<Inbound> {
        let wire: WireEnvelope = serde_json::from_str(text).map_err(ProtoError::Malformed)?;
        let message = Message::from_parts(&wire.kind, wire.payload).map_err(|source| {
            ProtoError::Payload {
                kind: wire.kind.clone(),
                source,
            }
        })?;
        let Some(message) = message else {
            return Ok(Inbound::Unknown { kind: wire.kind });
        };
        // An odd timestamp must not cost the frame; fall back to receipt time.
        let timestamp = wire
            .timestamp
            .as_ref()
            .and_then(time::parse)
            .unwrap_or_else(Utc::now);
        Ok(Inbound::Envelope(Envelope {
            message,
            timestamp,
            user_id: wire.user_id,
            request_id: wire.request_id,
        }))
    }
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        Envelope::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TaskChange, Topic};

    fn decode_known(text: &str) -> Envelope {
        match Envelope::decode(text).expect("decode") {
            Inbound::Envelope(envelope) => envelope,
            Inbound::Unknown { kind } => panic!("unexpected unknown kind {kind}"),
        }
    }

    #[test]
    fn encodes_wire_shape() {
        let envelope = Envelope::new(Message::Subscribe(Topic::task("42")))
            .with_user("u-1")
            .with_request_id("r-1");
        let value: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["kind"], "subscribe");
        assert_eq!(value["payload"]["topicType"], "task");
        assert_eq!(value["payload"]["topicId"], "42");
        assert_eq!(value["userId"], "u-1");
        assert_eq!(value["requestId"], "r-1");
        assert!(value["timestamp"].as_str().is_some());
    }

    #[test]
    fn omits_absent_optional_fields() {
        let value: Value =
            serde_json::from_str(&Envelope::new(Message::Ping).encode().unwrap()).unwrap();
        assert!(value.get("userId").is_none());
        assert!(value.get("requestId").is_none());
        assert_eq!(value["payload"], serde_json::json!({}));
    }

    #[test]
    fn decodes_task_update_with_numeric_ids() {
        let envelope = decode_known(
            r#"{"kind":"task_updated","payload":{"taskId":42,"workspaceId":9,"task":{"title":"x"}},
                "timestamp":"2024-05-01T10:00:00Z","userId":"u-7"}"#,
        );
        assert_eq!(
            envelope.message,
            Message::TaskUpdated(TaskChange {
                task_id: "42".into(),
                workspace_id: Some("9".into()),
                task: Some(serde_json::json!({"title": "x"})),
            })
        );
        assert_eq!(envelope.user_id.as_deref(), Some("u-7"));
        assert_eq!(envelope.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn unknown_kind_is_not_an_error() {
        let inbound =
            Envelope::decode(r#"{"kind":"future_unknown_kind","payload":{"anything":true}}"#)
                .expect("unknown kinds decode");
        assert_eq!(
            inbound,
            Inbound::Unknown {
                kind: "future_unknown_kind".into()
            }
        );
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(matches!(
            Envelope::decode("not json"),
            Err(ProtoError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"payload":{}}"#),
            Err(ProtoError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"kind":"task_updated","payload":{"title":"no id"}}"#),
            Err(ProtoError::Payload { .. })
        ));
    }

    #[test]
    fn bare_kinds_tolerate_missing_payload_and_timestamp() {
        let pong = decode_known(r#"{"kind":"pong"}"#);
        assert_eq!(pong.message, Message::Pong);

        let online = decode_known(r#"{"kind":"user_online","userId":"u-3"}"#);
        assert!(matches!(online.message, Message::UserOnline(_)));
        assert_eq!(online.user_id.as_deref(), Some("u-3"));
    }

    #[test]
    fn epoch_millis_timestamps_are_understood() {
        let envelope = decode_known(
            r#"{"kind":"task_updated","payload":{"taskId":"42"},"timestamp":1714557600000}"#,
        );
        assert!(matches!(envelope.message, Message::TaskUpdated(_)));
        assert_eq!(envelope.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn unreadable_timestamps_fall_back_to_receipt_time() {
        let before = Utc::now();
        for raw in [
            r#"{"kind":"task_deleted","payload":{"taskId":"42"},"timestamp":"last tuesday"}"#,
            r#"{"kind":"task_deleted","payload":{"taskId":"42"},"timestamp":{"at":1}}"#,
            r#"{"kind":"task_deleted","payload":{"taskId":"42"},"timestamp":true}"#,
        ] {
            let envelope = decode_known(raw);
            assert!(matches!(envelope.message, Message::TaskDeleted(_)), "{raw}");
            assert!(envelope.timestamp >= before, "{raw}");
        }
    }

    #[test]
    fn unreadable_last_seen_keeps_the_presence_frame() {
        let envelope = decode_known(
            r#"{"kind":"user_online","payload":{"userId":"sara","lastSeen":"yesterday"}}"#,
        );
        match envelope.message {
            Message::UserOnline(change) => {
                assert_eq!(change.user_id.as_deref(), Some("sara"));
                assert!(change.last_seen.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn correlated_envelopes_get_distinct_ids() {
        let first = Envelope::new(Message::Ping).correlated();
        let second = Envelope::new(Message::Ping).correlated();
        let id = first.request_id.clone().expect("request id");
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        assert_ne!(first.request_id, second.request_id);

        let value: Value = serde_json::from_str(&first.encode().unwrap()).unwrap();
        assert_eq!(value["requestId"], id.as_str());
    }
}
