use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Topic;

/// Greeting some servers push right after the socket opens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskChange {
    #[serde(deserialize_with = "crate::ids::id")]
    pub task_id: String,
    #[serde(
        default,
        deserialize_with = "crate::ids::opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub workspace_id: Option<String>,
    /// Row snapshot after the change, when the server includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceChange {
    #[serde(deserialize_with = "crate::ids::id")]
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingChange {
    #[serde(
        default,
        deserialize_with = "crate::ids::opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "crate::ids::opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub task_id: Option<String>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    #[serde(
        default,
        deserialize_with = "crate::ids::opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<String>,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChange {
    #[serde(
        default,
        deserialize_with = "crate::ids::opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "crate::time::lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Typed envelope body. The wire `kind` string selects the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Connect(ConnectInfo),
    Authenticate { token: String },
    Authenticated { user_id: Option<String> },
    AuthenticationFailed { reason: String },
    Ping,
    Pong,
    Subscribe(Topic),
    Unsubscribe(Topic),
    TaskCreated(TaskChange),
    TaskUpdated(TaskChange),
    TaskDeleted(TaskChange),
    WorkspaceUpdated(WorkspaceChange),
    UserTyping(TypingChange),
    CursorPosition(CursorPosition),
    UserOnline(PresenceChange),
    UserOffline(PresenceChange),
    Notification(NotificationPayload),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthenticatePayload {
    token: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthenticatedPayload {
    #[serde(
        default,
        deserialize_with = "crate::ids::opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    user_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct AuthenticationFailedPayload {
    #[serde(default)]
    reason: String,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Connect(_) => "connect",
            Message::Authenticate { .. } => "authenticate",
            Message::Authenticated { .. } => "authenticated",
            Message::AuthenticationFailed { .. } => "authentication_failed",
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::Subscribe(_) => "subscribe",
            Message::Unsubscribe(_) => "unsubscribe",
            Message::TaskCreated(_) => "task_created",
            Message::TaskUpdated(_) => "task_updated",
            Message::TaskDeleted(_) => "task_deleted",
            Message::WorkspaceUpdated(_) => "workspace_updated",
            Message::UserTyping(_) => "user_typing",
            Message::CursorPosition(_) => "cursor_position",
            Message::UserOnline(_) => "user_online",
            Message::UserOffline(_) => "user_offline",
            Message::Notification(_) => "notification",
        }
    }

    pub(crate) fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Message::Connect(info) => serde_json::to_value(info),
            Message::Authenticate { token } => serde_json::to_value(AuthenticatePayload {
                token: token.clone(),
            }),
            Message::Authenticated { user_id } => serde_json::to_value(AuthenticatedPayload {
                user_id: user_id.clone(),
            }),
            Message::AuthenticationFailed { reason } => {
                serde_json::to_value(AuthenticationFailedPayload {
                    reason: reason.clone(),
                })
            }
            Message::Ping | Message::Pong => Ok(Value::Object(Default::default())),
            Message::Subscribe(topic) | Message::Unsubscribe(topic) => serde_json::to_value(topic),
            Message::TaskCreated(change)
            | Message::TaskUpdated(change)
            | Message::TaskDeleted(change) => serde_json::to_value(change),
            Message::WorkspaceUpdated(change) => serde_json::to_value(change),
            Message::UserTyping(change) => serde_json::to_value(change),
            Message::CursorPosition(cursor) => serde_json::to_value(cursor),
            Message::UserOnline(change) | Message::UserOffline(change) => {
                serde_json::to_value(change)
            }
            Message::Notification(note) => serde_json::to_value(note),
        }
    }

    /// Builds a typed message from a wire kind and payload.
    ///
    /// Returns `Ok(None)` for kinds this client does not know, so newer
    /// servers can introduce message kinds without breaking older clients.
    pub(crate) fn from_parts(kind: &str, payload: Value) -> Result<Option<Self>, serde_json::Error> {
        let message = match kind {
            "connect" => Message::Connect(parse_or_default(payload)?),
            "authenticate" => {
                let body: AuthenticatePayload = serde_json::from_value(payload)?;
                Message::Authenticate { token: body.token }
            }
            "authenticated" => {
                let body: AuthenticatedPayload = parse_or_default_with(payload, || {
                    AuthenticatedPayload { user_id: None }
                })?;
                Message::Authenticated {
                    user_id: body.user_id,
                }
            }
            "authentication_failed" => {
                let body = parse_or_default_with(payload, || AuthenticationFailedPayload {
                    reason: String::new(),
                })?;
                Message::AuthenticationFailed {
                    reason: body.reason,
                }
            }
            "ping" => Message::Ping,
            "pong" => Message::Pong,
            "subscribe" => Message::Subscribe(serde_json::from_value(payload)?),
            "unsubscribe" => Message::Unsubscribe(serde_json::from_value(payload)?),
            "task_created" => Message::TaskCreated(serde_json::from_value(payload)?),
            "task_updated" => Message::TaskUpdated(serde_json::from_value(payload)?),
            "task_deleted" => Message::TaskDeleted(serde_json::from_value(payload)?),
            "workspace_updated" => Message::WorkspaceUpdated(serde_json::from_value(payload)?),
            "user_typing" => Message::UserTyping(serde_json::from_value(payload)?),
            "cursor_position" => Message::CursorPosition(serde_json::from_value(payload)?),
            "user_online" => Message::UserOnline(parse_or_default_with(payload, empty_presence)?),
            "user_offline" => {
                Message::UserOffline(parse_or_default_with(payload, empty_presence)?)
            }
            "notification" => Message::Notification(serde_json::from_value(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

fn empty_presence() -> PresenceChange {
    PresenceChange {
        user_id: None,
        last_seen: None,
    }
}

fn parse_or_default<T: DeserializeOwned + Default>(payload: Value) -> Result<T, serde_json::Error> {
    parse_or_default_with(payload, T::default)
}

fn parse_or_default_with<T: DeserializeOwned>(
    payload: Value,
    default: impl FnOnce() -> T,
) -> Result<T, serde_json::Error> {
    if payload.is_null() {
        Ok(default())
    } else {
        serde_json::from_value(payload)
    }
}
