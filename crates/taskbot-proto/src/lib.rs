//! Shared wire definitions for the TaskBot real-time channel.
//!
//! Every frame on the socket is a JSON text message of the shape
//! `{ kind, payload, timestamp, userId?, requestId? }`. Keeping the
//! envelope in a dedicated crate lets the server side and test harnesses
//! speak the same protocol without pulling in the client runtime.

mod envelope;
mod ids;
mod message;
mod time;
mod topic;

pub use envelope::{Envelope, Inbound};
pub use message::{
    ConnectInfo, CursorPosition, Message, NotificationPayload, PresenceChange, TaskChange,
    TypingChange, WorkspaceChange,
};
pub use topic::{Topic, TopicKind};

use thiserror::Error;

/// Errors raised while encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("invalid payload for `{kind}`: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("invalid topic `{0}` (expected task:<id> or workspace:<id>)")]
    InvalidTopic(String),
}

pub type ProtoResult<T> = Result<T, ProtoError>;
