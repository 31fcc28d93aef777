use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("server rejected authentication: {0}")]
    AuthenticationRejected(String),
    #[error("gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),
    #[error("no pong within {0:?}")]
    HeartbeatTimeout(std::time::Duration),
    #[error("connect cancelled by disconnect")]
    Cancelled,
    #[error("sync driver has shut down")]
    DriverGone,
}

pub type SyncResult<T> = Result<T, SyncError>;
