use async_trait::async_trait;
use thiserror::Error;
use url::Url;

pub mod mock;
pub mod websocket;

pub use websocket::WebSocketConnector;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("failed to open socket: {0}")]
    Connect(String),
    #[error("timed out opening socket after {0:?}")]
    Timeout(std::time::Duration),
    #[error("socket closed")]
    Closed,
    #[error("connection lost: {0}")]
    Lost(String),
}

/// Something that happened on an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    /// The peer or the network ended the socket. Close codes are kept for
    /// logging only; every close we did not ask for is treated alike.
    Closed { code: Option<u16>, reason: String },
}

/// One open socket.
#[async_trait]
pub trait Transport: Send {
    /// Hands a text frame to the socket writer without waiting for it.
    fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Next inbound event. Must be cancel safe: dropping the future before
    /// it completes may not lose an event.
    async fn recv(&mut self) -> TransportEvent;

    /// Closes the socket from our side with a normal close code.
    async fn close(&mut self);
}

/// Opens sockets. Injected into the connection driver so tests can script
/// accept, refuse and drop behaviour.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, TransportError>;
}
