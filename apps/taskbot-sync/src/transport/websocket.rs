use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};
use url::Url;

use super::{Connector, Transport, TransportError, TransportEvent};

/// How long `close` waits for the close frame to be written.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Opens real websocket connections via tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, TransportError> {
        let (ws_stream, response) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        debug!(
            target = "taskbot.sync.transport",
            url = %url,
            status = %response.status(),
            "websocket opened"
        );

        let (tx_out, rx_out) = mpsc::unbounded_channel::<Outbound>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<TransportEvent>();
        let task = tokio::spawn(pump(ws_stream, rx_out, tx_in));

        Ok(Box::new(WebSocketTransport {
            tx_out,
            rx_in,
            task: Some(task),
        }))
    }
}

enum Outbound {
    Text(String),
    Close,
}

pub struct WebSocketTransport {
    tx_out: mpsc::UnboundedSender<Outbound>,
    rx_in: mpsc::UnboundedReceiver<TransportEvent>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.tx_out
            .send(Outbound::Text(frame))
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> TransportEvent {
        self.rx_in.recv().await.unwrap_or(TransportEvent::Closed {
            code: None,
            reason: "socket task ended".into(),
        })
    }

    async fn close(&mut self) {
        let _ = self.tx_out.send(Outbound::Close);
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                debug!(target = "taskbot.sync.transport", "close handshake timed out");
                task.abort();
            }
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Moves frames between the socket and the transport's channels until
/// either side goes away.
async fn pump(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<Outbound>,
    tx_in: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            outbound = rx_out.recv() => match outbound {
                Some(Outbound::Text(text)) => {
                    if let Err(err) = ws_sender.send(Message::Text(text)).await {
                        let _ = tx_in.send(TransportEvent::Closed {
                            code: None,
                            reason: err.to_string(),
                        });
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: Cow::Borrowed("client disconnect"),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    let _ = ws_sender.close().await;
                    break;
                }
            },
            inbound = ws_receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if tx_in.send(TransportEvent::Frame(text)).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        if tx_in.send(TransportEvent::Frame(text)).is_err() {
                            break;
                        }
                    }
                    Err(_) => trace!(target = "taskbot.sync.transport", "dropping non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => (None, "closed without frame".to_string()),
                    };
                    let _ = tx_in.send(TransportEvent::Closed { code, reason });
                    break;
                }
                // tungstenite answers pings on its own.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let _ = tx_in.send(TransportEvent::Closed {
                        code: None,
                        reason: err.to_string(),
                    });
                    break;
                }
                None => {
                    let _ = tx_in.send(TransportEvent::Closed {
                        code: None,
                        reason: "stream ended".into(),
                    });
                    break;
                }
            },
        }
    }
}
