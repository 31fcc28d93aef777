//! Scriptable in-memory transport for tests and local development.
//!
//! [`MockConnector`] hands out a [`MockPeer`] for every accepted connection:
//! the peer side sees every frame the client wrote and can push frames back
//! or drop the socket to simulate network loss.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use taskbot_proto::{Envelope, Inbound};
use tokio::sync::{Notify, mpsc};
use url::Url;

use super::{Connector, Transport, TransportError, TransportEvent};

/// How the next `connect` call should behave.
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    Accept,
    Refuse(String),
    /// Never resolves; exercises the connect timeout.
    Hang,
}

#[derive(Default)]
struct ConnectorState {
    script: VecDeque<ConnectOutcome>,
    attempts: Vec<Url>,
}

#[derive(Clone)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
    peers_tx: mpsc::UnboundedSender<MockPeer>,
    peers_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MockPeer>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(ConnectorState::default())),
            peers_tx,
            peers_rx: Arc::new(tokio::sync::Mutex::new(peers_rx)),
        }
    }

    /// Queues outcomes for upcoming connects; once the script runs dry every
    /// connect is accepted.
    pub fn script(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.state.lock().script.extend(outcomes);
    }

    /// URLs of every connect attempt so far, accepted or not.
    pub fn attempts(&self) -> Vec<Url> {
        self.state.lock().attempts.clone()
    }

    /// Waits for the next accepted connection.
    pub async fn next_peer(&self) -> MockPeer {
        let mut rx = self.peers_rx.lock().await;
        match rx.recv().await {
            Some(peer) => peer,
            // The connector holds a sender, so the channel cannot close.
            None => unreachable!("mock connector peer channel closed"),
        }
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, TransportError> {
        let outcome = {
            let mut state = self.state.lock();
            state.attempts.push(url.clone());
            state.script.pop_front().unwrap_or(ConnectOutcome::Accept)
        };
        match outcome {
            ConnectOutcome::Accept => {
                let (transport, peer) = pair();
                let _ = self.peers_tx.send(peer);
                Ok(Box::new(transport))
            }
            ConnectOutcome::Refuse(reason) => Err(TransportError::Connect(reason)),
            ConnectOutcome::Hang => std::future::pending().await,
        }
    }
}

#[derive(Default)]
struct Wire {
    sent: Vec<String>,
    closed_by_client: bool,
}

struct Shared {
    wire: Mutex<Wire>,
    changed: Notify,
}

fn pair() -> (MockTransport, MockPeer) {
    let shared = Arc::new(Shared {
        wire: Mutex::new(Wire::default()),
        changed: Notify::new(),
    });
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MockTransport {
            shared: Arc::clone(&shared),
            inbound: rx,
        },
        MockPeer { shared, inbound: tx },
    )
}

pub struct MockTransport {
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl Transport for MockTransport {
    fn send(&mut self, frame: String) -> Result<(), TransportError> {
        {
            let mut wire = self.shared.wire.lock();
            if wire.closed_by_client {
                return Err(TransportError::Closed);
            }
            wire.sent.push(frame);
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn recv(&mut self) -> TransportEvent {
        self.inbound.recv().await.unwrap_or(TransportEvent::Closed {
            code: Some(1006),
            reason: "peer dropped".into(),
        })
    }

    async fn close(&mut self) {
        self.shared.wire.lock().closed_by_client = true;
        self.shared.changed.notify_waiters();
    }
}

/// Server side of one mock connection.
#[derive(Clone)]
pub struct MockPeer {
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
}

impl MockPeer {
    /// Raw frames the client has written, in order.
    pub fn sent(&self) -> Vec<String> {
        self.shared.wire.lock().sent.clone()
    }

    /// Decoded envelopes the client has written, in order.
    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        self.sent()
            .iter()
            .filter_map(|frame| match Envelope::decode(frame) {
                Ok(Inbound::Envelope(envelope)) => Some(envelope),
                _ => None,
            })
            .collect()
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent_envelopes().iter().map(Envelope::kind).collect()
    }

    pub fn closed_by_client(&self) -> bool {
        self.shared.wire.lock().closed_by_client
    }

    /// Resolves once the client has written at least `count` frames.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<String> {
        loop {
            let notified = self.shared.changed.notified();
            {
                let wire = self.shared.wire.lock();
                if wire.sent.len() >= count {
                    return wire.sent.clone();
                }
            }
            notified.await;
        }
    }

    /// Resolves once the client has closed the socket.
    pub async fn wait_for_close(&self) {
        loop {
            let notified = self.shared.changed.notified();
            if self.closed_by_client() {
                return;
            }
            notified.await;
        }
    }

    pub fn push(&self, envelope: &Envelope) {
        match envelope.encode() {
            Ok(frame) => self.push_raw(frame),
            Err(err) => panic!("mock peer failed to encode envelope: {err}"),
        }
    }

    pub fn push_raw(&self, frame: impl Into<String>) {
        let _ = self.inbound.send(TransportEvent::Frame(frame.into()));
    }

    /// Ends the socket abnormally, as a network drop would.
    pub fn drop_connection(&self) {
        let _ = self.inbound.send(TransportEvent::Closed {
            code: Some(1006),
            reason: "abnormal closure".into(),
        });
    }
}
