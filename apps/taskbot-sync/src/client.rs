//! The sync client facade.
//!
//! A [`SyncClient`] is built once per session and owns the connection
//! driver. Inbound traffic fans out to the cache coordinator, the presence
//! overlay and the event bus; UI consumers hold [`SubscriptionGuard`]s and
//! listen on the bus.

use std::sync::Arc;

use parking_lot::RwLock;
use taskbot_bus::{Bus, BusReceiver, LocalBus};
use taskbot_proto::{Envelope, Message, NotificationPayload, Topic};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::{CacheCoordinator, CacheKey, LoggingQueryCache, QueryCache};
use crate::config::{SyncConfig, normalize_url};
use crate::connection::{
    ConnectionHandle, ConnectionState, ConnectionStatus, DriverSettings, DriverStats, InboundSink,
};
use crate::error::SyncResult;
use crate::presence::{PresenceOverlay, PresenceUpdate, TypingNotifier};
use crate::transport::{Connector, WebSocketConnector};

pub const CONNECTION_TOPIC: &str = "taskbot.sync.connection";
pub const ENTITY_TOPIC: &str = "taskbot.sync.entity";
pub const PRESENCE_TOPIC: &str = "taskbot.sync.presence";
pub const NOTIFICATION_TOPIC: &str = "taskbot.sync.notification";

/// What the client publishes on its event bus.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connection(ConnectionStatus),
    /// A task or workspace changed; `keys` were invalidated.
    Entity {
        message: Message,
        keys: Vec<CacheKey>,
    },
    Presence(PresenceUpdate),
    Notification(NotificationPayload),
}

impl SyncEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            SyncEvent::Connection(_) => CONNECTION_TOPIC,
            SyncEvent::Entity { .. } => ENTITY_TOPIC,
            SyncEvent::Presence(_) => PRESENCE_TOPIC,
            SyncEvent::Notification(_) => NOTIFICATION_TOPIC,
        }
    }
}

struct ClientSink {
    coordinator: CacheCoordinator,
    presence: Arc<RwLock<PresenceOverlay>>,
    bus: Arc<dyn Bus<SyncEvent>>,
}

impl ClientSink {
    fn publish(&self, event: SyncEvent) {
        let topic = event.topic();
        let listeners = self.bus.publish(topic, event);
        debug!(target = "taskbot.sync.client", topic, listeners, "event published");
    }
}

impl InboundSink for ClientSink {
    fn deliver(&self, envelope: &Envelope) {
        match &envelope.message {
            Message::TaskCreated(_)
            | Message::TaskUpdated(_)
            | Message::TaskDeleted(_)
            | Message::WorkspaceUpdated(_) => {
                let keys = self.coordinator.apply(&envelope.message);
                self.publish(SyncEvent::Entity {
                    message: envelope.message.clone(),
                    keys,
                });
            }
            Message::UserOnline(_)
            | Message::UserOffline(_)
            | Message::UserTyping(_)
            | Message::CursorPosition(_) => {
                let update = self.presence.write().apply(envelope);
                if let Some(update) = update {
                    self.publish(SyncEvent::Presence(update));
                }
            }
            Message::Notification(payload) => {
                self.publish(SyncEvent::Notification(payload.clone()));
            }
            _ => {}
        }
    }

    // Presence only describes the current socket; anything learned on a
    // previous one is stale.
    fn status_changed(&self, status: &ConnectionStatus) {
        self.presence.write().reset();
        self.publish(SyncEvent::Connection(status.clone()));
    }
}

pub struct SyncClientBuilder {
    config: SyncConfig,
    connector: Option<Arc<dyn Connector>>,
    cache: Option<Arc<dyn QueryCache>>,
    bus: Option<Arc<dyn Bus<SyncEvent>>>,
}

impl SyncClientBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn Bus<SyncEvent>>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Spawns the connection driver. Must be called inside a tokio runtime.
    pub fn build(self) -> SyncClient {
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector::new()) as Arc<dyn Connector>);
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(LoggingQueryCache) as Arc<dyn QueryCache>);
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(LocalBus::<SyncEvent>::new()) as Arc<dyn Bus<SyncEvent>>);
        let presence = Arc::new(RwLock::new(PresenceOverlay::with_typing_idle(
            self.config.typing_idle,
        )));

        let sink = Arc::new(ClientSink {
            coordinator: CacheCoordinator::new(cache, self.config.refetch_on_change),
            presence: Arc::clone(&presence),
            bus: Arc::clone(&bus),
        });
        let (connection, driver) =
            ConnectionHandle::spawn(connector, DriverSettings::from(&self.config), sink);

        SyncClient {
            config: self.config,
            connection,
            driver: Some(driver),
            presence,
            bus,
        }
    }
}

pub struct SyncClient {
    config: SyncConfig,
    connection: ConnectionHandle,
    driver: Option<JoinHandle<()>>,
    presence: Arc<RwLock<PresenceOverlay>>,
    bus: Arc<dyn Bus<SyncEvent>>,
}

impl SyncClient {
    pub fn builder(config: SyncConfig) -> SyncClientBuilder {
        SyncClientBuilder {
            config,
            connector: None,
            cache: None,
            bus: None,
        }
    }

    /// Client with the real websocket connector and the given cache.
    pub fn new(config: SyncConfig, cache: Arc<dyn QueryCache>) -> Self {
        Self::builder(config).cache(cache).build()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Connects to `url`, or to the configured URL when `None`.
    pub async fn connect(&self, url: Option<&str>, token: Option<String>) -> SyncResult<()> {
        let url = normalize_url(url.unwrap_or(&self.config.url))?;
        self.connection.connect(url, token).await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn send(&self, envelope: impl Into<Envelope>) {
        self.connection.send(envelope);
    }

    /// Registers interest in `topic` until the guard is dropped.
    pub fn subscribe(&self, topic: Topic) -> SubscriptionGuard {
        self.connection.subscribe(topic.clone());
        SubscriptionGuard {
            connection: self.connection.clone(),
            topic: Some(topic),
        }
    }

    pub fn subscribe_task(&self, task_id: impl Into<String>) -> SubscriptionGuard {
        self.subscribe(Topic::task(task_id))
    }

    pub fn subscribe_workspace(&self, workspace_id: impl Into<String>) -> SubscriptionGuard {
        self.subscribe(Topic::workspace(workspace_id))
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.connection.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.watch()
    }

    pub async fn wait_for(&self, state: ConnectionState) -> SyncResult<ConnectionStatus> {
        self.connection.wait_for(state).await
    }

    pub async fn stats(&self) -> SyncResult<DriverStats> {
        self.connection.stats().await
    }

    /// Read access to the presence overlay.
    pub fn presence<R>(&self, read: impl FnOnce(&PresenceOverlay) -> R) -> R {
        read(&self.presence.read())
    }

    pub fn typing_notifier(&self, task_id: Option<String>) -> TypingNotifier {
        TypingNotifier::spawn(self.connection.clone(), task_id, self.config.typing_idle)
    }

    pub fn events(&self, topic: &str) -> BusReceiver<SyncEvent> {
        self.bus.subscribe(topic)
    }

    pub fn all_events(&self) -> BusReceiver<SyncEvent> {
        self.bus.subscribe_all()
    }

    /// Disconnects and waits for the driver task to exit.
    pub async fn shutdown(mut self) {
        self.connection.shutdown();
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if self.driver.is_some() {
            self.connection.shutdown();
        }
    }
}

/// Keeps a topic subscribed while alive.
#[must_use = "dropping the guard unsubscribes immediately"]
pub struct SubscriptionGuard {
    connection: ConnectionHandle,
    topic: Option<Topic>,
}

impl SubscriptionGuard {
    pub fn topic(&self) -> Option<&Topic> {
        self.topic.as_ref()
    }

    /// Unsubscribes now instead of at drop.
    pub fn release(mut self) {
        self.unsubscribe();
    }

    fn unsubscribe(&mut self) {
        if let Some(topic) = self.topic.take() {
            self.connection.unsubscribe(topic);
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
