pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod metrics;
pub mod presence;
pub mod subscription;
pub mod telemetry;
pub mod transport;

pub use cache::{CacheCoordinator, CacheKey, LoggingQueryCache, QueryCache};
pub use client::{SubscriptionGuard, SyncClient, SyncClientBuilder, SyncEvent};
pub use config::SyncConfig;
pub use connection::{ConnectionHandle, ConnectionState, ConnectionStatus, InboundSink};
pub use error::{SyncError, SyncResult};
pub use presence::{PresenceOverlay, PresenceRecord, PresenceStatus, PresenceUpdate, TypingNotifier};
pub use taskbot_proto::{Envelope, Message, Topic, TopicKind};
