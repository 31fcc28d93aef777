//! Translates change notifications into query-cache invalidations.
//!
//! The cache itself belongs to the UI layer; this module only names keys
//! and tells the cache which ones went stale. Over-invalidation is fine,
//! under-invalidation is a stale screen.

use std::fmt;
use std::sync::Arc;

use taskbot_proto::Message;
use tracing::{debug, info};

use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    TaskList,
    Task(String),
    WorkspaceList,
    Workspace(String),
}

impl CacheKey {
    /// Segments in the shape the web client's query cache uses,
    /// e.g. `["tasks", "42"]`.
    pub fn segments(&self) -> Vec<&str> {
        match self {
            CacheKey::TaskList => vec!["tasks"],
            CacheKey::Task(id) => vec!["tasks", id],
            CacheKey::WorkspaceList => vec!["workspaces"],
            CacheKey::Workspace(id) => vec!["workspaces", id],
        }
    }

    fn label(&self) -> &'static str {
        match self {
            CacheKey::TaskList => "task_list",
            CacheKey::Task(_) => "task",
            CacheKey::WorkspaceList => "workspace_list",
            CacheKey::Workspace(_) => "workspace",
        }
    }

    fn is_detail(&self) -> bool {
        matches!(self, CacheKey::Task(_) | CacheKey::Workspace(_))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments().join("/"))
    }
}

/// The query cache as seen from the sync core.
pub trait QueryCache: Send + Sync {
    /// Marks the key stale; mounted readers refetch on their own.
    fn invalidate(&self, key: &CacheKey);

    /// Forces a refetch of the key now.
    fn refetch(&self, key: &CacheKey);
}

/// Cache that only logs. Used by the watcher binary, where nothing renders.
#[derive(Debug, Default)]
pub struct LoggingQueryCache;

impl QueryCache for LoggingQueryCache {
    fn invalidate(&self, key: &CacheKey) {
        info!(target = "taskbot.sync.cache", key = %key, "invalidate");
    }

    fn refetch(&self, key: &CacheKey) {
        info!(target = "taskbot.sync.cache", key = %key, "refetch");
    }
}

pub struct CacheCoordinator {
    cache: Arc<dyn QueryCache>,
    refetch: bool,
}

impl CacheCoordinator {
    pub fn new(cache: Arc<dyn QueryCache>, refetch: bool) -> Self {
        Self { cache, refetch }
    }

    /// Keys made stale by a message; empty for messages that change nothing.
    pub fn keys_for(message: &Message) -> Vec<CacheKey> {
        match message {
            Message::TaskCreated(change)
            | Message::TaskUpdated(change)
            | Message::TaskDeleted(change) => {
                let mut keys = vec![CacheKey::Task(change.task_id.clone()), CacheKey::TaskList];
                if let Some(workspace_id) = &change.workspace_id {
                    keys.push(CacheKey::Workspace(workspace_id.clone()));
                }
                keys
            }
            Message::WorkspaceUpdated(change) => vec![
                CacheKey::Workspace(change.workspace_id.clone()),
                CacheKey::WorkspaceList,
            ],
            _ => Vec::new(),
        }
    }

    /// Invalidates everything `message` touches and returns the keys.
    pub fn apply(&self, message: &Message) -> Vec<CacheKey> {
        let keys = Self::keys_for(message);
        if keys.is_empty() {
            return keys;
        }
        debug!(
            target = "taskbot.sync.cache",
            kind = message.kind(),
            keys = keys.len(),
            "invalidating"
        );
        for key in &keys {
            self.cache.invalidate(key);
            metrics::INVALIDATIONS.with_label_values(&[key.label()]).inc();
            if self.refetch && key.is_detail() {
                self.cache.refetch(key);
            }
        }
        keys
    }
}
