//! Ephemeral presence projection and the local typing notifier.
//!
//! Nothing here is authoritative. The overlay is rebuilt from pushes after
//! every (re)connect; a user we have not heard about is unknown, not
//! offline.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use taskbot_proto::{CursorPosition, Envelope, Message, TypingChange};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use crate::connection::{ConnectionHandle, sleep_until};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}

/// What a single presence envelope changed.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceUpdate {
    Status {
        user_id: String,
        record: PresenceRecord,
    },
    Typing {
        user_id: String,
        task_id: Option<String>,
        is_typing: bool,
    },
    Cursor {
        user_id: String,
        position: CursorPosition,
    },
}

/// Typing indicators lapse after this long without a refresh, so a lost
/// stop signal cannot leave one up.
pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub struct PresenceOverlay {
    users: HashMap<String, PresenceRecord>,
    /// Keyed by (user, task); the value is when the indicator was last refreshed.
    typing: HashMap<(String, Option<String>), Instant>,
    cursors: HashMap<String, CursorPosition>,
    typing_idle: Duration,
}

impl Default for PresenceOverlay {
    fn default() -> Self {
        Self::with_typing_idle(DEFAULT_TYPING_IDLE)
    }
}

impl PresenceOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_typing_idle(typing_idle: Duration) -> Self {
        Self {
            users: HashMap::new(),
            typing: HashMap::new(),
            cursors: HashMap::new(),
            typing_idle,
        }
    }

    /// Folds one envelope into the overlay. Returns `None` for envelopes
    /// that are not presence related or that name no user.
    pub fn apply(&mut self, envelope: &Envelope) -> Option<PresenceUpdate> {
        let origin = envelope.user_id.as_deref();
        match &envelope.message {
            Message::UserOnline(change) | Message::UserOffline(change) => {
                let user_id = change.user_id.as_deref().or(origin)?.to_string();
                let status = if matches!(envelope.message, Message::UserOnline(_)) {
                    PresenceStatus::Online
                } else {
                    self.clear_activity(&user_id);
                    PresenceStatus::Offline
                };
                let record = PresenceRecord {
                    status,
                    last_seen: change.last_seen.unwrap_or(envelope.timestamp),
                };
                self.users.insert(user_id.clone(), record.clone());
                Some(PresenceUpdate::Status { user_id, record })
            }
            Message::UserTyping(change) => {
                let user_id = change.user_id.as_deref().or(origin)?.to_string();
                let key = (user_id.clone(), change.task_id.clone());
                let now = Instant::now();
                self.prune_typing(now);
                if change.is_typing {
                    self.typing.insert(key, now);
                } else {
                    self.typing.remove(&key);
                }
                Some(PresenceUpdate::Typing {
                    user_id,
                    task_id: change.task_id.clone(),
                    is_typing: change.is_typing,
                })
            }
            Message::CursorPosition(position) => {
                let user_id = position.user_id.as_deref().or(origin)?.to_string();
                self.cursors.insert(user_id.clone(), position.clone());
                Some(PresenceUpdate::Cursor {
                    user_id,
                    position: position.clone(),
                })
            }
            _ => None,
        }
    }

    fn is_live(&self, refreshed: Instant, now: Instant) -> bool {
        now.saturating_duration_since(refreshed) < self.typing_idle
    }

    fn prune_typing(&mut self, now: Instant) {
        let idle = self.typing_idle;
        self.typing
            .retain(|_, refreshed| now.saturating_duration_since(*refreshed) < idle);
    }

    fn clear_activity(&mut self, user_id: &str) {
        self.typing.retain(|(user, _), _| user != user_id);
        self.cursors.remove(user_id);
    }

    pub fn reset(&mut self) {
        self.users.clear();
        self.typing.clear();
        self.cursors.clear();
    }

    /// `None` means unknown.
    pub fn status(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.users.get(user_id)
    }

    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .users
            .iter()
            .filter(|(_, record)| record.status == PresenceStatus::Online)
            .map(|(user, _)| user.clone())
            .collect();
        users.sort();
        users
    }

    /// Users currently typing in `task_id`, sorted. Indicators not refreshed
    /// within the idle period are treated as stopped.
    pub fn typing_in(&self, task_id: &str) -> Vec<String> {
        let now = Instant::now();
        let mut users: Vec<String> = self
            .typing
            .iter()
            .filter(|((_, task), refreshed)| {
                task.as_deref() == Some(task_id) && self.is_live(**refreshed, now)
            })
            .map(|((user, _), _)| user.clone())
            .collect();
        users.sort();
        users
    }

    pub fn cursor(&self, user_id: &str) -> Option<&CursorPosition> {
        self.cursors.get(user_id)
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.typing.is_empty() && self.cursors.is_empty()
    }
}

enum TypingCommand {
    Keystroke,
    Stop,
}

/// Emits `user_typing` start/stop envelopes for the local user.
///
/// The first keystroke announces typing; the stop goes out after `idle`
/// without keystrokes, on [`TypingNotifier::stop`], or when the notifier is
/// dropped.
pub struct TypingNotifier {
    commands: mpsc::UnboundedSender<TypingCommand>,
    task: JoinHandle<()>,
}

impl TypingNotifier {
    pub fn spawn(connection: ConnectionHandle, task_id: Option<String>, idle: Duration) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_typing(connection, task_id, idle, rx));
        Self { commands, task }
    }

    pub fn keystroke(&self) {
        let _ = self.commands.send(TypingCommand::Keystroke);
    }

    pub fn stop(&self) {
        let _ = self.commands.send(TypingCommand::Stop);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TypingNotifier {
    fn drop(&mut self) {
        // The task drains this before seeing the closed channel.
        let _ = self.commands.send(TypingCommand::Stop);
    }
}

async fn run_typing(
    connection: ConnectionHandle,
    task_id: Option<String>,
    idle: Duration,
    mut commands: mpsc::UnboundedReceiver<TypingCommand>,
) {
    let announce = |is_typing: bool| {
        trace!(target = "taskbot.sync.presence", task_id = ?task_id, is_typing, "typing");
        connection.send(Message::UserTyping(TypingChange {
            user_id: None,
            task_id: task_id.clone(),
            is_typing,
        }));
    };

    let mut idle_at: Option<Instant> = None;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(TypingCommand::Keystroke) => {
                    if idle_at.is_none() {
                        announce(true);
                    }
                    idle_at = Some(Instant::now() + idle);
                }
                Some(TypingCommand::Stop) => {
                    if idle_at.take().is_some() {
                        announce(false);
                    }
                }
                None => break,
            },
            _ = sleep_until(idle_at) => {
                idle_at = None;
                announce(false);
            }
        }
    }
}
