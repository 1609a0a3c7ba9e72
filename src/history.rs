//! the canonical, model-facing message history of one session.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bevy::log::debug;
use serde::{Deserialize, Serialize};

use crate::ConversationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// one entry of the history sent to the model. immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub role: Role,
    pub content: String,
}

impl ServerMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    message: ServerMessage,
    /// durable entries stay for the rest of the session.
    durable: bool,
}

/// append-only store shared by a session's turns and background purchases.
///
/// every mutation happens under one lock, so concurrent writers never lose an
/// entry. a turn's entries become durable when the turn finalizes; until then
/// a failed turn can take its entry back out.
#[derive(Debug, Clone, Default)]
pub struct History {
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// snapshot of the current ordered list.
    pub fn get(&self) -> Vec<ServerMessage> {
        self.lock().iter().map(|e| e.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_durable(&self, index: usize) -> bool {
        self.lock().get(index).is_some_and(|e| e.durable)
    }

    /// appends one pending entry and returns its index.
    pub fn append(&self, message: ServerMessage) -> usize {
        let mut entries = self.lock();
        entries.push(Entry { message, durable: false });
        entries.len() - 1
    }

    /// appends one entry that is durable right away, leaving other pending
    /// entries alone.
    pub fn record(&self, message: ServerMessage) -> usize {
        let mut entries = self.lock();
        debug!(target: "bevy_stockbot", "history record: role={:?} len={}", message.role, message.content.len());
        entries.push(Entry { message, durable: true });
        entries.len() - 1
    }

    /// applies `updater` to the whole list in one step and makes every entry
    /// durable.
    ///
    /// the updater may only add entries at the end; anything else is rejected
    /// and nothing is applied.
    pub fn finalize<F>(&self, updater: F) -> Result<(), ConversationError>
    where
        F: FnOnce(Vec<ServerMessage>) -> Vec<ServerMessage>,
    {
        let mut entries = self.lock();
        let before: Vec<ServerMessage> = entries.iter().map(|e| e.message.clone()).collect();
        let after = updater(before.clone());
        if !after.starts_with(&before) {
            return Err(ConversationError::HistoryRewrite);
        }
        *entries = after
            .into_iter()
            .map(|message| Entry { message, durable: true })
            .collect();
        debug!(target: "bevy_stockbot", "history finalized: len={}", entries.len());
        Ok(())
    }

    /// removes a pending entry appended by a turn that then failed.
    ///
    /// returns `false` if the entry is durable or is not the one expected.
    pub fn retract(&self, index: usize, expected: &ServerMessage) -> bool {
        let mut entries = self.lock();
        match entries.get(index) {
            Some(entry) if !entry.durable && entry.message == *expected => {
                entries.remove(index);
                true
            }
            _ => false,
        }
    }
}
