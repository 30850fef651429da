//! In-memory conversations, hydrated once from the history store.
//!
//! Appends are the only mutation. Every flush writes a snapshot taken while
//! holding the flush lock, so the file never regresses to a state older than
//! an append that completed before the flush began.

use crate::history::HistoryStore;
use crate::message::{Message, Role, Snapshot};
use briggie_common::error::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Per-user message lists shared by every request of the process.
pub struct ConversationSession {
    conversations: RwLock<HashMap<String, Vec<Message>>>,
    store: Arc<dyn HistoryStore>,
    flush_lock: Mutex<()>,
}

impl ConversationSession {
    /// Load every persisted conversation from `store`.
    pub async fn hydrate(store: Arc<dyn HistoryStore>) -> Self {
        let snapshot = store.load().await;
        Self {
            conversations: RwLock::new(snapshot.into_iter().collect()),
            store,
            flush_lock: Mutex::new(()),
        }
    }

    /// Return the conversation for `user_id`, creating an empty one on first sight.
    pub async fn ensure(&self, user_id: &str) -> Vec<Message> {
        if let Some(messages) = self.conversations.read().await.get(user_id) {
            return messages.clone();
        }

        self.conversations
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    /// Append `message` and return the conversation including it.
    pub async fn append(&self, user_id: &str, message: Message) -> Vec<Message> {
        let mut conversations = self.conversations.write().await;
        let messages = conversations.entry(user_id.to_string()).or_default();
        messages.push(message);
        messages.clone()
    }

    /// Append a user turn unless the conversation already ends with it.
    ///
    /// Clients record the turn through `POST /chat` and then send the same
    /// content to the streaming endpoint; the second submission is not
    /// recorded again. Returns the conversation and whether it changed.
    pub async fn append_user_turn(&self, user_id: &str, content: String) -> (Vec<Message>, bool) {
        let mut conversations = self.conversations.write().await;
        let messages = conversations.entry(user_id.to_string()).or_default();

        let recorded = matches!(
            messages.last(),
            Some(last) if last.role == Role::User && last.content == content
        );
        if !recorded {
            messages.push(Message::user(content));
        }
        (messages.clone(), !recorded)
    }

    /// Copy of every conversation.
    pub async fn snapshot(&self) -> Snapshot {
        self.conversations
            .read()
            .await
            .iter()
            .map(|(user, messages)| (user.clone(), messages.clone()))
            .collect()
    }

    /// Persist the current snapshot.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        let snapshot = self.snapshot().await;
        self.store.save(&snapshot).await
    }
}
