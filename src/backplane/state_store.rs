//! Durable chat state store boundary.
//!
//! The two state loops run in parallel and may update the same chat key at
//! the same time, so implementations must apply
//! [`merge_and_persist`](ChatStateStore::merge_and_persist) as one atomic
//! read-modify-write per key.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::state::{ChatField, ChatKey, ChatState};
use crate::error::{Error, Result};
use crate::types::{ChatId, MessageId, UserId};

/// One chat of a user, as returned by [`ChatStateStore::chats_newer_than`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserChat {
    pub chat: ChatId,
    pub state: ChatState,
}

pub trait ChatStateStore: Send + Sync {
    fn load_state(&self, key: &ChatKey) -> Result<Option<ChatState>>;

    /// Atomically apply `field = max(field, message_id)` for `key`, creating
    /// the state if absent, and return the state after the merge.
    fn merge_and_persist(
        &self,
        key: &ChatKey,
        field: ChatField,
        message_id: MessageId,
    ) -> Result<ChatState>;

    /// `user`'s chats whose newest message was created after `newer_than`.
    fn chats_newer_than(&self, user: UserId, newer_than: DateTime<Utc>) -> Result<Vec<UserChat>>;
}

/// [`ChatStateStore`] kept in a [`DashMap`].
///
/// A merge holds the shard lock of its key for the whole read-modify-write.
#[derive(Debug, Default)]
pub struct MemoryChatStateStore {
    states: DashMap<ChatKey, ChatState>,
    failing_writes: AtomicUsize,
}

impl MemoryChatStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` merges fail with a storage error.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl ChatStateStore for MemoryChatStateStore {
    fn load_state(&self, key: &ChatKey) -> Result<Option<ChatState>> {
        Ok(self.states.get(key).map(|state| *state))
    }

    fn merge_and_persist(
        &self,
        key: &ChatKey,
        field: ChatField,
        message_id: MessageId,
    ) -> Result<ChatState> {
        if self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Storage(format!(
                "injected write failure for {} {}",
                key.owner, key.chat
            )));
        }

        let mut entry = self.states.entry(key.clone()).or_default();
        entry.merge(field, message_id);
        Ok(*entry)
    }

    fn chats_newer_than(&self, user: UserId, newer_than: DateTime<Utc>) -> Result<Vec<UserChat>> {
        let floor = MessageId::floor_at(newer_than);
        let mut chats: Vec<UserChat> = self
            .states
            .iter()
            .filter(|e| e.key().owner == user && e.value().newest_message > floor)
            .map(|e| UserChat {
                chat: e.key().chat.clone(),
                state: *e.value(),
            })
            .collect();
        chats.sort_by(|a, b| b.state.newest_message.cmp(&a.state.newest_message));
        Ok(chats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_merge_creates_lazily() {
        let store = MemoryChatStateStore::new();
        let key = ChatKey::for_pair(UserId(1), UserId(2));
        assert_eq!(store.load_state(&key).unwrap(), None);

        let state = store
            .merge_and_persist(&key, ChatField::Processed, MessageId(100))
            .unwrap();
        assert_eq!(state.processed, MessageId(100));
        assert_eq!(store.load_state(&key).unwrap(), Some(state));
    }

    #[test]
    fn test_injected_failure_leaves_state_untouched() {
        let store = MemoryChatStateStore::new();
        let key = ChatKey::for_pair(UserId(1), UserId(2));
        store.fail_next_writes(1);
        assert!(matches!(
            store.merge_and_persist(&key, ChatField::Processed, MessageId(1)),
            Err(Error::Storage(_))
        ));
        assert!(store.is_empty());
        assert!(store
            .merge_and_persist(&key, ChatField::Processed, MessageId(1))
            .is_ok());
    }

    #[test]
    fn test_concurrent_merges_on_same_key() {
        let store = Arc::new(MemoryChatStateStore::new());
        let key = ChatKey::for_pair(UserId(1), UserId(2));

        let handles: Vec<_> = [ChatField::Processed, ChatField::OtherUserDelivered]
            .into_iter()
            .map(|field| {
                let store = Arc::clone(&store);
                let key = key.clone();
                thread::spawn(move || {
                    for id in 1..=1_000 {
                        store.merge_and_persist(&key, field, MessageId(id)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let state = store.load_state(&key).unwrap().unwrap();
        assert_eq!(state.processed, MessageId(1_000));
        assert_eq!(state.other_user_delivered, MessageId(1_000));
    }

    #[test]
    fn test_chats_newer_than() {
        let store = MemoryChatStateStore::new();
        let old = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let cutoff = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        let old_key = ChatKey::for_pair(UserId(1), UserId(2));
        let new_key = ChatKey::for_pair(UserId(1), UserId(3));
        let other_owner = ChatKey::for_pair(UserId(3), UserId(1));
        store
            .merge_and_persist(&old_key, ChatField::NewestMessage, MessageId::floor_at(old))
            .unwrap();
        store
            .merge_and_persist(&new_key, ChatField::NewestMessage, MessageId::floor_at(new))
            .unwrap();
        store
            .merge_and_persist(&other_owner, ChatField::NewestMessage, MessageId::floor_at(new))
            .unwrap();

        let chats = store.chats_newer_than(UserId(1), cutoff).unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].chat, new_key.chat);
    }
}
