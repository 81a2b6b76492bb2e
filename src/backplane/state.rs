//! Per-chat delivery state.
//!
//! Each field is a message id high-water mark and only moves forward through
//! [`ChatState::merge`]. Since `max` is idempotent, commutative and
//! associative, redelivered and reordered events converge to the same state.

use crate::envelope::StatusKind;
use crate::types::{ChatId, MessageId, UserId};

/// A chat as seen by one of its participants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatKey {
    pub owner: UserId,
    pub chat: ChatId,
}

impl ChatKey {
    pub fn new(owner: UserId, chat: ChatId) -> Self {
        Self { owner, chat }
    }

    /// Key of `owner`'s view of the chat with `other`.
    pub fn for_pair(owner: UserId, other: UserId) -> Self {
        Self::new(owner, ChatId::between(owner, other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatField {
    NewestMessage,
    Processed,
    OtherUserDelivered,
    OtherUserSeen,
}

impl ChatField {
    pub const ALL: [ChatField; 4] = [
        ChatField::NewestMessage,
        ChatField::Processed,
        ChatField::OtherUserDelivered,
        ChatField::OtherUserSeen,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatField::NewestMessage => "newest_message",
            ChatField::Processed => "processed",
            ChatField::OtherUserDelivered => "other_user_delivered",
            ChatField::OtherUserSeen => "other_user_seen",
        }
    }
}

impl From<StatusKind> for ChatField {
    fn from(status: StatusKind) -> Self {
        match status {
            StatusKind::Processed => ChatField::Processed,
            StatusKind::Delivered => ChatField::OtherUserDelivered,
            StatusKind::Seen => ChatField::OtherUserSeen,
        }
    }
}

/// Delivery state of one chat for one owner. Absent fields are
/// [`MessageId::NONE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChatState {
    pub newest_message: MessageId,
    pub processed: MessageId,
    pub other_user_delivered: MessageId,
    pub other_user_seen: MessageId,
}

impl ChatState {
    pub fn get(&self, field: ChatField) -> MessageId {
        match field {
            ChatField::NewestMessage => self.newest_message,
            ChatField::Processed => self.processed,
            ChatField::OtherUserDelivered => self.other_user_delivered,
            ChatField::OtherUserSeen => self.other_user_seen,
        }
    }

    fn slot(&mut self, field: ChatField) -> &mut MessageId {
        match field {
            ChatField::NewestMessage => &mut self.newest_message,
            ChatField::Processed => &mut self.processed,
            ChatField::OtherUserDelivered => &mut self.other_user_delivered,
            ChatField::OtherUserSeen => &mut self.other_user_seen,
        }
    }

    /// `field = max(field, incoming)`. Returns true if the field advanced.
    pub fn merge(&mut self, field: ChatField, incoming: MessageId) -> bool {
        let slot = self.slot(field);
        if incoming > *slot {
            *slot = incoming;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_only_advances() {
        let mut state = ChatState::default();
        assert!(state.merge(ChatField::OtherUserDelivered, MessageId(70)));
        assert!(!state.merge(ChatField::OtherUserDelivered, MessageId(50)));
        assert_eq!(state.other_user_delivered, MessageId(70));
    }

    #[test]
    fn test_merge_same_value_is_noop() {
        let mut state = ChatState::default();
        state.merge(ChatField::Processed, MessageId(100));
        let before = state;
        assert!(!state.merge(ChatField::Processed, MessageId(100)));
        assert_eq!(state, before);
    }

    #[test]
    fn test_fields_are_independent() {
        let mut state = ChatState::default();
        state.merge(ChatField::Processed, MessageId(100));
        state.merge(ChatField::OtherUserDelivered, MessageId(90));
        assert_eq!(state.processed, MessageId(100));
        assert_eq!(state.other_user_delivered, MessageId(90));
        assert_eq!(state.other_user_seen, MessageId::NONE);
        assert_eq!(state.newest_message, MessageId::NONE);
    }

    #[test]
    fn test_status_maps_to_field() {
        assert_eq!(ChatField::from(StatusKind::Processed), ChatField::Processed);
        assert_eq!(ChatField::from(StatusKind::Delivered), ChatField::OtherUserDelivered);
        assert_eq!(ChatField::from(StatusKind::Seen), ChatField::OtherUserSeen);
    }

    #[test]
    fn test_chat_key_for_pair_shares_chat_id() {
        let a = ChatKey::for_pair(UserId(1), UserId(2));
        let b = ChatKey::for_pair(UserId(2), UserId(1));
        assert_eq!(a.chat, b.chat);
        assert_ne!(a, b);
    }
}
