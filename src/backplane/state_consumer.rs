//! Reconciliation of chat delivery state from both topics.
//!
//! Two loops feed the same store, one per topic. Rows are per owner:
//!
//! - sender topic, message: the sender's row gets `newest_message` and
//!   `processed`, since the companion copy is the processed record.
//! - messages topic, message: the receiver's row gets `newest_message`.
//! - any acknowledgement: the original sender's row gets the field of its
//!   status and `newest_message`.
//!
//! Every update is a max-merge, so the loops may run at different rates and
//! batches may be redelivered without affecting the result.

use std::sync::Arc;

use tracing::trace;

use super::consumer::EnvelopeProcessor;
use super::state::{ChatField, ChatKey};
use super::state_store::ChatStateStore;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::metrics;
use crate::types::MessageId;

/// Which topic a state loop consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSource {
    SenderTopic,
    MessagesTopic,
}

impl StateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateSource::SenderTopic => "state-sender",
            StateSource::MessagesTopic => "state-receiver",
        }
    }
}

pub struct StateProcessor {
    source: StateSource,
    store: Arc<dyn ChatStateStore>,
}

impl StateProcessor {
    pub fn new(source: StateSource, store: Arc<dyn ChatStateStore>) -> Self {
        Self { source, store }
    }

    pub fn source(&self) -> StateSource {
        self.source
    }

    /// Updates one envelope causes, in application order.
    pub fn updates(&self, envelope: &Envelope) -> Vec<(ChatKey, ChatField, MessageId)> {
        match envelope {
            Envelope::Message(m) => {
                let id = m.message_id;
                match self.source {
                    StateSource::SenderTopic => {
                        let key = ChatKey::for_pair(m.sender_id, m.receiver_id);
                        vec![
                            (key.clone(), ChatField::NewestMessage, id),
                            (key, ChatField::Processed, id),
                        ]
                    }
                    StateSource::MessagesTopic => vec![(
                        ChatKey::for_pair(m.receiver_id, m.sender_id),
                        ChatField::NewestMessage,
                        id,
                    )],
                }
            }
            Envelope::Ack(a) => {
                let key = ChatKey::for_pair(a.sender_id, a.receiver_id);
                vec![
                    (key.clone(), ChatField::from(a.status), a.message_id),
                    (key, ChatField::NewestMessage, a.message_id),
                ]
            }
        }
    }
}

impl EnvelopeProcessor for StateProcessor {
    fn process(&mut self, envelope: &Envelope) -> Result<()> {
        for (key, field, message_id) in self.updates(envelope) {
            let state = self.store.merge_and_persist(&key, field, message_id)?;
            metrics::record_state_merge(field.as_str());
            trace!(
                source = self.source.as_str(),
                owner = key.owner.value(),
                chat = %key.chat,
                field = field.as_str(),
                message_id = message_id.value(),
                current = state.get(field).value(),
                "Merged chat state"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::state_store::MemoryChatStateStore;
    use crate::envelope::{AckEnvelope, MessageEnvelope, StatusKind};
    use crate::types::UserId;

    fn message(id: i64) -> MessageEnvelope {
        MessageEnvelope::plain_text(MessageId(id), UserId(1), UserId(2), "hi")
    }

    #[test]
    fn test_sender_topic_message_marks_processed() {
        let store = Arc::new(MemoryChatStateStore::new());
        let mut processor = StateProcessor::new(StateSource::SenderTopic, store.clone());
        processor.process(&Envelope::Message(message(10))).unwrap();

        let state = store
            .load_state(&ChatKey::for_pair(UserId(1), UserId(2)))
            .unwrap()
            .unwrap();
        assert_eq!(state.newest_message, MessageId(10));
        assert_eq!(state.processed, MessageId(10));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_messages_topic_message_updates_receiver_row() {
        let store = Arc::new(MemoryChatStateStore::new());
        let mut processor = StateProcessor::new(StateSource::MessagesTopic, store.clone());
        processor.process(&Envelope::Message(message(10))).unwrap();

        let receiver = store
            .load_state(&ChatKey::for_pair(UserId(2), UserId(1)))
            .unwrap()
            .unwrap();
        assert_eq!(receiver.newest_message, MessageId(10));
        assert_eq!(receiver.processed, MessageId::NONE);
        assert_eq!(
            store
                .load_state(&ChatKey::for_pair(UserId(1), UserId(2)))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_ack_updates_original_sender_row() {
        let store = Arc::new(MemoryChatStateStore::new());
        let mut processor = StateProcessor::new(StateSource::MessagesTopic, store.clone());
        let ack = AckEnvelope::for_message(&message(10), StatusKind::Seen);
        processor.process(&Envelope::Ack(ack)).unwrap();

        let state = store
            .load_state(&ChatKey::for_pair(UserId(1), UserId(2)))
            .unwrap()
            .unwrap();
        assert_eq!(state.other_user_seen, MessageId(10));
        assert_eq!(state.other_user_delivered, MessageId::NONE);
    }

    #[test]
    fn test_storage_error_propagates() {
        let store = Arc::new(MemoryChatStateStore::new());
        store.fail_next_writes(1);
        let mut processor = StateProcessor::new(StateSource::SenderTopic, store);
        let err = processor.process(&Envelope::Message(message(10))).unwrap_err();
        assert!(err.is_retriable());
    }
}
