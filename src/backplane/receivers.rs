//! Live delivery of consumed envelopes to connected sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

use super::consumer::EnvelopeProcessor;
use super::router::SendersRouter;
use crate::envelope::{AckEnvelope, Envelope, StatusKind};
use crate::error::Result;
use crate::metrics;
use crate::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    NoSession,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::NoSession => "no_session",
        }
    }
}

/// The push transport that clients are connected to.
pub trait SessionSink: Send + Sync {
    /// Push `envelope` to every session `user` has on this instance.
    fn deliver_to_session(&self, user: UserId, envelope: &Envelope) -> DeliveryOutcome;
}

pub type SessionId = u64;

/// Sessions connected to this instance, each fed through an unbounded channel.
///
/// A user may hold several sessions, one per connected client.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<UserId, HashMap<SessionId, mpsc::UnboundedSender<Envelope>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, user: UserId) -> (SessionId, mpsc::UnboundedReceiver<Envelope>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.entry(user).or_default().insert(id, tx);
        (id, rx)
    }

    pub fn disconnect(&self, user: UserId, session: SessionId) {
        self.sessions.remove_if_mut(&user, |_, sessions| {
            sessions.remove(&session);
            sessions.is_empty()
        });
    }

    pub fn session_count(&self, user: UserId) -> usize {
        self.sessions.get(&user).map(|s| s.len()).unwrap_or(0)
    }
}

impl SessionSink for SessionRegistry {
    fn deliver_to_session(&self, user: UserId, envelope: &Envelope) -> DeliveryOutcome {
        let Some(mut sessions) = self.sessions.get_mut(&user) else {
            return DeliveryOutcome::NoSession;
        };
        // Receivers dropped without a disconnect are pruned here.
        sessions.retain(|_, tx| tx.send(envelope.clone()).is_ok());
        if sessions.is_empty() {
            DeliveryOutcome::NoSession
        } else {
            DeliveryOutcome::Delivered
        }
    }
}

/// Processor of the receivers loop.
///
/// Every envelope goes to its recipient's sessions. A message that reached a
/// session is acknowledged as delivered; with no session it is only dropped
/// from live delivery, since history is kept elsewhere.
pub struct ReceiversProcessor {
    sessions: Arc<dyn SessionSink>,
    router: Arc<SendersRouter>,
}

impl ReceiversProcessor {
    pub fn new(sessions: Arc<dyn SessionSink>, router: Arc<SendersRouter>) -> Self {
        Self { sessions, router }
    }
}

impl EnvelopeProcessor for ReceiversProcessor {
    fn process(&mut self, envelope: &Envelope) -> Result<()> {
        let recipient = envelope.recipient();
        let outcome = self.sessions.deliver_to_session(recipient, envelope);
        metrics::record_session_delivery(outcome.as_str());
        trace!(
            recipient = recipient.value(),
            message_id = envelope.message_id().value(),
            kind = envelope.kind_name(),
            outcome = outcome.as_str(),
            "Forwarded envelope"
        );

        if let (DeliveryOutcome::Delivered, Envelope::Message(message)) = (outcome, envelope) {
            self.router
                .route_ack(AckEnvelope::for_message(message, StatusKind::Delivered));
        }
        Ok(())
    }
}
