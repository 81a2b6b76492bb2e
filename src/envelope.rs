//! Envelopes exchanged over the broker.
//!
//! Every record on a backplane topic is one [`Envelope`]: either a user
//! message ([`MessageEnvelope`]) or a delivery-status transition
//! ([`AckEnvelope`]). Envelopes are immutable once created; the backplane only
//! reads the routing fields and treats message payloads as opaque bytes.
//!
//! # Wire format
//!
//! ```text
//! version      u8    (ENVELOPE_VERSION)
//! message_id   i64   big-endian
//! sender_id    i64   big-endian
//! receiver_id  i64   big-endian
//! kind         u8    PayloadType (1..) or StatusKind (16..)
//! payload      u32 length + bytes (empty for acknowledgements)
//! ```

use bytes::{Bytes, BytesMut};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use nombytes::NomBytes;

use crate::constants::{ENVELOPE_HEADER_SIZE, ENVELOPE_VERSION, MAX_PAYLOAD_SIZE};
use crate::encode::ToByte;
use crate::error::{Error, Result};
use crate::parser::parse_raw_envelope;
use crate::types::{MessageId, UserId};

/// Content type of a user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum PayloadType {
    PlainText = 1,
}

/// Delivery-status transition carried by an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum StatusKind {
    /// The backplane accepted the message from its sender.
    Processed = 16,
    /// The receiver's client got the message.
    Delivered = 17,
    /// The receiver opened the message.
    Seen = 18,
}

impl StatusKind {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Processed => "processed",
            StatusKind::Delivered => "delivered",
            StatusKind::Seen => "seen",
        }
    }
}

/// A user-originated message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub payload_type: PayloadType,
    pub payload: Bytes,
}

impl MessageEnvelope {
    pub fn plain_text(
        message_id: MessageId,
        sender_id: UserId,
        receiver_id: UserId,
        text: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            sender_id,
            receiver_id,
            payload_type: PayloadType::PlainText,
            payload: Bytes::from(text.into()),
        }
    }
}

/// A status transition for one message.
///
/// `sender_id` and `receiver_id` are those of the acknowledged message, so
/// the same chat is identified no matter which side produced the ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckEnvelope {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub status: StatusKind,
}

impl AckEnvelope {
    pub fn for_message(message: &MessageEnvelope, status: StatusKind) -> Self {
        Self {
            message_id: message.message_id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            status,
        }
    }
}

/// Unit of data published to and consumed from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Message(MessageEnvelope),
    Ack(AckEnvelope),
}

impl Envelope {
    pub fn message_id(&self) -> MessageId {
        match self {
            Envelope::Message(m) => m.message_id,
            Envelope::Ack(a) => a.message_id,
        }
    }

    pub fn sender_id(&self) -> UserId {
        match self {
            Envelope::Message(m) => m.sender_id,
            Envelope::Ack(a) => a.sender_id,
        }
    }

    pub fn receiver_id(&self) -> UserId {
        match self {
            Envelope::Message(m) => m.receiver_id,
            Envelope::Ack(a) => a.receiver_id,
        }
    }

    /// User this envelope is addressed to.
    ///
    /// Messages go to their receiver. Acknowledgements go back to the sender
    /// of the acknowledged message, who is the one waiting on its status.
    pub fn recipient(&self) -> UserId {
        match self {
            Envelope::Message(m) => m.receiver_id,
            Envelope::Ack(a) => a.sender_id,
        }
    }

    fn kind_byte(&self) -> u8 {
        match self {
            Envelope::Message(m) => m.payload_type as u8,
            Envelope::Ack(a) => a.status as u8,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Envelope::Message(m) => &m.payload,
            Envelope::Ack(_) => &[],
        }
    }

    /// Label used in logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Envelope::Message(_) => "message",
            Envelope::Ack(a) => a.status.as_str(),
        }
    }

    /// Serialize into the wire format.
    pub fn encode(&self) -> Result<Bytes> {
        let payload = self.payload();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::codec(
                format!("payload of {} bytes exceeds limit", payload.len()),
                Bytes::new(),
            ));
        }

        let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + payload.len());
        ENVELOPE_VERSION.encode(&mut buf)?;
        self.message_id().value().encode(&mut buf)?;
        self.sender_id().value().encode(&mut buf)?;
        self.receiver_id().value().encode(&mut buf)?;
        self.kind_byte().encode(&mut buf)?;
        payload.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Parse from the wire format.
    pub fn decode(data: Bytes) -> Result<Self> {
        let (rest, raw) = parse_raw_envelope(NomBytes::new(data.clone()))
            .map_err(|_| Error::codec("malformed envelope", data.clone()))?;

        if !rest.into_bytes().is_empty() {
            return Err(Error::codec("trailing bytes after envelope", data));
        }
        if raw.version != ENVELOPE_VERSION {
            return Err(Error::codec(
                format!("unsupported envelope version {}", raw.version),
                data,
            ));
        }

        let message_id = MessageId(raw.message_id);
        if message_id.is_none() {
            return Err(Error::codec(
                format!("message id {} is not positive", raw.message_id),
                data,
            ));
        }
        let sender_id = UserId(raw.sender_id);
        let receiver_id = UserId(raw.receiver_id);

        if let Some(payload_type) = PayloadType::from_u8(raw.kind) {
            return Ok(Envelope::Message(MessageEnvelope {
                message_id,
                sender_id,
                receiver_id,
                payload_type,
                payload: raw.payload,
            }));
        }

        if let Some(status) = StatusKind::from_u8(raw.kind) {
            return Ok(Envelope::Ack(AckEnvelope {
                message_id,
                sender_id,
                receiver_id,
                status,
            }));
        }

        Err(Error::codec(format!("unknown envelope kind {}", raw.kind), data))
    }
}

impl From<MessageEnvelope> for Envelope {
    fn from(message: MessageEnvelope) -> Self {
        Envelope::Message(message)
    }
}

impl From<AckEnvelope> for Envelope {
    fn from(ack: AckEnvelope) -> Self {
        Envelope::Ack(ack)
    }
}
