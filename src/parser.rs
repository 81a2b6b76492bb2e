//! Deserialize envelopes from the backplane wire format.
use bytes::Bytes;
use nom::{
    IResult,
    bytes::complete::take,
    number::complete::{be_i64, be_u8, be_u32},
};
use nombytes::NomBytes;

use crate::constants::MAX_PAYLOAD_SIZE;

/// Envelope fields as they appear on the wire, before kind validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEnvelope {
    pub version: u8,
    pub message_id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub kind: u8,
    pub payload: Bytes,
}

/// Parse a u32 length-prefixed blob, bounded by [`MAX_PAYLOAD_SIZE`].
pub fn parse_blob(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_u32(s)?;

    if length as usize > MAX_PAYLOAD_SIZE {
        return Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::TooLarge,
        )));
    }

    let (s, blob) = take(length as usize)(s)?;
    Ok((s, blob.into_bytes()))
}

pub fn parse_raw_envelope(s: NomBytes) -> IResult<NomBytes, RawEnvelope> {
    let (s, version) = be_u8(s)?;
    let (s, message_id) = be_i64(s)?;
    let (s, sender_id) = be_i64(s)?;
    let (s, receiver_id) = be_i64(s)?;
    let (s, kind) = be_u8(s)?;
    let (s, payload) = parse_blob(s)?;

    Ok((
        s,
        RawEnvelope {
            version,
            message_id,
            sender_id,
            receiver_id,
            kind,
            payload,
        },
    ))
}
