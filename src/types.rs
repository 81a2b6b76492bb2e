//! Type-safe wrappers for backplane primitives.
//!
//! These newtypes keep user ids, message ids and partition indices from being
//! mixed up even though they share an integer representation.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};

use crate::constants::{SNOWFLAKE_EPOCH_MILLIS, SNOWFLAKE_TIMESTAMP_SHIFT};

/// Identifier of a chat user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct UserId(pub i64);

impl UserId {
    #[inline]
    pub const fn new(value: i64) -> Self {
        UserId(value)
    }

    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(value: i64) -> Self {
        UserId(value)
    }
}

/// Timestamp-derived message identifier.
///
/// Ids are positive snowflakes: the high bits hold milliseconds since
/// [`SNOWFLAKE_EPOCH_MILLIS`], so a larger id is always a later message.
/// Zero and below never name a message; [`MessageId::NONE`] is the value of a
/// high-water mark that has not seen any message yet, and envelopes carrying
/// a non-positive id are rejected at decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MessageId(pub i64);

impl MessageId {
    /// Below every valid id, used for absent high-water marks.
    pub const NONE: Self = MessageId(0);

    #[inline]
    pub const fn new(value: i64) -> Self {
        MessageId(value)
    }

    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 <= 0
    }

    /// Smallest id that could have been generated at `time`.
    ///
    /// Times before the snowflake epoch map to [`MessageId::NONE`]; times past
    /// the last representable millisecond saturate at `i64::MAX`.
    pub fn floor_at(time: DateTime<Utc>) -> Self {
        let millis = time.timestamp_millis().saturating_sub(SNOWFLAKE_EPOCH_MILLIS);
        if millis <= 0 {
            return MessageId::NONE;
        }
        MessageId(
            millis
                .checked_mul(1 << SNOWFLAKE_TIMESTAMP_SHIFT)
                .unwrap_or(i64::MAX),
        )
    }

    /// Creation time encoded in the id.
    pub fn timestamp(self) -> Option<DateTime<Utc>> {
        let millis = (self.0 >> SNOWFLAKE_TIMESTAMP_SHIFT) + SNOWFLAKE_EPOCH_MILLIS;
        Utc.timestamp_millis_opt(millis).single()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        MessageId(value)
    }
}

/// Index of a partition within a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PartitionIndex(pub i32);

impl PartitionIndex {
    #[inline]
    pub const fn new(value: i32) -> Self {
        PartitionIndex(value)
    }

    #[inline]
    pub const fn value(self) -> i32 {
        self.0
    }

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0.max(0) as usize
    }
}

impl fmt::Display for PartitionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a one-to-one chat, independent of who looks at it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChatId(String);

impl ChatId {
    /// Chat between two users, formatted as `"<smaller>-<larger>"`.
    pub fn between(a: UserId, b: UserId) -> Self {
        let (min, max) = if a <= b { (a, b) } else { (b, a) };
        ChatId(format!("{}-{}", min, max))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
