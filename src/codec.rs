//! Command wire format, version 1.
//!
//! Key (20 bytes): `[u128 BE resource ulid][i32 BE days since 1970-01-01]`.
//! Value: `[u8 version][bincode CommandPayload]`.
//!
//! The key carries the whole `ResourceKey`, so partitioning by key bytes keeps
//! every command for one resource-day on one partition.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::*;

pub const WIRE_VERSION: u8 = 1;
pub const KEY_LEN: usize = 20;

/// `NaiveDate::num_days_from_ce()` of 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    KeyLength(usize),
    DayOutOfRange(i32),
    EmptyValue,
    UnknownVersion(u8),
    Payload(String),
    Invalid(ValidationError),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::KeyLength(n) => write!(f, "key must be {KEY_LEN} bytes, got {n}"),
            CodecError::DayOutOfRange(d) => write!(f, "day {d} outside of calendar range"),
            CodecError::EmptyValue => write!(f, "empty command value"),
            CodecError::UnknownVersion(v) => write!(f, "unknown wire version {v}"),
            CodecError::Payload(e) => write!(f, "malformed payload: {e}"),
            CodecError::Invalid(e) => write!(f, "invalid command: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

#[derive(Debug, Serialize, Deserialize)]
enum CommandPayload {
    Create {
        owner_id: Ulid,
        start: Minute,
        end: Minute,
    },
    Delete {
        booking_id: Ulid,
        owner_id: Ulid,
    },
}

fn epoch_day(day: NaiveDate) -> i32 {
    day.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

pub fn encode_key(key: &ResourceKey) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    let mut buf = &mut out[..];
    buf.put_u128(key.resource_id.0);
    buf.put_i32(epoch_day(key.day));
    out
}

pub fn decode_key(mut bytes: &[u8]) -> Result<ResourceKey, CodecError> {
    if bytes.len() != KEY_LEN {
        return Err(CodecError::KeyLength(bytes.len()));
    }
    let resource_id = Ulid(bytes.get_u128());
    let days = bytes.get_i32();
    let day = NaiveDate::from_num_days_from_ce_opt(days.saturating_add(UNIX_EPOCH_DAYS_FROM_CE))
        .ok_or(CodecError::DayOutOfRange(days))?;
    Ok(ResourceKey::new(resource_id, day))
}

pub fn encode_command(cmd: &Command) -> Result<Bytes, CodecError> {
    let payload = match cmd {
        Command::CreateBooking {
            owner_id, interval, ..
        } => CommandPayload::Create {
            owner_id: *owner_id,
            start: interval.start,
            end: interval.end,
        },
        Command::DeleteBooking {
            booking_id,
            owner_id,
            ..
        } => CommandPayload::Delete {
            booking_id: *booking_id,
            owner_id: *owner_id,
        },
    };
    let body = bincode::serialize(&payload).map_err(|e| CodecError::Payload(e.to_string()))?;
    let mut buf = BytesMut::with_capacity(1 + body.len());
    buf.put_u8(WIRE_VERSION);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Decode one record. Every failure here is permanent: retrying the same
/// bytes can never succeed.
pub fn decode_command(key: &[u8], mut value: &[u8]) -> Result<Command, CodecError> {
    let key = decode_key(key)?;
    if !value.has_remaining() {
        return Err(CodecError::EmptyValue);
    }
    let version = value.get_u8();
    if version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }
    let payload: CommandPayload =
        bincode::deserialize(value).map_err(|e| CodecError::Payload(e.to_string()))?;

    match payload {
        CommandPayload::Create {
            owner_id,
            start,
            end,
        } => Command::create(key, owner_id, start, end).map_err(CodecError::Invalid),
        CommandPayload::Delete {
            booking_id,
            owner_id,
        } => Ok(Command::delete(key, booking_id, owner_id)),
    }
}

/// Stable partition for an encoded key.
pub fn partition_for(key: &[u8], partitions: u32) -> u32 {
    crc32fast::hash(key) % partitions.max(1)
}
