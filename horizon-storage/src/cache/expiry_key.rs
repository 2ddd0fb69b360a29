//! Sortable binary keys for the LMDB expiration index.
//!
//! LMDB orders keys bytewise, so the encoding has to make byte order agree
//! with [`Expiration`] order before the entity key breaks ties.
//!
//! # Binary Format
//!
//! - Byte 0: tag (`0` = `NegInfinity`, `1` = `At`, `2` = `PosInfinity`)
//! - Bytes 1-8: seconds since the epoch, sign bit flipped, big-endian
//! - Bytes 9-12: subsecond nanoseconds, big-endian
//! - Bytes 13..: entity key (UTF-8)
//!
//! Sentinels carry zeroed time bytes. Flipping the sign bit maps `i64`
//! onto `u64` monotonically, so instants before the epoch still sort first.

use chrono::DateTime;
use horizon_core::{EntityKey, Expiration, StorageError};

const TAG_NEG_INFINITY: u8 = 0;
const TAG_AT: u8 = 1;
const TAG_POS_INFINITY: u8 = 2;

/// Length of the fixed prefix preceding the entity key.
pub const PREFIX_LEN: usize = 13;

const SIGN_BIT: u64 = 1 << 63;

/// LMDB's default maximum key size.
const LMDB_MAX_KEY_LEN: usize = 511;

/// Longest entity key, in bytes, that fits in both the row table and the
/// index. Both repositories enforce it so they accept the same keys.
pub const MAX_ENTITY_KEY_LEN: usize = LMDB_MAX_KEY_LEN - PREFIX_LEN;

/// Whether `key` is non-empty and no longer than [`MAX_ENTITY_KEY_LEN`].
pub fn key_fits(key: &EntityKey) -> bool {
    (1..=MAX_ENTITY_KEY_LEN).contains(&key.as_bytes().len())
}

/// Reject keys a cache row cannot be stored under.
pub fn check_key(key: &EntityKey) -> Result<(), StorageError> {
    if key_fits(key) {
        Ok(())
    } else {
        Err(StorageError::KeyLength {
            key: key.clone(),
            len: key.as_bytes().len(),
            max: MAX_ENTITY_KEY_LEN,
        })
    }
}

/// Encode the fixed, order-preserving prefix for an expiration.
pub fn encode_expiration(expiration: Expiration) -> [u8; PREFIX_LEN] {
    let mut bytes = [0u8; PREFIX_LEN];
    match expiration {
        Expiration::NegInfinity => bytes[0] = TAG_NEG_INFINITY,
        Expiration::At(at) => {
            bytes[0] = TAG_AT;
            let biased = (at.timestamp() as u64) ^ SIGN_BIT;
            bytes[1..9].copy_from_slice(&biased.to_be_bytes());
            bytes[9..13].copy_from_slice(&at.timestamp_subsec_nanos().to_be_bytes());
        }
        Expiration::PosInfinity => bytes[0] = TAG_POS_INFINITY,
    }
    bytes
}

/// Decode the expiration prefix. `None` on a short slice or unknown tag.
pub fn decode_expiration(bytes: &[u8]) -> Option<Expiration> {
    if bytes.len() < PREFIX_LEN {
        return None;
    }
    match bytes[0] {
        TAG_NEG_INFINITY => Some(Expiration::NegInfinity),
        TAG_AT => {
            let biased = u64::from_be_bytes(bytes[1..9].try_into().ok()?);
            let secs = (biased ^ SIGN_BIT) as i64;
            let nanos = u32::from_be_bytes(bytes[9..13].try_into().ok()?);
            DateTime::from_timestamp(secs, nanos).map(Expiration::At)
        }
        TAG_POS_INFINITY => Some(Expiration::PosInfinity),
        _ => None,
    }
}

/// Full index key: expiration prefix followed by the entity key.
pub fn encode(expiration: Expiration, key: &EntityKey) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(PREFIX_LEN + key.as_bytes().len());
    bytes.extend_from_slice(&encode_expiration(expiration));
    bytes.extend_from_slice(key.as_bytes());
    bytes
}

/// Split a full index key back into its parts.
pub fn decode(bytes: &[u8]) -> Option<(Expiration, EntityKey)> {
    let expiration = decode_expiration(bytes)?;
    let key = std::str::from_utf8(&bytes[PREFIX_LEN..]).ok()?;
    Some((expiration, EntityKey::new(key)))
}
