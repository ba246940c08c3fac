//! Wire codec for messages and log blocks.
//!
//! Every message type is encoded by field enumeration through MessagePack.
//! A deserialization failure is reported to the caller; receivers treat it
//! as a dropped packet, never as a fatal condition, since under Byzantine
//! variants malformed input is expected adversarial behavior.

use std::io::Cursor;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::utils::ReplicoreError;

/// Serializes `message` into the front of `buffer`, returning the number of
/// bytes written. Intended to be called from inside a transport writer
/// closure, where `buffer` is the transport's fixed-capacity send buffer.
pub fn serialize_into<M: Serialize>(
    buffer: &mut [u8],
    message: &M,
) -> Result<usize, ReplicoreError> {
    let mut cursor = Cursor::new(buffer);
    rmp_serde::encode::write(&mut cursor, message)?;
    Ok(cursor.position() as usize)
}

/// Deserializes a message from received bytes.
pub fn deserialize<M: DeserializeOwned>(
    bytes: &[u8],
) -> Result<M, ReplicoreError> {
    Ok(rmp_serde::decode::from_slice(bytes)?)
}

/// Adapts a message into a transport writer closure. Serialization into
/// the transport's own send buffer can only fail by overflowing it, which
/// is logged and turned into a zero-length (hence undecodable, dropped)
/// message.
pub fn writer<M: Serialize>(
    message: &M,
) -> impl FnOnce(&mut [u8]) -> usize + '_ {
    move |buffer| match serialize_into(buffer, message) {
        Ok(length) => length,
        Err(e) => {
            pf_error!("wire"; "serialization failed: {}", e);
            0
        }
    }
}
