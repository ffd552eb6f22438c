//! Device frame decoding.
//!
//! Devices speak binary MessagePack on the wire. Firmware batches outgoing
//! telemetry, so a single WebSocket frame may carry several MessagePack
//! messages packed back to back — the decoder streams values out of the
//! frame until it is exhausted. Older firmware sends one JSON object per
//! text frame instead; both paths produce the same tagged-map shape.

use std::io::Cursor;

use serde_json::Value;
use thiserror::Error;

/// A frame that could not be decoded. The connection stays open; the frame
/// is logged and dropped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid MessagePack frame: {0}")]
    MsgPack(#[from] rmp_serde::decode::Error),
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode a binary frame into one or more messages, in wire order.
///
/// Tries the streaming multi-decode first. A frame holding a single message
/// decodes identically either way; the single-message fallback only matters
/// when the multi-decode fails partway through a frame.
pub fn decode_binary(data: &[u8]) -> Result<Vec<Value>, DecodeError> {
    match decode_packed(data) {
        Ok(messages) => Ok(messages),
        Err(multi_err) => match rmp_serde::from_slice::<Value>(data) {
            Ok(single) => Ok(vec![single]),
            Err(_) => Err(multi_err.into()),
        },
    }
}

/// Stream MessagePack values out of `data` until the buffer is exhausted.
fn decode_packed(data: &[u8]) -> Result<Vec<Value>, rmp_serde::decode::Error> {
    let mut cursor = Cursor::new(data);
    let mut messages = Vec::new();
    while (cursor.position() as usize) < data.len() {
        messages.push(rmp_serde::from_read(&mut cursor)?);
    }
    Ok(messages)
}

/// Decode a legacy JSON text frame into a single message.
pub fn decode_text(text: &str) -> Result<Value, DecodeError> {
    Ok(serde_json::from_str(text)?)
}
