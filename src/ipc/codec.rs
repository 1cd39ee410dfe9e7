//! Frame codec for the broker wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │ type(1B) │   msgpack payload      │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! Length = sizeof(type byte) + sizeof(payload), NOT including the 4-byte prefix.
//!
//! The broker side is async (tokio); worker-side clients are plain blocking
//! sockets, so every read/write comes in both flavours.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::types::Result;

/// Message type: request from a worker.
pub const MSG_REQUEST: u8 = 0x01;
/// Message type: response to a worker.
pub const MSG_RESPONSE: u8 = 0x02;
/// Message type: log record, fire-and-forget (no response frame).
pub const MSG_LOG: u8 = 0x03;
/// Message type: error response to a worker.
pub const MSG_ERROR: u8 = 0xFF;

/// Serialize a message body to msgpack (named fields).
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Deserialize a msgpack message body.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

fn check_frame_len(frame_len: u32, max_frame_bytes: u32) -> std::io::Result<()> {
    if frame_len > max_frame_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame too large: {} bytes", frame_len),
        ));
    }
    if frame_len < 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Frame too short: missing type byte",
        ));
    }
    Ok(())
}

fn split_frame(mut frame_data: Vec<u8>) -> (u8, Vec<u8>) {
    let msg_type = frame_data[0];
    frame_data.remove(0);
    (msg_type, frame_data)
}

fn frame_header(msg_type: u8, payload: &[u8]) -> std::io::Result<[u8; 5]> {
    let frame_len = u32::try_from(payload.len() + 1).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "payload exceeds u32 frame length")
    })?;
    let len = frame_len.to_be_bytes();
    Ok([len[0], len[1], len[2], len[3], msg_type])
}

/// Read one frame from the stream.
///
/// Returns `(msg_type, payload_bytes)`. Returns `None` on clean EOF.
/// `max_frame_bytes` caps the maximum accepted payload size.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    check_frame_len(frame_len, max_frame_bytes)?;

    let mut frame_data = vec![0u8; frame_len as usize];
    reader.read_exact(&mut frame_data).await?;
    Ok(Some(split_frame(frame_data)))
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg_type: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    writer.write_all(&frame_header(msg_type, payload)?).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Blocking counterpart of [`read_frame`].
pub fn read_frame_blocking<R: Read>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    check_frame_len(frame_len, max_frame_bytes)?;

    let mut frame_data = vec![0u8; frame_len as usize];
    reader.read_exact(&mut frame_data)?;
    Ok(Some(split_frame(frame_data)))
}

/// Blocking counterpart of [`write_frame`].
pub fn write_frame_blocking<W: Write>(
    writer: &mut W,
    msg_type: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(payload.len() + 5);
    frame.extend_from_slice(&frame_header(msg_type, payload)?);
    frame.extend_from_slice(payload);
    writer.write_all(&frame)?;
    writer.flush()
}
