//
// Copyright 2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Length-prefixed message framing.
//!
//! Every frame on an established connection is a 4-byte big-endian length
//! followed by that many payload bytes:
//!
//! ```text
//! +------------------+-------------------+
//! | Length (4 bytes) | Payload (N bytes) |
//! +------------------+-------------------+
//! ```
//!
//! Readers enforce a caller-supplied maximum so that a hostile peer cannot
//! make us allocate an arbitrary buffer.
//!
//! # Examples
//!
//! ```rust
//! use tubrpc::serialization::framing::{read_frame, write_frame, MAX_FRAME_SIZE};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut buffer = Vec::new();
//! write_frame(&mut buffer, b"Hello", MAX_FRAME_SIZE).await?;
//! assert_eq!(&buffer[..4], &5u32.to_be_bytes());
//!
//! let mut reader = &buffer[..];
//! assert_eq!(read_frame(&mut reader, MAX_FRAME_SIZE).await?, b"Hello");
//! # Ok(())
//! # }
//! ```

use crate::serialization::{DeserializationError, SerializationError, Serializer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Size of the frame length header in bytes.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Builds a complete frame (header and payload) in memory.
///
/// Brokers queue whole frames on their writer task; building the frame up
/// front means a frame is either queued entirely or not at all.
///
/// # Errors
///
/// Returns a [`SerializationError`] if the payload exceeds `max_size`.
pub fn encode_frame(payload: &[u8], max_size: u32) -> Result<Vec<u8>, SerializationError> {
    check_len(payload.len(), max_size)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Writes a length-prefixed frame and flushes the writer.
///
/// # Errors
///
/// Returns a [`SerializationError`] if the payload exceeds `max_size` or
/// the write fails.
pub async fn write_frame<W>(
    writer: &mut W,
    payload: &[u8],
    max_size: u32,
) -> Result<(), SerializationError>
where
    W: AsyncWrite + Unpin,
{
    check_len(payload.len(), max_size)?;
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(|e| SerializationError::with_source("failed to write frame length", e))?;
    writer
        .write_all(payload)
        .await
        .map_err(|e| SerializationError::with_source("failed to write frame payload", e))?;
    writer
        .flush()
        .await
        .map_err(|e| SerializationError::with_source("failed to flush frame", e))?;
    Ok(())
}

/// Reads one length-prefixed frame.
///
/// # Errors
///
/// Returns a [`DeserializationError`] if the announced length exceeds
/// `max_size` or the stream ends or fails mid-frame. End-of-stream before
/// the header is flagged by [`DeserializationError::is_eof`].
pub async fn read_frame<R>(reader: &mut R, max_size: u32) -> Result<Vec<u8>, DeserializationError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; FRAME_HEADER_SIZE];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| DeserializationError::from_io("failed to read frame length", e))?;

    let len = u32::from_be_bytes(len_bytes);
    if len > max_size {
        return Err(DeserializationError::new(format!(
            "frame size {} exceeds maximum allowed size {}",
            len, max_size
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| DeserializationError::with_source("failed to read frame payload", e))?;
    Ok(payload)
}

/// Serializes `message` and writes it as one frame.
///
/// # Errors
///
/// Returns a [`SerializationError`] if encoding or writing fails.
pub async fn write_message<W, S, T>(
    writer: &mut W,
    serializer: &S,
    message: &T,
    max_size: u32,
) -> Result<(), SerializationError>
where
    W: AsyncWrite + Unpin,
    S: Serializer,
    T: serde::Serialize,
{
    let payload = serializer.serialize(message)?;
    write_frame(writer, &payload, max_size).await
}

/// Reads one frame and deserializes it.
///
/// # Errors
///
/// Returns a [`DeserializationError`] if reading or decoding fails.
pub async fn read_message<R, S, T>(
    reader: &mut R,
    serializer: &S,
    max_size: u32,
) -> Result<T, DeserializationError>
where
    R: AsyncRead + Unpin,
    S: Serializer,
    T: serde::de::DeserializeOwned,
{
    let payload = read_frame(reader, max_size).await?;
    serializer.deserialize(&payload)
}

fn check_len(len: usize, max_size: u32) -> Result<(), SerializationError> {
    if len > max_size as usize {
        return Err(SerializationError::new(format!(
            "frame size {} exceeds maximum allowed size {}",
            len, max_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::JsonSerializer;
    use serde::{Deserialize, Serialize};

    #[tokio::test]
    async fn test_write_then_read_several_frames() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, b"one", MAX_FRAME_SIZE).await.unwrap();
        write_frame(&mut buffer, b"", MAX_FRAME_SIZE).await.unwrap();
        write_frame(&mut buffer, b"three", MAX_FRAME_SIZE).await.unwrap();

        let mut reader = &buffer[..];
        assert_eq!(read_frame(&mut reader, MAX_FRAME_SIZE).await.unwrap(), b"one");
        assert!(read_frame(&mut reader, MAX_FRAME_SIZE).await.unwrap().is_empty());
        assert_eq!(read_frame(&mut reader, MAX_FRAME_SIZE).await.unwrap(), b"three");

        let end = read_frame(&mut reader, MAX_FRAME_SIZE).await.unwrap_err();
        assert!(end.is_eof());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&1000u32.to_be_bytes());
        let mut reader = &buffer[..];
        let err = read_frame(&mut reader, 100).await.unwrap_err();
        assert!(!err.is_eof());
        assert!(err.to_string().contains("exceeds"));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_write() {
        let mut buffer = Vec::new();
        assert!(write_frame(&mut buffer, &[0u8; 10], 5).await.is_err());
        assert!(buffer.is_empty());
        assert!(encode_frame(&[0u8; 10], 5).is_err());
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&10u32.to_be_bytes());
        buffer.extend_from_slice(b"short");
        let mut reader = &buffer[..];
        assert!(read_frame(&mut reader, MAX_FRAME_SIZE).await.is_err());
    }

    #[tokio::test]
    async fn test_encode_frame_matches_write_frame() {
        let mut written = Vec::new();
        write_frame(&mut written, b"abc", MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(encode_frame(b"abc", MAX_FRAME_SIZE).unwrap(), written);
    }

    #[tokio::test]
    async fn test_message_helpers() {
        #[derive(Serialize, Deserialize, Debug, PartialEq)]
        struct Ping {
            n: u32,
        }

        let serializer = JsonSerializer::new();
        let mut buffer = Vec::new();
        write_message(&mut buffer, &serializer, &Ping { n: 9 }, MAX_FRAME_SIZE)
            .await
            .unwrap();
        let mut reader = &buffer[..];
        let ping: Ping = read_message(&mut reader, &serializer, MAX_FRAME_SIZE)
            .await
            .unwrap();
        assert_eq!(ping, Ping { n: 9 });
    }
}
