//! Worker-to-supervisor wire format
//!
//! Frame format: [4-byte length BE][MessagePack payload]

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Notices are tiny; anything larger is a corrupted stream
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: u32, max: u32 },
}

/// Serialize a message to MessagePack bytes, structs as maps
pub fn serialize<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(msg)?)
}

/// Deserialize a message from MessagePack bytes
pub fn deserialize<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| {
        anyhow!(ProtocolError::MalformedMessage(format!(
            "Failed to deserialize: {}",
            e
        )))
    })
}

/// Frame a payload with its length prefix
pub fn frame_message(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Read one frame; `None` on clean EOF before a length prefix
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];

    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_SIZE {
        bail!(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE
        });
    }

    let mut buffer = vec![0u8; len as usize];
    reader.read_exact(&mut buffer).await?;

    Ok(Some(buffer))
}

/// Serialize, frame and flush a message
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let framed = frame_message(&serialize(msg)?);
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let mut bytes = (MAX_FRAME_SIZE + 1).to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        let mut reader = &bytes[..];

        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("Frame too large"));
    }

    #[tokio::test]
    async fn test_eof_between_frames() {
        let mut reader: &[u8] = &[];
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_error() {
        let mut bytes = 10u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"abc");
        let mut reader = &bytes[..];
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        let err = deserialize::<String>(&[0xc1]).unwrap_err();
        assert!(err.to_string().contains("Malformed message"));
    }
}
