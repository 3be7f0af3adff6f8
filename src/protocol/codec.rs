//! Length-prefixed framing and JSON encoding
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! JSON. Framing failures are transport errors; a well-framed body that does
//! not decode is a [`CodecError::Decode`] and leaves the stream usable.

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound on a single frame (1 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Serialization error")]
    Serialization(#[source] serde_json::Error),
    #[error("Malformed message: {0}")]
    Decode(#[source] serde_json::Error),
}

impl CodecError {
    /// True when the stream itself is still intact
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::Decode(_))
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, CodecError> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(CodecError::Serialization)
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(payload).map_err(CodecError::Decode)
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max: usize) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max {
        return Err(CodecError::FrameTooLarge {
            size: payload.len(),
            max,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| CodecError::FrameTooLarge {
        size: payload.len(),
        max,
    })?;
    writer.write_u32(len).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. End of stream on a frame boundary is `ConnectionClosed`.
///
/// ```
/// use oef_core::protocol::codec::read_frame;
///
/// let wire: &[u8] = &[0, 0, 0, 2, b'{', b'}'];
/// let mut reader = wire;
/// let frame = tokio_test::block_on(read_frame(&mut reader, 16)).unwrap();
/// assert_eq!(&frame[..], b"{}");
/// ```
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Bytes, CodecError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(CodecError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    };
    if len > max {
        return Err(CodecError::FrameTooLarge { size: len, max });
    }

    let mut buffer = BytesMut::zeroed(len);
    reader.read_exact(&mut buffer).await?;
    Ok(buffer.freeze())
}

pub async fn send_message<W, T>(writer: &mut W, message: &T, max: usize) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = encode(message)?;
    write_frame(writer, &payload, max).await
}

pub async fn recv_message<R, T>(reader: &mut R, max: usize) -> Result<T, CodecError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let frame = read_frame(reader, max).await?;
    decode(&frame)
}
