//! Length-prefixed bincode framing for stream transports.
//!
//! Each frame is a big-endian `u32` payload length followed by the bincode encoding of one
//! message. Frames larger than the configured limit are rejected on both ends.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ConnResult, ConnectionError};

pub(crate) async fn write_frame<W, T>(writer: &mut W, msg: &T, max_frame_size: usize) -> ConnResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(msg).map_err(|err| ConnectionError::Serialization(Some(err)))?;
    if payload.len() > max_frame_size || payload.len() > u32::MAX as usize {
        return Err(ConnectionError::FrameTooLarge {
            size: payload.len(),
            limit: max_frame_size,
        });
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next frame. Returns `None` when the peer closed the stream between frames.
pub(crate) async fn read_frame<R, T>(reader: &mut R, max_frame_size: usize) -> ConnResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len > max_frame_size {
        return Err(ConnectionError::FrameTooLarge {
            size: len,
            limit: max_frame_size,
        });
    }
    let mut payload = vec![0; len];
    reader.read_exact(&mut payload).await?;
    bincode::deserialize(&payload)
        .map(Some)
        .map_err(|err| ConnectionError::Serialization(Some(err)))
}
