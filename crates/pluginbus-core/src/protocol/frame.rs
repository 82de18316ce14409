//! Length-prefixed framing.
//!
//! Frame format: `[4-byte BE u32 length][payload bytes]`

use crate::error::{BusError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection before a new frame).
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(BusError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| BusError::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode it as JSON.
pub async fn read_message<T, R>(reader: &mut R, max_size: usize) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncReadExt + Unpin,
{
    match read_frame(reader, max_size).await? {
        Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
        None => Ok(None),
    }
}

/// Encode a message as the JSON body of a frame.
pub fn encode_message<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}
