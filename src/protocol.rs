//! Wire framing
//!
//! Every message on the relay's byte stream is
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────┐
//! │ length: u32 (BE)     │ payload: length bytes    │
//! └──────────────────────┴──────────────────────────┘
//! ```
//!
//! The payload is raw interleaved PCM; the codec itself does not look at it.
//! Lengths of zero or above [`MAX_FRAME_LEN`] are protocol violations and the
//! payload is never read.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::{LENGTH_PREFIX_BYTES, MAX_FRAME_LEN};
use crate::error::ProtocolError;

/// One PCM chunk. Cheap to clone; never mutated once built.
pub type Frame = Bytes;

fn check_len(len: usize, max_len: usize) -> Result<(), ProtocolError> {
    let max_len = max_len.min(MAX_FRAME_LEN);
    if len == 0 {
        Err(ProtocolError::EmptyFrame)
    } else if len > max_len {
        Err(ProtocolError::FrameTooLarge(len, max_len))
    } else {
        Ok(())
    }
}

fn map_eof(err: std::io::Error) -> ProtocolError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::Closed
    } else {
        ProtocolError::Io(err)
    }
}

/// Build the on-wire bytes for one payload
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, ProtocolError> {
    check_len(payload.len(), MAX_FRAME_LEN)?;

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Write one length-prefixed frame.
///
/// The payload is written straight from the caller's buffer, so a shared
/// mix frame is never copied per connection. `write_all` keeps calling the
/// transport until every byte is accepted or it fails.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    check_len(payload.len(), MAX_FRAME_LEN)?;

    let header = (payload.len() as u32).to_be_bytes();
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, rejecting declared lengths of zero or
/// above `max_len` before touching the payload.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; LENGTH_PREFIX_BYTES];
    reader.read_exact(&mut header).await.map_err(map_eof)?;

    let len = u32::from_be_bytes(header) as usize;
    check_len(len, max_len)?;

    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload[..]).await.map_err(map_eof)?;
    Ok(payload.freeze())
}
