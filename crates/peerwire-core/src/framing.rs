//! Length-prefixed framing for stream transports
//!
//! Wire layout, repeated: `[len: u32 big-endian][len bytes payload]`. There is
//! no checksum or compression. A declared length above the configured maximum
//! is a protocol error and the stream cannot be resynchronised afterwards.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{ProtocolError, Result, TransportError};

/// Width of the size prefix in bytes
pub const SIZE_WIDTH: usize = 4;

/// Default upper bound on a single frame's payload
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024; // 16 MiB

// ----------------------------------------------------------------------------
// Encoding
// ----------------------------------------------------------------------------

/// Prepend the big-endian size prefix to `payload`
pub fn encode_frame(payload: &[u8], max_frame_len: usize) -> Result<Vec<u8>> {
    check_len(payload.len(), max_frame_len)?;
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(SIZE_WIDTH + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

fn check_len(len: usize, max_frame_len: usize) -> Result<()> {
    let max = max_frame_len.min(u32::MAX as usize);
    if len > max {
        return Err(ProtocolError::FrameTooLarge { declared: len, max }.into());
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Incremental Decoder
// ----------------------------------------------------------------------------

/// Buffering decoder for callers that receive bytes in arbitrary pieces
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_len,
        }
    }

    /// Append received bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete frame, `Ok(None)` if more bytes are needed.
    ///
    /// An oversized declaration is reported as soon as the prefix is
    /// available, without waiting for the body.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buffer.len() < SIZE_WIDTH {
            return Ok(None);
        }
        let declared = declared_len(&self.buffer);
        check_len(declared, self.max_frame_len)?;
        let total = SIZE_WIDTH + declared;
        if self.buffer.len() < total {
            return Ok(None);
        }
        let frame = self.buffer[SIZE_WIDTH..total].to_vec();
        self.buffer.drain(..total);
        Ok(Some(frame))
    }
}

fn declared_len(bytes: &[u8]) -> usize {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
}

// ----------------------------------------------------------------------------
// Async Read / Write
// ----------------------------------------------------------------------------

/// Read one frame from `reader`.
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary. End of
/// stream inside a prefix or body is a `Truncated` protocol error.
pub async fn read_frame<R>(reader: &mut R, max_frame_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; SIZE_WIDTH];
    let got = read_full(reader, &mut prefix).await?;
    if got == 0 {
        return Ok(None);
    }
    if got < SIZE_WIDTH {
        return Err(ProtocolError::Truncated {
            expected: SIZE_WIDTH,
            actual: got,
        }
        .into());
    }

    let declared = declared_len(&prefix);
    check_len(declared, max_frame_len)?;

    let mut payload = vec![0u8; declared];
    let got = read_full(reader, &mut payload).await?;
    if got < declared {
        return Err(ProtocolError::Truncated {
            expected: declared,
            actual: got,
        }
        .into());
    }
    Ok(Some(payload))
}

/// Fill `buf` unless the stream ends first; returns bytes read
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(TransportError::NetworkIo)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Write `payload` as one frame and flush; returns payload length
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_frame_len: usize) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload, max_frame_len)?;
    writer
        .write_all(&frame)
        .await
        .map_err(TransportError::NetworkIo)?;
    writer.flush().await.map_err(TransportError::NetworkIo)?;
    Ok(payload.len())
}
