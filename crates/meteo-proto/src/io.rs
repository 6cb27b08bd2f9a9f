//! Exact-count stream helpers and the read-one-frame operation.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::frame::{decode, frame_len, Frame, FrameError};
use crate::FRAME_LEN;

/// Fill `buf` from `r`. Returns fewer bytes than requested only when the peer closed.
/// `Interrupted` is retried; any other error is returned.
pub async fn read_full<R>(r: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Write all of `buf`. `Interrupted` and `WouldBlock` are retried.
pub async fn write_full<W>(w: &mut W, buf: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut off = 0;
    while off < buf.len() {
        match w.write(&buf[off..]).await {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => off += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => tokio::task::yield_now().await,
            Err(e) => return Err(e),
        }
    }
    w.flush().await
}

/// A validated frame together with the exact window it arrived in.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame {
    /// Variant bytes followed by zero padding.
    pub bytes: [u8; FRAME_LEN],
    pub frame: Frame,
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("stream read failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl ReadError {
    /// I/O errors end the connection; frame errors only drop the frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReadError::Io(_))
    }
}

/// Read one [`FRAME_LEN`] window without validating it.
///
/// `Ok(None)` means the peer closed. The whole window is consumed even when `cmd` is
/// unknown, so the next call starts on a frame boundary. Bytes past the variant's
/// length are zeroed.
pub async fn read_raw_frame<R>(r: &mut R) -> io::Result<Option<[u8; FRAME_LEN]>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; FRAME_LEN];
    let n = read_full(r, &mut buf[..2]).await?;
    if n < 2 {
        if n > 0 {
            debug!("proto: peer closed inside a frame header");
        }
        return Ok(None);
    }
    let n = read_full(r, &mut buf[2..]).await?;
    if n < FRAME_LEN - 2 {
        debug!("proto: peer closed after {} of {} frame bytes", n + 2, FRAME_LEN);
        return Ok(None);
    }
    if let Some(len) = frame_len(buf[1]) {
        buf[len..].fill(0);
    }
    Ok(Some(buf))
}

/// Read and validate one frame.
pub async fn read_frame<R>(r: &mut R) -> Result<Option<RawFrame>, ReadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let Some(bytes) = read_raw_frame(r).await? else { return Ok(None) };
    let frame = decode(&bytes)?;
    Ok(Some(RawFrame { bytes, frame }))
}
