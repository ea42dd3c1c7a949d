//! Message framing: turns a byte stream into discrete RPC message payloads.
//!
//! Three interchangeable framings share one contract: `read_frame` yields
//! exactly one payload, `write_frame` commits exactly one.
//!
//! - **Block** — payload length as a bare ChainPack unsigned integer,
//!   followed by that many bytes. Used on TCP, Unix sockets and pipes.
//! - **Serial** — byte stuffing with `STX 0xA2 … ETX 0xA3`; `ATX 0xA4`
//!   aborts a frame in progress, `ESC 0xAA` escapes any of the four control
//!   bytes as `ESC, byte - 0xA0`.
//! - **Serial+CRC** — as Serial, with a big-endian CRC-32 (IEEE 802.3) of
//!   the escaped payload transmitted, itself escaped, after ETX. A frame
//!   with a CRC mismatch is dropped silently; the reader resynchronizes at
//!   the next STX without advancing the message count.
//!
//! Reset signalling is in-band for the serial framings: a bare `STX ATX ETX`
//! sequence is reported as [`RxFrame::Reset`] so the link owner can restart
//! the peer state machine. An ATX arriving later in a frame only cancels
//! that frame; the reader stays in place and hunts for the next STX.

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::chainpack::{self, UnpackError};

const STX: u8 = 0xa2;
const ETX: u8 = 0xa3;
const ATX: u8 = 0xa4;
const ESC: u8 = 0xaa;

/// Upper bound on a single frame; longer frames indicate a desynchronized
/// or hostile peer.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Framing selected for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Block,
    Serial,
    SerialCrc,
}

/// One received item: either a message payload or an in-band reset.
#[derive(Debug, PartialEq, Eq)]
pub enum RxFrame {
    Frame(Vec<u8>),
    Reset,
}

/// Errors terminating a framed link.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the stream between frames.
    #[error("link closed")]
    Closed,

    /// Transport level failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A length prefix that is not a valid ChainPack unsigned integer.
    /// Block framing has no marker to resynchronize on, so this is fatal.
    #[error("malformed frame length")]
    BadLength,

    /// Declared frame length above [`MAX_FRAME_SIZE`].
    #[error("frame of {0} bytes exceeds the limit")]
    TooLarge(usize),
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Reads frames of the configured [`Framing`] from an async byte stream.
pub struct FrameReader<R> {
    inner: R,
    framing: Framing,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, framing: Framing) -> Self {
        Self { inner, framing, buf: BytesMut::with_capacity(4 * 1024) }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Yields the next frame or in-band reset. [`FrameError::Closed`] marks
    /// a clean end of stream at a frame boundary.
    pub async fn read_frame(&mut self) -> Result<RxFrame, FrameError> {
        match self.framing {
            Framing::Block => self.read_block().await,
            Framing::Serial => self.read_serial(false).await,
            Framing::SerialCrc => self.read_serial(true).await,
        }
    }

    async fn fill(&mut self) -> Result<(), FrameError> {
        let n = self.inner.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(FrameError::Closed);
        }
        Ok(())
    }

    async fn next_byte(&mut self) -> Result<u8, FrameError> {
        while self.buf.is_empty() {
            self.fill().await?;
        }
        Ok(self.buf.get_u8())
    }

    async fn read_block(&mut self) -> Result<RxFrame, FrameError> {
        // Accumulate until the length prefix decodes, then until the whole
        // payload is buffered.
        let (len, prefix) = loop {
            match chainpack::unpack_uint_data(&self.buf) {
                Ok((len, used)) => break (len as usize, used),
                Err(UnpackError::UnexpectedEof) => self.fill().await?,
                Err(_) => return Err(FrameError::BadLength),
            }
        };
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(len));
        }
        while self.buf.len() < prefix + len {
            self.fill().await?;
        }
        self.buf.advance(prefix);
        let payload = self.buf.split_to(len).to_vec();
        Ok(RxFrame::Frame(payload))
    }

    async fn read_serial(&mut self, use_crc: bool) -> Result<RxFrame, FrameError> {
        'frame: loop {
            // Hunt for STX, discarding line noise.
            while self.next_byte().await? != STX {}
            let mut escaped = Vec::new();
            let terminator = loop {
                match self.next_byte().await? {
                    b @ (ETX | ATX) => break b,
                    b => {
                        if escaped.len() >= MAX_FRAME_SIZE {
                            return Err(FrameError::TooLarge(escaped.len()));
                        }
                        escaped.push(b);
                    }
                }
            };
            if terminator == ATX {
                if escaped.is_empty() {
                    return Ok(RxFrame::Reset);
                }
                continue; // aborted frame, drop it
            }
            if use_crc {
                let mut crc_bytes = [0u8; 4];
                for slot in crc_bytes.iter_mut() {
                    let b = self.next_byte().await?;
                    *slot = if b == ESC {
                        match self.next_byte().await? {
                            0x02 => STX,
                            0x03 => ETX,
                            0x04 => ATX,
                            0x0a => ESC,
                            other => other,
                        }
                    } else {
                        b
                    };
                }
                let received = u32::from_be_bytes(crc_bytes);
                if received != crc32fast::hash(&escaped) {
                    continue 'frame; // corrupted frame, drop silently
                }
            }
            return Ok(RxFrame::Frame(deescape(&escaped)));
        }
    }
}

fn deescape(data: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(data.len());
    let mut iter = data.iter().copied();
    while let Some(b) = iter.next() {
        if b == ESC {
            match iter.next() {
                Some(0x02) => res.push(STX),
                Some(0x03) => res.push(ETX),
                Some(0x04) => res.push(ATX),
                Some(0x0a) => res.push(ESC),
                Some(other) => {
                    res.push(ESC);
                    res.push(other);
                }
                None => res.push(ESC),
            }
        } else {
            res.push(b);
        }
    }
    res
}

fn escape(data: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(data.len());
    for &b in data {
        match b {
            STX => res.extend_from_slice(&[ESC, 0x02]),
            ETX => res.extend_from_slice(&[ESC, 0x03]),
            ATX => res.extend_from_slice(&[ESC, 0x04]),
            ESC => res.extend_from_slice(&[ESC, 0x0a]),
            other => res.push(other),
        }
    }
    res
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Writes frames of the configured [`Framing`] onto an async byte stream.
pub struct FrameWriter<W> {
    inner: W,
    framing: Framing,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, framing: Framing) -> Self {
        Self { inner, framing }
    }

    /// Commits exactly one message payload.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        match self.framing {
            Framing::Block => {
                let mut head = Vec::with_capacity(payload.len() + 8);
                chainpack::write_uint_data(&mut head, payload.len() as u64);
                head.extend_from_slice(payload);
                self.inner.write_all(&head).await?;
            }
            Framing::Serial | Framing::SerialCrc => {
                let escaped = escape(payload);
                let mut out = Vec::with_capacity(escaped.len() + 10);
                out.push(STX);
                out.extend_from_slice(&escaped);
                out.push(ETX);
                if self.framing == Framing::SerialCrc {
                    let crc = crc32fast::hash(&escaped);
                    out.extend_from_slice(&escape(&crc.to_be_bytes()));
                }
                self.inner.write_all(&out).await?;
            }
        }
        self.inner.flush().await?;
        Ok(())
    }

    /// Sends the in-band reset sequence. A no-op for Block framing, which
    /// resets by reconnecting.
    pub async fn write_reset(&mut self) -> Result<(), FrameError> {
        if matches!(self.framing, Framing::Serial | Framing::SerialCrc) {
            self.inner.write_all(&[STX, ATX, ETX]).await?;
            self.inner.flush().await?;
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
