//! Frame walk over a decrypted Initial payload
//!
//! Only the frames a client's first flight is made of are modeled: PADDING,
//! PING and CRYPTO. Any other type (ACK, CONNECTION_CLOSE, ...) ends the walk,
//! because its length cannot be known without decoding it. Frames after it in
//! the same packet are not seen.

use crate::wire::read_varint;

pub const FRAME_PADDING: u8 = 0x00;
pub const FRAME_PING: u8 = 0x01;
pub const FRAME_CRYPTO: u8 = 0x06;

/// A CRYPTO frame borrowed from the plaintext
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoFrame<'a> {
    /// Offset in the connection's CRYPTO stream
    pub offset: u64,
    /// Where `data` starts within the plaintext
    pub data_start: usize,
    pub data: &'a [u8],
}

/// Why a [`FrameWalk`] stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkEnd {
    /// All bytes consumed
    Complete,
    /// Hit a frame type that is not modeled
    UnknownFrame(u8),
    /// A CRYPTO frame ran past the buffer
    Malformed,
}

/// Iterator over the CRYPTO frames of a plaintext payload.
///
/// PADDING and PING are skipped; the walk stops at the first frame type that
/// is not modeled. [`FrameWalk::end`] reports why it stopped.
#[derive(Debug, Clone)]
pub struct FrameWalk<'a> {
    buf: &'a [u8],
    pos: usize,
    end: Option<WalkEnd>,
}

impl<'a> FrameWalk<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            end: None,
        }
    }

    /// Reason the walk stopped, once it has
    pub fn end(&self) -> Option<WalkEnd> {
        self.end
    }

    fn stop(&mut self, end: WalkEnd) -> Option<CryptoFrame<'a>> {
        self.end = Some(end);
        self.pos = self.buf.len();
        None
    }

    fn crypto_frame(&mut self) -> Option<CryptoFrame<'a>> {
        let (offset, n) = read_varint(&self.buf[self.pos..]);
        if n == 0 {
            return None;
        }
        self.pos += n;
        let (length, n) = read_varint(&self.buf[self.pos..]);
        if n == 0 {
            return None;
        }
        self.pos += n;

        let data_start = self.pos;
        let data_end = data_start.checked_add(usize::try_from(length).ok()?)?;
        let data = self.buf.get(data_start..data_end)?;
        self.pos = data_end;
        Some(CryptoFrame {
            offset,
            data_start,
            data,
        })
    }
}

impl<'a> Iterator for FrameWalk<'a> {
    type Item = CryptoFrame<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.end.is_some() {
            return None;
        }
        while self.pos < self.buf.len() {
            let frame_type = self.buf[self.pos];
            self.pos += 1;
            match frame_type {
                FRAME_PADDING | FRAME_PING => continue,
                FRAME_CRYPTO => {
                    return match self.crypto_frame() {
                        Some(frame) => Some(frame),
                        None => self.stop(WalkEnd::Malformed),
                    };
                }
                other => return self.stop(WalkEnd::UnknownFrame(other)),
            }
        }
        self.end = Some(WalkEnd::Complete);
        None
    }
}
