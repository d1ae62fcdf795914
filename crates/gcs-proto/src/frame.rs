use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use crate::codec::{self, HEADER_LEN, STX};
use crate::error::DecodeError;
use crate::message::Message;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    pub frames: u64,
    pub decode_errors: u64,
    pub bytes_discarded: u64,
}

/// Reassembles frames from arbitrarily chunked link bytes.
#[derive(Debug, Default)]
pub struct Framer {
    buf: BytesMut,
    stats: FramerStats,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, `None` once more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<Message, DecodeError>> {
        loop {
            self.skip_to_start();
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            let total = codec::frame_len(self.buf[1] as usize, self.buf[2]);
            if self.buf.len() < total {
                return None;
            }

            match codec::decode_frame(&self.buf[..total]) {
                Ok((msg, used)) => {
                    self.buf.advance(used);
                    self.stats.frames += 1;
                    return Some(Ok(msg));
                }
                Err(err @ DecodeError::ChecksumMismatch { .. }) => {
                    // The start marker may have been payload noise; resync one byte on.
                    trace!(frame = %hex::encode(&self.buf[..total]), "framer: checksum mismatch");
                    self.buf.advance(1);
                    self.stats.bytes_discarded += 1;
                    self.stats.decode_errors += 1;
                    return Some(Err(err));
                }
                Err(err @ (DecodeError::Truncated { .. } | DecodeError::Malformed { .. })) => {
                    // Checksum held, so the frame boundary is trustworthy.
                    self.buf.advance(total);
                    self.stats.bytes_discarded += total as u64;
                    self.stats.decode_errors += 1;
                    return Some(Err(err));
                }
                Err(DecodeError::BadMagic(_)) => continue,
            }
        }
    }

    fn skip_to_start(&mut self) {
        let skip = self.buf.iter().position(|b| *b == STX).unwrap_or(self.buf.len());
        if skip > 0 {
            debug!(bytes = skip, "framer: discarding bytes before start marker");
            self.buf.advance(skip);
            self.stats.bytes_discarded += skip as u64;
        }
    }
}

impl Iterator for Framer {
    type Item = Result<Message, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame()
    }
}
