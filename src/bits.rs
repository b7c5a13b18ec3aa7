//! Bit-granular stream I/O.
//!
//! The reader consumes an arbitrary number of bits per call from any
//! [`Read`] source, carrying partial-byte state across calls; the writer is
//! its dual, stitching unaligned writes through one partial byte in flight.
//! Bits travel MSB-first within each byte (network bit order).
//!
//! Byte layout of a bit run: `read_bits(n)` and `write_bits(buf, n)` use
//! `(n + 7) / 8` bytes where the leading partial byte (if `n % 8 != 0`)
//! holds its bits in the low positions. Interpreting the buffer as a
//! big-endian integer therefore yields the bit string's numeric value.

use std::collections::VecDeque;
use std::io::Read;

/// Stream-level failures from the bit reader/writer.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected EOF: needed {needed} more bits at bit {at}")]
    UnexpectedEof { needed: u64, at: u64 },
    #[error("misaligned write: {pending} bits pending, {asked} more would not complete a byte")]
    MisalignedWrite { pending: u8, asked: u64 },
    #[error("no checkpoint to recover")]
    NoCheckpoint,
}

/// Reads arbitrary bit counts from a byte stream.
///
/// Supports a single-level checkpoint: [`backup`](BitReader::backup) saves
/// the current bit position, [`recovery`](BitReader::recovery) rewinds to it
/// once. Bytes consumed between the two calls are replayed from an internal
/// buffer, so the checkpoint works on non-seekable streams too.
pub struct BitReader<R> {
    inner: R,
    /// Bytes pushed back by `recovery`, consumed before `inner`.
    replay: VecDeque<u8>,
    /// Raw bytes consumed since `backup` was called.
    record: Option<Vec<u8>>,
    cur: u8,
    /// Bits of `cur` not yet handed out (taken MSB-first).
    left: u8,
    bit_pos: u64,
    saved: Option<Checkpoint>,
}

#[derive(Clone, Copy)]
struct Checkpoint {
    cur: u8,
    left: u8,
    bit_pos: u64,
}

impl<R: Read> BitReader<R> {
    pub fn new(inner: R) -> Self {
        BitReader {
            inner,
            replay: VecDeque::new(),
            record: None,
            cur: 0,
            left: 0,
            bit_pos: 0,
            saved: None,
        }
    }

    /// Absolute position in bits from the start of the stream.
    pub fn bit_pos(&self) -> u64 {
        self.bit_pos
    }

    /// Byte offset of the current position (bits already consumed / 8).
    pub fn byte_pos(&self) -> u64 {
        self.bit_pos / 8
    }

    fn next_byte(&mut self) -> Result<u8, StreamError> {
        let b = match self.replay.pop_front() {
            Some(b) => b,
            None => {
                let mut buf = [0u8; 1];
                self.inner.read_exact(&mut buf).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        StreamError::UnexpectedEof { needed: 8, at: self.bit_pos }
                    } else {
                        StreamError::Io(e)
                    }
                })?;
                buf[0]
            }
        };
        if let Some(rec) = self.record.as_mut() {
            rec.push(b);
        }
        Ok(b)
    }

    fn read_bit(&mut self) -> Result<u8, StreamError> {
        if self.left == 0 {
            self.cur = self.next_byte()?;
            self.left = 8;
        }
        let bit = (self.cur >> 7) & 1;
        self.cur <<= 1;
        self.left -= 1;
        self.bit_pos += 1;
        Ok(bit)
    }

    /// Reads exactly `n` bits. The result occupies `(n + 7) / 8` bytes; a
    /// leading partial byte keeps its bits in the low positions.
    pub fn read_bits(&mut self, n: u64) -> Result<Vec<u8>, StreamError> {
        let n_bytes = ((n + 7) / 8) as usize;
        let mut out = vec![0u8; n_bytes];
        if n == 0 {
            return Ok(out);
        }
        // Aligned fast path: whole bytes straight through.
        if self.left == 0 && n % 8 == 0 {
            for slot in out.iter_mut() {
                *slot = self.next_byte()?;
                self.bit_pos += 8;
            }
            return Ok(out);
        }
        let lead = (n % 8) as u8;
        let mut byte_idx = 0usize;
        let mut bit_in_byte = if lead == 0 { 8 } else { lead };
        for _ in 0..n {
            let bit = self.read_bit()?;
            bit_in_byte -= 1;
            out[byte_idx] |= bit << bit_in_byte;
            if bit_in_byte == 0 {
                byte_idx += 1;
                bit_in_byte = 8;
            }
        }
        Ok(out)
    }

    /// Reads one full byte (8 bits), used by delimiter scanning.
    pub fn read_byte(&mut self) -> Result<u8, StreamError> {
        Ok(self.read_bits(8)?[0])
    }

    /// Saves the current bit position. A later [`recovery`](Self::recovery)
    /// rewinds to it; a second `backup` replaces the previous checkpoint.
    pub fn backup(&mut self) {
        self.saved = Some(Checkpoint { cur: self.cur, left: self.left, bit_pos: self.bit_pos });
        self.record = Some(Vec::new());
    }

    /// Rewinds once to the position saved by [`backup`](Self::backup).
    pub fn recovery(&mut self) -> Result<(), StreamError> {
        let cp = self.saved.take().ok_or(StreamError::NoCheckpoint)?;
        let recorded = self.record.take().unwrap_or_default();
        // Recorded bytes go back in front of anything already queued.
        for b in recorded.into_iter().rev() {
            self.replay.push_front(b);
        }
        self.cur = cp.cur;
        self.left = cp.left;
        self.bit_pos = cp.bit_pos;
        Ok(())
    }

    /// Drops the checkpoint without rewinding.
    pub fn commit(&mut self) {
        self.saved = None;
        self.record = None;
    }
}

/// Writes arbitrary bit counts into an in-memory byte buffer.
///
/// Unaligned writes leave a partial byte in flight; while one is pending,
/// the next write must bring the total back to a byte boundary or it fails
/// with [`StreamError::MisalignedWrite`].
#[derive(Default)]
pub struct BitWriter {
    out: Vec<u8>,
    cur: u8,
    /// Bits already placed in `cur` (from the MSB side), 0..8.
    filled: u8,
    bit_pos: u64,
}

impl BitWriter {
    pub fn new() -> Self {
        BitWriter::default()
    }

    /// Total bits written so far.
    pub fn bit_pos(&self) -> u64 {
        self.bit_pos
    }

    fn write_bit(&mut self, bit: u8) {
        self.cur |= (bit & 1) << (7 - self.filled);
        self.filled += 1;
        if self.filled == 8 {
            self.out.push(self.cur);
            self.cur = 0;
            self.filled = 0;
        }
        self.bit_pos += 1;
    }

    /// Writes the low-aligned `n`-bit run held in `buf` (same layout that
    /// [`BitReader::read_bits`] produces).
    pub fn write_bits(&mut self, buf: &[u8], n: u64) -> Result<(), StreamError> {
        if self.filled != 0 && (u64::from(self.filled) + n) % 8 != 0 {
            return Err(StreamError::MisalignedWrite { pending: self.filled, asked: n });
        }
        let n_bytes = ((n + 7) / 8) as usize;
        if buf.len() < n_bytes {
            return Err(StreamError::MisalignedWrite { pending: self.filled, asked: n });
        }
        if self.filled == 0 && n % 8 == 0 {
            self.out.extend_from_slice(&buf[..n_bytes]);
            self.bit_pos += n;
            return Ok(());
        }
        let lead = (n % 8) as u8;
        let mut byte_idx = 0usize;
        let mut bit_in_byte = if lead == 0 { 8u8 } else { lead };
        for _ in 0..n {
            bit_in_byte -= 1;
            let bit = (buf[byte_idx] >> bit_in_byte) & 1;
            self.write_bit(bit);
            if bit_in_byte == 0 {
                byte_idx += 1;
                bit_in_byte = 8;
            }
        }
        Ok(())
    }

    /// Writes whole bytes (an aligned shortcut for `write_bits(b, 8 * len)`).
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        self.write_bits(bytes, bytes.len() as u64 * 8)
    }

    /// Finishes the stream. Fails if a partial byte is still in flight.
    pub fn into_bytes(self) -> Result<Vec<u8>, StreamError> {
        if self.filled != 0 {
            return Err(StreamError::MisalignedWrite { pending: self.filled, asked: 0 });
        }
        Ok(self.out)
    }
}
