//! Fixed-capacity ring buffer backing both stream directions.
//!
//! [`RingBuffer`] holds bytes between the application and the engine:
//! - the send side queues application bytes until they are acknowledged,
//! - the receive side holds in-order payload until the application reads it.
//!
//! The buffer never grows.  A write that does not fit fails without touching
//! the buffer, which is what lets the engine withhold an acknowledgment when
//! the receiver is full.
//!
//! # Cursor layout
//!
//! ```text
//!        read_pos               write_pos
//!           │                       │
//!  ─────────┼───────────────────────┼─────────▶ (mod capacity)
//!           │ <── bytes_readable ──▶│ <── bytes_writable (wraps) ──
//! ```
//!
//! Besides the consuming [`RingBuffer::read`] / [`RingBuffer::write`] pair,
//! the buffer supports positioned access relative to the cursors:
//! [`RingBuffer::peek_at`] / [`RingBuffer::consume`] on the read side and
//! [`RingBuffer::write_at`] / [`RingBuffer::commit`] on the write side.

use thiserror::Error;

/// Errors returned by [`RingBuffer`] operations.  A failed call never
/// mutates the buffer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    #[error("not enough space: requested {requested} bytes, {available} writable")]
    NotEnoughSpace { requested: usize, available: usize },
    #[error("not enough data: requested {requested} bytes, {available} readable")]
    NotEnoughData { requested: usize, available: usize },
}

#[derive(Debug, Clone)]
pub struct RingBuffer {
    storage: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    /// Readable byte count.  Needed because `read_pos == write_pos` is both
    /// the empty and the full configuration.
    len: usize,
}

impl RingBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Bytes between the read cursor and the write cursor.
    pub fn bytes_readable(&self) -> usize {
        self.len
    }

    /// Free space after the write cursor.
    pub fn bytes_writable(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append all of `data` and advance the write cursor.
    pub fn write(&mut self, data: &[u8]) -> Result<(), BufferError> {
        self.write_at(0, data)?;
        self.commit(data.len())
    }

    /// Remove and return the next `n` readable bytes.
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>, BufferError> {
        let out = self.peek_at(0, n)?;
        self.consume(n)?;
        Ok(out)
    }

    /// Copy `n` bytes starting `offset` bytes past the read cursor, leaving
    /// the cursor where it is.
    pub fn peek_at(&self, offset: usize, n: usize) -> Result<Vec<u8>, BufferError> {
        let available = self.len;
        if offset.saturating_add(n) > available {
            return Err(BufferError::NotEnoughData {
                requested: offset.saturating_add(n),
                available,
            });
        }
        let mut out = vec![0u8; n];
        self.copy_out((self.read_pos + offset) % self.capacity().max(1), &mut out);
        Ok(out)
    }

    /// Drop the next `n` readable bytes.
    pub fn consume(&mut self, n: usize) -> Result<(), BufferError> {
        if n > self.len {
            return Err(BufferError::NotEnoughData {
                requested: n,
                available: self.len,
            });
        }
        if n > 0 {
            self.read_pos = (self.read_pos + n) % self.capacity();
            self.len -= n;
        }
        Ok(())
    }

    /// Place `data` `offset` bytes past the write cursor without advancing
    /// it.  The bytes become readable once [`RingBuffer::commit`] covers
    /// them.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<(), BufferError> {
        let available = self.bytes_writable();
        if offset.saturating_add(data.len()) > available {
            return Err(BufferError::NotEnoughSpace {
                requested: offset.saturating_add(data.len()),
                available,
            });
        }
        if !data.is_empty() {
            let start = (self.write_pos + offset) % self.capacity();
            self.copy_in(start, data);
        }
        Ok(())
    }

    /// Advance the write cursor over `n` bytes previously placed with
    /// [`RingBuffer::write_at`].
    pub fn commit(&mut self, n: usize) -> Result<(), BufferError> {
        let available = self.bytes_writable();
        if n > available {
            return Err(BufferError::NotEnoughSpace {
                requested: n,
                available,
            });
        }
        if n > 0 {
            self.write_pos = (self.write_pos + n) % self.capacity();
            self.len += n;
        }
        Ok(())
    }

    // Both copies split into at most two contiguous slices.

    fn copy_in(&mut self, start: usize, data: &[u8]) {
        let first = data.len().min(self.capacity() - start);
        self.storage[start..start + first].copy_from_slice(&data[..first]);
        self.storage[..data.len() - first].copy_from_slice(&data[first..]);
    }

    fn copy_out(&self, start: usize, out: &mut [u8]) {
        if out.is_empty() {
            return;
        }
        let first = out.len().min(self.capacity() - start);
        let (head, tail) = out.split_at_mut(first);
        head.copy_from_slice(&self.storage[start..start + first]);
        tail.copy_from_slice(&self.storage[..tail.len()]);
    }
}
