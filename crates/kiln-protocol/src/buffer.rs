//! Growable, bounds-checked byte buffer.
//!
//! Every wire format in Kiln is built on [`ByteBuffer`]. It keeps three
//! positions:
//!
//! ```text
//! 0 ≤ offset ≤ length ≤ capacity ≤ max_size
//!     ^read     ^write
//! ```
//!
//! Writes append at `length`, reads advance `offset`. Integers are
//! fixed-width little-endian; strings are an `i32` byte length followed by
//! UTF-8 bytes.

use crate::BufferError;

/// Default hard cap for a buffer: 1 MiB.
pub const DEFAULT_MAX_SIZE: usize = 1024 * 1024;

const INITIAL_CAPACITY: usize = 64;

/// A contiguous byte region with a read cursor and a write extent.
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    data: Vec<u8>,
    offset: usize,
    max_size: usize,
    read_only: bool,
}

impl ByteBuffer {
    /// Creates an empty buffer capped at [`DEFAULT_MAX_SIZE`].
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_SIZE)
    }

    /// Creates an empty buffer with a custom hard cap.
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            data: Vec::new(),
            offset: 0,
            max_size,
            read_only: false,
        }
    }

    /// Wraps existing bytes in a read-only buffer. The length is fixed and
    /// every write returns [`BufferError::ReadOnly`].
    pub fn read_only(bytes: Vec<u8>) -> Self {
        let max_size = bytes.len();
        Self {
            data: bytes,
            offset: 0,
            max_size,
            read_only: true,
        }
    }

    /// Number of bytes written.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// The read cursor.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes left between the read cursor and the write extent.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Moves the read cursor. Positions past the written length are rejected.
    pub fn set_offset(&mut self, position: usize) -> Result<(), BufferError> {
        if position > self.data.len() {
            return Err(BufferError::OutOfBounds {
                position,
                length: self.data.len(),
            });
        }
        self.offset = position;
        Ok(())
    }

    /// All written bytes, regardless of the read cursor.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Bytes from the read cursor to the write extent.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    /// Consumes the buffer and returns its written bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Drops all content and rewinds the cursor.
    pub fn clear(&mut self) -> Result<(), BufferError> {
        self.check_writable()?;
        self.data.clear();
        self.offset = 0;
        Ok(())
    }

    /// Discards the first `n` bytes and shifts the remainder to position 0.
    ///
    /// The read cursor moves back by the same amount, so reads continue
    /// as if the removed prefix never existed.
    pub fn remove(&mut self, n: usize) -> Result<(), BufferError> {
        self.check_writable()?;
        if n > self.data.len() {
            return Err(BufferError::Underflow {
                needed: n,
                available: self.data.len(),
            });
        }
        self.data.drain(..n);
        self.offset = self.offset.saturating_sub(n);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    pub fn write_u8(&mut self, value: u8) -> Result<(), BufferError> {
        self.write_bytes(&[value])
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), BufferError> {
        self.write_u8(u8::from(value))
    }

    pub fn write_i16(&mut self, value: i16) -> Result<(), BufferError> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), BufferError> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<(), BufferError> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes an `i32` byte length followed by the UTF-8 bytes of `value`.
    pub fn write_str(&mut self, value: &str) -> Result<(), BufferError> {
        let len = i32::try_from(value.len()).map_err(|_| BufferError::Overflow {
            requested: value.len(),
            max: self.max_size,
        })?;
        self.reserve(4 + value.len())?;
        self.write_i32(len)?;
        self.write_bytes(value.as_bytes())
    }

    /// Appends raw bytes, growing the buffer as needed.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        self.reserve(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Overwrites four already-written bytes at `position` with `value`.
    pub fn patch_i32(&mut self, position: usize, value: i32) -> Result<(), BufferError> {
        self.check_writable()?;
        let end = position + 4;
        if end > self.data.len() {
            return Err(BufferError::OutOfBounds {
                position,
                length: self.data.len(),
            });
        }
        self.data[position..end].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Ensures room for `additional` more bytes, doubling capacity until the
    /// request fits. Growth never exceeds `max_size`.
    pub fn reserve(&mut self, additional: usize) -> Result<(), BufferError> {
        self.check_writable()?;
        let needed = self.data.len() + additional;
        if needed > self.max_size {
            return Err(BufferError::Overflow {
                requested: needed,
                max: self.max_size,
            });
        }
        let capacity = self.data.capacity();
        if needed <= capacity {
            return Ok(());
        }
        let mut target = capacity.max(INITIAL_CAPACITY);
        while target < needed {
            target *= 2;
        }
        let target = target.min(self.max_size);
        self.data.reserve_exact(target - self.data.len());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    pub fn read_u8(&mut self) -> Result<u8, BufferError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, BufferError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16, BufferError> {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(self.take(2)?);
        Ok(i16::from_le_bytes(raw))
    }

    pub fn read_i32(&mut self) -> Result<i32, BufferError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(i32::from_le_bytes(raw))
    }

    pub fn read_i64(&mut self) -> Result<i64, BufferError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(raw))
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, BufferError> {
        let len = self.read_i32()?;
        let len = usize::try_from(len).map_err(|_| BufferError::NegativeLength(len))?;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| BufferError::InvalidString)
    }

    /// Reads exactly `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, BufferError> {
        Ok(self.take(n)?.to_vec())
    }

    /// Reads an `i32` at an absolute position without moving the cursor.
    pub fn peek_i32_at(&self, position: usize) -> Result<i32, BufferError> {
        let end = position + 4;
        if end > self.data.len() {
            return Err(BufferError::Underflow {
                needed: end,
                available: self.data.len(),
            });
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[position..end]);
        Ok(i32::from_le_bytes(raw))
    }

    fn take(&mut self, n: usize) -> Result<&[u8], BufferError> {
        let available = self.remaining();
        if n > available {
            return Err(BufferError::Underflow {
                needed: n,
                available,
            });
        }
        let start = self.offset;
        self.offset += n;
        Ok(&self.data[start..start + n])
    }

    fn check_writable(&self) -> Result<(), BufferError> {
        if self.read_only {
            Err(BufferError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}
