use crate::error::{CodecError, CodecResult};
use byteorder::{BigEndian, ByteOrder};
use std::fmt;
use std::ops::Deref;

/// Capacity of the first allocation.
const INITIAL_CAPACITY: usize = 1024;
/// Below this capacity the buffer doubles, at or above it grows by 1.5x.
const GROWTH_SWITCH: usize = 64 * 1024;
/// Hard ceiling on buffer capacity unless overridden.
pub const DEFAULT_CEILING: usize = 256 * 1024 * 1024;

/// A growable byte region with a cursor. Writes append at the end of the
/// valid region and reads consume from the cursor; all accesses are
/// bounds-checked against the valid region and the capacity ceiling.
#[derive(PartialEq)]
pub struct Buffer {
    data: Vec<u8>,
    pos: usize,
    ceiling: usize,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer::with_ceiling(DEFAULT_CEILING)
    }

    #[inline]
    pub fn with_ceiling(ceiling: usize) -> Buffer {
        Buffer {
            data: Vec::new(),
            pos: 0,
            ceiling,
        }
    }

    /// The number of valid bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The cursor position.
    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Move the cursor back to the start of the valid region.
    #[inline]
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// The valid region.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view of the valid region, for in-place patching.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Guarantees room for `n` more bytes at the cursor, growing if needed.
    /// Growth doubles while the capacity is small and switches to 1.5x once
    /// it crosses 64 KiB, clamping to the exact need if the multiplicative
    /// step would overflow the address space. Requests past the ceiling
    /// fail with `Overflow`.
    pub fn require(&mut self, n: usize) -> CodecResult<()> {
        let required = self.pos.checked_add(n).ok_or(CodecError::Overflow)?;

        if required > self.ceiling {
            return Err(CodecError::Overflow);
        }

        if required <= self.data.capacity() {
            return Ok(());
        }

        let mut target = self.data.capacity().max(INITIAL_CAPACITY);

        while target < required {
            let step = if target < GROWTH_SWITCH {
                target.checked_mul(2)
            } else {
                target.checked_add(target / 2)
            };

            target = match step {
                Some(next) => next,
                None => required,
            };
        }

        target = target.min(self.ceiling);

        self.data
            .try_reserve_exact(target - self.data.len())
            .map_err(|_| CodecError::OutOfMemory)
    }

    /// Guarantees `n` bytes of valid data remain at the cursor.
    #[inline]
    pub fn avail(&self, n: usize) -> CodecResult<()> {
        match self.pos.checked_add(n) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(CodecError::Underflow),
        }
    }

    /// Appends raw bytes at the cursor.
    #[inline]
    pub fn put(&mut self, bytes: &[u8]) -> CodecResult<()> {
        self.require(bytes.len())?;
        self.data.extend_from_slice(bytes);
        self.pos = self.data.len();
        Ok(())
    }

    #[inline]
    pub fn put_u8(&mut self, value: u8) -> CodecResult<()> {
        self.put(&[value])
    }

    #[inline]
    pub fn put_u64(&mut self, value: u64) -> CodecResult<()> {
        let mut raw = [0u8; 8];
        BigEndian::write_u64(&mut raw, value);
        self.put(&raw)
    }

    #[inline]
    pub fn put_i64(&mut self, value: i64) -> CodecResult<()> {
        let mut raw = [0u8; 8];
        BigEndian::write_i64(&mut raw, value);
        self.put(&raw)
    }

    /// Appends `n` zero bytes and returns the freshly valid region so a
    /// reader can fill it in place.
    #[inline]
    pub fn put_zeroed(&mut self, n: usize) -> CodecResult<&mut [u8]> {
        self.require(n)?;
        let start = self.data.len();
        self.data.resize(start + n, 0);
        self.pos = self.data.len();
        Ok(&mut self.data[start..])
    }

    /// Consumes `n` bytes at the cursor.
    #[inline]
    pub fn get_slice(&mut self, n: usize) -> CodecResult<&[u8]> {
        self.avail(n)?;
        let start = self.pos;
        self.pos += n;
        Ok(&self.data[start..self.pos])
    }

    /// Opens a gap of `by` bytes at `from`, shifting the bytes between
    /// `from` and the end of the valid region towards the tail. Used to
    /// widen an already written header in place.
    pub fn shift_tail(&mut self, from: usize, by: usize) -> CodecResult<()> {
        debug_assert!(from <= self.data.len());

        self.require(by)?;

        let end = self.data.len();
        self.data.resize(end + by, 0);
        self.data.copy_within(from..end, from + by);
        self.pos = self.data.len();
        Ok(())
    }
}

impl Default for Buffer {
    #[inline]
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl From<Vec<u8>> for Buffer {
    /// Adopts an already materialized byte string, cursor at its end.
    #[inline]
    fn from(data: Vec<u8>) -> Buffer {
        let pos = data.len();
        Buffer {
            data,
            pos,
            ceiling: DEFAULT_CEILING,
        }
    }
}

impl Deref for Buffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for Buffer {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Buffer {{ len: {}, pos: {}, capacity: {} }}",
            self.data.len(),
            self.pos,
            self.data.capacity()
        )
    }
}
