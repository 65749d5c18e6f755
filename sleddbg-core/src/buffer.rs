//! Bounded byte buffer and typed packing primitives.
//!
//! [`ByteBuffer`] is the unit of all wire I/O: received bytes are
//! appended, complete messages are consumed off the front with
//! [`ByteBuffer::shuffle`], and outbound messages are packed into a
//! shared send buffer. [`Packer`] and [`Reader`] implement the typed
//! field layout of §6.1: fixed-width integers and floats in the
//! negotiated byte order, strings as a `u16` length followed by raw
//! bytes with no terminator.

use crate::error::Error;
use crate::{allocator::SequentialAllocator, Result};

/// Byte order used for packing and unpacking.
///
/// The runtime always packs host order; the client adapts based on the
/// initial `Endianness` message. Tests exercise both layouts explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// Host byte order.
    pub const NATIVE: Self = if cfg!(target_endian = "big") {
        Self::Big
    } else {
        Self::Little
    };
}

/// Append-only byte buffer with a fixed capacity.
#[derive(Debug)]
pub struct ByteBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl ByteBuffer {
    #[must_use]
    pub fn new(max_size: u32) -> Self {
        Self {
            data: vec![0u8; max_size as usize].into_boxed_slice(),
            len: 0,
        }
    }

    /// Bytes currently held.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fixed capacity in bytes.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Append `bytes`, rejecting the whole chunk if it would exceed the
    /// capacity. Empty input is rejected.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if bytes.is_empty() || self.len + bytes.len() > self.data.len() {
            return false;
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        true
    }

    /// Discard the first `count` bytes, clamped to the current size.
    pub fn shuffle(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        let count = count.min(self.len);
        self.data.copy_within(count..self.len, 0);
        self.len -= count;
    }

    /// Discard everything.
    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Walk this buffer's storage layout through a sizing or allocating
    /// pass. Must stay in lockstep with [`ByteBuffer::new`].
    ///
    /// # Errors
    ///
    /// Propagates allocator exhaustion.
    pub fn required_memory(
        max_size: u32,
        alloc: &mut dyn SequentialAllocator,
    ) -> Result<()> {
        alloc.allocate(max_size as usize, 1)?;
        Ok(())
    }

    /// Bytes reserved by this buffer.
    #[must_use]
    pub fn footprint(&self) -> usize {
        self.data.len()
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        if self.len + bytes.len() > self.data.len() {
            return Err(Error::BufferOverflow);
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }
}

macro_rules! pack_primitive {
    ($name:ident, $ty:ty) => {
        /// Append one value in the packer's byte order.
        ///
        /// # Errors
        ///
        /// [`Error::BufferOverflow`] if the buffer is full.
        pub fn $name(&mut self, value: $ty) -> Result<()> {
            let bytes = match self.endian {
                Endian::Little => value.to_le_bytes(),
                Endian::Big => value.to_be_bytes(),
            };
            self.buffer.put(&bytes)
        }
    };
}

macro_rules! read_primitive {
    ($name:ident, $ty:ty) => {
        /// Consume one value in the reader's byte order.
        ///
        /// # Errors
        ///
        /// [`Error::BufferOverflow`] on short input.
        pub fn $name(&mut self) -> Result<$ty> {
            const WIDTH: usize = core::mem::size_of::<$ty>();
            if self.offset + WIDTH > self.data.len() {
                return Err(Error::BufferOverflow);
            }
            let mut bytes = [0u8; WIDTH];
            bytes.copy_from_slice(&self.data[self.offset..self.offset + WIDTH]);
            self.offset += WIDTH;
            Ok(match self.endian {
                Endian::Little => <$ty>::from_le_bytes(bytes),
                Endian::Big => <$ty>::from_be_bytes(bytes),
            })
        }
    };
}

/// Typed writer over a [`ByteBuffer`]. Construction resets the buffer:
/// one packer invocation produces exactly one message image.
#[derive(Debug)]
pub struct Packer<'a> {
    buffer: &'a mut ByteBuffer,
    endian: Endian,
}

impl<'a> Packer<'a> {
    pub fn new(buffer: &'a mut ByteBuffer, endian: Endian) -> Self {
        buffer.reset();
        Self { buffer, endian }
    }

    pack_primitive!(pack_u8, u8);
    pack_primitive!(pack_u16, u16);
    pack_primitive!(pack_u32, u32);
    pack_primitive!(pack_u64, u64);
    pack_primitive!(pack_i16, i16);
    pack_primitive!(pack_i32, i32);
    pack_primitive!(pack_i64, i64);
    pack_primitive!(pack_f32, f32);
    pack_primitive!(pack_f64, f64);

    /// Append a `u16` length prefix followed by the raw string bytes.
    /// The empty string is legal and writes a zero length.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] if the string exceeds `u16::MAX` bytes,
    /// [`Error::BufferOverflow`] if the buffer cannot hold it.
    pub fn pack_str(&mut self, value: &str) -> Result<()> {
        let len = u16::try_from(value.len()).map_err(|_| Error::InvalidParameter)?;
        if self.buffer.len + 2 + value.len() > self.buffer.data.len() {
            return Err(Error::BufferOverflow);
        }
        self.pack_u16(len)?;
        self.buffer.put(value.as_bytes())
    }
}

/// Typed cursor over a received message image.
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
    endian: Endian,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub const fn new(data: &'a [u8], endian: Endian) -> Self {
        Self {
            data,
            offset: 0,
            endian,
        }
    }

    read_primitive!(read_u8, u8);
    read_primitive!(read_u16, u16);
    read_primitive!(read_u32, u32);
    read_primitive!(read_u64, u64);
    read_primitive!(read_i16, i16);
    read_primitive!(read_i32, i32);
    read_primitive!(read_i64, i64);
    read_primitive!(read_f32, f32);
    read_primitive!(read_f64, f64);

    /// Length of the next string plus one (room for a terminator a C
    /// consumer may want to append), without advancing the cursor.
    ///
    /// # Errors
    ///
    /// [`Error::BufferOverflow`] on short input.
    pub fn peek_string_len(&self) -> Result<u16> {
        if self.offset + 2 > self.data.len() {
            return Err(Error::BufferOverflow);
        }
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(&self.data[self.offset..self.offset + 2]);
        let len = match self.endian {
            Endian::Little => u16::from_le_bytes(bytes),
            Endian::Big => u16::from_be_bytes(bytes),
        };
        Ok(len.saturating_add(1))
    }

    /// Consume a length-prefixed string, borrowing from the message image.
    ///
    /// # Errors
    ///
    /// [`Error::BufferOverflow`] on short input, [`Error::InvalidParameter`]
    /// if the bytes are not valid UTF-8.
    pub fn read_str(&mut self) -> Result<&'a str> {
        let len = self.read_u16()? as usize;
        if self.offset + len > self.data.len() {
            return Err(Error::BufferOverflow);
        }
        let raw = &self.data[self.offset..self.offset + len];
        self.offset += len;
        core::str::from_utf8(raw).map_err(|_| Error::InvalidParameter)
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}
