//! Packet memory (PMA)
//!
//! The USB peripheral has a dedicated memory region for the buffer descriptor
//! table and all packet payloads. The CPU sees it as 16-bit words. This module
//! wraps that region in a bounds-checked view, so that the rest of the driver
//! works with byte offsets instead of raw addresses.

use core::cell::UnsafeCell;

/// A volatile, 16-bit packet memory word
#[repr(transparent)]
pub struct Word(UnsafeCell<u16>);

impl Word {
    pub const fn new(val: u16) -> Self {
        Word(UnsafeCell::new(val))
    }

    pub fn read(&self) -> u16 {
        unsafe { self.0.get().read_volatile() }
    }

    pub fn write(&self, val: u16) {
        unsafe { self.0.get().write_volatile(val) }
    }
}

/// Packet memory that lives in normal RAM
///
/// Use this to back a [`PacketMemory`] when there's no peripheral, like
/// when you're testing USB class logic on a host. `WORDS` is the size in
/// 16-bit words.
///
/// ```
/// use usbd_vsp::{PacketMemory, PacketMemoryBuffer};
///
/// let buffer = PacketMemoryBuffer::<512>::new();
/// let pma = PacketMemory::new(&buffer);
/// assert_eq!(pma.len(), 1024);
/// ```
#[repr(C, align(4))]
pub struct PacketMemoryBuffer<const WORDS: usize>([Word; WORDS]);

impl<const WORDS: usize> PacketMemoryBuffer<WORDS> {
    /// Allocate zeroed packet memory.
    pub const fn new() -> Self {
        const ZERO: Word = Word::new(0);
        Self([ZERO; WORDS])
    }
}

impl<const WORDS: usize> Default for PacketMemoryBuffer<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

/// A view of the USB packet memory
///
/// All offsets are byte offsets from the start of packet memory. Word
/// accesses require an even offset. Any access beyond the end of packet
/// memory panics; the buffer descriptor table validates every region
/// before the driver touches it.
#[derive(Clone, Copy)]
pub struct PacketMemory<'a> {
    words: &'a [Word],
}

// Safety: the driver is the only user of packet memory after construction.
// Access is volatile and happens from one execution context.
unsafe impl Send for PacketMemory<'_> {}

impl<'a> PacketMemory<'a> {
    /// Create a view over packet memory that lives in RAM.
    pub fn new<const WORDS: usize>(buffer: &'a PacketMemoryBuffer<WORDS>) -> Self {
        PacketMemory { words: &buffer.0 }
    }

    /// Create a view over the peripheral's packet memory.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `size` bytes of packet memory that supports 16-bit
    /// accesses at every even offset, and that memory must not be used by
    /// anything else for the lifetime `'a`.
    pub unsafe fn from_raw(ptr: *const (), size: usize) -> Self {
        PacketMemory {
            words: core::slice::from_raw_parts(ptr.cast::<Word>(), size / 2),
        }
    }

    /// Returns the size of packet memory, in bytes.
    pub fn len(&self) -> usize {
        self.words.len() * 2
    }

    /// Indicates if there's no packet memory.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Returns `count` words starting at the even byte `offset`.
    pub(crate) fn words(&self, offset: usize, count: usize) -> &'a [Word] {
        debug_assert!(offset % 2 == 0, "unaligned packet memory offset {}", offset);
        &self.words[offset / 2..offset / 2 + count]
    }

    /// Read the 16-bit word at `offset`.
    pub fn read_word(&self, offset: usize) -> u16 {
        self.words(offset, 1)[0].read()
    }

    /// Write the 16-bit word at `offset`.
    pub fn write_word(&self, offset: usize, value: u16) {
        self.words(offset, 1)[0].write(value)
    }

    /// Copy `buffer.len()` bytes starting at `offset` into `buffer`.
    pub fn read(&self, offset: usize, buffer: &mut [u8]) {
        let words = self.words(offset, buffer.len().div_ceil(2));
        for (dst, word) in buffer.chunks_mut(2).zip(words) {
            let bytes = word.read().to_le_bytes();
            dst.copy_from_slice(&bytes[..dst.len()]);
        }
    }

    /// Copy `data` into packet memory, starting at `offset`.
    ///
    /// An odd-length copy zeroes the unused upper byte of the final word.
    pub fn write(&self, offset: usize, data: &[u8]) {
        let words = self.words(offset, data.len().div_ceil(2));
        for (src, word) in data.chunks(2).zip(words) {
            let mut bytes = [0; 2];
            bytes[..src.len()].copy_from_slice(src);
            word.write(u16::from_le_bytes(bytes));
        }
    }
}
