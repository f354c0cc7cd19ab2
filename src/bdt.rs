//! Buffer descriptor table (BDT)
//!
//! The table lives at the start of packet memory. Each endpoint register
//! `n` has one entry at byte offset `8 * n`, describing where its transmit
//! and receive buffers live in packet memory, how many bytes to transmit,
//! and how many bytes were received.
//!
//! Entries implement a RAL-compatible interface, just like the peripheral
//! registers.

#![allow(non_snake_case, non_upper_case_globals)]

use core::fmt;

use crate::{
    pma::{PacketMemory, Word},
    ral, ENDPOINT_COUNT, MAX_PACKET_SIZE,
};

/// Table offset in packet memory. Matches the `BTABLE` register.
pub const TABLE_OFFSET: usize = 0;
/// The table's footprint: eight entries of eight bytes.
pub const TABLE_SIZE: usize = ENDPOINT_COUNT * core::mem::size_of::<BufferDescriptor>();

/// One table entry
#[repr(C)]
pub struct BufferDescriptor {
    pub ADDR_TX: Word,
    pub COUNT_TX: Word,
    pub ADDR_RX: Word,
    pub COUNT_RX: Word,
}

const _: [(); 1] = [(); (core::mem::size_of::<BufferDescriptor>() == 8) as usize];

pub mod ADDR_TX {
    fields! { ADDR_TX: 1, 15; }
}

pub mod COUNT_TX {
    fields! { COUNT_TX: 0, 10; }
}

pub mod ADDR_RX {
    fields! { ADDR_RX: 1, 15; }
}

/// Receive count, and the receive buffer size
///
/// The peripheral writes `COUNT_RX` on every reception. Software owns
/// `BL_SIZE` and `NUM_BLOCK`: with `BL_SIZE` clear, the buffer holds
/// `NUM_BLOCK` 2-byte blocks; with `BL_SIZE` set, it holds `NUM_BLOCK + 1`
/// 32-byte blocks.
pub mod COUNT_RX {
    fields! {
        BL_SIZE: 15, 1;
        NUM_BLOCK: 10, 5;
        COUNT_RX: 0, 10;
    }
}

/// Why an endpoint buffer layout was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// There's no table entry for this endpoint.
    Endpoint(u8),
    /// The buffer size can't be expressed in the receive count encoding,
    /// or exceeds the maximum packet size.
    PacketSize(usize),
    /// The buffer offset isn't 16-bit aligned.
    Misaligned(usize),
    /// The buffer starts inside the table's own footprint.
    OverlapsTable(usize),
    /// The buffer extends past the end of packet memory.
    OutOfBounds(usize),
    /// Two buffers share packet memory. `other` may equal `endpoint` when
    /// an endpoint's transmit and receive buffers overlap.
    Overlap { endpoint: u8, other: u8 },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::Endpoint(endpoint) => {
                write!(f, "endpoint {endpoint} has no buffer descriptor")
            }
            LayoutError::PacketSize(size) => write!(f, "unsupported buffer size {size}"),
            LayoutError::Misaligned(offset) => write!(f, "buffer offset {offset:#x} is unaligned"),
            LayoutError::OverlapsTable(offset) => {
                write!(f, "buffer offset {offset:#x} overlaps the descriptor table")
            }
            LayoutError::OutOfBounds(offset) => {
                write!(f, "buffer at {offset:#x} exceeds packet memory")
            }
            LayoutError::Overlap { endpoint, other } => {
                write!(f, "endpoint {endpoint} buffers overlap endpoint {other} buffers")
            }
        }
    }
}

/// Encode a receive buffer size as `(BL_SIZE, NUM_BLOCK)`.
const fn rx_blocks(size: usize) -> Option<(u16, u16)> {
    if size == 0 || size % 2 != 0 {
        None
    } else if size <= 62 {
        Some((0, (size / 2) as u16))
    } else if size == MAX_PACKET_SIZE {
        Some((1, (size / 32 - 1) as u16))
    } else {
        None
    }
}

/// Packet memory reserved for one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    tx: usize,
    rx: usize,
    size: usize,
}

impl Region {
    fn spans(&self) -> [core::ops::Range<usize>; 2] {
        [self.tx..self.tx + self.size, self.rx..self.rx + self.size]
    }
}

fn overlaps(a: &core::ops::Range<usize>, b: &core::ops::Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

/// The buffer descriptor table, and the packet memory regions it describes
pub struct BufferDescriptorTable<'a> {
    pma: PacketMemory<'a>,
    regions: [Option<Region>; ENDPOINT_COUNT],
}

impl<'a> BufferDescriptorTable<'a> {
    /// Take packet memory for the table. Packet memory must at least hold
    /// the table.
    pub fn new(pma: PacketMemory<'a>) -> Result<Self, LayoutError> {
        if pma.len() < TABLE_OFFSET + TABLE_SIZE {
            return Err(LayoutError::OutOfBounds(TABLE_OFFSET));
        }
        Ok(BufferDescriptorTable {
            pma,
            regions: [None; ENDPOINT_COUNT],
        })
    }

    fn entry(&self, endpoint: u8) -> &'a BufferDescriptor {
        let words = self.pma.words(TABLE_OFFSET + usize::from(endpoint) * 8, 4);
        // Safety: BufferDescriptor is four words, and we just took four
        // in-bounds words from packet memory.
        unsafe { &*words.as_ptr().cast::<BufferDescriptor>() }
    }

    /// Reserve `size` bytes at `tx_offset` and `rx_offset` for `endpoint`,
    /// and write the table entry.
    ///
    /// Reconfiguring an endpoint replaces its previous regions.
    pub fn configure(
        &mut self,
        endpoint: u8,
        tx_offset: usize,
        rx_offset: usize,
        size: usize,
    ) -> Result<(), LayoutError> {
        let index = usize::from(endpoint);
        if index >= ENDPOINT_COUNT {
            return Err(LayoutError::Endpoint(endpoint));
        }
        if rx_blocks(size).is_none() {
            return Err(LayoutError::PacketSize(size));
        }

        let region = Region {
            tx: tx_offset,
            rx: rx_offset,
            size,
        };
        let spans = region.spans();
        for span in &spans {
            if span.start % 2 != 0 {
                return Err(LayoutError::Misaligned(span.start));
            }
            if span.start < TABLE_OFFSET + TABLE_SIZE {
                return Err(LayoutError::OverlapsTable(span.start));
            }
            if span.end > self.pma.len() {
                return Err(LayoutError::OutOfBounds(span.start));
            }
        }
        if overlaps(&spans[0], &spans[1]) {
            return Err(LayoutError::Overlap {
                endpoint,
                other: endpoint,
            });
        }

        for (other, existing) in self.regions.iter().enumerate() {
            if other == index {
                continue;
            }
            if let Some(existing) = existing {
                let collides = spans
                    .iter()
                    .any(|span| existing.spans().iter().any(|theirs| overlaps(span, theirs)));
                if collides {
                    return Err(LayoutError::Overlap {
                        endpoint,
                        other: other as u8,
                    });
                }
            }
        }

        self.regions[index] = Some(region);
        self.write_entry(endpoint, &region);
        trace!(
            "BDT ENDPOINT {} TX {} RX {} SIZE {}",
            endpoint,
            tx_offset,
            rx_offset,
            size
        );
        Ok(())
    }

    fn write_entry(&self, endpoint: u8, region: &Region) {
        let entry = self.entry(endpoint);
        // Sizes are validated in configure.
        let (bl_size, num_block) = rx_blocks(region.size).unwrap_or((0, 0));
        ral::write_reg!(self, entry, ADDR_TX, ADDR_TX: (region.tx >> 1) as u16);
        ral::write_reg!(self, entry, COUNT_TX, 0);
        ral::write_reg!(self, entry, ADDR_RX, ADDR_RX: (region.rx >> 1) as u16);
        ral::write_reg!(self, entry, COUNT_RX, BL_SIZE: bl_size, NUM_BLOCK: num_block);
    }

    /// Rewrite every configured entry.
    ///
    /// Use this after anything that may have clobbered the table.
    pub fn restore(&self) {
        for (endpoint, region) in self.regions.iter().enumerate() {
            if let Some(region) = region {
                self.write_entry(endpoint as u8, region);
            }
        }
    }

    /// Returns the buffer size for `endpoint`, or zero if the endpoint
    /// isn't configured.
    pub fn max_packet_size(&self, endpoint: u8) -> usize {
        self.regions
            .get(usize::from(endpoint))
            .copied()
            .flatten()
            .map_or(0, |region| region.size)
    }

    /// Set the number of bytes to send on the next IN transaction.
    pub fn set_transmit_count(&self, endpoint: u8, count: usize) {
        debug_assert!(count <= self.max_packet_size(endpoint));
        let entry = self.entry(endpoint);
        ral::write_reg!(self, entry, COUNT_TX, COUNT_TX: count as u16);
    }

    /// Returns the number of bytes received in the last OUT or SETUP
    /// transaction.
    pub fn receive_count(&self, endpoint: u8) -> usize {
        let entry = self.entry(endpoint);
        usize::from(ral::read_reg!(self, entry, COUNT_RX, COUNT_RX))
    }

    /// Copy `data` into the transmit buffer, and set the transmit count.
    ///
    /// Copies at most one buffer's worth of data. Returns the number of
    /// bytes that will be sent.
    pub fn write_transmit(&self, endpoint: u8, data: &[u8]) -> usize {
        let Some(region) = self.regions[usize::from(endpoint)] else {
            return 0;
        };
        let len = data.len().min(region.size);
        self.pma.write(region.tx, &data[..len]);
        self.set_transmit_count(endpoint, len);
        len
    }

    /// Copy the received packet into `buffer`.
    ///
    /// Returns the number of bytes copied. That's the receive count, limited
    /// by the size of `buffer`.
    pub fn read_receive(&self, endpoint: u8, buffer: &mut [u8]) -> usize {
        let Some(region) = self.regions[usize::from(endpoint)] else {
            return 0;
        };
        let len = self
            .receive_count(endpoint)
            .min(region.size)
            .min(buffer.len());
        self.pma.read(region.rx, &mut buffer[..len]);
        len
    }
}

#[cfg(test)]
mod test {
    use super::{BufferDescriptorTable, LayoutError};
    use crate::{PacketMemory, PacketMemoryBuffer};

    #[test]
    fn reference_layout() {
        let buffer = PacketMemoryBuffer::<512>::new();
        let pma = PacketMemory::new(&buffer);
        let mut bdt = BufferDescriptorTable::new(pma).unwrap();
        bdt.configure(0, 0x40, 0x80, 64).unwrap();
        bdt.configure(1, 0xC0, 0x100, 64).unwrap();

        assert_eq!(pma.read_word(0), 0x40);
        assert_eq!(pma.read_word(2), 0);
        assert_eq!(pma.read_word(4), 0x80);
        assert_eq!(pma.read_word(6), 0x8400);
        assert_eq!(pma.read_word(8), 0xC0);
        assert_eq!(pma.read_word(12), 0x100);
        assert_eq!(pma.read_word(14), 0x8400);
    }

    #[test]
    fn small_buffers() {
        let buffer = PacketMemoryBuffer::<512>::new();
        let pma = PacketMemory::new(&buffer);
        let mut bdt = BufferDescriptorTable::new(pma).unwrap();
        bdt.configure(2, 0x40, 0x48, 8).unwrap();
        assert_eq!(pma.read_word(2 * 8 + 6), 4 << 10);

        assert_eq!(bdt.configure(2, 0x40, 0x48, 7), Err(LayoutError::PacketSize(7)));
        assert_eq!(bdt.configure(2, 0x40, 0x80, 63), Err(LayoutError::PacketSize(63)));
        assert_eq!(bdt.configure(2, 0x40, 0x80, 128), Err(LayoutError::PacketSize(128)));
    }

    #[test]
    fn invalid_layouts() {
        let buffer = PacketMemoryBuffer::<128>::new();
        let pma = PacketMemory::new(&buffer);
        let mut bdt = BufferDescriptorTable::new(pma).unwrap();

        assert_eq!(bdt.configure(8, 0x40, 0x80, 64), Err(LayoutError::Endpoint(8)));
        assert_eq!(bdt.configure(0, 0x41, 0x80, 64), Err(LayoutError::Misaligned(0x41)));
        assert_eq!(bdt.configure(0, 0x20, 0x80, 64), Err(LayoutError::OverlapsTable(0x20)));
        assert_eq!(bdt.configure(0, 0x40, 0xE0, 64), Err(LayoutError::OutOfBounds(0xE0)));
        assert_eq!(
            bdt.configure(0, 0x40, 0x60, 64),
            Err(LayoutError::Overlap { endpoint: 0, other: 0 })
        );

        bdt.configure(0, 0x40, 0x80, 64).unwrap();
        assert_eq!(
            bdt.configure(1, 0x80, 0x40, 64),
            Err(LayoutError::Overlap { endpoint: 1, other: 0 })
        );
        // Reconfiguring the same endpoint may reuse its own memory.
        bdt.configure(0, 0x80, 0x40, 64).unwrap();
    }

    #[test]
    fn table_needs_packet_memory() {
        let buffer = PacketMemoryBuffer::<16>::new();
        assert!(BufferDescriptorTable::new(PacketMemory::new(&buffer)).is_err());
    }

    #[test]
    fn transmit_and_receive() {
        let buffer = PacketMemoryBuffer::<512>::new();
        let pma = PacketMemory::new(&buffer);
        let mut bdt = BufferDescriptorTable::new(pma).unwrap();
        bdt.configure(1, 0xC0, 0x100, 64).unwrap();

        assert_eq!(bdt.write_transmit(1, &[1, 2, 3]), 3);
        assert_eq!(pma.read_word(8 + 2), 3);
        assert_eq!(pma.read_word(0xC0), 0x0201);

        // What the peripheral does on reception.
        pma.write(0x100, &[9, 8, 7, 6, 5]);
        pma.write_word(8 + 6, 0x8400 | 5);
        assert_eq!(bdt.receive_count(1), 5);
        let mut out = [0; 4];
        assert_eq!(bdt.read_receive(1, &mut out), 4);
        assert_eq!(out, [9, 8, 7, 6]);

        // Unconfigured endpoints move nothing.
        assert_eq!(bdt.write_transmit(3, &[1]), 0);
        assert_eq!(bdt.read_receive(3, &mut out), 0);
    }

    #[test]
    fn restore_rewrites_entries() {
        let buffer = PacketMemoryBuffer::<512>::new();
        let pma = PacketMemory::new(&buffer);
        let mut bdt = BufferDescriptorTable::new(pma).unwrap();
        bdt.configure(0, 0x40, 0x80, 64).unwrap();
        for offset in (0..8).step_by(2) {
            pma.write_word(offset, 0xFFFF);
        }
        bdt.restore();
        assert_eq!(pma.read_word(0), 0x40);
        assert_eq!(pma.read_word(6), 0x8400);
    }
}
