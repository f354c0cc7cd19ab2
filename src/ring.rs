//! Single-producer, single-consumer byte rings
//!
//! The driver and the application share two rings: one carries bytes from
//! the host (the driver produces, the application consumes), and one
//! carries bytes to the host (the application produces, the driver
//! consumes). Each index has one writer. The producer publishes `head`
//! with a `Release` store after writing the data, and the consumer
//! publishes `tail` the same way after reading it. Indices run freely and
//! wrap; a ring of capacity `N` holds `N` bytes.

#![allow(clippy::declare_interior_mutable_const)] // Usage is legit in this module.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use crate::serial::{SerialEndpoints, SerialPort};

/// A fixed-capacity byte ring
///
/// Only reachable through one [`Producer`] and one [`Consumer`].
pub struct RingBuffer<const N: usize> {
    slots: [UnsafeCell<u8>; N],
    /// Total bytes ever written. Owned by the producer.
    head: AtomicUsize,
    /// Total bytes ever read. Owned by the consumer.
    tail: AtomicUsize,
}

// Safety: slots between tail and head belong to the consumer, and all
// others belong to the producer. There's only one of each.
unsafe impl<const N: usize> Sync for RingBuffer<N> {}

impl<const N: usize> RingBuffer<N> {
    const POWER_OF_TWO: () = assert!(N.is_power_of_two(), "ring capacity must be a power of two");

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::POWER_OF_TWO;
        const SLOT: UnsafeCell<u8> = UnsafeCell::new(0);
        RingBuffer {
            slots: [SLOT; N],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    fn slot(&self, index: usize) -> *mut u8 {
        self.slots[index & (N - 1)].get()
    }

    fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }
}

/// The writing end of a ring
pub struct Producer<'a, const N: usize> {
    ring: &'a RingBuffer<N>,
}

impl<const N: usize> Producer<'_, N> {
    /// Returns the number of bytes that the ring can accept.
    pub fn space(&self) -> usize {
        N - self.ring.len()
    }

    /// Copy as much of `data` as fits. Returns the number of bytes copied.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let head = self.ring.head.load(Ordering::Relaxed);
        let count = data.len().min(self.space());
        for (offset, byte) in data[..count].iter().enumerate() {
            // Safety: slots from head up to tail + N belong to the producer.
            unsafe { self.ring.slot(head.wrapping_add(offset)).write(*byte) };
        }
        self.ring
            .head
            .store(head.wrapping_add(count), Ordering::Release);
        count
    }
}

/// The reading end of a ring
pub struct Consumer<'a, const N: usize> {
    ring: &'a RingBuffer<N>,
}

impl<const N: usize> Consumer<'_, N> {
    /// Returns the number of bytes waiting in the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Copy as many bytes as fit into `buffer`, and leave them in the ring.
    /// Returns the number of bytes copied.
    pub fn peek(&self, buffer: &mut [u8]) -> usize {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        let count = buffer.len().min(self.len());
        for (offset, byte) in buffer[..count].iter_mut().enumerate() {
            // Safety: slots from tail up to head belong to the consumer.
            *byte = unsafe { self.ring.slot(tail.wrapping_add(offset)).read() };
        }
        count
    }

    /// Release `count` bytes back to the producer.
    ///
    /// # Panics
    ///
    /// Panics if the ring holds fewer than `count` bytes.
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len());
        let tail = self.ring.tail.load(Ordering::Relaxed);
        self.ring
            .tail
            .store(tail.wrapping_add(count), Ordering::Release);
    }

    /// Move as many bytes as fit into `buffer`. Returns the number of bytes
    /// moved.
    pub fn pop(&mut self, buffer: &mut [u8]) -> usize {
        let count = self.peek(buffer);
        self.consume(count);
        count
    }
}

/// Storage for the serial port's two rings
///
/// Allocate one, and [`split`](SerialBuffers::split) it into the
/// application's [`SerialPort`] and the driver's [`SerialEndpoints`].
/// `N` is the capacity of each ring, and must be a power of two.
///
/// ```
/// use usbd_vsp::SerialBuffers;
///
/// let mut buffers = SerialBuffers::<64>::new();
/// let (mut port, _endpoints) = buffers.split();
///
/// assert_eq!(port.write(b"hello"), 5);
/// assert_eq!(port.space_available(), 59);
/// assert_eq!(port.bytes_available(), 0);
/// ```
///
/// To share the rings with a driver that lives in an interrupt handler,
/// allocate them with a `'static` lifetime, for instance with
/// `cortex_m::singleton!`.
pub struct SerialBuffers<const N: usize> {
    /// Bytes from the host.
    rx: RingBuffer<N>,
    /// Bytes to the host.
    tx: RingBuffer<N>,
    /// Bytes from the host that didn't fit in `rx`. Written by the driver.
    overruns: AtomicU32,
}

impl<const N: usize> SerialBuffers<N> {
    pub const fn new() -> Self {
        SerialBuffers {
            rx: RingBuffer::new(),
            tx: RingBuffer::new(),
            overruns: AtomicU32::new(0),
        }
    }

    /// Split the rings into the application and driver halves.
    ///
    /// The exclusive borrow guarantees one producer and one consumer per
    /// ring.
    pub fn split(&mut self) -> (SerialPort<'_, N>, SerialEndpoints<'_, N>) {
        let port = SerialPort::new(
            Consumer { ring: &self.rx },
            Producer { ring: &self.tx },
            &self.overruns,
        );
        let endpoints = SerialEndpoints::new(
            Producer { ring: &self.rx },
            Consumer { ring: &self.tx },
            &self.overruns,
        );
        (port, endpoints)
    }
}

impl<const N: usize> Default for SerialBuffers<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::{Consumer, Producer, RingBuffer};

    #[test]
    fn fifo_order() {
        let ring = RingBuffer::<8>::new();
        let mut producer = Producer { ring: &ring };
        let mut consumer = Consumer { ring: &ring };

        assert_eq!(producer.push(&[1, 2, 3]), 3);
        let mut out = [0; 2];
        assert_eq!(consumer.pop(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(consumer.len(), 1);
    }

    #[test]
    fn full_capacity_and_wrap() {
        let ring = RingBuffer::<8>::new();
        let mut producer = Producer { ring: &ring };
        let mut consumer = Consumer { ring: &ring };

        assert_eq!(producer.push(&[0; 6]), 6);
        let mut out = [0; 6];
        consumer.pop(&mut out);

        // Wraps around the end of the slots.
        let data = [1, 2, 3, 4, 5, 6, 7, 8, 9];
        assert_eq!(producer.push(&data), 8);
        assert_eq!(producer.space(), 0);
        assert_eq!(producer.push(&data), 0);

        let mut out = [0; 16];
        assert_eq!(consumer.pop(&mut out), 8);
        assert_eq!(&out[..8], &data[..8]);
        assert_eq!(consumer.len(), 0);
        assert_eq!(consumer.pop(&mut out), 0);
    }

    #[test]
    fn peek_keeps_bytes_until_consumed() {
        let ring = RingBuffer::<8>::new();
        let mut producer = Producer { ring: &ring };
        let mut consumer = Consumer { ring: &ring };

        producer.push(&[1, 2, 3, 4, 5]);
        let mut out = [0; 4];
        assert_eq!(consumer.peek(&mut out), 4);
        assert_eq!(consumer.peek(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(producer.space(), 3);

        consumer.consume(4);
        assert_eq!(producer.space(), 7);
        assert_eq!(consumer.pop(&mut out), 1);
        assert_eq!(out[0], 5);
    }

    #[test]
    fn indices_wrap_around_usize() {
        let ring = RingBuffer::<4>::new();
        ring.head.store(usize::MAX - 1, core::sync::atomic::Ordering::Relaxed);
        ring.tail.store(usize::MAX - 1, core::sync::atomic::Ordering::Relaxed);
        let mut producer = Producer { ring: &ring };
        let mut consumer = Consumer { ring: &ring };

        assert_eq!(producer.push(&[1, 2, 3, 4]), 4);
        assert_eq!(producer.space(), 0);
        let mut out = [0; 4];
        assert_eq!(consumer.pop(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
    }
}
