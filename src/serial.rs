//! The serial byte stream
//!
//! [`SerialPort`] is the application's view of the virtual serial port.
//! [`SerialEndpoints`] is the driver's view of the same rings. Neither
//! blocks; every call returns how many bytes it moved.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::ring::{Consumer, Producer};

/// The application's half of the serial port
///
/// Use it from thread mode, or from any context other than the USB
/// interrupt. Bytes written here go to the host when the driver next
/// transmits; call the driver's `start_transmit` to send them right away.
pub struct SerialPort<'a, const N: usize> {
    rx: Consumer<'a, N>,
    tx: Producer<'a, N>,
    overruns: &'a AtomicU32,
}

impl<'a, const N: usize> SerialPort<'a, N> {
    pub(crate) fn new(rx: Consumer<'a, N>, tx: Producer<'a, N>, overruns: &'a AtomicU32) -> Self {
        SerialPort { rx, tx, overruns }
    }

    /// Read bytes from the host into `buffer`.
    ///
    /// Returns the number of bytes read, which may be zero.
    pub fn read(&mut self, buffer: &mut [u8]) -> usize {
        self.rx.pop(buffer)
    }

    /// Queue bytes for the host.
    ///
    /// Returns the number of bytes accepted, which is limited by the space
    /// available in the transmit ring.
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.tx.push(data)
    }

    /// Returns the number of bytes that are ready to read.
    pub fn bytes_available(&self) -> usize {
        self.rx.len()
    }

    /// Returns the number of bytes that [`write`](Self::write) can accept.
    pub fn space_available(&self) -> usize {
        self.tx.space()
    }

    /// Returns the total number of bytes from the host that were dropped
    /// because the receive ring was full.
    pub fn overruns(&self) -> u32 {
        self.overruns.load(Ordering::Relaxed)
    }
}

/// The driver's half of the serial port
///
/// Hand this to the driver. The driver fills the receive ring with OUT
/// data, and drains the transmit ring into IN packets.
pub struct SerialEndpoints<'a, const N: usize> {
    rx: Producer<'a, N>,
    tx: Consumer<'a, N>,
    overruns: &'a AtomicU32,
}

impl<'a, const N: usize> SerialEndpoints<'a, N> {
    pub(crate) fn new(rx: Producer<'a, N>, tx: Consumer<'a, N>, overruns: &'a AtomicU32) -> Self {
        SerialEndpoints { rx, tx, overruns }
    }

    /// Accept bytes from the host. Bytes that don't fit are dropped and
    /// counted.
    ///
    /// Returns the number of bytes accepted.
    pub(crate) fn receive(&mut self, data: &[u8]) -> usize {
        let accepted = self.rx.push(data);
        let dropped = data.len() - accepted;
        if dropped > 0 {
            // The driver is the only writer.
            let total = self
                .overruns
                .load(Ordering::Relaxed)
                .saturating_add(dropped as u32);
            self.overruns.store(total, Ordering::Relaxed);
            warn!("OVERRUN DROPPED {} TOTAL {}", dropped, total);
        }
        accepted
    }

    /// Copy bytes for the host into `buffer`. They stay queued until
    /// [`complete_transmit`](Self::complete_transmit).
    pub(crate) fn prepare_transmit(&self, buffer: &mut [u8]) -> usize {
        self.tx.peek(buffer)
    }

    /// Drop `count` bytes that the host acknowledged.
    pub(crate) fn complete_transmit(&mut self, count: usize) {
        self.tx.consume(count)
    }

    /// Returns the number of bytes waiting for the host.
    pub(crate) fn pending(&self) -> usize {
        self.tx.len()
    }
}

#[cfg(test)]
mod test {
    use crate::SerialBuffers;

    #[test]
    fn host_to_application() {
        let mut buffers = SerialBuffers::<64>::new();
        let (mut port, mut endpoints) = buffers.split();

        assert_eq!(endpoints.receive(b"hello, "), 7);
        assert_eq!(endpoints.receive(b"world"), 5);
        assert_eq!(port.bytes_available(), 12);

        let mut buffer = [0; 32];
        let len = port.read(&mut buffer);
        assert_eq!(&buffer[..len], b"hello, world");
        assert_eq!(port.read(&mut buffer), 0);
    }

    #[test]
    fn application_to_host() {
        let mut buffers = SerialBuffers::<16>::new();
        let (mut port, mut endpoints) = buffers.split();

        assert_eq!(port.write(&[7; 20]), 16);
        assert_eq!(port.space_available(), 0);
        assert_eq!(endpoints.pending(), 16);

        let mut packet = [0; 10];
        assert_eq!(endpoints.prepare_transmit(&mut packet), 10);
        assert_eq!(port.space_available(), 0);
        endpoints.complete_transmit(10);
        assert_eq!(port.space_available(), 10);
        assert_eq!(endpoints.pending(), 6);
    }

    #[test]
    fn overruns_keep_the_oldest_bytes() {
        let mut buffers = SerialBuffers::<64>::new();
        let (mut port, mut endpoints) = buffers.split();

        let first: [u8; 40] = core::array::from_fn(|i| i as u8);
        let second: [u8; 40] = core::array::from_fn(|i| 40 + i as u8);
        assert_eq!(endpoints.receive(&first), 40);
        assert_eq!(endpoints.receive(&second), 24);
        assert_eq!(port.overruns(), 16);

        let mut buffer = [0; 80];
        assert_eq!(port.read(&mut buffer), 64);
        let expected: [u8; 64] = core::array::from_fn(|i| i as u8);
        assert_eq!(&buffer[..64], &expected[..]);

        // A full ring drops a whole packet.
        assert_eq!(endpoints.receive(&[0; 64]), 64);
        assert_eq!(endpoints.receive(&[0; 10]), 0);
        assert_eq!(port.overruns(), 26);
    }
}
