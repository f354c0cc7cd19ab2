//! A USB CDC virtual serial port driver for STM32 USB full-speed devices
//!
//! `usbd-vsp` drives the STM32 "USB FS device" peripheral: the one with a
//! buffer descriptor table, a dedicated packet memory, and `EPnR` endpoint
//! registers. It enumerates as a CDC-ACM device, and moves bytes between
//! the host and two ring buffers. Your application reads and writes those
//! ring buffers; it never touches the peripheral.
//!
//! To interface the library, you must define a safe implementation of
//! [`Peripherals`]. See the [`Device`] documentation for a complete example.
//!
//! # Design
//!
//! All peripheral state changes happen in one execution context, the USB
//! interrupt. The [`Driver`] reads the interrupt status, and dispatches
//! each event to either the control endpoint (EP0) state machine or the
//! bulk data endpoint (EP1). Application code runs elsewhere, and only
//! touches the [`SerialPort`] half of the [`SerialBuffers`]. Each ring buffer
//! index has exactly one writer, so the two contexts never lock.
//!
//! The driver never reads data toggle state back from the peripheral to
//! decide what comes next. It keeps its own model of each endpoint's
//! toggles, and commands the peripheral to match.
//!
//! Register access goes through the [`Registers`] trait. The memory-mapped
//! implementation comes from [`Peripherals`]; tests substitute a simulated
//! peripheral.

#![no_std]

// defmt's macros name the crate `defmt`.
#[cfg(feature = "defmt-03")]
extern crate defmt_03 as defmt;

#[macro_use]
mod log;
#[macro_use]
mod ral;

mod bdt;
mod bulk;
mod cdc;
mod control;
pub mod descriptor;
mod device;
mod driver;
mod endpoint;
mod pma;
mod ring;
mod serial;
mod state;

#[cfg(test)]
mod sim;

pub use bdt::LayoutError;
pub use cdc::{ControlLines, LineCoding, Parity, StopBits};
pub use control::ProtocolError;
pub use descriptor::Descriptors;
pub use device::Device;
pub use driver::{Config, Driver, EndpointLayout, Event, Interrupts, Transfer};
pub use pma::{PacketMemory, PacketMemoryBuffer};
pub use ring::SerialBuffers;
pub use serial::{SerialEndpoints, SerialPort};
pub use state::DeviceState;

/// Number of endpoint registers, and buffer descriptor table entries
pub const ENDPOINT_COUNT: usize = 8;

/// Maximum packet size for both the control and data endpoints
pub const MAX_PACKET_SIZE: usize = 64;

/// A type that owns the USB register block and packet memory
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the USB
/// register block and the USB packet memory. The pointers returned by the
/// methods are assumed to be valid, and will be cast to a register
/// definition and a packet memory view.
///
/// # Example
///
/// A safe implementation of `Peripherals` for an STM32F0, where a PAC
/// hands out the USB peripheral. Assume that `pac` is your device's
/// peripheral access crate.
///
/// ```
/// # mod pac { pub struct USB; impl USB { pub const PTR: *const () = 0x4000_5C00 as *const (); } }
/// use usbd_vsp::Peripherals;
///
/// struct Usb {
///     _usb: pac::USB,
/// }
///
/// unsafe impl Peripherals for Usb {
///     fn usb(&self) -> *const () {
///         pac::USB::PTR
///     }
///     fn packet_memory(&self) -> *const () {
///         0x4000_6000 as *const ()
///     }
/// }
///
/// let usb = Usb { _usb: pac::USB };
/// assert_eq!(usb.packet_memory_size(), 1024);
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the USB registers
    fn usb(&self) -> *const ();
    /// Returns the address of the USB packet memory, as seen by the CPU
    fn packet_memory(&self) -> *const ();
    /// Returns the size of the USB packet memory, in bytes
    ///
    /// The default is 1024 bytes, the size on STM32F0, L0, and G4 parts.
    fn packet_memory_size(&self) -> usize {
        1024
    }
}

/// A USB peripheral register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    /// `EPnR`, for endpoint register `n` in `0..8`
    Endpoint(u8),
    /// `CNTR`, control
    Cntr,
    /// `ISTR`, interrupt status
    Istr,
    /// `FNR`, frame number
    Fnr,
    /// `DADDR`, device address
    Daddr,
    /// `BTABLE`, buffer table address
    Btable,
    /// `BCDR`, battery charging detector (holds the D+ pull-up)
    Bcdr,
}

/// Access to the USB peripheral registers
///
/// This is the boundary between the driver and the hardware. The driver
/// expects the peripheral's access semantics: writing zero clears the
/// `CTR_*` endpoint flags and the `ISTR` event flags, and writing one
/// toggles the `DTOG_*` and `STAT_*` endpoint fields. Implementations
/// shouldn't cache or reorder accesses.
pub trait Registers {
    /// Read a register.
    fn read(&self, register: Register) -> u16;
    /// Write a register.
    fn write(&self, register: Register, value: u16);
}

impl<T: Registers + ?Sized> Registers for &T {
    fn read(&self, register: Register) -> u16 {
        T::read(self, register)
    }
    fn write(&self, register: Register, value: u16) {
        T::write(self, register, value)
    }
}
