//! Endpoint register model
//!
//! Each endpoint register mixes three kinds of fields. `EP_TYPE`, `EP_KIND`,
//! and `EA` are plain read/write. `CTR_RX` and `CTR_TX` are cleared by
//! writing zero; writing one has no effect. `DTOG_*` and `STAT_*` toggle
//! when software writes one. A naive read-modify-write corrupts the
//! register, so every write here is built from the current value:
//!
//! - read/write fields keep their current value,
//! - `CTR_*` fields are written as one, unless we're clearing them,
//! - toggle fields are written as `current ^ desired` for the fields we
//!   change, and zero otherwise.
//!
//! The `Endpoint` also owns the data toggle model. The driver never asks the
//! peripheral which toggle comes next; when it arms an endpoint, it commands
//! the peripheral's `DTOG` to match the model.

use bitflags::bitflags;
use usb_device::UsbDirection;

use crate::{ral, ral::usb::EPR, Registers};

/// Fields that we rewrite with their current value.
const RW_FIELDS: u16 = EPR::EP_TYPE::mask | EPR::EP_KIND::mask | EPR::EA::mask;
/// Fields that are cleared by writing zero.
const COMPLETE_FIELDS: u16 = EPR::CTR_RX::mask | EPR::CTR_TX::mask;

/// Endpoint handshake status, for one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    /// The endpoint ignores all tokens.
    Disabled = 0b00,
    /// The endpoint answers with STALL.
    Stall = 0b01,
    /// The endpoint answers with NAK.
    Nak = 0b10,
    /// The endpoint is ready for one transaction.
    Valid = 0b11,
}

#[cfg(test)]
impl Status {
    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Status::Disabled,
            0b01 => Status::Stall,
            0b10 => Status::Nak,
            _ => Status::Valid,
        }
    }
}

/// Endpoint types that this driver can program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Control,
    Bulk,
}

impl Kind {
    fn ep_type(self) -> u16 {
        match self {
            Kind::Control => EPR::EP_TYPE::RW::CONTROL,
            Kind::Bulk => EPR::EP_TYPE::RW::BULK,
        }
    }
}

bitflags! {
    /// Endpoint directions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Directions : u8 {
        const OUT = 1 << 0;
        const IN = 1 << 1;
    }
}

impl From<UsbDirection> for Directions {
    fn from(direction: UsbDirection) -> Self {
        match direction {
            UsbDirection::Out => Directions::OUT,
            UsbDirection::In => Directions::IN,
        }
    }
}

/// The `(DTOG, STAT)` masks and `STAT` offset for a direction.
fn direction_fields(direction: UsbDirection) -> (u16, u16, u16) {
    match direction {
        UsbDirection::Out => (
            EPR::DTOG_RX::mask,
            EPR::STAT_RX::mask,
            EPR::STAT_RX::offset,
        ),
        UsbDirection::In => (
            EPR::DTOG_TX::mask,
            EPR::STAT_TX::mask,
            EPR::STAT_TX::offset,
        ),
    }
}

fn complete_field(direction: UsbDirection) -> u16 {
    match direction {
        UsbDirection::Out => EPR::CTR_RX::mask,
        UsbDirection::In => EPR::CTR_TX::mask,
    }
}

/// A USB endpoint, and its data toggle model
///
/// Endpoint `n` uses endpoint register `n`, and answers to endpoint
/// address `n`.
pub struct Endpoint {
    number: u8,
    kind: Kind,
    /// `true` for DATA1.
    tx_toggle: bool,
    rx_toggle: bool,
    stalled: Directions,
}

impl Endpoint {
    /// # Panics
    ///
    /// Panics if `number` doesn't name one of the eight endpoint registers.
    pub fn new(number: u8, kind: Kind) -> Self {
        assert!(usize::from(number) < crate::ENDPOINT_COUNT);
        Endpoint {
            number,
            kind,
            tx_toggle: false,
            rx_toggle: false,
            stalled: Directions::empty(),
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    /// Write the endpoint register.
    ///
    /// `mask` selects the toggle fields to change, and `desired` holds their
    /// new values. `clear` selects the completion flags to clear.
    fn command<R: Registers + ?Sized>(&self, regs: &R, mask: u16, desired: u16, clear: u16) {
        let epr = ral::endpoint(regs, self.number);
        let current = ral::read_reg!(ral::usb, &epr, EPR);
        let value = (current & RW_FIELDS) | (COMPLETE_FIELDS & !clear) | ((current ^ desired) & mask);
        ral::write_reg!(ral::usb, &epr, EPR, value);
    }

    /// Program the endpoint type and address, and set each direction's
    /// status.
    ///
    /// Both toggles reset to DATA0, halts are cleared, and any pending
    /// completions are dropped.
    pub fn configure<R: Registers + ?Sized>(&mut self, regs: &R, rx: Status, tx: Status) {
        self.tx_toggle = false;
        self.rx_toggle = false;
        self.stalled = Directions::empty();

        let epr = ral::endpoint(regs, self.number);
        let current = ral::read_reg!(ral::usb, &epr, EPR);
        let toggles =
            EPR::DTOG_RX::mask | EPR::STAT_RX::mask | EPR::DTOG_TX::mask | EPR::STAT_TX::mask;
        let desired = ((rx as u16) << EPR::STAT_RX::offset) | ((tx as u16) << EPR::STAT_TX::offset);
        ral::write_reg!(
            ral::usb,
            &epr,
            EPR,
            (self.kind.ep_type() << EPR::EP_TYPE::offset)
                | u16::from(self.number)
                | ((current ^ desired) & toggles)
        );
        debug!(
            "EP{} CONFIGURE RX {} TX {}",
            self.number,
            rx as u16,
            tx as u16
        );
    }

    /// Set the handshake status for one direction.
    ///
    /// Arming the endpoint with `Valid` also commands the peripheral's data
    /// toggle to match the model.
    pub fn set_status<R: Registers + ?Sized>(
        &mut self,
        regs: &R,
        direction: UsbDirection,
        status: Status,
    ) {
        let (dtog, stat, offset) = direction_fields(direction);
        let mut mask = stat;
        let mut desired = (status as u16) << offset;
        if status == Status::Valid {
            mask |= dtog;
            if self.toggle(direction) {
                desired |= dtog;
            }
        }
        self.command(regs, mask, desired, 0);
    }

    /// Returns the handshake status for one direction, as the peripheral
    /// sees it.
    #[cfg(test)]
    pub fn status<R: Registers + ?Sized>(&self, regs: &R, direction: UsbDirection) -> Status {
        let (_, stat, offset) = direction_fields(direction);
        let epr = ral::endpoint(regs, self.number);
        Status::from_bits((ral::read_reg!(ral::usb, &epr, EPR) & stat) >> offset)
    }

    /// Advance the data toggle model after a successful transaction.
    pub fn toggle_data(&mut self, direction: UsbDirection) {
        match direction {
            UsbDirection::Out => self.rx_toggle = !self.rx_toggle,
            UsbDirection::In => self.tx_toggle = !self.tx_toggle,
        }
    }

    /// Set the data toggle model. `true` is DATA1.
    pub fn set_toggle(&mut self, direction: UsbDirection, data1: bool) {
        match direction {
            UsbDirection::Out => self.rx_toggle = data1,
            UsbDirection::In => self.tx_toggle = data1,
        }
    }

    /// Returns the modelled data toggle for the next transaction. `true` is
    /// DATA1.
    pub fn toggle(&self, direction: UsbDirection) -> bool {
        match direction {
            UsbDirection::Out => self.rx_toggle,
            UsbDirection::In => self.tx_toggle,
        }
    }

    /// Indicates if the peripheral completed a transaction in this direction
    /// that we haven't yet cleared.
    pub fn is_complete<R: Registers + ?Sized>(&self, regs: &R, direction: UsbDirection) -> bool {
        let epr = ral::endpoint(regs, self.number);
        ral::read_reg!(ral::usb, &epr, EPR) & complete_field(direction) != 0
    }

    /// Clear the completion flag for one direction.
    pub fn clear_complete<R: Registers + ?Sized>(&self, regs: &R, direction: UsbDirection) {
        self.command(regs, 0, 0, complete_field(direction));
    }

    /// Halt, or resume, one direction.
    ///
    /// A halted direction answers STALL until it resumes. Resuming resets
    /// the direction's toggle to DATA0 and leaves it NAKing; the caller
    /// re-arms it.
    pub fn set_stalled<R: Registers + ?Sized>(
        &mut self,
        regs: &R,
        direction: UsbDirection,
        stalled: bool,
    ) {
        self.stalled.set(direction.into(), stalled);
        if stalled {
            self.set_status(regs, direction, Status::Stall);
        } else {
            self.set_toggle(direction, false);
            self.set_status(regs, direction, Status::Nak);
        }
        debug!("EP{} {:?} STALL {}", self.number, direction, stalled);
    }

    /// Indicates if a direction is halted.
    pub fn is_stalled(&self, direction: UsbDirection) -> bool {
        self.stalled.contains(direction.into())
    }

    /// Disable both directions, and drop any pending completions.
    pub fn disable<R: Registers + ?Sized>(&mut self, regs: &R) {
        self.configure(regs, Status::Disabled, Status::Disabled);
    }
}

/// Clear both completion flags of an endpoint register that has no
/// `Endpoint`.
pub fn clear_unexpected<R: Registers + ?Sized>(regs: &R, index: u8) {
    let epr = ral::endpoint(regs, index);
    let current = ral::read_reg!(ral::usb, &epr, EPR);
    ral::write_reg!(ral::usb, &epr, EPR, current & RW_FIELDS);
}
