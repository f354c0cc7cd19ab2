//! A simulated USB peripheral and host, for tests
//!
//! `SimRegisters` implements the peripheral's register access semantics,
//! including the clear-on-write-zero and toggle-on-write-one endpoint
//! fields. `Host` plays the other side of the bus: it issues SETUP, OUT,
//! and IN transactions against the simulated peripheral and packet memory,
//! the same way the peripheral would react to a real host.

extern crate std;

use core::cell::Cell;
use std::vec::Vec;

use crate::ral::usb::{DADDR, EPR, ISTR};
use crate::{
    Config, Driver, PacketMemory, PacketMemoryBuffer, Register, Registers, SerialEndpoints,
};

const EPR_RW: u16 = EPR::EP_TYPE::mask | EPR::EP_KIND::mask | EPR::EA::mask;
const EPR_TOGGLE: u16 =
    EPR::DTOG_RX::mask | EPR::STAT_RX::mask | EPR::DTOG_TX::mask | EPR::STAT_TX::mask;
const EPR_CLEAR: u16 = EPR::CTR_RX::mask | EPR::CTR_TX::mask;

const ISTR_EVENTS: u16 = ISTR::PMAOVR::mask
    | ISTR::ERR::mask
    | ISTR::WKUP::mask
    | ISTR::SUSP::mask
    | ISTR::RESET::mask
    | ISTR::SOF::mask
    | ISTR::ESOF::mask
    | ISTR::L1REQ::mask;

const NAK: u16 = 0b10;
const VALID: u16 = 0b11;
const STALL: u16 = 0b01;

/// Simulated USB registers
pub struct SimRegisters {
    epr: [Cell<u16>; 8],
    cntr: Cell<u16>,
    events: Cell<u16>,
    fnr: Cell<u16>,
    daddr: Cell<u16>,
    btable: Cell<u16>,
    bcdr: Cell<u16>,
}

impl SimRegisters {
    pub fn new() -> Self {
        const ZERO: Cell<u16> = Cell::new(0);
        SimRegisters {
            epr: [ZERO; 8],
            // FRES and PDWN are set out of reset.
            cntr: Cell::new(0b11),
            events: Cell::new(0),
            fnr: Cell::new(0),
            daddr: Cell::new(0),
            btable: Cell::new(0),
            bcdr: Cell::new(0),
        }
    }

    /// Raise interrupt status event flags, as the peripheral would.
    pub fn raise(&self, flags: u16) {
        self.events.set(self.events.get() | (flags & ISTR_EVENTS));
    }

    /// Peripheral-side endpoint register update. Bypasses write semantics.
    pub fn update_epr(&self, index: usize, func: impl FnOnce(u16) -> u16) {
        let epr = &self.epr[index];
        epr.set(func(epr.get()));
    }
}

impl Registers for SimRegisters {
    fn read(&self, register: Register) -> u16 {
        match register {
            Register::Endpoint(index) => self.epr[usize::from(index)].get(),
            Register::Cntr => self.cntr.get(),
            Register::Istr => {
                let mut istr = self.events.get();
                let pending = self
                    .epr
                    .iter()
                    .position(|epr| epr.get() & EPR_CLEAR != 0);
                if let Some(index) = pending {
                    istr |= ISTR::CTR::mask | index as u16;
                    if self.epr[index].get() & EPR::CTR_RX::mask != 0 {
                        istr |= ISTR::DIR::mask;
                    }
                }
                istr
            }
            Register::Fnr => self.fnr.get(),
            Register::Daddr => self.daddr.get(),
            Register::Btable => self.btable.get(),
            Register::Bcdr => self.bcdr.get(),
        }
    }

    fn write(&self, register: Register, value: u16) {
        match register {
            Register::Endpoint(index) => self.update_epr(usize::from(index), |old| {
                (value & EPR_RW)
                    | ((old ^ value) & EPR_TOGGLE)
                    | (old & value & EPR_CLEAR)
                    | (old & EPR::SETUP::mask)
            }),
            Register::Cntr => self.cntr.set(value),
            Register::Istr => self.events.set(self.events.get() & value & ISTR_EVENTS),
            Register::Fnr => {}
            Register::Daddr => self.daddr.set(value),
            Register::Btable => self.btable.set(value),
            Register::Bcdr => self.bcdr.set(value),
        }
    }
}

/// Why the device didn't accept a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Nak,
    Stall,
    /// The device didn't respond at all: wrong address, or disabled endpoint.
    Timeout,
}

/// An IN packet, and the data toggle it was sent with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub toggle: bool,
}

/// Build a SETUP packet.
pub fn request(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
    let mut setup = [request_type, request, 0, 0, 0, 0, 0, 0];
    setup[2..4].copy_from_slice(&value.to_le_bytes());
    setup[4..6].copy_from_slice(&index.to_le_bytes());
    setup[6..8].copy_from_slice(&length.to_le_bytes());
    setup
}

pub type SimDriver<'a, const N: usize> = Driver<'a, &'a SimRegisters, N>;

/// A simulated peripheral: registers plus 1KiB of packet memory.
pub struct Sim {
    pub regs: SimRegisters,
    pub pma: PacketMemoryBuffer<512>,
}

impl Sim {
    pub fn new() -> Self {
        Sim {
            regs: SimRegisters::new(),
            pma: PacketMemoryBuffer::new(),
        }
    }

    /// Create, initialize, and attach a driver.
    pub fn driver<'a, const N: usize>(
        &'a self,
        serial: SerialEndpoints<'a, N>,
    ) -> SimDriver<'a, N> {
        self.driver_with(serial, &Config::new())
    }

    pub fn driver_with<'a, const N: usize>(
        &'a self,
        serial: SerialEndpoints<'a, N>,
        config: &Config,
    ) -> SimDriver<'a, N> {
        let mut driver =
            Driver::new(&self.regs, PacketMemory::new(&self.pma), serial, config).unwrap();
        driver.initialize();
        driver.attach();
        driver
    }

    pub fn host(&self) -> Host<'_> {
        Host {
            regs: &self.regs,
            pma: PacketMemory::new(&self.pma),
            address: 0,
        }
    }
}

/// The host side of the bus
pub struct Host<'s> {
    regs: &'s SimRegisters,
    pma: PacketMemory<'s>,
    /// The address that the host uses for all transactions.
    pub address: u8,
}

impl Host<'_> {
    /// Find the endpoint register that answers for `endpoint`, if the
    /// device answers at our address.
    fn target(&self, endpoint: u8) -> Result<usize, Handshake> {
        let daddr = self.regs.daddr.get();
        let enabled = daddr & DADDR::EF::mask != 0;
        if !enabled || (daddr & DADDR::ADD::mask) as u8 != self.address {
            return Err(Handshake::Timeout);
        }
        self.regs
            .epr
            .iter()
            .position(|epr| epr.get() & EPR::EA::mask == u16::from(endpoint))
            .ok_or(Handshake::Timeout)
    }

    /// Returns the buffer descriptor table entry address for a register.
    fn entry(&self, index: usize) -> usize {
        usize::from(self.regs.btable.get() & !0b111) + index * 8
    }

    fn rx_capacity(count_rx: u16) -> usize {
        let blocks = usize::from((count_rx >> 10) & 0x1F);
        if count_rx & 0x8000 != 0 {
            (blocks + 1) * 32
        } else {
            blocks * 2
        }
    }

    fn receive(&self, index: usize, data: &[u8]) {
        let entry = self.entry(index);
        let addr = usize::from(self.pma.read_word(entry + 4));
        let count_rx = self.pma.read_word(entry + 6);
        assert!(
            data.len() <= Self::rx_capacity(count_rx),
            "babble: {} bytes into a {} byte buffer",
            data.len(),
            Self::rx_capacity(count_rx)
        );
        self.pma.write(addr, data);
        self.pma
            .write_word(entry + 6, (count_rx & !0x3FF) | data.len() as u16);
    }

    /// Signal a bus reset. Endpoint registers and the device address reset.
    pub fn reset(&mut self) {
        for epr in &self.regs.epr {
            epr.set(0);
        }
        self.regs.daddr.set(0);
        self.regs.raise(ISTR::RESET::mask);
        self.address = 0;
    }

    pub fn suspend(&self) {
        self.regs.raise(ISTR::SUSP::mask);
    }

    pub fn wakeup(&self) {
        self.regs.raise(ISTR::WKUP::mask);
    }

    /// Send a SETUP transaction to endpoint 0.
    ///
    /// The peripheral always accepts SETUP. It sets both toggles to DATA1,
    /// and NAKs both directions until software responds.
    pub fn setup(&self, packet: [u8; 8]) -> Result<(), Handshake> {
        let index = self.target(0)?;
        self.receive(index, &packet);
        self.regs.update_epr(index, |epr| {
            let epr = epr & !(EPR::STAT_RX::mask | EPR::STAT_TX::mask);
            epr | EPR::CTR_RX::mask
                | EPR::SETUP::mask
                | EPR::DTOG_RX::mask
                | EPR::DTOG_TX::mask
                | (NAK << EPR::STAT_RX::offset)
                | (NAK << EPR::STAT_TX::offset)
        });
        Ok(())
    }

    /// Send an OUT transaction. Returns the data toggle that the device
    /// expected, and accepted.
    pub fn out(&self, endpoint: u8, data: &[u8]) -> Result<bool, Handshake> {
        let index = self.target(endpoint)?;
        let epr = self.regs.epr[index].get();
        match (epr & EPR::STAT_RX::mask) >> EPR::STAT_RX::offset {
            VALID => {}
            NAK => return Err(Handshake::Nak),
            STALL => return Err(Handshake::Stall),
            _ => return Err(Handshake::Timeout),
        }
        self.receive(index, data);
        let toggle = epr & EPR::DTOG_RX::mask != 0;
        self.regs.update_epr(index, |epr| {
            let epr = (epr ^ EPR::DTOG_RX::mask) & !(EPR::STAT_RX::mask | EPR::SETUP::mask);
            epr | EPR::CTR_RX::mask | (NAK << EPR::STAT_RX::offset)
        });
        Ok(toggle)
    }

    /// Send an IN token, and collect the device's packet.
    pub fn input(&self, endpoint: u8) -> Result<Packet, Handshake> {
        let index = self.target(endpoint)?;
        let epr = self.regs.epr[index].get();
        match (epr & EPR::STAT_TX::mask) >> EPR::STAT_TX::offset {
            VALID => {}
            NAK => return Err(Handshake::Nak),
            STALL => return Err(Handshake::Stall),
            _ => return Err(Handshake::Timeout),
        }
        let entry = self.entry(index);
        let addr = usize::from(self.pma.read_word(entry));
        let count = usize::from(self.pma.read_word(entry + 2) & 0x3FF);
        let mut data = std::vec![0; count];
        self.pma.read(addr, &mut data);
        let toggle = epr & EPR::DTOG_TX::mask != 0;
        self.regs.update_epr(index, |epr| {
            let epr = (epr ^ EPR::DTOG_TX::mask) & !EPR::STAT_TX::mask;
            epr | EPR::CTR_TX::mask | (NAK << EPR::STAT_TX::offset)
        });
        Ok(Packet { data, toggle })
    }

    /// A control read: SETUP, IN data until a short packet, then an OUT
    /// status handshake.
    pub fn control_read<const N: usize>(
        &mut self,
        driver: &mut SimDriver<'_, N>,
        setup: [u8; 8],
    ) -> Result<Vec<u8>, Handshake> {
        let length = usize::from(u16::from_le_bytes([setup[6], setup[7]]));
        self.setup(setup)?;
        driver.on_interrupt();

        let mut data = Vec::new();
        loop {
            let packet = self.input(0)?;
            driver.on_interrupt();
            let short = packet.data.len() < crate::MAX_PACKET_SIZE;
            data.extend_from_slice(&packet.data);
            if short || data.len() >= length {
                break;
            }
        }

        self.out(0, &[])?;
        driver.on_interrupt();
        Ok(data)
    }

    /// A control write: SETUP, OUT data (if any), then an IN status
    /// handshake.
    pub fn control_write<const N: usize>(
        &mut self,
        driver: &mut SimDriver<'_, N>,
        setup: [u8; 8],
        data: &[u8],
    ) -> Result<(), Handshake> {
        self.setup(setup)?;
        driver.on_interrupt();

        for chunk in data.chunks(crate::MAX_PACKET_SIZE) {
            self.out(0, chunk)?;
            driver.on_interrupt();
        }

        let status = self.input(0)?;
        assert!(status.data.is_empty(), "status stage carried data");
        assert!(status.toggle, "status stage must be DATA1");
        driver.on_interrupt();
        Ok(())
    }

    pub fn set_address<const N: usize>(
        &mut self,
        driver: &mut SimDriver<'_, N>,
        address: u8,
    ) -> Result<(), Handshake> {
        self.control_write(driver, request(0x00, 5, address.into(), 0, 0), &[])?;
        self.address = address;
        Ok(())
    }

    pub fn set_configuration<const N: usize>(
        &mut self,
        driver: &mut SimDriver<'_, N>,
        value: u8,
    ) -> Result<(), Handshake> {
        self.control_write(driver, request(0x00, 9, value.into(), 0, 0), &[])
    }

    /// Reset, address, and configure the device.
    pub fn enumerate<const N: usize>(&mut self, driver: &mut SimDriver<'_, N>) {
        self.reset();
        driver.on_interrupt();
        let device = self
            .control_read(driver, request(0x80, 6, 0x0100, 0, 64))
            .unwrap();
        assert_eq!(device.len(), 18);
        self.set_address(driver, 5).unwrap();
        self.set_configuration(driver, 1).unwrap();
    }
}

#[cfg(test)]
mod test {
    use super::{SimRegisters, EPR_CLEAR};
    use crate::ral::usb::{EPR, ISTR};
    use crate::{Register, Registers};

    #[test]
    fn endpoint_write_semantics() {
        let regs = SimRegisters::new();
        regs.update_epr(1, |_| EPR_CLEAR | EPR::DTOG_RX::mask | 0x0001);

        // Writing ones keeps CTR, toggles DTOG_RX off, sets STAT_TX to VALID.
        regs.write(
            Register::Endpoint(1),
            EPR_CLEAR | EPR::DTOG_RX::mask | EPR::STAT_TX::mask | 0x0001,
        );
        let epr = regs.read(Register::Endpoint(1));
        assert_eq!(epr & EPR_CLEAR, EPR_CLEAR);
        assert_eq!(epr & EPR::DTOG_RX::mask, 0);
        assert_eq!(epr & EPR::STAT_TX::mask, EPR::STAT_TX::mask);

        // Writing zero to CTR_RX clears only that flag.
        regs.write(Register::Endpoint(1), EPR::CTR_TX::mask | 0x0001);
        let epr = regs.read(Register::Endpoint(1));
        assert_eq!(epr & EPR_CLEAR, EPR::CTR_TX::mask);
        assert_eq!(epr & EPR::STAT_TX::mask, EPR::STAT_TX::mask);
    }

    #[test]
    fn istr_reports_pending_endpoint() {
        let regs = SimRegisters::new();
        regs.update_epr(2, |_| EPR::CTR_RX::mask | 2);
        let istr = regs.read(Register::Istr);
        assert_ne!(istr & ISTR::CTR::mask, 0);
        assert_ne!(istr & ISTR::DIR::mask, 0);
        assert_eq!(istr & ISTR::EP_ID::mask, 2);

        regs.raise(ISTR::RESET::mask | ISTR::SUSP::mask);
        regs.write(Register::Istr, !ISTR::RESET::mask);
        let istr = regs.read(Register::Istr);
        assert_eq!(istr & ISTR::RESET::mask, 0);
        assert_ne!(istr & ISTR::SUSP::mask, 0);
    }
}
