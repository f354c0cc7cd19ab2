//! The interrupt dispatcher
//!
//! `Driver` owns everything the USB interrupt touches: the registers, the
//! buffer descriptor table, both endpoint state machines, and the CDC class
//! state. Call [`Driver::on_interrupt`] from the USB interrupt handler.

use bitflags::bitflags;
use usb_device::{UsbDirection, UsbError};

use crate::{
    bdt::{self, BufferDescriptorTable, LayoutError},
    bulk::BulkPipe,
    cdc::{CdcState, ControlLines, LineCoding},
    control::{Context, ControlPipe, ProtocolError},
    descriptor::Descriptors,
    endpoint,
    pma::PacketMemory,
    ral::{
        self,
        usb::{EPR, ISTR},
    },
    serial::SerialEndpoints,
    state::DeviceState,
    Registers, MAX_PACKET_SIZE,
};

/// The control endpoint number.
const CONTROL: u8 = 0;
/// The data endpoint number.
const DATA: u8 = 1;

/// Packet memory placement for one bidirectional endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointLayout {
    /// Transmit buffer offset, in bytes from the start of packet memory
    pub tx_offset: usize,
    /// Receive buffer offset, in bytes from the start of packet memory
    pub rx_offset: usize,
    /// Size of both buffers, and the endpoint's max packet size
    pub max_packet_size: usize,
}

impl EndpointLayout {
    pub const fn new(tx_offset: usize, rx_offset: usize, max_packet_size: usize) -> Self {
        EndpointLayout {
            tx_offset,
            rx_offset,
            max_packet_size,
        }
    }
}

/// Driver configuration
///
/// The defaults place the buffer descriptor table at offset 0, EP0's
/// buffers at 0x40 and 0x80, and EP1's buffers at 0xC0 and 0x100, all with
/// 64 byte packets. That fits in the smallest packet memory.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Descriptors served to the host
    pub descriptors: Descriptors,
    /// EP0 buffers
    pub control: EndpointLayout,
    /// EP1 buffers
    pub data: EndpointLayout,
}

impl Config {
    pub const fn new() -> Self {
        Config {
            descriptors: Descriptors::new(),
            control: EndpointLayout::new(0x40, 0x80, MAX_PACKET_SIZE),
            data: EndpointLayout::new(0xC0, 0x100, MAX_PACKET_SIZE),
        }
    }

    /// Serve a different descriptor set.
    pub const fn descriptors(self, descriptors: Descriptors) -> Self {
        Config {
            descriptors,
            ..self
        }
    }

    /// Move the EP0 buffers.
    pub const fn control_layout(self, control: EndpointLayout) -> Self {
        Config { control, ..self }
    }

    /// Move, or resize, the EP1 buffers.
    ///
    /// If you change the max packet size, also change the endpoint
    /// descriptors; see [`descriptor::configuration`](crate::descriptor::configuration).
    pub const fn data_layout(self, data: EndpointLayout) -> Self {
        Config { data, ..self }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

bitflags! {
    /// Interrupt status flags
    ///
    /// The same bit positions enable each interrupt in `CNTR`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interrupts : u16 {
        /// Correct transfer
        const CTR = ISTR::CTR::mask;
        /// Packet memory over / underrun
        const PMAOVR = ISTR::PMAOVR::mask;
        /// Bus error
        const ERR = ISTR::ERR::mask;
        const WKUP = ISTR::WKUP::mask;
        const SUSP = ISTR::SUSP::mask;
        const RESET = ISTR::RESET::mask;
        const SOF = ISTR::SOF::mask;
        /// Expected start of frame was missed
        const ESOF = ISTR::ESOF::mask;
        /// LPM L1 state request
        const L1REQ = ISTR::L1REQ::mask;
    }
}

/// A completed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// Endpoint register index
    pub endpoint: u8,
    /// `Out` for OUT and SETUP transactions, `In` for IN transactions
    pub direction: UsbDirection,
    /// The OUT transaction was a SETUP
    pub setup: bool,
}

/// One thing that the interrupt handler must react to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The host reset the bus.
    Reset,
    /// An endpoint completed a transaction.
    Transfer(Transfer),
    /// The bus has been idle for 3ms.
    Suspend,
    /// Bus activity resumed after a suspend.
    Wakeup,
    /// Error or informational flags, which are only logged.
    Error(Interrupts),
}

/// The interrupts that the driver handles.
const ENABLED_INTERRUPTS: u16 = Interrupts::CTR.bits()
    | Interrupts::WKUP.bits()
    | Interrupts::SUSP.bits()
    | Interrupts::ERR.bits()
    | Interrupts::RESET.bits();

/// A USB CDC virtual serial port driver
///
/// The driver needs
///
/// - the USB registers, through a [`Registers`] implementation
/// - the packet memory
/// - the driver half of the serial buffers
///
/// Create the driver, [`initialize`](Driver::initialize) it, then
/// [`attach`](Driver::attach) to the bus. From then on, call
/// [`on_interrupt`](Driver::on_interrupt) whenever the USB interrupt fires.
/// [`Device`](crate::Device) does this for you, with the memory-mapped
/// peripheral.
pub struct Driver<'a, R, const N: usize> {
    regs: R,
    bdt: BufferDescriptorTable<'a>,
    control: ControlPipe,
    bulk: BulkPipe<'a, N>,
    cdc: CdcState,
    descriptors: Descriptors,
    state: DeviceState,
    /// The state to restore when we wake up.
    resume_state: Option<DeviceState>,
}

impl<'a, R: Registers, const N: usize> Driver<'a, R, N> {
    /// Create a driver, and lay out the buffer descriptor table.
    ///
    /// Fails if either endpoint's buffers don't fit in `packet_memory`, or
    /// overlap.
    pub fn new(
        regs: R,
        packet_memory: PacketMemory<'a>,
        serial: SerialEndpoints<'a, N>,
        config: &Config,
    ) -> Result<Self, LayoutError> {
        let mut bdt = BufferDescriptorTable::new(packet_memory)?;
        bdt.configure(
            CONTROL,
            config.control.tx_offset,
            config.control.rx_offset,
            config.control.max_packet_size,
        )?;
        bdt.configure(
            DATA,
            config.data.tx_offset,
            config.data.rx_offset,
            config.data.max_packet_size,
        )?;
        Ok(Driver {
            regs,
            bdt,
            control: ControlPipe::new(),
            bulk: BulkPipe::new(DATA, serial),
            cdc: CdcState::new(),
            descriptors: config.descriptors,
            state: DeviceState::Powered,
            resume_state: None,
        })
    }

    /// Power up and reset the peripheral, then enable its interrupts.
    ///
    /// The device isn't visible to the host until you [`attach`](Driver::attach).
    pub fn initialize(&mut self) {
        let usb = ral::control(&self.regs);
        ral::modify_reg!(ral::usb, &usb, CNTR, PDWN: 0);
        // Interrupts masked, reset held.
        ral::write_reg!(ral::usb, &usb, CNTR, FRES: 1);
        ral::write_reg!(ral::usb, &usb, CNTR, 0);
        ral::write_reg!(ral::usb, &usb, ISTR, 0);
        ral::write_reg!(ral::usb, &usb, BTABLE, bdt::TABLE_OFFSET as u16);
        ral::write_reg!(ral::usb, &usb, CNTR, ENABLED_INTERRUPTS);

        self.bdt.restore();
        self.control.reset(&self.regs);
        self.bulk.disable(&self.regs);
        self.state = DeviceState::Powered;
        self.resume_state = None;
        debug!("INITIALIZED");
    }

    /// Enable the D+ pull-up, so that the host sees the device.
    pub fn attach(&mut self) {
        let usb = ral::control(&self.regs);
        ral::modify_reg!(ral::usb, &usb, BCDR, DPPU: 1);
        debug!("ATTACHED");
    }

    /// Disconnect from the bus, and power down the peripheral.
    ///
    /// Ring contents are untouched. Call [`initialize`](Driver::initialize)
    /// and [`attach`](Driver::attach) to connect again.
    pub fn detach(&mut self) {
        let usb = ral::control(&self.regs);
        ral::modify_reg!(ral::usb, &usb, BCDR, DPPU: 0);
        self.bulk.disable(&self.regs);
        self.control.disable(&self.regs);
        ral::write_reg!(ral::usb, &usb, DADDR, 0);
        ral::write_reg!(ral::usb, &usb, CNTR, PDWN: 1, FRES: 1);
        self.state = DeviceState::Powered;
        self.resume_state = None;
        debug!("DETACHED");
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// The line coding from the host's last `SET_LINE_CODING`.
    pub fn line_coding(&self) -> LineCoding {
        self.cdc.line_coding
    }

    /// Returns why EP0 last stalled a request, if it ever did.
    pub fn last_error(&self) -> Option<ProtocolError> {
        self.control.last_error()
    }

    /// The control lines from the host's last `SET_CONTROL_LINE_STATE`.
    pub fn control_lines(&self) -> ControlLines {
        self.cdc.control_lines
    }

    /// Send queued bytes now, instead of waiting for the next interrupt.
    ///
    /// Does nothing if a packet is already on its way. Returns
    /// [`UsbError::InvalidState`] if the device isn't configured.
    pub fn start_transmit(&mut self) -> Result<(), UsbError> {
        if self.state != DeviceState::Configured {
            return Err(UsbError::InvalidState);
        }
        self.bulk.start_transmit(&self.regs, &self.bdt);
        Ok(())
    }

    /// Decode the next event from the interrupt status register.
    ///
    /// Returns `None` if there's nothing to do. The event stays pending
    /// until it's [`dispatch`](Driver::dispatch)ed.
    pub fn next_event(&self) -> Option<Event> {
        let usb = ral::control(&self.regs);
        let istr = ral::read_reg!(ral::usb, &usb, ISTR);
        let flags = Interrupts::from_bits_truncate(istr);

        if flags.contains(Interrupts::RESET) {
            return Some(Event::Reset);
        }
        if flags.contains(Interrupts::CTR) {
            let endpoint = (istr & ISTR::EP_ID::mask) as u8;
            let epr = ral::read_reg!(ral::usb, &ral::endpoint(&self.regs, endpoint), EPR);
            // With both flags set, the IN completed first. Finish it before
            // looking at the next SETUP.
            let direction =
                if istr & ISTR::DIR::mask == 0 || epr & EPR::CTR_TX::mask != 0 {
                    UsbDirection::In
                } else {
                    UsbDirection::Out
                };
            return Some(Event::Transfer(Transfer {
                endpoint,
                direction,
                setup: direction == UsbDirection::Out && epr & EPR::SETUP::mask != 0,
            }));
        }
        if flags.contains(Interrupts::SUSP) {
            return Some(Event::Suspend);
        }
        if flags.contains(Interrupts::WKUP) {
            return Some(Event::Wakeup);
        }
        let errors = flags - (Interrupts::CTR | Interrupts::RESET | Interrupts::SUSP | Interrupts::WKUP);
        if !errors.is_empty() {
            return Some(Event::Error(errors));
        }
        None
    }

    /// Handle one event, and clear its status flags.
    pub fn dispatch(&mut self, event: Event) {
        match event {
            Event::Reset => {
                // A suspend or wakeup from before the reset is stale.
                self.clear_interrupts(Interrupts::RESET | Interrupts::SUSP | Interrupts::WKUP);
                self.bus_reset();
            }
            Event::Transfer(transfer) => self.on_transfer(transfer),
            Event::Suspend => {
                self.clear_interrupts(Interrupts::SUSP);
                self.suspend();
            }
            Event::Wakeup => {
                self.clear_interrupts(Interrupts::WKUP);
                self.wakeup();
            }
            Event::Error(flags) => {
                self.clear_interrupts(flags);
                if flags.intersects(Interrupts::ERR | Interrupts::PMAOVR) {
                    warn!("ERROR {:#x}", flags.bits());
                } else {
                    trace!("ISTR {:#x}", flags.bits());
                }
            }
        }
    }

    /// Handle all pending events, then send any queued bytes.
    pub fn on_interrupt(&mut self) {
        while let Some(event) = self.next_event() {
            self.dispatch(event);
        }
        if self.state == DeviceState::Configured {
            self.bulk.start_transmit(&self.regs, &self.bdt);
        }
    }

    fn clear_interrupts(&self, flags: Interrupts) {
        let usb = ral::control(&self.regs);
        ral::write_reg!(ral::usb, &usb, ISTR, !flags.bits());
    }

    fn bus_reset(&mut self) {
        let usb = ral::control(&self.regs);
        ral::modify_reg!(ral::usb, &usb, CNTR, FSUSP: 0, LP_MODE: 0);
        ral::write_reg!(ral::usb, &usb, DADDR, EF: 1, ADD: 0);
        self.bdt.restore();
        self.control.reset(&self.regs);
        self.bulk.disable(&self.regs);
        self.state = DeviceState::Default;
        self.resume_state = None;
        debug!("RESET");
    }

    fn suspend(&mut self) {
        let usb = ral::control(&self.regs);
        ral::modify_reg!(ral::usb, &usb, CNTR, FSUSP: 1);
        if self.state != DeviceState::Suspended {
            self.resume_state = Some(self.state);
            self.state = DeviceState::Suspended;
        }
        debug!("SUSPEND {}", self.state.code());
    }

    fn wakeup(&mut self) {
        let usb = ral::control(&self.regs);
        ral::modify_reg!(ral::usb, &usb, CNTR, FSUSP: 0, LP_MODE: 0);
        if let Some(state) = self.resume_state.take() {
            self.state = state;
        }
        debug!("WAKEUP {}", self.state.code());
    }

    fn on_transfer(&mut self, transfer: Transfer) {
        match (transfer.endpoint, transfer.direction) {
            (CONTROL, direction) => {
                let mut cx = Context {
                    regs: &self.regs,
                    bdt: &self.bdt,
                    state: &mut self.state,
                    bulk: &mut self.bulk,
                    cdc: &mut self.cdc,
                    descriptors: &self.descriptors,
                };
                match direction {
                    UsbDirection::Out if transfer.setup => self.control.on_setup(&mut cx),
                    UsbDirection::Out => self.control.on_out(&mut cx),
                    UsbDirection::In => self.control.on_in(&mut cx),
                }
            }
            (DATA, UsbDirection::Out) => self.bulk.on_out(&self.regs, &self.bdt),
            (DATA, UsbDirection::In) => self.bulk.on_in(&self.regs, &self.bdt),
            (index, direction) => {
                warn!("UNEXPECTED TRANSFER EPR{} {:?}", index, direction);
                endpoint::clear_unexpected(&self.regs, index);
            }
        }
    }
}
