//! The control endpoint (EP0) state machine
//!
//! Every control transfer starts with a SETUP packet. The state machine
//! handles the request as soon as the SETUP arrives, then moves through an
//! optional data stage and a status stage:
//!
//! ```text
//! Idle -> Setup -> DataIn  -> StatusOut -> Idle
//!               -> DataOut -> StatusIn  -> Idle
//!               -> StatusIn             -> Idle
//! ```
//!
//! A SETUP in any stage aborts the transfer in progress. A request that we
//! can't handle stalls the endpoint until the next SETUP.
//!
//! Requests with side effects are careful about timing. `SET_ADDRESS`
//! changes the device address only after the status stage completes, since
//! the host expects the status handshake at the old address. OUT data is
//! staged, and applied only after the data stage completes.

use core::fmt;

use usb_device::{
    control::{Recipient, Request, RequestType},
    UsbDirection,
};

use crate::{
    bdt::BufferDescriptorTable,
    bulk::BulkPipe,
    cdc::{self, CdcState, ControlLines, LineCoding},
    descriptor::{self, Descriptors},
    endpoint::{Endpoint, Kind, Status},
    ral,
    state::DeviceState,
    Registers,
};

/// The configuration value of our only configuration.
const CONFIGURATION_VALUE: u16 = 1;
/// Interfaces in our configuration.
const INTERFACE_COUNT: u16 = 2;
/// `ENDPOINT_HALT` feature selector
const ENDPOINT_HALT: u16 = 0;

/// Why a control request was stalled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// We don't implement this request.
    Unsupported { request_type: u8, request: u8 },
    /// The request isn't valid in the device's state.
    State { request: u8, state: DeviceState },
    /// There's no descriptor with this type and index.
    Descriptor { descriptor_type: u8, index: u8 },
    /// The request's value is out of range.
    Value { request: u8, value: u16 },
    /// The request's index doesn't name an interface or endpoint that we
    /// have.
    Index { request: u8, index: u16 },
    /// The SETUP packet, or the request's data stage, has the wrong length.
    Length(u16),
    /// The line coding uses an unsupported stop bit, parity, or data bit
    /// code.
    LineCoding,
}

impl ProtocolError {
    /// A short code for logging.
    fn code(&self) -> u8 {
        match self {
            ProtocolError::Unsupported { .. } => 0,
            ProtocolError::State { .. } => 1,
            ProtocolError::Descriptor { .. } => 2,
            ProtocolError::Value { .. } => 3,
            ProtocolError::Index { .. } => 4,
            ProtocolError::Length(_) => 5,
            ProtocolError::LineCoding => 6,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Unsupported {
                request_type,
                request,
            } => write!(f, "unsupported request {request:#x} (type {request_type:#x})"),
            ProtocolError::State { request, state } => {
                write!(f, "request {request:#x} not allowed in state {state:?}")
            }
            ProtocolError::Descriptor {
                descriptor_type,
                index,
            } => write!(f, "no descriptor of type {descriptor_type} at index {index}"),
            ProtocolError::Value { request, value } => {
                write!(f, "request {request:#x} has invalid value {value:#x}")
            }
            ProtocolError::Index { request, index } => {
                write!(f, "request {request:#x} has invalid index {index:#x}")
            }
            ProtocolError::Length(length) => write!(f, "invalid length {length}"),
            ProtocolError::LineCoding => f.write_str("unsupported line coding"),
        }
    }
}

/// Decode a SETUP packet.
pub fn parse(setup: &[u8; 8]) -> Request {
    let bm_request_type = setup[0];
    Request {
        direction: if bm_request_type & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        },
        request_type: match (bm_request_type >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        },
        recipient: match bm_request_type & 0b1_1111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        },
        request: setup[1],
        value: u16::from_le_bytes([setup[2], setup[3]]),
        index: u16::from_le_bytes([setup[4], setup[5]]),
        length: u16::from_le_bytes([setup[6], setup[7]]),
    }
}

/// Everything outside of EP0 that a request may touch
pub struct Context<'c, 'a, R: ?Sized, const N: usize> {
    pub regs: &'c R,
    pub bdt: &'c BufferDescriptorTable<'a>,
    pub state: &'c mut DeviceState,
    pub bulk: &'c mut BulkPipe<'a, N>,
    pub cdc: &'c mut CdcState,
    pub descriptors: &'c Descriptors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    DataIn,
    DataOut,
    StatusIn,
    StatusOut,
}

/// IN data stage contents
enum Payload {
    Static(&'static [u8]),
    Inline { buffer: [u8; 8], len: usize },
}

impl Payload {
    fn inline(data: &[u8]) -> Self {
        let mut buffer = [0; 8];
        let len = data.len().min(buffer.len());
        buffer[..len].copy_from_slice(&data[..len]);
        Payload::Inline { buffer, len }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Static(data) => data,
            Payload::Inline { buffer, len } => &buffer[..*len],
        }
    }
}

/// What a request does after its OUT data stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutData {
    LineCoding,
}

/// What a request does after its status stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    SetAddress(u8),
}

/// How a request continues after the SETUP stage
enum Response {
    In(Payload),
    Out(OutData),
    NoData(Option<Action>),
}

/// The transfer in progress
struct ControlTransfer {
    request: Request,
    stage: Stage,
    /// IN data, and how much we've sent.
    payload: Payload,
    sent: usize,
    /// Send a zero length packet after the payload.
    zlp: bool,
    /// OUT data, and how much we've received.
    received: [u8; 8],
    received_len: usize,
    out_data: Option<OutData>,
    action: Option<Action>,
}

impl ControlTransfer {
    fn new(request: Request, stage: Stage) -> Self {
        ControlTransfer {
            request,
            stage,
            payload: Payload::Static(&[]),
            sent: 0,
            zlp: false,
            received: [0; 8],
            received_len: 0,
            out_data: None,
            action: None,
        }
    }
}

/// The control endpoint
pub struct ControlPipe {
    endpoint: Endpoint,
    transfer: Option<ControlTransfer>,
    /// Why we last stalled.
    last_error: Option<ProtocolError>,
}

impl ControlPipe {
    pub fn new() -> Self {
        ControlPipe {
            endpoint: Endpoint::new(0, Kind::Control),
            transfer: None,
            last_error: None,
        }
    }

    /// Indicates if there's no transfer in progress.
    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        self.transfer.is_none()
    }

    /// Returns the reason for the most recent stall.
    pub fn last_error(&self) -> Option<ProtocolError> {
        self.last_error
    }

    /// Configure EP0, and drop any transfer in progress.
    ///
    /// Use this after initialization, and after a bus reset.
    pub fn reset<R: Registers + ?Sized>(&mut self, regs: &R) {
        self.transfer = None;
        self.endpoint.configure(regs, Status::Valid, Status::Nak);
    }

    /// Disable EP0, and drop any transfer in progress.
    pub fn disable<R: Registers + ?Sized>(&mut self, regs: &R) {
        self.transfer = None;
        self.endpoint.disable(regs);
    }

    /// Handle a SETUP packet.
    pub fn on_setup<R: Registers + ?Sized, const N: usize>(&mut self, cx: &mut Context<'_, '_, R, N>) {
        let mut setup = [0; 8];
        let len = cx.bdt.read_receive(0, &mut setup);
        self.endpoint.clear_complete(cx.regs, UsbDirection::Out);

        // The peripheral sets both toggles to DATA1 on a SETUP.
        self.endpoint.set_toggle(UsbDirection::Out, true);
        self.endpoint.set_toggle(UsbDirection::In, true);

        if let Some(transfer) = self.transfer.take() {
            debug!(
                "EP0 ABORT REQUEST {} STAGE {}",
                transfer.request.request,
                transfer.stage as u8
            );
        }

        if len != setup.len() {
            self.stall(cx.regs, ProtocolError::Length(len as u16));
            return;
        }

        let request = parse(&setup);
        trace!(
            "EP0 SETUP {:?} TYPE {} RECIPIENT {} REQUEST {} VALUE {} INDEX {} LENGTH {}",
            request.direction,
            request.request_type as u8,
            request.recipient as u8,
            request.request,
            request.value,
            request.index,
            request.length
        );

        match self.handle(cx, &request) {
            Ok(response) => self.start(cx, request, response),
            Err(error) => self.stall(cx.regs, error),
        }
    }

    /// Handle a completed OUT that isn't a SETUP.
    pub fn on_out<R: Registers + ?Sized, const N: usize>(&mut self, cx: &mut Context<'_, '_, R, N>) {
        let mut packet = [0; crate::MAX_PACKET_SIZE];
        let len = cx.bdt.read_receive(0, &mut packet);
        self.endpoint.clear_complete(cx.regs, UsbDirection::Out);
        self.endpoint.toggle_data(UsbDirection::Out);

        let Some(transfer) = self.transfer.as_mut() else {
            warn!("EP0 OUT {} WITHOUT TRANSFER", len);
            self.endpoint
                .set_status(cx.regs, UsbDirection::Out, Status::Valid);
            return;
        };

        match transfer.stage {
            Stage::DataOut => {
                let start = transfer.received_len;
                let end = (start + len).min(transfer.received.len());
                transfer.received[start..end].copy_from_slice(&packet[..end - start]);
                transfer.received_len = end;

                let expected = usize::from(transfer.request.length);
                if end >= expected || len < cx.bdt.max_packet_size(0) {
                    let result = self.complete_out(cx);
                    match result {
                        Ok(()) => self.status_in(cx),
                        Err(error) => self.stall(cx.regs, error),
                    }
                } else {
                    self.endpoint
                        .set_status(cx.regs, UsbDirection::Out, Status::Valid);
                }
            }
            // The status stage of a control read, possibly before we sent
            // all of the data.
            Stage::DataIn | Stage::StatusOut => {
                if transfer.stage == Stage::DataIn {
                    debug!("EP0 EARLY STATUS");
                }
                self.finish(cx);
            }
            Stage::StatusIn => {
                warn!("EP0 UNEXPECTED OUT {} IN STATUS STAGE", len);
            }
        }
    }

    /// Handle a completed IN.
    pub fn on_in<R: Registers + ?Sized, const N: usize>(&mut self, cx: &mut Context<'_, '_, R, N>) {
        self.endpoint.clear_complete(cx.regs, UsbDirection::In);
        self.endpoint.toggle_data(UsbDirection::In);

        let Some(transfer) = self.transfer.as_mut() else {
            warn!("EP0 IN WITHOUT TRANSFER");
            return;
        };

        match transfer.stage {
            Stage::DataIn => {
                if !self.send_next(cx) {
                    if let Some(transfer) = self.transfer.as_mut() {
                        transfer.stage = Stage::StatusOut;
                    }
                }
            }
            Stage::StatusIn => self.finish(cx),
            Stage::DataOut | Stage::StatusOut => {
                warn!("EP0 UNEXPECTED IN");
            }
        }
    }

    /// Stall both directions until the next SETUP.
    fn stall<R: Registers + ?Sized>(&mut self, regs: &R, error: ProtocolError) {
        self.transfer = None;
        self.last_error = Some(error);
        self.endpoint.set_status(regs, UsbDirection::Out, Status::Stall);
        self.endpoint.set_status(regs, UsbDirection::In, Status::Stall);
        warn!("EP0 STALL {}", error.code());
    }

    /// Begin the data or status stage.
    fn start<R: Registers + ?Sized, const N: usize>(
        &mut self,
        cx: &mut Context<'_, '_, R, N>,
        request: Request,
        response: Response,
    ) {
        match response {
            Response::In(payload) if request.length > 0 => {
                let len = payload.as_slice().len().min(usize::from(request.length));
                let payload = match payload {
                    Payload::Static(data) => Payload::Static(&data[..len]),
                    Payload::Inline { buffer, .. } => Payload::Inline { buffer, len },
                };
                let max_packet_size = cx.bdt.max_packet_size(0);
                let mut transfer = ControlTransfer::new(request, Stage::DataIn);
                transfer.zlp = len < usize::from(request.length) && len % max_packet_size == 0;
                transfer.payload = payload;
                self.transfer = Some(transfer);
                self.send_next(cx);
                // The host may end the data stage early.
                self.endpoint
                    .set_status(cx.regs, UsbDirection::Out, Status::Valid);
            }
            Response::In(_) => {
                self.transfer = Some(ControlTransfer::new(request, Stage::StatusIn));
                self.status_in(cx);
            }
            Response::NoData(action) => {
                let mut transfer = ControlTransfer::new(request, Stage::StatusIn);
                transfer.action = action;
                self.transfer = Some(transfer);
                self.status_in(cx);
            }
            Response::Out(out_data) => {
                let mut transfer = ControlTransfer::new(request, Stage::DataOut);
                transfer.out_data = Some(out_data);
                self.transfer = Some(transfer);
                self.endpoint
                    .set_status(cx.regs, UsbDirection::Out, Status::Valid);
            }
        }
    }

    /// Arm the next IN data packet. Returns `false` if there's nothing left
    /// to send.
    fn send_next<R: Registers + ?Sized, const N: usize>(
        &mut self,
        cx: &mut Context<'_, '_, R, N>,
    ) -> bool {
        let Some(transfer) = self.transfer.as_mut() else {
            return false;
        };
        let remaining = &transfer.payload.as_slice()[transfer.sent..];
        if remaining.is_empty() && !transfer.zlp {
            return false;
        }
        if remaining.is_empty() {
            transfer.zlp = false;
        }
        let len = cx.bdt.write_transmit(0, remaining);
        transfer.sent += len;
        trace!("EP0 IN {}", len);
        self.endpoint
            .set_status(cx.regs, UsbDirection::In, Status::Valid);
        true
    }

    /// Send the zero length status packet for a control write, or for a
    /// request without a data stage.
    fn status_in<R: Registers + ?Sized, const N: usize>(&mut self, cx: &mut Context<'_, '_, R, N>) {
        if let Some(transfer) = self.transfer.as_mut() {
            transfer.stage = Stage::StatusIn;
        }
        // No IN data, so the toggle is still DATA1 from the SETUP.
        debug_assert!(self.endpoint.toggle(UsbDirection::In));
        cx.bdt.set_transmit_count(0, 0);
        self.endpoint
            .set_status(cx.regs, UsbDirection::In, Status::Valid);
    }

    /// Apply a completed OUT data stage.
    fn complete_out<R: Registers + ?Sized, const N: usize>(
        &mut self,
        cx: &mut Context<'_, '_, R, N>,
    ) -> Result<(), ProtocolError> {
        let Some(transfer) = self.transfer.as_ref() else {
            return Ok(());
        };
        let data = &transfer.received[..transfer.received_len];
        match transfer.out_data {
            Some(OutData::LineCoding) => {
                let coding = LineCoding::from_bytes(data)?;
                debug!(
                    "LINE CODING {} {} {} {}",
                    coding.baud_rate(),
                    coding.data_bits(),
                    coding.parity() as u8,
                    coding.stop_bits() as u8
                );
                cx.cdc.line_coding = coding;
            }
            None => {}
        }
        Ok(())
    }

    /// The status stage completed. Apply deferred actions, and go idle.
    fn finish<R: Registers + ?Sized, const N: usize>(&mut self, cx: &mut Context<'_, '_, R, N>) {
        let Some(transfer) = self.transfer.take() else {
            return;
        };
        if let Some(Action::SetAddress(address)) = transfer.action {
            let usb = ral::control(cx.regs);
            ral::write_reg!(ral::usb, &usb, DADDR, EF: 1, ADD: u16::from(address));
            *cx.state = if address == 0 {
                DeviceState::Default
            } else {
                DeviceState::Addressed
            };
            debug!("ADDRESS {}", address);
        }
        // Drop anything left armed by an early status.
        self.endpoint.set_status(cx.regs, UsbDirection::In, Status::Nak);
        self.endpoint
            .set_status(cx.regs, UsbDirection::Out, Status::Valid);
    }

    /// Decide how to respond to a request. Requests without a data stage
    /// take effect here.
    fn handle<R: Registers + ?Sized, const N: usize>(
        &mut self,
        cx: &mut Context<'_, '_, R, N>,
        request: &Request,
    ) -> Result<Response, ProtocolError> {
        match request.request_type {
            RequestType::Standard => standard(cx, request),
            RequestType::Class if request.recipient == Recipient::Interface => class(cx, request),
            _ => Err(unsupported(request)),
        }
    }
}

fn unsupported(request: &Request) -> ProtocolError {
    ProtocolError::Unsupported {
        request_type: request.request_type as u8,
        request: request.request,
    }
}

fn status_bytes(bits: u16) -> Payload {
    Payload::inline(&bits.to_le_bytes())
}

/// Requests without a data stage shouldn't ask for one.
fn no_data(request: &Request) -> Result<(), ProtocolError> {
    if request.length != 0 {
        Err(ProtocolError::Length(request.length))
    } else {
        Ok(())
    }
}

fn require_configured(request: &Request, state: DeviceState) -> Result<(), ProtocolError> {
    if state != DeviceState::Configured {
        Err(ProtocolError::State {
            request: request.request,
            state,
        })
    } else {
        Ok(())
    }
}

/// Map a request's endpoint index to a data endpoint direction.
fn data_endpoint(request: &Request) -> Result<UsbDirection, ProtocolError> {
    match request.index as u8 {
        descriptor::DATA_OUT if request.index <= 0xFF => Ok(UsbDirection::Out),
        descriptor::DATA_IN if request.index <= 0xFF => Ok(UsbDirection::In),
        _ => Err(ProtocolError::Index {
            request: request.request,
            index: request.index,
        }),
    }
}

fn standard<R: Registers + ?Sized, const N: usize>(
    cx: &mut Context<'_, '_, R, N>,
    request: &Request,
) -> Result<Response, ProtocolError> {
    use UsbDirection::{In, Out};

    let state = *cx.state;
    match (request.direction, request.recipient, request.request) {
        (In, Recipient::Device, Request::GET_STATUS) => Ok(Response::In(status_bytes(0))),
        (In, Recipient::Interface, Request::GET_STATUS) => {
            require_configured(request, state)?;
            if request.index >= INTERFACE_COUNT {
                return Err(ProtocolError::Index {
                    request: request.request,
                    index: request.index,
                });
            }
            Ok(Response::In(status_bytes(0)))
        }
        (In, Recipient::Endpoint, Request::GET_STATUS) => {
            if request.index & 0x7F == 0 {
                return Ok(Response::In(status_bytes(0)));
            }
            require_configured(request, state)?;
            let direction = data_endpoint(request)?;
            Ok(Response::In(status_bytes(u16::from(
                cx.bulk.is_halted(direction),
            ))))
        }
        (Out, Recipient::Endpoint, Request::CLEAR_FEATURE | Request::SET_FEATURE) => {
            no_data(request)?;
            if request.value != ENDPOINT_HALT {
                return Err(ProtocolError::Value {
                    request: request.request,
                    value: request.value,
                });
            }
            if request.index & 0x7F == 0 {
                // EP0 recovers from a stall on the next SETUP.
                return Ok(Response::NoData(None));
            }
            require_configured(request, state)?;
            let direction = data_endpoint(request)?;
            let halted = request.request == Request::SET_FEATURE;
            cx.bulk.set_halted(cx.regs, cx.bdt, direction, halted);
            Ok(Response::NoData(None))
        }
        (Out, Recipient::Device, Request::SET_ADDRESS) => {
            no_data(request)?;
            if request.value > 127 {
                return Err(ProtocolError::Value {
                    request: request.request,
                    value: request.value,
                });
            }
            if !matches!(state, DeviceState::Default | DeviceState::Addressed) {
                return Err(ProtocolError::State {
                    request: request.request,
                    state,
                });
            }
            Ok(Response::NoData(Some(Action::SetAddress(
                request.value as u8,
            ))))
        }
        (In, Recipient::Device, Request::GET_DESCRIPTOR) => {
            let descriptor_type = (request.value >> 8) as u8;
            let index = request.value as u8;
            cx.descriptors
                .get(descriptor_type, index)
                .map(|descriptor| Response::In(Payload::Static(descriptor)))
                .ok_or(ProtocolError::Descriptor {
                    descriptor_type,
                    index,
                })
        }
        (In, Recipient::Device, Request::GET_CONFIGURATION) => {
            let value = u8::from(state == DeviceState::Configured);
            Ok(Response::In(Payload::inline(&[value])))
        }
        (Out, Recipient::Device, Request::SET_CONFIGURATION) => {
            no_data(request)?;
            if !state.is_enumerated() {
                return Err(ProtocolError::State {
                    request: request.request,
                    state,
                });
            }
            match request.value {
                0 => {
                    cx.bulk.disable(cx.regs);
                    *cx.state = DeviceState::Addressed;
                    debug!("UNCONFIGURED");
                }
                CONFIGURATION_VALUE => {
                    *cx.state = DeviceState::Configured;
                    cx.bulk.enable(cx.regs, cx.bdt);
                    debug!("CONFIGURED");
                }
                value => {
                    return Err(ProtocolError::Value {
                        request: request.request,
                        value,
                    })
                }
            }
            Ok(Response::NoData(None))
        }
        (In, Recipient::Interface, Request::GET_INTERFACE) => {
            require_configured(request, state)?;
            if request.index >= INTERFACE_COUNT {
                return Err(ProtocolError::Index {
                    request: request.request,
                    index: request.index,
                });
            }
            Ok(Response::In(Payload::inline(&[0])))
        }
        (Out, Recipient::Interface, Request::SET_INTERFACE) => {
            no_data(request)?;
            require_configured(request, state)?;
            if request.index >= INTERFACE_COUNT {
                return Err(ProtocolError::Index {
                    request: request.request,
                    index: request.index,
                });
            }
            if request.value != 0 {
                return Err(ProtocolError::Value {
                    request: request.request,
                    value: request.value,
                });
            }
            Ok(Response::NoData(None))
        }
        _ => Err(unsupported(request)),
    }
}

fn class<R: Registers + ?Sized, const N: usize>(
    cx: &mut Context<'_, '_, R, N>,
    request: &Request,
) -> Result<Response, ProtocolError> {
    use UsbDirection::{In, Out};

    if request.index >= INTERFACE_COUNT {
        return Err(ProtocolError::Index {
            request: request.request,
            index: request.index,
        });
    }
    match (request.direction, request.request) {
        (Out, cdc::SET_LINE_CODING) => {
            if usize::from(request.length) != cdc::LINE_CODING_SIZE {
                return Err(ProtocolError::Length(request.length));
            }
            Ok(Response::Out(OutData::LineCoding))
        }
        (In, cdc::GET_LINE_CODING) => Ok(Response::In(Payload::inline(
            &cx.cdc.line_coding.to_bytes(),
        ))),
        (Out, cdc::SET_CONTROL_LINE_STATE) => {
            no_data(request)?;
            cx.cdc.control_lines = ControlLines::from_bits_truncate(request.value);
            debug!("CONTROL LINES {}", cx.cdc.control_lines.bits());
            Ok(Response::NoData(None))
        }
        (Out, cdc::SEND_BREAK) => {
            no_data(request)?;
            debug!("BREAK {}", request.value);
            Ok(Response::NoData(None))
        }
        _ => Err(unsupported(request)),
    }
}
