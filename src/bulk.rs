//! The bulk data endpoint
//!
//! OUT packets go straight into the receive ring. IN packets come from the
//! transmit ring, one packet at a time: the endpoint NAKs while the ring is
//! empty, and the driver re-arms it when the application queues more data.
//! An armed packet's bytes stay in the ring until the host acknowledges
//! them, so a reset or reconfiguration sends them again.

use usb_device::UsbDirection;

use crate::{
    bdt::BufferDescriptorTable,
    endpoint::{Endpoint, Kind, Status},
    serial::SerialEndpoints,
    Registers, MAX_PACKET_SIZE,
};

pub struct BulkPipe<'a, const N: usize> {
    endpoint: Endpoint,
    serial: SerialEndpoints<'a, N>,
    enabled: bool,
    /// The length of the IN packet that's armed, and waiting for the host.
    in_flight: Option<usize>,
    /// The last IN packet was full. If there's nothing else to send, end the
    /// transfer with a zero length packet.
    zlp_pending: bool,
}

impl<'a, const N: usize> BulkPipe<'a, N> {
    pub fn new(number: u8, serial: SerialEndpoints<'a, N>) -> Self {
        BulkPipe {
            endpoint: Endpoint::new(number, Kind::Bulk),
            serial,
            enabled: false,
            in_flight: None,
            zlp_pending: false,
        }
    }

    #[cfg(test)]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[cfg(test)]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Forget the armed IN packet. Its bytes stay queued, unless the host
    /// took the packet and we haven't yet handled the completion.
    fn cancel_in_flight<R: Registers + ?Sized>(&mut self, regs: &R) {
        if let Some(len) = self.in_flight.take() {
            if self.endpoint.is_complete(regs, UsbDirection::In) {
                self.endpoint.clear_complete(regs, UsbDirection::In);
                self.serial.complete_transmit(len);
            } else {
                debug!("EP{} IN {} REQUEUED", self.endpoint.number(), len);
            }
        }
        self.zlp_pending = false;
    }

    /// Configure the endpoint, and start accepting OUT data.
    ///
    /// Toggles restart at DATA0.
    pub fn enable<R: Registers + ?Sized>(&mut self, regs: &R, bdt: &BufferDescriptorTable<'_>) {
        self.cancel_in_flight(regs);
        self.endpoint.configure(regs, Status::Valid, Status::Nak);
        self.enabled = true;
        debug!("EP{} ENABLED", self.endpoint.number());
        self.start_transmit(regs, bdt);
    }

    /// Disable both directions. Bytes the host hasn't acknowledged stay in
    /// the transmit ring.
    pub fn disable<R: Registers + ?Sized>(&mut self, regs: &R) {
        if self.enabled {
            debug!("EP{} DISABLED", self.endpoint.number());
        }
        self.cancel_in_flight(regs);
        self.endpoint.disable(regs);
        self.enabled = false;
    }

    /// Handle a completed OUT transaction.
    pub fn on_out<R: Registers + ?Sized>(&mut self, regs: &R, bdt: &BufferDescriptorTable<'_>) {
        let number = self.endpoint.number();
        self.endpoint.clear_complete(regs, UsbDirection::Out);
        if !self.enabled {
            warn!("EP{} OUT WHILE DISABLED", number);
            return;
        }
        self.endpoint.toggle_data(UsbDirection::Out);

        let mut packet = [0; MAX_PACKET_SIZE];
        let len = bdt.read_receive(number, &mut packet);
        let accepted = self.serial.receive(&packet[..len]);
        trace!("EP{} OUT {} ACCEPTED {}", number, len, accepted);

        if !self.endpoint.is_stalled(UsbDirection::Out) {
            self.endpoint
                .set_status(regs, UsbDirection::Out, Status::Valid);
        }
    }

    /// Handle a completed IN transaction, and send the next packet.
    pub fn on_in<R: Registers + ?Sized>(&mut self, regs: &R, bdt: &BufferDescriptorTable<'_>) {
        self.endpoint.clear_complete(regs, UsbDirection::In);
        if !self.enabled {
            warn!("EP{} IN WHILE DISABLED", self.endpoint.number());
            return;
        }
        self.endpoint.toggle_data(UsbDirection::In);
        if let Some(len) = self.in_flight.take() {
            self.serial.complete_transmit(len);
        }
        self.start_transmit(regs, bdt);
    }

    /// Arm the next IN packet, if the endpoint is idle and there's something
    /// to send.
    ///
    /// Returns `true` if a packet was armed.
    pub fn start_transmit<R: Registers + ?Sized>(
        &mut self,
        regs: &R,
        bdt: &BufferDescriptorTable<'_>,
    ) -> bool {
        if !self.enabled || self.in_flight.is_some() || self.endpoint.is_stalled(UsbDirection::In) {
            return false;
        }
        if self.serial.pending() == 0 && !self.zlp_pending {
            return false;
        }
        let number = self.endpoint.number();
        let max_packet_size = bdt.max_packet_size(number).min(MAX_PACKET_SIZE);

        let mut packet = [0; MAX_PACKET_SIZE];
        let len = self.serial.prepare_transmit(&mut packet[..max_packet_size]);

        bdt.write_transmit(number, &packet[..len]);
        self.zlp_pending = len == max_packet_size;
        self.in_flight = Some(len);
        self.endpoint.set_status(regs, UsbDirection::In, Status::Valid);
        trace!("EP{} IN {}", number, len);
        true
    }

    /// Halt, or resume, one direction of the endpoint.
    pub fn set_halted<R: Registers + ?Sized>(
        &mut self,
        regs: &R,
        bdt: &BufferDescriptorTable<'_>,
        direction: UsbDirection,
        halted: bool,
    ) {
        if direction == UsbDirection::In {
            self.cancel_in_flight(regs);
        }
        self.endpoint.set_stalled(regs, direction, halted);
        match (direction, halted) {
            (UsbDirection::In, _) => {
                // A packet armed before the halt goes out after it.
                if !halted {
                    self.start_transmit(regs, bdt);
                }
            }
            (UsbDirection::Out, false) => {
                self.endpoint
                    .set_status(regs, UsbDirection::Out, Status::Valid);
            }
            (UsbDirection::Out, true) => {}
        }
    }

    pub fn is_halted(&self, direction: UsbDirection) -> bool {
        self.endpoint.is_stalled(direction)
    }
}
