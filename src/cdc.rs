//! CDC-ACM class state
//!
//! The host tells the device how it would configure a real UART with
//! `SET_LINE_CODING`, and drives the modem control lines with
//! `SET_CONTROL_LINE_STATE`. There's no UART; the driver keeps both so the
//! application can observe them.

use bitflags::bitflags;

use crate::control::ProtocolError;

/// `SET_LINE_CODING` class request
pub const SET_LINE_CODING: u8 = 0x20;
/// `GET_LINE_CODING` class request
pub const GET_LINE_CODING: u8 = 0x21;
/// `SET_CONTROL_LINE_STATE` class request
pub const SET_CONTROL_LINE_STATE: u8 = 0x22;
/// `SEND_BREAK` class request
pub const SEND_BREAK: u8 = 0x23;

/// Size of the line coding structure on the wire
pub const LINE_CODING_SIZE: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StopBits {
    One = 0,
    OnePointFive = 1,
    Two = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Parity {
    None = 0,
    Odd = 1,
    Even = 2,
    Mark = 3,
    Space = 4,
}

/// Serial port settings requested by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineCoding {
    baud_rate: u32,
    stop_bits: StopBits,
    parity: Parity,
    data_bits: u8,
}

impl LineCoding {
    /// 115200 baud, 8 data bits, no parity, one stop bit.
    pub const fn new() -> Self {
        LineCoding {
            baud_rate: 115_200,
            stop_bits: StopBits::One,
            parity: Parity::None,
            data_bits: 8,
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn stop_bits(&self) -> StopBits {
        self.stop_bits
    }

    pub fn parity(&self) -> Parity {
        self.parity
    }

    /// Data bits per character: 5, 6, 7, 8, or 16.
    pub fn data_bits(&self) -> u8 {
        self.data_bits
    }

    /// Encode for a `GET_LINE_CODING` data stage.
    pub fn to_bytes(&self) -> [u8; LINE_CODING_SIZE] {
        let baud = self.baud_rate.to_le_bytes();
        [
            baud[0],
            baud[1],
            baud[2],
            baud[3],
            self.stop_bits as u8,
            self.parity as u8,
            self.data_bits,
        ]
    }

    /// Decode a `SET_LINE_CODING` data stage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let bytes: &[u8; LINE_CODING_SIZE] = bytes
            .try_into()
            .map_err(|_| ProtocolError::Length(bytes.len() as u16))?;
        let stop_bits = match bytes[4] {
            0 => StopBits::One,
            1 => StopBits::OnePointFive,
            2 => StopBits::Two,
            _ => return Err(ProtocolError::LineCoding),
        };
        let parity = match bytes[5] {
            0 => Parity::None,
            1 => Parity::Odd,
            2 => Parity::Even,
            3 => Parity::Mark,
            4 => Parity::Space,
            _ => return Err(ProtocolError::LineCoding),
        };
        let data_bits = match bytes[6] {
            bits @ (5..=8 | 16) => bits,
            _ => return Err(ProtocolError::LineCoding),
        };
        Ok(LineCoding {
            baud_rate: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            stop_bits,
            parity,
            data_bits,
        })
    }
}

impl Default for LineCoding {
    fn default() -> Self {
        Self::new()
    }
}

bitflags! {
    /// Modem control lines, driven by the host
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlLines : u16 {
        /// Data terminal ready. Terminal programs set this when they open
        /// the port.
        const DTR = 1 << 0;
        /// Request to send.
        const RTS = 1 << 1;
    }
}

/// Class state that persists across transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdcState {
    pub line_coding: LineCoding,
    pub control_lines: ControlLines,
}

impl CdcState {
    pub const fn new() -> Self {
        CdcState {
            line_coding: LineCoding::new(),
            control_lines: ControlLines::empty(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{LineCoding, Parity, StopBits};
    use crate::ProtocolError;

    #[test]
    fn default_line_coding() {
        let coding = LineCoding::default();
        assert_eq!(coding.to_bytes(), [0x00, 0xC2, 0x01, 0x00, 0, 0, 8]);
    }

    #[test]
    fn decode() {
        let coding = LineCoding::from_bytes(&[0x80, 0x25, 0, 0, 2, 2, 7]).unwrap();
        assert_eq!(coding.baud_rate(), 9600);
        assert_eq!(coding.stop_bits(), StopBits::Two);
        assert_eq!(coding.parity(), Parity::Even);
        assert_eq!(coding.data_bits(), 7);
        assert_eq!(coding.to_bytes(), [0x80, 0x25, 0, 0, 2, 2, 7]);
    }

    #[test]
    fn reject_invalid_codes() {
        assert_eq!(
            LineCoding::from_bytes(&[0x80, 0x25, 0, 0, 3, 0, 8]),
            Err(ProtocolError::LineCoding)
        );
        assert_eq!(
            LineCoding::from_bytes(&[0x80, 0x25, 0, 0, 0, 5, 8]),
            Err(ProtocolError::LineCoding)
        );
        assert_eq!(
            LineCoding::from_bytes(&[0x80, 0x25, 0, 0, 0, 0, 9]),
            Err(ProtocolError::LineCoding)
        );
        assert_eq!(
            LineCoding::from_bytes(&[0x80, 0x25, 0]),
            Err(ProtocolError::Length(3))
        );
    }
}
