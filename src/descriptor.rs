//! USB descriptors for a CDC-ACM virtual serial port
//!
//! The driver serves these descriptors verbatim. The defaults describe one
//! configuration with a CDC communication interface and a CDC data
//! interface that holds the bulk endpoint pair. Use the `const fn`
//! builders to substitute your own IDs and strings:
//!
//! ```
//! use usbd_vsp::{descriptor, Config, Descriptors};
//!
//! const DEVICE: [u8; 18] = descriptor::device(0x1209, 0x0001);
//! const PRODUCT: [u8; 12] = descriptor::string("Modem");
//! const STRINGS: [&[u8]; 4] = [
//!     &descriptor::LANGUAGES,
//!     &descriptor::MANUFACTURER,
//!     &PRODUCT,
//!     &descriptor::SERIAL_NUMBER,
//! ];
//!
//! const CONFIG: Config = Config::new().descriptors(Descriptors {
//!     device: &DEVICE,
//!     strings: &STRINGS,
//!     ..Descriptors::new()
//! });
//! # assert_eq!(CONFIG.descriptors.device[8], 0x09);
//! ```

/// Descriptor type codes, from the high byte of a `GET_DESCRIPTOR` value.
pub mod descriptor_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
    pub const DEVICE_QUALIFIER: u8 = 6;
    pub const CS_INTERFACE: u8 = 0x24;
}

/// Communications device class
const CLASS_CDC: u8 = 0x02;
/// Abstract control model subclass
const SUBCLASS_ACM: u8 = 0x02;
/// CDC data interface class
const CLASS_CDC_DATA: u8 = 0x0A;

/// Functional descriptor subtypes
const HEADER: u8 = 0x00;
const CALL_MANAGEMENT: u8 = 0x01;
const ACM: u8 = 0x02;
const UNION: u8 = 0x06;

/// Bulk OUT endpoint address
pub const DATA_OUT: u8 = 0x01;
/// Bulk IN endpoint address
pub const DATA_IN: u8 = 0x81;

/// Size of the configuration descriptor, and all that follows it
pub const CONFIGURATION_SIZE: usize = 60;

/// Build a device descriptor for a CDC device.
///
/// USB 2.0, a 64 byte control endpoint, device release 1.00, and string
/// indices 1, 2, and 3 for the manufacturer, product, and serial number.
pub const fn device(vendor_id: u16, product_id: u16) -> [u8; 18] {
    let vid = vendor_id.to_le_bytes();
    let pid = product_id.to_le_bytes();
    [
        18,
        descriptor_type::DEVICE,
        0x00,
        0x02, // bcdUSB 2.00
        CLASS_CDC,
        0x00,
        0x00,
        crate::MAX_PACKET_SIZE as u8,
        vid[0],
        vid[1],
        pid[0],
        pid[1],
        0x00,
        0x01, // bcdDevice 1.00
        1,
        2,
        3,
        1, // bNumConfigurations
    ]
}

/// Build the configuration descriptor for a data endpoint pair with the
/// given maximum packet size.
pub const fn configuration(max_packet_size: u16) -> [u8; CONFIGURATION_SIZE] {
    let total = (CONFIGURATION_SIZE as u16).to_le_bytes();
    let mps = max_packet_size.to_le_bytes();
    [
        // Configuration 1: two interfaces, bus powered, 100mA.
        9,
        descriptor_type::CONFIGURATION,
        total[0],
        total[1],
        2,
        1,
        0,
        0x80,
        50,
        // Interface 0: communication, no endpoints.
        9,
        descriptor_type::INTERFACE,
        0,
        0,
        0,
        CLASS_CDC,
        SUBCLASS_ACM,
        0x00,
        0,
        // Header, CDC 1.10.
        5,
        descriptor_type::CS_INTERFACE,
        HEADER,
        0x10,
        0x01,
        // Call management: handled by the host, on interface 1.
        5,
        descriptor_type::CS_INTERFACE,
        CALL_MANAGEMENT,
        0x00,
        1,
        // ACM: line coding and serial state requests.
        4,
        descriptor_type::CS_INTERFACE,
        ACM,
        0x02,
        // Union: interface 0 controls interface 1.
        5,
        descriptor_type::CS_INTERFACE,
        UNION,
        0,
        1,
        // Interface 1: data.
        9,
        descriptor_type::INTERFACE,
        1,
        0,
        2,
        CLASS_CDC_DATA,
        0x00,
        0x00,
        0,
        // Bulk OUT.
        7,
        descriptor_type::ENDPOINT,
        DATA_OUT,
        0x02,
        mps[0],
        mps[1],
        0,
        // Bulk IN.
        7,
        descriptor_type::ENDPOINT,
        DATA_IN,
        0x02,
        mps[0],
        mps[1],
        0,
    ]
}

/// Build a string descriptor from ASCII text.
///
/// `N` must be `2 + 2 * text.len()`; anything else fails to compile when
/// evaluated in a constant.
pub const fn string<const N: usize>(text: &str) -> [u8; N] {
    let bytes = text.as_bytes();
    assert!(N == 2 + 2 * bytes.len(), "string descriptor size mismatch");
    assert!(N <= 255, "string descriptor too long");
    let mut descriptor = [0; N];
    descriptor[0] = N as u8;
    descriptor[1] = descriptor_type::STRING;
    let mut i = 0;
    while i < bytes.len() {
        assert!(bytes[i].is_ascii(), "string descriptors must be ASCII");
        descriptor[2 + 2 * i] = bytes[i];
        i += 1;
    }
    descriptor
}

/// The default device descriptor
pub const DEVICE: [u8; 18] = device(0x5824, 0x27DD);
/// The default configuration descriptor, with 64 byte packets
pub const CONFIGURATION: [u8; CONFIGURATION_SIZE] = configuration(crate::MAX_PACKET_SIZE as u16);
/// String 0: English (United States)
pub const LANGUAGES: [u8; 4] = [4, descriptor_type::STRING, 0x09, 0x04];
pub const MANUFACTURER: [u8; 18] = string("usbd-vsp");
pub const PRODUCT: [u8; 40] = string("Virtual Serial Port");
pub const SERIAL_NUMBER: [u8; 10] = string("0001");
/// The default strings, indexed by string descriptor index
pub const STRINGS: [&[u8]; 4] = [&LANGUAGES, &MANUFACTURER, &PRODUCT, &SERIAL_NUMBER];

/// The descriptors that the driver serves
#[derive(Debug, Clone, Copy)]
pub struct Descriptors {
    /// Device descriptor
    pub device: &'static [u8],
    /// Configuration descriptor, followed by its interface, functional, and
    /// endpoint descriptors
    pub configuration: &'static [u8],
    /// String descriptors, by index. Index 0 is the language list.
    pub strings: &'static [&'static [u8]],
}

impl Descriptors {
    /// The default CDC-ACM descriptor set.
    pub const fn new() -> Self {
        Descriptors {
            device: &DEVICE,
            configuration: &CONFIGURATION,
            strings: &STRINGS,
        }
    }

    /// Look up a descriptor by type and index.
    pub(crate) fn get(&self, descriptor_type: u8, index: u8) -> Option<&'static [u8]> {
        match (descriptor_type, index) {
            (descriptor_type::DEVICE, 0) => Some(self.device),
            (descriptor_type::CONFIGURATION, 0) => Some(self.configuration),
            (descriptor_type::STRING, index) => self.strings.get(usize::from(index)).copied(),
            _ => None,
        }
    }
}

impl Default for Descriptors {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::{descriptor_type, Descriptors, CONFIGURATION_SIZE};

    #[test]
    fn device() {
        let device = super::device(0x1209, 0xBEEF);
        assert_eq!(device.len(), 18);
        assert_eq!(device[0], 18);
        assert_eq!(device[1], descriptor_type::DEVICE);
        assert_eq!(device[4], 0x02);
        assert_eq!(device[7], 64);
        assert_eq!(&device[8..12], &[0x09, 0x12, 0xEF, 0xBE]);
    }

    #[test]
    fn configuration_walk() {
        let config = super::configuration(64);
        assert_eq!(
            usize::from(u16::from_le_bytes([config[2], config[3]])),
            CONFIGURATION_SIZE
        );

        // Descriptor lengths chain exactly to the end.
        let mut offset = 0;
        let mut endpoints = 0;
        while offset < config.len() {
            if config[offset + 1] == descriptor_type::ENDPOINT {
                endpoints += 1;
                assert_eq!(config[offset + 4], 64);
            }
            offset += usize::from(config[offset]);
        }
        assert_eq!(offset, CONFIGURATION_SIZE);
        assert_eq!(endpoints, 2);
    }

    #[test]
    fn strings() {
        let product = super::string::<8>("abc");
        assert_eq!(product, [8, 3, b'a', 0, b'b', 0, b'c', 0]);
        assert_eq!(super::MANUFACTURER[0], 18);
        assert_eq!(super::PRODUCT[0], 40);
    }

    #[test]
    fn lookup() {
        let descriptors = Descriptors::new();
        assert_eq!(descriptors.get(descriptor_type::DEVICE, 0), Some(&super::DEVICE[..]));
        assert_eq!(descriptors.get(descriptor_type::STRING, 3), Some(&super::SERIAL_NUMBER[..]));
        assert_eq!(descriptors.get(descriptor_type::STRING, 4), None);
        assert_eq!(descriptors.get(descriptor_type::DEVICE_QUALIFIER, 0), None);
        assert_eq!(descriptors.get(descriptor_type::CONFIGURATION, 1), None);
    }
}
