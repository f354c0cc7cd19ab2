//! Interrupt-safe ownership of the driver

use core::cell::RefCell;
use cortex_m::interrupt::{self, Mutex};
use usb_device::UsbError;

use crate::{
    bdt::LayoutError, ral, Config, ControlLines, DeviceState, Driver, LineCoding, Peripherals,
    ProtocolError, SerialEndpoints,
};

/// A virtual serial port on the memory-mapped USB peripheral
///
/// `Device` owns a [`Driver`], and serializes access to it with a critical
/// section. Share it between the USB interrupt handler and the rest of your
/// program.
///
/// # Example
///
/// ```no_run
/// use usbd_vsp::{Config, Device, Peripherals, SerialBuffers};
///
/// # struct Usb;
/// # unsafe impl Peripherals for Usb {
/// #     fn usb(&self) -> *const () { 0x4000_5C00 as *const () }
/// #     fn packet_memory(&self) -> *const () { 0x4000_6000 as *const () }
/// # }
/// let mut buffers = SerialBuffers::<256>::new();
/// let (mut port, endpoints) = buffers.split();
/// let device = Device::new(Usb, endpoints, &Config::new()).unwrap();
/// device.attach();
///
/// // In the USB interrupt handler:
/// device.on_interrupt();
///
/// // Anywhere else, echo what the host sends:
/// let mut buffer = [0; 64];
/// let len = port.read(&mut buffer);
/// port.write(&buffer[..len]);
/// device.start_transmit().ok();
/// ```
pub struct Device<'a, const N: usize> {
    driver: Mutex<RefCell<Driver<'a, ral::usb::Instance, N>>>,
}

impl<'a, const N: usize> Device<'a, N> {
    /// Create and initialize the driver.
    ///
    /// The device isn't visible to the host until you [`attach`](Device::attach).
    pub fn new<P: Peripherals>(
        peripherals: P,
        serial: SerialEndpoints<'a, N>,
        config: &Config,
    ) -> Result<Self, LayoutError> {
        let (usb, packet_memory) = ral::instances(peripherals);
        let mut driver = Driver::new(usb, packet_memory, serial, config)?;
        driver.initialize();
        Ok(Device {
            driver: Mutex::new(RefCell::new(driver)),
        })
    }

    /// Interrupt-safe, immutable access to the driver
    fn with_driver<T>(&self, func: impl FnOnce(&Driver<'a, ral::usb::Instance, N>) -> T) -> T {
        interrupt::free(|cs| {
            let driver = self.driver.borrow(cs);
            let driver = driver.borrow();
            func(&driver)
        })
    }

    /// Interrupt-safe, mutable access to the driver
    fn with_driver_mut<T>(
        &self,
        func: impl FnOnce(&mut Driver<'a, ral::usb::Instance, N>) -> T,
    ) -> T {
        interrupt::free(|cs| {
            let driver = self.driver.borrow(cs);
            let mut driver = driver.borrow_mut();
            func(&mut driver)
        })
    }

    /// Handle the USB interrupt.
    pub fn on_interrupt(&self) {
        self.with_driver_mut(|driver| driver.on_interrupt());
    }

    /// Send queued bytes now. See [`Driver::start_transmit`].
    pub fn start_transmit(&self) -> Result<(), UsbError> {
        self.with_driver_mut(|driver| driver.start_transmit())
    }

    pub fn attach(&self) {
        self.with_driver_mut(|driver| driver.attach());
    }

    pub fn detach(&self) {
        self.with_driver_mut(|driver| driver.detach());
    }

    pub fn state(&self) -> DeviceState {
        self.with_driver(|driver| driver.state())
    }

    pub fn line_coding(&self) -> LineCoding {
        self.with_driver(|driver| driver.line_coding())
    }

    pub fn control_lines(&self) -> ControlLines {
        self.with_driver(|driver| driver.control_lines())
    }

    /// See [`Driver::last_error`].
    pub fn last_error(&self) -> Option<ProtocolError> {
        self.with_driver(|driver| driver.last_error())
    }
}
