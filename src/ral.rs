//! Register access layer for the USB full-speed device peripheral
//!
//! The `usb` module follows the layout of a generated RAL module: a
//! `RegisterBlock`, plus one module per register with `offset` and `mask`
//! for each field. The `ral-registers` macros work on anything that has
//! a field named after the register with `read()` and `write()` methods.
//! We take advantage of that to run the macros through the [`Registers`]
//! accessor contract, so the same driver code works with the memory-mapped
//! peripheral and with a simulated one.

use crate::{pma::PacketMemory, Peripherals, Register, Registers};

pub use ral_registers::{modify_reg, read_reg, write_reg};

/// Declares register fields in the shape the RAL macros expect.
macro_rules! fields {
    ($($field:ident: $offset:expr, $width:expr $(, { $($name:ident = $value:expr),* $(,)? })?;)*) => {
        $(
            #[allow(dead_code)]
            pub mod $field {
                pub const offset: u16 = $offset;
                pub const mask: u16 = (((1u32 << $width) - 1) << $offset) as u16;
                pub mod R {}
                pub mod W {}
                pub mod RW {
                    $($(pub const $name: u16 = $value;)*)?
                }
            }
        )*
    };
}

#[allow(non_snake_case, non_upper_case_globals)]
pub mod usb {
    use ral_registers::{RORegister, RWRegister};

    /// One endpoint register, padded to its 32-bit slot.
    #[repr(C)]
    pub struct EndpointRegister {
        pub EPR: RWRegister<u16>,
        _reserved: u16,
    }

    #[repr(C)]
    pub struct RegisterBlock {
        pub EPR: [EndpointRegister; 8],
        _reserved0: [u32; 8],
        pub CNTR: RWRegister<u16>,
        _reserved1: u16,
        pub ISTR: RWRegister<u16>,
        _reserved2: u16,
        pub FNR: RORegister<u16>,
        _reserved3: u16,
        pub DADDR: RWRegister<u16>,
        _reserved4: u16,
        pub BTABLE: RWRegister<u16>,
        _reserved5: u16,
        pub LPMCSR: RWRegister<u16>,
        _reserved6: u16,
        pub BCDR: RWRegister<u16>,
        _reserved7: u16,
    }

    const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 0x5C) as usize];

    /// Endpoint register. Mixes read/write, toggle-on-write-one, and
    /// clear-on-write-zero fields; see `crate::endpoint` before writing it.
    pub mod EPR {
        fields! {
            CTR_RX: 15, 1;
            DTOG_RX: 14, 1;
            STAT_RX: 12, 2, { DISABLED = 0b00, STALL = 0b01, NAK = 0b10, VALID = 0b11 };
            SETUP: 11, 1;
            EP_TYPE: 9, 2, { BULK = 0b00, CONTROL = 0b01, ISO = 0b10, INTERRUPT = 0b11 };
            EP_KIND: 8, 1;
            CTR_TX: 7, 1;
            DTOG_TX: 6, 1;
            STAT_TX: 4, 2, { DISABLED = 0b00, STALL = 0b01, NAK = 0b10, VALID = 0b11 };
            EA: 0, 4;
        }
    }

    pub mod CNTR {
        fields! {
            CTRM: 15, 1;
            PMAOVRM: 14, 1;
            ERRM: 13, 1;
            WKUPM: 12, 1;
            SUSPM: 11, 1;
            RESETM: 10, 1;
            SOFM: 9, 1;
            ESOFM: 8, 1;
            L1REQM: 7, 1;
            L1RESUME: 5, 1;
            RESUME: 4, 1;
            FSUSP: 3, 1;
            LP_MODE: 2, 1;
            PDWN: 1, 1;
            FRES: 0, 1;
        }
    }

    /// Interrupt status. Event flags are cleared by writing zero; `CTR`,
    /// `DIR`, and `EP_ID` are read only.
    pub mod ISTR {
        fields! {
            CTR: 15, 1;
            PMAOVR: 14, 1;
            ERR: 13, 1;
            WKUP: 12, 1;
            SUSP: 11, 1;
            RESET: 10, 1;
            SOF: 9, 1;
            ESOF: 8, 1;
            L1REQ: 7, 1;
            DIR: 4, 1;
            EP_ID: 0, 4;
        }
    }

    pub mod FNR {
        fields! {
            RXDP: 15, 1;
            RXDM: 14, 1;
            LCK: 13, 1;
            LSOF: 11, 2;
            FN: 0, 11;
        }
    }

    pub mod DADDR {
        fields! {
            EF: 7, 1;
            ADD: 0, 7;
        }
    }

    pub mod BTABLE {
        fields! {
            BTABLE: 3, 13;
        }
    }

    pub mod BCDR {
        fields! {
            DPPU: 15, 1;
        }
    }

    /// An owned handle to the USB register block
    pub struct Instance {
        addr: *const RegisterBlock,
    }

    // Safety: the instance is the sole owner of the register block. See
    // `Peripherals`.
    unsafe impl Send for Instance {}

    impl Instance {
        /// # Safety
        ///
        /// `addr` must point to the USB register block, and there must be no
        /// other owner of the register block.
        pub(crate) const unsafe fn new(addr: *const RegisterBlock) -> Self {
            Instance { addr }
        }
    }

    impl core::ops::Deref for Instance {
        type Target = RegisterBlock;
        fn deref(&self) -> &RegisterBlock {
            // Safety: see Instance::new.
            unsafe { &*self.addr }
        }
    }
}

/// Take the register block and packet memory from a `Peripherals`.
pub fn instances<P: Peripherals>(peripherals: P) -> (usb::Instance, PacketMemory<'static>) {
    // Safety: a Peripherals implementation promises that it owns both
    // regions, and we consume it here.
    unsafe {
        (
            usb::Instance::new(peripherals.usb().cast()),
            PacketMemory::from_raw(
                peripherals.packet_memory(),
                peripherals.packet_memory_size(),
            ),
        )
    }
}

impl Registers for usb::Instance {
    fn read(&self, register: Register) -> u16 {
        match register {
            Register::Endpoint(index) => self.EPR[usize::from(index)].EPR.read(),
            Register::Cntr => read_reg!(usb, self, CNTR),
            Register::Istr => read_reg!(usb, self, ISTR),
            Register::Fnr => read_reg!(usb, self, FNR),
            Register::Daddr => read_reg!(usb, self, DADDR),
            Register::Btable => read_reg!(usb, self, BTABLE),
            Register::Bcdr => read_reg!(usb, self, BCDR),
        }
    }

    fn write(&self, register: Register, value: u16) {
        match register {
            Register::Endpoint(index) => self.EPR[usize::from(index)].EPR.write(value),
            Register::Cntr => write_reg!(usb, self, CNTR, value),
            Register::Istr => write_reg!(usb, self, ISTR, value),
            Register::Fnr => warn!("FNR is read only"),
            Register::Daddr => write_reg!(usb, self, DADDR, value),
            Register::Btable => write_reg!(usb, self, BTABLE, value),
            Register::Bcdr => write_reg!(usb, self, BCDR, value),
        }
    }
}

/// A single register, seen through a [`Registers`] implementation
pub struct Reg<'r, R: ?Sized> {
    regs: &'r R,
    register: Register,
}

impl<R: Registers + ?Sized> Reg<'_, R> {
    pub fn read(&self) -> u16 {
        self.regs.read(self.register)
    }
    pub fn write(&self, value: u16) {
        self.regs.write(self.register, value)
    }
}

/// The control and status registers, in a form the RAL macros accept
///
/// ```ignore
/// let usb = ral::control(&regs);
/// ral::modify_reg!(ral::usb, &usb, CNTR, FSUSP: 1);
/// ```
#[allow(non_snake_case)]
pub struct ControlRegisters<'r, R: ?Sized> {
    pub CNTR: Reg<'r, R>,
    pub ISTR: Reg<'r, R>,
    pub DADDR: Reg<'r, R>,
    pub BTABLE: Reg<'r, R>,
    pub BCDR: Reg<'r, R>,
}

pub fn control<R: Registers + ?Sized>(regs: &R) -> ControlRegisters<'_, R> {
    ControlRegisters {
        CNTR: Reg { regs, register: Register::Cntr },
        ISTR: Reg { regs, register: Register::Istr },
        DADDR: Reg { regs, register: Register::Daddr },
        BTABLE: Reg { regs, register: Register::Btable },
        BCDR: Reg { regs, register: Register::Bcdr },
    }
}

/// The RAL API requires us to name the endpoint register. We can make it a
/// little easier with this function and the `EndpointRegisters` type.
#[allow(non_snake_case)]
pub struct EndpointRegisters<'r, R: ?Sized> {
    pub EPR: Reg<'r, R>,
}

/// # Panics
///
/// Panics if `index` doesn't name one of the eight endpoint registers.
pub fn endpoint<R: Registers + ?Sized>(regs: &R, index: u8) -> EndpointRegisters<'_, R> {
    assert!(index < 8, "EPR register {} doesn't exist", index);
    EndpointRegisters {
        EPR: Reg {
            regs,
            register: Register::Endpoint(index),
        },
    }
}
