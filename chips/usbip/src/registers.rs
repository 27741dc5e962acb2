// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Register layout of the USB IP block.
//!
//! Every register of the block is 16 bits wide, except the FIFO data ports,
//! which also accept 8 and 32-bit accesses. The driver reaches the block
//! through [`UsbRegisters`], a flat read/write capability keyed by byte offset,
//! so that the same code drives the memory mapped block and the simulated one
//! used by the tests.
//!
//! The interrupt status registers (`INTSTS0`, `INTSTS1`, `BRDYSTS`, `NRDYSTS`,
//! `BEMPSTS`) are write-zero-to-clear: writing a 1 leaves a bit unchanged.

use core::cell::UnsafeCell;
use core::mem::size_of;
use core::ptr;

use kernel::utilities::registers::{FieldValue, RegisterLongName};
use kernel::utilities::StaticRef;
use tock_registers::{register_bitfields, LocalRegisterCopy};

/// Byte offsets of the registers within the block.
pub mod offset {
    pub const SYSCFG: usize = 0x00;
    pub const SYSSTS0: usize = 0x04;
    pub const DVSTCTR0: usize = 0x08;
    pub const CFIFO: usize = 0x14;
    pub const D0FIFO: usize = 0x18;
    pub const D1FIFO: usize = 0x1C;
    pub const CFIFOSEL: usize = 0x20;
    pub const CFIFOCTR: usize = 0x22;
    pub const D0FIFOSEL: usize = 0x28;
    pub const D0FIFOCTR: usize = 0x2A;
    pub const D1FIFOSEL: usize = 0x2C;
    pub const D1FIFOCTR: usize = 0x2E;
    pub const INTENB0: usize = 0x30;
    pub const INTENB1: usize = 0x32;
    pub const BRDYENB: usize = 0x36;
    pub const NRDYENB: usize = 0x38;
    pub const BEMPENB: usize = 0x3A;
    pub const INTSTS0: usize = 0x40;
    pub const INTSTS1: usize = 0x42;
    pub const BRDYSTS: usize = 0x46;
    pub const NRDYSTS: usize = 0x48;
    pub const BEMPSTS: usize = 0x4A;
    pub const FRMNUM: usize = 0x4C;
    pub const USBADDR: usize = 0x50;
    pub const USBREQ: usize = 0x54;
    pub const USBVAL: usize = 0x56;
    pub const USBINDX: usize = 0x58;
    pub const USBLENG: usize = 0x5A;
    pub const DCPCFG: usize = 0x5C;
    pub const DCPMAXP: usize = 0x5E;
    pub const DCPCTR: usize = 0x60;
    pub const PIPESEL: usize = 0x64;
    pub const PIPECFG: usize = 0x68;
    pub const PIPEMAXP: usize = 0x6C;
    pub const PIPEPERI: usize = 0x6E;
    pub const PIPE1CTR: usize = 0x70;
    pub const PIPE1TRE: usize = 0x90;
    pub const PIPE1TRN: usize = 0x92;
    pub const DEVADD0: usize = 0xD0;

    /// Control register of `pipe`. Pipe 0 is controlled through `DCPCTR`.
    pub const fn pipe_ctr(pipe: usize) -> usize {
        if pipe == 0 {
            DCPCTR
        } else {
            PIPE1CTR + 2 * (pipe - 1)
        }
    }

    /// Transaction counter enable register of `pipe` (pipes 1-5).
    pub const fn pipe_tre(pipe: usize) -> usize {
        PIPE1TRE + 4 * (pipe - 1)
    }

    /// Transaction counter of `pipe` (pipes 1-5).
    pub const fn pipe_trn(pipe: usize) -> usize {
        PIPE1TRN + 4 * (pipe - 1)
    }

    pub const fn devadd(address: usize) -> usize {
        DEVADD0 + 2 * address
    }
}

/// Size of the register window.
pub const WINDOW_SIZE: usize = 0x100;

register_bitfields![u16,
    pub SYSCFG [
        USBE OFFSET(0) NUMBITS(1) [],
        /// D+ pull-up, peripheral mode
        DPRPU OFFSET(4) NUMBITS(1) [],
        /// D+/D- pull-down, host mode
        DRPD OFFSET(5) NUMBITS(1) [],
        /// Controller function select
        DCFM OFFSET(6) NUMBITS(1) [
            Peripheral = 0,
            Host = 1
        ],
        HSE OFFSET(7) NUMBITS(1) [],
        SCKE OFFSET(10) NUMBITS(1) []
    ],

    pub SYSSTS0 [
        LNST OFFSET(0) NUMBITS(2) [
            SE0 = 0,
            J = 1,
            K = 2,
            SE1 = 3
        ]
    ],

    pub DVSTCTR0 [
        /// Reset handshake status
        RHST OFFSET(0) NUMBITS(3) [
            Undecided = 0,
            LowSpeed = 1,
            FullSpeed = 2,
            HighSpeed = 3,
            Resetting = 4
        ],
        /// SOF output enable
        UACT OFFSET(4) NUMBITS(1) [],
        RESUME OFFSET(5) NUMBITS(1) [],
        USBRST OFFSET(6) NUMBITS(1) [],
        RWUPE OFFSET(7) NUMBITS(1) [],
        WKUP OFFSET(8) NUMBITS(1) []
    ],

    /// CFIFOSEL, D0FIFOSEL and D1FIFOSEL
    pub FIFOSEL [
        CURPIPE OFFSET(0) NUMBITS(4) [],
        /// DCP buffer access direction, 1 = write
        ISEL OFFSET(5) NUMBITS(1) [],
        BIGEND OFFSET(8) NUMBITS(1) [],
        MBW OFFSET(10) NUMBITS(2) [
            Bits8 = 0,
            Bits16 = 1,
            Bits32 = 2
        ],
        /// DMA request enable, D0FIFO/D1FIFO only
        DREQE OFFSET(12) NUMBITS(1) [],
        DCLRM OFFSET(13) NUMBITS(1) [],
        REW OFFSET(14) NUMBITS(1) [],
        RCNT OFFSET(15) NUMBITS(1) []
    ],

    /// CFIFOCTR, D0FIFOCTR and D1FIFOCTR
    pub FIFOCTR [
        DTLN OFFSET(0) NUMBITS(12) [],
        FRDY OFFSET(13) NUMBITS(1) [],
        BCLR OFFSET(14) NUMBITS(1) [],
        BVAL OFFSET(15) NUMBITS(1) []
    ],

    pub INTENB0 [
        BRDYE OFFSET(8) NUMBITS(1) [],
        NRDYE OFFSET(9) NUMBITS(1) [],
        BEMPE OFFSET(10) NUMBITS(1) [],
        CTRE OFFSET(11) NUMBITS(1) [],
        DVSE OFFSET(12) NUMBITS(1) [],
        SOFE OFFSET(13) NUMBITS(1) [],
        RSME OFFSET(14) NUMBITS(1) [],
        VBSE OFFSET(15) NUMBITS(1) []
    ],

    pub INTSTS0 [
        /// Control transfer stage
        CTSQ OFFSET(0) NUMBITS(3) [
            IdleOrSetup = 0,
            ReadData = 1,
            ReadStatus = 2,
            WriteData = 3,
            WriteStatus = 4,
            NoDataStatus = 5,
            SequenceError = 6
        ],
        /// Setup packet received
        VALID OFFSET(3) NUMBITS(1) [],
        /// Device state
        DVSQ OFFSET(4) NUMBITS(3) [],
        VBSTS OFFSET(7) NUMBITS(1) [],
        BRDY OFFSET(8) NUMBITS(1) [],
        NRDY OFFSET(9) NUMBITS(1) [],
        BEMP OFFSET(10) NUMBITS(1) [],
        CTRT OFFSET(11) NUMBITS(1) [],
        DVST OFFSET(12) NUMBITS(1) [],
        SOFR OFFSET(13) NUMBITS(1) [],
        RESM OFFSET(14) NUMBITS(1) [],
        VBINT OFFSET(15) NUMBITS(1) []
    ],

    /// INTSTS1, and INTENB1 with the same bit positions
    pub INTSTS1 [
        SACK OFFSET(4) NUMBITS(1) [],
        SIGN OFFSET(5) NUMBITS(1) [],
        EOFERR OFFSET(6) NUMBITS(1) [],
        ATTCH OFFSET(11) NUMBITS(1) [],
        DTCH OFFSET(12) NUMBITS(1) [],
        BCHG OFFSET(14) NUMBITS(1) [],
        OVRCR OFFSET(15) NUMBITS(1) []
    ],

    pub DCPCFG [
        /// 1 = transmit
        DIR OFFSET(4) NUMBITS(1) [],
        SHTNAK OFFSET(7) NUMBITS(1) []
    ],

    /// DCPMAXP and PIPEMAXP
    pub MAXP [
        MXPS OFFSET(0) NUMBITS(11) [],
        DEVSEL OFFSET(12) NUMBITS(4) []
    ],

    /// DCPCTR and PIPEnCTR
    pub PIPECTR [
        PID OFFSET(0) NUMBITS(2) [
            NAK = 0,
            BUF = 1,
            STALL = 2,
            STALL_ACTIVE = 3
        ],
        /// Control transfer end enable, DCP only
        CCPL OFFSET(2) NUMBITS(1) [],
        PBUSY OFFSET(5) NUMBITS(1) [],
        SQMON OFFSET(6) NUMBITS(1) [],
        SQSET OFFSET(7) NUMBITS(1) [],
        SQCLR OFFSET(8) NUMBITS(1) [],
        ACLRM OFFSET(9) NUMBITS(1) [],
        SUREQCLR OFFSET(11) NUMBITS(1) [],
        /// Setup token transmit request, DCP only
        SUREQ OFFSET(14) NUMBITS(1) [],
        BSTS OFFSET(15) NUMBITS(1) []
    ],

    pub PIPECFG [
        EPNUM OFFSET(0) NUMBITS(4) [],
        /// 1 = transmit
        DIR OFFSET(4) NUMBITS(1) [],
        SHTNAK OFFSET(7) NUMBITS(1) [],
        DBLB OFFSET(9) NUMBITS(1) [],
        BFRE OFFSET(10) NUMBITS(1) [],
        TYPE OFFSET(14) NUMBITS(2) [
            Unused = 0,
            Bulk = 1,
            Interrupt = 2,
            Isochronous = 3
        ]
    ],

    pub PIPEPERI [
        IITV OFFSET(0) NUMBITS(3) []
    ],

    pub PIPETRE [
        TRCLR OFFSET(8) NUMBITS(1) [],
        TRENB OFFSET(9) NUMBITS(1) []
    ],

    pub DEVADD [
        USBSPD OFFSET(6) NUMBITS(2) [
            None = 0,
            Low = 1,
            Full = 2,
            High = 3
        ]
    ]
];

pub type SyscfgVal = LocalRegisterCopy<u16, SYSCFG::Register>;
pub type DvstctrVal = LocalRegisterCopy<u16, DVSTCTR0::Register>;
pub type FifoSelVal = LocalRegisterCopy<u16, FIFOSEL::Register>;
pub type FifoCtrVal = LocalRegisterCopy<u16, FIFOCTR::Register>;
pub type IntSts0Val = LocalRegisterCopy<u16, INTSTS0::Register>;
pub type IntSts1Val = LocalRegisterCopy<u16, INTSTS1::Register>;
pub type PipeCtrVal = LocalRegisterCopy<u16, PIPECTR::Register>;

/// Bits of `INTSTS0` that software clears by writing 0.
pub const INTSTS0_CLEARABLE: u16 = (1 << 15) | (1 << 14) | (1 << 13) | (1 << 12) | (1 << 11) | (1 << 3);

/// Flat access to the register block.
///
/// Implementations provide sized reads and writes at a byte offset. The
/// provided methods build typed accesses and read-modify-write sequences on
/// top of them.
pub trait UsbRegisters {
    fn read8(&self, offset: usize) -> u8;
    fn write8(&self, offset: usize, val: u8);
    fn read16(&self, offset: usize) -> u16;
    fn write16(&self, offset: usize, val: u16);
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, val: u32);

    /// Bus address of the register at `offset`, for DMA descriptors.
    fn address(&self, offset: usize) -> usize;

    fn read_reg<R: RegisterLongName>(&self, offset: usize) -> LocalRegisterCopy<u16, R> {
        LocalRegisterCopy::new(self.read16(offset))
    }

    /// Write `value`; bits outside its fields are written as 0.
    fn write_reg<R: RegisterLongName>(&self, offset: usize, value: FieldValue<u16, R>) {
        self.write16(offset, value.value);
    }

    /// Update the fields in `value` and keep every other bit.
    fn modify<R: RegisterLongName>(&self, offset: usize, value: FieldValue<u16, R>) {
        let old = self.read16(offset);
        self.write16(offset, value.modify(old));
    }

    fn set_bits(&self, offset: usize, bits: u16) {
        let old = self.read16(offset);
        self.write16(offset, old | bits);
    }

    fn clear_bits(&self, offset: usize, bits: u16) {
        let old = self.read16(offset);
        self.write16(offset, old & !bits);
    }

    /// Acknowledge `bits` in a write-zero-to-clear status register.
    fn clear_status(&self, offset: usize, bits: u16) {
        self.write16(offset, !bits);
    }
}

impl<T: UsbRegisters + ?Sized> UsbRegisters for &T {
    fn read8(&self, offset: usize) -> u8 {
        (**self).read8(offset)
    }
    fn write8(&self, offset: usize, val: u8) {
        (**self).write8(offset, val)
    }
    fn read16(&self, offset: usize) -> u16 {
        (**self).read16(offset)
    }
    fn write16(&self, offset: usize, val: u16) {
        (**self).write16(offset, val)
    }
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }
    fn write32(&self, offset: usize, val: u32) {
        (**self).write32(offset, val)
    }
    fn address(&self, offset: usize) -> usize {
        (**self).address(offset)
    }
}

/// The memory mapped register window of one controller instance.
#[repr(C)]
pub struct UsbRegisterWindow {
    bytes: [UnsafeCell<u8>; WINDOW_SIZE],
}

/// Volatile access to a memory mapped controller.
pub struct MmioUsbRegisters {
    base: StaticRef<UsbRegisterWindow>,
}

impl MmioUsbRegisters {
    pub const fn new(base: StaticRef<UsbRegisterWindow>) -> MmioUsbRegisters {
        MmioUsbRegisters { base }
    }

    fn ptr<T>(&self, offset: usize) -> *mut T {
        debug_assert!(offset + size_of::<T>() <= WINDOW_SIZE);
        UnsafeCell::raw_get(self.base.bytes.as_ptr())
            .wrapping_add(offset)
            .cast::<T>()
    }
}

impl UsbRegisters for MmioUsbRegisters {
    fn read8(&self, offset: usize) -> u8 {
        // SAFETY: `base` points at the controller's register window, which is
        // valid for the lifetime of the kernel.
        unsafe { ptr::read_volatile(self.ptr::<u8>(offset)) }
    }

    fn write8(&self, offset: usize, val: u8) {
        // SAFETY: see `read8`.
        unsafe { ptr::write_volatile(self.ptr::<u8>(offset), val) }
    }

    fn read16(&self, offset: usize) -> u16 {
        // SAFETY: see `read8`. Register offsets are 16-bit aligned.
        unsafe { ptr::read_volatile(self.ptr::<u16>(offset)) }
    }

    fn write16(&self, offset: usize, val: u16) {
        // SAFETY: see `read16`.
        unsafe { ptr::write_volatile(self.ptr::<u16>(offset), val) }
    }

    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: see `read8`. Only the 32-bit aligned FIFO ports are read
        // this way.
        unsafe { ptr::read_volatile(self.ptr::<u32>(offset)) }
    }

    fn write32(&self, offset: usize, val: u32) {
        // SAFETY: see `read32`.
        unsafe { ptr::write_volatile(self.ptr::<u32>(offset), val) }
    }

    fn address(&self, offset: usize) -> usize {
        self.ptr::<u8>(offset) as usize
    }
}
