// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! FIFO ports and CPU data movement through them.
//!
//! A FIFO port is the window through which the packet buffer of the pipe
//! selected in its `CURPIPE` field is read or written. `CFIFO` is only used by
//! the CPU; `D0FIFO` and `D1FIFO` can also raise DMA requests.

use crate::config::{AccessWidth, Endianness};
use crate::registers::{offset, UsbRegisters, FIFOCTR, FIFOSEL};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FifoPort {
    Cfifo,
    D0fifo,
    D1fifo,
}

impl FifoPort {
    pub const ALL: [FifoPort; 3] = [FifoPort::Cfifo, FifoPort::D0fifo, FifoPort::D1fifo];

    pub const fn index(self) -> usize {
        match self {
            FifoPort::Cfifo => 0,
            FifoPort::D0fifo => 1,
            FifoPort::D1fifo => 2,
        }
    }

    /// Index into `UsbConfig::dma_channels`.
    pub const fn dma_slot(self) -> Option<usize> {
        match self {
            FifoPort::Cfifo => None,
            FifoPort::D0fifo => Some(0),
            FifoPort::D1fifo => Some(1),
        }
    }

    pub const fn sel(self) -> usize {
        match self {
            FifoPort::Cfifo => offset::CFIFOSEL,
            FifoPort::D0fifo => offset::D0FIFOSEL,
            FifoPort::D1fifo => offset::D1FIFOSEL,
        }
    }

    pub const fn ctr(self) -> usize {
        match self {
            FifoPort::Cfifo => offset::CFIFOCTR,
            FifoPort::D0fifo => offset::D0FIFOCTR,
            FifoPort::D1fifo => offset::D1FIFOCTR,
        }
    }

    pub const fn data(self) -> usize {
        match self {
            FifoPort::Cfifo => offset::CFIFO,
            FifoPort::D0fifo => offset::D0FIFO,
            FifoPort::D1fifo => offset::D1FIFO,
        }
    }
}

pub(crate) fn set_access_width<R: UsbRegisters>(regs: &R, port: FifoPort, width: AccessWidth) {
    let mbw = match width {
        AccessWidth::Byte => FIFOSEL::MBW::Bits8,
        AccessWidth::HalfWord => FIFOSEL::MBW::Bits16,
        AccessWidth::Word => FIFOSEL::MBW::Bits32,
    };
    regs.modify(port.sel(), mbw);
}

/// Wait for the port to give access to the selected pipe's buffer. Returns
/// the `FIFOCTR` contents, or `None` after `spins` polls.
pub(crate) fn wait_ready<R: UsbRegisters>(
    regs: &R,
    port: FifoPort,
    spins: u32,
) -> Option<crate::registers::FifoCtrVal> {
    for _ in 0..spins.max(1) {
        let ctr = regs.read_reg::<FIFOCTR::Register>(port.ctr());
        if ctr.is_set(FIFOCTR::FRDY) {
            return Some(ctr);
        }
    }
    None
}

/// Write `data` to the buffer of the pipe selected on `port`.
///
/// Full words go out with `width` accesses. A tail shorter than a word is
/// written a byte at a time after switching the port to 8-bit accesses; the
/// port is switched back to `width` afterwards.
pub(crate) fn write_packet<R: UsbRegisters>(
    regs: &R,
    port: FifoPort,
    width: AccessWidth,
    endianness: Endianness,
    data: &[u8],
) {
    let step = width.bytes();
    let mut chunks = data.chunks_exact(step);
    for word in &mut chunks {
        match width {
            AccessWidth::Byte => regs.write8(port.data(), word[0]),
            AccessWidth::HalfWord => {
                let bytes = [word[0], word[1]];
                let val = match endianness {
                    Endianness::Little => u16::from_le_bytes(bytes),
                    Endianness::Big => u16::from_be_bytes(bytes),
                };
                regs.write16(port.data(), val);
            }
            AccessWidth::Word => {
                let bytes = [word[0], word[1], word[2], word[3]];
                let val = match endianness {
                    Endianness::Little => u32::from_le_bytes(bytes),
                    Endianness::Big => u32::from_be_bytes(bytes),
                };
                regs.write32(port.data(), val);
            }
        }
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        set_access_width(regs, port, AccessWidth::Byte);
        for b in tail {
            regs.write8(port.data(), *b);
        }
        set_access_width(regs, port, width);
    }
}

/// Read `data.len()` bytes from the buffer of the pipe selected on `port`.
///
/// A partial final word is read with a full `width` access and only the
/// valid bytes are kept.
pub(crate) fn read_packet<R: UsbRegisters>(
    regs: &R,
    port: FifoPort,
    width: AccessWidth,
    endianness: Endianness,
    data: &mut [u8],
) {
    for chunk in data.chunks_mut(width.bytes()) {
        match width {
            AccessWidth::Byte => chunk[0] = regs.read8(port.data()),
            AccessWidth::HalfWord => {
                let val = regs.read16(port.data());
                let bytes = match endianness {
                    Endianness::Little => val.to_le_bytes(),
                    Endianness::Big => val.to_be_bytes(),
                };
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
            AccessWidth::Word => {
                let val = regs.read32(port.data());
                let bytes = match endianness {
                    Endianness::Little => val.to_le_bytes(),
                    Endianness::Big => val.to_be_bytes(),
                };
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        }
    }
}

/// Send what was written so far as a (short or zero-length) packet.
pub(crate) fn commit<R: UsbRegisters>(regs: &R, port: FifoPort) {
    regs.write_reg(port.ctr(), FIFOCTR::BVAL::SET);
}

/// Drop the contents of the selected pipe's buffer.
pub(crate) fn clear<R: UsbRegisters>(regs: &R, port: FifoPort) {
    regs.write_reg(port.ctr(), FIFOCTR::BCLR::SET);
}

#[cfg(test)]
mod tests {
    use super::{read_packet, write_packet, FifoPort};
    use crate::config::{AccessWidth, Endianness};
    use crate::registers::{offset, UsbRegisters};
    use core::cell::RefCell;
    use std::vec::Vec;

    /// Records data port accesses as (size, value).
    struct Recorder {
        accesses: RefCell<Vec<(usize, u32)>>,
        reads: RefCell<Vec<u32>>,
        sel: core::cell::Cell<u16>,
    }

    impl Recorder {
        fn new() -> Recorder {
            Recorder {
                accesses: RefCell::new(Vec::new()),
                reads: RefCell::new(Vec::new()),
                sel: core::cell::Cell::new(0),
            }
        }
    }

    impl UsbRegisters for Recorder {
        fn read8(&self, _offset: usize) -> u8 {
            self.reads.borrow_mut().remove(0) as u8
        }
        fn write8(&self, _offset: usize, val: u8) {
            self.accesses.borrow_mut().push((1, val as u32));
        }
        fn read16(&self, off: usize) -> u16 {
            if off == offset::CFIFOSEL {
                return self.sel.get();
            }
            self.reads.borrow_mut().remove(0) as u16
        }
        fn write16(&self, off: usize, val: u16) {
            if off == offset::CFIFOSEL {
                self.sel.set(val);
                return;
            }
            self.accesses.borrow_mut().push((2, val as u32));
        }
        fn read32(&self, _offset: usize) -> u32 {
            self.reads.borrow_mut().remove(0)
        }
        fn write32(&self, _offset: usize, val: u32) {
            self.accesses.borrow_mut().push((4, val));
        }
        fn address(&self, offset: usize) -> usize {
            offset
        }
    }

    #[test]
    fn odd_tail_uses_byte_access() {
        let regs = Recorder::new();
        write_packet(
            &regs,
            FifoPort::Cfifo,
            AccessWidth::HalfWord,
            Endianness::Little,
            &[1, 2, 3, 4, 5],
        );
        assert_eq!(
            &regs.accesses.borrow()[..],
            &[(2, 0x0201), (2, 0x0403), (1, 5)]
        );
        // MBW is restored to 16 bits.
        assert_eq!((regs.sel.get() >> 10) & 0x3, 1);
    }

    #[test]
    fn word_packing_big_endian() {
        let regs = Recorder::new();
        write_packet(
            &regs,
            FifoPort::Cfifo,
            AccessWidth::Word,
            Endianness::Big,
            &[1, 2, 3, 4, 5, 6],
        );
        assert_eq!(
            &regs.accesses.borrow()[..],
            &[(4, 0x01020304), (1, 5), (1, 6)]
        );
    }

    #[test]
    fn partial_word_read_keeps_valid_bytes() {
        let regs = Recorder::new();
        regs.reads.borrow_mut().extend_from_slice(&[0x0201, 0xAA03]);
        let mut buf = [0u8; 3];
        read_packet(
            &regs,
            FifoPort::Cfifo,
            AccessWidth::HalfWord,
            Endianness::Little,
            &mut buf,
        );
        assert_eq!(buf, [1, 2, 3]);
    }
}
