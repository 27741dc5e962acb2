// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Build-time selection of the controller instance and transfer strategy.
//!
//! A board picks one of the presets and adjusts fields before handing the
//! configuration to `Usb::new`. The driver never changes it afterwards.

use kernel::hil::usb::TransferType;
use kernel::utilities::StaticRef;

use crate::registers::UsbRegisterWindow;

pub const USB0_BASE: StaticRef<UsbRegisterWindow> =
    unsafe { StaticRef::new(0x4009_0000 as *const UsbRegisterWindow) };
pub const USBHS_BASE: StaticRef<UsbRegisterWindow> =
    unsafe { StaticRef::new(0x4006_0000 as *const UsbRegisterWindow) };

/// Number of pipes, including the default control pipe.
pub const MAX_PIPES: usize = 10;

/// Width of a FIFO port access or a DMA element.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessWidth {
    Byte,
    HalfWord,
    Word,
}

impl AccessWidth {
    pub const fn bytes(self) -> usize {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::HalfWord => 2,
            AccessWidth::Word => 4,
        }
    }
}

/// Which group of pipes a pipe number belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PipeKind {
    /// Pipe 0, the default control pipe.
    Control,
    /// Pipes 1-2.
    IsochronousOrBulk,
    /// Pipes 3-5.
    Bulk,
    /// Pipes 6-9.
    Interrupt,
}

impl PipeKind {
    pub fn of(pipe: usize) -> Option<PipeKind> {
        match pipe {
            0 => Some(PipeKind::Control),
            1..=2 => Some(PipeKind::IsochronousOrBulk),
            3..=5 => Some(PipeKind::Bulk),
            6..=9 => Some(PipeKind::Interrupt),
            _ => None,
        }
    }

    pub fn supports(self, transfer_type: TransferType) -> bool {
        match (self, transfer_type) {
            (PipeKind::Control, TransferType::Control) => true,
            (PipeKind::IsochronousOrBulk, TransferType::Isochronous) => true,
            (PipeKind::IsochronousOrBulk, TransferType::Bulk) => true,
            (PipeKind::Bulk, TransferType::Bulk) => true,
            (PipeKind::Interrupt, TransferType::Interrupt) => true,
            _ => false,
        }
    }

    /// Pipes 1-5 have a transaction counter (`PIPEnTRE`/`PIPEnTRN`).
    pub fn has_transaction_counter(self) -> bool {
        matches!(self, PipeKind::IsochronousOrBulk | PipeKind::Bulk)
    }
}

/// The controller instances of the chip family.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Instance {
    /// Full-speed controller with a 16-bit FIFO bus.
    Usb0,
    /// High-speed controller with a 32-bit FIFO bus.
    UsbHs,
}

impl Instance {
    /// Access width used by the CPU for FIFO data.
    pub const fn fifo_width(self) -> AccessWidth {
        match self {
            Instance::Usb0 => AccessWidth::HalfWord,
            Instance::UsbHs => AccessWidth::Word,
        }
    }

    /// Element widths the DMA engine can use against this instance's FIFO
    /// ports, widest first.
    pub const fn dma_widths(self) -> &'static [AccessWidth] {
        match self {
            Instance::Usb0 => &[AccessWidth::HalfWord, AccessWidth::Byte],
            Instance::UsbHs => &[AccessWidth::Word, AccessWidth::HalfWord, AccessWidth::Byte],
        }
    }

    pub const fn high_speed(self) -> bool {
        matches!(self, Instance::UsbHs)
    }

    /// Largest max packet size a pipe of `transfer_type` may use.
    pub fn max_packet_limit(self, transfer_type: TransferType) -> u16 {
        match (transfer_type, self.high_speed()) {
            (TransferType::Control, _) => 64,
            (TransferType::Bulk, false) => 64,
            (TransferType::Bulk, true) => 512,
            (TransferType::Interrupt, false) => 64,
            (TransferType::Interrupt, true) => 1024,
            (TransferType::Isochronous, false) => 256,
            (TransferType::Isochronous, true) => 1024,
        }
    }
}

/// How FIFO data moves between memory and the controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferStrategy {
    /// All data goes through CPU accesses to `CFIFO`.
    CpuOnly,
    /// Bulk transfers of at least one packet use the data transfer controller
    /// on `D0FIFO`/`D1FIFO`. It moves one element per FIFO access cycle, so
    /// elements are never wider than the CPU FIFO width.
    DtcAssisted,
    /// Bulk transfers of at least one packet use the DMA controller, with
    /// the widest element width the instance supports for the transfer.
    DmaAssisted,
}

impl TransferStrategy {
    pub fn uses_block_engine(self) -> bool {
        !matches!(self, TransferStrategy::CpuOnly)
    }
}

/// Byte order of multi-byte FIFO accesses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// Link timing, in milliseconds unless noted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LinkTiming {
    /// Gap between the two line state samples of one debounce attempt.
    pub debounce_ms: u32,
    pub debounce_attempts: u32,
    /// How long bus reset is driven.
    pub reset_ms: u32,
    /// Interval between reads of the reset handshake status.
    pub reset_poll_ms: u32,
    pub reset_poll_attempts: u32,
    /// Wait after reset before the port is used.
    pub recovery_ms: u32,
    /// How long resume signalling is driven.
    pub resume_ms: u32,
    /// Wait after resume signalling ends.
    pub resume_settle_ms: u32,
    /// Wait after SOF output stops before the port counts as suspended.
    pub suspend_ms: u32,
}

impl LinkTiming {
    pub const fn default_timing() -> LinkTiming {
        LinkTiming {
            debounce_ms: 10,
            debounce_attempts: 10,
            reset_ms: 60,
            reset_poll_ms: 1,
            reset_poll_attempts: 30,
            recovery_ms: 10,
            resume_ms: 20,
            resume_settle_ms: 3,
            suspend_ms: 5,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UsbConfig {
    pub instance: Instance,
    pub strategy: TransferStrategy,
    pub endianness: Endianness,
    /// DMA channel serving `D0FIFO` and `D1FIFO`, if any.
    pub dma_channels: [Option<u8>; 2],
    /// Interrupt priority the board programs for the controller and DMA
    /// vectors.
    pub irq_priority: u8,
    /// Consecutive NAK responses tolerated before a transfer fails.
    pub retry_ceiling: u8,
    /// Wait before re-arming a pipe after a NAK response.
    pub retry_delay_ms: u32,
    /// Polls of `CURPIPE` before a FIFO port counts as wedged.
    pub port_clear_spins: u32,
    /// Polls of `FRDY` before a FIFO port counts as not ready.
    pub fifo_ready_spins: u32,
    pub timing: LinkTiming,
    /// Log every interrupt event with `debug!`.
    pub trace: bool,
}

impl UsbConfig {
    pub const fn usb0() -> UsbConfig {
        UsbConfig {
            instance: Instance::Usb0,
            strategy: TransferStrategy::CpuOnly,
            endianness: Endianness::Little,
            dma_channels: [None, None],
            irq_priority: 3,
            retry_ceiling: 3,
            retry_delay_ms: 5,
            port_clear_spins: 1024,
            fifo_ready_spins: 1024,
            timing: LinkTiming::default_timing(),
            trace: false,
        }
    }

    pub const fn usbhs() -> UsbConfig {
        UsbConfig {
            instance: Instance::UsbHs,
            strategy: TransferStrategy::DmaAssisted,
            endianness: Endianness::Little,
            dma_channels: [Some(0), Some(1)],
            irq_priority: 2,
            retry_ceiling: 3,
            retry_delay_ms: 5,
            port_clear_spins: 1024,
            fifo_ready_spins: 1024,
            timing: LinkTiming::default_timing(),
            trace: false,
        }
    }

    /// Candidate DMA element widths for this configuration, widest first.
    pub fn block_widths(&self) -> &'static [AccessWidth] {
        let widths = self.instance.dma_widths();
        match self.strategy {
            TransferStrategy::DtcAssisted => {
                let limit = self.instance.fifo_width();
                let start = widths.iter().position(|w| *w <= limit).unwrap_or(widths.len());
                &widths[start..]
            }
            _ => widths,
        }
    }
}
