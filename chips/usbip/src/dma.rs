// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Block transfers through `D0FIFO` (writes) and `D1FIFO` (reads).
//!
//! The block engine, a DMA controller or a data transfer controller, moves
//! whole max-packet-size blocks between memory and a FIFO port, one element
//! of the selected width per request. The part of a transfer that is not a
//! whole number of blocks (and a short packet that ends a read early) is
//! handed back to the CPU path, which also sends any trailing zero-length
//! packet. Only bulk pipes use the engine.

use kernel::debug;
use kernel::hil::time::Alarm;
use kernel::hil::usb::{TransferStatus, TransferType};
use kernel::ErrorCode;

use crate::config::AccessWidth;
use crate::fifo::FifoPort;
use crate::pipe::{Pid, PipeState, TransferDir};
use crate::registers::{offset, UsbRegisters, FIFOCTR, FIFOSEL, PIPECTR};
use crate::usb::Usb;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockDirection {
    MemoryToFifo,
    FifoToMemory,
}

/// One block transfer request for the engine.
#[derive(Copy, Clone, Debug)]
pub struct BlockDescriptor {
    pub direction: BlockDirection,
    /// First byte in memory.
    pub memory: *mut u8,
    /// Bus address of the FIFO data port.
    pub fifo: usize,
    pub width: AccessWidth,
    /// Bytes per block; one block is requested per buffer-ready event.
    pub block_size: usize,
    pub block_count: usize,
}

impl BlockDescriptor {
    /// Number of elements the engine moves in total.
    pub fn elements(&self) -> usize {
        self.block_size * self.block_count / self.width.bytes()
    }
}

/// A DMA or DTC channel driver.
pub trait BlockTransferEngine {
    /// Program `channel` and enable it. The transfer runs as the FIFO port
    /// raises requests.
    fn start(&self, channel: u8, descriptor: BlockDescriptor) -> Result<(), ErrorCode>;

    /// Disable `channel`. Stopping an idle channel does nothing.
    fn stop(&self, channel: u8);

    /// Elements `channel` has not moved yet.
    fn remaining(&self, channel: u8) -> usize;
}

/// A running block transfer, recorded on the port it uses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DmaBinding {
    pub pipe: usize,
    pub channel: u8,
    pub width: AccessWidth,
    pub block_size: usize,
    pub block_count: usize,
}

/// Pick the widest of `candidates` that divides `bytes`.
pub fn select_width(candidates: &[AccessWidth], bytes: usize) -> AccessWidth {
    candidates
        .iter()
        .copied()
        .find(|w| bytes % w.bytes() == 0)
        .unwrap_or(AccessWidth::Byte)
}

impl<'a, R: UsbRegisters, A: Alarm<'a>> Usb<'a, R, A> {
    /// Hand the whole-block part of the transfer on `pipe` to the engine.
    /// Returns `false` if the transfer has to take the CPU path.
    pub(crate) fn try_start_block(&self, pipe: usize) -> bool {
        if !self.config.strategy.uses_block_engine() {
            return false;
        }
        let engine = match self.dma.get() {
            Some(engine) => engine,
            None => return false,
        };
        let p = &self.pipes[pipe];
        if pipe == 0 || p.transfer_type() != TransferType::Bulk {
            return false;
        }
        let (port, direction) = match p.dir.get() {
            TransferDir::Write => (FifoPort::D0fifo, BlockDirection::MemoryToFifo),
            TransferDir::Read => (FifoPort::D1fifo, BlockDirection::FifoToMemory),
        };
        let channel = match port.dma_slot().and_then(|slot| self.config.dma_channels[slot]) {
            Some(channel) => channel,
            None => return false,
        };
        if self.ports[port.index()].dma.is_some() {
            return false;
        }
        let block_size = p.max_packet_size();
        let block_count = p.remaining() / block_size;
        if block_count == 0 {
            return false;
        }

        let width = select_width(self.config.block_widths(), block_size);
        if let Err(e) = self.acquire_port(pipe, port, width) {
            debug!("usbip: pipe {} {:?} unavailable ({:?}), using CPU", pipe, port, e);
            return false;
        }
        let memory = match p.buffer.map(|buf| buf.as_mut_ptr()) {
            Some(memory) => memory,
            None => return false,
        };
        let descriptor = BlockDescriptor {
            direction,
            memory: memory.wrapping_add(p.position.get()),
            fifo: self.registers.address(port.data()),
            width,
            block_size,
            block_count,
        };

        self.clear_pipe_status(pipe, true, true, true);
        // Buffer-ready stays enabled on reads to catch a short packet.
        self.pipe_interrupts(pipe, direction == BlockDirection::FifoToMemory, true, false);
        if let Err(e) = engine.start(channel, descriptor) {
            debug!("usbip: channel {} refused ({:?}), using CPU", channel, e);
            return false;
        }
        self.ports[port.index()].dma.set(DmaBinding {
            pipe,
            channel,
            width,
            block_size,
            block_count,
        });
        self.registers.modify(port.sel(), FIFOSEL::DREQE::SET);
        p.port.set(port);
        p.state.set(PipeState::DmaActive);
        self.set_pid(pipe, Pid::Buf);
        usb_debug!(
            self,
            "usbip: pipe {} {} x {} on channel {} ({:?})",
            pipe,
            block_count,
            block_size,
            channel,
            width
        );
        true
    }

    /// Stop the block transfer on `port` and return how many bytes it moved.
    pub(crate) fn stop_block(&self, port: FifoPort) -> Option<(DmaBinding, usize)> {
        let binding = self.ports[port.index()].dma.take()?;
        let units = binding.block_size * binding.block_count / binding.width.bytes();
        let left = self
            .dma
            .map_or(0, |engine| engine.remaining(binding.channel))
            .min(units);
        self.dma.map(|engine| engine.stop(binding.channel));
        self.registers.modify(port.sel(), FIFOSEL::DREQE::CLEAR);
        Some((binding, (units - left) * binding.width.bytes()))
    }

    /// Buffer-ready event on a pipe whose read the engine serves.
    ///
    /// The engine only moves whole blocks. A packet shorter than a block that
    /// waits at a block boundary ends the block transfer, and the CPU path
    /// reads it.
    pub(crate) fn block_read_ready(&self, pipe: usize) {
        let port = FifoPort::D1fifo;
        let binding = match self.ports[port.index()].dma.get() {
            Some(binding) if binding.pipe == pipe => binding,
            _ => return,
        };
        let ctr = self.registers.read_reg::<FIFOCTR::Register>(port.ctr());
        if !ctr.is_set(FIFOCTR::FRDY) || usize::from(ctr.read(FIFOCTR::DTLN)) >= binding.block_size
        {
            return;
        }
        let per_block = binding.block_size / binding.width.bytes();
        let left = self.dma.map_or(0, |engine| engine.remaining(binding.channel));
        if left % per_block != 0 {
            return;
        }
        let moved = match self.stop_block(port) {
            Some((_, moved)) => moved,
            None => return,
        };
        let p = &self.pipes[pipe];
        p.position.set(p.position.get() + moved);
        usb_debug!(
            self,
            "usbip: pipe {} short packet after {} block bytes",
            pipe,
            moved
        );
        self.continue_cpu(pipe);
    }

    /// Completion interrupt of the channel serving `port`.
    pub fn handle_dma_interrupt(&self, port: FifoPort) {
        let (binding, moved) = match self.stop_block(port) {
            Some(stopped) => stopped,
            None => return,
        };
        let pipe = binding.pipe;
        let p = &self.pipes[pipe];
        if p.buffer.is_none() {
            return;
        }
        p.position.set(p.position.get() + moved);
        usb_debug!(self, "usbip: pipe {} block transfer moved {}", pipe, moved);

        match p.dir.get() {
            TransferDir::Write => {
                if p.remaining() > 0 {
                    self.continue_cpu(pipe);
                } else if self.zlp_eligible(pipe) {
                    p.zlp_pending.set(true);
                    self.continue_cpu(pipe);
                } else {
                    self.drain_or_finish(pipe);
                }
            }
            TransferDir::Read => {
                if p.remaining() == 0 {
                    self.finish(pipe, TransferStatus::Complete);
                } else {
                    self.continue_cpu(pipe);
                }
            }
        }
    }

    /// The engine wrote the last packet; it may already have been sent.
    fn drain_or_finish(&self, pipe: usize) {
        self.begin_drain(pipe);
        self.set_pid(pipe, Pid::Buf);
        let ctr = self
            .registers
            .read_reg::<PIPECTR::Register>(offset::pipe_ctr(pipe));
        if ctr.is_set(PIPECTR::BSTS) {
            self.finish(pipe, TransferStatus::Complete);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{select_width, BlockDescriptor, BlockDirection};
    use crate::config::{AccessWidth, Instance, TransferStrategy, UsbConfig};

    #[test]
    fn chosen_width_is_widest_allowed_divisor() {
        for (instance, preset) in [
            (Instance::Usb0, UsbConfig::usb0()),
            (Instance::UsbHs, UsbConfig::usbhs()),
        ] {
            for strategy in [TransferStrategy::DtcAssisted, TransferStrategy::DmaAssisted] {
                let mut config = preset;
                config.strategy = strategy;
                let allowed = config.block_widths();
                for len in 1..=1024 {
                    let width = select_width(allowed, len);
                    let case = (instance, strategy, len);
                    assert_eq!(len % width.bytes(), 0, "{:?}", case);
                    assert!(instance.dma_widths().contains(&width), "{:?}", case);
                    assert!(allowed.contains(&width), "{:?}", case);
                    if strategy == TransferStrategy::DtcAssisted {
                        assert!(width <= instance.fifo_width(), "{:?}", case);
                    }
                    assert!(
                        allowed
                            .iter()
                            .filter(|w| **w > width)
                            .all(|w| len % w.bytes() != 0),
                        "{:?}",
                        case
                    );
                }
            }
        }
    }

    #[test]
    fn descriptor_elements() {
        let d = BlockDescriptor {
            direction: BlockDirection::FifoToMemory,
            memory: core::ptr::null_mut(),
            fifo: 0,
            width: AccessWidth::HalfWord,
            block_size: 64,
            block_count: 3,
        };
        assert_eq!(d.elements(), 96);
    }
}
