// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Pipe configuration and FIFO port arbitration.
//!
//! The hardware lets a FIFO port serve one pipe at a time, and a pipe may be
//! selected on one port only. Moving a port to another pipe means writing
//! `CURPIPE = 0`, polling until the hardware reports the port released, then
//! writing the new pipe and polling until it is reported bound. Both polls are
//! bounded by `UsbConfig::port_clear_spins`. `acquire_port` is the only place
//! that changes a port's owner, and it does so with the pipe's interrupt
//! sources masked.

use core::cell::Cell;

use kernel::debug;
use kernel::hil::time::Alarm;
use kernel::hil::usb::{Direction, PipeConfig, TransferClient, TransferType};
use kernel::utilities::cells::{OptionalCell, TakeCell};
use kernel::utilities::registers::FieldValue;
use kernel::ErrorCode;

use crate::config::{AccessWidth, Endianness, PipeKind};
use crate::dma::DmaBinding;
use crate::fifo::FifoPort;
use crate::registers::{
    offset, UsbRegisters, DCPCFG, FIFOSEL, MAXP, PIPECFG, PIPECTR, PIPEPERI, PIPETRE,
};
use crate::usb::{Mode, Usb};

/// Lifecycle of a pipe.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PipeState {
    /// Not configured.
    Free,
    /// Configured, no transfer outstanding.
    Idle,
    /// A transfer waits for buffer-ready events on the CPU path.
    Armed,
    /// A NAK response was seen; the pipe is re-armed when the retry delay
    /// expires.
    RetryPending,
    /// All data of a write is in the packet buffer; waiting for it to drain.
    Draining,
    /// The block transfer engine moves the data.
    DmaActive,
    /// A FIFO port could not be released. The pipe must be reconfigured.
    Wedged,
}

/// Handshake setting of a pipe.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Pid {
    Nak,
    Buf,
    Stall,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum TransferDir {
    Read,
    Write,
}

/// Per-pipe bookkeeping. Indexed by pipe number in `Usb::pipes`.
pub(crate) struct Pipe<'a> {
    pub(crate) config: OptionalCell<PipeConfig>,
    pub(crate) client: OptionalCell<&'a dyn TransferClient>,
    pub(crate) state: Cell<PipeState>,
    /// State to return to when a pending retry fires.
    pub(crate) resume: Cell<PipeState>,
    pub(crate) dir: Cell<TransferDir>,
    pub(crate) buffer: TakeCell<'static, [u8]>,
    pub(crate) length: Cell<usize>,
    pub(crate) position: Cell<usize>,
    /// Consecutive NAK responses.
    pub(crate) ignore_count: Cell<u8>,
    pub(crate) zlp_pending: Cell<bool>,
    pub(crate) port: Cell<FifoPort>,
    pub(crate) retry_at: Cell<u32>,
}

impl Pipe<'_> {
    pub(crate) fn new() -> Self {
        Pipe {
            config: OptionalCell::empty(),
            client: OptionalCell::empty(),
            state: Cell::new(PipeState::Free),
            resume: Cell::new(PipeState::Armed),
            dir: Cell::new(TransferDir::Read),
            buffer: TakeCell::empty(),
            length: Cell::new(0),
            position: Cell::new(0),
            ignore_count: Cell::new(0),
            zlp_pending: Cell::new(false),
            port: Cell::new(FifoPort::Cfifo),
            retry_at: Cell::new(0),
        }
    }

    pub(crate) fn is_busy(&self) -> bool {
        matches!(
            self.state.get(),
            PipeState::Armed | PipeState::RetryPending | PipeState::Draining | PipeState::DmaActive
        )
    }

    pub(crate) fn max_packet_size(&self) -> usize {
        self.config.map_or(64, |c| usize::from(c.max_packet_size))
    }

    pub(crate) fn transfer_type(&self) -> TransferType {
        self.config
            .map_or(TransferType::Control, |c| c.transfer_type)
    }

    pub(crate) fn remaining(&self) -> usize {
        self.length.get().saturating_sub(self.position.get())
    }
}

/// Software view of a FIFO port.
pub(crate) struct PortBinding {
    pub(crate) owner: OptionalCell<usize>,
    pub(crate) dma: OptionalCell<DmaBinding>,
}

impl PortBinding {
    pub(crate) const fn new() -> PortBinding {
        PortBinding {
            owner: OptionalCell::empty(),
            dma: OptionalCell::empty(),
        }
    }
}

const fn pipe_bit(pipe: usize) -> u16 {
    1 << pipe
}

impl<'a, R: UsbRegisters, A: Alarm<'a>> Usb<'a, R, A> {
    /// Whether `config` makes the controller the sender of data on the pipe.
    pub(crate) fn is_transmit(&self, config: &PipeConfig) -> bool {
        match self.mode.get() {
            Mode::Device => config.direction == Direction::In,
            _ => config.direction == Direction::Out,
        }
    }

    pub fn configure_pipe(
        &self,
        pipe: usize,
        config: PipeConfig,
        client: &'a dyn TransferClient,
    ) -> Result<(), ErrorCode> {
        let kind = PipeKind::of(pipe).ok_or(ErrorCode::INVAL)?;
        let p = &self.pipes[pipe];
        if self.mode.get() == Mode::Off {
            return Err(ErrorCode::OFF);
        }
        if p.is_busy() {
            return Err(ErrorCode::BUSY);
        }
        if !kind.supports(config.transfer_type)
            || config.max_packet_size == 0
            || config.max_packet_size > self.config.instance.max_packet_limit(config.transfer_type)
            || config.endpoint > 15
        {
            return Err(ErrorCode::INVAL);
        }
        let devsel = match (self.mode.get(), config.device_address) {
            (Mode::Host, Some(address)) if address <= 10 => u16::from(address),
            (Mode::Host, _) => return Err(ErrorCode::INVAL),
            _ => 0,
        };

        let regs = &self.registers;
        if pipe == 0 {
            regs.write_reg(
                offset::DCPMAXP,
                MAXP::MXPS.val(config.max_packet_size) + MAXP::DEVSEL.val(devsel),
            );
        } else {
            let pipe_type = match config.transfer_type {
                TransferType::Bulk => PIPECFG::TYPE::Bulk,
                TransferType::Interrupt => PIPECFG::TYPE::Interrupt,
                TransferType::Isochronous => PIPECFG::TYPE::Isochronous,
                TransferType::Control => PIPECFG::TYPE::Unused,
            };
            let transmit = self.is_transmit(&config);
            // Receiving bulk pipes stop once the transaction counter runs out.
            let shtnak = if !transmit && config.transfer_type == TransferType::Bulk {
                PIPECFG::SHTNAK::SET
            } else {
                PIPECFG::SHTNAK::CLEAR
            };
            let cfg = pipe_type
                + PIPECFG::EPNUM.val(u16::from(config.endpoint))
                + PIPECFG::DIR.val(u16::from(transmit))
                + shtnak;
            self.set_pid(pipe, Pid::Nak);
            regs.write16(offset::PIPESEL, pipe as u16);
            regs.write_reg(offset::PIPECFG, cfg);
            regs.write_reg(
                offset::PIPEMAXP,
                MAXP::MXPS.val(config.max_packet_size) + MAXP::DEVSEL.val(devsel),
            );
            regs.write_reg(
                offset::PIPEPERI,
                PIPEPERI::IITV.val(u16::from(config.interval.min(7))),
            );
            regs.write16(offset::PIPESEL, 0);
            self.flush_pipe_buffer(pipe);
            regs.modify(offset::pipe_ctr(pipe), PIPECTR::SQCLR::SET);
        }

        p.config.set(config);
        p.client.set(client);
        p.ignore_count.set(0);
        p.state.set(PipeState::Idle);
        usb_debug!(self, "usbip: pipe {} configured {:?}", pipe, config);
        Ok(())
    }

    /// Disable `pipe` and mark it free. An outstanding transfer ends with
    /// `Stopped`. Pipe 0 stays configured. A pipe whose FIFO port cannot be
    /// released is left `Wedged`.
    pub fn release_pipe(&self, pipe: usize) {
        let p = match self.pipes.get(pipe) {
            Some(p) => p,
            None => return,
        };
        if p.state.get() == PipeState::Free {
            return;
        }
        if p.is_busy() {
            self.stop(pipe);
        }
        self.pipe_interrupts(pipe, false, false, false);
        self.clear_transaction_counter(pipe);
        if pipe == 0 {
            return;
        }
        for port in FifoPort::ALL {
            if self.ports[port.index()].owner.get() == Some(pipe) {
                if let Err(e) = self.clear_port(port) {
                    debug!("usbip: pipe {} still holds {:?} ({:?})", pipe, port, e);
                    p.state.set(PipeState::Wedged);
                    return;
                }
            }
        }
        self.set_pid(pipe, Pid::Nak);
        self.registers.write16(offset::PIPESEL, pipe as u16);
        self.registers.write_reg(offset::PIPECFG, PIPECFG::TYPE::Unused);
        self.registers.write16(offset::PIPESEL, 0);
        p.config.clear();
        p.client.clear();
        p.state.set(PipeState::Free);
    }

    pub fn pipe_state(&self, pipe: usize) -> Option<PipeState> {
        self.pipes.get(pipe).map(|p| p.state.get())
    }

    /// The pipe currently bound to `port`, if any.
    pub fn port_owner(&self, port: FifoPort) -> Option<usize> {
        self.ports[port.index()].owner.get()
    }

    /// Bind `port` to `pipe` with `width` wide data accesses.
    pub(crate) fn acquire_port(
        &self,
        pipe: usize,
        port: FifoPort,
        width: AccessWidth,
    ) -> Result<(), ErrorCode> {
        let isel = pipe == 0 && self.dcp_transmit.get();
        let wanted = self.fifosel_value(pipe, width, isel);
        if self.ports[port.index()].owner.get() == Some(pipe)
            && self.registers.read16(port.sel()) & wanted_mask() == wanted.value
        {
            return Ok(());
        }

        let saved = self.mask_pipe_interrupts(pipe);
        let result = self.bind_port(pipe, port, wanted);
        self.restore_pipe_interrupts(pipe, saved);
        result
    }

    fn fifosel_value(
        &self,
        pipe: usize,
        width: AccessWidth,
        isel: bool,
    ) -> FieldValue<u16, FIFOSEL::Register> {
        let mbw = match width {
            AccessWidth::Byte => FIFOSEL::MBW::Bits8,
            AccessWidth::HalfWord => FIFOSEL::MBW::Bits16,
            AccessWidth::Word => FIFOSEL::MBW::Bits32,
        };
        let bigend = match self.config.endianness {
            Endianness::Little => FIFOSEL::BIGEND::CLEAR,
            Endianness::Big => FIFOSEL::BIGEND::SET,
        };
        FIFOSEL::CURPIPE.val(pipe as u16) + mbw + bigend + FIFOSEL::ISEL.val(u16::from(isel))
    }

    fn bind_port(
        &self,
        pipe: usize,
        port: FifoPort,
        wanted: FieldValue<u16, FIFOSEL::Register>,
    ) -> Result<(), ErrorCode> {
        for other in FifoPort::ALL {
            if other != port && self.ports[other.index()].owner.get() == Some(pipe) {
                self.clear_port(other)?;
            }
        }
        self.clear_port(port)?;

        self.registers.write_reg(port.sel(), wanted);
        if !self.poll_curpipe(port, pipe) {
            debug!("usbip: {:?} did not bind pipe {}", port, pipe);
            return Err(ErrorCode::FAIL);
        }
        self.ports[port.index()].owner.set(pipe);
        Ok(())
    }

    /// Release `port` from whatever pipe it serves.
    pub(crate) fn clear_port(&self, port: FifoPort) -> Result<(), ErrorCode> {
        self.registers.write_reg(port.sel(), FIFOSEL::CURPIPE.val(0));
        if !self.poll_curpipe(port, 0) {
            debug!("usbip: {:?} did not release its pipe", port);
            return Err(ErrorCode::FAIL);
        }
        self.ports[port.index()].owner.clear();
        Ok(())
    }

    fn poll_curpipe(&self, port: FifoPort, pipe: usize) -> bool {
        for _ in 0..self.config.port_clear_spins.max(1) {
            let sel = self.registers.read_reg::<FIFOSEL::Register>(port.sel());
            if usize::from(sel.read(FIFOSEL::CURPIPE)) == pipe {
                return true;
            }
        }
        false
    }

    fn mask_pipe_interrupts(&self, pipe: usize) -> u16 {
        let bit = pipe_bit(pipe);
        let regs = &self.registers;
        let mut saved = 0;
        for (i, reg) in [offset::BRDYENB, offset::NRDYENB, offset::BEMPENB]
            .iter()
            .enumerate()
        {
            if regs.read16(*reg) & bit != 0 {
                saved |= 1 << i;
                regs.clear_bits(*reg, bit);
            }
        }
        saved
    }

    fn restore_pipe_interrupts(&self, pipe: usize, saved: u16) {
        let bit = pipe_bit(pipe);
        for (i, reg) in [offset::BRDYENB, offset::NRDYENB, offset::BEMPENB]
            .iter()
            .enumerate()
        {
            if saved & (1 << i) != 0 {
                self.registers.set_bits(*reg, bit);
            }
        }
    }

    /// Enable or disable the buffer-ready, not-ready and buffer-empty
    /// interrupt sources of `pipe`.
    pub(crate) fn pipe_interrupts(&self, pipe: usize, brdy: bool, nrdy: bool, bemp: bool) {
        let bit = pipe_bit(pipe);
        for (reg, on) in [
            (offset::BRDYENB, brdy),
            (offset::NRDYENB, nrdy),
            (offset::BEMPENB, bemp),
        ] {
            if on {
                self.registers.set_bits(reg, bit);
            } else {
                self.registers.clear_bits(reg, bit);
            }
        }
    }

    pub(crate) fn clear_pipe_status(&self, pipe: usize, brdy: bool, nrdy: bool, bemp: bool) {
        let bit = pipe_bit(pipe);
        for (reg, on) in [
            (offset::BRDYSTS, brdy),
            (offset::NRDYSTS, nrdy),
            (offset::BEMPSTS, bemp),
        ] {
            if on {
                self.registers.clear_status(reg, bit);
            }
        }
    }

    /// Program the transaction counter so the pipe stops after `packets`.
    pub(crate) fn set_transaction_counter(&self, pipe: usize, packets: usize) {
        if !PipeKind::of(pipe).is_some_and(PipeKind::has_transaction_counter) {
            return;
        }
        let regs = &self.registers;
        regs.write_reg(offset::pipe_tre(pipe), PIPETRE::TRCLR::SET);
        if packets > 0 {
            regs.write16(offset::pipe_trn(pipe), packets.min(usize::from(u16::MAX)) as u16);
            regs.write_reg(offset::pipe_tre(pipe), PIPETRE::TRENB::SET);
        }
    }

    pub(crate) fn clear_transaction_counter(&self, pipe: usize) {
        if !PipeKind::of(pipe).is_some_and(PipeKind::has_transaction_counter) {
            return;
        }
        self.registers
            .write_reg(offset::pipe_tre(pipe), PIPETRE::TRCLR::SET);
    }

    /// Drop whatever is in the pipe's packet buffer. The pipe must be NAKing.
    pub(crate) fn flush_pipe_buffer(&self, pipe: usize) {
        if pipe == 0 {
            return;
        }
        let ctr = offset::pipe_ctr(pipe);
        self.registers.modify(ctr, PIPECTR::ACLRM::SET);
        self.registers.modify(ctr, PIPECTR::ACLRM::CLEAR);
    }

    pub fn pipe_pid(&self, pipe: usize) -> Option<Pid> {
        if pipe >= self.pipes.len() {
            return None;
        }
        let ctr = self
            .registers
            .read_reg::<PIPECTR::Register>(offset::pipe_ctr(pipe));
        Some(match ctr.read(PIPECTR::PID) {
            0 => Pid::Nak,
            1 => Pid::Buf,
            _ => Pid::Stall,
        })
    }

    /// Current data toggle of `pipe`; `true` is DATA1.
    pub fn pipe_toggle(&self, pipe: usize) -> Option<bool> {
        if pipe >= self.pipes.len() {
            return None;
        }
        let ctr = self
            .registers
            .read_reg::<PIPECTR::Register>(offset::pipe_ctr(pipe));
        Some(ctr.is_set(PIPECTR::SQMON))
    }

    /// Change the handshake of `pipe`. Leaving STALL steps through the
    /// intermediate stall encoding, as the hardware requires.
    pub(crate) fn set_pid(&self, pipe: usize, pid: Pid) {
        let ctr = offset::pipe_ctr(pipe);
        let current = self
            .registers
            .read_reg::<PIPECTR::Register>(ctr)
            .read(PIPECTR::PID);
        match pid {
            Pid::Nak | Pid::Buf => {
                if current == 3 {
                    self.registers.modify(ctr, PIPECTR::PID::STALL);
                }
                if current >= 2 {
                    self.registers.modify(ctr, PIPECTR::PID::NAK);
                }
                if pid == Pid::Buf {
                    self.registers.modify(ctr, PIPECTR::PID::BUF);
                } else if current == 1 {
                    self.registers.modify(ctr, PIPECTR::PID::NAK);
                }
            }
            Pid::Stall => {
                if current < 2 {
                    self.registers.modify(ctr, PIPECTR::PID::STALL);
                }
            }
        }
    }

    /// Select the direction of the default control pipe's buffer.
    pub(crate) fn set_dcp_direction(&self, transmit: bool) {
        self.dcp_transmit.set(transmit);
        self.registers
            .modify(offset::DCPCFG, DCPCFG::DIR.val(u16::from(transmit)));
    }
}

/// Bits of `FIFOSEL` that `acquire_port` programs.
fn wanted_mask() -> u16 {
    (FIFOSEL::CURPIPE.val(0xF)
        + FIFOSEL::MBW.val(0x3)
        + FIFOSEL::BIGEND::SET
        + FIFOSEL::ISEL::SET)
        .value
}
