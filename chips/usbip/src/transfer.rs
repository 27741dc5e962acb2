// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! CPU driven transfers.
//!
//! A transfer on the CPU path moves one packet per buffer-ready event through
//! `CFIFO`. Writes end when the last packet has drained from the pipe's
//! buffer (buffer-empty event); reads end when the requested length arrived
//! or a short packet ended the transfer early.
//!
//! ```text
//!  Idle --submit--> Armed --BRDY--> Armed ... --last packet--> Draining
//!                     |                                           |
//!                     +--NRDY--> RetryPending --alarm--> (resume)  +--BEMP--> Idle
//! ```
//!
//! Every path out of a busy state goes through `complete`, which returns the
//! buffer to the client exactly once.

use kernel::debug;
use kernel::hil::time::Alarm;
use kernel::hil::usb::{TransferStatus, TransferType};

use crate::fifo::{self, FifoPort};
use crate::pipe::{Pid, PipeState, TransferDir};
use crate::registers::{FIFOCTR, UsbRegisters};
use crate::usb::{Mode, Usb};

impl<'a, R: UsbRegisters, A: Alarm<'a>> Usb<'a, R, A> {
    /// Take ownership of `buffer` and start moving `length` bytes. The
    /// submission was validated by the caller.
    pub(crate) fn start_transfer(
        &self,
        pipe: usize,
        buffer: &'static mut [u8],
        length: usize,
        dir: TransferDir,
    ) {
        let p = &self.pipes[pipe];
        p.dir.set(dir);
        p.length.set(length);
        p.position.set(0);
        p.ignore_count.set(0);
        p.zlp_pending.set(dir == TransferDir::Write && length == 0);
        p.buffer.replace(buffer);
        usb_debug!(self, "usbip: pipe {} {:?} {} bytes", pipe, dir, length);

        if dir == TransferDir::Read {
            let packets = length.div_ceil(p.max_packet_size());
            self.set_transaction_counter(pipe, packets);
        }
        if self.try_start_block(pipe) {
            return;
        }
        self.arm_cpu(pipe);
    }

    pub(crate) fn arm_cpu(&self, pipe: usize) {
        let p = &self.pipes[pipe];
        p.port.set(FifoPort::Cfifo);
        p.state.set(PipeState::Armed);
        self.clear_pipe_status(pipe, true, true, true);
        self.pipe_interrupts(pipe, true, true, false);
        self.set_pid(pipe, Pid::Buf);
    }

    /// Return to the CPU path for the part of a transfer the block engine
    /// did not move.
    pub(crate) fn continue_cpu(&self, pipe: usize) {
        let p = &self.pipes[pipe];
        p.port.set(FifoPort::Cfifo);
        p.state.set(PipeState::Armed);
        self.clear_pipe_status(pipe, true, false, false);
        self.pipe_interrupts(pipe, true, true, false);
        self.set_pid(pipe, Pid::Buf);
        // A packet may already wait in the buffer; its event was consumed
        // while the engine owned the pipe.
        self.on_brdy(pipe);
    }

    /// Buffer-ready event for `pipe`.
    pub(crate) fn on_brdy(&self, pipe: usize) {
        let p = &self.pipes[pipe];
        match p.state.get() {
            PipeState::Armed => {}
            PipeState::DmaActive if p.dir.get() == TransferDir::Read => {
                self.block_read_ready(pipe);
                return;
            }
            _ => return,
        }
        if self
            .acquire_port(pipe, FifoPort::Cfifo, self.config.instance.fifo_width())
            .is_err()
        {
            self.wedge(pipe);
            return;
        }
        let ctr = match fifo::wait_ready(&self.registers, FifoPort::Cfifo, self.config.fifo_ready_spins)
        {
            Some(ctr) => ctr,
            None => {
                debug!("usbip: pipe {} ready event without FIFO access", pipe);
                return;
            }
        };
        p.ignore_count.set(0);
        match p.dir.get() {
            TransferDir::Read => self.read_packet(pipe, usize::from(ctr.read(FIFOCTR::DTLN))),
            TransferDir::Write => self.write_packet(pipe),
        }
    }

    fn read_packet(&self, pipe: usize, received: usize) {
        let p = &self.pipes[pipe];
        let position = p.position.get();
        let remaining = p.remaining();
        let width = self.config.instance.fifo_width();

        if received > remaining {
            p.buffer.map(|buf| {
                fifo::read_packet(
                    &self.registers,
                    FifoPort::Cfifo,
                    width,
                    self.config.endianness,
                    &mut buf[position..position + remaining],
                )
            });
            fifo::clear(&self.registers, FifoPort::Cfifo);
            p.position.set(position + remaining);
            debug!("usbip: pipe {} overrun, {} bytes dropped", pipe, received - remaining);
            self.terminate(pipe, TransferStatus::Overrun);
            return;
        }

        if received == 0 {
            fifo::clear(&self.registers, FifoPort::Cfifo);
        } else {
            p.buffer.map(|buf| {
                fifo::read_packet(
                    &self.registers,
                    FifoPort::Cfifo,
                    width,
                    self.config.endianness,
                    &mut buf[position..position + received],
                )
            });
        }
        p.position.set(position + received);

        if p.remaining() == 0 {
            self.finish(pipe, TransferStatus::Complete);
        } else if received < p.max_packet_size() {
            self.finish(pipe, TransferStatus::ShortPacket);
        }
    }

    fn write_packet(&self, pipe: usize) {
        let p = &self.pipes[pipe];
        let remaining = p.remaining();
        if remaining == 0 {
            if p.zlp_pending.get() {
                p.zlp_pending.set(false);
                self.begin_drain(pipe);
                fifo::commit(&self.registers, FifoPort::Cfifo);
            }
            return;
        }

        let mps = p.max_packet_size();
        let n = remaining.min(mps);
        if n == remaining {
            if n == mps && self.zlp_eligible(pipe) {
                p.zlp_pending.set(true);
            } else {
                self.begin_drain(pipe);
            }
        }
        let position = p.position.get();
        p.buffer.map(|buf| {
            fifo::write_packet(
                &self.registers,
                FifoPort::Cfifo,
                self.config.instance.fifo_width(),
                self.config.endianness,
                &buf[position..position + n],
            )
        });
        p.position.set(position + n);
        if n < mps {
            fifo::commit(&self.registers, FifoPort::Cfifo);
        }
    }

    /// Whether a write whose last packet is full must be followed by a
    /// zero-length packet to mark its end.
    pub(crate) fn zlp_eligible(&self, pipe: usize) -> bool {
        let p = &self.pipes[pipe];
        match p.transfer_type() {
            TransferType::Bulk => true,
            // The host knows the data stage is over once wLength bytes
            // arrived.
            TransferType::Control => {
                pipe == 0
                    && self.mode.get() == Mode::Device
                    && p.length.get() < usize::from(self.ctrl_length.get())
            }
            _ => false,
        }
    }

    /// All data is in the packet buffer; wait for it to be sent.
    pub(crate) fn begin_drain(&self, pipe: usize) {
        self.pipes[pipe].state.set(PipeState::Draining);
        self.clear_pipe_status(pipe, false, false, true);
        self.pipe_interrupts(pipe, false, true, true);
    }

    /// Buffer-empty event for `pipe`.
    pub(crate) fn on_bemp(&self, pipe: usize) {
        if self.pipes[pipe].state.get() == PipeState::Draining {
            self.finish(pipe, TransferStatus::Complete);
        }
    }

    /// Not-ready event for `pipe`: the other side answered with NAK or STALL.
    pub(crate) fn on_nrdy(&self, pipe: usize) {
        let p = &self.pipes[pipe];
        if !p.is_busy() || p.state.get() == PipeState::RetryPending {
            return;
        }
        if self.pipe_pid(pipe) == Some(Pid::Stall) {
            self.terminate(pipe, TransferStatus::Stalled);
            return;
        }
        if p.transfer_type() == TransferType::Isochronous {
            self.terminate(pipe, TransferStatus::NotReadyExceeded);
            return;
        }
        if self.mode.get() == Mode::Device {
            // The host retries on its own.
            return;
        }

        let count = p.ignore_count.get().saturating_add(1);
        p.ignore_count.set(count);
        if count >= self.config.retry_ceiling {
            debug!("usbip: pipe {} gave up after {} NAKs", pipe, count);
            self.terminate(pipe, TransferStatus::NotReadyExceeded);
            return;
        }
        p.resume.set(p.state.get());
        p.state.set(PipeState::RetryPending);
        self.set_pid(pipe, Pid::Nak);
        self.schedule_retry(pipe);
    }

    /// The retry delay of `pipe` expired.
    pub(crate) fn retry(&self, pipe: usize) {
        let p = &self.pipes[pipe];
        if p.state.get() != PipeState::RetryPending {
            return;
        }
        p.state.set(p.resume.get());
        usb_debug!(self, "usbip: pipe {} retry {}", pipe, p.ignore_count.get());
        self.clear_pipe_status(pipe, false, true, false);
        self.set_pid(pipe, Pid::Buf);
    }

    /// Stop all activity of `pipe` without touching its buffer.
    fn quiesce(&self, pipe: usize) {
        let p = &self.pipes[pipe];
        self.pipe_interrupts(pipe, false, false, false);
        self.set_pid(pipe, Pid::Nak);
        for port in [FifoPort::D0fifo, FifoPort::D1fifo] {
            if self.ports[port.index()]
                .dma
                .map_or(false, |binding| binding.pipe == pipe)
            {
                self.stop_block(port);
            }
        }
        self.clear_transaction_counter(pipe);
        self.clear_pipe_status(pipe, true, true, true);
        p.zlp_pending.set(false);
    }

    /// End the transfer normally.
    pub(crate) fn finish(&self, pipe: usize, status: TransferStatus) {
        self.quiesce(pipe);
        self.complete(pipe, status);
    }

    /// End the transfer abnormally: drop buffered data and release every
    /// FIFO port the pipe holds.
    pub(crate) fn terminate(&self, pipe: usize, status: TransferStatus) {
        self.quiesce(pipe);
        self.flush_pipe_buffer(pipe);
        let mut status = status;
        for port in FifoPort::ALL {
            if self.ports[port.index()].owner.get() == Some(pipe)
                && self.clear_port(port).is_err()
            {
                self.pipes[pipe].state.set(PipeState::Wedged);
                status = TransferStatus::PortWedged;
            }
        }
        self.complete(pipe, status);
    }

    /// A FIFO port could not be bound to `pipe`.
    fn wedge(&self, pipe: usize) {
        debug!("usbip: pipe {} wedged", pipe);
        self.quiesce(pipe);
        self.pipes[pipe].state.set(PipeState::Wedged);
        self.complete(pipe, TransferStatus::PortWedged);
    }

    fn complete(&self, pipe: usize, status: TransferStatus) {
        let p = &self.pipes[pipe];
        if p.state.get() != PipeState::Wedged {
            p.state.set(PipeState::Idle);
        }
        let length = p.position.get();
        usb_debug!(self, "usbip: pipe {} done {:?} {}", pipe, status, length);
        if let Some(buffer) = p.buffer.take() {
            self.deliver(pipe, buffer, length, status);
        }
    }

    /// End the transfer on `pipe`, if any, with `status`.
    pub(crate) fn cancel(&self, pipe: usize, status: TransferStatus) {
        if pipe == 0 && self.mode.get() == Mode::Host && self.host_ctrl.is_active() {
            self.abort_control(status);
        } else if self.pipes[pipe].is_busy() {
            self.terminate(pipe, status);
        }
    }

    pub fn stop(&self, pipe: usize) {
        if pipe < self.pipes.len() {
            self.cancel(pipe, TransferStatus::Stopped);
        }
    }
}
