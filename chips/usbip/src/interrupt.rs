// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Demultiplexing of the controller interrupt.
//!
//! One vector serves every event of the controller. The handler reads the
//! status registers, keeps only the enabled events, acknowledges each event
//! and runs its handler. Events are acknowledged before they are handled so
//! that a recurrence during the handler is not lost; the one exception is
//! the setup-received flag, which guards the setup registers and is cleared
//! only after they have been read.

use kernel::hil::time::Alarm;

use crate::debug::{IntSts0Flags, IntSts1Flags, PipeBitmap};
use crate::registers::{offset, UsbRegisters, INTSTS0, INTSTS0_CLEARABLE, INTSTS1};
use crate::usb::{Mode, Usb};

/// Interrupt sources of the controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IrqSource {
    OverCurrent,
    EofError,
    Detach,
    Attach,
    BusChange,
    SetupError,
    SetupAck,
    Resume,
    DeviceState,
    ControlStage,
    SetupReceived,
    BufferReady,
    NotReady,
    BufferEmpty,
}

/// When a status flag is acknowledged relative to running its handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClearOrder {
    ClearFirst,
    HandleFirst,
}

impl IrqSource {
    /// Host role link and setup events, in service order.
    pub const HOST_EVENTS: [IrqSource; 7] = [
        IrqSource::OverCurrent,
        IrqSource::EofError,
        IrqSource::Detach,
        IrqSource::Attach,
        IrqSource::BusChange,
        IrqSource::SetupError,
        IrqSource::SetupAck,
    ];

    /// Peripheral role events, in service order.
    pub const DEVICE_EVENTS: [IrqSource; 3] = [
        IrqSource::Resume,
        IrqSource::DeviceState,
        IrqSource::ControlStage,
    ];

    pub fn clear_order(self) -> ClearOrder {
        match self {
            IrqSource::SetupReceived => ClearOrder::HandleFirst,
            _ => ClearOrder::ClearFirst,
        }
    }

    /// Status register and bit of a link or stage event. Pipe events are
    /// reported through per-pipe bitmaps instead.
    pub fn status_bit(self) -> Option<(usize, u16)> {
        let bit = match self {
            IrqSource::OverCurrent => INTSTS1::OVRCR::SET.value,
            IrqSource::EofError => INTSTS1::EOFERR::SET.value,
            IrqSource::Detach => INTSTS1::DTCH::SET.value,
            IrqSource::Attach => INTSTS1::ATTCH::SET.value,
            IrqSource::BusChange => INTSTS1::BCHG::SET.value,
            IrqSource::SetupError => INTSTS1::SIGN::SET.value,
            IrqSource::SetupAck => INTSTS1::SACK::SET.value,
            IrqSource::Resume => return Some((offset::INTSTS0, INTSTS0::RESM::SET.value)),
            IrqSource::DeviceState => return Some((offset::INTSTS0, INTSTS0::DVST::SET.value)),
            IrqSource::ControlStage => return Some((offset::INTSTS0, INTSTS0::CTRT::SET.value)),
            IrqSource::SetupReceived => return Some((offset::INTSTS0, INTSTS0::VALID::SET.value)),
            _ => return None,
        };
        Some((offset::INTSTS1, bit))
    }
}

impl<'a, R: UsbRegisters, A: Alarm<'a>> Usb<'a, R, A> {
    pub(crate) fn acknowledge(&self, source: IrqSource) {
        if let Some((reg, bit)) = source.status_bit() {
            debug_assert!(reg != offset::INTSTS0 || INTSTS0_CLEARABLE & bit != 0);
            self.registers.clear_status(reg, bit);
        }
    }

    /// Service the controller interrupt.
    pub fn handle_interrupt(&self) {
        let mode = self.mode.get();
        if mode == Mode::Off {
            return;
        }
        let regs = &self.registers;
        let sts0 = regs.read_reg::<INTSTS0::Register>(offset::INTSTS0);
        let events0 = sts0.get() & regs.read16(offset::INTENB0);
        let events1 = regs.read16(offset::INTSTS1) & regs.read16(offset::INTENB1);
        usb_debug!(
            self,
            "usbip: irq {:?} {:?}",
            IntSts0Flags(events0),
            IntSts1Flags(events1)
        );

        let sources: &[IrqSource] = match mode {
            Mode::Host => &IrqSource::HOST_EVENTS,
            _ => &IrqSource::DEVICE_EVENTS,
        };
        for &source in sources {
            let pending = match source.status_bit() {
                Some((reg, bit)) if reg == offset::INTSTS1 => events1 & bit != 0,
                Some((_, bit)) => events0 & bit != 0,
                None => false,
            };
            if !pending {
                continue;
            }
            if source.clear_order() == ClearOrder::ClearFirst {
                self.acknowledge(source);
            }
            match source {
                IrqSource::OverCurrent => self.on_overcurrent(),
                IrqSource::EofError | IrqSource::Detach => self.on_detach(),
                IrqSource::Attach => self.on_attach(),
                IrqSource::BusChange => self.on_bus_change(),
                IrqSource::SetupError => self.on_setup_error(),
                IrqSource::SetupAck => self.on_setup_ack(),
                IrqSource::Resume => self.on_resume(),
                IrqSource::DeviceState => self.on_device_state(sts0),
                IrqSource::ControlStage => self.on_control_stage(sts0),
                _ => {}
            }
        }

        if events0 & INTSTS0::BRDY::SET.value != 0 {
            let bitmap = self.take_pipe_events(offset::BRDYSTS, offset::BRDYENB);
            self.for_each_pipe(IrqSource::BufferReady, bitmap, |pipe| self.on_brdy(pipe));
        }
        if events0 & INTSTS0::NRDY::SET.value != 0 {
            let bitmap = self.take_pipe_events(offset::NRDYSTS, offset::NRDYENB);
            self.for_each_pipe(IrqSource::NotReady, bitmap, |pipe| self.on_nrdy(pipe));
        }
        if events0 & INTSTS0::BEMP::SET.value != 0 {
            let bitmap = self.take_pipe_events(offset::BEMPSTS, offset::BEMPENB);
            self.for_each_pipe(IrqSource::BufferEmpty, bitmap, |pipe| self.on_bemp(pipe));
        }
    }

    /// Read and acknowledge the enabled bits of a per-pipe status bitmap.
    fn take_pipe_events(&self, status: usize, enable: usize) -> u16 {
        let bitmap = self.registers.read16(status) & self.registers.read16(enable);
        if bitmap != 0 {
            self.registers.clear_status(status, bitmap);
        }
        bitmap
    }

    fn for_each_pipe<F: Fn(usize)>(&self, source: IrqSource, bitmap: u16, handler: F) {
        if bitmap == 0 {
            return;
        }
        usb_debug!(self, "usbip: {:?} {:?}", source, PipeBitmap(bitmap));
        for pipe in 0..self.pipes.len() {
            if bitmap & (1 << pipe) != 0 {
                handler(pipe);
            }
        }
    }
}
