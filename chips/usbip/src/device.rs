// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Peripheral role: device state changes and control request sequencing.
//!
//! The hardware tracks the stage of a control transfer on the default pipe
//! and raises a control transfer stage event (`CTRT`) at every change:
//!
//! ```text
//!   SETUP (VALID) --> ReadData / WriteData --> ReadStatus / WriteStatus --> Idle
//!        \-----------> NoDataStatus ----------------------------------------/
//! ```
//!
//! A SETUP packet is passed to the `Client`. For requests with a data stage
//! the client then submits the data on pipe 0 with the ordinary `read` and
//! `write` operations; the status stage is completed by the driver.

use kernel::debug;
use kernel::hil::time::Alarm;
use kernel::hil::usb::{CtrlSetupResult, SetupData, Speed, TransferStatus};
use kernel::ErrorCode;

use crate::interrupt::IrqSource;
use crate::pipe::{Pid, PipeState};
use crate::registers::{
    offset, IntSts0Val, UsbRegisters, DVSTCTR0, INTENB0, INTSTS0, PIPECTR, SYSCFG,
};
use crate::usb::{Mode, Usb};

/// Stage of the control request served on pipe 0.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CtrlStage {
    Idle,
    /// A request without data stage was received.
    SetupReceived,
    /// The client sends data to the host.
    DataIn,
    /// The host sends data to the client.
    DataOut,
    StatusStage,
    Stalled,
}

/// `DVSQ` suspended flag.
const DVSQ_SUSPENDED: u16 = 0b100;
const DVSQ_DEFAULT: u16 = 1;
const DVSQ_ADDRESS: u16 = 2;
const DVSQ_CONFIGURED: u16 = 3;

impl<'a, R: UsbRegisters, A: Alarm<'a>> Usb<'a, R, A> {
    /// Start the controller in peripheral mode. The controller stays
    /// invisible to the host until `attach`.
    pub fn enable_device(&self) {
        let regs = &self.registers;
        let hse = if self.config.instance.high_speed() {
            SYSCFG::HSE::SET
        } else {
            SYSCFG::HSE::CLEAR
        };
        regs.write_reg(offset::SYSCFG, SYSCFG::SCKE::SET);
        regs.modify(
            offset::SYSCFG,
            SYSCFG::DCFM::Peripheral + hse + SYSCFG::USBE::SET,
        );
        regs.write_reg(
            offset::INTENB0,
            INTENB0::DVSE::SET
                + INTENB0::CTRE::SET
                + INTENB0::BRDYE::SET
                + INTENB0::NRDYE::SET
                + INTENB0::BEMPE::SET
                + INTENB0::RSME::SET,
        );
        regs.write16(offset::INTENB1, 0);
        self.mode.set(Mode::Device);
        self.ctrl_stage.set(CtrlStage::Idle);
        self.device_state.set(0);
        debug!("usbip: peripheral mode, {:?}", self.config.instance);
    }

    /// Connect the D+ pull-up so the host sees the device.
    pub fn attach(&self) {
        self.registers.modify(offset::SYSCFG, SYSCFG::DPRPU::SET);
    }

    pub fn detach(&self) {
        self.registers.modify(offset::SYSCFG, SYSCFG::DPRPU::CLEAR);
    }

    pub fn control_stage(&self) -> CtrlStage {
        self.ctrl_stage.get()
    }

    /// Device state change event.
    pub(crate) fn on_device_state(&self, sts: IntSts0Val) {
        let dvsq = sts.read(INTSTS0::DVSQ);
        let prev = self.device_state.replace(dvsq);
        let state = dvsq & !DVSQ_SUSPENDED;

        if dvsq & DVSQ_SUSPENDED != 0 {
            if prev & DVSQ_SUSPENDED == 0 {
                self.device_client.map(|client| client.suspended());
            }
            return;
        }
        if prev & DVSQ_SUSPENDED != 0 && state == prev & !DVSQ_SUSPENDED {
            // Resume without the resume event having been seen.
            self.device_client.map(|client| client.resumed());
            return;
        }

        match state {
            DVSQ_DEFAULT => self.bus_reset(),
            DVSQ_ADDRESS if prev != DVSQ_ADDRESS => {
                let address = (self.registers.read16(offset::USBADDR) & 0x7F) as u8;
                usb_debug!(self, "usbip: address {}", address);
                self.device_client
                    .map(|client| client.address_assigned(address));
            }
            DVSQ_CONFIGURED if prev != DVSQ_CONFIGURED => {
                self.device_client.map(|client| client.configured());
            }
            _ => {}
        }
    }

    fn bus_reset(&self) {
        for pipe in 0..self.pipes.len() {
            self.cancel(pipe, TransferStatus::Stopped);
        }
        self.ctrl_stage.set(CtrlStage::Idle);
        self.remote_wakeup_enabled.set(false);
        let rhst = self
            .registers
            .read_reg::<DVSTCTR0::Register>(offset::DVSTCTR0)
            .read(DVSTCTR0::RHST);
        let speed = match rhst {
            1 => Speed::Low,
            3 => Speed::High,
            _ => Speed::Full,
        };
        debug!("usbip: bus reset, {:?}", speed);
        self.device_client.map(|client| client.bus_reset(speed));
    }

    /// Resume event: the host ended a suspend.
    pub(crate) fn on_resume(&self) {
        let state = self.device_state.get();
        if state & DVSQ_SUSPENDED != 0 {
            self.device_state.set(state & !DVSQ_SUSPENDED);
            self.device_client.map(|client| client.resumed());
        }
    }

    /// Control transfer stage event.
    pub(crate) fn on_control_stage(&self, sts: IntSts0Val) {
        if sts.is_set(INTSTS0::VALID) {
            self.on_setup();
            return;
        }
        match sts.read_as_enum::<INTSTS0::CTSQ::Value>(INTSTS0::CTSQ) {
            Some(INTSTS0::CTSQ::Value::ReadStatus) | Some(INTSTS0::CTSQ::Value::WriteStatus) => {
                self.end_data_stage();
            }
            Some(INTSTS0::CTSQ::Value::IdleOrSetup) => {
                if self.ctrl_stage.get() == CtrlStage::StatusStage {
                    self.ctrl_stage.set(CtrlStage::Idle);
                    self.device_client
                        .map(|client| client.ctrl_status_complete(TransferStatus::Complete));
                }
            }
            Some(INTSTS0::CTSQ::Value::SequenceError) => {
                debug!("usbip: control sequence error");
                self.stall_control();
            }
            _ => {}
        }
    }

    fn on_setup(&self) {
        let regs = &self.registers;
        let setup = SetupData::from_registers(
            regs.read16(offset::USBREQ),
            regs.read16(offset::USBVAL),
            regs.read16(offset::USBINDX),
            regs.read16(offset::USBLENG),
        );
        // The setup registers may change once VALID is cleared.
        self.acknowledge(IrqSource::SetupReceived);

        // A new SETUP ends whatever the previous request was doing.
        if self.pipes[0].is_busy() {
            self.terminate(0, TransferStatus::Stopped);
        }
        self.set_pid(0, Pid::Nak);
        self.ctrl_length.set(setup.length);
        let stage = if !setup.has_data_stage() {
            CtrlStage::SetupReceived
        } else if setup.is_device_to_host() {
            CtrlStage::DataIn
        } else {
            CtrlStage::DataOut
        };
        self.ctrl_stage.set(stage);
        self.set_dcp_direction(stage == CtrlStage::DataIn);
        usb_debug!(self, "usbip: SETUP {:?}", setup);

        let result = self
            .device_client
            .map_or(CtrlSetupResult::Stall, |client| client.ctrl_setup(setup));
        match result {
            CtrlSetupResult::Accept if stage == CtrlStage::SetupReceived => {
                self.complete_status_stage();
            }
            CtrlSetupResult::Accept => {}
            CtrlSetupResult::Stall => self.stall_control(),
        }
    }

    /// The host moved on to the status stage.
    fn end_data_stage(&self) {
        match self.pipes[0].state.get() {
            PipeState::Draining => self.finish(0, TransferStatus::Complete),
            state if self.pipes[0].is_busy() => {
                usb_debug!(self, "usbip: data stage cut short in {:?}", state);
                self.terminate(0, TransferStatus::Stopped);
            }
            _ => {}
        }
        if self.ctrl_stage.get() != CtrlStage::Stalled {
            self.complete_status_stage();
        }
    }

    fn complete_status_stage(&self) {
        self.set_pid(0, Pid::Buf);
        self.registers.modify(offset::DCPCTR, PIPECTR::CCPL::SET);
        self.ctrl_stage.set(CtrlStage::StatusStage);
    }

    fn stall_control(&self) {
        self.set_pid(0, Pid::Stall);
        self.ctrl_stage.set(CtrlStage::Stalled);
        self.device_client
            .map(|client| client.ctrl_status_complete(TransferStatus::Stalled));
    }

    /// A data stage transfer on pipe 0 finished.
    pub(crate) fn device_data_stage_done(&self, status: TransferStatus) {
        match self.ctrl_stage.get() {
            CtrlStage::DataIn | CtrlStage::DataOut => {}
            _ => return,
        }
        if status.is_error() && status != TransferStatus::Stopped {
            self.stall_control();
        }
    }

    /// Answer the current control request with STALL.
    pub fn ctrl_stall(&self) -> Result<(), ErrorCode> {
        match self.ctrl_stage.get() {
            CtrlStage::Idle | CtrlStage::Stalled => Err(ErrorCode::ALREADY),
            _ => {
                if self.pipes[0].is_busy() {
                    self.terminate(0, TransferStatus::Stalled);
                }
                if self.ctrl_stage.get() != CtrlStage::Stalled {
                    self.stall_control();
                }
                Ok(())
            }
        }
    }

    /// Allow the device to wake a suspended host.
    pub fn set_remote_wakeup(&self, enabled: bool) {
        self.remote_wakeup_enabled.set(enabled);
    }

    /// Signal remote wakeup to the host.
    pub fn remote_wakeup(&self) -> Result<(), ErrorCode> {
        if self.mode.get() != Mode::Device || self.device_state.get() & DVSQ_SUSPENDED == 0 {
            return Err(ErrorCode::OFF);
        }
        if !self.remote_wakeup_enabled.get() {
            return Err(ErrorCode::INVAL);
        }
        self.registers
            .modify(offset::DVSTCTR0, DVSTCTR0::WKUP::SET);
        Ok(())
    }

    /// Set or clear the halt condition of `pipe`. Clearing also resets the
    /// data toggle. An outstanding transfer ends with `Stalled`.
    pub fn set_pipe_stall(&self, pipe: usize, stall: bool) -> Result<(), ErrorCode> {
        let p = self.pipes.get(pipe).ok_or(ErrorCode::INVAL)?;
        if p.state.get() == PipeState::Free {
            return Err(ErrorCode::RESERVE);
        }
        if stall {
            if p.is_busy() {
                self.terminate(pipe, TransferStatus::Stalled);
            }
            self.set_pid(pipe, Pid::Stall);
        } else {
            self.set_pid(pipe, Pid::Nak);
            self.clear_toggle(pipe);
        }
        Ok(())
    }

    /// Reset the data toggle of `pipe` to DATA0.
    pub fn clear_toggle(&self, pipe: usize) {
        if pipe < self.pipes.len() {
            self.registers
                .modify(offset::pipe_ctr(pipe), PIPECTR::SQCLR::SET);
        }
    }
}
