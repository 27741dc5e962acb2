// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Host role: root port link management and control transfers.
//!
//! ```text
//!  Detached --ATTCH--> AttachDetecting --debounced--> Attached(speed)
//!      ^                                                   |
//!      |                                              port_reset
//!      |                                                   v
//!      +------DTCH/EOFERR/OVRCR------ Active(speed) <-- Resetting
//!                                      |      ^
//!                                port_suspend  port_resume / remote wakeup
//!                                      v      |
//!                                   Suspended -> Resuming
//! ```
//!
//! Attach debouncing and resume signalling wait on the bus for tens of
//! milliseconds. The interrupt handler only records that such work is due;
//! `service_link_events`, called from the main loop, performs it.
//!
//! A control transfer runs its SETUP stage with the hardware's setup
//! sequencer (`SUREQ`, answered by `SACK` or `SIGN`), then the data and status
//! stages as ordinary CPU transfers on pipe 0.

use core::cell::Cell;

use kernel::debug;
use kernel::hil::time::Alarm;
use kernel::hil::usb::{SetupData, Speed, TransferStatus};
use kernel::hil::usb_host::{LinkClient, LinkState, UsbHost};
use kernel::utilities::cells::TakeCell;
use kernel::ErrorCode;

use crate::pipe::{Pid, PipeState, TransferDir};
use crate::registers::{
    offset, UsbRegisters, DEVADD, DVSTCTR0, INTENB0, INTSTS1, MAXP, PIPECTR, SYSCFG, SYSSTS0,
};
use crate::usb::{Mode, Usb};

/// Highest device address the controller can reach.
const MAX_DEVICE_ADDRESS: u8 = 10;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HostCtrlStage {
    Idle,
    Setup,
    DataIn,
    DataOut,
    Status,
}

/// The control transfer running on pipe 0.
pub(crate) struct HostControl {
    pub(crate) stage: Cell<HostCtrlStage>,
    pub(crate) setup: Cell<SetupData>,
    /// SETUP attempts answered with an error.
    retries: Cell<u8>,
    /// Bytes moved by the data stage.
    data_length: Cell<usize>,
    data_status: Cell<TransferStatus>,
    /// The client's buffer while no stage holds it.
    buffer: TakeCell<'static, [u8]>,
}

impl HostControl {
    pub(crate) const fn new() -> HostControl {
        HostControl {
            stage: Cell::new(HostCtrlStage::Idle),
            setup: Cell::new(SetupData {
                request_type: 0,
                request: 0,
                value: 0,
                index: 0,
                length: 0,
            }),
            retries: Cell::new(0),
            data_length: Cell::new(0),
            data_status: Cell::new(TransferStatus::Complete),
            buffer: TakeCell::empty(),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.stage.get() != HostCtrlStage::Idle
    }
}

const SETUP_EVENTS: u16 = (1 << 4) | (1 << 5);

impl<'a, R: UsbRegisters, A: Alarm<'a>> Usb<'a, R, A> {
    /// Start the controller in host mode.
    pub fn enable_host(&self) {
        let regs = &self.registers;
        let hse = if self.config.instance.high_speed() {
            SYSCFG::HSE::SET
        } else {
            SYSCFG::HSE::CLEAR
        };
        regs.write_reg(offset::SYSCFG, SYSCFG::SCKE::SET);
        regs.modify(
            offset::SYSCFG,
            SYSCFG::DCFM::Host + SYSCFG::DRPD::SET + hse + SYSCFG::USBE::SET,
        );
        regs.write_reg(
            offset::INTENB0,
            INTENB0::BRDYE::SET + INTENB0::NRDYE::SET + INTENB0::BEMPE::SET,
        );
        regs.write_reg(
            offset::INTENB1,
            INTSTS1::ATTCH::SET + INTSTS1::OVRCR::SET + INTSTS1::EOFERR::SET,
        );
        regs.write_reg(offset::DCPMAXP, MAXP::MXPS.val(64));
        self.mode.set(Mode::Host);
        self.link.set(LinkState::Detached);

        let line = regs.read_reg::<SYSSTS0::Register>(offset::SYSSTS0);
        if line.read(SYSSTS0::LNST) != 0 {
            // Something is already plugged in.
            self.link.set(LinkState::AttachDetecting);
            self.attach_pending.set(true);
            regs.clear_bits(offset::INTENB1, INTSTS1::ATTCH::SET.value);
        }
        debug!("usbip: host mode, {:?}", self.config.instance);
    }

    /// Stop the controller. Outstanding transfers end with `Stopped`.
    pub fn disable(&self) {
        for pipe in 0..self.pipes.len() {
            self.cancel(pipe, TransferStatus::Stopped);
        }
        let regs = &self.registers;
        regs.write16(offset::INTENB0, 0);
        regs.write16(offset::INTENB1, 0);
        regs.write16(offset::BRDYENB, 0);
        regs.write16(offset::NRDYENB, 0);
        regs.write16(offset::BEMPENB, 0);
        regs.write16(offset::SYSCFG, 0);
        self.mode.set(Mode::Off);
        self.link.set(LinkState::Detached);
        self.port_speed.clear();
    }

    /// Set the speed the controller uses to reach `address`.
    pub fn set_device_speed(&self, address: u8, speed: Option<Speed>) -> Result<(), ErrorCode> {
        if address > MAX_DEVICE_ADDRESS {
            return Err(ErrorCode::INVAL);
        }
        let usbspd = match speed {
            None => DEVADD::USBSPD::None,
            Some(Speed::Low) => DEVADD::USBSPD::Low,
            Some(Speed::Full) => DEVADD::USBSPD::Full,
            Some(Speed::High) => DEVADD::USBSPD::High,
        };
        self.registers
            .write_reg(offset::devadd(usize::from(address)), usbspd);
        let mask = self.port_addresses.get();
        self.port_addresses.set(match speed {
            Some(_) => mask | (1 << address),
            None => mask & !(1 << address),
        });
        Ok(())
    }

    pub(crate) fn on_attach(&self) {
        if self.link.get() != LinkState::Detached {
            return;
        }
        self.registers
            .clear_bits(offset::INTENB1, INTSTS1::ATTCH::SET.value);
        self.link.set(LinkState::AttachDetecting);
        self.attach_pending.set(true);
    }

    /// Remote wakeup signalling from a suspended device.
    pub(crate) fn on_bus_change(&self) {
        self.registers
            .clear_bits(offset::INTENB1, INTSTS1::BCHG::SET.value);
        if self.link.get() == LinkState::Suspended {
            self.resume_pending.set(true);
        }
    }

    /// The device went away, the port stopped sending SOFs, or the port
    /// reported an over-current condition.
    pub(crate) fn on_detach(&self) {
        if self.link.get() == LinkState::Detached {
            return;
        }
        let mask = self.port_addresses.get();
        for pipe in 0..self.pipes.len() {
            let address = self.pipes[pipe]
                .config
                .map_or(0, |c| c.device_address.unwrap_or(0));
            if address == 0 || mask & (1 << address) != 0 {
                self.cancel(pipe, TransferStatus::Stopped);
                if pipe != 0 {
                    self.release_pipe(pipe);
                }
            }
        }
        for address in 0..=MAX_DEVICE_ADDRESS {
            self.registers.write16(offset::devadd(usize::from(address)), 0);
        }
        self.port_addresses.set(0);
        self.port_speed.clear();
        self.attach_pending.set(false);
        self.resume_pending.set(false);

        let regs = &self.registers;
        regs.modify(offset::DVSTCTR0, DVSTCTR0::UACT::CLEAR);
        regs.clear_bits(
            offset::INTENB1,
            (INTSTS1::DTCH::SET + INTSTS1::BCHG::SET).value,
        );
        regs.clear_status(offset::INTSTS1, INTSTS1::ATTCH::SET.value);
        regs.set_bits(offset::INTENB1, INTSTS1::ATTCH::SET.value);
        self.link.set(LinkState::Detached);
        self.link_client.map(|client| client.detached(0));
    }

    pub(crate) fn on_overcurrent(&self) {
        debug!("usbip: over-current on root port");
        self.link_client.map(|client| client.overcurrent(0));
        self.on_detach();
    }

    /// Sample the line state twice, `debounce_ms` apart, until two samples
    /// agree. Returns the settled speed, or `None` if the line is idle.
    fn debounce(&self) -> Option<Speed> {
        let timing = self.config.timing;
        let read = || {
            self.registers
                .read_reg::<SYSSTS0::Register>(offset::SYSSTS0)
                .read(SYSSTS0::LNST)
        };
        for _ in 0..timing.debounce_attempts.max(1) {
            let first = read();
            self.delay.delay_ms(timing.debounce_ms);
            let second = read();
            if first != second {
                continue;
            }
            return match first {
                1 => Some(Speed::Full),
                2 => Some(Speed::Low),
                _ => None,
            };
        }
        None
    }

    fn finish_attach(&self) {
        match self.debounce() {
            Some(speed) => {
                self.link.set(LinkState::Attached(speed));
                self.port_speed.set(speed);
                let regs = &self.registers;
                regs.clear_status(offset::INTSTS1, INTSTS1::DTCH::SET.value);
                regs.set_bits(offset::INTENB1, INTSTS1::DTCH::SET.value);
                debug!("usbip: device attached, {:?}", speed);
                self.link_client.map(|client| client.attached(0, speed));
            }
            None => {
                usb_debug!(self, "usbip: attach did not settle");
                self.link.set(LinkState::Detached);
                self.registers
                    .clear_status(offset::INTSTS1, INTSTS1::ATTCH::SET.value);
                self.registers
                    .set_bits(offset::INTENB1, INTSTS1::ATTCH::SET.value);
            }
        }
    }

    fn reset_port(&self) -> Result<Speed, ErrorCode> {
        match self.link.get() {
            LinkState::Attached(_) | LinkState::Active(_) => {}
            _ => return Err(ErrorCode::OFF),
        }
        let regs = &self.registers;
        let timing = self.config.timing;
        self.link.set(LinkState::Resetting);
        regs.modify(offset::DVSTCTR0, DVSTCTR0::USBRST::SET + DVSTCTR0::UACT::CLEAR);
        self.delay.delay_ms(timing.reset_ms);
        regs.modify(offset::DVSTCTR0, DVSTCTR0::USBRST::CLEAR);

        let mut rhst = 4;
        for _ in 0..timing.reset_poll_attempts.max(1) {
            rhst = regs
                .read_reg::<DVSTCTR0::Register>(offset::DVSTCTR0)
                .read(DVSTCTR0::RHST);
            if rhst != 4 {
                break;
            }
            self.delay.delay_ms(timing.reset_poll_ms);
        }
        let speed = match rhst {
            1 => Speed::Low,
            2 => Speed::Full,
            3 => Speed::High,
            _ => {
                debug!("usbip: reset handshake did not finish ({})", rhst);
                self.link.set(LinkState::Detached);
                return Err(ErrorCode::FAIL);
            }
        };
        regs.modify(offset::DVSTCTR0, DVSTCTR0::UACT::SET);
        self.delay.delay_ms(timing.recovery_ms);
        self.port_speed.set(speed);
        self.link.set(LinkState::Active(speed));
        debug!("usbip: port reset, {:?}", speed);
        self.link_client.map(|client| client.reset_complete(0, speed));
        Ok(speed)
    }

    fn suspend_port(&self) -> Result<(), ErrorCode> {
        if !matches!(self.link.get(), LinkState::Active(_)) {
            return Err(ErrorCode::OFF);
        }
        let regs = &self.registers;
        regs.modify(offset::DVSTCTR0, DVSTCTR0::UACT::CLEAR);
        self.delay.delay_ms(self.config.timing.suspend_ms);
        regs.modify(offset::DVSTCTR0, DVSTCTR0::RWUPE::SET);
        regs.clear_status(offset::INTSTS1, INTSTS1::BCHG::SET.value);
        regs.set_bits(offset::INTENB1, INTSTS1::BCHG::SET.value);
        self.link.set(LinkState::Suspended);
        self.link_client.map(|client| client.suspended(0));
        Ok(())
    }

    fn resume_port(&self) -> Result<(), ErrorCode> {
        if self.link.get() != LinkState::Suspended {
            return Err(ErrorCode::OFF);
        }
        let regs = &self.registers;
        let timing = self.config.timing;
        self.resume_pending.set(false);
        self.link.set(LinkState::Resuming);
        regs.clear_bits(offset::INTENB1, INTSTS1::BCHG::SET.value);
        regs.modify(offset::DVSTCTR0, DVSTCTR0::RESUME::SET + DVSTCTR0::RWUPE::CLEAR);
        self.delay.delay_ms(timing.resume_ms);
        regs.modify(offset::DVSTCTR0, DVSTCTR0::RESUME::CLEAR);
        regs.modify(offset::DVSTCTR0, DVSTCTR0::UACT::SET);
        self.delay.delay_ms(timing.resume_settle_ms);
        let speed = self.port_speed.unwrap_or(Speed::Full);
        self.link.set(LinkState::Active(speed));
        self.link_client.map(|client| client.resumed(0));
        Ok(())
    }

    fn start_control(
        &self,
        device: u8,
        setup: SetupData,
        buffer: &'static mut [u8],
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        if self.mode.get() != Mode::Host || !matches!(self.link.get(), LinkState::Active(_)) {
            return Err((ErrorCode::OFF, buffer));
        }
        match self.pipes[0].state.get() {
            PipeState::Idle => {}
            PipeState::Free | PipeState::Wedged => return Err((ErrorCode::RESERVE, buffer)),
            _ => return Err((ErrorCode::BUSY, buffer)),
        }
        if self.host_ctrl.is_active() {
            return Err((ErrorCode::BUSY, buffer));
        }
        if device > MAX_DEVICE_ADDRESS {
            return Err((ErrorCode::INVAL, buffer));
        }
        if usize::from(setup.length) > buffer.len() {
            return Err((ErrorCode::SIZE, buffer));
        }

        let regs = &self.registers;
        regs.modify(offset::DCPMAXP, MAXP::DEVSEL.val(u16::from(device)));
        regs.write16(offset::USBREQ, setup.request_word());
        regs.write16(offset::USBVAL, setup.value);
        regs.write16(offset::USBINDX, setup.index);
        regs.write16(offset::USBLENG, setup.length);

        let ctrl = &self.host_ctrl;
        ctrl.buffer.replace(buffer);
        ctrl.setup.set(setup);
        ctrl.retries.set(0);
        ctrl.data_length.set(0);
        ctrl.data_status.set(TransferStatus::Complete);
        ctrl.stage.set(HostCtrlStage::Setup);
        self.pipes[0].state.set(PipeState::Armed);
        usb_debug!(self, "usbip: control to {} {:?}", device, setup);
        self.send_setup();
        Ok(())
    }

    fn send_setup(&self) {
        let regs = &self.registers;
        regs.clear_status(offset::INTSTS1, SETUP_EVENTS);
        regs.set_bits(offset::INTENB1, SETUP_EVENTS);
        regs.modify(offset::DCPCTR, PIPECTR::SUREQ::SET);
    }

    /// The device acknowledged the SETUP packet.
    pub(crate) fn on_setup_ack(&self) {
        let ctrl = &self.host_ctrl;
        if ctrl.stage.get() != HostCtrlStage::Setup {
            return;
        }
        self.registers.clear_bits(offset::INTENB1, SETUP_EVENTS);
        self.pipes[0].state.set(PipeState::Idle);
        let setup = ctrl.setup.get();
        if !setup.has_data_stage() {
            self.start_status_stage();
            return;
        }
        let (stage, dir) = if setup.is_device_to_host() {
            (HostCtrlStage::DataIn, TransferDir::Read)
        } else {
            (HostCtrlStage::DataOut, TransferDir::Write)
        };
        ctrl.stage.set(stage);
        self.set_dcp_direction(dir == TransferDir::Write);
        self.registers.modify(offset::DCPCTR, PIPECTR::SQSET::SET);
        match ctrl.buffer.take() {
            Some(buffer) => self.start_transfer(0, buffer, usize::from(setup.length), dir),
            None => ctrl.stage.set(HostCtrlStage::Idle),
        }
    }

    /// The SETUP packet went unanswered or was corrupted.
    pub(crate) fn on_setup_error(&self) {
        let ctrl = &self.host_ctrl;
        if ctrl.stage.get() != HostCtrlStage::Setup {
            return;
        }
        let retries = ctrl.retries.get().saturating_add(1);
        ctrl.retries.set(retries);
        if retries < self.config.retry_ceiling {
            usb_debug!(self, "usbip: SETUP error, retry {}", retries);
            self.send_setup();
        } else {
            debug!("usbip: SETUP failed {} times", retries);
            self.abort_control(TransferStatus::NotReadyExceeded);
        }
    }

    /// The status stage moves no data, in the direction opposite to the data
    /// stage, with DATA1.
    fn start_status_stage(&self) {
        let ctrl = &self.host_ctrl;
        let dir = match ctrl.stage.get() {
            HostCtrlStage::DataIn => TransferDir::Write,
            _ => TransferDir::Read,
        };
        ctrl.stage.set(HostCtrlStage::Status);
        self.set_dcp_direction(dir == TransferDir::Write);
        self.registers.modify(offset::DCPCTR, PIPECTR::SQSET::SET);
        match ctrl.buffer.take() {
            Some(buffer) => self.start_transfer(0, buffer, 0, dir),
            None => ctrl.stage.set(HostCtrlStage::Idle),
        }
    }

    /// A data or status stage of the running control transfer ended.
    pub(crate) fn host_control_stage_done(
        &self,
        buffer: &'static mut [u8],
        length: usize,
        status: TransferStatus,
    ) {
        let ctrl = &self.host_ctrl;
        match ctrl.stage.get() {
            HostCtrlStage::DataIn | HostCtrlStage::DataOut if !status.is_error() => {
                ctrl.data_length.set(length);
                ctrl.data_status.set(status);
                ctrl.buffer.replace(buffer);
                self.start_status_stage();
            }
            HostCtrlStage::DataIn | HostCtrlStage::DataOut => {
                self.finish_control(buffer, length, status)
            }
            HostCtrlStage::Status if !status.is_error() => {
                self.finish_control(buffer, ctrl.data_length.get(), ctrl.data_status.get())
            }
            _ => self.finish_control(buffer, ctrl.data_length.get(), status),
        }
    }

    /// End the running control transfer with `status`.
    pub(crate) fn abort_control(&self, status: TransferStatus) {
        let ctrl = &self.host_ctrl;
        if ctrl.stage.get() == HostCtrlStage::Setup {
            let regs = &self.registers;
            regs.clear_bits(offset::INTENB1, SETUP_EVENTS);
            regs.modify(offset::DCPCTR, PIPECTR::SUREQCLR::SET);
            regs.clear_status(offset::INTSTS1, SETUP_EVENTS);
            self.set_pid(0, Pid::Nak);
            self.pipes[0].state.set(PipeState::Idle);
            if let Some(buffer) = ctrl.buffer.take() {
                self.finish_control(buffer, 0, status);
            }
        } else {
            // The buffer comes back through `host_control_stage_done`.
            self.terminate(0, status);
        }
    }

    fn finish_control(&self, buffer: &'static mut [u8], length: usize, status: TransferStatus) {
        self.host_ctrl.stage.set(HostCtrlStage::Idle);
        usb_debug!(self, "usbip: control done {:?} {}", status, length);
        match self.pipes[0].client.get() {
            Some(client) => client.transfer_done(0, buffer, length, status),
            None => debug!("usbip: control transfer finished with no client"),
        }
    }
}

impl<'a, R: UsbRegisters, A: Alarm<'a>> UsbHost<'a> for Usb<'a, R, A> {
    fn set_link_client(&self, client: &'a dyn LinkClient) {
        self.link_client.set(client);
    }

    fn link_state(&self, _port: usize) -> LinkState {
        self.link.get()
    }

    fn port_reset(&self, port: usize) -> Result<Speed, ErrorCode> {
        if port != 0 {
            return Err(ErrorCode::NODEVICE);
        }
        self.reset_port()
    }

    fn port_suspend(&self, port: usize) -> Result<(), ErrorCode> {
        if port != 0 {
            return Err(ErrorCode::NODEVICE);
        }
        self.suspend_port()
    }

    fn port_resume(&self, port: usize) -> Result<(), ErrorCode> {
        if port != 0 {
            return Err(ErrorCode::NODEVICE);
        }
        self.resume_port()
    }

    fn service_link_events(&self) {
        if self.attach_pending.take() && self.link.get() == LinkState::AttachDetecting {
            self.finish_attach();
        }
        if self.resume_pending.take() {
            if let Err(e) = self.resume_port() {
                usb_debug!(self, "usbip: deferred resume dropped ({:?})", e);
            }
        }
    }

    fn control_transfer(
        &self,
        device: u8,
        setup: SetupData,
        buffer: &'static mut [u8],
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        self.start_control(device, setup, buffer)
    }
}
