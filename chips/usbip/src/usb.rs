// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! The controller driver.
//!
//! `Usb` owns the per-pipe arena, the FIFO port bindings and the link state.
//! Its behaviour is split over several modules that each add an `impl` block:
//! `pipe` (configuration and port arbitration), `transfer` (CPU path), `dma`
//! (block transfers), `host` (root port and control transfers), `device`
//! (peripheral control requests) and `interrupt` (status demultiplexing).
//!
//! Usage
//! -----
//!
//! ```rust,ignore
//! let usb = static_init!(
//!     usbip::Usb<'static, MmioUsbRegisters, VirtualMuxAlarm<'static, Rtc>>,
//!     usbip::Usb::new(
//!         MmioUsbRegisters::new(usbip::config::USB0_BASE),
//!         usb_alarm,
//!         busy_wait,
//!         usbip::UsbConfig::usb0(),
//!     )
//! );
//! usb_alarm.set_alarm_client(usb);
//! usb.enable_host();
//! ```

use core::cell::Cell;

use kernel::hil::time::{Alarm, AlarmClient, Delay};
use kernel::hil::usb::{
    Client, PipeConfig, Speed, TransferClient, TransferStatus, UsbPipes,
};
use kernel::hil::usb_host::{LinkClient, LinkState};
use kernel::utilities::cells::OptionalCell;
use kernel::ErrorCode;

use crate::config::{UsbConfig, MAX_PIPES};
use crate::device::CtrlStage;
use crate::dma::BlockTransferEngine;
use crate::host::HostControl;
use crate::pipe::{Pipe, PipeState, PortBinding, TransferDir};
use crate::registers::UsbRegisters;

/// Controller role.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Off,
    Host,
    Device,
}

pub struct Usb<'a, R: UsbRegisters, A: Alarm<'a>> {
    pub(crate) registers: R,
    pub(crate) config: UsbConfig,
    pub(crate) alarm: &'a A,
    pub(crate) delay: &'a dyn Delay,
    pub(crate) mode: Cell<Mode>,
    pub(crate) pipes: [Pipe<'a>; MAX_PIPES],
    pub(crate) ports: [PortBinding; 3],
    pub(crate) dma: OptionalCell<&'a dyn BlockTransferEngine>,
    /// Direction of the default control pipe's buffer; `true` is transmit.
    pub(crate) dcp_transmit: Cell<bool>,

    // Host role
    pub(crate) link_client: OptionalCell<&'a dyn LinkClient>,
    pub(crate) link: Cell<LinkState>,
    pub(crate) port_speed: OptionalCell<Speed>,
    /// Bitmap of device addresses reached through the root port.
    pub(crate) port_addresses: Cell<u16>,
    pub(crate) attach_pending: Cell<bool>,
    pub(crate) resume_pending: Cell<bool>,
    pub(crate) host_ctrl: HostControl,

    // Peripheral role
    pub(crate) device_client: OptionalCell<&'a dyn Client>,
    pub(crate) ctrl_stage: Cell<CtrlStage>,
    /// `wLength` of the control request being served.
    pub(crate) ctrl_length: Cell<u16>,
    /// Last device state (`DVSQ`) seen.
    pub(crate) device_state: Cell<u16>,
    pub(crate) remote_wakeup_enabled: Cell<bool>,
}

impl<'a, R: UsbRegisters, A: Alarm<'a>> Usb<'a, R, A> {
    pub fn new(registers: R, alarm: &'a A, delay: &'a dyn Delay, config: UsbConfig) -> Self {
        Usb {
            registers,
            config,
            alarm,
            delay,
            mode: Cell::new(Mode::Off),
            pipes: core::array::from_fn(|_| Pipe::new()),
            ports: [PortBinding::new(), PortBinding::new(), PortBinding::new()],
            dma: OptionalCell::empty(),
            dcp_transmit: Cell::new(false),
            link_client: OptionalCell::empty(),
            link: Cell::new(LinkState::Detached),
            port_speed: OptionalCell::empty(),
            port_addresses: Cell::new(0),
            attach_pending: Cell::new(false),
            resume_pending: Cell::new(false),
            host_ctrl: HostControl::new(),
            device_client: OptionalCell::empty(),
            ctrl_stage: Cell::new(CtrlStage::Idle),
            ctrl_length: Cell::new(0),
            device_state: Cell::new(0),
            remote_wakeup_enabled: Cell::new(false),
        }
    }

    pub fn config(&self) -> &UsbConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode.get()
    }

    /// Use `engine` for block transfers on `D0FIFO`/`D1FIFO`. Without an
    /// engine every transfer takes the CPU path.
    pub fn set_dma_engine(&self, engine: &'a dyn BlockTransferEngine) {
        self.dma.set(engine);
    }

    pub fn set_device_client(&self, client: &'a dyn Client) {
        self.device_client.set(client);
    }

    fn submit(
        &self,
        pipe: usize,
        buffer: &'static mut [u8],
        length: usize,
        dir: TransferDir,
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        let p = match self.pipes.get(pipe) {
            Some(p) => p,
            None => return Err((ErrorCode::INVAL, buffer)),
        };
        if self.mode.get() == Mode::Off {
            return Err((ErrorCode::OFF, buffer));
        }
        match p.state.get() {
            PipeState::Idle => {}
            PipeState::Free | PipeState::Wedged => return Err((ErrorCode::RESERVE, buffer)),
            _ => return Err((ErrorCode::BUSY, buffer)),
        }
        if length > buffer.len() {
            return Err((ErrorCode::SIZE, buffer));
        }
        let allowed = if pipe == 0 {
            self.control_data_allowed(dir)
        } else {
            let transmit = p.config.map_or(false, |c| self.is_transmit(&c));
            transmit == (dir == TransferDir::Write)
        };
        if !allowed {
            return Err((ErrorCode::INVAL, buffer));
        }

        self.start_transfer(pipe, buffer, length, dir);
        Ok(())
    }

    /// Data on pipe 0 only moves during the data stage of a peripheral
    /// control request. Host control transfers go through
    /// `control_transfer`.
    fn control_data_allowed(&self, dir: TransferDir) -> bool {
        match (self.mode.get(), self.ctrl_stage.get(), dir) {
            (Mode::Device, CtrlStage::DataIn, TransferDir::Write) => true,
            (Mode::Device, CtrlStage::DataOut, TransferDir::Read) => true,
            _ => false,
        }
    }

    /// Hand a finished transfer to whoever waits for it.
    pub(crate) fn deliver(
        &self,
        pipe: usize,
        buffer: &'static mut [u8],
        length: usize,
        status: TransferStatus,
    ) {
        if pipe == 0 {
            match self.mode.get() {
                Mode::Host if self.host_ctrl.is_active() => {
                    self.host_control_stage_done(buffer, length, status);
                    return;
                }
                Mode::Device => self.device_data_stage_done(status),
                _ => {}
            }
        }
        match self.pipes[pipe].client.get() {
            Some(client) => client.transfer_done(pipe, buffer, length, status),
            None => kernel::debug!("usbip: pipe {} finished with no client", pipe),
        }
    }

    pub(crate) fn schedule_retry(&self, pipe: usize) {
        let p = &self.pipes[pipe];
        let now = self.alarm.now();
        let dt = self.alarm.ticks_from_ms(self.config.retry_delay_ms);
        p.retry_at.set(now.wrapping_add(dt));
        if !self.alarm.is_armed() {
            self.alarm.set_alarm(now, dt);
        }
    }
}

impl<'a, R: UsbRegisters, A: Alarm<'a>> AlarmClient for Usb<'a, R, A> {
    fn alarm(&self) {
        let now = self.alarm.now();
        let mut next: Option<u32> = None;
        for (pipe, p) in self.pipes.iter().enumerate() {
            if p.state.get() != PipeState::RetryPending {
                continue;
            }
            let left = p.retry_at.get().wrapping_sub(now);
            // A deadline in the past wraps to a large value.
            if left == 0 || left > u32::MAX / 2 {
                self.retry(pipe);
            } else {
                next = Some(next.map_or(left, |n| n.min(left)));
            }
        }
        if let Some(dt) = next {
            self.alarm.set_alarm(now, dt);
        }
    }
}

impl<'a, R: UsbRegisters, A: Alarm<'a>> UsbPipes<'a> for Usb<'a, R, A> {
    fn configure_pipe(
        &self,
        pipe: usize,
        config: PipeConfig,
        client: &'a dyn TransferClient,
    ) -> Result<(), ErrorCode> {
        Usb::configure_pipe(self, pipe, config, client)
    }

    fn release_pipe(&self, pipe: usize) {
        Usb::release_pipe(self, pipe)
    }

    fn read(
        &self,
        pipe: usize,
        buffer: &'static mut [u8],
        length: usize,
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        self.submit(pipe, buffer, length, TransferDir::Read)
    }

    fn write(
        &self,
        pipe: usize,
        buffer: &'static mut [u8],
        length: usize,
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        self.submit(pipe, buffer, length, TransferDir::Write)
    }

    fn stop(&self, pipe: usize) {
        Usb::stop(self, pipe)
    }
}
