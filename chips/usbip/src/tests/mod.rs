// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Scenario tests that run the driver against a simulated controller.
//!
//! A `Harness` wires a `Usb` to the simulated register block, a fake alarm,
//! a fake delay, a fake block transfer engine and a recording client.
//! `pump` plays the role of the interrupt controller: it services the DMA
//! completion and controller interrupts and fires the alarm until nothing is
//! pending.

mod device;
mod host;

use core::cell::{Cell, RefCell};
use std::boxed::Box;
use std::vec;
use std::vec::Vec;

use kernel::hil::time::{Alarm, AlarmClient, Delay, Freq1KHz, Time};
use kernel::hil::usb::{
    Client, CtrlSetupResult, Direction, PipeConfig, SetupData, Speed, TransferClient,
    TransferStatus, TransferType,
};
use kernel::hil::usb_host::{LinkClient, UsbHost};
use kernel::utilities::cells::OptionalCell;
use kernel::ErrorCode;

use crate::config::UsbConfig;
use crate::dma::{BlockDescriptor, BlockDirection, BlockTransferEngine};
use crate::fifo::FifoPort;
use crate::registers::{offset, UsbRegisters};
use crate::usb::Usb;

use self::sim::Sim;

pub(crate) type TestUsb = Usb<'static, &'static Sim, FakeAlarm>;

fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

pub(crate) fn buffer(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

/// A buffer of `len` bytes filled with a recognisable pattern.
pub(crate) fn pattern(len: usize) -> &'static mut [u8] {
    let buf = buffer(len);
    for (i, b) in buf.iter_mut().enumerate() {
        *b = (i * 7 + 3) as u8;
    }
    buf
}

pub(crate) fn pattern_vec(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

pub(crate) const fn bulk_out(endpoint: u8, mps: u16) -> PipeConfig {
    PipeConfig::bulk(Direction::Out, endpoint, mps).with_device(1)
}

pub(crate) const fn bulk_in(endpoint: u8, mps: u16) -> PipeConfig {
    PipeConfig::bulk(Direction::In, endpoint, mps).with_device(1)
}

pub(crate) const fn control(mps: u16) -> PipeConfig {
    PipeConfig::bulk(Direction::Out, 0, mps).with_type(TransferType::Control, 0)
}

pub(crate) struct FakeAlarm {
    now: Cell<u32>,
    at: Cell<u32>,
    armed: Cell<bool>,
    client: OptionalCell<&'static dyn AlarmClient>,
    pub(crate) fired: Cell<usize>,
}

impl FakeAlarm {
    fn new() -> FakeAlarm {
        FakeAlarm {
            now: Cell::new(0),
            at: Cell::new(0),
            armed: Cell::new(false),
            client: OptionalCell::empty(),
            fired: Cell::new(0),
        }
    }

    /// Advance time to the armed alarm and run its client.
    fn fire(&self) -> bool {
        if !self.armed.get() {
            return false;
        }
        self.armed.set(false);
        self.now.set(self.at.get());
        self.fired.set(self.fired.get() + 1);
        self.client.map(|client| client.alarm());
        true
    }
}

impl Time for FakeAlarm {
    type Frequency = Freq1KHz;

    fn now(&self) -> u32 {
        self.now.get()
    }
}

impl Alarm<'static> for FakeAlarm {
    fn set_alarm_client(&self, client: &'static dyn AlarmClient) {
        self.client.set(client);
    }

    fn set_alarm(&self, reference: u32, dt: u32) {
        self.at.set(reference.wrapping_add(dt));
        self.armed.set(true);
    }

    fn get_alarm(&self) -> u32 {
        self.at.get()
    }

    fn disarm(&self) -> Result<(), ErrorCode> {
        self.armed.set(false);
        Ok(())
    }

    fn is_armed(&self) -> bool {
        self.armed.get()
    }
}

/// Records blocking waits, in milliseconds.
pub(crate) struct FakeDelay {
    pub(crate) waits: RefCell<Vec<u32>>,
}

impl Delay for FakeDelay {
    fn delay_us(&self, us: u32) {
        self.waits.borrow_mut().push(us / 1000);
    }

    fn delay_ms(&self, ms: u32) {
        self.waits.borrow_mut().push(ms);
    }
}

#[derive(Copy, Clone)]
struct Channel {
    descriptor: BlockDescriptor,
    done: usize,
    complete: bool,
}

/// A block transfer engine that moves data through the simulated FIFO data
/// ports while the port requests service.
pub(crate) struct FakeDma {
    sim: &'static Sim,
    channels: RefCell<[Option<Channel>; 2]>,
    pub(crate) refuse: Cell<bool>,
    pub(crate) starts: Cell<usize>,
}

impl FakeDma {
    fn new(sim: &'static Sim) -> FakeDma {
        FakeDma {
            sim,
            channels: RefCell::new([None, None]),
            refuse: Cell::new(false),
            starts: Cell::new(0),
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.channels.borrow().iter().filter(|c| c.is_some()).count()
    }

    fn channel(&self, channel: usize) -> Option<Channel> {
        self.channels.borrow()[channel]
    }

    fn update(&self, channel: usize, f: impl FnOnce(&mut Channel)) {
        if let Some(c) = self.channels.borrow_mut()[channel].as_mut() {
            f(c);
        }
    }

    /// Run every channel as far as the FIFOs allow. Returns the port of a
    /// channel that finished, whose completion interrupt is now due.
    pub(crate) fn run(&self) -> Option<FifoPort> {
        for channel in 0..2 {
            let descriptor = match self.channel(channel) {
                Some(c) if !c.complete => c.descriptor,
                _ => continue,
            };
            let port = if descriptor.fifo == offset::D0FIFO {
                FifoPort::D0fifo
            } else {
                FifoPort::D1fifo
            };
            if !self.sim.dreq(port) {
                continue;
            }
            let width = descriptor.width.bytes();
            let per_block = descriptor.block_size / width;
            loop {
                let done = self.channel(channel).map_or(0, |c| c.done);
                if done >= descriptor.elements() {
                    self.update(channel, |c| c.complete = true);
                    return Some(port);
                }
                let ctr = self.sim.read16(port.ctr());
                if ctr & (1 << 13) == 0 {
                    break;
                }
                let start = done * width;
                match descriptor.direction {
                    BlockDirection::MemoryToFifo => {
                        for i in 0..per_block {
                            let mut b = [0u8; 4];
                            for (k, x) in b.iter_mut().take(width).enumerate() {
                                // SAFETY: the descriptor covers a leaked test buffer.
                                *x = unsafe { *descriptor.memory.add(start + i * width + k) };
                            }
                            match width {
                                1 => self.sim.write8(descriptor.fifo, b[0]),
                                2 => self
                                    .sim
                                    .write16(descriptor.fifo, u16::from_le_bytes([b[0], b[1]])),
                                _ => self.sim.write32(descriptor.fifo, u32::from_le_bytes(b)),
                            }
                        }
                    }
                    BlockDirection::FifoToMemory => {
                        // A short packet is not a block; wait for the driver.
                        if usize::from(ctr & 0xFFF) < descriptor.block_size {
                            break;
                        }
                        for i in 0..per_block {
                            let b = match width {
                                1 => [self.sim.read8(descriptor.fifo), 0, 0, 0],
                                2 => {
                                    let v = self.sim.read16(descriptor.fifo).to_le_bytes();
                                    [v[0], v[1], 0, 0]
                                }
                                _ => self.sim.read32(descriptor.fifo).to_le_bytes(),
                            };
                            for (k, x) in b.iter().take(width).enumerate() {
                                // SAFETY: see above.
                                unsafe { *descriptor.memory.add(start + i * width + k) = *x };
                            }
                        }
                    }
                }
                self.update(channel, |c| c.done += per_block);
            }
        }
        None
    }
}

impl BlockTransferEngine for FakeDma {
    fn start(&self, channel: u8, descriptor: BlockDescriptor) -> Result<(), ErrorCode> {
        if self.refuse.get() {
            return Err(ErrorCode::BUSY);
        }
        let mut channels = self.channels.borrow_mut();
        let slot = channels
            .get_mut(usize::from(channel))
            .ok_or(ErrorCode::INVAL)?;
        if slot.is_some() {
            return Err(ErrorCode::BUSY);
        }
        *slot = Some(Channel {
            descriptor,
            done: 0,
            complete: false,
        });
        self.starts.set(self.starts.get() + 1);
        Ok(())
    }

    fn stop(&self, channel: u8) {
        if let Some(slot) = self.channels.borrow_mut().get_mut(usize::from(channel)) {
            *slot = None;
        }
    }

    fn remaining(&self, channel: u8) -> usize {
        self.channel(usize::from(channel))
            .map_or(0, |c| c.descriptor.elements() - c.done)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Done {
    pub(crate) pipe: usize,
    pub(crate) length: usize,
    pub(crate) status: TransferStatus,
    pub(crate) data: Vec<u8>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum LinkEvent {
    Attached(Speed),
    Detached,
    Reset(Speed),
    Suspended,
    Resumed,
    OverCurrent,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DeviceEvent {
    BusReset(Speed),
    Address(u8),
    Configured,
    Suspended,
    Resumed,
    Setup(SetupData),
    StatusComplete(TransferStatus),
}

/// Records every callback of the driver.
pub(crate) struct Recorder {
    pub(crate) done: RefCell<Vec<Done>>,
    pub(crate) buffers: RefCell<Vec<&'static mut [u8]>>,
    pub(crate) link: RefCell<Vec<LinkEvent>>,
    pub(crate) device: RefCell<Vec<DeviceEvent>>,
    pub(crate) setup_answer: Cell<CtrlSetupResult>,
}

impl Recorder {
    fn new() -> Recorder {
        Recorder {
            done: RefCell::new(Vec::new()),
            buffers: RefCell::new(Vec::new()),
            link: RefCell::new(Vec::new()),
            device: RefCell::new(Vec::new()),
            setup_answer: Cell::new(CtrlSetupResult::Accept),
        }
    }
}

impl TransferClient for Recorder {
    fn transfer_done(
        &self,
        pipe: usize,
        buffer: &'static mut [u8],
        length: usize,
        status: TransferStatus,
    ) {
        self.done.borrow_mut().push(Done {
            pipe,
            length,
            status,
            data: buffer[..length.min(buffer.len())].to_vec(),
        });
        self.buffers.borrow_mut().push(buffer);
    }
}

impl LinkClient for Recorder {
    fn attached(&self, _port: usize, speed: Speed) {
        self.link.borrow_mut().push(LinkEvent::Attached(speed));
    }

    fn detached(&self, _port: usize) {
        self.link.borrow_mut().push(LinkEvent::Detached);
    }

    fn reset_complete(&self, _port: usize, speed: Speed) {
        self.link.borrow_mut().push(LinkEvent::Reset(speed));
    }

    fn suspended(&self, _port: usize) {
        self.link.borrow_mut().push(LinkEvent::Suspended);
    }

    fn resumed(&self, _port: usize) {
        self.link.borrow_mut().push(LinkEvent::Resumed);
    }

    fn overcurrent(&self, _port: usize) {
        self.link.borrow_mut().push(LinkEvent::OverCurrent);
    }
}

impl Client for Recorder {
    fn bus_reset(&self, speed: Speed) {
        self.device.borrow_mut().push(DeviceEvent::BusReset(speed));
    }

    fn address_assigned(&self, address: u8) {
        self.device.borrow_mut().push(DeviceEvent::Address(address));
    }

    fn configured(&self) {
        self.device.borrow_mut().push(DeviceEvent::Configured);
    }

    fn suspended(&self) {
        self.device.borrow_mut().push(DeviceEvent::Suspended);
    }

    fn resumed(&self) {
        self.device.borrow_mut().push(DeviceEvent::Resumed);
    }

    fn ctrl_setup(&self, setup: SetupData) -> CtrlSetupResult {
        self.device.borrow_mut().push(DeviceEvent::Setup(setup));
        self.setup_answer.get()
    }

    fn ctrl_status_complete(&self, status: TransferStatus) {
        self.device
            .borrow_mut()
            .push(DeviceEvent::StatusComplete(status));
    }
}

pub(crate) struct Harness {
    pub(crate) usb: &'static TestUsb,
    pub(crate) sim: &'static Sim,
    pub(crate) alarm: &'static FakeAlarm,
    pub(crate) delay: &'static FakeDelay,
    pub(crate) dma: &'static FakeDma,
    pub(crate) client: &'static Recorder,
}

impl Harness {
    /// A controller that has not been started.
    pub(crate) fn new(config: UsbConfig) -> Harness {
        let sim = leak(Sim::new());
        let alarm = leak(FakeAlarm::new());
        let delay = leak(FakeDelay {
            waits: RefCell::new(Vec::new()),
        });
        let usb: &'static TestUsb = leak(Usb::new(sim, alarm, delay, config));
        alarm.set_alarm_client(usb);
        let dma = leak(FakeDma::new(sim));
        usb.set_dma_engine(dma);
        let client = leak(Recorder::new());
        Harness {
            usb,
            sim,
            alarm,
            delay,
            dma,
            client,
        }
    }

    /// Host mode with a full-speed device attached, reset and reachable at
    /// address 1.
    pub(crate) fn host(config: UsbConfig) -> Harness {
        let h = Harness::new(config);
        h.sim.state.borrow_mut().lnst.push_back(1);
        h.usb.set_link_client(h.client);
        h.usb.enable_host();
        h.usb.service_link_events();
        assert_eq!(h.usb.port_reset(0), Ok(Speed::Full));
        h.configure(0, control(64).with_device(0));
        assert_eq!(h.usb.set_device_speed(1, Some(Speed::Full)), Ok(()));
        h.client.link.borrow_mut().clear();
        h.delay.waits.borrow_mut().clear();
        h
    }

    /// Peripheral mode, attached to the bus, with pipe 0 configured.
    pub(crate) fn device(config: UsbConfig) -> Harness {
        let h = Harness::new(config);
        h.usb.set_device_client(h.client);
        h.usb.enable_device();
        h.configure(0, control(64));
        h.usb.attach();
        h
    }

    pub(crate) fn configure(&self, pipe: usize, config: PipeConfig) {
        assert_eq!(self.usb.configure_pipe(pipe, config, self.client), Ok(()));
    }

    /// Service interrupts and alarms until the controller is quiet.
    pub(crate) fn pump(&self) {
        for _ in 0..10_000 {
            if let Some(port) = self.dma.run() {
                self.usb.handle_dma_interrupt(port);
                continue;
            }
            if self.sim.interrupt_pending() {
                self.usb.handle_interrupt();
                continue;
            }
            if self.alarm.fire() {
                continue;
            }
            return;
        }
        panic!("controller never went quiet");
    }

    pub(crate) fn done(&self) -> Vec<Done> {
        self.client.done.borrow().clone()
    }

    pub(crate) fn last_done(&self) -> Done {
        match self.client.done.borrow().last() {
            Some(done) => done.clone(),
            None => panic!("no transfer finished"),
        }
    }

    pub(crate) fn link_events(&self) -> Vec<LinkEvent> {
        self.client.link.borrow().clone()
    }

    pub(crate) fn device_events(&self) -> Vec<DeviceEvent> {
        self.client.device.borrow().clone()
    }
}
