// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Interface to the root port of a USB host controller.
//!
//! Link events (attach, detach, suspend, resume, over-current) are reported to
//! a [`LinkClient`]. Port operations that have to wait on the bus, such as a
//! bus reset, block the caller and must not be issued from interrupt context.

use crate::hil::usb::{SetupData, Speed};
use crate::ErrorCode;

/// State of a root port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkState {
    Detached,
    /// A connect was seen; the line state is being debounced.
    AttachDetecting,
    /// A device is connected at the given speed but not yet reset.
    Attached(Speed),
    Resetting,
    /// Reset finished; the port runs at the negotiated speed.
    Active(Speed),
    Suspended,
    Resuming,
}

impl LinkState {
    pub fn speed(&self) -> Option<Speed> {
        match self {
            LinkState::Attached(speed) | LinkState::Active(speed) => Some(*speed),
            _ => None,
        }
    }
}

/// Receives port level events.
pub trait LinkClient {
    fn attached(&self, port: usize, speed: Speed);
    fn detached(&self, port: usize);
    fn reset_complete(&self, port: usize, speed: Speed);
    fn suspended(&self, port: usize);
    fn resumed(&self, port: usize);
    fn overcurrent(&self, port: usize);
}

/// Root port control for a host controller.
pub trait UsbHost<'a> {
    fn set_link_client(&self, client: &'a dyn LinkClient);

    fn link_state(&self, port: usize) -> LinkState;

    /// Drive a bus reset and return the negotiated speed. Blocks for the reset
    /// and recovery intervals.
    fn port_reset(&self, port: usize) -> Result<Speed, ErrorCode>;

    fn port_suspend(&self, port: usize) -> Result<(), ErrorCode>;

    fn port_resume(&self, port: usize) -> Result<(), ErrorCode>;

    /// Run link work queued by the interrupt handler: attach debouncing and
    /// resume after a remote wakeup. Call from the main loop.
    fn service_link_events(&self);

    /// Run a control transfer to `device` on the default pipe. `buffer` holds
    /// the data stage, if any. The result is reported to pipe 0's client.
    fn control_transfer(
        &self,
        device: u8,
        setup: SetupData,
        buffer: &'static mut [u8],
    ) -> Result<(), (ErrorCode, &'static mut [u8])>;
}
