// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Interface to USB controller hardware.
//!
//! A controller exposes numbered pipes. Pipe 0 is always the default control
//! pipe. Other pipes are bound to one endpoint with [`UsbPipes::configure_pipe`]
//! and then move data with [`UsbPipes::read`] and [`UsbPipes::write`]. Every
//! accepted submission ends with exactly one call to
//! [`TransferClient::transfer_done`], which hands the buffer back.
//!
//! The peripheral-side control request sequencing is reported to a [`Client`].

use crate::ErrorCode;

/// USB transfer types.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Endpoint direction, named from the host's point of view as USB does.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Device to host.
    In,
    /// Host to device.
    Out,
}

/// Bus speed of a port or attached device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Speed {
    Low,
    Full,
    High,
}

/// Static properties of a pipe.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PipeConfig {
    pub transfer_type: TransferType,
    pub direction: Direction,
    /// Endpoint number, 0-15.
    pub endpoint: u8,
    pub max_packet_size: u16,
    /// Address of the target device in host mode, `None` in peripheral mode.
    pub device_address: Option<u8>,
    /// Polling interval exponent for interrupt and isochronous pipes.
    pub interval: u8,
}

impl PipeConfig {
    pub const fn bulk(direction: Direction, endpoint: u8, max_packet_size: u16) -> PipeConfig {
        PipeConfig {
            transfer_type: TransferType::Bulk,
            direction,
            endpoint,
            max_packet_size,
            device_address: None,
            interval: 0,
        }
    }

    pub const fn with_device(mut self, address: u8) -> PipeConfig {
        self.device_address = Some(address);
        self
    }

    pub const fn with_type(mut self, transfer_type: TransferType, interval: u8) -> PipeConfig {
        self.transfer_type = transfer_type;
        self.interval = interval;
        self
    }
}

/// How a transfer ended.
///
/// `Complete` and `ShortPacket` are the normal outcomes of USB's packet
/// framing; every other status is an error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    /// The requested number of bytes moved.
    Complete,
    /// A packet shorter than the max packet size ended a read early.
    ShortPacket,
    /// The device sent more data than the buffer could hold. The buffer holds
    /// the data that fit; the rest was discarded.
    Overrun,
    /// The other side answered with STALL.
    Stalled,
    /// Too many consecutive NAK responses.
    NotReadyExceeded,
    /// The transfer was cancelled with [`UsbPipes::stop`].
    Stopped,
    /// The FIFO port could not be cleared. The pipe must be reconfigured
    /// before it is used again.
    PortWedged,
}

impl TransferStatus {
    pub fn is_error(&self) -> bool {
        !matches!(self, TransferStatus::Complete | TransferStatus::ShortPacket)
    }
}

/// Receives the result of transfers on a pipe.
pub trait TransferClient {
    /// Called exactly once per accepted submission. `length` is the number of
    /// bytes moved.
    fn transfer_done(
        &self,
        pipe: usize,
        buffer: &'static mut [u8],
        length: usize,
        status: TransferStatus,
    );
}

/// Pipe level data movement.
pub trait UsbPipes<'a> {
    /// Bind `pipe` to an endpoint and set the client for its transfers.
    ///
    /// Returns `BUSY` if a transfer is outstanding on the pipe, `INVAL` if the
    /// configuration does not fit the pipe.
    fn configure_pipe(
        &self,
        pipe: usize,
        config: PipeConfig,
        client: &'a dyn TransferClient,
    ) -> Result<(), ErrorCode>;

    /// Disable the pipe and mark it free. Releasing an idle pipe does nothing.
    fn release_pipe(&self, pipe: usize);

    /// Receive up to `length` bytes into `buffer`.
    ///
    /// A second submission while one is outstanding fails with `BUSY`.
    fn read(
        &self,
        pipe: usize,
        buffer: &'static mut [u8],
        length: usize,
    ) -> Result<(), (ErrorCode, &'static mut [u8])>;

    /// Send the first `length` bytes of `buffer`.
    fn write(
        &self,
        pipe: usize,
        buffer: &'static mut [u8],
        length: usize,
    ) -> Result<(), (ErrorCode, &'static mut [u8])>;

    /// Cancel the outstanding transfer, if any. The client is called with
    /// `Stopped` before this returns. Stopping an idle pipe does nothing.
    fn stop(&self, pipe: usize);
}

/// The 8-byte SETUP packet of a control transfer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SetupData {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupData {
    /// Whether the data stage, if any, moves data from device to host.
    pub fn is_device_to_host(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    pub fn has_data_stage(&self) -> bool {
        self.length != 0
    }

    /// The `bmRequestType`/`bRequest` pair packed as the controller's request
    /// register holds it.
    pub fn request_word(&self) -> u16 {
        u16::from(self.request_type) | (u16::from(self.request) << 8)
    }

    pub fn from_registers(request: u16, value: u16, index: u16, length: u16) -> SetupData {
        SetupData {
            request_type: request as u8,
            request: (request >> 8) as u8,
            value,
            index,
            length,
        }
    }
}

/// Answer of a peripheral client to a SETUP packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CtrlSetupResult {
    /// The request is handled. For requests with a data stage the client
    /// submits the data on pipe 0.
    Accept,
    /// The request is not supported; answer with STALL.
    Stall,
}

/// Peripheral mode client interface.
pub trait Client {
    fn bus_reset(&self, speed: Speed);
    fn address_assigned(&self, address: u8);
    fn configured(&self);
    fn suspended(&self);
    fn resumed(&self);

    /// A SETUP packet arrived on the default control pipe.
    fn ctrl_setup(&self, setup: SetupData) -> CtrlSetupResult;

    /// The status stage of the current control request finished, or the
    /// request was aborted.
    fn ctrl_status_complete(&self, status: TransferStatus);
}
