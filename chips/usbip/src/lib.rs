// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Driver for the pipe based USB host/peripheral controller IP found on
//! several microcontroller families, in a full-speed (`USB0`) and a
//! high-speed (`USBHS`) instance.

#![no_std]

#[cfg(test)]
extern crate std;

/// Log with `debug!` when the controller's `trace` option is set.
macro_rules! usb_debug {
    ($usb:expr, $($arg:tt)+) => {
        if $usb.config.trace {
            kernel::debug!($($arg)+);
        }
    };
}

pub mod chip;
pub mod config;
pub mod debug;
pub mod device;
pub mod dma;
pub mod fifo;
pub mod host;
pub mod interrupt;
pub mod pipe;
pub mod registers;
pub mod transfer;
pub mod usb;

#[cfg(test)]
mod tests;

pub use crate::config::UsbConfig;
pub use crate::usb::{Mode, Usb};
