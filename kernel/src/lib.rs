// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Core kernel support for the USB controller drivers.
//!
//! This crate holds the pieces of the Tock kernel that chip drivers in this
//! workspace build on: the Hardware Interface Layer (HIL) traits, the standard
//! `ErrorCode`, cell types for interior mutability, the register interface
//! re-exports and the `debug!` facility.
//!
//! Most `unsafe` code is in this kernel crate.

#![warn(unreachable_pub)]
#![no_std]

pub mod debug;
pub mod errorcode;
pub mod hil;
pub mod platform;
pub mod utilities;

pub use crate::errorcode::ErrorCode;
