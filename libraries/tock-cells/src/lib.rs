// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Tock Cell types.
//!
//! Drivers are shared through `&'static` references between the code that
//! submits work and the code that services interrupts, so their state lives in
//! cells. `OptionalCell` holds small `Copy` values that may be absent and
//! `TakeCell` holds borrowed buffers that move in and out of a driver.

#![no_std]

pub mod optional_cell;
pub mod take_cell;
