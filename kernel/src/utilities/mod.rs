// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Utility functions and macros provided by the kernel crate.

mod static_ref;
pub use self::static_ref::StaticRef;

/// The Tock Register Interface.
///
/// This is a re-export of the `tock-register-interface` crate provided for
/// convenience.
///
/// Drivers use the bitfield definitions and the local register copies; the
/// access path to the hardware is left to each driver.
pub mod registers {
    pub use tock_registers::fields::{Field, FieldValue};
    pub use tock_registers::register_bitfields;
    pub use tock_registers::{LocalRegisterCopy, RegisterLongName, UIntLike};
}

/// The Tock `Cell` types.
///
/// This is a re-export of the `tock-cells` crate provided for convenience.
pub mod cells {
    pub use tock_cells::optional_cell::OptionalCell;
    pub use tock_cells::take_cell::TakeCell;
}
