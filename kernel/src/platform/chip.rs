// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Interfaces for chips.

/// Interface for handling interrupts on a hardware chip.
///
/// Each chip (or chip version) implements this trait to handle specific
/// interrupts. When an interrupt (identified by number) has triggered and
/// should be handled, the implementation of this trait will be called with the
/// interrupt number. The implementation can then handle the interrupt, or
/// return `false` to signify that it does not know how to handle the interrupt.
///
/// Interrupt numbers are passed "top-down": the most specific object gets the
/// interrupt first and, if it cannot service it, forwards it to the next more
/// generic object it holds a reference to. A peripheral with several interrupt
/// lines, such as a USB controller with one line for the controller and one
/// per DMA channel, can therefore be serviced by its own `InterruptService`
/// that a chip chains in front of its base handler.
pub trait InterruptService {
    /// Service an interrupt, if supported by this chip. If this interrupt
    /// number is not supported, return false.
    ///
    /// # Safety
    ///
    /// Must only be called from the kernel's interrupt bottom half, never
    /// re-entered for the same interrupt number.
    unsafe fn service_interrupt(&self, interrupt: u32) -> bool;
}
