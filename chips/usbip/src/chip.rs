// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Interrupt routing for one controller instance.
//!
//! A chip chains `UsbInterrupts` in front of its base `InterruptService`. The
//! controller has one interrupt line; each DMA channel serving a FIFO port has
//! its own.

use kernel::hil::time::Alarm;
use kernel::platform::chip::InterruptService;

use crate::fifo::FifoPort;
use crate::registers::UsbRegisters;
use crate::usb::Usb;

pub struct UsbInterrupts<'a, R: UsbRegisters, A: Alarm<'a>> {
    usb: &'a Usb<'a, R, A>,
    usb_irq: u32,
    /// Completion interrupts of the channels serving `D0FIFO` and `D1FIFO`.
    dma_irqs: [Option<u32>; 2],
}

impl<'a, R: UsbRegisters, A: Alarm<'a>> UsbInterrupts<'a, R, A> {
    pub fn new(usb: &'a Usb<'a, R, A>, usb_irq: u32, dma_irqs: [Option<u32>; 2]) -> Self {
        UsbInterrupts {
            usb,
            usb_irq,
            dma_irqs,
        }
    }
}

impl<'a, R: UsbRegisters, A: Alarm<'a>> InterruptService for UsbInterrupts<'a, R, A> {
    unsafe fn service_interrupt(&self, interrupt: u32) -> bool {
        if interrupt == self.usb_irq {
            self.usb.handle_interrupt();
            return true;
        }
        for (port, irq) in [FifoPort::D0fifo, FifoPort::D1fifo].iter().zip(self.dma_irqs) {
            if irq == Some(interrupt) {
                self.usb.handle_dma_interrupt(*port);
                return true;
            }
        }
        false
    }
}
