// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Support for in-kernel debugging.
//!
//! For printing, this module provides `debug!` and `debug_verbose!`, which
//! format with `core::fmt` and hand the text to the writer the board registered
//! with [`set_debug_writer`]. Until a board registers one, messages are
//! dropped.
//!
//! ```ignore
//! let pipe = 3;
//! debug!("pipe {} stalled", pipe);
//! // Prints 'pipe 3 stalled'
//!
//! debug_verbose!("port clear timed out");
//! // Prints 'TOCK_DEBUG(0): chips/usbip/src/pipe.rs:250: port clear timed out'
//! ```

use core::cell::Cell;
use core::fmt::{self, write, Arguments, Write};

/// Byte sink for debug output, typically a board's polled UART.
pub trait IoWrite {
    /// Write `buf` and return the number of bytes accepted.
    fn write(&self, buf: &[u8]) -> usize;
}

struct DebugWriterSlot {
    writer: Cell<Option<&'static dyn IoWrite>>,
    count: Cell<usize>,
}

// SAFETY: the kernel runs on a single thread; interrupt handlers only set flags
// and the debug writer is used from the main loop.
unsafe impl Sync for DebugWriterSlot {}

static DEBUG_WRITER: DebugWriterSlot = DebugWriterSlot {
    writer: Cell::new(None),
    count: Cell::new(0),
};

/// Register the sink that `debug!` writes to.
///
/// # Safety
///
/// Must be called during board setup, before any interrupt handler or other
/// execution context can emit debug output.
pub unsafe fn set_debug_writer(writer: &'static dyn IoWrite) {
    DEBUG_WRITER.writer.set(Some(writer));
}

struct WriterAdapter<'a>(&'a dyn IoWrite);

impl Write for WriterAdapter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();
        while !bytes.is_empty() {
            let written = self.0.write(bytes);
            if written == 0 {
                return Err(fmt::Error);
            }
            bytes = &bytes[written.min(bytes.len())..];
        }
        Ok(())
    }
}

/// Format `args` followed by a line ending into `writer`.
pub fn write_line(writer: &dyn IoWrite, args: Arguments) -> fmt::Result {
    let mut adapter = WriterAdapter(writer);
    write(&mut adapter, args)?;
    adapter.write_str("\r\n")
}

#[doc(hidden)]
pub fn debug_println(args: Arguments) {
    if let Some(writer) = DEBUG_WRITER.writer.get() {
        let _ = write_line(writer, args);
    }
}

#[doc(hidden)]
pub fn debug_verbose_println(args: Arguments, file_line: &(&'static str, u32)) {
    if let Some(writer) = DEBUG_WRITER.writer.get() {
        let count = DEBUG_WRITER.count.get();
        DEBUG_WRITER.count.set(count.wrapping_add(1));
        let (file, line) = *file_line;
        let mut adapter = WriterAdapter(writer);
        let _ = write(
            &mut adapter,
            format_args!("TOCK_DEBUG({}): {}:{}: ", count, file, line),
        );
        let _ = write_line(writer, args);
    }
}

/// In-kernel `println()` debugging.
#[macro_export]
macro_rules! debug {
    () => ({
        // Allow an empty debug!() to print the location when hit
        $crate::debug!("")
    });
    ($msg:expr $(,)?) => ({
        $crate::debug::debug_println(format_args!($msg));
    });
    ($fmt:expr, $($arg:tt)+) => ({
        $crate::debug::debug_println(format_args!($fmt, $($arg)+));
    });
}

/// In-kernel `println()` debugging that includes the source location and a
/// running message count.
#[macro_export]
macro_rules! debug_verbose {
    () => ({
        // Allow an empty debug_verbose!() to print the location when hit
        $crate::debug_verbose!("")
    });
    ($msg:expr $(,)?) => ({
        $crate::debug::debug_verbose_println(format_args!($msg), {
            static _FILE_LINE: (&'static str, u32) = (file!(), line!());
            &_FILE_LINE
        })
    });
    ($fmt:expr, $($arg:tt)+) => ({
        $crate::debug::debug_verbose_println(format_args!($fmt, $($arg)+), {
            static _FILE_LINE: (&'static str, u32) = (file!(), line!());
            &_FILE_LINE
        })
    });
}
