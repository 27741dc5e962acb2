// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Hardware agnostic interfaces for time and timers.
//!
//! `Alarm` is the interrupt-driven primitive: a client asks to be called back
//! once a wrapping counter has advanced by some number of ticks. `Delay` is
//! the blocking primitive and must only be used in caller context, never from
//! an interrupt handler.

use crate::ErrorCode;

/// Trait to represent clock frequency in Hz.
///
/// This trait is used as an associated type for `Time` so clients can portably
/// convert native cycles to real-time values.
pub trait Frequency {
    /// Returns frequency in Hz.
    fn frequency() -> u32;
}

/// 16MHz `Frequency`
#[derive(Debug)]
pub struct Freq16MHz;
impl Frequency for Freq16MHz {
    fn frequency() -> u32 {
        16_000_000
    }
}

/// 32KHz `Frequency`
#[derive(Debug)]
pub struct Freq32KHz;
impl Frequency for Freq32KHz {
    fn frequency() -> u32 {
        32768
    }
}

/// 1MHz `Frequency`
#[derive(Debug)]
pub struct Freq1MHz;
impl Frequency for Freq1MHz {
    fn frequency() -> u32 {
        1_000_000
    }
}

/// 1KHz `Frequency`
#[derive(Debug)]
pub struct Freq1KHz;
impl Frequency for Freq1KHz {
    fn frequency() -> u32 {
        1000
    }
}

/// A free running, wrapping 32-bit counter.
pub trait Time {
    type Frequency: Frequency;

    /// Returns the current time in hardware clock units.
    fn now(&self) -> u32;

    /// Convert a number of milliseconds into ticks of this clock, saturating
    /// at `u32::MAX`.
    fn ticks_from_ms(&self, ms: u32) -> u32 {
        let ticks = u64::from(ms) * u64::from(Self::Frequency::frequency()) / 1000;
        u32::try_from(ticks).unwrap_or(u32::MAX)
    }

    /// Convert a number of microseconds into ticks of this clock, rounding up
    /// so that a non-zero interval never becomes zero ticks.
    fn ticks_from_us(&self, us: u32) -> u32 {
        let ticks = (u64::from(us) * u64::from(Self::Frequency::frequency())).div_ceil(1_000_000);
        u32::try_from(ticks).unwrap_or(u32::MAX)
    }
}

/// The `Alarm` trait models a wrapping counter capable of notifying when the
/// counter reaches a certain value.
///
/// Implementers use the [`AlarmClient`] trait to signal when the counter has
/// reached the value set with [`Alarm::set_alarm`].
pub trait Alarm<'a>: Time {
    /// Specify the callback for when the counter reaches the alarm value.
    fn set_alarm_client(&self, client: &'a dyn AlarmClient);

    /// Arm a one-shot alarm to fire at `reference + dt`. Passing the current
    /// time as `reference` and an interval as `dt` is the common case. Setting
    /// an alarm while one is armed replaces it.
    ///
    /// ```ignore
    /// let now = alarm.now();
    /// alarm.set_alarm(now, alarm.ticks_from_ms(5));
    /// ```
    fn set_alarm(&self, reference: u32, dt: u32);

    /// Return the tick value at which the armed alarm fires.
    fn get_alarm(&self) -> u32;

    /// Disable the alarm. Returns `FAIL` if the alarm already expired and the
    /// callback will still be delivered.
    fn disarm(&self) -> Result<(), ErrorCode>;

    /// Returns whether the alarm is armed and will eventually call its client.
    fn is_armed(&self) -> bool;
}

/// A client of an implementer of the [`Alarm`] trait.
pub trait AlarmClient {
    /// Callback signaled when the alarm's counter reaches the value set in
    /// [`Alarm::set_alarm`].
    fn alarm(&self);
}

/// Blocking waits.
///
/// Only for code running in caller context, such as a bus reset sequence
/// started by a board or a class driver. Interrupt handlers must use an
/// `Alarm` instead.
pub trait Delay {
    fn delay_us(&self, us: u32);

    fn delay_ms(&self, ms: u32) {
        for _ in 0..ms {
            self.delay_us(1000);
        }
    }
}

/// A `Delay` that spins on a `Time` source.
pub struct BusyWait<'a, T: Time> {
    time: &'a T,
}

impl<'a, T: Time> BusyWait<'a, T> {
    pub const fn new(time: &'a T) -> BusyWait<'a, T> {
        BusyWait { time }
    }
}

impl<T: Time> Delay for BusyWait<'_, T> {
    fn delay_us(&self, us: u32) {
        let ticks = self.time.ticks_from_us(us);
        let start = self.time.now();
        while self.time.now().wrapping_sub(start) < ticks {}
    }
}
