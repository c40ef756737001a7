// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Clock abstraction.
//!
//! Pathway timing mixes two clocks: wall-clock nanoseconds, which are comparable across
//! processes and survive serialization, and monotonic ticks, which measure local latencies
//! without being affected by wall-clock adjustments.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::constants::NANOS_PER_MILLI;

pub trait TimeSource: Send + Sync {
    /// Monotonic ticks in nanoseconds. The origin is arbitrary and process-local.
    fn nano_ticks(&self) -> i64;

    /// Wall-clock time in nanoseconds since the Unix epoch.
    fn current_time_nanos(&self) -> i64;

    fn current_time_millis(&self) -> i64 {
        self.current_time_nanos() / NANOS_PER_MILLI
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

fn process_origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

impl TimeSource for SystemTimeSource {
    fn nano_ticks(&self) -> i64 {
        i64::try_from(process_origin().elapsed().as_nanos()).unwrap_or(i64::MAX)
    }

    fn current_time_nanos(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or_default()
    }
}

/// Clock driven by hand. Ticks and wall time advance together.
#[derive(Debug, Default)]
pub struct ControllableTimeSource {
    ticks: AtomicI64,
    wall_nanos: AtomicI64,
}

impl ControllableTimeSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts at the given wall-clock time; ticks start at zero.
    #[must_use]
    pub fn starting_at(wall_nanos: i64) -> Self {
        Self {
            ticks: AtomicI64::new(0),
            wall_nanos: AtomicI64::new(wall_nanos),
        }
    }

    pub fn advance(&self, nanos: i64) {
        self.ticks.fetch_add(nanos, Ordering::SeqCst);
        self.wall_nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Moves both clocks so that wall time equals `wall_nanos`.
    pub fn set(&self, wall_nanos: i64) {
        let delta = wall_nanos - self.wall_nanos.load(Ordering::SeqCst);
        self.advance(delta);
    }
}

impl TimeSource for ControllableTimeSource {
    fn nano_ticks(&self) -> i64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn current_time_nanos(&self) -> i64 {
        self.wall_nanos.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_ticks_are_monotonic() {
        let source = SystemTimeSource;
        let first = source.nano_ticks();
        let second = source.nano_ticks();
        assert!(second >= first);
        assert!(source.current_time_nanos() > 0);
    }

    #[test]
    fn test_controllable_advance_moves_both_clocks() {
        let source = ControllableTimeSource::starting_at(5_000_000);
        source.advance(3_000_000);
        assert_eq!(source.nano_ticks(), 3_000_000);
        assert_eq!(source.current_time_nanos(), 8_000_000);
        assert_eq!(source.current_time_millis(), 8);

        source.set(21);
        assert_eq!(source.current_time_nanos(), 21);
        assert_eq!(source.nano_ticks(), 3_000_000 - 8_000_000 + 21);
    }
}
