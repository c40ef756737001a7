// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Deterministic injection sampling.
//!
//! Decides from an identifier alone whether a pathway is attached to an outgoing carrier, so every
//! process sampling the same id reaches the same decision. The unsigned comparison
//! `hash(id) < rate * 2^64` is expressed on signed integers by shifting both sides by `i64::MIN`.

/// Multiplier used to scatter sequential ids over the 64-bit range.
pub const KNUTH_CONSTANT: u64 = 1_111_111_111_111_111_111;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InjectionSampler {
    rate: f64,
    cutoff: i64,
}

impl InjectionSampler {
    /// `rate` is clamped into `[0, 1]`; NaN never samples.
    #[must_use]
    pub fn new(rate: f64) -> Self {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        Self {
            rate,
            cutoff: Self::cutoff(rate),
        }
    }

    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Signed cutoff equivalent to the unsigned threshold `rate * (2^64 - 1)`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    pub fn cutoff(rate: f64) -> i64 {
        if rate >= 1.0 {
            return i64::MAX;
        }
        // float to int casts saturate, so negative rates land on 0
        let threshold = (rate * u64::MAX as f64) as u64;
        (threshold as i64).wrapping_add(i64::MIN)
    }

    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn sample(&self, id: u64) -> bool {
        let scattered = id.wrapping_mul(KNUTH_CONSTANT) as i64;
        scattered.wrapping_add(i64::MIN) < self.cutoff
    }
}

impl Default for InjectionSampler {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_INJECTION_SAMPLING_RATE)
    }
}
