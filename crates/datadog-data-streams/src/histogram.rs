// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log-scale histogram backed by DDSketch.
//!
//! Callers only add samples and take the serialized bytes; the encoding is the MessagePack form
//! of the sketch and is never inspected on this side.

use sketches_ddsketch::{Config, DDSketch};

use crate::errors::PayloadError;

pub struct LogHistogram {
    sketch: DDSketch,
}

impl std::fmt::Debug for LogHistogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogHistogram")
            .field("count", &self.sketch.count())
            .finish()
    }
}

impl Default for LogHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LogHistogram {
    /// 1% relative accuracy, smallest distinguishable value of one nanosecond in seconds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sketch: DDSketch::new(Config::defaults()),
        }
    }

    pub fn accept(&mut self, value: f64) {
        self.sketch.add(value);
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sketch.count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    #[must_use]
    pub fn quantile(&self, q: f64) -> Option<f64> {
        self.sketch.quantile(q).ok().flatten()
    }

    /// # Errors
    ///
    /// `PayloadError::Serialize` if the sketch cannot be encoded.
    pub fn serialize(&self) -> Result<Vec<u8>, PayloadError> {
        rmp_serde::to_vec_named(&self.sketch).map_err(|e| PayloadError::Serialize(e.to_string()))
    }

    /// # Errors
    ///
    /// `PayloadError::Serialize` if the bytes are not a serialized sketch.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, PayloadError> {
        let sketch = rmp_serde::from_slice::<DDSketch>(bytes)
            .map_err(|e| PayloadError::Serialize(e.to_string()))?;
        Ok(Self { sketch })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_histogram() {
        let histogram = LogHistogram::new();
        assert!(histogram.is_empty());
        assert_eq!(histogram.quantile(0.5), None);
    }

    #[test]
    fn test_accept_and_quantile() {
        let mut histogram = LogHistogram::new();
        for value in 1..=100 {
            histogram.accept(f64::from(value));
        }
        assert_eq!(histogram.count(), 100);
        let median = histogram.quantile(0.5).unwrap();
        assert!((median - 50.0).abs() / 50.0 < 0.03, "median {median}");
    }

    #[test]
    fn test_serialized_sketch_is_restorable() {
        let mut histogram = LogHistogram::new();
        histogram.accept(100.0);
        let restored = LogHistogram::deserialize(&histogram.serialize().unwrap()).unwrap();
        assert_eq!(restored.count(), 1);
        let value = restored.quantile(1.0).unwrap();
        assert!((value - 100.0).abs() < 2.0, "value {value}");
    }
}
