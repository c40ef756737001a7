// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-topic schema sampling.
//!
//! Extracting a message schema is expensive, so each topic gets at most one sample per interval.
//! A sample carries the number of messages seen since the previous one as its weight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::constants::SCHEMA_SAMPLE_INTERVAL_MILLIS;

#[derive(Debug, Default)]
pub struct SchemaSampler {
    weight: AtomicU32,
    last_sample_millis: Mutex<Option<i64>>,
}

impl SchemaSampler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn interval_elapsed(last: Option<i64>, now_millis: i64) -> bool {
        last.map_or(true, |last| now_millis >= last + SCHEMA_SAMPLE_INTERVAL_MILLIS)
    }

    /// Counts one message and, if the interval has elapsed, returns the accumulated weight and
    /// starts a new interval. Returns 0 when this message should not be sampled.
    pub fn try_sample(&self, now_millis: i64) -> u32 {
        self.weight.fetch_add(1, Ordering::SeqCst);
        let mut last = self
            .last_sample_millis
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !Self::interval_elapsed(*last, now_millis) {
            return 0;
        }
        *last = Some(now_millis);
        self.weight.swap(0, Ordering::SeqCst)
    }

    #[must_use]
    pub fn can_sample(&self, now_millis: i64) -> bool {
        let last = self
            .last_sample_millis
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Self::interval_elapsed(*last, now_millis)
    }
}

/// Lazily created samplers, one per topic.
#[derive(Debug, Default)]
pub struct SchemaSamplers {
    by_topic: Mutex<HashMap<String, Arc<SchemaSampler>>>,
}

impl SchemaSamplers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sampler(&self, topic: &str) -> Arc<SchemaSampler> {
        let mut by_topic = self.by_topic.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(by_topic.entry(topic.to_string()).or_default())
    }

    pub fn try_sample(&self, topic: &str, now_millis: i64) -> u32 {
        self.sampler(topic).try_sample(now_millis)
    }

    #[must_use]
    pub fn can_sample(&self, topic: &str, now_millis: i64) -> bool {
        self.sampler(topic).can_sample(now_millis)
    }
}
