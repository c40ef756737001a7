// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pathway context: the hash-chain state carried by an in-flight message.
//!
//! Every checkpoint folds the local node hash into the running pathway hash and produces a
//! [`StatsPoint`] with the latency since the pathway started and since the previous edge.
//! The context can be encoded into a carrier so the chain continues in the next process.
//!
//! # Variants
//!
//! - **Default**: full behaviour, points are handed to the caller-supplied sink.
//! - **Pruned**: advances the chain like `Default` but keeps the last point as saved stats
//!   instead of emitting it, so it can be emitted later with the real payload size.
//! - **Noop**: data streams disabled; every operation is inert.
//!
//! # Wire format
//!
//! ```text
//! [hash: fixed64 LE][pathway start ms: zigzag varint][edge start ms: zigzag varint]
//! ```
//!
//! Only identity and timing survive serialization. Monotonic tick origins are not comparable
//! across processes, so decoding rebases the decoded wall-clock instants onto the local ticks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use protobuf::{CodedInputStream, CodedOutputStream};

use crate::constants::NANOS_PER_MILLI;
use crate::errors::PathwayError;
use crate::hash::{node_hash, pathway_hash, WellKnownTags};
use crate::time_source::TimeSource;

/// One measurement produced by a checkpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsPoint {
    pub edge_tags: Vec<String>,
    pub hash: u64,
    pub parent_hash: u64,
    pub timestamp_nanos: i64,
    pub pathway_latency_nanos: i64,
    pub edge_latency_nanos: i64,
    pub payload_size_bytes: i64,
}

impl StatsPoint {
    #[must_use]
    pub fn with_payload_size(mut self, payload_size_bytes: i64) -> Self {
        self.payload_size_bytes = payload_size_bytes;
        self
    }
}

/// Coin used when two pathways meet. Injected so tests can make merges deterministic.
pub trait RandomSource: Send + Sync {
    fn next_bool(&self) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FastRandSource;

impl RandomSource for FastRandSource {
    fn next_bool(&self) -> bool {
        fastrand::bool()
    }
}

#[derive(Debug, Default)]
struct PathwayState {
    hash: u64,
    pathway_start_nanos: i64,
    pathway_start_ticks: i64,
    edge_start_ticks: i64,
    started: bool,
    saved_stats: Option<StatsPoint>,
}

impl PathwayState {
    fn edge_start_nanos(&self) -> i64 {
        self.edge_start_ticks
            .saturating_sub(self.pathway_start_ticks)
            .saturating_add(self.pathway_start_nanos)
    }
}

/// Lock-guarded hash-chain state shared by the `Default` and `Pruned` variants.
pub struct DefaultPathwayContext {
    time_source: Arc<dyn TimeSource>,
    well_known_tags: Arc<WellKnownTags>,
    state: Mutex<PathwayState>,
}

impl std::fmt::Debug for DefaultPathwayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("DefaultPathwayContext")
            .field("hash", &state.hash)
            .field("pathway_start_nanos", &state.pathway_start_nanos)
            .field("started", &state.started)
            .finish()
    }
}

impl DefaultPathwayContext {
    fn new(time_source: Arc<dyn TimeSource>, well_known_tags: Arc<WellKnownTags>) -> Self {
        Self {
            time_source,
            well_known_tags,
            state: Mutex::new(PathwayState::default()),
        }
    }

    // A panic while holding the lock leaves plain integers behind, still usable.
    fn lock(&self) -> MutexGuard<'_, PathwayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advances the chain and returns the produced point, still holding the lock so callers
    /// can publish it atomically.
    fn advance(
        &self,
        state: &mut PathwayState,
        edge_tags: Vec<String>,
        default_timestamp_millis: Option<i64>,
        payload_size_bytes: i64,
    ) -> StatsPoint {
        let now_nanos = self.time_source.current_time_nanos();
        let now_ticks = self.time_source.nano_ticks();

        if !state.started {
            match default_timestamp_millis {
                Some(millis) if millis > 0 => {
                    state.pathway_start_nanos = millis.saturating_mul(NANOS_PER_MILLI);
                    state.pathway_start_ticks = now_ticks
                        .saturating_sub(now_nanos.saturating_sub(state.pathway_start_nanos));
                }
                _ => {
                    state.pathway_start_nanos = now_nanos;
                    state.pathway_start_ticks = now_ticks;
                }
            }
            state.edge_start_ticks = state.pathway_start_ticks;
            state.hash = 0;
            state.started = true;
        }

        let parent_hash = state.hash;
        let new_hash = pathway_hash(node_hash(&self.well_known_tags, &edge_tags), parent_hash);
        // Rebased upstream clocks can be slightly ahead of ours.
        let pathway_latency_nanos = now_ticks.saturating_sub(state.pathway_start_ticks).max(0);
        let edge_latency_nanos = now_ticks.saturating_sub(state.edge_start_ticks).max(0);

        state.edge_start_ticks = now_ticks;
        state.hash = new_hash;

        StatsPoint {
            edge_tags,
            hash: new_hash,
            parent_hash,
            timestamp_nanos: now_nanos,
            pathway_latency_nanos,
            edge_latency_nanos,
            payload_size_bytes,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, PathwayError> {
        let state = self.lock();
        if !state.started {
            return Err(PathwayError::NotStarted);
        }
        let pathway_start_millis = state.pathway_start_nanos / NANOS_PER_MILLI;
        let edge_start_millis = state.edge_start_nanos() / NANOS_PER_MILLI;

        let to_error = |e: protobuf::Error| PathwayError::Encode(e.to_string());
        let mut buf = Vec::with_capacity(24);
        {
            let mut os = CodedOutputStream::vec(&mut buf);
            os.write_fixed64_no_tag(state.hash).map_err(to_error)?;
            os.write_sint64_no_tag(pathway_start_millis)
                .map_err(to_error)?;
            os.write_sint64_no_tag(edge_start_millis).map_err(to_error)?;
            os.flush().map_err(to_error)?;
        }
        Ok(buf)
    }

    fn decode(
        bytes: &[u8],
        time_source: Arc<dyn TimeSource>,
        well_known_tags: Arc<WellKnownTags>,
    ) -> Result<Self, PathwayError> {
        let to_error = |e: protobuf::Error| PathwayError::Decode(e.to_string());
        let mut is = CodedInputStream::from_bytes(bytes);
        let hash = is.read_fixed64().map_err(to_error)?;
        let pathway_start_millis = is.read_sint64().map_err(to_error)?;
        let edge_start_millis = is.read_sint64().map_err(to_error)?;

        let now_nanos = time_source.current_time_nanos();
        let now_ticks = time_source.nano_ticks();
        // Instants that cannot be placed on the local tick line are malformed input.
        let out_of_range =
            |millis: i64| PathwayError::Decode(format!("timestamp {millis}ms out of range"));
        let to_ticks = |millis: i64| -> Result<(i64, i64), PathwayError> {
            let nanos = millis
                .checked_mul(NANOS_PER_MILLI)
                .ok_or_else(|| out_of_range(millis))?;
            let ticks = now_nanos
                .checked_sub(nanos)
                .and_then(|elapsed| now_ticks.checked_sub(elapsed))
                .ok_or_else(|| out_of_range(millis))?;
            Ok((nanos, ticks))
        };
        let (pathway_start_nanos, pathway_start_ticks) = to_ticks(pathway_start_millis)?;
        let (_, edge_start_ticks) = to_ticks(edge_start_millis)?;

        let state = PathwayState {
            hash,
            pathway_start_nanos,
            pathway_start_ticks,
            edge_start_ticks,
            started: true,
            saved_stats: None,
        };
        Ok(Self {
            time_source,
            well_known_tags,
            state: Mutex::new(state),
        })
    }
}

#[derive(Debug)]
pub enum PathwayContext {
    Default(DefaultPathwayContext),
    Pruned(DefaultPathwayContext),
    Noop,
}

impl PathwayContext {
    /// A fresh, unstarted context.
    #[must_use]
    pub fn new(time_source: Arc<dyn TimeSource>, well_known_tags: Arc<WellKnownTags>) -> Self {
        Self::Default(DefaultPathwayContext::new(time_source, well_known_tags))
    }

    /// A fresh context that keeps its points as saved stats instead of emitting them.
    #[must_use]
    pub fn pruned(time_source: Arc<dyn TimeSource>, well_known_tags: Arc<WellKnownTags>) -> Self {
        Self::Pruned(DefaultPathwayContext::new(time_source, well_known_tags))
    }

    #[must_use]
    pub fn noop() -> Self {
        Self::Noop
    }

    fn inner(&self) -> Option<&DefaultPathwayContext> {
        match self {
            Self::Default(inner) | Self::Pruned(inner) => Some(inner),
            Self::Noop => None,
        }
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner().is_some_and(|inner| inner.lock().started)
    }

    /// Current pathway hash, 0 until the first checkpoint.
    #[must_use]
    pub fn hash(&self) -> u64 {
        self.inner().map_or(0, |inner| inner.lock().hash)
    }

    #[must_use]
    pub fn pathway_start_nanos(&self) -> Option<i64> {
        let inner = self.inner()?;
        let state = inner.lock();
        state.started.then_some(state.pathway_start_nanos)
    }

    /// Wall-clock time of the last edge, derived from the monotonic edge start.
    #[must_use]
    pub fn edge_start_nanos(&self) -> Option<i64> {
        let inner = self.inner()?;
        let state = inner.lock();
        state.started.then(|| state.edge_start_nanos())
    }

    /// Records a checkpoint.
    ///
    /// `default_timestamp_millis` only matters for the first checkpoint: when set, the pathway is
    /// considered to have started at that wall-clock time (e.g. a broker-assigned message
    /// timestamp) rather than now.
    ///
    /// The sink is invoked while the context lock is held; it must not block.
    pub fn set_checkpoint<F>(
        &self,
        edge_tags: Vec<String>,
        sink: F,
        default_timestamp_millis: Option<i64>,
        payload_size_bytes: i64,
    ) where
        F: FnOnce(StatsPoint),
    {
        match self {
            Self::Default(inner) => {
                let mut state = inner.lock();
                let point = inner.advance(
                    &mut state,
                    edge_tags,
                    default_timestamp_millis,
                    payload_size_bytes,
                );
                sink(point);
            }
            Self::Pruned(inner) => {
                let mut state = inner.lock();
                let point = inner.advance(
                    &mut state,
                    edge_tags,
                    default_timestamp_millis,
                    payload_size_bytes,
                );
                state.saved_stats = Some(point);
            }
            Self::Noop => {}
        }
    }

    /// Takes the point kept by the last checkpoint of a pruned context.
    #[must_use]
    pub fn take_saved_stats(&self) -> Option<StatsPoint> {
        match self {
            Self::Pruned(inner) => inner.lock().saved_stats.take(),
            _ => None,
        }
    }

    /// Serializes identity and timing.
    ///
    /// # Errors
    ///
    /// `PathwayError::NotStarted` if no checkpoint was recorded yet (always for `Noop`).
    pub fn encode(&self) -> Result<Vec<u8>, PathwayError> {
        match self.inner() {
            Some(inner) => inner.encode(),
            None => Err(PathwayError::NotStarted),
        }
    }

    /// Rebuilds a started `Default` context from its encoded form.
    ///
    /// # Errors
    ///
    /// `PathwayError::Decode` when the input is truncated or malformed.
    pub fn decode(
        bytes: &[u8],
        time_source: Arc<dyn TimeSource>,
        well_known_tags: Arc<WellKnownTags>,
    ) -> Result<Self, PathwayError> {
        DefaultPathwayContext::decode(bytes, time_source, well_known_tags).map(Self::Default)
    }
}

/// Combines two pathways meeting at a fan-in.
///
/// Unsynchronized on purpose: pathway tracking is a statistical signal, so a uniform coin flip
/// picks which pathway continues. An unstarted current context always yields to `other`.
#[must_use]
pub fn merge_pathway_contexts(
    current: Option<Arc<PathwayContext>>,
    other: Arc<PathwayContext>,
    random: &dyn RandomSource,
) -> Arc<PathwayContext> {
    match current {
        Some(current) if current.is_started() && random.next_bool() => current,
        _ => other,
    }
}
