// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pathway context propagation across process boundaries.
//!
//! ```text
//! Producer                               Consumer
//!   checkpoint (direction:out)             extract (carrier -> PathwayContext)
//!     ↓                                      ↓
//!   inject (PathwayContext -> carrier)     checkpoint (direction:in)
//!     ↓                                      ↓
//!   message headers  ───────────────────▶  message headers
//! ```
//!
//! Binary-capable carriers receive the raw encoded context under `dd-pathway-ctx`; text carriers
//! receive it base64-encoded under `dd-pathway-ctx-base64`. Extraction prefers the binary key.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

use crate::constants::{PROPAGATION_KEY, PROPAGATION_KEY_BASE64};
use crate::errors::PathwayError;
use crate::hash::WellKnownTags;
use crate::pathway::PathwayContext;
use crate::sampler::InjectionSampler;
use crate::time_source::TimeSource;
use carrier::{Extractor, Injector};

pub mod carrier;

pub struct DataStreamsPropagator {
    time_source: Arc<dyn TimeSource>,
    well_known_tags: Arc<WellKnownTags>,
    sampler: InjectionSampler,
}

impl DataStreamsPropagator {
    #[must_use]
    pub fn new(
        time_source: Arc<dyn TimeSource>,
        well_known_tags: Arc<WellKnownTags>,
        sampler: InjectionSampler,
    ) -> Self {
        Self {
            time_source,
            well_known_tags,
            sampler,
        }
    }

    /// Reads the upstream pathway context, if any.
    ///
    /// A missing key means there is no upstream pathway. A malformed value is logged and treated
    /// the same way, so callers always fall back to starting a fresh pathway.
    pub fn extract<E: Extractor + ?Sized>(&self, carrier: &E) -> Option<PathwayContext> {
        let encoded = match carrier.get_binary(PROPAGATION_KEY) {
            Some(bytes) => bytes.to_vec(),
            None => {
                let value = carrier.get(PROPAGATION_KEY_BASE64)?;
                match STANDARD.decode(value) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        debug!("Invalid base64 pathway context: {e}");
                        return None;
                    }
                }
            }
        };

        match PathwayContext::decode(
            &encoded,
            Arc::clone(&self.time_source),
            Arc::clone(&self.well_known_tags),
        ) {
            Ok(context) => Some(context),
            Err(e) => {
                debug!("{e}");
                None
            }
        }
    }

    /// Writes the context into the carrier.
    ///
    /// # Errors
    ///
    /// `PathwayError::NotStarted` if no checkpoint was recorded on `context` yet.
    pub fn inject<I: Injector + ?Sized>(
        &self,
        context: &PathwayContext,
        carrier: &mut I,
    ) -> Result<(), PathwayError> {
        let encoded = context.encode()?;
        if !carrier.set_binary(PROPAGATION_KEY, encoded.clone()) {
            carrier.set(PROPAGATION_KEY_BASE64, STANDARD.encode(encoded));
        }
        Ok(())
    }

    /// Like [`inject`](Self::inject), but only when the sampler selects `id`.
    /// Returns whether the context was injected.
    ///
    /// # Errors
    ///
    /// `PathwayError::NotStarted` if the id is sampled and `context` has no checkpoint yet.
    pub fn inject_sampled<I: Injector + ?Sized>(
        &self,
        context: &PathwayContext,
        carrier: &mut I,
        id: u64,
    ) -> Result<bool, PathwayError> {
        if !self.sampler.sample(id) {
            return Ok(false);
        }
        self.inject(context, carrier)?;
        Ok(true)
    }
}
