// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pathway hash chaining.
//!
//! A node is identified by the local service identity plus the edge tags of the checkpoint.
//! The pathway hash of a checkpoint folds the node hash with the hash of the previous
//! checkpoint, so the final value depends on every hop the message went through.

use fnv::FnvHasher;
use std::hash::Hasher;

/// Process-wide tags that identify the local service in every node hash.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WellKnownTags {
    pub service: String,
    pub env: String,
    pub version: String,
    pub primary_tag: String,
}

impl WellKnownTags {
    #[must_use]
    pub fn new(service: &str, env: &str, version: &str, primary_tag: &str) -> Self {
        Self {
            service: service.to_string(),
            env: env.to_string(),
            version: version.to_string(),
            primary_tag: primary_tag.to_string(),
        }
    }
}

/// Hash of the local service identity and the edge tags, in order.
#[must_use]
pub fn node_hash(tags: &WellKnownTags, edge_tags: &[String]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(tags.service.as_bytes());
    hasher.write(tags.env.as_bytes());
    hasher.write(tags.primary_tag.as_bytes());
    for tag in edge_tags {
        hasher.write(tag.as_bytes());
    }
    hasher.finish()
}

/// Chains a node hash onto its parent pathway hash.
#[must_use]
pub fn pathway_hash(node_hash: u64, parent_hash: u64) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(&node_hash.to_le_bytes());
    hasher.write(&parent_hash.to_le_bytes());
    hasher.finish()
}
