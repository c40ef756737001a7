// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Serialization of flushed buckets.
//!
//! One flush becomes one MessagePack map:
//!
//! ```text
//! Env, Service, Lang, PrimaryTag?, TracerVersion, Version?
//! Stats: [ { Start, Duration,
//!            Stats:    [ { EdgeTags?, Hash, ParentHash, PathwayLatency, EdgeLatency, PayloadSize } ],
//!            Backlogs: [ { Tags, Value } ] } ]
//! ```
//!
//! Histograms are opaque binary blobs. `EdgeTags` is left out entirely for the first node of a
//! pathway, which carries no edge tags.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::constants::{LANGUAGE, TRACER_VERSION};
use crate::errors::PayloadError;
use crate::hash::WellKnownTags;
use crate::sink::Sink;
use crate::stats::{StatsBucket, StatsGroup};

#[async_trait]
pub trait DatastreamsPayloadWriter: Send + Sync {
    /// Serializes the buckets and hands them to the sink. Nothing is sent for an empty batch.
    ///
    /// # Errors
    ///
    /// Serialization or delivery failed; the batch is lost.
    async fn write_payload(&self, buckets: Vec<StatsBucket>) -> Result<(), PayloadError>;
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct StatsPayload<'a> {
    env: &'a str,
    service: &'a str,
    lang: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    primary_tag: Option<&'a str>,
    tracer_version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'a str>,
    stats: Vec<BucketPayload<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct BucketPayload<'a> {
    start: i64,
    duration: i64,
    stats: Vec<GroupPayload<'a>>,
    backlogs: Vec<BacklogPayload<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct GroupPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    edge_tags: Option<&'a [String]>,
    hash: u64,
    parent_hash: u64,
    #[serde(with = "serde_bytes")]
    pathway_latency: Vec<u8>,
    #[serde(with = "serde_bytes")]
    edge_latency: Vec<u8>,
    #[serde(with = "serde_bytes")]
    payload_size: Vec<u8>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct BacklogPayload<'a> {
    tags: &'a [String],
    value: i64,
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}

fn group_payload(group: &StatsGroup) -> Result<GroupPayload<'_>, PayloadError> {
    Ok(GroupPayload {
        edge_tags: non_empty_tags(group.edge_tags()),
        hash: group.hash(),
        parent_hash: group.parent_hash(),
        pathway_latency: group.pathway_latency().serialize()?,
        edge_latency: group.edge_latency().serialize()?,
        payload_size: group.payload_size().serialize()?,
    })
}

fn non_empty_tags(tags: &[String]) -> Option<&[String]> {
    (!tags.is_empty()).then_some(tags)
}

pub struct MsgPackPayloadWriter {
    sink: Arc<dyn Sink>,
    well_known_tags: Arc<WellKnownTags>,
}

impl MsgPackPayloadWriter {
    #[must_use]
    pub fn new(sink: Arc<dyn Sink>, well_known_tags: Arc<WellKnownTags>) -> Self {
        Self {
            sink,
            well_known_tags,
        }
    }

    /// # Errors
    ///
    /// `PayloadError::Serialize` if a histogram or the envelope cannot be encoded.
    pub fn encode(&self, buckets: &[StatsBucket]) -> Result<Vec<u8>, PayloadError> {
        let tags = &self.well_known_tags;
        let stats = buckets
            .iter()
            .map(|bucket| -> Result<BucketPayload, PayloadError> {
                Ok(BucketPayload {
                    start: bucket.start_time_nanos(),
                    duration: bucket.duration_nanos(),
                    stats: bucket
                        .groups()
                        .map(group_payload)
                        .collect::<Result<Vec<_>, PayloadError>>()?,
                    backlogs: bucket
                        .backlogs()
                        .iter()
                        .map(|(tags, value)| BacklogPayload {
                            tags,
                            value: *value,
                        })
                        .collect(),
                })
            })
            .collect::<Result<Vec<_>, PayloadError>>()?;

        let payload = StatsPayload {
            env: &tags.env,
            service: &tags.service,
            lang: LANGUAGE,
            primary_tag: non_empty(&tags.primary_tag),
            tracer_version: TRACER_VERSION,
            version: non_empty(&tags.version),
            stats,
        };
        rmp_serde::to_vec_named(&payload).map_err(|e| PayloadError::Serialize(e.to_string()))
    }
}

#[async_trait]
impl DatastreamsPayloadWriter for MsgPackPayloadWriter {
    async fn write_payload(&self, buckets: Vec<StatsBucket>) -> Result<(), PayloadError> {
        if buckets.is_empty() {
            return Ok(());
        }
        let payload = self.encode(&buckets)?;
        debug!(
            "Writing data streams payload: {} buckets, {} bytes",
            buckets.len(),
            payload.len()
        );
        self.sink.accept(buckets.len(), payload).await?;
        Ok(())
    }
}
