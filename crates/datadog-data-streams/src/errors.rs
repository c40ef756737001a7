// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the data streams pipeline.
//!
//! Most of these never reach instrumentation code: decode failures become "no context",
//! aggregation failures are logged by the consumer and the item is skipped, sink failures
//! drop the payload. They exist so each layer can report precisely what went wrong.

use thiserror::Error;

/// Errors raised by pathway context encoding and decoding.
#[derive(Debug, Error)]
pub enum PathwayError {
    /// `encode` was called before the first checkpoint. This is a programming error.
    #[error("Pathway context is not started")]
    NotStarted,

    #[error("Failed to encode pathway context: {0}")]
    Encode(String),

    #[error("Failed to decode pathway context: {0}")]
    Decode(String),
}

/// Errors raised while bucketing a single inbox item.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregationError {
    #[error("Negative timestamp {0}ns cannot be bucketed")]
    NegativeTimestamp(i64),

    #[error("Negative {kind} latency {value}ns")]
    NegativeLatency { kind: &'static str, value: i64 },

    #[error("Bucket duration must be positive")]
    InvalidBucketDuration,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Failed to serialize payload: {0}")]
    Serialize(String),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to compress payload: {0}")]
    Compression(String),

    #[error("Failed to reach agent: {0}")]
    Transport(String),

    #[error("Agent rejected payload with status {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Errors surfaced by the monitoring service lifecycle.
#[derive(Debug, Error)]
pub enum MonitoringError {
    #[error("Data streams monitoring already started")]
    AlreadyStarted,

    #[error("Data streams monitoring is not running")]
    NotRunning,

    #[error("Failed to send command to data streams consumer: {0}")]
    Send(String),

    #[error("Timed out waiting for data streams consumer to stop")]
    ShutdownTimeout,

    #[error("Data streams consumer task failed: {0}")]
    Join(String),

    #[error("Failed to build agent client: {0}")]
    Client(String),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}
