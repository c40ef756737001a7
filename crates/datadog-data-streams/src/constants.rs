// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Carrier key holding the base64 encoded pathway context (text carriers such as HTTP headers).
pub const PROPAGATION_KEY_BASE64: &str = "dd-pathway-ctx-base64";
/// Carrier key holding the raw encoded pathway context (binary carriers such as Kafka headers).
pub const PROPAGATION_KEY: &str = "dd-pathway-ctx";

/// Span tag carrying the current pathway hash.
pub const PATHWAY_HASH_TAG: &str = "pathway.hash";

pub const NANOS_PER_MILLI: i64 = 1_000_000;
pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

pub const DEFAULT_BUCKET_DURATION_NANOS: i64 = 10 * NANOS_PER_SECOND;
/// Capacity of the engine inbox; points offered beyond it are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const FEATURE_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_INJECTION_SAMPLING_RATE: f64 = 0.1;
/// Shortest report tick the scheduler accepts, whatever the bucket duration.
pub const MIN_REPORT_INTERVAL: Duration = Duration::from_millis(1);

/// Default bound on a single payload send and on how long `close` waits for the consumer.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
/// Sink errors are logged at most once per window.
pub const SINK_ERROR_LOG_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub const DATA_STREAMS_ENDPOINT: &str = "v0.1/pipeline_stats";
pub const INFO_ENDPOINT: &str = "info";
pub const DEFAULT_AGENT_HOST: &str = "localhost";
pub const DEFAULT_AGENT_PORT: u16 = 8126;

pub const LANGUAGE: &str = "rust";
pub const TRACER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Schemas are sampled at most once per interval for a given topic.
pub const SCHEMA_SAMPLE_INTERVAL_MILLIS: i64 = 30 * 1000;
