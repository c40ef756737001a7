// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Data Streams Monitoring (DSM) core.
//!
//! Propagates a hash-chained pathway identifier across asynchronous hops, records latency and
//! payload-size measurements at each checkpoint without blocking application threads, aggregates
//! them into time buckets and periodically ships the flushed buckets to the agent.
//!
//! ```text
//! set_checkpoint → StatsPoint → DataStreamsHandle::add_point (try_send) → DataStreamsService
//!                                                                       ↓
//!                                                          StatsBucket / StatsGroup
//!                                                                       ↓ (Report)
//!                                                  DatastreamsPayloadWriter → Sink
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod constants;
pub mod errors;
pub mod features;
pub mod hash;
pub mod histogram;
pub mod logger;
pub mod monitoring;
pub mod monitoring_service;
pub mod pathway;
pub mod payload_writer;
pub mod propagation;
pub mod sampler;
pub mod schema_sampler;
pub mod sink;
pub mod stats;
pub mod tags;
pub mod time_source;
