// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_AGENT_HOST, DEFAULT_AGENT_PORT, DEFAULT_BUCKET_DURATION_NANOS, DEFAULT_FLUSH_TIMEOUT,
    DEFAULT_INJECTION_SAMPLING_RATE, DEFAULT_QUEUE_CAPACITY, NANOS_PER_SECOND,
};
use crate::errors::ConfigError;
use crate::hash::WellKnownTags;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub enabled: bool,
    pub service: String,
    pub env: String,
    pub version: String,
    pub primary_tag: String,
    pub agent_url: String,
    pub bucket_duration_nanos: i64,
    pub queue_capacity: usize,
    /// Fraction of messages whose pathway is injected, in [0, 1].
    pub injection_sampling_rate: f64,
    /// Bounds both a single payload send and the wait for the consumer on close.
    pub flush_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false,
            service: String::new(),
            env: String::new(),
            version: String::new(),
            primary_tag: String::new(),
            agent_url: format!("http://{DEFAULT_AGENT_HOST}:{DEFAULT_AGENT_PORT}"),
            bucket_duration_nanos: DEFAULT_BUCKET_DURATION_NANOS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            injection_sampling_rate: DEFAULT_INJECTION_SAMPLING_RATE,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

fn parse_var<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(None),
    }
}

fn parse_bool(key: &'static str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "true" | "1" => Ok(Some(true)),
            "false" | "0" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue { key, value }),
        },
        Err(_) => Ok(None),
    }
}

fn positive_seconds(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    let Some(secs) = parse_var::<f64>(key)? else {
        return Ok(None);
    };
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
        .map(Some)
        .ok_or(ConfigError::InvalidValue {
            key,
            value: secs.to_string(),
        })
}

impl Config {
    /// Reads the configuration from `DD_*` environment variables. Unset variables keep their
    /// default.
    ///
    /// # Errors
    ///
    /// `ConfigError::InvalidValue` for a variable that is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let agent_url = match env::var("DD_TRACE_AGENT_URL") {
            Ok(url) if !url.trim().is_empty() => url.trim().trim_end_matches('/').to_string(),
            _ => {
                let host =
                    env::var("DD_AGENT_HOST").unwrap_or_else(|_| DEFAULT_AGENT_HOST.to_string());
                let port = parse_var::<u16>("DD_TRACE_AGENT_PORT")?.unwrap_or(DEFAULT_AGENT_PORT);
                format!("http://{host}:{port}")
            }
        };

        let bucket_duration_nanos = positive_seconds("DD_DATA_STREAMS_BUCKET_DURATION_SECONDS")?
            .map_or(defaults.bucket_duration_nanos, |d| {
                i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
            });

        let queue_capacity = match parse_var::<usize>("DD_DATA_STREAMS_QUEUE_CAPACITY")? {
            Some(0) => {
                return Err(ConfigError::InvalidValue {
                    key: "DD_DATA_STREAMS_QUEUE_CAPACITY",
                    value: "0".to_string(),
                })
            }
            Some(capacity) => capacity,
            None => defaults.queue_capacity,
        };

        let injection_sampling_rate = parse_var::<f64>("DD_DATA_STREAMS_INJECTION_SAMPLING_RATE")?
            .filter(|rate| !rate.is_nan())
            .map_or(defaults.injection_sampling_rate, |rate| rate.clamp(0.0, 1.0));

        Ok(Self {
            enabled: parse_bool("DD_DATA_STREAMS_ENABLED")?.unwrap_or(defaults.enabled),
            service: env::var("DD_SERVICE").unwrap_or_default(),
            env: env::var("DD_ENV").unwrap_or_default(),
            version: env::var("DD_VERSION").unwrap_or_default(),
            primary_tag: env::var("DD_PRIMARY_TAG").unwrap_or_default(),
            agent_url,
            bucket_duration_nanos,
            queue_capacity,
            injection_sampling_rate,
            flush_timeout: positive_seconds("DD_DATA_STREAMS_FLUSH_TIMEOUT_SECONDS")?
                .unwrap_or(defaults.flush_timeout),
        })
    }

    #[must_use]
    pub fn well_known_tags(&self) -> WellKnownTags {
        WellKnownTags::new(&self.service, &self.env, &self.version, &self.primary_tag)
    }

    /// Report tick period: one bucket.
    #[must_use]
    pub fn report_interval(&self) -> Duration {
        Duration::from_nanos(u64::try_from(self.bucket_duration_nanos).unwrap_or(0))
    }
}
