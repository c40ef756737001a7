// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent capability discovery.
//!
//! The agent advertises its endpoints on `/info`. Data streams reporting is only useful when the
//! pipeline stats endpoint is among them; older agents would reject the payloads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::constants::{
    DATA_STREAMS_ENDPOINT, DEFAULT_FLUSH_TIMEOUT, FEATURE_CHECK_INTERVAL, INFO_ENDPOINT,
};

#[async_trait]
pub trait FeaturesDiscovery: Send + Sync {
    /// Result of the latest discovery. `false` until the first one succeeds.
    fn supports_data_streams(&self) -> bool;

    /// Queries the agent again if the last discovery is older than the refresh interval.
    async fn discover_if_outdated(&self);

    /// Queries the agent unconditionally.
    async fn discover(&self);
}

#[derive(Debug, Deserialize)]
struct AgentInfo {
    #[serde(default)]
    endpoints: Vec<String>,
}

pub struct AgentFeaturesDiscovery {
    client: reqwest::Client,
    info_url: String,
    refresh_interval: Duration,
    timeout: Duration,
    supports_data_streams: AtomicBool,
    last_discovery: Mutex<Option<Instant>>,
}

impl AgentFeaturesDiscovery {
    #[must_use]
    pub fn new(client: reqwest::Client, agent_url: &str) -> Self {
        Self {
            client,
            info_url: format!("{}/{INFO_ENDPOINT}", agent_url.trim_end_matches('/')),
            refresh_interval: FEATURE_CHECK_INTERVAL,
            timeout: DEFAULT_FLUSH_TIMEOUT,
            supports_data_streams: AtomicBool::new(false),
            last_discovery: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    /// Upper bound for one `/info` request. A silent agent then counts as unsupported.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn fetch_endpoints(&self) -> Result<Vec<String>, reqwest::Error> {
        let info = self
            .client
            .get(&self.info_url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<AgentInfo>()
            .await?;
        Ok(info.endpoints)
    }

    fn is_outdated(&self) -> bool {
        let last = self
            .last_discovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        last.map_or(true, |at| at.elapsed() >= self.refresh_interval)
    }
}

#[async_trait]
impl FeaturesDiscovery for AgentFeaturesDiscovery {
    fn supports_data_streams(&self) -> bool {
        self.supports_data_streams.load(Ordering::Acquire)
    }

    async fn discover_if_outdated(&self) {
        if self.is_outdated() {
            self.discover().await;
        }
    }

    async fn discover(&self) {
        let supported = match self.fetch_endpoints().await {
            Ok(endpoints) => endpoints
                .iter()
                .any(|endpoint| endpoint.trim_start_matches('/') == DATA_STREAMS_ENDPOINT),
            Err(e) => {
                debug!("Agent feature discovery failed: {e}");
                false
            }
        };
        self.supports_data_streams
            .store(supported, Ordering::Release);
        *self
            .last_discovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mockito::Server;

    #[tokio::test]
    async fn test_discovers_pipeline_stats_endpoint() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/info")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"version":"7.50.0","endpoints":["/v0.4/traces","/v0.1/pipeline_stats"]}"#)
            .create_async()
            .await;

        let discovery = AgentFeaturesDiscovery::new(reqwest::Client::new(), &server.url());
        assert!(!discovery.supports_data_streams());
        discovery.discover().await;

        mock.assert_async().await;
        assert!(discovery.supports_data_streams());
    }

    #[tokio::test]
    async fn test_old_agent_without_endpoint() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/info")
            .with_status(200)
            .with_body(r#"{"endpoints":["/v0.4/traces"]}"#)
            .create_async()
            .await;

        let discovery = AgentFeaturesDiscovery::new(reqwest::Client::new(), &server.url());
        discovery.discover().await;
        assert!(!discovery.supports_data_streams());
    }

    #[tokio::test]
    async fn test_unreachable_info_means_unsupported() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/info")
            .with_status(404)
            .create_async()
            .await;

        let discovery = AgentFeaturesDiscovery::new(reqwest::Client::new(), &server.url());
        discovery.discover().await;
        assert!(!discovery.supports_data_streams());
    }

    #[tokio::test]
    async fn test_silent_agent_times_out() {
        // Connections complete in the backlog but nothing ever answers.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let discovery = AgentFeaturesDiscovery::new(reqwest::Client::new(), &url)
            .with_timeout(Duration::from_millis(100));
        let started = Instant::now();
        discovery.discover().await;

        assert!(!discovery.supports_data_streams());
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!discovery.is_outdated());
        drop(listener);
    }

    #[tokio::test]
    async fn test_discover_if_outdated_respects_interval() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/info")
            .with_status(200)
            .with_body(r#"{"endpoints":["/v0.1/pipeline_stats"]}"#)
            .expect(1)
            .create_async()
            .await;

        let discovery = AgentFeaturesDiscovery::new(reqwest::Client::new(), &server.url());
        discovery.discover_if_outdated().await;
        discovery.discover_if_outdated().await;

        mock.assert_async().await;
        assert!(discovery.supports_data_streams());
    }

    #[tokio::test]
    async fn test_zero_interval_always_rediscovers() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/info")
            .with_status(200)
            .with_body(r#"{"endpoints":[]}"#)
            .expect(2)
            .create_async()
            .await;

        let discovery = AgentFeaturesDiscovery::new(reqwest::Client::new(), &server.url())
            .with_refresh_interval(Duration::ZERO);
        discovery.discover_if_outdated().await;
        discovery.discover_if_outdated().await;

        mock.assert_async().await;
    }
}
