// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Payload transport.
//!
//! A [`Sink`] takes one serialized flush at a time. Failed sends are dropped, never retried or
//! buffered, so a slow or missing agent cannot make the tracer grow without bound. Transport-level
//! outcomes are reported to registered [`EventListener`]s so the monitoring service can re-check
//! agent capabilities after a downgrade.

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, error};
use zstd::stream::write::Encoder;

use crate::constants::{DATA_STREAMS_ENDPOINT, DEFAULT_FLUSH_TIMEOUT, SINK_ERROR_LOG_INTERVAL};
use crate::errors::SinkError;

const COMPRESSION_LEVEL: i32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkEvent {
    /// The agent no longer exposes the endpoint.
    Downgraded,
    /// The agent refused the payload itself.
    BadPayload,
    Error,
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: SinkEvent, message: &str);
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Sends one payload holding `record_count` buckets.
    ///
    /// # Errors
    ///
    /// The payload could not be delivered. It has already been dropped.
    async fn accept(&self, record_count: usize, payload: Vec<u8>) -> Result<(), SinkError>;

    fn register(&self, listener: Arc<dyn EventListener>);
}

/// Allows one message per interval and counts what was held back in between.
#[derive(Debug)]
pub struct RateLimitedLog {
    interval: Duration,
    state: Mutex<(Option<Instant>, u64)>,
}

impl RateLimitedLog {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new((None, 0)),
        }
    }

    /// Returns the number of suppressed messages since the last allowed one, or `None` if this
    /// message must be suppressed too.
    pub fn allow(&self) -> Option<u64> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (last, suppressed) = &mut *state;
        if last.is_some_and(|at| at.elapsed() < self.interval) {
            *suppressed += 1;
            return None;
        }
        *last = Some(Instant::now());
        Some(std::mem::take(suppressed))
    }
}

/// Posts zstd-compressed payloads to the agent's pipeline stats endpoint.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    listeners: Mutex<Vec<Arc<dyn EventListener>>>,
    error_log: RateLimitedLog,
}

impl HttpSink {
    #[must_use]
    pub fn new(client: reqwest::Client, agent_url: &str) -> Self {
        Self {
            client,
            url: format!(
                "{}/{DATA_STREAMS_ENDPOINT}",
                agent_url.trim_end_matches('/')
            ),
            timeout: DEFAULT_FLUSH_TIMEOUT,
            listeners: Mutex::new(Vec::new()),
            error_log: RateLimitedLog::new(SINK_ERROR_LOG_INTERVAL),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn compress(data: &[u8]) -> Result<Vec<u8>, SinkError> {
        let to_error = |e: std::io::Error| SinkError::Compression(e.to_string());
        let mut encoder = Encoder::new(Vec::new(), COMPRESSION_LEVEL).map_err(to_error)?;
        encoder.write_all(data).map_err(to_error)?;
        encoder.finish().map_err(to_error)
    }

    fn notify(&self, event: SinkEvent, message: &str) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_event(event, message);
        }
    }

    fn report_failure(&self, event: SinkEvent, error: &SinkError) {
        if let Some(suppressed) = self.error_log.allow() {
            if suppressed > 0 {
                error!(
                    "Failed to send data streams payload: {error} ({suppressed} similar errors suppressed)"
                );
            } else {
                error!("Failed to send data streams payload: {error}");
            }
        }
        self.notify(event, &error.to_string());
    }

    async fn send(&self, record_count: usize, body: Vec<u8>) -> Result<(), (SinkEvent, SinkError)> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .header("Content-Type", "application/msgpack")
            .header("Content-Encoding", "zstd")
            .body(body)
            .send()
            .await
            .map_err(|e| (SinkEvent::Error, SinkError::Transport(e.to_string())))?;

        let status = response.status();
        if status.is_success() {
            debug!("Sent data streams payload with {record_count} buckets");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let event = if status == StatusCode::NOT_FOUND {
            SinkEvent::Downgraded
        } else if status.is_client_error() {
            SinkEvent::BadPayload
        } else {
            SinkEvent::Error
        };
        Err((
            event,
            SinkError::Status {
                status: status.as_u16(),
                body,
            },
        ))
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn accept(&self, record_count: usize, payload: Vec<u8>) -> Result<(), SinkError> {
        let body = match Self::compress(&payload) {
            Ok(body) => body,
            Err(e) => {
                self.report_failure(SinkEvent::Error, &e);
                return Err(e);
            }
        };
        match self.send(record_count, body).await {
            Ok(()) => Ok(()),
            Err((event, e)) => {
                self.report_failure(event, &e);
                Err(e)
            }
        }
    }

    fn register(&self, listener: Arc<dyn EventListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use tracing_test::traced_test;

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<SinkEvent>>,
    }

    impl EventListener for RecordingListener {
        fn on_event(&self, event: SinkEvent, _message: &str) {
            self.events.lock().unwrap().push(event);
        }
    }

    async fn sink_answering(status: usize) -> (mockito::ServerGuard, HttpSink, Arc<RecordingListener>) {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/v0.1/pipeline_stats")
            .with_status(status)
            .create_async()
            .await;
        let sink = HttpSink::new(reqwest::Client::new(), &server.url());
        let listener = Arc::new(RecordingListener::default());
        sink.register(listener.clone());
        (server, sink, listener)
    }

    #[tokio::test]
    async fn test_posts_compressed_payload() {
        let payload = b"data streams payload".to_vec();
        let expected = zstd::decode_all(&HttpSink::compress(&payload).unwrap()[..]).unwrap();
        assert_eq!(expected, payload);

        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v0.1/pipeline_stats")
            .match_header("content-encoding", "zstd")
            .match_header("content-type", "application/msgpack")
            .match_body(Matcher::Any)
            .with_status(202)
            .create_async()
            .await;

        let sink = HttpSink::new(reqwest::Client::new(), &format!("{}/", server.url()));
        sink.accept(1, payload).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_not_found_reports_downgrade() {
        let (_server, sink, listener) = sink_answering(404).await;
        let result = sink.accept(1, vec![1, 2, 3]).await;
        assert!(matches!(result, Err(SinkError::Status { status: 404, .. })));
        assert_eq!(*listener.events.lock().unwrap(), vec![SinkEvent::Downgraded]);
    }

    #[tokio::test]
    async fn test_client_error_reports_bad_payload() {
        let (_server, sink, listener) = sink_answering(400).await;
        assert!(sink.accept(1, vec![1]).await.is_err());
        assert_eq!(*listener.events.lock().unwrap(), vec![SinkEvent::BadPayload]);
    }

    #[tokio::test]
    async fn test_server_error_reports_error() {
        let (_server, sink, listener) = sink_answering(503).await;
        assert!(sink.accept(1, vec![1]).await.is_err());
        assert_eq!(*listener.events.lock().unwrap(), vec![SinkEvent::Error]);
    }

    #[tokio::test]
    async fn test_unreachable_agent_reports_error() {
        // Nothing listens on port 9 on loopback in test environments.
        let sink = HttpSink::new(reqwest::Client::new(), "http://127.0.0.1:9")
            .with_timeout(Duration::from_millis(500));
        let listener = Arc::new(RecordingListener::default());
        sink.register(listener.clone());
        assert!(matches!(
            sink.accept(1, vec![1]).await,
            Err(SinkError::Transport(_))
        ));
        assert_eq!(*listener.events.lock().unwrap(), vec![SinkEvent::Error]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failures_are_logged_once_per_window() {
        let (_server, sink, listener) = sink_answering(500).await;
        for _ in 0..3 {
            assert!(sink.accept(1, vec![1]).await.is_err());
        }
        assert_eq!(listener.events.lock().unwrap().len(), 3);
        logs_assert(|lines: &[&str]| {
            let count = lines
                .iter()
                .filter(|line| line.contains("Failed to send data streams payload"))
                .count();
            if count == 1 {
                Ok(())
            } else {
                Err(format!("expected one error log, got {count}"))
            }
        });
    }

    #[test]
    fn test_rate_limited_log_counts_suppressed() {
        let log = RateLimitedLog::new(Duration::from_secs(3600));
        assert_eq!(log.allow(), Some(0));
        assert_eq!(log.allow(), None);
        assert_eq!(log.allow(), None);

        let open = RateLimitedLog::new(Duration::ZERO);
        assert_eq!(open.allow(), Some(0));
        assert_eq!(open.allow(), Some(0));
    }
}
