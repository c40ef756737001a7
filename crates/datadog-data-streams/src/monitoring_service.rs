// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregation engine.
//!
//! Producers never touch the buckets. They hold a cloneable [`DataStreamsHandle`] that offers
//! items to a bounded inbox with `try_send`, dropping them when the inbox is full. A single
//! [`DataStreamsService`] task owns the buckets and processes the inbox in order:
//!
//! ```text
//! checkpoint ─┐
//! backlog ────┼─▶ handle.try_send ─▶ [ inbox (bounded) ] ─▶ service.run ─▶ BucketMap
//! ticker ─────┘         │ full: drop                           │ Report
//!   (Report)            ▼                                      ▼
//!                    dropped++                      writer.write_payload ─▶ Sink
//! ```
//!
//! The report ticker only ever enqueues `Report`; flushing happens on the consumer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use crate::constants::{
    DEFAULT_BUCKET_DURATION_NANOS, DEFAULT_QUEUE_CAPACITY, FEATURE_CHECK_INTERVAL,
    MIN_REPORT_INTERVAL,
};
use crate::errors::{AggregationError, MonitoringError};
use crate::features::FeaturesDiscovery;
use crate::pathway::StatsPoint;
use crate::payload_writer::DatastreamsPayloadWriter;
use crate::sink::{EventListener, SinkEvent};
use crate::stats::{bucket_key, Backlog, BucketMap, StatsBucket};
use crate::time_source::TimeSource;

#[derive(Debug)]
pub enum InboxItem {
    Point(StatsPoint),
    Backlog(Backlog),
    /// Flush buckets that ended before the current one.
    Report,
    /// Query the agent capabilities now, regardless of when they were last checked.
    FeatureCheck,
    /// Flush everything and stop.
    PoisonPill,
}

#[derive(Clone, Debug)]
pub struct ServiceOptions {
    pub bucket_duration_nanos: i64,
    pub queue_capacity: usize,
    pub feature_check_interval: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            bucket_duration_nanos: DEFAULT_BUCKET_DURATION_NANOS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            feature_check_interval: FEATURE_CHECK_INTERVAL,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DataStreamsHandle {
    tx: mpsc::Sender<InboxItem>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    processed: Arc<AtomicU64>,
}

impl DataStreamsHandle {
    fn offer(&self, item: InboxItem) {
        if !self.is_running() {
            return;
        }
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Closed(_)) => {
                self.running.store(false, Ordering::Release);
            }
        }
    }

    /// Never blocks. Does nothing unless the consumer is running; drops the point if the inbox
    /// is full.
    pub fn add_point(&self, point: StatsPoint) {
        self.offer(InboxItem::Point(point));
    }

    pub fn add_backlog(&self, backlog: Backlog) {
        self.offer(InboxItem::Backlog(backlog));
    }

    pub fn report(&self) {
        self.offer(InboxItem::Report);
    }

    pub fn check_features(&self) {
        self.offer(InboxItem::FeatureCheck);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Items refused because the inbox was full.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Points and backlogs taken off the inbox by the consumer, whether bucketed or discarded.
    #[must_use]
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Asks the consumer to flush everything and stop. Waits for inbox capacity if needed.
    ///
    /// # Errors
    ///
    /// `MonitoringError::Send` if the consumer is already gone.
    pub async fn shutdown(&self) -> Result<(), MonitoringError> {
        self.tx
            .send(InboxItem::PoisonPill)
            .await
            .map_err(|e| MonitoringError::Send(e.to_string()))
    }

    /// Marks the consumer as gone after it was aborted, so producers stop enqueueing.
    pub(crate) fn mark_stopped(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Listener to register on the sink: a downgraded agent triggers an immediate feature check.
    #[must_use]
    pub fn event_listener(&self) -> Arc<dyn EventListener> {
        Arc::new(DowngradeListener {
            handle: self.clone(),
        })
    }
}

struct DowngradeListener {
    handle: DataStreamsHandle,
}

impl EventListener for DowngradeListener {
    fn on_event(&self, event: SinkEvent, message: &str) {
        match event {
            SinkEvent::Downgraded => {
                debug!("Agent downgrade was detected");
                self.handle.check_features();
            }
            SinkEvent::BadPayload => {
                debug!("Bad data streams payload sent to agent: {message}");
            }
            SinkEvent::Error => {
                debug!("Agent errored receiving data streams payload: {message}");
            }
        }
    }
}

pub struct DataStreamsService {
    rx: mpsc::Receiver<InboxItem>,
    running: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
    buckets: BucketMap,
    time_source: Arc<dyn TimeSource>,
    features: Arc<dyn FeaturesDiscovery>,
    writer: Arc<dyn DatastreamsPayloadWriter>,
    config_enabled: Arc<AtomicBool>,
    feature_check_interval_nanos: i64,
    agent_supports_data_streams: bool,
    supports_data_streams: bool,
    next_feature_check_nanos: i64,
}

impl DataStreamsService {
    /// Builds the consumer and its handle. Nothing runs until [`spawn`](Self::spawn).
    ///
    /// `config_enabled` is the runtime switch for reporting; it is re-read on every report.
    ///
    /// # Errors
    ///
    /// `AggregationError::InvalidBucketDuration` unless the bucket duration is positive.
    pub fn new(
        options: &ServiceOptions,
        time_source: Arc<dyn TimeSource>,
        features: Arc<dyn FeaturesDiscovery>,
        writer: Arc<dyn DatastreamsPayloadWriter>,
        config_enabled: Arc<AtomicBool>,
    ) -> Result<(Self, DataStreamsHandle), AggregationError> {
        let buckets = BucketMap::new(options.bucket_duration_nanos)?;
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let running = Arc::new(AtomicBool::new(false));
        let processed = Arc::new(AtomicU64::new(0));

        let service = Self {
            rx,
            running: Arc::clone(&running),
            processed: Arc::clone(&processed),
            buckets,
            time_source,
            features,
            writer,
            config_enabled,
            feature_check_interval_nanos: i64::try_from(
                options.feature_check_interval.as_nanos(),
            )
            .unwrap_or(i64::MAX),
            agent_supports_data_streams: false,
            supports_data_streams: false,
            next_feature_check_nanos: 0,
        };
        let handle = DataStreamsHandle {
            tx,
            running,
            dropped: Arc::new(AtomicU64::new(0)),
            processed,
        };
        Ok((service, handle))
    }

    /// Marks the consumer alive, so handles start accepting items, and runs it on the runtime
    /// inside the caller's span.
    pub fn spawn(self) -> JoinHandle<()> {
        self.running.store(true, Ordering::Release);
        tokio::spawn(self.run().in_current_span())
    }

    pub async fn run(mut self) {
        debug!("Data streams service started");
        self.initial_feature_check().await;

        while let Some(item) = self.rx.recv().await {
            match item {
                InboxItem::Report => self.on_report().await,
                InboxItem::FeatureCheck => {
                    self.features.discover().await;
                    self.update_agent_support();
                }
                InboxItem::PoisonPill => {
                    if self.supports_data_streams {
                        let buckets = self.buckets.take_all();
                        self.write(buckets).await;
                    }
                    break;
                }
                InboxItem::Point(point) => {
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    if self.supports_data_streams {
                        if let Err(e) = self.buckets.add_point(point) {
                            debug!("Error monitoring data streams: {e}");
                        }
                    }
                }
                InboxItem::Backlog(backlog) => {
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    if self.supports_data_streams {
                        if let Err(e) = self.buckets.add_backlog(backlog) {
                            debug!("Error monitoring data streams: {e}");
                        }
                    }
                }
            }
        }

        self.running.store(false, Ordering::Release);
        self.buckets.clear();
        debug!("Data streams service stopped");
    }

    async fn initial_feature_check(&mut self) {
        self.features.discover_if_outdated().await;
        self.agent_supports_data_streams = self.features.supports_data_streams();
        self.check_dynamic_config();

        if !self.config_enabled.load(Ordering::Acquire) {
            debug!("Data streams is disabled");
        } else if !self.agent_supports_data_streams {
            debug!("Data streams is disabled or not supported by agent");
        }
        self.schedule_next_feature_check();
    }

    fn check_dynamic_config(&mut self) {
        self.supports_data_streams =
            self.agent_supports_data_streams && self.config_enabled.load(Ordering::Acquire);
    }

    fn schedule_next_feature_check(&mut self) {
        self.next_feature_check_nanos = self
            .time_source
            .current_time_nanos()
            .saturating_add(self.feature_check_interval_nanos);
    }

    /// Re-reads agent support after a discovery and logs transitions.
    fn update_agent_support(&mut self) {
        let was_supported = self.agent_supports_data_streams;
        let supported = self.features.supports_data_streams();
        let config_enabled = self.config_enabled.load(Ordering::Acquire);

        if was_supported && !supported && config_enabled {
            info!("Disabling data streams reporting because it is not supported by the agent");
        } else if !was_supported && supported && config_enabled {
            info!("Agent upgrade detected. Enabling data streams because it is now supported");
        } else if !was_supported && supported && !config_enabled {
            info!("Agent upgrade detected. Not enabling data streams because it is disabled by config");
        }

        self.agent_supports_data_streams = supported;
        self.check_dynamic_config();
        self.schedule_next_feature_check();
    }

    async fn on_report(&mut self) {
        self.check_dynamic_config();
        let now = self.time_source.current_time_nanos();

        if self.supports_data_streams {
            match bucket_key(now, self.buckets.duration_nanos()) {
                Ok(current_bucket) => {
                    let buckets = self.buckets.take_before(current_bucket);
                    self.write(buckets).await;
                }
                Err(e) => debug!("Error monitoring data streams: {e}"),
            }
        } else if now >= self.next_feature_check_nanos {
            self.features.discover_if_outdated().await;
            self.update_agent_support();
        }
    }

    async fn write(&self, buckets: Vec<StatsBucket>) {
        if buckets.is_empty() {
            return;
        }
        if let Err(e) = self.writer.write_payload(buckets).await {
            debug!("Dropped data streams payload: {e}");
        }
    }
}

/// Enqueues a `Report` every `interval` until cancelled.
pub fn spawn_report_ticker(
    handle: DataStreamsHandle,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = interval.max(MIN_REPORT_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => handle.report(),
            }
        }
    })
}
