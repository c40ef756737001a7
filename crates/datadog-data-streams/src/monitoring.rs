// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry point for instrumentation code.
//!
//! [`DataStreamsMonitoring`] wires the pieces together: the propagator for carriers, the handle
//! feeding the aggregation engine, the report ticker and the payload writer/sink. It is an
//! explicit object; create one per process and share it behind an `Arc`.
//!
//! ```rust,ignore
//! let monitoring = DataStreamsMonitoring::from_config(&Config::from_env()?)?;
//! monitoring.start()?;
//!
//! // producer side
//! let ctx = monitoring.new_pathway_context();
//! monitoring.set_produce_checkpoint("kafka", "orders", &ctx, &mut headers);
//!
//! // consumer side
//! let ctx = monitoring.set_consume_checkpoint("kafka", "orders", &headers);
//!
//! monitoring.close().await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::constants::PATHWAY_HASH_TAG;
use crate::errors::{MonitoringError, PathwayError};
use crate::features::{AgentFeaturesDiscovery, FeaturesDiscovery};
use crate::hash::WellKnownTags;
use crate::monitoring_service::{
    spawn_report_ticker, DataStreamsHandle, DataStreamsService, ServiceOptions,
};
use crate::pathway::{merge_pathway_contexts, FastRandSource, PathwayContext, RandomSource};
use crate::payload_writer::MsgPackPayloadWriter;
use crate::propagation::carrier::{Extractor, Injector};
use crate::propagation::DataStreamsPropagator;
use crate::sampler::InjectionSampler;
use crate::schema_sampler::SchemaSamplers;
use crate::sink::{HttpSink, Sink};
use crate::stats::Backlog;
use crate::tags::{sorted_tags, DataStreamsTags, Direction};
use crate::time_source::{SystemTimeSource, TimeSource};

struct RunningTasks {
    consumer: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

pub struct DataStreamsMonitoring {
    time_source: Arc<dyn TimeSource>,
    well_known_tags: Arc<WellKnownTags>,
    propagator: DataStreamsPropagator,
    schema_samplers: SchemaSamplers,
    random: Arc<dyn RandomSource>,
    enabled: Arc<AtomicBool>,
    handle: DataStreamsHandle,
    service: Mutex<Option<DataStreamsService>>,
    tasks: Mutex<Option<RunningTasks>>,
    cancel: CancellationToken,
    report_interval: Duration,
    close_timeout: Duration,
}

impl Drop for DataStreamsMonitoring {
    fn drop(&mut self) {
        self.cancel.cancel();
        // The sink's downgrade listener keeps a sender alive, so the consumer never sees a
        // closed inbox on its own.
        if let Some(tasks) = self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            tasks.ticker.abort();
            tasks.consumer.abort();
            self.handle.mark_stopped();
        }
    }
}

impl DataStreamsMonitoring {
    /// Builds the pipeline with explicit collaborators. The engine registers itself with `sink` so
    /// an agent downgrade triggers a capability re-check.
    ///
    /// # Errors
    ///
    /// `MonitoringError::Aggregation` if the configured bucket duration is not positive.
    pub fn new(
        config: &Config,
        time_source: Arc<dyn TimeSource>,
        features: Arc<dyn FeaturesDiscovery>,
        sink: Arc<dyn Sink>,
        random: Arc<dyn RandomSource>,
    ) -> Result<Self, MonitoringError> {
        let well_known_tags = Arc::new(config.well_known_tags());
        let enabled = Arc::new(AtomicBool::new(config.enabled));
        let writer = Arc::new(MsgPackPayloadWriter::new(
            Arc::clone(&sink),
            Arc::clone(&well_known_tags),
        ));

        let options = ServiceOptions {
            bucket_duration_nanos: config.bucket_duration_nanos,
            queue_capacity: config.queue_capacity,
            ..ServiceOptions::default()
        };
        let (service, handle) = DataStreamsService::new(
            &options,
            Arc::clone(&time_source),
            features,
            writer,
            Arc::clone(&enabled),
        )?;
        sink.register(handle.event_listener());

        Ok(Self {
            propagator: DataStreamsPropagator::new(
                Arc::clone(&time_source),
                Arc::clone(&well_known_tags),
                InjectionSampler::new(config.injection_sampling_rate),
            ),
            time_source,
            well_known_tags,
            schema_samplers: SchemaSamplers::new(),
            random,
            enabled,
            handle,
            service: Mutex::new(Some(service)),
            tasks: Mutex::new(None),
            cancel: CancellationToken::new(),
            report_interval: config.report_interval(),
            close_timeout: config.flush_timeout,
        })
    }

    /// Builds the pipeline against the agent at `config.agent_url`.
    ///
    /// # Errors
    ///
    /// The HTTP client cannot be built or the bucket duration is not positive.
    pub fn from_config(config: &Config) -> Result<Self, MonitoringError> {
        let client = reqwest::Client::builder()
            .timeout(config.flush_timeout)
            .pool_idle_timeout(Duration::from_secs(270))
            .tcp_keepalive(Duration::from_secs(120))
            .build()
            .map_err(|e| MonitoringError::Client(e.to_string()))?;

        let features = Arc::new(
            AgentFeaturesDiscovery::new(client.clone(), &config.agent_url)
                .with_timeout(config.flush_timeout),
        );
        let sink =
            Arc::new(HttpSink::new(client, &config.agent_url).with_timeout(config.flush_timeout));
        Self::new(
            config,
            Arc::new(SystemTimeSource),
            features,
            sink,
            Arc::new(FastRandSource),
        )
    }

    /// Spawns the consumer and the report ticker on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// `MonitoringError::AlreadyStarted` on every call after the first.
    pub fn start(&self) -> Result<(), MonitoringError> {
        let service = self
            .service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(MonitoringError::AlreadyStarted)?;

        let consumer = service.spawn();
        let ticker = spawn_report_ticker(
            self.handle.clone(),
            self.report_interval,
            self.cancel.clone(),
        );
        *self.tasks.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(RunningTasks { consumer, ticker });
        debug!("Data streams monitoring started");
        Ok(())
    }

    /// Stops the ticker, flushes every pending bucket and waits for the consumer to exit, at most
    /// for the configured flush timeout.
    ///
    /// # Errors
    ///
    /// `NotRunning` if never started or already closed, `ShutdownTimeout` if the consumer did not
    /// exit in time. The consumer is aborted in that case and pending points are lost.
    pub async fn close(&self) -> Result<(), MonitoringError> {
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(MonitoringError::NotRunning)?;

        self.cancel.cancel();
        if let Err(e) = tasks.ticker.await {
            debug!("Report ticker ended abnormally: {e}");
        }
        // The poison pill waits for inbox capacity behind a possibly stuck flush, so the send
        // and the join share one deadline.
        let mut consumer = tasks.consumer;
        let outcome = tokio::time::timeout(self.close_timeout, async {
            self.handle.shutdown().await?;
            (&mut consumer).await.map_err(|e| {
                error!("Data streams consumer failed: {e}");
                MonitoringError::Join(e.to_string())
            })
        })
        .await;

        match outcome {
            Ok(result) => {
                if result.is_ok() {
                    debug!("Data streams monitoring closed");
                }
                result
            }
            Err(_) => {
                warn!(
                    "Data streams consumer did not stop within {:?}, aborting",
                    self.close_timeout
                );
                consumer.abort();
                self.handle.mark_stopped();
                Err(MonitoringError::ShutdownTimeout)
            }
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Queue statistics and the raw handle, for callers feeding points themselves.
    #[must_use]
    pub fn handle(&self) -> &DataStreamsHandle {
        &self.handle
    }

    #[must_use]
    pub fn well_known_tags(&self) -> &WellKnownTags {
        &self.well_known_tags
    }

    /// Runtime switch. Takes effect for reporting on the next report tick.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// A fresh, unstarted context, or the inert `Noop` context while disabled.
    #[must_use]
    pub fn new_pathway_context(&self) -> PathwayContext {
        if self.is_enabled() {
            PathwayContext::new(
                Arc::clone(&self.time_source),
                Arc::clone(&self.well_known_tags),
            )
        } else {
            PathwayContext::noop()
        }
    }

    /// Like [`new_pathway_context`](Self::new_pathway_context), but checkpoints are kept on the
    /// context until taken with [`PathwayContext::take_saved_stats`] and passed to
    /// [`add_saved_stats`](Self::add_saved_stats).
    #[must_use]
    pub fn new_pruned_pathway_context(&self) -> PathwayContext {
        if self.is_enabled() {
            PathwayContext::pruned(
                Arc::clone(&self.time_source),
                Arc::clone(&self.well_known_tags),
            )
        } else {
            PathwayContext::noop()
        }
    }

    /// Records a checkpoint on `context` and feeds the resulting point to the engine.
    pub fn set_checkpoint(
        &self,
        context: &PathwayContext,
        tags: &DataStreamsTags,
        default_timestamp_millis: Option<i64>,
        payload_size_bytes: i64,
    ) {
        context.set_checkpoint(
            tags.to_edge_tags(),
            |point| self.handle.add_point(point),
            default_timestamp_millis,
            payload_size_bytes,
        );
    }

    /// Emits the point saved by a pruned context, stamped with the final payload size.
    pub fn add_saved_stats(&self, context: &PathwayContext, payload_size_bytes: i64) {
        if let Some(point) = context.take_saved_stats() {
            self.handle
                .add_point(point.with_payload_size(payload_size_bytes));
        }
    }

    pub fn extract<E: Extractor + ?Sized>(&self, carrier: &E) -> Option<PathwayContext> {
        if !self.is_enabled() {
            return None;
        }
        self.propagator.extract(carrier)
    }

    /// # Errors
    ///
    /// `PathwayError::NotStarted` if `context` has no checkpoint yet.
    pub fn inject<I: Injector + ?Sized>(
        &self,
        context: &PathwayContext,
        carrier: &mut I,
    ) -> Result<(), PathwayError> {
        self.propagator.inject(context, carrier)
    }

    /// Injects only when the sampler selects `id`. Returns whether it did.
    ///
    /// # Errors
    ///
    /// `PathwayError::NotStarted` if `id` is sampled and `context` has no checkpoint yet.
    pub fn inject_sampled<I: Injector + ?Sized>(
        &self,
        context: &PathwayContext,
        carrier: &mut I,
        id: u64,
    ) -> Result<bool, PathwayError> {
        self.propagator.inject_sampled(context, carrier, id)
    }

    #[must_use]
    pub fn merge_pathway_context(
        &self,
        current: Option<Arc<PathwayContext>>,
        other: Arc<PathwayContext>,
    ) -> Arc<PathwayContext> {
        merge_pathway_contexts(current, other, self.random.as_ref())
    }

    /// Manual producer checkpoint: `direction:out`, `topic:<target>`, `type:<kind>`, then injects
    /// the context into `carrier`.
    pub fn set_produce_checkpoint<I: Injector + ?Sized>(
        &self,
        kind: &str,
        target: &str,
        context: &PathwayContext,
        carrier: &mut I,
    ) {
        if kind.is_empty() || target.is_empty() {
            warn!("set_produce_checkpoint should be called with non-empty type and target");
            return;
        }
        let tags = DataStreamsTags::new(kind, Direction::Outbound)
            .with_topic(target)
            .manual();
        self.set_checkpoint(context, &tags, None, 0);
        if let Err(e) = self.inject(context, carrier) {
            debug!("Unable to inject pathway context: {e}");
        }
    }

    /// Manual consumer checkpoint. Continues the pathway found in `carrier`, or starts a new one,
    /// and returns it.
    pub fn set_consume_checkpoint<E: Extractor + ?Sized>(
        &self,
        kind: &str,
        source: &str,
        carrier: &E,
    ) -> PathwayContext {
        if kind.is_empty() || source.is_empty() {
            warn!("set_consume_checkpoint should be called with non-empty type and source");
            return PathwayContext::noop();
        }
        let context = self
            .extract(carrier)
            .unwrap_or_else(|| self.new_pathway_context());
        let tags = DataStreamsTags::new(kind, Direction::Inbound)
            .with_topic(source)
            .manual();
        self.set_checkpoint(&context, &tags, None, 0);
        context
    }

    /// Records a backlog measurement such as a committed or produced offset. Pairs with an empty
    /// value are left out of the tags.
    pub fn track_backlog(&self, tags: &[(&str, &str)], value: i64) {
        self.handle.add_backlog(Backlog {
            tags: sorted_tags(tags),
            value,
            timestamp_nanos: self.time_source.current_time_nanos(),
        });
    }

    /// Weight to attach to a schema sample for `topic`, or 0 when it is not time to sample.
    pub fn try_sample_schema(&self, topic: &str) -> u32 {
        self.schema_samplers
            .try_sample(topic, self.time_source.current_time_millis())
    }

    #[must_use]
    pub fn can_sample_schema(&self, topic: &str) -> bool {
        self.schema_samplers
            .can_sample(topic, self.time_source.current_time_millis())
    }

    /// Span tag identifying the pathway, once `context` has a checkpoint.
    #[must_use]
    pub fn pathway_hash_tag(context: &PathwayContext) -> Option<(&'static str, String)> {
        context
            .is_started()
            .then(|| (PATHWAY_HASH_TAG, context.hash().to_string()))
    }
}
