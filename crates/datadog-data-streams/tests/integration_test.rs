// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use datadog_data_streams::{
    config::Config,
    errors::PayloadError,
    features::FeaturesDiscovery,
    hash::WellKnownTags,
    monitoring::DataStreamsMonitoring,
    monitoring_service::{DataStreamsService, ServiceOptions},
    pathway::PathwayContext,
    payload_writer::DatastreamsPayloadWriter,
    stats::StatsBucket,
    time_source::ControllableTimeSource,
};
use mockito::{Matcher, Server};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

const INFO_WITH_DSM: &str = r#"{"version":"7.50.0","endpoints":["/v0.4/traces","/v0.1/pipeline_stats"]}"#;
const INFO_WITHOUT_DSM: &str = r#"{"version":"6.0.0","endpoints":["/v0.4/traces"]}"#;

fn agent_config(agent_url: String) -> Config {
    Config {
        enabled: true,
        service: "checkout".to_string(),
        env: "staging".to_string(),
        agent_url,
        ..Config::default()
    }
}

#[tokio::test]
async fn monitoring_ships_pipeline_stats_to_agent() {
    let mut server = Server::new_async().await;
    let info = server
        .mock("GET", "/info")
        .with_status(200)
        .with_body(INFO_WITH_DSM)
        .create_async()
        .await;
    let stats = server
        .mock("POST", "/v0.1/pipeline_stats")
        .match_header("content-type", "application/msgpack")
        .match_header("content-encoding", "zstd")
        .match_body(Matcher::Any)
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let monitoring = DataStreamsMonitoring::from_config(&agent_config(server.url()))
        .expect("failed to build monitoring");
    monitoring.start().expect("failed to start");

    let producer = monitoring.new_pathway_context();
    let mut headers: HashMap<String, String> = HashMap::new();
    monitoring.set_produce_checkpoint("kafka", "payments", &producer, &mut headers);
    let consumer = monitoring.set_consume_checkpoint("kafka", "payments", &headers);
    assert!(consumer.is_started());

    monitoring.close().await.expect("failed to close");

    info.assert_async().await;
    stats.assert_async().await;
}

#[tokio::test]
async fn agent_without_pipeline_stats_receives_nothing() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/info")
        .with_status(200)
        .with_body(INFO_WITHOUT_DSM)
        .create_async()
        .await;
    let stats = server
        .mock("POST", "/v0.1/pipeline_stats")
        .expect(0)
        .create_async()
        .await;

    let monitoring = DataStreamsMonitoring::from_config(&agent_config(server.url()))
        .expect("failed to build monitoring");
    monitoring.start().expect("failed to start");

    let ctx = monitoring.new_pathway_context();
    let mut headers: HashMap<String, String> = HashMap::new();
    monitoring.set_produce_checkpoint("rabbitmq", "emails", &ctx, &mut headers);
    monitoring.close().await.expect("failed to close");

    stats.assert_async().await;
}

struct AlwaysSupported;

#[async_trait]
impl FeaturesDiscovery for AlwaysSupported {
    fn supports_data_streams(&self) -> bool {
        true
    }

    async fn discover_if_outdated(&self) {}

    async fn discover(&self) {}
}

/// Forwards (bucket start, payload size count, payload size median) per group.
struct InspectingWriter {
    tx: UnboundedSender<Vec<(i64, usize, Option<f64>)>>,
}

#[async_trait]
impl DatastreamsPayloadWriter for InspectingWriter {
    async fn write_payload(&self, buckets: Vec<StatsBucket>) -> Result<(), PayloadError> {
        let groups = buckets
            .iter()
            .flat_map(|bucket| {
                bucket.groups().map(|group| {
                    (
                        bucket.start_time_nanos(),
                        group.payload_size().count(),
                        group.payload_size().quantile(0.5),
                    )
                })
            })
            .collect();
        self.tx.send(groups).expect("receiver dropped");
        Ok(())
    }
}

#[tokio::test]
async fn single_checkpoint_is_flushed_in_its_bucket() {
    let clock = Arc::new(ControllableTimeSource::new());
    let tags = Arc::new(WellKnownTags::new("checkout", "staging", "", ""));
    let (tx, mut rx) = unbounded_channel();
    let options = ServiceOptions {
        bucket_duration_nanos: 10,
        ..ServiceOptions::default()
    };
    let (service, handle) = DataStreamsService::new(
        &options,
        clock.clone(),
        Arc::new(AlwaysSupported),
        Arc::new(InspectingWriter { tx }),
        Arc::new(AtomicBool::new(true)),
    )
    .expect("valid bucket duration");
    let consumer = service.spawn();

    let ctx = PathwayContext::new(clock.clone(), tags);
    ctx.set_checkpoint(
        vec!["type:kafka".to_string(), "direction:out".to_string()],
        |point| handle.add_point(point),
        None,
        100,
    );

    clock.set(21);
    handle.report();
    let groups = rx.recv().await.expect("nothing flushed");
    assert_eq!(groups.len(), 1);
    let (bucket, count, median) = groups[0];
    assert_eq!(bucket, 0);
    assert_eq!(count, 1);
    let median = median.expect("empty histogram");
    assert!((median - 100.0).abs() <= 1.0, "median was {median}");

    handle.shutdown().await.expect("consumer gone");
    consumer.await.expect("consumer panicked");
    assert!(rx.recv().await.is_none());
}
