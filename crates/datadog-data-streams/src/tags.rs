// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Edge tag construction.
//!
//! Edge tags describe a checkpoint (`type:kafka`, `direction:out`, `topic:orders`, ...). They feed
//! the node hash, so the order in which they are emitted must be stable: `DataStreamsTags` always
//! renders them in one canonical order regardless of how the builder was called.

pub const TYPE_TAG: &str = "type";
pub const DIRECTION_TAG: &str = "direction";
pub const TOPIC_TAG: &str = "topic";
pub const BUS_TAG: &str = "bus";
pub const EXCHANGE_TAG: &str = "exchange";
pub const SUBSCRIPTION_TAG: &str = "subscription";
pub const DATASET_NAME_TAG: &str = "ds.name";
pub const DATASET_NAMESPACE_TAG: &str = "ds.namespace";
pub const MANUAL_TAG: &str = "manual_checkpoint";
pub const GROUP_TAG: &str = "group";
pub const CONSUMER_GROUP_TAG: &str = "consumer_group";
pub const HAS_ROUTING_KEY_TAG: &str = "has_routing_key";
pub const KAFKA_CLUSTER_ID_TAG: &str = "kafka_cluster_id";
pub const PARTITION_TAG: &str = "partition";

pub const DIRECTION_IN: &str = "in";
pub const DIRECTION_OUT: &str = "out";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => DIRECTION_IN,
            Direction::Outbound => DIRECTION_OUT,
        }
    }
}

/// Formats a `key:value` tag. Empty values produce no tag.
#[must_use]
pub fn create_tag(key: &str, value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(format!("{key}:{value}"))
    }
}

/// Builds tags from key/value pairs, sorted by key so callers need not care about order.
#[must_use]
pub fn sorted_tags(pairs: &[(&str, &str)]) -> Vec<String> {
    let mut pairs = pairs.to_vec();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs
        .into_iter()
        .filter_map(|(key, value)| create_tag(key, value))
        .collect()
}

/// Builder for the well-known DSM edge tags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataStreamsTags {
    bus: Option<String>,
    direction: Option<Direction>,
    exchange: Option<String>,
    topic: Option<String>,
    kind: Option<String>,
    subscription: Option<String>,
    dataset_name: Option<String>,
    dataset_namespace: Option<String>,
    manual: Option<bool>,
    group: Option<String>,
    consumer_group: Option<String>,
    has_routing_key: Option<bool>,
    kafka_cluster_id: Option<String>,
    partition: Option<String>,
}

impl DataStreamsTags {
    #[must_use]
    pub fn new(kind: &str, direction: Direction) -> Self {
        Self {
            kind: Some(kind.to_string()),
            direction: Some(direction),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_topic(mut self, topic: &str) -> Self {
        self.topic = Some(topic.to_string());
        self
    }

    #[must_use]
    pub fn with_bus(mut self, bus: &str) -> Self {
        self.bus = Some(bus.to_string());
        self
    }

    #[must_use]
    pub fn with_exchange(mut self, exchange: &str, has_routing_key: bool) -> Self {
        self.exchange = Some(exchange.to_string());
        self.has_routing_key = Some(has_routing_key);
        self
    }

    #[must_use]
    pub fn with_subscription(mut self, subscription: &str) -> Self {
        self.subscription = Some(subscription.to_string());
        self
    }

    #[must_use]
    pub fn with_dataset(mut self, name: &str, namespace: &str) -> Self {
        self.dataset_name = Some(name.to_string());
        self.dataset_namespace = Some(namespace.to_string());
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    #[must_use]
    pub fn with_consumer_group(mut self, consumer_group: &str) -> Self {
        self.consumer_group = Some(consumer_group.to_string());
        self
    }

    #[must_use]
    pub fn with_kafka_cluster_id(mut self, cluster_id: &str) -> Self {
        self.kafka_cluster_id = Some(cluster_id.to_string());
        self
    }

    #[must_use]
    pub fn with_partition(mut self, partition: &str) -> Self {
        self.partition = Some(partition.to_string());
        self
    }

    /// Marks the checkpoint as set by user code rather than an integration.
    #[must_use]
    pub fn manual(mut self) -> Self {
        self.manual = Some(true);
        self
    }

    #[must_use]
    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    /// Renders the tags in canonical order.
    #[must_use]
    pub fn to_edge_tags(&self) -> Vec<String> {
        let bool_str = |b: bool| if b { "true" } else { "false" };
        let entries: [(&str, Option<&str>); 14] = [
            (BUS_TAG, self.bus.as_deref()),
            (DIRECTION_TAG, self.direction.map(Direction::as_str)),
            (EXCHANGE_TAG, self.exchange.as_deref()),
            (TOPIC_TAG, self.topic.as_deref()),
            (TYPE_TAG, self.kind.as_deref()),
            (SUBSCRIPTION_TAG, self.subscription.as_deref()),
            (DATASET_NAME_TAG, self.dataset_name.as_deref()),
            (DATASET_NAMESPACE_TAG, self.dataset_namespace.as_deref()),
            (MANUAL_TAG, self.manual.map(bool_str)),
            (GROUP_TAG, self.group.as_deref()),
            (CONSUMER_GROUP_TAG, self.consumer_group.as_deref()),
            (HAS_ROUTING_KEY_TAG, self.has_routing_key.map(bool_str)),
            (KAFKA_CLUSTER_ID_TAG, self.kafka_cluster_id.as_deref()),
            (PARTITION_TAG, self.partition.as_deref()),
        ];
        entries
            .into_iter()
            .filter_map(|(key, value)| value.and_then(|v| create_tag(key, v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tag() {
        assert_eq!(create_tag("topic", "orders"), Some("topic:orders".to_string()));
        assert_eq!(create_tag("topic", ""), None);
    }

    #[test]
    fn test_sorted_tags_orders_by_key_and_drops_empty() {
        let tags = sorted_tags(&[("type", "kafka_lag"), ("partition", "3"), ("topic", "")]);
        assert_eq!(tags, vec!["partition:3", "type:kafka_lag"]);
    }

    #[test]
    fn test_edge_tags_canonical_order() {
        let tags = DataStreamsTags::new("kafka", Direction::Outbound)
            .with_kafka_cluster_id("cluster-1")
            .with_topic("orders")
            .with_group("billing");
        assert_eq!(
            tags.to_edge_tags(),
            vec![
                "direction:out",
                "topic:orders",
                "type:kafka",
                "group:billing",
                "kafka_cluster_id:cluster-1"
            ]
        );
    }

    #[test]
    fn test_builder_order_does_not_matter() {
        let a = DataStreamsTags::new("rabbitmq", Direction::Inbound)
            .with_exchange("events", true)
            .manual();
        let b = DataStreamsTags::new("rabbitmq", Direction::Inbound)
            .manual()
            .with_exchange("events", true);
        assert_eq!(a.to_edge_tags(), b.to_edge_tags());
        assert!(a
            .to_edge_tags()
            .contains(&"has_routing_key:true".to_string()));
        assert_eq!(a.direction(), Some(Direction::Inbound));
    }
}
