//! The seams between the client core and a broker.
//!
//! Production code talks to Kafka through the rdkafka implementations in
//! `kafka_producer` and `kafka_consumer`; tests swap in `mock::MemoryCluster`.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::KafkaClientError;
use crate::types::{Cursor, Delivery, GroupEvent, Partition};

#[async_trait]
pub trait ProduceTransport: Send + Sync {
    /// Number of partitions the broker reports for `topic`.
    async fn partition_count(&self, topic: &str) -> Result<usize, KafkaClientError>;

    /// Append one record to an explicit partition and wait for the broker
    /// acknowledgement, at most `timeout`.
    async fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Bytes,
        value: Bytes,
        timeout: Duration,
    ) -> Result<Delivery, KafkaClientError>;

    async fn flush(&self, timeout: Duration) -> Result<(), KafkaClientError>;
}

#[async_trait]
impl<T: ProduceTransport + ?Sized> ProduceTransport for Arc<T> {
    async fn partition_count(&self, topic: &str) -> Result<usize, KafkaClientError> {
        (**self).partition_count(topic).await
    }

    async fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Bytes,
        value: Bytes,
        timeout: Duration,
    ) -> Result<Delivery, KafkaClientError> {
        (**self)
            .produce(topic, partition, key, value, timeout)
            .await
    }

    async fn flush(&self, timeout: Duration) -> Result<(), KafkaClientError> {
        (**self).flush(timeout).await
    }
}

/// One consumer group member's view of the group protocol.
#[async_trait]
pub trait GroupTransport: Send {
    /// Announce membership of `group`, consuming `topic`.
    async fn join(&mut self, group: &str, topic: &str) -> Result<(), KafkaClientError>;

    /// Wait up to `timeout` for the next membership change or batch of
    /// records. `None` means nothing happened in time.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<GroupEvent>, KafkaClientError>;

    /// Move the fetch position of an owned partition to `offset`.
    async fn seek(&mut self, partition: &Partition, offset: i64) -> Result<(), KafkaClientError>;

    /// Leave the group, releasing the assignment.
    async fn leave(&mut self) -> Result<(), KafkaClientError>;
}

/// Durable storage for consumer group cursors, owned by the broker.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn store(&self, cursor: &Cursor) -> Result<(), KafkaClientError>;

    async fn load(
        &self,
        group: &str,
        partition: &Partition,
    ) -> Result<Option<i64>, KafkaClientError>;
}
