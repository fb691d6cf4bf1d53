use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, error, info, instrument};

use crate::connection::ConnectionPool;
use crate::error::KafkaClientError;
use crate::partitioner::Partitioner;
use crate::transport::ProduceTransport;
use crate::types::{Delivery, Partition, ProducerRecord};

/// Publishes keyed records to one topic. Cloning shares the partitioner and
/// the pool, so every clone balances over the same loads.
pub struct Publisher<T> {
    inner: Arc<PublisherInner<T>>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct PublisherInner<T> {
    pool: ConnectionPool,
    transport: T,
    partitioner: Partitioner,
    topic: String,
    partition_count: AtomicUsize,
}

impl<T: ProduceTransport> Publisher<T> {
    /// Build a publisher for the pool's configured topic, reading its
    /// partition count from the broker.
    pub async fn new(pool: ConnectionPool, transport: T) -> Result<Self, KafkaClientError> {
        pool.ensure_open()?;

        let config = pool.config();
        let topic = config.kafka_topic.clone();
        let partitioner =
            Partitioner::new(config.kafka_partitioner, config.kafka_partitioner_window);

        let partition_count = transport.partition_count(&topic).await?;
        if partition_count == 0 {
            return Err(KafkaClientError::Configuration(format!(
                "topic {topic} has no partitions"
            )));
        }
        info!(
            topic = %topic,
            partition_count,
            policy = ?partitioner.policy(),
            "publisher ready"
        );

        Ok(Self {
            inner: Arc::new(PublisherInner {
                pool,
                transport,
                partitioner,
                topic,
                partition_count: AtomicUsize::new(partition_count),
            }),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn partition_count(&self) -> usize {
        self.inner.partition_count.load(Ordering::Relaxed)
    }

    /// Re-read the partition count, after the topic was altered.
    pub async fn refresh_partitions(&self) -> Result<usize, KafkaClientError> {
        let count = self
            .inner
            .transport
            .partition_count(&self.inner.topic)
            .await?;
        if count == 0 {
            return Err(KafkaClientError::Configuration(format!(
                "topic {} has no partitions",
                self.inner.topic
            )));
        }
        self.inner.partition_count.store(count, Ordering::Relaxed);
        Ok(count)
    }

    /// Send one record and wait for the broker acknowledgement, at most
    /// `timeout`. Failures are returned, never retried here.
    #[instrument(skip_all, fields(topic = %self.inner.topic))]
    pub async fn send(
        &self,
        record: ProducerRecord,
        timeout: Duration,
    ) -> Result<Delivery, KafkaClientError> {
        let inner = &self.inner;
        inner.pool.ensure_open()?;

        let Some(value) = record.value else {
            counter!("kafka_client_produce_total", "outcome" => "invalid").increment(1);
            return Err(KafkaClientError::InvalidRecord(
                "record value must not be null".to_string(),
            ));
        };

        let loads = inner
            .pool
            .partition_loads(&inner.topic, self.partition_count());
        let partition = inner.partitioner.select(&record.key, &loads)?;

        // Counted before the ack: in-flight bytes steer concurrent sends too
        inner.pool.record_load(
            Partition::new(inner.topic.as_str(), partition),
            (record.key.len() + value.len()) as u64,
        );

        let result = inner
            .transport
            .produce(&inner.topic, partition, record.key, value, timeout)
            .await;

        match &result {
            Ok(delivery) => {
                debug!(
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "record acknowledged"
                );
                counter!("kafka_client_produce_total", "outcome" => "ok").increment(1);
            }
            Err(KafkaClientError::Timeout(_)) => {
                error!(partition, "timed out waiting for acknowledgement");
                counter!("kafka_client_produce_total", "outcome" => "timeout").increment(1);
            }
            Err(e) => {
                error!(partition, "failed to publish record: {}", e);
                counter!("kafka_client_produce_total", "outcome" => "failed").increment(1);
            }
        }
        result
    }

    /// Wait for outstanding sends to complete.
    pub async fn flush(&self, timeout: Duration) -> Result<(), KafkaClientError> {
        self.inner.transport.flush(timeout).await
    }
}
