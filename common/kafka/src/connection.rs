use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::ClientConfig;
use tracing::{debug, info, warn};

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::error::KafkaClientError;
use crate::kafka_producer::KafkaContext;
use crate::types::Partition;

/// Process-wide handle to the broker connections.
///
/// librdkafka keeps one connection per broker address inside each client; the
/// pool owns the shared producer client, hands out the base configuration for
/// consumer clients, and keeps the per-partition byte counters the
/// partitioner balances on. Cloning is cheap and every clone sees the same
/// state.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: KafkaConfig,
    producer: Mutex<Option<FutureProducer<KafkaContext>>>,
    loads: DashMap<Partition, u64>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                producer: Mutex::new(None),
                loads: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.inner.config
    }

    pub fn brokers(&self) -> Vec<String> {
        self.inner.config.brokers()
    }

    /// Settings shared by every client created from this pool.
    pub fn client_config(&self) -> ClientConfig {
        let config = &self.inner.config;
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", self.brokers().join(","))
            .set("statistics.interval.ms", "10000");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };
        client_config
    }

    /// Group consumer settings: manual commits only, offsets are never stored
    /// behind the caller's back.
    pub fn consumer_config(&self, consumer: &ConsumerConfig) -> ClientConfig {
        let mut client_config = self.client_config();
        client_config
            .set("group.id", &consumer.kafka_consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &consumer.kafka_consumer_offset_reset)
            .set(
                "fetch.min.bytes",
                consumer.kafka_consumer_fetch_min_bytes.to_string(),
            )
            .set(
                "fetch.max.bytes",
                consumer.kafka_consumer_fetch_max_bytes.to_string(),
            )
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000");

        debug!("rdkafka consumer configuration: {:?}", client_config);
        client_config
    }

    /// The shared producer client, created on first use.
    pub fn producer(&self) -> Result<FutureProducer<KafkaContext>, KafkaClientError> {
        self.ensure_open()?;

        let mut guard = self
            .inner
            .producer
            .lock()
            .map_err(|_| KafkaClientError::Closed)?;
        if let Some(producer) = guard.as_ref() {
            return Ok(producer.clone());
        }

        let config = &self.inner.config;
        let mut client_config = self.client_config();
        client_config
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &config.kafka_compression_codec);

        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);
        debug!("rdkafka producer configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext)?;

        *guard = Some(producer.clone());
        Ok(producer)
    }

    pub fn ensure_open(&self) -> Result<(), KafkaClientError> {
        if self.is_closed() {
            Err(KafkaClientError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Accumulated bytes sent to each partition of `topic`, indexed by
    /// partition number.
    pub fn partition_loads(&self, topic: &str, partition_count: usize) -> Vec<u64> {
        (0..partition_count)
            .map(|number| {
                self.inner
                    .loads
                    .get(&Partition::new(topic, number as i32))
                    .map(|load| *load)
                    .unwrap_or_default()
            })
            .collect()
    }

    pub fn record_load(&self, partition: Partition, bytes: u64) {
        *self.inner.loads.entry(partition).or_insert(0) += bytes;
    }

    /// Flush pending produces and refuse any further work. Idempotent.
    pub fn close(&self, timeout: Duration) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let producer = match self.inner.producer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(producer) = producer {
            info!("flushing Kafka producer before shutdown");
            if let Err(e) = producer.flush(timeout) {
                warn!("failed to flush Kafka producer: {}", e);
            }
        }
        info!("connection pool closed");
    }
}
