use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use metrics::gauge;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{error, info};

use crate::connection::ConnectionPool;
use crate::error::KafkaClientError;
use crate::transport::ProduceTransport;
use crate::types::Delivery;

pub struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("kafka_client_callback_queue_depth").set(stats.replyq as f64);
        gauge!("kafka_client_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("kafka_client_producer_queue_bytes").set(stats.msg_size as f64);

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            gauge!(
                "kafka_client_broker_requests_pending",
                "broker" => id_string.clone()
            )
            .set(stats.outbuf_cnt as f64);
            gauge!(
                "kafka_client_broker_responses_awaiting",
                "broker" => id_string
            )
            .set(stats.waitresp_cnt as f64);
        }
    }
}

/// Produces through the pool's shared rdkafka client, always to an explicit
/// partition: partition choice belongs to our partitioner, not librdkafka's.
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer<KafkaContext>,
    metadata_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(pool: &ConnectionPool) -> Result<Self, KafkaClientError> {
        let producer = pool.producer()?;
        let metadata_timeout = pool.config().metadata_timeout();

        // Ping the cluster to make sure we can reach brokers
        drop(
            producer
                .client()
                .fetch_metadata(None, Timeout::After(metadata_timeout))
                .map_err(|e| {
                    error!("failed to fetch metadata from Kafka brokers: {:?}", e);
                    KafkaClientError::Configuration(format!("brokers unreachable: {e}"))
                })?,
        );
        info!("connected to Kafka brokers");

        Ok(Self {
            producer,
            metadata_timeout,
        })
    }
}

#[async_trait]
impl ProduceTransport for KafkaProducer {
    async fn partition_count(&self, topic: &str) -> Result<usize, KafkaClientError> {
        let producer = self.producer.clone();
        let timeout = self.metadata_timeout;
        let name = topic.to_string();

        tokio::task::spawn_blocking(move || {
            let metadata = producer
                .client()
                .fetch_metadata(Some(&name), Timeout::After(timeout))?;
            let Some(topic) = metadata.topics().iter().find(|t| t.name() == name) else {
                return Err(KafkaClientError::Configuration(format!(
                    "topic {name} not found in cluster metadata"
                )));
            };
            if let Some(err) = topic.error() {
                return Err(KafkaClientError::Configuration(format!(
                    "topic {name} metadata error: {:?}",
                    RDKafkaErrorCode::from(err)
                )));
            }
            Ok(topic.partitions().len())
        })
        .await
        .map_err(|e| KafkaClientError::Transient(format!("metadata task failed: {e}")))?
    }

    async fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Bytes,
        value: Bytes,
        timeout: Duration,
    ) -> Result<Delivery, KafkaClientError> {
        let delivery = match self.producer.send_result(FutureRecord {
            topic,
            payload: Some(value.as_ref()),
            partition: Some(partition),
            key: Some(key.as_ref()),
            timestamp: None,
            headers: None,
        }) {
            Ok(delivery) => delivery,
            Err((e, _)) => {
                error!("failed to enqueue record: {}", e);
                return Err(e.into());
            }
        };

        match tokio::time::timeout(timeout, delivery).await {
            Err(_) => Err(KafkaClientError::Timeout(timeout)),
            Ok(Err(_)) => Err(KafkaClientError::Transient(
                "delivery cancelled by the producer".to_string(),
            )),
            Ok(Ok(Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut), _)))) => {
                Err(KafkaClientError::Timeout(timeout))
            }
            Ok(Ok(Err((err, _)))) => Err(err.into()),
            Ok(Ok(Ok((partition, offset)))) => Ok(Delivery { partition, offset }),
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), KafkaClientError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| KafkaClientError::Transient(format!("flush task failed: {e}")))?
            .map_err(KafkaClientError::from)
    }
}
