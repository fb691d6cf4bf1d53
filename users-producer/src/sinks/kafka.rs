use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common_kafka::{ProduceTransport, ProducerRecord, Publisher};
use metrics::counter;
use tracing::{debug, instrument};

use crate::api::ApiError;
use crate::sinks::UserSink;

pub struct KafkaSink<T> {
    publisher: Publisher<T>,
    timeout: Duration,
}

impl<T: ProduceTransport> KafkaSink<T> {
    pub fn new(publisher: Publisher<T>, timeout: Duration) -> Self {
        Self { publisher, timeout }
    }
}

#[async_trait]
impl<T: ProduceTransport + 'static> UserSink for KafkaSink<T> {
    #[instrument(skip_all)]
    async fn send(&self, key: &str, payload: Bytes) -> Result<(), ApiError> {
        let record = ProducerRecord::new(Bytes::copy_from_slice(key.as_bytes()), payload);
        let delivery = self.publisher.send(record, self.timeout).await?;

        debug!(
            partition = delivery.partition,
            offset = delivery.offset,
            "user published"
        );
        counter!("users_published_total").increment(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_kafka::mock::MemoryCluster;
    use common_kafka::{ConnectionPool, KafkaClientError, KafkaConfig};
    use envconfig::Envconfig;
    use std::collections::HashMap;

    async fn sink() -> (MemoryCluster, KafkaSink<MemoryCluster>) {
        let cluster = MemoryCluster::new();
        cluster.create_topic("users", 3);
        let pool = ConnectionPool::new(KafkaConfig::init_from_hashmap(&HashMap::new()).unwrap());
        let publisher = Publisher::new(pool, cluster.clone()).await.unwrap();
        (cluster, KafkaSink::new(publisher, Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn keys_records_by_email() {
        let (cluster, sink) = sink().await;
        sink.send("ada@example.com", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let records: Vec<_> = (0..3).flat_map(|p| cluster.records("users", p)).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key(), b"ada@example.com");
        assert_eq!(records[0].value(), b"{}");
    }

    #[tokio::test]
    async fn publish_failures_surface() {
        let (cluster, sink) = sink().await;
        cluster.fail_next_produce(KafkaClientError::Transient("broker down".to_string()));

        assert!(matches!(
            sink.send("ada@example.com", Bytes::from_static(b"{}")).await,
            Err(ApiError::PublishError(KafkaClientError::Transient(_)))
        ));
    }
}
