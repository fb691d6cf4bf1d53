use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use common_kafka::mock::MemoryCluster;
use common_kafka::{
    ConnectionPool, KafkaClientError, KafkaConfig, PartitionerPolicy, ProducerRecord, Publisher,
};
use envconfig::Envconfig;
use futures::future::join_all;

const TIMEOUT: Duration = Duration::from_secs(1);

fn pool(policy: PartitionerPolicy) -> ConnectionPool {
    let mut config = KafkaConfig::init_from_hashmap(&HashMap::new()).unwrap();
    config.kafka_partitioner = policy;
    ConnectionPool::new(config)
}

async fn publisher(
    partitions: usize,
    policy: PartitionerPolicy,
) -> (MemoryCluster, ConnectionPool, Publisher<MemoryCluster>) {
    let cluster = MemoryCluster::new();
    cluster.create_topic("users", partitions);
    let pool = pool(policy);
    let publisher = Publisher::new(pool.clone(), cluster.clone())
        .await
        .expect("failed to create publisher");
    (cluster, pool, publisher)
}

#[tokio::test]
async fn same_key_records_keep_their_order() {
    let (cluster, _, publisher) = publisher(3, PartitionerPolicy::LeastLoadedSticky).await;

    let mut partitions = Vec::new();
    for i in 0..10 {
        let delivery = publisher
            .send(
                ProducerRecord::new("ada@example.com", format!("{{\"seq\":{i}}}")),
                TIMEOUT,
            )
            .await
            .unwrap();
        partitions.push(delivery.partition);
    }
    partitions.dedup();
    assert_eq!(partitions.len(), 1);

    let values: Vec<Bytes> = cluster
        .records("users", partitions[0])
        .iter()
        .map(|r| Bytes::copy_from_slice(r.value()))
        .collect();
    let expected: Vec<Bytes> = (0..10)
        .map(|i| Bytes::from(format!("{{\"seq\":{i}}}")))
        .collect();
    assert_eq!(values, expected);
}

#[tokio::test]
async fn new_keys_go_to_least_loaded_partition() {
    let (_, pool, publisher) = publisher(2, PartitionerPolicy::LeastLoadedSticky).await;

    let first = publisher
        .send(ProducerRecord::new("a@x.io", "0123456789"), TIMEOUT)
        .await
        .unwrap();
    let second = publisher
        .send(ProducerRecord::new("b@x.io", "x"), TIMEOUT)
        .await
        .unwrap();
    assert_ne!(first.partition, second.partition);

    let loads = pool.partition_loads("users", 2);
    assert_eq!(loads[first.partition as usize], 16);
    assert_eq!(loads[second.partition as usize], 7);
}

#[tokio::test]
async fn concurrent_sends_are_all_acknowledged() {
    let (cluster, _, publisher) = publisher(4, PartitionerPolicy::Hash).await;

    let sends = (0..50).map(|i| {
        let publisher = publisher.clone();
        tokio::spawn(async move {
            publisher
                .send(
                    ProducerRecord::new(format!("user-{}@x.io", i % 5), format!("{i}")),
                    TIMEOUT,
                )
                .await
        })
    });
    let results = join_all(sends).await;
    assert!(results.into_iter().all(|r| r.unwrap().is_ok()));
    publisher.flush(TIMEOUT).await.unwrap();

    let total: usize = (0..4).map(|p| cluster.records("users", p).len()).sum();
    assert_eq!(total, 50);
}

#[tokio::test]
async fn null_values_are_rejected_before_sending() {
    let (cluster, _, publisher) = publisher(1, PartitionerPolicy::default()).await;

    let record = ProducerRecord {
        key: Bytes::from_static(b"a@x.io"),
        value: None,
    };
    assert!(matches!(
        publisher.send(record, TIMEOUT).await,
        Err(KafkaClientError::InvalidRecord(_))
    ));
    assert!(cluster.records("users", 0).is_empty());
}

#[tokio::test]
async fn broker_failures_are_surfaced_without_retry() {
    let (cluster, _, publisher) = publisher(1, PartitionerPolicy::default()).await;

    cluster.fail_next_produce(KafkaClientError::BrokerRejected(
        "message too large".to_string(),
    ));
    assert!(matches!(
        publisher.send(ProducerRecord::new("k", "v"), TIMEOUT).await,
        Err(KafkaClientError::BrokerRejected(_))
    ));

    cluster.set_unreachable(true);
    let err = publisher
        .send(ProducerRecord::new("k", "v"), TIMEOUT)
        .await
        .unwrap_err();
    assert_eq!(err, KafkaClientError::Timeout(TIMEOUT));
    assert!(err.is_retryable());

    cluster.set_unreachable(false);
    assert!(publisher
        .send(ProducerRecord::new("k", "v"), TIMEOUT)
        .await
        .is_ok());
    assert_eq!(cluster.records("users", 0).len(), 1);
}

#[tokio::test]
async fn closed_pool_refuses_sends() {
    let (_, pool, publisher) = publisher(1, PartitionerPolicy::default()).await;
    pool.close(Duration::from_millis(10));

    assert_eq!(
        publisher
            .send(ProducerRecord::new("k", "v"), TIMEOUT)
            .await
            .unwrap_err(),
        KafkaClientError::Closed
    );
    assert!(matches!(
        Publisher::new(pool, MemoryCluster::new()).await,
        Err(KafkaClientError::Closed)
    ));
}

#[tokio::test]
async fn topic_without_partitions_is_a_configuration_error() {
    let cluster = MemoryCluster::new();
    cluster.create_topic("users", 0);
    assert!(matches!(
        Publisher::new(pool(PartitionerPolicy::default()), cluster).await,
        Err(KafkaClientError::Configuration(_))
    ));
}

#[tokio::test]
async fn refresh_picks_up_new_partitions() {
    let (cluster, _, publisher) = publisher(1, PartitionerPolicy::default()).await;
    assert_eq!(publisher.partition_count(), 1);

    cluster.create_topic("users", 3);
    assert_eq!(publisher.refresh_partitions().await.unwrap(), 3);

    let partitions: Vec<i32> = join_all((0..3).map(|_| {
        publisher.send(
            ProducerRecord {
                key: Bytes::new(),
                value: Some(Bytes::from_static(b"v")),
            },
            TIMEOUT,
        )
    }))
    .await
    .into_iter()
    .map(|r| r.unwrap().partition)
    .collect();
    let mut sorted = partitions.clone();
    sorted.sort();
    assert_eq!(sorted, vec![0, 1, 2]);
}
