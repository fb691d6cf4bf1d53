use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, info, warn};

use crate::config::ConsumerConfig;
use crate::error::KafkaClientError;
use crate::offset_tracker::OffsetTracker;
use crate::transport::GroupTransport;
use crate::types::{GroupEvent, Partition, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Joining,
    Assigned,
    Fetching,
    Rebalancing,
    Closed,
}

/// A consumer group member for one topic.
///
/// Tracks the partitions it owns and the next offset it expects on each, so
/// records are yielded in strictly increasing offset order per partition and
/// records for partitions it no longer owns never reach the caller.
pub struct Subscriber<T> {
    transport: T,
    tracker: Arc<OffsetTracker>,
    group: String,
    topic: String,
    join_attempts: u32,
    poll_timeout: Duration,
    state: SubscriberState,
    // Owned partitions, with the next expected offset. `None` reads from the earliest.
    positions: HashMap<Partition, Option<i64>>,
    buffer: VecDeque<Record>,
    // Revoked since the last `take_revoked`
    revoked: Vec<Partition>,
}

impl<T: GroupTransport> Subscriber<T> {
    pub fn new(
        transport: T,
        tracker: Arc<OffsetTracker>,
        topic: impl Into<String>,
        config: &ConsumerConfig,
    ) -> Self {
        Self {
            transport,
            tracker,
            group: config.kafka_consumer_group.clone(),
            topic: topic.into(),
            join_attempts: config.kafka_consumer_join_attempts.max(1),
            poll_timeout: config.poll_timeout(),
            state: SubscriberState::Joining,
            positions: HashMap::new(),
            buffer: VecDeque::new(),
            revoked: Vec::new(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> SubscriberState {
        self.state
    }

    pub fn assignment(&self) -> Vec<Partition> {
        let mut partitions: Vec<Partition> = self.positions.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    /// Partitions revoked since the last call, including ones that were
    /// assigned back since.
    pub fn take_revoked(&mut self) -> Vec<Partition> {
        std::mem::take(&mut self.revoked)
    }

    fn ensure_open(&self) -> Result<(), KafkaClientError> {
        if self.state == SubscriberState::Closed {
            Err(KafkaClientError::Closed)
        } else {
            Ok(())
        }
    }

    /// Announce membership and wait for the first assignment. Every failed
    /// announce and every empty poll uses up one of the join attempts.
    pub async fn join(&mut self) -> Result<(), KafkaClientError> {
        self.ensure_open()?;
        self.state = SubscriberState::Joining;
        info!(group = %self.group, topic = %self.topic, "joining consumer group");

        let mut announced = false;
        let mut last_error = None;
        for attempt in 1..=self.join_attempts {
            if !announced {
                match self.transport.join(&self.group, &self.topic).await {
                    Ok(()) => announced = true,
                    Err(e) if e.is_retryable() => {
                        warn!(attempt, group = %self.group, "failed to join group: {}", e);
                        last_error = Some(e.to_string());
                        tokio::time::sleep(self.poll_timeout).await;
                        continue;
                    }
                    Err(e) => {
                        return Err(KafkaClientError::Join {
                            group: self.group.clone(),
                            reason: e.to_string(),
                        })
                    }
                }
            }

            match self.transport.poll(self.poll_timeout).await {
                Ok(Some(event)) => {
                    self.handle_event(event).await?;
                    if self.state == SubscriberState::Assigned {
                        info!(
                            group = %self.group,
                            partitions = self.positions.len(),
                            "joined consumer group"
                        );
                        return Ok(());
                    }
                }
                Ok(None) => debug!(attempt, group = %self.group, "waiting for assignment"),
                Err(e) if e.is_retryable() => {
                    warn!(attempt, group = %self.group, "poll failed while joining: {}", e);
                    last_error = Some(e.to_string());
                    tokio::time::sleep(self.poll_timeout).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(KafkaClientError::Join {
            group: self.group.clone(),
            reason: last_error.unwrap_or_else(|| {
                format!("no assignment after {} attempts", self.join_attempts)
            }),
        })
    }

    /// The next record in order, or `None` when a poll came back empty.
    pub async fn next_record(&mut self) -> Result<Option<Record>, KafkaClientError> {
        self.ensure_open()?;
        loop {
            while let Some(record) = self.buffer.pop_front() {
                if let Some(record) = self.accept(record) {
                    self.state = SubscriberState::Fetching;
                    return Ok(Some(record));
                }
            }

            match self.transport.poll(self.poll_timeout).await? {
                Some(event) => self.handle_event(event).await?,
                None => return Ok(None),
            }
        }
    }

    fn accept(&mut self, record: Record) -> Option<Record> {
        let partition = record.topic_partition();
        let Some(expected) = self.positions.get_mut(&partition) else {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = record.offset(),
                "dropping record for unowned partition"
            );
            counter!("kafka_client_records_dropped_total", "reason" => "unowned").increment(1);
            return None;
        };

        if matches!(expected, Some(next) if record.offset() < *next) {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = record.offset(),
                "dropping already delivered record"
            );
            counter!("kafka_client_records_dropped_total", "reason" => "behind").increment(1);
            return None;
        }

        *expected = Some(record.offset() + 1);
        Some(record)
    }

    /// Apply one group event. The transport feeds these through `poll`; tests
    /// drive membership changes through here directly.
    pub async fn handle_event(&mut self, event: GroupEvent) -> Result<(), KafkaClientError> {
        self.ensure_open()?;
        match event {
            GroupEvent::Assigned(partitions) => {
                for partition in partitions {
                    let start = self.resume_position(&partition).await;
                    if let Some(offset) = start {
                        if let Err(e) = self.transport.seek(&partition, offset).await {
                            warn!(
                                topic = partition.topic(),
                                partition = partition.partition_number(),
                                offset,
                                "failed to seek to committed cursor: {}",
                                e
                            );
                        }
                    }
                    self.positions.insert(partition, start);
                }
                self.state = SubscriberState::Assigned;
            }
            GroupEvent::Revoked(partitions) => {
                self.state = SubscriberState::Rebalancing;
                for partition in &partitions {
                    self.positions.remove(partition);
                }
                let before = self.buffer.len();
                self.buffer
                    .retain(|record| !partitions.contains(&record.topic_partition()));
                self.tracker.forget(&self.group, &partitions);
                self.revoked.extend(partitions.iter().cloned());
                info!(
                    group = %self.group,
                    revoked = partitions.len(),
                    discarded = before - self.buffer.len(),
                    "partitions revoked"
                );
            }
            GroupEvent::Records(records) => self.buffer.extend(records),
        }
        Ok(())
    }

    async fn resume_position(&self, partition: &Partition) -> Option<i64> {
        match self.tracker.last_committed(&self.group, partition).await {
            Ok(committed) => Some(committed + 1),
            Err(KafkaClientError::NotFound { .. }) => None,
            Err(e) => {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    "failed to load committed cursor, reading from the group default: {}",
                    e
                );
                None
            }
        }
    }

    /// Leave the group. Every later call fails with `Closed`.
    pub async fn close(&mut self) -> Result<(), KafkaClientError> {
        if self.state == SubscriberState::Closed {
            return Ok(());
        }
        self.state = SubscriberState::Closed;
        self.positions.clear();
        self.buffer.clear();
        self.revoked.clear();
        info!(group = %self.group, "leaving consumer group");
        self.transport.leave().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MemoryCluster, MemoryMember};
    use crate::transport::{CursorStore, ProduceTransport};
    use crate::types::Cursor;
    use bytes::Bytes;
    use envconfig::Envconfig;
    use time::OffsetDateTime;

    fn config() -> ConsumerConfig {
        let mut config = ConsumerConfig::init_from_hashmap(&Default::default()).unwrap();
        config.kafka_consumer_join_attempts = 3;
        config.kafka_consumer_poll_timeout_ms = 20;
        config
    }

    fn subscriber(cluster: &MemoryCluster) -> Subscriber<MemoryMember> {
        let tracker = Arc::new(OffsetTracker::new(Arc::new(cluster.clone()), false));
        Subscriber::new(cluster.member(), tracker, "users", &config())
    }

    async fn produce(cluster: &MemoryCluster, partition: i32, count: usize) {
        for i in 0..count {
            cluster
                .produce(
                    "users",
                    partition,
                    Bytes::from(format!("k{i}")),
                    Bytes::from(format!("v{i}")),
                    Duration::from_secs(1),
                )
                .await
                .unwrap();
        }
    }

    fn record(partition: i32, offset: i64) -> Record {
        Record::new(
            "users",
            partition,
            offset,
            Bytes::new(),
            Bytes::from_static(b"{}"),
            OffsetDateTime::UNIX_EPOCH,
        )
    }

    #[tokio::test]
    async fn joins_and_reads_in_order() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("users", 2);
        produce(&cluster, 0, 3).await;

        let mut subscriber = subscriber(&cluster);
        subscriber.join().await.unwrap();
        assert_eq!(subscriber.state(), SubscriberState::Assigned);
        assert_eq!(
            subscriber.assignment(),
            vec![Partition::new("users", 0), Partition::new("users", 1)]
        );

        let mut offsets = Vec::new();
        while let Some(record) = subscriber.next_record().await.unwrap() {
            offsets.push(record.offset());
        }
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(subscriber.state(), SubscriberState::Fetching);
    }

    #[tokio::test]
    async fn join_gives_up_on_unreachable_cluster() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("users", 1);
        cluster.set_unreachable(true);

        let mut subscriber = subscriber(&cluster);
        match subscriber.join().await {
            Err(KafkaClientError::Join { group, .. }) => assert_eq!(group, "users-consumer-group"),
            other => panic!("expected join error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_gives_up_without_partitions() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("users", 0);

        let mut subscriber = subscriber(&cluster);
        assert!(matches!(
            subscriber.join().await,
            Err(KafkaClientError::Join { .. })
        ));
    }

    #[tokio::test]
    async fn resumes_after_committed_cursor() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("users", 1);
        produce(&cluster, 0, 5).await;
        cluster
            .store(&Cursor {
                group: "users-consumer-group".to_string(),
                partition: Partition::new("users", 0),
                committed_offset: 2,
            })
            .await
            .unwrap();

        let mut subscriber = subscriber(&cluster);
        subscriber.join().await.unwrap();
        let first = subscriber.next_record().await.unwrap().unwrap();
        assert_eq!(first.offset(), 3);
    }

    #[tokio::test]
    async fn drops_duplicates_and_unowned_records() {
        let cluster = MemoryCluster::new();
        let mut subscriber = subscriber(&cluster);
        subscriber
            .handle_event(GroupEvent::Assigned(vec![Partition::new("users", 0)]))
            .await
            .unwrap();

        subscriber
            .handle_event(GroupEvent::Records(vec![
                record(0, 0),
                record(0, 1),
                record(1, 0),
                record(0, 1),
                record(0, 2),
            ]))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(record) = subscriber.next_record().await.unwrap() {
            seen.push((record.partition(), record.offset()));
        }
        assert_eq!(seen, vec![(0, 0), (0, 1), (0, 2)]);
    }

    #[tokio::test]
    async fn revocation_discards_in_flight_records() {
        let cluster = MemoryCluster::new();
        let mut subscriber = subscriber(&cluster);
        subscriber
            .handle_event(GroupEvent::Assigned(vec![
                Partition::new("users", 0),
                Partition::new("users", 1),
            ]))
            .await
            .unwrap();
        subscriber
            .handle_event(GroupEvent::Records(vec![record(0, 0), record(1, 0)]))
            .await
            .unwrap();

        subscriber
            .handle_event(GroupEvent::Revoked(vec![Partition::new("users", 0)]))
            .await
            .unwrap();
        assert_eq!(subscriber.state(), SubscriberState::Rebalancing);
        assert_eq!(subscriber.assignment(), vec![Partition::new("users", 1)]);
        assert_eq!(subscriber.take_revoked(), vec![Partition::new("users", 0)]);
        assert!(subscriber.take_revoked().is_empty());

        let next = subscriber.next_record().await.unwrap().unwrap();
        assert_eq!(next.partition(), 1);
        assert!(subscriber.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_subscriber_refuses_work() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("users", 1);
        let mut subscriber = subscriber(&cluster);
        subscriber.join().await.unwrap();

        subscriber.close().await.unwrap();
        assert_eq!(subscriber.state(), SubscriberState::Closed);
        assert!(subscriber.assignment().is_empty());
        assert_eq!(
            subscriber.next_record().await.unwrap_err(),
            KafkaClientError::Closed
        );
        assert_eq!(subscriber.join().await.unwrap_err(), KafkaClientError::Closed);
        // Closing twice is fine
        subscriber.close().await.unwrap();
    }
}
