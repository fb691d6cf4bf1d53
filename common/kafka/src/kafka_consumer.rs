use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ConsumerConfig;
use crate::connection::ConnectionPool;
use crate::error::KafkaClientError;
use crate::transport::{CursorStore, GroupTransport};
use crate::types::{Cursor, GroupEvent, Partition, Record};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Turns librdkafka rebalance callbacks into [`GroupEvent`]s. The callbacks
/// run on the polling thread, so they only enqueue.
pub struct GroupContext {
    events: mpsc::UnboundedSender<GroupEvent>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                let revoked = partitions_of(partitions);
                info!(count = revoked.len(), "partitions revoked");
                counter!("kafka_client_rebalance_total", "kind" => "revoke").increment(1);
                if self.events.send(GroupEvent::Revoked(revoked)).is_err() {
                    warn!("group consumer gone, dropping revocation");
                }
            }
            Rebalance::Assign(_) => debug!("pre-rebalance assign"),
            Rebalance::Error(e) => warn!("rebalance error: {}", e),
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                let assigned = partitions_of(partitions);
                info!(count = assigned.len(), "partitions assigned");
                counter!("kafka_client_rebalance_total", "kind" => "assign").increment(1);
                if self.events.send(GroupEvent::Assigned(assigned)).is_err() {
                    warn!("group consumer gone, dropping assignment");
                }
            }
            Rebalance::Revoke(_) => debug!("post-rebalance revoke"),
            Rebalance::Error(e) => warn!("rebalance error: {}", e),
        }
    }
}

fn partitions_of(list: &TopicPartitionList) -> Vec<Partition> {
    list.elements().into_iter().map(Partition::from).collect()
}

/// One member of a Kafka consumer group, with manual commits only.
pub struct KafkaGroupConsumer {
    group: String,
    consumer: Arc<StreamConsumer<GroupContext>>,
    events: mpsc::UnboundedReceiver<GroupEvent>,
    stash: VecDeque<GroupEvent>,
}

impl KafkaGroupConsumer {
    pub fn new(pool: &ConnectionPool, config: &ConsumerConfig) -> Result<Self, KafkaClientError> {
        pool.ensure_open()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let consumer: StreamConsumer<GroupContext> = pool
            .consumer_config(config)
            .create_with_context(GroupContext { events: tx })?;

        Ok(Self {
            group: config.kafka_consumer_group.clone(),
            consumer: Arc::new(consumer),
            events: rx,
            stash: VecDeque::new(),
        })
    }

    /// A cursor store committing through this member's group session.
    pub fn cursor_store(&self, metadata_timeout: Duration) -> KafkaCursorStore {
        KafkaCursorStore {
            group: self.group.clone(),
            consumer: self.consumer.clone(),
            timeout: metadata_timeout,
        }
    }
}

#[async_trait]
impl GroupTransport for KafkaGroupConsumer {
    async fn join(&mut self, group: &str, topic: &str) -> Result<(), KafkaClientError> {
        info!(group, topic, "subscribing");
        self.consumer.subscribe(&[topic])?;
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<GroupEvent>, KafkaClientError> {
        if let Some(event) = self.stash.pop_front() {
            return Ok(Some(event));
        }
        if let Ok(event) = self.events.try_recv() {
            return Ok(Some(event));
        }

        let record = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            // Rebalance callbacks may have fired while we waited
            Err(_) => return Ok(self.events.try_recv().ok()),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(message)) => Record::from(&message.detach()),
        };

        // Membership changes that landed before this record are surfaced first
        while let Ok(event) = self.events.try_recv() {
            self.stash.push_back(event);
        }
        self.stash.push_back(GroupEvent::Records(vec![record]));
        Ok(self.stash.pop_front())
    }

    async fn seek(&mut self, partition: &Partition, offset: i64) -> Result<(), KafkaClientError> {
        let consumer = self.consumer.clone();
        let partition = partition.clone();
        tokio::task::spawn_blocking(move || {
            consumer.seek(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(offset),
                SEEK_TIMEOUT,
            )
        })
        .await
        .map_err(|e| KafkaClientError::Transient(format!("seek task failed: {e}")))??;
        Ok(())
    }

    async fn leave(&mut self) -> Result<(), KafkaClientError> {
        info!("leaving consumer group");
        self.consumer.unsubscribe();
        self.stash.clear();
        Ok(())
    }
}

/// Cursors stored as Kafka group commits. Kafka stores the next offset to
/// read, so the committed value is shifted by one on the wire.
#[derive(Clone)]
pub struct KafkaCursorStore {
    group: String,
    consumer: Arc<StreamConsumer<GroupContext>>,
    timeout: Duration,
}

impl KafkaCursorStore {
    // Commits go through the member's own session, so only its group is reachable
    fn check_group(&self, group: &str) -> Result<(), KafkaClientError> {
        if group != self.group {
            return Err(KafkaClientError::Configuration(format!(
                "cursor store is bound to group {}, not {group}",
                self.group
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CursorStore for KafkaCursorStore {
    async fn store(&self, cursor: &Cursor) -> Result<(), KafkaClientError> {
        self.check_group(&cursor.group)?;

        let mut list = TopicPartitionList::new();
        list.add_partition_offset(
            cursor.partition.topic(),
            cursor.partition.partition_number(),
            Offset::Offset(cursor.committed_offset + 1),
        )?;

        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync))
            .await
            .map_err(|e| KafkaClientError::Transient(format!("commit task failed: {e}")))??;
        Ok(())
    }

    async fn load(
        &self,
        group: &str,
        partition: &Partition,
    ) -> Result<Option<i64>, KafkaClientError> {
        self.check_group(group)?;

        let mut list = TopicPartitionList::new();
        list.add_partition(partition.topic(), partition.partition_number());

        let consumer = self.consumer.clone();
        let timeout = self.timeout;
        let committed =
            tokio::task::spawn_blocking(move || consumer.committed_offsets(list, timeout))
                .await
                .map_err(|e| {
                    KafkaClientError::Transient(format!("committed offsets task failed: {e}"))
                })??;

        let offset = committed
            .find_partition(partition.topic(), partition.partition_number())
            .map(|elem| elem.offset());
        Ok(match offset {
            Some(Offset::Offset(next)) if next > 0 => Some(next - 1),
            _ => None,
        })
    }
}
