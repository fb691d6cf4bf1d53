use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConsumerConfig, MalformedPolicy};
use crate::error::KafkaClientError;
use crate::offset_tracker::OffsetTracker;
use crate::subscriber::Subscriber;
use crate::transport::GroupTransport;
use crate::types::{Partition, Record};

/// What the read loop should do with a record once the callback returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitDecision {
    /// Processed, commit its cursor before the next pull.
    Commit,
    /// Processed, leave the cursor where it is.
    Hold,
    /// The record could not be decoded.
    Malformed(String),
}

pub struct ReadLoop<T> {
    subscriber: Subscriber<T>,
    tracker: Arc<OffsetTracker>,
    policy: MalformedPolicy,
    retry_backoff: Duration,
    // Highest offset a commit may reach per partition, below a malformed record
    ceilings: HashMap<Partition, i64>,
}

impl<T: GroupTransport> ReadLoop<T> {
    pub fn new(
        subscriber: Subscriber<T>,
        tracker: Arc<OffsetTracker>,
        config: &ConsumerConfig,
    ) -> Self {
        Self {
            subscriber,
            tracker,
            policy: config.kafka_consumer_malformed_policy,
            retry_backoff: config.retry_backoff(),
            ceilings: HashMap::new(),
        }
    }

    pub fn subscriber(&self) -> &Subscriber<T> {
        &self.subscriber
    }

    /// Join the group and hand every record to `on_record`, one at a time,
    /// until `cancel` fires or a fatal error occurs. The subscriber is closed
    /// on the way out either way.
    pub async fn run<F>(
        &mut self,
        cancel: CancellationToken,
        mut on_record: F,
    ) -> Result<(), KafkaClientError>
    where
        F: FnMut(&Record) -> CommitDecision,
    {
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            joined = self.subscriber.join() => Some(joined),
        };
        let Some(joined) = joined else {
            info!("cancelled before joining");
            return self.shutdown().await;
        };
        if let Err(e) = joined {
            error!("failed to join consumer group: {}", e);
            self.close_quietly().await;
            return Err(e);
        }

        while !cancel.is_cancelled() {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.subscriber.next_record() => next,
            };
            self.drop_revoked_ceilings();

            match next {
                Ok(Some(record)) => self.process(&record, &mut on_record).await,
                Ok(None) => continue,
                Err(e) if e.is_retryable() => {
                    warn!("error reading from Kafka, backing off: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
                Err(e) => {
                    error!("fatal error reading from Kafka: {}", e);
                    self.close_quietly().await;
                    return Err(e);
                }
            }
        }

        info!("read loop cancelled");
        self.shutdown().await
    }

    async fn process<F>(&mut self, record: &Record, on_record: &mut F)
    where
        F: FnMut(&Record) -> CommitDecision,
    {
        let partition = record.topic_partition();

        // The cursor was rewound onto the malformed record, it gets a new verdict
        if self
            .ceilings
            .get(&partition)
            .is_some_and(|ceiling| record.offset() <= ceiling + 1)
        {
            self.ceilings.remove(&partition);
        }

        match on_record(record) {
            CommitDecision::Commit => {
                counter!("kafka_client_records_total", "decision" => "commit").increment(1);
                self.commit(&partition, record.offset()).await;
            }
            CommitDecision::Hold => {
                counter!("kafka_client_records_total", "decision" => "hold").increment(1);
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = record.offset(),
                    "holding record, not committed"
                );
            }
            CommitDecision::Malformed(reason) => {
                counter!("kafka_client_records_total", "decision" => "malformed").increment(1);
                let err = KafkaClientError::Decode {
                    partition: partition.clone(),
                    offset: record.offset(),
                    reason,
                };
                warn!(policy = ?self.policy, "{}", err);

                match self.policy {
                    MalformedPolicy::SkipAndCommit => {
                        self.commit(&partition, record.offset()).await
                    }
                    MalformedPolicy::RetryOnRestart => {
                        let ceiling = self
                            .ceilings
                            .entry(partition)
                            .or_insert(record.offset() - 1);
                        *ceiling = (*ceiling).min(record.offset() - 1);
                    }
                }
            }
        }
    }

    // Whoever owns a revoked partition next resumes at its committed cursor,
    // below any malformed record, so the cap is no longer needed here
    fn drop_revoked_ceilings(&mut self) {
        for partition in self.subscriber.take_revoked() {
            if let Some(ceiling) = self.ceilings.remove(&partition) {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    ceiling,
                    "partition revoked, dropping commit ceiling"
                );
            }
        }
    }

    async fn commit(&self, partition: &Partition, offset: i64) {
        let target = match self.ceilings.get(partition) {
            Some(ceiling) => offset.min(*ceiling),
            None => offset,
        };
        if target < 0 {
            return;
        }

        if let Err(e) = self
            .tracker
            .commit(self.subscriber.group(), partition, target)
            .await
        {
            error!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = target,
                "failed to commit offset: {}",
                e
            );
        }
    }

    async fn shutdown(&mut self) -> Result<(), KafkaClientError> {
        self.subscriber.close().await
    }

    async fn close_quietly(&mut self) {
        if let Err(e) = self.subscriber.close().await {
            warn!("failed to leave consumer group: {}", e);
        }
    }
}
