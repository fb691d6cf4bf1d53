//! Offset Tracker - durable consumption cursors per (group, partition)
//!
//! Cursors only move forward. Committing at or behind the current cursor is a
//! no-op, or a `StaleOffset` error in strict mode when strictly behind.
//! Durability is delegated to a [`CursorStore`]; the tracker keeps the highest
//! cursor it has seen so repeated commits don't reach the broker.

use std::sync::Arc;

use dashmap::DashMap;
use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::KafkaClientError;
use crate::transport::CursorStore;
use crate::types::{Cursor, Partition};

pub struct OffsetTracker {
    store: Arc<dyn CursorStore>,
    /// Highest committed offset seen per (group, partition)
    committed: DashMap<(String, Partition), i64>,
    strict: bool,
    /// Serialises commits, so two cursors for one partition never race
    commit_lock: Mutex<()>,
}

impl OffsetTracker {
    pub fn new(store: Arc<dyn CursorStore>, strict: bool) -> Self {
        Self {
            store,
            committed: DashMap::new(),
            strict,
            commit_lock: Mutex::new(()),
        }
    }

    /// Durably record `offset` as the last processed record of `partition`.
    pub async fn commit(
        &self,
        group: &str,
        partition: &Partition,
        offset: i64,
    ) -> Result<(), KafkaClientError> {
        let _guard = self.commit_lock.lock().await;

        let current = match self.last_committed(group, partition).await {
            Ok(current) => Some(current),
            Err(KafkaClientError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        if let Some(current) = current {
            if offset < current && self.strict {
                warn!(
                    group,
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset,
                    committed = current,
                    "Refusing stale offset commit"
                );
                return Err(KafkaClientError::StaleOffset {
                    partition: partition.clone(),
                    offset,
                    committed: current,
                });
            }
            if offset <= current {
                debug!(
                    group,
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset,
                    committed = current,
                    "Offset already committed, skipping"
                );
                return Ok(());
            }
        }

        let cursor = Cursor {
            group: group.to_string(),
            partition: partition.clone(),
            committed_offset: offset,
        };
        if let Err(e) = self.store.store(&cursor).await {
            counter!("kafka_client_commit_total", "outcome" => "failed").increment(1);
            return Err(e);
        }

        self.committed
            .insert((group.to_string(), partition.clone()), offset);
        counter!("kafka_client_commit_total", "outcome" => "committed").increment(1);
        debug!(
            group,
            topic = partition.topic(),
            partition = partition.partition_number(),
            offset,
            "Committed offset"
        );
        Ok(())
    }

    /// The last committed offset, from cache or the cursor store.
    pub async fn last_committed(
        &self,
        group: &str,
        partition: &Partition,
    ) -> Result<i64, KafkaClientError> {
        let key = (group.to_string(), partition.clone());
        if let Some(offset) = self.committed.get(&key).map(|entry| *entry) {
            return Ok(offset);
        }

        match self.store.load(group, partition).await? {
            Some(offset) => {
                // A concurrent commit may have cached a newer value meanwhile
                let mut entry = self.committed.entry(key).or_insert(offset);
                if *entry < offset {
                    *entry = offset;
                }
                Ok(*entry)
            }
            None => Err(KafkaClientError::NotFound {
                group: group.to_string(),
                partition: partition.clone(),
            }),
        }
    }

    /// Drop cached cursors for partitions this member no longer owns.
    pub fn forget(&self, group: &str, partitions: &[Partition]) {
        for partition in partitions {
            self.committed
                .remove(&(group.to_string(), partition.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingStore {
        stored: StdMutex<Vec<Cursor>>,
        fail: StdMutex<bool>,
    }

    #[async_trait]
    impl CursorStore for RecordingStore {
        async fn store(&self, cursor: &Cursor) -> Result<(), KafkaClientError> {
            if *self.fail.lock().unwrap() {
                return Err(KafkaClientError::Transient("store down".to_string()));
            }
            self.stored.lock().unwrap().push(cursor.clone());
            Ok(())
        }

        async fn load(
            &self,
            group: &str,
            partition: &Partition,
        ) -> Result<Option<i64>, KafkaClientError> {
            Ok(self
                .stored
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|c| c.group == group && &c.partition == partition)
                .map(|c| c.committed_offset))
        }
    }

    fn tracker(strict: bool) -> (Arc<RecordingStore>, OffsetTracker) {
        let store = Arc::new(RecordingStore::default());
        let tracker = OffsetTracker::new(store.clone(), strict);
        (store, tracker)
    }

    #[tokio::test]
    async fn unknown_cursor_is_not_found() {
        let (_, tracker) = tracker(false);
        let err = tracker
            .last_committed("g", &Partition::new("users", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, KafkaClientError::NotFound { .. }));
    }

    #[tokio::test]
    async fn commit_is_idempotent_and_never_regresses() {
        let (store, tracker) = tracker(false);
        let partition = Partition::new("users", 0);

        tracker.commit("g", &partition, 5).await.unwrap();
        tracker.commit("g", &partition, 5).await.unwrap();
        tracker.commit("g", &partition, 3).await.unwrap();

        assert_eq!(tracker.last_committed("g", &partition).await.unwrap(), 5);
        assert_eq!(store.stored.lock().unwrap().len(), 1);

        tracker.commit("g", &partition, 7).await.unwrap();
        assert_eq!(tracker.last_committed("g", &partition).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn strict_mode_rejects_stale_offsets() {
        let (_, tracker) = tracker(true);
        let partition = Partition::new("users", 1);

        tracker.commit("g", &partition, 10).await.unwrap();
        // Equal is still a no-op
        tracker.commit("g", &partition, 10).await.unwrap();

        match tracker.commit("g", &partition, 9).await {
            Err(KafkaClientError::StaleOffset {
                offset, committed, ..
            }) => {
                assert_eq!(offset, 9);
                assert_eq!(committed, 10);
            }
            other => panic!("expected stale offset, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn groups_are_independent() {
        let (_, tracker) = tracker(false);
        let partition = Partition::new("users", 0);

        tracker.commit("a", &partition, 4).await.unwrap();
        tracker.commit("b", &partition, 1).await.unwrap();

        assert_eq!(tracker.last_committed("a", &partition).await.unwrap(), 4);
        assert_eq!(tracker.last_committed("b", &partition).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_store_leaves_cursor_untouched() {
        let (store, tracker) = tracker(false);
        let partition = Partition::new("users", 0);
        tracker.commit("g", &partition, 2).await.unwrap();

        *store.fail.lock().unwrap() = true;
        assert!(tracker.commit("g", &partition, 3).await.is_err());
        assert_eq!(tracker.last_committed("g", &partition).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn forget_reloads_from_store() {
        let (store, tracker) = tracker(false);
        let partition = Partition::new("users", 0);
        tracker.commit("g", &partition, 2).await.unwrap();

        // Another member advanced the cursor
        store.stored.lock().unwrap().push(Cursor {
            group: "g".to_string(),
            partition: partition.clone(),
            committed_offset: 8,
        });
        assert_eq!(tracker.last_committed("g", &partition).await.unwrap(), 2);

        tracker.forget("g", &[partition.clone()]);
        assert_eq!(tracker.last_committed("g", &partition).await.unwrap(), 8);
    }
}
