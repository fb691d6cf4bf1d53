//! An in-process stand-in for a Kafka cluster.
//!
//! [`MemoryCluster`] keeps a partitioned log per topic, committed cursors per
//! group, and runs range assignment whenever group membership changes. It
//! implements every transport trait, so publishers, subscribers and read loops
//! can be exercised end to end without brokers. The hooks (`expel`,
//! `rebalance`, `fail_next_produce`, `set_unreachable`) script the failures a
//! real cluster produces.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::KafkaClientError;
use crate::transport::{CursorStore, GroupTransport, ProduceTransport};
use crate::types::{Cursor, Delivery, GroupEvent, Partition, Record};

const MAX_POLL_RECORDS: usize = 100;

#[derive(Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

#[derive(Default)]
struct ClusterInner {
    state: Mutex<ClusterState>,
    changed: Notify,
}

#[derive(Default)]
struct ClusterState {
    topics: HashMap<String, Vec<Vec<Record>>>,
    committed: HashMap<(String, Partition), i64>,
    members: BTreeMap<u64, MemberSlot>,
    next_member: u64,
    unreachable: bool,
    produce_failures: VecDeque<KafkaClientError>,
}

#[derive(Default)]
struct MemberSlot {
    group: Option<(String, String)>, // (group, topic) once joined
    assignment: Vec<Partition>,
    positions: HashMap<Partition, i64>,
    pending: VecDeque<GroupEvent>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        // A panicking test thread must not wedge the others
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Create `topic`, or grow it to `partitions`.
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut state = self.state();
        let logs = state.topics.entry(topic.to_string()).or_default();
        while logs.len() < partitions {
            logs.push(Vec::new());
        }
    }

    /// A new group member, not yet joined.
    pub fn member(&self) -> MemoryMember {
        let mut state = self.state();
        let id = state.next_member;
        state.next_member += 1;
        state.members.insert(id, MemberSlot::default());
        MemoryMember {
            id,
            cluster: self.clone(),
        }
    }

    /// Drop a member from its group as a missed heartbeat would. The member
    /// sees its partitions revoked; the rest of the group is rebalanced.
    pub fn expel(&self, member: u64) {
        let mut state = self.state();
        let Some(slot) = state.members.get_mut(&member) else {
            return;
        };
        let Some((group, _)) = slot.group.take() else {
            return;
        };
        let revoked = std::mem::take(&mut slot.assignment);
        slot.positions.clear();
        if !revoked.is_empty() {
            slot.pending.push_back(GroupEvent::Revoked(revoked));
        }
        debug!(member, group = %group, "member expelled");
        state.rebalance(&group, false);
        drop(state);
        self.inner.changed.notify_waiters();
    }

    /// Revoke and reassign every member of `group`, even when assignments
    /// do not change.
    pub fn rebalance(&self, group: &str) {
        self.state().rebalance(group, true);
        self.inner.changed.notify_waiters();
    }

    /// Make the next produce fail with `err`.
    pub fn fail_next_produce(&self, err: KafkaClientError) {
        self.state().produce_failures.push_back(err);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
        self.inner.changed.notify_waiters();
    }

    pub fn records(&self, topic: &str, partition: i32) -> Vec<Record> {
        self.state()
            .topics
            .get(topic)
            .and_then(|logs| logs.get(partition as usize))
            .cloned()
            .unwrap_or_default()
    }

    pub fn committed(&self, group: &str, partition: &Partition) -> Option<i64> {
        self.state()
            .committed
            .get(&(group.to_string(), partition.clone()))
            .copied()
    }

    /// Current assignment of a member.
    pub fn assignment(&self, member: u64) -> Vec<Partition> {
        self.state()
            .members
            .get(&member)
            .map(|slot| slot.assignment.clone())
            .unwrap_or_default()
    }
}

impl ClusterState {
    fn unreachable(&self) -> Result<(), KafkaClientError> {
        if self.unreachable {
            Err(KafkaClientError::Transient("cluster unreachable".to_string()))
        } else {
            Ok(())
        }
    }

    /// Range assignment over the members of `group`, sorted by join order.
    /// Members whose share changes (every member when `force` is set) get a
    /// revocation of the old share followed by the new one.
    fn rebalance(&mut self, group: &str, force: bool) {
        let members: Vec<(u64, String)> = self
            .members
            .iter()
            .filter_map(|(id, slot)| match &slot.group {
                Some((g, topic)) if g == group => Some((*id, topic.clone())),
                _ => None,
            })
            .collect();
        if members.is_empty() {
            return;
        }

        let topic = members[0].1.clone();
        let partition_count = self.topics.get(&topic).map(Vec::len).unwrap_or_default();
        let per_member = partition_count / members.len();
        let extra = partition_count % members.len();

        let mut next = 0;
        for (index, (id, _)) in members.iter().enumerate() {
            let share = per_member + usize::from(index < extra);
            let assignment: Vec<Partition> = (next..next + share)
                .map(|number| Partition::new(topic.as_str(), number as i32))
                .collect();
            next += share;

            let starts: Vec<(Partition, i64)> = assignment
                .iter()
                .map(|partition| {
                    let start = self
                        .committed
                        .get(&(group.to_string(), partition.clone()))
                        .map(|offset| offset + 1)
                        .unwrap_or(0);
                    (partition.clone(), start)
                })
                .collect();

            let Some(slot) = self.members.get_mut(id) else {
                continue;
            };
            if !force && slot.assignment == assignment {
                continue;
            }

            let revoked = std::mem::replace(&mut slot.assignment, assignment.clone());
            if !revoked.is_empty() {
                slot.pending.push_back(GroupEvent::Revoked(revoked));
            }
            slot.positions = starts.into_iter().collect();
            if !assignment.is_empty() {
                slot.pending.push_back(GroupEvent::Assigned(assignment));
            }
        }
        debug!(group, members = members.len(), "group rebalanced");
    }

    fn fetch(&mut self, member: u64) -> Option<GroupEvent> {
        let slot = self.members.get_mut(&member)?;
        if let Some(event) = slot.pending.pop_front() {
            return Some(event);
        }

        let mut batch = Vec::new();
        for partition in &slot.assignment {
            let Some(log) = self
                .topics
                .get(partition.topic())
                .and_then(|logs| logs.get(partition.partition_number() as usize))
            else {
                continue;
            };
            let position = slot.positions.entry(partition.clone()).or_insert(0);
            while (*position as usize) < log.len() && batch.len() < MAX_POLL_RECORDS {
                batch.push(log[*position as usize].clone());
                *position += 1;
            }
        }

        if batch.is_empty() {
            None
        } else {
            Some(GroupEvent::Records(batch))
        }
    }
}

#[async_trait]
impl ProduceTransport for MemoryCluster {
    async fn partition_count(&self, topic: &str) -> Result<usize, KafkaClientError> {
        let state = self.state();
        state.unreachable()?;
        state
            .topics
            .get(topic)
            .map(Vec::len)
            .ok_or_else(|| KafkaClientError::Configuration(format!("unknown topic {topic}")))
    }

    async fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Bytes,
        value: Bytes,
        timeout: Duration,
    ) -> Result<Delivery, KafkaClientError> {
        let delivery = {
            let mut state = self.state();
            if state.unreachable {
                return Err(KafkaClientError::Timeout(timeout));
            }
            if let Some(err) = state.produce_failures.pop_front() {
                return Err(err);
            }

            let Some(log) = state
                .topics
                .get_mut(topic)
                .and_then(|logs| logs.get_mut(partition as usize))
            else {
                return Err(KafkaClientError::BrokerRejected(format!(
                    "unknown topic or partition {topic}:{partition}"
                )));
            };

            let offset = log.len() as i64;
            log.push(Record::new(
                topic,
                partition,
                offset,
                key,
                value,
                OffsetDateTime::now_utc(),
            ));
            Delivery { partition, offset }
        };

        self.inner.changed.notify_waiters();
        Ok(delivery)
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), KafkaClientError> {
        Ok(())
    }
}

#[async_trait]
impl CursorStore for MemoryCluster {
    async fn store(&self, cursor: &Cursor) -> Result<(), KafkaClientError> {
        let mut state = self.state();
        state.unreachable()?;
        state.committed.insert(
            (cursor.group.clone(), cursor.partition.clone()),
            cursor.committed_offset,
        );
        Ok(())
    }

    async fn load(
        &self,
        group: &str,
        partition: &Partition,
    ) -> Result<Option<i64>, KafkaClientError> {
        let state = self.state();
        state.unreachable()?;
        Ok(state
            .committed
            .get(&(group.to_string(), partition.clone()))
            .copied())
    }
}

/// One member's session against a [`MemoryCluster`].
pub struct MemoryMember {
    id: u64,
    cluster: MemoryCluster,
}

impl MemoryMember {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl GroupTransport for MemoryMember {
    async fn join(&mut self, group: &str, topic: &str) -> Result<(), KafkaClientError> {
        {
            let mut state = self.cluster.state();
            state.unreachable()?;
            let slot = state.members.entry(self.id).or_default();
            slot.group = Some((group.to_string(), topic.to_string()));
            state.rebalance(group, false);
        }
        self.cluster.inner.changed.notify_waiters();
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<GroupEvent>, KafkaClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.cluster.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.cluster.state();
                state.unreachable()?;
                if let Some(event) = state.fetch(self.id) {
                    return Ok(Some(event));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn seek(&mut self, partition: &Partition, offset: i64) -> Result<(), KafkaClientError> {
        let mut state = self.cluster.state();
        state.unreachable()?;
        let Some(slot) = state.members.get_mut(&self.id) else {
            return Err(KafkaClientError::Closed);
        };
        if !slot.assignment.contains(partition) {
            return Err(KafkaClientError::Transient(format!(
                "cannot seek unassigned partition {partition}"
            )));
        }
        slot.positions.insert(partition.clone(), offset.max(0));
        Ok(())
    }

    async fn leave(&mut self) -> Result<(), KafkaClientError> {
        {
            let mut state = self.cluster.state();
            let Some(slot) = state.members.get_mut(&self.id) else {
                return Ok(());
            };
            let group = slot.group.take();
            slot.assignment.clear();
            slot.positions.clear();
            slot.pending.clear();
            if let Some((group, _)) = group {
                state.rebalance(&group, false);
            }
        }
        self.cluster.inner.changed.notify_waiters();
        Ok(())
    }
}
