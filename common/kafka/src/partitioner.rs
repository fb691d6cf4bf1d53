//! Partition selection for keyed records.
//!
//! Records without a key are spread round-robin. Keyed records follow the
//! configured [`PartitionerPolicy`]; the default sends the first record of a
//! key to the partition that has received the fewest bytes so far, then keeps
//! the key on that partition so per-key ordering holds for as long as this
//! instance remembers the key.
use std::hash::Hasher;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use siphasher::sip::SipHasher13;
use tracing::debug;

use crate::config::PartitionerPolicy;
use crate::error::KafkaClientError;

// Fixed keys, so hashing is stable across processes and restarts
const HASH_KEYS: (u64, u64) = (0x7573_6572_735f_6b31, 0x7573_6572_735f_6b32);

pub struct Partitioner {
    policy: PartitionerPolicy,
    round_robin: AtomicUsize,
    sticky: DashMap<Vec<u8>, i32>,
    window: usize,
}

impl Partitioner {
    pub fn new(policy: PartitionerPolicy, window: usize) -> Self {
        Self {
            policy,
            round_robin: AtomicUsize::new(0),
            sticky: DashMap::new(),
            window: window.max(1),
        }
    }

    pub fn policy(&self) -> PartitionerPolicy {
        self.policy
    }

    /// Pick a partition for `key` given the accumulated load of every
    /// partition of the topic. `loads.len()` is the partition count.
    pub fn select(&self, key: &[u8], loads: &[u64]) -> Result<i32, KafkaClientError> {
        if loads.is_empty() {
            return Err(KafkaClientError::Configuration(
                "topic has no partitions".to_string(),
            ));
        }

        if key.is_empty() {
            let next = self.round_robin.fetch_add(1, Ordering::Relaxed);
            return Ok((next % loads.len()) as i32);
        }

        let partition = match self.policy {
            PartitionerPolicy::LeastLoaded => least_loaded(loads),
            PartitionerPolicy::Hash => hashed(key, loads.len()),
            PartitionerPolicy::LeastLoadedSticky => self.sticky(key, loads),
        };
        Ok(partition)
    }

    fn sticky(&self, key: &[u8], loads: &[u64]) -> i32 {
        if let Some(known) = self.sticky.get(key) {
            // A partition count shrink invalidates the remembered choice
            if (*known as usize) < loads.len() {
                return *known;
            }
        }

        if self.sticky.len() >= self.window {
            debug!(
                keys = self.sticky.len(),
                "sticky partitioner window full, starting a new one"
            );
            self.sticky.clear();
        }

        let mut entry = self
            .sticky
            .entry(key.to_vec())
            .or_insert_with(|| least_loaded(loads));
        if (*entry as usize) >= loads.len() {
            *entry = least_loaded(loads);
        }
        *entry
    }

    /// Number of keys currently pinned to a partition.
    pub fn tracked_keys(&self) -> usize {
        self.sticky.len()
    }
}

fn least_loaded(loads: &[u64]) -> i32 {
    loads
        .iter()
        .enumerate()
        .min_by_key(|(index, load)| (**load, *index))
        .map(|(index, _)| index as i32)
        .unwrap_or_default()
}

fn hashed(key: &[u8], partition_count: usize) -> i32 {
    let mut hasher = SipHasher13::new_with_keys(HASH_KEYS.0, HASH_KEYS.1);
    hasher.write(key);
    (hasher.finish() % partition_count as u64) as i32
}
