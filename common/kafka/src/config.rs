use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(
        from = "KAFKA_BROKERS",
        default = "localhost:29092,localhost:29093,localhost:29094"
    )]
    pub kafka_hosts: String, // Comma-delimited broker addresses

    #[envconfig(default = "users")]
    pub kafka_topic: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "0")]
    pub kafka_producer_linger_ms: u32, // Publish is a blocking call, don't hold records back

    #[envconfig(default = "5000")]
    pub kafka_message_timeout_ms: u32, // Time before librdkafka stops retrying a produce

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "least_loaded_sticky")]
    pub kafka_partitioner: PartitionerPolicy,

    #[envconfig(default = "100000")]
    pub kafka_partitioner_window: usize, // Keys remembered by the sticky partitioner

    #[envconfig(default = "10000")]
    pub kafka_metadata_timeout_ms: u64,
}

impl KafkaConfig {
    pub fn brokers(&self) -> Vec<String> {
        self.kafka_hosts
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_metadata_timeout_ms)
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    #[envconfig(from = "KAFKA_GROUP_ID", default = "users-consumer-group")]
    pub kafka_consumer_group: String,

    // Without a committed cursor we read the topic from the start
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "30")]
    pub kafka_consumer_join_attempts: u32,

    #[envconfig(default = "1000")]
    pub kafka_consumer_poll_timeout_ms: u64,

    #[envconfig(default = "1000")]
    pub kafka_consumer_retry_backoff_ms: u64,

    #[envconfig(default = "skip_and_commit")]
    pub kafka_consumer_malformed_policy: MalformedPolicy,

    #[envconfig(default = "false")]
    pub kafka_consumer_strict_offsets: bool,

    #[envconfig(default = "100")]
    pub kafka_consumer_fetch_min_bytes: u32,

    #[envconfig(default = "1000000")]
    pub kafka_consumer_fetch_max_bytes: u32,
}

impl ConsumerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_consumer_poll_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.kafka_consumer_retry_backoff_ms)
    }
}

/// How the partitioner maps keys onto partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionerPolicy {
    /// First sighting of a key goes to the least-loaded partition, later ones follow it.
    #[default]
    LeastLoadedSticky,
    /// Always the least-loaded partition, keys are ignored.
    LeastLoaded,
    /// Strict key hashing.
    Hash,
}

impl FromStr for PartitionerPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "least_loaded_sticky" | "sticky" => Ok(PartitionerPolicy::LeastLoadedSticky),
            "least_loaded" | "least_bytes" => Ok(PartitionerPolicy::LeastLoaded),
            "hash" => Ok(PartitionerPolicy::Hash),
            _ => Err(format!("Unknown partitioner policy: {s}")),
        }
    }
}

/// What the read loop does with a record its callback could not decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedPolicy {
    /// Commit past the record: it is never seen again.
    #[default]
    SkipAndCommit,
    /// Leave the cursor before the record so it comes back after a restart.
    RetryOnRestart,
}

impl FromStr for MalformedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "skip_and_commit" | "skip" => Ok(MalformedPolicy::SkipAndCommit),
            "retry_on_restart" | "retry" => Ok(MalformedPolicy::RetryOnRestart),
            _ => Err(format!("Unknown malformed record policy: {s}")),
        }
    }
}
