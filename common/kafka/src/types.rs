use std::fmt;

use bytes::Bytes;
use rdkafka::message::{Message, OwnedMessage};
use rdkafka::topic_partition_list::TopicPartitionListElem;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;

use crate::error::KafkaClientError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// What a caller hands to the publisher. A `None` value is rejected before
/// anything reaches the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerRecord {
    pub key: Bytes,
    pub value: Option<Bytes>,
}

impl ProducerRecord {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }
}

/// Broker acknowledgement of a produced record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// A record read back from the log. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    topic: String,
    key: Bytes,
    value: Bytes,
    partition: i32,
    offset: i64,
    timestamp: OffsetDateTime,
}

impl Record {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: Bytes,
        value: Bytes,
        timestamp: OffsetDateTime,
    ) -> Self {
        Self {
            topic: topic.into(),
            key,
            value,
            partition,
            offset,
            timestamp,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn topic_partition(&self) -> Partition {
        Partition::new(self.topic.as_str(), self.partition)
    }

    /// Decode the value as JSON, reporting failures as `Decode` errors that
    /// carry the record position.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, KafkaClientError> {
        serde_json::from_slice(&self.value).map_err(|e| KafkaClientError::Decode {
            partition: self.topic_partition(),
            offset: self.offset,
            reason: e.to_string(),
        })
    }
}

impl From<&OwnedMessage> for Record {
    fn from(message: &OwnedMessage) -> Self {
        let timestamp = message
            .timestamp()
            .to_millis()
            .and_then(|ms| {
                OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
            })
            .unwrap_or_else(OffsetDateTime::now_utc);

        Record::new(
            message.topic(),
            message.partition(),
            message.offset(),
            Bytes::copy_from_slice(message.key().unwrap_or_default()),
            Bytes::copy_from_slice(message.payload().unwrap_or_default()),
            timestamp,
        )
    }
}

/// Durable consumption position of a group on one partition. The committed
/// offset is the last processed record; consumption resumes right after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub group: String,
    pub partition: Partition,
    pub committed_offset: i64,
}

/// Membership and data events surfaced by a group transport, in the order
/// the group protocol produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    Assigned(Vec<Partition>),
    Revoked(Vec<Partition>),
    Records(Vec<Record>),
}
