pub mod config;
pub mod connection;
pub mod error;
pub mod kafka_consumer;
pub mod kafka_producer;
pub mod mock;
pub mod offset_tracker;
pub mod partitioner;
pub mod publisher;
pub mod read_loop;
pub mod subscriber;
pub mod transport;
pub mod types;

pub use config::{ConsumerConfig, KafkaConfig, MalformedPolicy, PartitionerPolicy};
pub use connection::ConnectionPool;
pub use error::KafkaClientError;
pub use kafka_consumer::{KafkaCursorStore, KafkaGroupConsumer};
pub use kafka_producer::KafkaProducer;
pub use offset_tracker::OffsetTracker;
pub use partitioner::Partitioner;
pub use publisher::Publisher;
pub use read_loop::{CommitDecision, ReadLoop};
pub use subscriber::{Subscriber, SubscriberState};
pub use transport::{CursorStore, GroupTransport, ProduceTransport};
pub use types::{Cursor, Delivery, GroupEvent, Partition, ProducerRecord, Record};
