use std::time::Duration;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

use crate::types::Partition;

/// Every failure the client core surfaces to its callers.
///
/// Nothing in the core retries on its own: `Timeout` and `Transient` are
/// handed back so the caller decides whether to try again with a fresh budget.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KafkaClientError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("no broker acknowledgement after {0:?}")]
    Timeout(Duration),
    #[error("transient error, please retry: {0}")]
    Transient(String),
    #[error("rejected by broker: {0}")]
    BrokerRejected(String),

    #[error("failed to join consumer group {group}: {reason}")]
    Join { group: String, reason: String },
    #[error("failed to decode record at {partition}@{offset}: {reason}")]
    Decode {
        partition: Partition,
        offset: i64,
        reason: String,
    },

    #[error("offset {offset} is behind committed offset {committed} on {partition}")]
    StaleOffset {
        partition: Partition,
        offset: i64,
        committed: i64,
    },
    #[error("no committed offset for group {group} on {partition}")]
    NotFound { group: String, partition: Partition },

    #[error("client is closed")]
    Closed,
}

impl KafkaClientError {
    /// True for failures that a caller may retry with a fresh timeout budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KafkaClientError::Timeout(_) | KafkaClientError::Transient(_)
        )
    }
}

impl From<KafkaError> for KafkaClientError {
    fn from(err: KafkaError) -> Self {
        match err.rdkafka_error_code() {
            Some(RDKafkaErrorCode::MessageTimedOut) | Some(RDKafkaErrorCode::RequestTimedOut) => {
                KafkaClientError::Transient(format!("broker timeout: {err}"))
            }
            Some(RDKafkaErrorCode::UnknownTopicOrPartition)
            | Some(RDKafkaErrorCode::UnknownTopic)
            | Some(RDKafkaErrorCode::UnknownPartition)
            | Some(RDKafkaErrorCode::MessageSizeTooLarge)
            | Some(RDKafkaErrorCode::InvalidMessageSize)
            | Some(RDKafkaErrorCode::TopicAuthorizationFailed) => {
                KafkaClientError::BrokerRejected(err.to_string())
            }
            _ => match err {
                KafkaError::ClientConfig(..) | KafkaError::ClientCreation(_) => {
                    KafkaClientError::Configuration(err.to_string())
                }
                _ => KafkaClientError::Transient(err.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_broker_rejections() {
        let err: KafkaClientError =
            KafkaError::MessageProduction(RDKafkaErrorCode::UnknownTopicOrPartition).into();
        assert!(matches!(err, KafkaClientError::BrokerRejected(_)));
        assert!(!err.is_retryable());

        let err: KafkaClientError =
            KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge).into();
        assert!(matches!(err, KafkaClientError::BrokerRejected(_)));
    }

    #[test]
    fn classifies_transient_failures() {
        let err: KafkaClientError =
            KafkaError::MessageProduction(RDKafkaErrorCode::BrokerTransportFailure).into();
        assert!(matches!(err, KafkaClientError::Transient(_)));
        assert!(err.is_retryable());

        let err: KafkaClientError =
            KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut).into();
        assert!(err.is_retryable());

        assert!(KafkaClientError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!KafkaClientError::Closed.is_retryable());
    }
}
