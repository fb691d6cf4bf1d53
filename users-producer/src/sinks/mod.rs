use async_trait::async_trait;
use bytes::Bytes;

use crate::api::ApiError;

pub mod kafka;
pub mod print;

/// Where accepted users go.
#[async_trait]
pub trait UserSink {
    async fn send(&self, key: &str, payload: Bytes) -> Result<(), ApiError>;
}
