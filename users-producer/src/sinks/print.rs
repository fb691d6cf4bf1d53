use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use tracing::info;

use crate::api::ApiError;
use crate::sinks::UserSink;

pub struct PrintSink {}

#[async_trait]
impl UserSink for PrintSink {
    async fn send(&self, key: &str, payload: Bytes) -> Result<(), ApiError> {
        info!(key, "user: {}", String::from_utf8_lossy(&payload));
        counter!("users_published_total").increment(1);

        Ok(())
    }
}
