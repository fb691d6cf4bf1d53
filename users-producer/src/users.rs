use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use bytes::Bytes;
use tracing::{debug, instrument, warn, Span};

use crate::api::{ApiError, UserRequest};
use crate::router;

/// `POST /users`: validate the user, publish it keyed by email and echo the
/// exact payload that went to Kafka.
#[instrument(skip_all, fields(email))]
pub async fn create(
    state: State<router::State>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    // The body is JSON whatever the content type says
    let request: UserRequest = serde_json::from_slice(&body).map_err(|e| {
        warn!("rejected malformed user: {}", e);
        ApiError::from(e)
    })?;

    let user = request.into_user(|| state.timesource.current_time())?;
    Span::current().record("email", user.email.as_str());

    let payload = serde_json::to_vec(&user).map_err(|e| ApiError::EncodingError(e.to_string()))?;
    let payload = Bytes::from(payload);

    state.sink.send(&user.email, payload.clone()).await?;
    debug!("user accepted");

    Ok((
        StatusCode::ACCEPTED,
        [(header::CONTENT_TYPE, "application/json")],
        payload,
    ))
}
