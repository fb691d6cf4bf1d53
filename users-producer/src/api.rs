use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common_kafka::KafkaClientError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A user as published to the `users` topic.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub email: String,
    pub created_at: String,
}

/// Body of `POST /users`. Missing and null fields are told apart from
/// malformed ones, the former are validation errors.
#[derive(Debug, Default, Deserialize)]
pub struct UserRequest {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl UserRequest {
    /// Validate the request, stamping `created_at` with `now` when absent.
    pub fn into_user(self, now: impl FnOnce() -> String) -> Result<User, ApiError> {
        let name = self.name.unwrap_or_default();
        let email = self.email.unwrap_or_default();
        if name.is_empty() || email.is_empty() {
            return Err(ApiError::MissingFields);
        }

        let created_at = match self.created_at {
            Some(created_at) if !created_at.is_empty() => created_at,
            _ => now(),
        };

        Ok(User {
            // Zero is no id at all, it is never echoed or published
            id: self.id.filter(|id| *id != 0),
            name,
            email,
            created_at,
        })
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid JSON: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error("name and email are required")]
    MissingFields,

    #[error("failed to encode user: {0}")]
    EncodingError(String),
    #[error("failed to publish to Kafka: {0}")]
    PublishError(#[from] KafkaClientError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::RequestParsingError(_) | ApiError::MissingFields => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }

            ApiError::EncodingError(_) | ApiError::PublishError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        }
        .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> String {
        "2024-01-01T00:00:00Z".to_string()
    }

    #[test]
    fn fills_created_at() {
        let request: UserRequest =
            serde_json::from_str(r#"{"name":"Ada","email":"ada@example.com"}"#).unwrap();
        let user = request.into_user(now).unwrap();
        assert_eq!(user.created_at, "2024-01-01T00:00:00Z");
        assert_eq!(user.id, None);
    }

    #[test]
    fn keeps_given_fields() {
        let request: UserRequest = serde_json::from_str(
            r#"{"id":7,"name":"Ada","email":"ada@example.com","created_at":"1970-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let user = request.into_user(now).unwrap();
        assert_eq!(user.id, Some(7));
        assert_eq!(user.created_at, "1970-01-01T00:00:00Z");
    }

    #[test]
    fn requires_name_and_email() {
        for body in [
            r#"{"email":"ada@example.com"}"#,
            r#"{"name":"Ada"}"#,
            r#"{"name":"","email":"ada@example.com"}"#,
            r#"{"name":null,"email":"ada@example.com"}"#,
        ] {
            let request: UserRequest = serde_json::from_str(body).unwrap();
            assert!(matches!(
                request.into_user(now),
                Err(ApiError::MissingFields)
            ));
        }
    }

    #[test]
    fn zero_id_is_dropped() {
        let request: UserRequest =
            serde_json::from_str(r#"{"id":0,"name":"Ada","email":"ada@example.com"}"#).unwrap();
        let user = request.into_user(now).unwrap();
        assert_eq!(user.id, None);
        assert!(!serde_json::to_string(&user).unwrap().contains("\"id\""));
    }

    #[test]
    fn omits_missing_id() {
        let user = User {
            id: None,
            name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            created_at: now(),
        };
        assert_eq!(
            serde_json::to_string(&user).unwrap(),
            r#"{"name":"Ada","email":"ada@example.com","created_at":"2024-01-01T00:00:00Z"}"#
        );
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            ApiError::MissingFields.into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::PublishError(KafkaClientError::Closed)
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
