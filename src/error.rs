use axum::{http::StatusCode, Json};
use serde_json::{json, Value};
use std::fmt;

/// Per-index context attached to a failed batch operation.
///
/// `failed` lists the indices of the records that failed; `records` holds one
/// entry per submitted record, either the successfully written record or an
/// `{"error": ...}` object for the failed ones.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub message: String,
    pub failed: Vec<usize>,
    pub records: Vec<Value>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Forbidden(String),
    NotImplemented(String),
    Batch(BatchContext),
    Database(String),
    Serialization(serde_json::Error),
    Configuration(String),
    Internal(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::BadRequest(e) => write!(f, "Bad request: {}", e),
            ApiError::NotFound(e) => write!(f, "Not found: {}", e),
            ApiError::Forbidden(e) => write!(f, "Forbidden: {}", e),
            ApiError::NotImplemented(e) => write!(f, "Not implemented: {}", e),
            ApiError::Batch(ctx) => write!(f, "{}", ctx.message),
            ApiError::Database(e) => write!(f, "Database error: {}", e),
            ApiError::Serialization(e) => write!(f, "Serialization error: {}", e),
            ApiError::Configuration(e) => write!(f, "Configuration error: {}", e),
            ApiError::Internal(e) => write!(f, "Internal error: {}", e),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiError::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Serialization(err)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("record not found".to_string()),
            other => ApiError::Database(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Batch(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            ApiError::Database(_)
            | ApiError::Serialization(_)
            | ApiError::Configuration(_)
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_response(&self) -> (StatusCode, Json<Value>) {
        let status = self.status_code();
        let body = match self {
            ApiError::Batch(ctx) => {
                // Per-item results ride along so the caller can render them.
                json!({
                    "error": {
                        "message": ctx.message,
                        "context": { "error": ctx.failed, "record": ctx.records }
                    }
                })
            }
            ApiError::Database(e) => {
                tracing::error!("Database error: {}", e);
                json!({ "error": { "message": e } })
            }
            ApiError::Serialization(e) => {
                tracing::error!("Serialization error: {}", e);
                json!({ "error": { "message": e.to_string() } })
            }
            ApiError::Configuration(e) => {
                tracing::error!("Configuration error: {}", e);
                json!({ "error": { "message": e } })
            }
            ApiError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                json!({ "error": { "message": e } })
            }
            other => json!({ "error": { "message": other.to_string() } }),
        };
        (status, Json(body))
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = self.to_response();
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Forbidden("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::Database("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_batch_context_response() {
        let err = ApiError::Batch(BatchContext {
            message: "Batch Error: Not all records could be created.".to_string(),
            failed: vec![2],
            records: vec![json!({"id": 1}), json!({"id": 2}), json!({"error": "boom"})],
        });
        let (status, Json(body)) = err.to_response();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["context"]["error"], json!([2]));
        assert_eq!(body["error"]["context"]["record"][2]["error"], json!("boom"));
    }
}
