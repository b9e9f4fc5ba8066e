use serde::Serialize;
use serde_json::{Value, json};
use tracing::error;

use crate::api_keys::ApiKeyError;
use crate::webhook::SignatureError;

/// Failure of a request-style entry point, carrying its HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error(transparent)]
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::Unauthorized(_) => 401,
            ApiError::Forbidden(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) => 409,
            ApiError::Unavailable(_) => 503,
            ApiError::Internal(_) => 500,
        }
    }

    /// `{"error": message}`; internal details stay in the log.
    pub fn body(&self) -> Value {
        let message = match self {
            ApiError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal error in request handler");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        json!({ "error": message })
    }

    pub fn into_response(self) -> ApiResponse {
        ApiResponse {
            status: self.status(),
            body: self.body(),
        }
    }
}

/// Recovers an `ApiError` that travelled through `anyhow`; anything else
/// is internal.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let err = match err.downcast::<ApiError>() {
            Ok(api) => return api,
            Err(err) => err,
        };
        let err = match err.downcast::<ApiKeyError>() {
            Ok(key) => return key.into(),
            Err(err) => err,
        };
        match err.downcast::<SignatureError>() {
            Ok(sig) => sig.into(),
            Err(err) => ApiError::Internal(err),
        }
    }
}

impl From<SignatureError> for ApiError {
    fn from(err: SignatureError) -> Self {
        ApiError::Unauthorized(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok<T: Serialize>(body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Self { status: 200, body },
            Err(err) => ApiError::Internal(err.into()).into_response(),
        }
    }

    pub fn from_result<T: Serialize>(result: Result<T, ApiError>) -> Self {
        match result {
            Ok(body) => Self::ok(&body),
            Err(err) => err.into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ApiError, ApiResponse};
    use crate::webhook::SignatureError;

    #[test]
    fn errors_map_to_status_and_error_body() {
        let response = ApiResponse::from_result::<()>(Err(SignatureError::Mismatch.into()));
        assert_eq!(response.status, 401);
        assert_eq!(response.body, json!({"error": "signature does not match payload"}));

        let hidden = ApiError::Internal(anyhow::anyhow!("disk on fire")).into_response();
        assert_eq!(hidden.status, 500);
        assert_eq!(hidden.body["error"], "internal server error");

        let wrapped = anyhow::Error::from(ApiError::Forbidden("admins only".to_string()));
        let recovered = ApiError::from(wrapped);
        assert_eq!(recovered.status(), 403);
    }

    #[test]
    fn ok_serializes_payload() {
        let response = ApiResponse::from_result(Ok::<_, ApiError>(json!({"received": true})));
        assert_eq!(response.status, 200);
        assert_eq!(response.body["received"], true);
    }
}
