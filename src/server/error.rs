//! Wire-level error taxonomy
//!
//! Every client-visible failure serializes to the same envelope:
//! `{"error": {"code", "message", "details"?, "help"?}}`. Internal causes
//! are logged server-side; stack traces, paths, and library names never
//! reach a client. Validation details are capped at five field messages.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::auth::AuthError;
use crate::task::FieldError;

/// Maximum number of field messages serialized for a validation failure
const MAX_VALIDATION_DETAILS: usize = 5;

/// Well-known path of the capability card, advertised in help blocks
pub const CARD_PATH: &str = "/.well-known/agent.json";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Schema-level body validation failure (400, VALIDATION_ERROR)
    #[error("request validation failed")]
    Validation(Vec<FieldError>),
    /// Input rejected by a security check (400, INVALID_INPUT)
    #[error("invalid input")]
    InvalidInput(Vec<FieldError>),
    #[error("authentication required")]
    Unauthorized,
    #[error("payment required")]
    PaymentRequired {
        challenge: Option<serde_json::Value>,
        reason: Option<String>,
    },
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("rate limited")]
    RateLimited { reason: String },
    #[error("service unavailable")]
    ServiceUnavailable { reason: String },
    #[error("bad gateway")]
    BadGateway,
    #[error("internal error")]
    Internal(#[from] eyre::Report),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::PaymentRequired { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadGateway => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::InvalidInput(_) => "INVALID_INPUT",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::PaymentRequired { .. } => "PAYMENT_REQUIRED",
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::NotFound => "NOT_FOUND",
            ApiError::RateLimited { .. } => "RATE_LIMITED",
            ApiError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            ApiError::BadGateway => "BAD_GATEWAY",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// The structured body for this error
    pub fn body(&self) -> serde_json::Value {
        let mut error = json!({
            "code": self.code(),
            "message": self.client_message(),
        });

        match self {
            ApiError::Validation(details) | ApiError::InvalidInput(details) => {
                let capped: Vec<_> = details
                    .iter()
                    .take(MAX_VALIDATION_DETAILS)
                    .map(|d| json!({"field": d.field, "message": d.message}))
                    .collect();
                error["details"] = json!(capped);
            }
            ApiError::Unauthorized => {
                error["help"] = auth_help();
            }
            ApiError::RateLimited { .. } => {
                error["help"] = json!({
                    "message": "Daily limits reset at UTC midnight; higher trust tiers receive larger limits",
                    "capabilityCard": CARD_PATH,
                });
            }
            ApiError::PaymentRequired { challenge, .. } => {
                if let Some(challenge) = challenge {
                    return json!({"error": error, "challenge": challenge});
                }
            }
            _ => {}
        }

        json!({"error": error})
    }

    /// Message safe to show a client
    fn client_message(&self) -> String {
        match self {
            ApiError::Validation(_) => "request body failed validation".to_string(),
            ApiError::InvalidInput(_) => "request input was rejected".to_string(),
            ApiError::Unauthorized => "authentication required".to_string(),
            ApiError::PaymentRequired { reason, .. } => reason
                .clone()
                .unwrap_or_else(|| "payment required".to_string()),
            ApiError::Forbidden => "you do not own this task".to_string(),
            ApiError::NotFound => "task not found or expired".to_string(),
            ApiError::RateLimited { reason } => reason.clone(),
            ApiError::ServiceUnavailable { reason } => reason.clone(),
            ApiError::BadGateway => "upstream returned an error".to_string(),
            // Internal detail stays in the server log
            ApiError::Internal(_) => "internal error".to_string(),
        }
    }
}

/// Help block enumerating the accepted authentication methods
fn auth_help() -> serde_json::Value {
    json!({
        "message": "Provide credentials with one of the accepted methods",
        "methods": [
            "Authorization: Bearer <token>",
            "x-api-key: <token>",
            "Authorization: DID <did>:<unix_ts>:<base64url_sig>",
            "Authorization: FreeTier <identifier>",
            "x-payment: <receipt>",
        ],
        "capabilityCard": CARD_PATH,
    })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(ref report) = self {
            error!(error = ?report, "Internal error serving request");
        }
        (self.status(), Json(self.body())).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::PaymentRequired { challenge, reason } => ApiError::PaymentRequired {
                challenge: Some(challenge),
                reason,
            },
            // Malformed credentials, bad signatures, and stale timestamps
            // all collapse to 401 on the wire
            AuthError::Unauthorized
            | AuthError::InvalidSignature
            | AuthError::TimestampOutOfWindow
            | AuthError::Malformed => ApiError::Unauthorized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_code_mapping() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Unauthorized.code(), "UNAUTHORIZED");
        assert_eq!(ApiError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::RateLimited {
                reason: "x".to_string()
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Validation(vec![]).code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(ApiError::InvalidInput(vec![]).code(), "INVALID_INPUT");
    }

    #[test]
    fn test_validation_details_capped_at_five() {
        let details: Vec<FieldError> = (0..8)
            .map(|i| FieldError::new(&format!("f{}", i), "bad"))
            .collect();
        let body = ApiError::Validation(details).body();
        assert_eq!(body["error"]["details"].as_array().unwrap().len(), 5);
    }

    #[test]
    fn test_unauthorized_help_lists_methods() {
        let body = ApiError::Unauthorized.body();
        let methods = body["error"]["help"]["methods"].as_array().unwrap();
        assert!(methods.iter().any(|m| m.as_str().unwrap().contains("DID")));
        assert!(methods.iter().any(|m| m.as_str().unwrap().contains("FreeTier")));
    }

    #[test]
    fn test_payment_required_carries_challenge() {
        let err = ApiError::PaymentRequired {
            challenge: Some(json!({"x402Version": 1})),
            reason: None,
        };
        let body = err.body();
        assert_eq!(body["challenge"]["x402Version"], 1);
        assert_eq!(body["error"]["code"], "PAYMENT_REQUIRED");
    }

    #[test]
    fn test_internal_error_does_not_leak() {
        let err = ApiError::Internal(eyre::eyre!("secret path /etc/shadow"));
        let body = err.body();
        assert_eq!(body["error"]["message"], "internal error");
        assert!(!body.to_string().contains("shadow"));
    }
}
