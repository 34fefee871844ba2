//! Layered authentication pipeline
//!
//! Stages are evaluated in a fixed order and the first match wins:
//! 1. static token (`Authorization: Bearer` or `x-api-key`)
//! 2. on-chain payment receipt (`x-payment`)
//! 3. cryptographic DID signature (`Authorization: DID ...`)
//! 4. anonymous free-tier (`Authorization: FreeTier ...`)
//!
//! When nothing matches, a configured receipt validator turns the failure
//! into a 402 challenge; otherwise the caller gets a bare 401. REST and
//! WebSocket both route through [`Authenticator::authenticate`] so the
//! signature-verification logic exists exactly once.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::{Signature, VerifyingKey};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::identity::{did_key_public_key, is_valid_did, is_valid_free_tier_id, ClientIdentity};

/// Maximum age of a DID auth timestamp, seconds
pub const MAX_TIMESTAMP_AGE_S: i64 = 300;
/// Maximum clock skew into the future, seconds
pub const MAX_TIMESTAMP_SKEW_S: i64 = 30;

/// Which stage authenticated the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    StaticToken,
    PaymentReceipt,
    DidSignature,
    FreeTier,
}

/// Successful authentication outcome
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub identity: ClientIdentity,
    pub method: AuthMethod,
}

/// Authentication failure, mapped to a wire status by the server layer
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("authentication required")]
    Unauthorized,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("timestamp outside acceptance window")]
    TimestampOutOfWindow,
    #[error("malformed authorization header")]
    Malformed,
    #[error("payment required")]
    PaymentRequired {
        challenge: serde_json::Value,
        reason: Option<String>,
    },
}

/// Validates an opaque `x-payment` receipt and yields the paying identity
#[async_trait]
pub trait ReceiptValidator: Send + Sync {
    async fn validate(&self, receipt: &str) -> Result<ClientIdentity, String>;

    /// The 402 challenge document returned when payment is required
    fn challenge(&self) -> serde_json::Value;
}

/// The header/request material the pipeline inspects. Both the HTTP adapter
/// and the WebSocket handshake adapter reduce to this.
#[derive(Debug, Clone, Default)]
pub struct AuthRequest<'a> {
    pub authorization: Option<&'a str>,
    pub api_key: Option<&'a str>,
    pub payment: Option<&'a str>,
    pub method: &'a str,
    pub path: &'a str,
}

pub struct Authenticator {
    api_token: Option<String>,
    receipt_validator: Option<Arc<dyn ReceiptValidator>>,
}

impl Authenticator {
    pub fn new(
        api_token: Option<String>,
        receipt_validator: Option<Arc<dyn ReceiptValidator>>,
    ) -> Self {
        Self {
            api_token,
            receipt_validator,
        }
    }

    pub fn has_receipt_validator(&self) -> bool {
        self.receipt_validator.is_some()
    }

    /// Run the pipeline over one request
    pub async fn authenticate(&self, req: &AuthRequest<'_>) -> Result<AuthContext, AuthError> {
        // Stage 1: static token
        if let Some(token) = &self.api_token {
            let bearer = req
                .authorization
                .and_then(|h| h.strip_prefix("Bearer "))
                .map(str::trim);
            let candidate = bearer.or(req.api_key);
            if let Some(candidate) = candidate {
                if token_matches(token, candidate) {
                    return Ok(AuthContext {
                        identity: ClientIdentity::paid("api-token"),
                        method: AuthMethod::StaticToken,
                    });
                }
            }
        }

        // Stage 2: payment receipt (present iff the header is set)
        if let Some(receipt) = req.payment {
            if let Some(validator) = &self.receipt_validator {
                match validator.validate(receipt).await {
                    Ok(identity) => {
                        return Ok(AuthContext {
                            identity,
                            method: AuthMethod::PaymentReceipt,
                        })
                    }
                    Err(reason) => {
                        debug!(reason = %reason, "Payment receipt rejected");
                        return Err(AuthError::PaymentRequired {
                            challenge: validator.challenge(),
                            reason: Some(reason),
                        });
                    }
                }
            }
        }

        // Stages 3 and 4: Authorization schemes
        if let Some(header) = req.authorization {
            if let Some(rest) = header.strip_prefix("DID ") {
                let ctx = self.verify_did_auth(rest.trim(), req.method, req.path)?;
                return Ok(ctx);
            }
            if let Some(id) = header.strip_prefix("FreeTier ") {
                let id = id.trim();
                if !is_valid_free_tier_id(id) {
                    return Err(AuthError::Malformed);
                }
                return Ok(AuthContext {
                    identity: ClientIdentity::free(id),
                    method: AuthMethod::FreeTier,
                });
            }
        }

        // Nothing matched: challenge when receipts are configured
        match &self.receipt_validator {
            Some(validator) => Err(AuthError::PaymentRequired {
                challenge: validator.challenge(),
                reason: None,
            }),
            None => Err(AuthError::Unauthorized),
        }
    }

    /// Verify a `DID <did>:<unix_ts>:<base64url_sig>` credential.
    ///
    /// The DID itself contains colons, so the payload is split by scanning
    /// from the right for the last two separators.
    fn verify_did_auth(
        &self,
        payload: &str,
        method: &str,
        path: &str,
    ) -> Result<AuthContext, AuthError> {
        let sig_sep = payload.rfind(':').ok_or(AuthError::Malformed)?;
        let (front, sig_b64) = payload.split_at(sig_sep);
        let sig_b64 = &sig_b64[1..];

        let ts_sep = front.rfind(':').ok_or(AuthError::Malformed)?;
        let (did, ts_str) = front.split_at(ts_sep);
        let ts_str = &ts_str[1..];

        if !is_valid_did(did) {
            return Err(AuthError::Malformed);
        }
        let ts: i64 = ts_str.parse().map_err(|_| AuthError::Malformed)?;

        let now_s = Utc::now().timestamp();
        if now_s - ts > MAX_TIMESTAMP_AGE_S || ts - now_s > MAX_TIMESTAMP_SKEW_S {
            return Err(AuthError::TimestampOutOfWindow);
        }

        let public_key =
            did_key_public_key(did).map_err(|_| AuthError::InvalidSignature)?;
        let verifying_key = VerifyingKey::from_bytes(&public_key)
            .map_err(|_| AuthError::InvalidSignature)?;

        let sig_bytes: [u8; 64] = URL_SAFE_NO_PAD
            .decode(sig_b64.trim_end_matches('='))
            .map_err(|_| AuthError::InvalidSignature)?
            .try_into()
            .map_err(|_| AuthError::InvalidSignature)?;
        let signature = Signature::from_bytes(&sig_bytes);

        let message = format!("{}:{}:{}", ts, method, path);
        verifying_key
            .verify_strict(message.as_bytes(), &signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        Ok(AuthContext {
            identity: ClientIdentity::free(did),
            method: AuthMethod::DidSignature,
        })
    }
}

/// Constant-time token comparison; length mismatch short-circuits but leaks
/// only the length, which the attacker already controls.
fn token_matches(expected: &str, candidate: &str) -> bool {
    expected.as_bytes().ct_eq(candidate.as_bytes()).into()
}
