//! Discovery reverse-proxy and trust endpoint
//!
//! `/discovery/*` forwards verbatim to the configured upstream P2P node
//! with a 5 s timeout: upstream 404 stays 404, other upstream failures
//! become 502, network errors become 503. `/trust/{did}` combines the
//! synchronous local trust view with a best-effort (3 s) network view.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::identity::is_valid_did;
use crate::task::FieldError;

use super::error::ApiError;
use super::AppState;

/// Upstream timeout for discovery forwards
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Upstream timeout for the network trust view
const TRUST_TIMEOUT: Duration = Duration::from_secs(3);

/// `GET /discovery/agents`
pub async fn discovery_agents(State(state): State<AppState>) -> Result<Response, ApiError> {
    forward_get(&state, "agents").await
}

/// `GET /discovery/agents/{did}`
pub async fn discovery_agent(
    State(state): State<AppState>,
    Path(did): Path<String>,
) -> Result<Response, ApiError> {
    forward_get(&state, &format!("agents/{}", did)).await
}

/// `POST /discovery/search`
pub async fn discovery_search(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let node_url = upstream(&state)?;
    let response = state
        .http
        .post(format!("{}/search", node_url))
        .timeout(DISCOVERY_TIMEOUT)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.to_vec())
        .send()
        .await;
    relay(response).await
}

/// `GET /trust/{did}` - local trust view plus a parallel best-effort
/// network view (`null` on timeout or upstream failure)
pub async fn trust_view(
    State(state): State<AppState>,
    Path(did): Path<String>,
) -> Result<Response, ApiError> {
    if !is_valid_did(&did) {
        return Err(ApiError::InvalidInput(vec![FieldError::new(
            "did",
            "must match did:<method>:<suffix>",
        )]));
    }

    let local = state.trust.profile(&did).map(|p| {
        json!({
            "did": p.did,
            "tier": p.tier.as_str(),
            "dailyLimit": p.tier.daily_limit(),
            "firstSeen": p.first_seen,
            "completedTasks": p.completed_tasks,
            "failedTasks": p.failed_tasks,
            "lastActivity": p.last_activity,
        })
    });

    let network = fetch_network_trust(&state, &did).await;

    Ok(Json(json!({
        "did": did,
        "local": local,
        "network": network,
    }))
    .into_response())
}

async fn fetch_network_trust(state: &AppState, did: &str) -> Value {
    let node_url = match &state.config.node_url {
        Some(url) => url.trim_end_matches('/').to_string(),
        None => return Value::Null,
    };

    let response = state
        .http
        .get(format!("{}/trust/{}", node_url, did))
        .timeout(TRUST_TIMEOUT)
        .send()
        .await;

    match response {
        Ok(resp) if resp.status().is_success() => {
            resp.json::<Value>().await.unwrap_or(Value::Null)
        }
        Ok(resp) => {
            debug!(status = %resp.status(), "Network trust view unavailable");
            Value::Null
        }
        Err(e) => {
            debug!(error = %e, "Network trust view unreachable");
            Value::Null
        }
    }
}

fn upstream(state: &AppState) -> Result<String, ApiError> {
    state
        .config
        .node_url
        .as_ref()
        .map(|url| url.trim_end_matches('/').to_string())
        .ok_or(ApiError::ServiceUnavailable {
            reason: "no discovery node configured".to_string(),
        })
}

async fn forward_get(state: &AppState, path: &str) -> Result<Response, ApiError> {
    let node_url = upstream(state)?;
    let response = state
        .http
        .get(format!("{}/{}", node_url, path))
        .timeout(DISCOVERY_TIMEOUT)
        .send()
        .await;
    relay(response).await
}

/// Map an upstream response onto the bridge's status contract
async fn relay(response: Result<reqwest::Response, reqwest::Error>) -> Result<Response, ApiError> {
    match response {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                let body = resp.bytes().await.unwrap_or_default();
                Ok((
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/json")],
                    body,
                )
                    .into_response())
            } else if status == reqwest::StatusCode::NOT_FOUND {
                Err(ApiError::NotFound)
            } else {
                debug!(status = %status, "Discovery upstream error");
                Err(ApiError::BadGateway)
            }
        }
        Err(e) => {
            debug!(error = %e, "Discovery upstream unreachable");
            Err(ApiError::ServiceUnavailable {
                reason: "discovery node unreachable".to_string(),
            })
        }
    }
}
