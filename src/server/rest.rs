//! REST task lifecycle and discoverability endpoints

use axum::body::Bytes;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;

use crate::metrics;
use crate::task::{FieldError, Task, TaskRequest, TaskType};

use super::error::ApiError;
use super::submit::{check_ownership, submit_task};
use super::{authenticate_http, client_ip, header_str, AppState};

/// Sandbox budget: requests per hour per IP
pub const SANDBOX_REQUESTS_PER_HOUR: u32 = 3;
/// Sandbox prompt ceiling, characters
pub const SANDBOX_PROMPT_MAX: usize = 500;
/// Sandbox output clamp, characters
pub const SANDBOX_OUTPUT_MAX: usize = 500;
/// Fixed sandbox execution timeout, seconds
pub const SANDBOX_TIMEOUT_S: u64 = 60;

#[derive(Debug, Deserialize)]
pub struct TaskQuery {
    #[serde(default)]
    wait: Option<String>,
}

/// `POST /task` - authenticate, validate, accept, and either wait for the
/// result (`?wait=true`, bounded) or return 202 with polling headers.
pub async fn post_task(
    State(state): State<AppState>,
    connect: ConnectInfo<SocketAddr>,
    Query(query): Query<TaskQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let auth = authenticate_http(&state, &headers, &Method::POST, "/task").await?;
    let ip = client_ip(&headers, &connect);

    let request: TaskRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::Validation(vec![FieldError::new("body", e.to_string())]))?;

    let wait = query.wait.as_deref() == Some("true");
    let accepted = submit_task(&state, request, &auth, &ip, wait, None).await?;
    let task_id = accepted.task.task_id.clone();

    if let Some(rx) = accepted.wait_rx {
        let sync_timeout = Duration::from_secs(state.config.sync_timeout_s);
        if let Ok(Ok(result)) = tokio::time::timeout(sync_timeout, rx).await {
            let mut body = serde_json::to_value(&result).expect("result serializes");
            if let Some(free_tier) = &accepted.free_tier {
                body["freeTier"] = free_tier.clone();
            }
            return Ok((StatusCode::OK, Json(body)).into_response());
        }
        // Sync timeout: the listener is dropped and the caller falls back
        // to polling like any asynchronous submission.
    }

    let mut body = json!({
        "accepted": true,
        "taskId": task_id,
        "estimatedTime": accepted.task.timeout_s,
        "clientIdentity": accepted.task.client_identity,
    });
    if let Some(free_tier) = &accepted.free_tier {
        body["freeTier"] = free_tier.clone();
    }

    Ok((
        StatusCode::ACCEPTED,
        [
            (header::LOCATION, format!("/task/{}", task_id)),
            (header::RETRY_AFTER, "5".to_string()),
        ],
        Json(body),
    )
        .into_response())
}

/// `GET /task/{id}` - running status for pending tasks, the full result
/// for fresh completed ones, 404 otherwise. Owner-only.
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let auth = authenticate_http(&state, &headers, &Method::GET, &format!("/task/{}", id)).await?;

    let owner = state.registry.get_owner(&id).ok_or(ApiError::NotFound)?;
    check_ownership(&owner, &auth, header_str(&headers, "x-client-did"))?;

    if let Some(task) = state.registry.get_pending(&id) {
        return Ok(Json(json!({
            "taskId": id,
            "status": "running",
            "type": task.task_type,
            "clientIdentity": task.client_identity,
        }))
        .into_response());
    }

    match state.registry.get_completed_if_fresh(&id) {
        Some(result) => Ok(Json(serde_json::to_value(&result).expect("result serializes")).into_response()),
        None => Err(ApiError::NotFound),
    }
}

/// `DELETE /task/{id}` - owner-only cancellation of a pending task.
/// Anything that cannot be cancelled reports 404.
pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let auth =
        authenticate_http(&state, &headers, &Method::DELETE, &format!("/task/{}", id)).await?;

    let owner = state.registry.get_owner(&id).ok_or(ApiError::NotFound)?;
    if check_ownership(&owner, &auth, header_str(&headers, "x-client-did")).is_err() {
        // Non-owners learn nothing about the task's existence
        return Err(ApiError::NotFound);
    }

    let executor = state.executor.clone();
    if state.registry.cancel(&id, |task_id| executor.cancel(task_id)) {
        Ok(Json(json!({"cancelled": true, "taskId": id})).into_response())
    } else {
        Err(ApiError::NotFound)
    }
}

/// `POST /sandbox` - unauthenticated throttled trial execution
pub async fn post_sandbox(
    State(state): State<AppState>,
    connect: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let ip = client_ip(&headers, &connect);
    if !state.sandbox_limiter.allow(&ip) {
        metrics::RATE_LIMITED.inc();
        return Err(ApiError::RateLimited {
            reason: format!(
                "sandbox allows {} requests per hour per IP",
                SANDBOX_REQUESTS_PER_HOUR
            ),
        });
    }

    #[derive(Deserialize)]
    struct SandboxRequest {
        prompt: String,
    }
    let request: SandboxRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::Validation(vec![FieldError::new("body", e.to_string())]))?;

    if request.prompt.is_empty() || request.prompt.chars().count() > SANDBOX_PROMPT_MAX {
        return Err(ApiError::Validation(vec![FieldError::new(
            "prompt",
            format!("must be 1-{} characters", SANDBOX_PROMPT_MAX),
        )]));
    }

    let task = Task {
        task_id: crate::task::generate_task_id(),
        task_type: TaskType::Prompt,
        prompt: request.prompt,
        working_dir: None,
        timeout_s: SANDBOX_TIMEOUT_S,
        client_identity: crate::identity::ANONYMOUS.to_string(),
        escrow_id: None,
    };

    if state.executor.sanitize(&task).is_err() {
        return Err(ApiError::InvalidInput(vec![FieldError::new(
            "prompt",
            "contains forbidden shell metacharacters",
        )]));
    }

    let result = state.executor.execute(&task).await;
    Ok(Json(json!({
        "status": result.status,
        "output": result.output.map(|o| clamp_chars(&o, SANDBOX_OUTPUT_MAX)),
        "durationMs": result.duration_ms,
        "mock": result.mock,
    }))
    .into_response())
}

/// `GET /health`
pub async fn get_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "agent": state.config.agent.name}))
}

/// `GET /status` - uptime and queue counts
pub async fn get_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "accepting": state.shutdown.is_accepting(),
        "mockMode": state.executor.is_mock(),
        "queues": {
            "pending": state.registry.pending_count(),
            "completed": state.registry.completed_count(),
            "running": state.executor.running_count(),
        },
    }))
}

/// `GET /metrics` - Prometheus text format
pub async fn get_metrics() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        metrics::render(),
    )
        .into_response()
}

/// `GET /.well-known/{agent.json,agent-card.json,a2a.json}` - one body,
/// three historical aliases
pub async fn get_card(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.card.as_ref().clone())
}

/// `GET /llms.txt`
pub async fn get_llms_txt(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.llms_txt.as_ref().clone(),
    )
        .into_response()
}

/// Truncate to at most `max` characters on a char boundary
fn clamp_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}
