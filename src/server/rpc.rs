//! JSON-RPC 2.0 envelope
//!
//! Served at `POST /` (and `/a2a`). Every response is HTTP 200; failures
//! live in the body as standard JSON-RPC errors. Envelope validation
//! rejects requests without `jsonrpc: "2.0"` or with a null id, answering
//! with a null-id error object.

use axum::body::Bytes;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::State;
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;

use crate::task::TaskRequest;

use super::error::ApiError;
use super::submit::{check_ownership, submit_task};
use super::{authenticate_http, client_ip, header_str, AppState};

// Standard JSON-RPC error codes
const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;
// Service codes
const TASK_NOT_FOUND: i64 = -32000;
const TASK_NOT_CANCELLABLE: i64 = -32001;
const UNAUTHORIZED: i64 = -32002;
const RATE_LIMITED: i64 = -32003;

pub async fn handle_rpc(
    State(state): State<AppState>,
    connect: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let envelope: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return rpc_error(Value::Null, PARSE_ERROR, "parse error"),
    };

    // Envelope validation: object, jsonrpc 2.0, non-null id
    let (id, method, params) = match parse_envelope(&envelope) {
        Ok(parts) => parts,
        Err(message) => return rpc_error(Value::Null, INVALID_REQUEST, message),
    };

    let outcome = dispatch(&state, &connect, &headers, method, params).await;
    match outcome {
        Ok(result) => Json(json!({"jsonrpc": "2.0", "id": id, "result": result})).into_response(),
        Err((code, message)) => rpc_error(id, code, &message),
    }
}

fn parse_envelope(envelope: &Value) -> Result<(Value, &str, Value), &'static str> {
    let obj = envelope.as_object().ok_or("request must be an object")?;
    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err("jsonrpc must be \"2.0\"");
    }
    let id = match obj.get("id") {
        Some(Value::Null) | None => return Err("id must be present and non-null"),
        Some(id) => id.clone(),
    };
    let method = obj
        .get("method")
        .and_then(Value::as_str)
        .ok_or("method must be a string")?;
    let params = obj.get("params").cloned().unwrap_or(Value::Null);
    Ok((id, method, params))
}

async fn dispatch(
    state: &AppState,
    connect: &ConnectInfo<SocketAddr>,
    headers: &HeaderMap,
    method: &str,
    params: Value,
) -> Result<Value, (i64, String)> {
    match method {
        "message/send" => message_send(state, connect, headers, params).await,
        "tasks/get" => tasks_get(state, headers, params).await,
        "tasks/cancel" => tasks_cancel(state, headers, params).await,
        "agent/describe" => Ok(state.card.as_ref().clone()),
        "agent/status" => Ok(json!({
            "status": "ok",
            "agent": state.config.agent.name,
            "version": state.config.agent.version,
            "uptimeSeconds": state.started_at.elapsed().as_secs(),
            "pending": state.registry.pending_count(),
        })),
        _ => Err((METHOD_NOT_FOUND, format!("unknown method '{}'", method))),
    }
}

/// `message/send`: extract the first text part, synthesize a task, submit
/// it, and answer with an A2A task object.
async fn message_send(
    state: &AppState,
    connect: &ConnectInfo<SocketAddr>,
    headers: &HeaderMap,
    params: Value,
) -> Result<Value, (i64, String)> {
    let auth = authenticate_http(state, headers, &Method::POST, "/")
        .await
        .map_err(map_api_error)?;
    let ip = client_ip(headers, connect);

    let text = params["message"]["parts"]
        .as_array()
        .and_then(|parts| {
            parts.iter().find_map(|part| {
                let kind = part["kind"].as_str().or_else(|| part["type"].as_str());
                if kind == Some("text") {
                    part["text"].as_str()
                } else {
                    None
                }
            })
        })
        .ok_or((INVALID_PARAMS, "message has no text part".to_string()))?;

    let request = TaskRequest {
        prompt: Some(text.to_string()),
        ..Default::default()
    };

    let accepted = submit_task(state, request, &auth, &ip, true, None)
        .await
        .map_err(map_api_error)?;
    let task_id = accepted.task.task_id.clone();

    let rx = match accepted.wait_rx {
        Some(rx) => rx,
        None => return Ok(a2a_task(&task_id, "submitted", None)),
    };

    let sync_timeout = Duration::from_secs(state.config.sync_timeout_s);
    match tokio::time::timeout(sync_timeout, rx).await {
        Ok(Ok(result)) => {
            let state_name = if result.status == crate::task::TaskStatus::Completed {
                "completed"
            } else {
                "failed"
            };
            Ok(a2a_task(&task_id, state_name, result.output.as_deref()))
        }
        // Still running: the caller polls with tasks/get
        _ => Ok(a2a_task(&task_id, "submitted", None)),
    }
}

async fn tasks_get(
    state: &AppState,
    headers: &HeaderMap,
    params: Value,
) -> Result<Value, (i64, String)> {
    let auth = authenticate_http(state, headers, &Method::POST, "/")
        .await
        .map_err(map_api_error)?;
    let id = params["id"]
        .as_str()
        .ok_or((INVALID_PARAMS, "params.id is required".to_string()))?;

    let owner = state
        .registry
        .get_owner(id)
        .ok_or((TASK_NOT_FOUND, format!("task '{}' not found", id)))?;
    check_ownership(&owner, &auth, header_str(headers, "x-client-did")).map_err(map_api_error)?;

    if state.registry.get_pending(id).is_some() {
        return Ok(a2a_task(id, "working", None));
    }
    match state.registry.get_completed_if_fresh(id) {
        Some(result) => {
            let state_name = if result.status == crate::task::TaskStatus::Completed {
                "completed"
            } else {
                "failed"
            };
            Ok(a2a_task(id, state_name, result.output.as_deref()))
        }
        None => Err((TASK_NOT_FOUND, format!("task '{}' not found", id))),
    }
}

async fn tasks_cancel(
    state: &AppState,
    headers: &HeaderMap,
    params: Value,
) -> Result<Value, (i64, String)> {
    let auth = authenticate_http(state, headers, &Method::POST, "/")
        .await
        .map_err(map_api_error)?;
    let id = params["id"]
        .as_str()
        .ok_or((INVALID_PARAMS, "params.id is required".to_string()))?;

    let owner = state
        .registry
        .get_owner(id)
        .ok_or((TASK_NOT_FOUND, format!("task '{}' not found", id)))?;
    check_ownership(&owner, &auth, header_str(headers, "x-client-did")).map_err(map_api_error)?;

    let executor = state.executor.clone();
    if state.registry.cancel(id, |task_id| executor.cancel(task_id)) {
        Ok(a2a_task(id, "canceled", None))
    } else {
        Err((
            TASK_NOT_CANCELLABLE,
            format!("task '{}' cannot be cancelled", id),
        ))
    }
}

/// A2A task object shape
fn a2a_task(id: &str, state_name: &str, output: Option<&str>) -> Value {
    let mut task = json!({
        "id": id,
        "status": {"state": state_name},
    });
    if let Some(output) = output {
        task["artifacts"] = json!([{
            "name": "output",
            "parts": [{"kind": "text", "text": output}],
        }]);
    }
    task
}

fn map_api_error(err: ApiError) -> (i64, String) {
    let message = err.body()["error"]["message"]
        .as_str()
        .unwrap_or("error")
        .to_string();
    let code = match &err {
        ApiError::Validation(_) | ApiError::InvalidInput(_) => INVALID_PARAMS,
        ApiError::Unauthorized | ApiError::PaymentRequired { .. } | ApiError::Forbidden => {
            UNAUTHORIZED
        }
        ApiError::RateLimited { .. } => RATE_LIMITED,
        ApiError::NotFound => TASK_NOT_FOUND,
        _ => INTERNAL_ERROR,
    };
    (code, message)
}

fn rpc_error(id: Value, code: i64, message: &str) -> Response {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_requires_version_and_id() {
        assert!(parse_envelope(&json!({"id": 1, "method": "x"})).is_err());
        assert!(parse_envelope(&json!({"jsonrpc": "1.0", "id": 1, "method": "x"})).is_err());
        assert!(parse_envelope(&json!({"jsonrpc": "2.0", "id": null, "method": "x"})).is_err());
        assert!(parse_envelope(&json!({"jsonrpc": "2.0", "method": "x"})).is_err());
        assert!(parse_envelope(&json!("not an object")).is_err());

        let value = json!({"jsonrpc": "2.0", "id": 7, "method": "agent/status"});
        let (id, method, _) = parse_envelope(&value).unwrap();
        assert_eq!(id, json!(7));
        assert_eq!(method, "agent/status");
    }

    #[test]
    fn test_a2a_task_shape() {
        let task = a2a_task("t1", "completed", Some("done"));
        assert_eq!(task["id"], "t1");
        assert_eq!(task["status"]["state"], "completed");
        assert_eq!(task["artifacts"][0]["parts"][0]["text"], "done");

        let bare = a2a_task("t2", "working", None);
        assert!(bare.get("artifacts").is_none());
    }

    #[test]
    fn test_api_error_code_mapping() {
        assert_eq!(map_api_error(ApiError::NotFound).0, TASK_NOT_FOUND);
        assert_eq!(map_api_error(ApiError::Unauthorized).0, UNAUTHORIZED);
        assert_eq!(
            map_api_error(ApiError::RateLimited {
                reason: "x".to_string()
            })
            .0,
            RATE_LIMITED
        );
        assert_eq!(map_api_error(ApiError::Validation(vec![])).0, INVALID_PARAMS);
    }
}
