//! Shared task-submission pipeline
//!
//! REST, JSON-RPC, and WebSocket submissions all flow through
//! [`submit_task`]: intake gate, body validation, executor sanitation,
//! free-tier gating, registration, escrow validation, then asynchronous
//! execution. For a given task the ordering is fixed: accept -> register ->
//! escrow validate -> execute -> complete -> notify -> settle -> record
//! trust. Settlement failures never change the reported result.

use serde_json::json;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::auth::AuthContext;
use crate::identity::IdentityTier;
use crate::metrics;
use crate::task::{FieldError, Task, TaskRequest, TaskResult, TaskStatus};

use super::error::ApiError;
use super::AppState;

/// An accepted submission, ready for response shaping
#[derive(Debug)]
pub struct Accepted {
    pub task: Task,
    /// Present when the caller asked to wait for the result
    pub wait_rx: Option<oneshot::Receiver<TaskResult>>,
    /// Free-tier status block, present for free-tier identities
    pub free_tier: Option<serde_json::Value>,
}

/// Run the full intake pipeline and spawn execution.
///
/// `wait` registers a one-shot listener and `push` attaches a push channel,
/// both between registration and spawn so a fast completion can never be
/// missed.
pub async fn submit_task(
    state: &AppState,
    request: TaskRequest,
    auth: &AuthContext,
    client_ip: &str,
    wait: bool,
    push: Option<tokio::sync::mpsc::UnboundedSender<TaskResult>>,
) -> Result<Accepted, ApiError> {
    // Intake closes the moment draining begins
    if !state.shutdown.is_accepting() {
        return Err(ApiError::ServiceUnavailable {
            reason: "bridge is shutting down".to_string(),
        });
    }

    let task = request
        .resolve(&auth.identity.id)
        .map_err(ApiError::Validation)?;

    // Security sanitation happens before anything is registered; a task
    // rejected here never spawns a subprocess.
    if let Err(e) = state.executor.sanitize(&task) {
        return Err(ApiError::InvalidInput(vec![FieldError::new(
            match e {
                crate::executor::ExecError::UnsafePrompt => "prompt",
                _ => "context.workingDir",
            },
            e.to_string(),
        )]));
    }

    // Free-tier identities are gated by trust tier and IP budget
    let free_tier = if auth.identity.tier == IdentityTier::Free {
        let identity = &auth.identity.id;
        let daily_limit = state.trust.daily_limit_for(identity);
        let (allowed, reason) = state.limiter.can_proceed(identity, client_ip, daily_limit);
        if !allowed {
            metrics::RATE_LIMITED.inc();
            return Err(ApiError::RateLimited {
                reason: reason.unwrap_or_else(|| "daily limit reached".to_string()),
            });
        }
        Some(daily_limit)
    } else {
        None
    };

    state
        .registry
        .register(task.clone(), &auth.identity.id)
        .map_err(|_| {
            ApiError::Validation(vec![FieldError::new("taskId", "is already in use")])
        })?;

    // Escrow validation runs after registration and before execution. A
    // rejected or unverifiable escrow withdraws the just-registered record;
    // no subprocess exists yet, so the cancel hook is a no-op. A chain
    // lookup that failed after retries is a service-layer error, not a
    // payment failure.
    if let Some(ref escrow_id) = task.escrow_id {
        let outcome = match &state.escrow {
            None => Err(ApiError::PaymentRequired {
                challenge: None,
                reason: Some("escrow is not configured on this bridge".to_string()),
            }),
            Some(client) => match client.validate_for_task(escrow_id).await {
                Ok(validation) if validation.valid => {
                    metrics::ESCROW_VALIDATIONS
                        .with_label_values(&["valid"])
                        .inc();
                    Ok(())
                }
                Ok(validation) => {
                    metrics::ESCROW_VALIDATIONS
                        .with_label_values(&["invalid"])
                        .inc();
                    Err(ApiError::PaymentRequired {
                        challenge: None,
                        reason: Some(
                            validation
                                .error
                                .unwrap_or_else(|| "escrow validation failed".to_string()),
                        ),
                    })
                }
                Err(e) => {
                    metrics::ESCROW_VALIDATIONS
                        .with_label_values(&["error"])
                        .inc();
                    warn!(
                        task_id = %task.task_id,
                        escrow_id = %escrow_id,
                        error = %e,
                        "Escrow lookup failed after retries"
                    );
                    Err(ApiError::BadGateway)
                }
            },
        };
        if let Err(e) = outcome {
            state.registry.cancel(&task.task_id, |_| true);
            return Err(e);
        }
    }

    // Quota burn happens once the task is actually accepted
    let free_tier = free_tier.map(|daily_limit| {
        state.limiter.record(&auth.identity.id, client_ip);
        let profile = state.trust.observe(&auth.identity.id);
        json!({
            "tier": profile.tier.as_str(),
            "dailyLimit": daily_limit,
            "remaining": state.limiter.remaining(&auth.identity.id, daily_limit),
        })
    });

    metrics::TASKS_SUBMITTED.inc();
    metrics::TASKS_IN_FLIGHT.set(state.registry.pending_count() as i64);

    // Listener and push channel must exist before execution can complete
    let wait_rx = if wait {
        state.registry.subscribe(&task.task_id)
    } else {
        None
    };
    if let Some(push) = push {
        state.registry.attach_push(&task.task_id, push);
    }

    info!(
        task_id = %task.task_id,
        owner = %auth.identity.id,
        task_type = %task.task_type,
        escrow = task.escrow_id.is_some(),
        "Task accepted"
    );

    let spawn_state = state.clone();
    let spawn_task = task.clone();
    let owner = auth.identity.id.clone();
    tokio::spawn(async move {
        run_task(spawn_state, spawn_task, owner).await;
    });

    Ok(Accepted {
        task,
        wait_rx,
        free_tier,
    })
}

/// Execute one registered task to completion: execute, complete the
/// registry record (draining listeners and the push channel), settle the
/// escrow best-effort, then record trust exactly once.
async fn run_task(state: AppState, task: Task, owner: String) {
    let result = state.executor.execute(&task).await;

    metrics::TASKS_FINISHED
        .with_label_values(&[result.status.as_str()])
        .inc();

    state.registry.complete(&task.task_id, result.clone());
    metrics::TASKS_IN_FLIGHT.set(state.registry.pending_count() as i64);

    // Delivery confirmation comes after completion; its failure is logged
    // and does not touch the reported status. Mock completions never reach
    // the chain.
    if result.status == TaskStatus::Completed && !result.mock {
        if let (Some(escrow_id), Some(client)) = (&task.escrow_id, &state.escrow) {
            let output = result.output.as_deref().unwrap_or("");
            match client.confirm_delivery(escrow_id, output).await {
                Ok(tx_hash) => {
                    metrics::DELIVERY_CONFIRMATIONS
                        .with_label_values(&["confirmed"])
                        .inc();
                    info!(task_id = %task.task_id, escrow_id = %escrow_id, tx_hash = %tx_hash, "Escrow delivery confirmed");
                }
                Err(e) => {
                    metrics::DELIVERY_CONFIRMATIONS
                        .with_label_values(&["failed"])
                        .inc();
                    warn!(task_id = %task.task_id, escrow_id = %escrow_id, error = %e, "Delivery confirmation failed");
                }
            }
        }
    }

    match result.status {
        TaskStatus::Completed => state.trust.record_completion(&owner),
        TaskStatus::Failed | TaskStatus::Timeout => state.trust.record_failure(&owner),
    }
}

/// Ownership check for follow-up operations: the authenticated identity
/// must match the recorded owner, or the caller asserts it via
/// `x-client-did`.
pub fn check_ownership(
    owner: &str,
    auth: &AuthContext,
    x_client_did: Option<&str>,
) -> Result<(), ApiError> {
    if auth.identity.id == owner || x_client_did == Some(owner) {
        return Ok(());
    }
    Err(ApiError::Forbidden)
}
