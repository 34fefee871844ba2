//! Task model: wire request, resolved task, and result types
//!
//! Validation here covers everything that can be checked without touching the
//! filesystem; working-directory containment is enforced by the executor
//! which owns the workspace root.

use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prompt length ceiling, in characters
pub const MAX_PROMPT_CHARS: usize = 100_000;

/// Characters that would reach a shell if interpolation were ever enabled.
/// Prompts containing any of these are rejected outright.
pub const SHELL_METACHARACTERS: [char; 6] = [';', '|', '&', '`', '<', '>'];

/// Per-task timeout bounds, seconds
pub const MIN_TIMEOUT_S: u64 = 1;
pub const MAX_TIMEOUT_S: u64 = 3600;
pub const DEFAULT_TIMEOUT_S: u64 = 300;

lazy_static! {
    static ref TASK_ID_RE: Regex =
        Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("static regex is valid");
}

/// Task categories accepted on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    #[default]
    Prompt,
    CodeReview,
    Refactor,
    Debug,
    Custom,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Prompt => "prompt",
            TaskType::CodeReview => "code-review",
            TaskType::Refactor => "refactor",
            TaskType::Debug => "debug",
            TaskType::Custom => "custom",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Optional execution context supplied by the client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// Wire shape of a task submission body
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default, rename = "type")]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub context: Option<TaskContext>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub client_identity: Option<String>,
    #[serde(default)]
    pub escrow_id: Option<String>,
}

/// A fully validated task ready for registration and execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    pub timeout_s: u64,
    pub client_identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escrow_id: Option<String>,
}

/// Terminal state of a task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whole-task execution result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub mock: bool,
}

/// A single field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Validate a task id (1–128 chars of `[A-Za-z0-9_-]`)
pub fn is_valid_task_id(s: &str) -> bool {
    TASK_ID_RE.is_match(s)
}

/// Generate a task id: `task-<unix_ms>-<8 hex chars>`
pub fn generate_task_id() -> String {
    let ms = chrono::Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen();
    format!("task-{}-{:08x}", ms, suffix)
}

impl TaskRequest {
    /// Resolve a wire request into a validated [`Task`].
    ///
    /// `authenticated_identity` backfills `client_identity` when the body
    /// omits it. All failures are collected so the caller can report them
    /// together.
    pub fn resolve(self, authenticated_identity: &str) -> Result<Task, Vec<FieldError>> {
        let mut errors = Vec::new();

        let task_id = match self.task_id {
            Some(id) => {
                if !is_valid_task_id(&id) {
                    errors.push(FieldError::new(
                        "taskId",
                        "must be 1-128 characters of [A-Za-z0-9_-]",
                    ));
                }
                id
            }
            None => generate_task_id(),
        };

        let prompt = self.prompt.unwrap_or_default();
        let prompt_chars = prompt.chars().count();
        if prompt_chars == 0 {
            errors.push(FieldError::new("prompt", "is required"));
        } else if prompt_chars > MAX_PROMPT_CHARS {
            errors.push(FieldError::new(
                "prompt",
                format!("exceeds maximum length of {} characters", MAX_PROMPT_CHARS),
            ));
        }
        if prompt.contains(SHELL_METACHARACTERS) {
            errors.push(FieldError::new(
                "prompt",
                "contains forbidden shell metacharacters",
            ));
        }

        let timeout_s = self.timeout.unwrap_or(DEFAULT_TIMEOUT_S);
        if !(MIN_TIMEOUT_S..=MAX_TIMEOUT_S).contains(&timeout_s) {
            errors.push(FieldError::new(
                "timeout",
                format!("must be between {} and {} seconds", MIN_TIMEOUT_S, MAX_TIMEOUT_S),
            ));
        }

        if let Some(ref escrow_id) = self.escrow_id {
            if escrow_id.is_empty() || !escrow_id.bytes().all(|b| b.is_ascii_digit()) {
                errors.push(FieldError::new("escrowId", "must be a numeric string"));
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Task {
            task_id,
            task_type: self.task_type.unwrap_or_default(),
            prompt,
            working_dir: self.context.and_then(|c| c.working_dir),
            timeout_s,
            client_identity: self
                .client_identity
                .unwrap_or_else(|| authenticated_identity.to_string()),
            escrow_id: self.escrow_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> TaskRequest {
        TaskRequest {
            prompt: Some(prompt.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_minimal_request() {
        let task = request("echo hi").resolve("did:key:zAbc").unwrap();
        assert!(task.task_id.starts_with("task-"));
        assert_eq!(task.task_type, TaskType::Prompt);
        assert_eq!(task.timeout_s, DEFAULT_TIMEOUT_S);
        assert_eq!(task.client_identity, "did:key:zAbc");
    }

    #[test]
    fn test_body_identity_wins_over_auth() {
        let mut req = request("hi");
        req.client_identity = Some("did:key:zBody".to_string());
        let task = req.resolve("did:key:zAuth").unwrap();
        assert_eq!(task.client_identity, "did:key:zBody");
    }

    #[test]
    fn test_prompt_boundary_lengths() {
        // Exactly at the cap is accepted
        let ok = request(&"a".repeat(MAX_PROMPT_CHARS)).resolve("anon");
        assert!(ok.is_ok());

        // One past the cap is rejected
        let err = request(&"a".repeat(MAX_PROMPT_CHARS + 1))
            .resolve("anon")
            .unwrap_err();
        assert!(err.iter().any(|e| e.field == "prompt"));
    }

    #[test]
    fn test_prompt_shell_metacharacters_rejected() {
        for c in SHELL_METACHARACTERS {
            let err = request(&format!("echo hi {} rm", c))
                .resolve("anon")
                .unwrap_err();
            assert!(
                err.iter().any(|e| e.message.contains("metacharacters")),
                "character {:?} must be rejected",
                c
            );
        }
    }

    #[test]
    fn test_empty_prompt_rejected() {
        assert!(request("").resolve("anon").is_err());
    }

    #[test]
    fn test_task_id_boundary_lengths() {
        assert!(is_valid_task_id(&"t".repeat(128)));
        assert!(!is_valid_task_id(&"t".repeat(129)));
        assert!(!is_valid_task_id(""));
        assert!(!is_valid_task_id("has space"));
    }

    #[test]
    fn test_supplied_task_id_kept() {
        let mut req = request("hi");
        req.task_id = Some("my-task_1".to_string());
        assert_eq!(req.resolve("anon").unwrap().task_id, "my-task_1");
    }

    #[test]
    fn test_timeout_bounds() {
        let mut req = request("hi");
        req.timeout = Some(3600);
        assert!(req.clone().resolve("anon").is_ok());
        req.timeout = Some(3601);
        assert!(req.clone().resolve("anon").is_err());
        req.timeout = Some(0);
        assert!(req.resolve("anon").is_err());
    }

    #[test]
    fn test_escrow_id_numeric_only() {
        let mut req = request("hi");
        req.escrow_id = Some("42".to_string());
        assert!(req.clone().resolve("anon").is_ok());
        req.escrow_id = Some("0x2a".to_string());
        assert!(req.resolve("anon").is_err());
    }

    #[test]
    fn test_generated_ids_are_valid_and_unique() {
        let a = generate_task_id();
        let b = generate_task_id();
        assert!(is_valid_task_id(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn test_task_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&TaskType::CodeReview).unwrap(),
            "\"code-review\""
        );
        assert_eq!(TaskType::Custom.as_str(), "custom");
    }

    #[test]
    fn test_result_serialization_skips_empty() {
        let result = TaskResult {
            task_id: "t1".to_string(),
            status: TaskStatus::Completed,
            output: Some("ok".to_string()),
            error: None,
            duration_ms: 12,
            mock: false,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "completed");
        assert!(json.get("error").is_none());
        assert!(json.get("mock").is_none());
    }
}
