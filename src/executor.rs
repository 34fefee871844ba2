//! Constrained subprocess executor
//!
//! Spawns the configured coding CLI with shell interpolation disabled:
//! arguments go in as a vector, stdin is closed, the working directory is
//! pinned inside the workspace root, and stdout is capped at 10 MiB. A task
//! that outlives its timeout gets SIGTERM and surfaces `status=timeout`.
//!
//! At construction the command is probed with `which`; when absent the
//! executor runs in mock mode and returns templated completions so the rest
//! of the pipeline (registry, trust, settlement skip) behaves identically.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::task::{Task, TaskResult, TaskStatus, SHELL_METACHARACTERS};

/// Output collection stops appending past this many bytes; the child keeps
/// running and its remaining output is drained and discarded.
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Grace period between SIGTERM and SIGKILL on timeout
const TERM_GRACE: Duration = Duration::from_secs(5);

/// A task failed validation before any subprocess was spawned
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecError {
    #[error("command '{0}' is not in the allowlist")]
    CommandNotAllowed(String),
    #[error("prompt contains forbidden shell metacharacters")]
    UnsafePrompt,
    #[error("working directory escapes the workspace root")]
    WorkingDirOutsideWorkspace,
    #[error("working directory is not valid UTF-8 after decoding")]
    WorkingDirUndecodable,
}

#[derive(Debug)]
pub struct Executor {
    command: String,
    workspace_root: PathBuf,
    max_timeout_s: u64,
    mock_mode: bool,
    /// task_id -> child pid, so cancel is O(1)
    children: Mutex<HashMap<String, u32>>,
}

impl Executor {
    /// Build an executor for `command`. The command must appear in
    /// `allowed_commands`; its presence on the host decides mock mode.
    pub fn new(
        command: &str,
        allowed_commands: &[String],
        workspace_root: impl Into<PathBuf>,
        max_timeout_s: u64,
    ) -> Result<Self, ExecError> {
        if !allowed_commands.iter().any(|c| c == command) {
            return Err(ExecError::CommandNotAllowed(command.to_string()));
        }

        let mock_mode = !probe_command(command);
        if mock_mode {
            warn!(
                command = %command,
                "Command not found on host, executor running in mock mode"
            );
        } else {
            info!(command = %command, "Executor command probe succeeded");
        }

        Ok(Self {
            command: command.to_string(),
            workspace_root: workspace_root.into(),
            max_timeout_s,
            mock_mode,
            children: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_mock(&self) -> bool {
        self.mock_mode
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Validate everything about a task that gates spawning: prompt
    /// hygiene and working-directory containment. Returns the resolved
    /// working directory.
    pub fn sanitize(&self, task: &Task) -> Result<PathBuf, ExecError> {
        if task.prompt.contains(SHELL_METACHARACTERS) {
            return Err(ExecError::UnsafePrompt);
        }
        self.resolve_working_dir(task.working_dir.as_deref())
    }

    /// URL-decode and resolve a requested working directory against the
    /// workspace root. The result must equal the root or lie strictly
    /// under it.
    fn resolve_working_dir(&self, raw: Option<&str>) -> Result<PathBuf, ExecError> {
        let raw = match raw {
            Some(r) if !r.is_empty() => r,
            _ => return Ok(self.workspace_root.clone()),
        };

        let decoded = percent_decode_str(raw)
            .decode_utf8()
            .map_err(|_| ExecError::WorkingDirUndecodable)?;

        let requested = Path::new(decoded.as_ref());
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.workspace_root.join(requested)
        };

        // Lexical normalization: `..` must never climb above the root.
        let mut resolved = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    if !resolved.pop() {
                        return Err(ExecError::WorkingDirOutsideWorkspace);
                    }
                }
                Component::CurDir => {}
                other => resolved.push(other),
            }
        }

        if resolved == self.workspace_root
            || resolved.starts_with(&self.workspace_root)
        {
            Ok(resolved)
        } else {
            Err(ExecError::WorkingDirOutsideWorkspace)
        }
    }

    /// Execute a task to completion. Validation failures and spawn errors
    /// surface as `failed` results; they never panic or propagate.
    pub async fn execute(&self, task: &Task) -> TaskResult {
        let started = Instant::now();

        let cwd = match self.sanitize(task) {
            Ok(cwd) => cwd,
            Err(e) => return failed(task, &e.to_string(), started),
        };

        if self.mock_mode {
            return self.mock_result(task, started);
        }

        let effective_timeout = Duration::from_secs(task.timeout_s.min(self.max_timeout_s));
        debug!(
            task_id = %task.task_id,
            cwd = %cwd.display(),
            timeout_s = effective_timeout.as_secs(),
            "Spawning task subprocess"
        );

        let mut child = match Command::new(&self.command)
            .arg(&task.prompt)
            .current_dir(&cwd)
            .env("CI", "true")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "Failed to spawn subprocess");
                return failed(task, "failed to start subprocess", started);
            }
        };

        if let Some(pid) = child.id() {
            self.children
                .lock()
                .expect("executor lock poisoned")
                .insert(task.task_id.clone(), pid);
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_task = tokio::spawn(collect_capped(stdout));
        let stderr_task = {
            let task_id = task.task_id.clone();
            tokio::spawn(async move {
                if let Some(mut stderr) = stderr {
                    let mut buf = Vec::new();
                    let _ = stderr.read_to_end(&mut buf).await;
                    if !buf.is_empty() {
                        debug!(
                            task_id = %task_id,
                            stderr = %String::from_utf8_lossy(&buf),
                            "Subprocess stderr"
                        );
                    }
                }
            })
        };

        let wait_outcome = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(effective_timeout) => None,
        };

        let result = match wait_outcome {
            Some(Ok(status)) => {
                let output = stdout_task.await.unwrap_or_default();
                match status.code() {
                    Some(0) => TaskResult {
                        task_id: task.task_id.clone(),
                        status: TaskStatus::Completed,
                        output: Some(output),
                        error: None,
                        duration_ms: elapsed_ms(started),
                        mock: false,
                    },
                    Some(code) => TaskResult {
                        task_id: task.task_id.clone(),
                        status: TaskStatus::Failed,
                        output: None,
                        error: Some(format!("subprocess exited with code {}", code)),
                        duration_ms: elapsed_ms(started),
                        mock: false,
                    },
                    None => TaskResult {
                        task_id: task.task_id.clone(),
                        status: TaskStatus::Failed,
                        output: None,
                        error: Some("subprocess terminated by signal".to_string()),
                        duration_ms: elapsed_ms(started),
                        mock: false,
                    },
                }
            }
            Some(Err(e)) => {
                warn!(task_id = %task.task_id, error = %e, "Failed to await subprocess");
                failed(task, "failed to await subprocess", started)
            }
            None => {
                // Timed out: SIGTERM, short grace, then hard kill
                if let Some(pid) = child.id() {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
                if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
                stdout_task.abort();
                TaskResult {
                    task_id: task.task_id.clone(),
                    status: TaskStatus::Timeout,
                    output: None,
                    error: Some(format!(
                        "task exceeded timeout of {} seconds",
                        effective_timeout.as_secs()
                    )),
                    duration_ms: elapsed_ms(started),
                    mock: false,
                }
            }
        };

        stderr_task.abort();
        self.children
            .lock()
            .expect("executor lock poisoned")
            .remove(&task.task_id);

        result
    }

    /// Send SIGTERM to the child owned by `task_id`. Returns whether a
    /// running child was found; does not wait for it to exit.
    pub fn cancel(&self, task_id: &str) -> bool {
        let pid = {
            let children = self.children.lock().expect("executor lock poisoned");
            children.get(task_id).copied()
        };
        match pid {
            Some(pid) => {
                info!(task_id = %task_id, pid = pid, "Cancelling task subprocess");
                kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
            }
            None => false,
        }
    }

    /// Number of currently running subprocesses
    pub fn running_count(&self) -> usize {
        self.children.lock().expect("executor lock poisoned").len()
    }

    fn mock_result(&self, task: &Task, started: Instant) -> TaskResult {
        let output = format!(
            "[mock] '{}' is not installed on this host.\n\
             Task {} ({}) acknowledged; prompt was {} characters.\n\
             Install the command or adjust the allowlist to run real executions.",
            self.command,
            task.task_id,
            task.task_type,
            task.prompt.chars().count()
        );
        TaskResult {
            task_id: task.task_id.clone(),
            status: TaskStatus::Completed,
            output: Some(output),
            error: None,
            duration_ms: elapsed_ms(started),
            mock: true,
        }
    }
}

/// `which`-probe for the command, run once at construction
fn probe_command(command: &str) -> bool {
    std::process::Command::new("which")
        .arg(command)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Read a stream to the end, keeping at most [`MAX_OUTPUT_BYTES`]. Excess
/// is drained so the child never blocks on a full pipe.
async fn collect_capped(stream: Option<tokio::process::ChildStdout>) -> String {
    let mut stream = match stream {
        Some(s) => s,
        None => return String::new(),
    };
    let mut collected: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if collected.len() < MAX_OUTPUT_BYTES {
                    let take = n.min(MAX_OUTPUT_BYTES - collected.len());
                    collected.extend_from_slice(&buf[..take]);
                }
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn failed(task: &Task, error: &str, started: Instant) -> TaskResult {
    TaskResult {
        task_id: task.task_id.clone(),
        status: TaskStatus::Failed,
        output: None,
        error: Some(error.to_string()),
        duration_ms: elapsed_ms(started),
        mock: false,
    }
}
