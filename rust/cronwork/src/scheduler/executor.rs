//! Shell command execution.
//!
//! Commands run through the configured shell with the task's environment
//! overrides merged over the process environment. A non-zero exit is a
//! normal result, and so is a launch failure.

use std::collections::BTreeMap;
use std::process::Stdio;

use tokio::process::Command;

use crate::config::ExecutorConfig;
use crate::domain::ExecutionResult;

/// Default per-stream output cap, in characters.
pub const DEFAULT_OUTPUT_CAP: usize = 10_000;

/// Keep the first `cap` characters of `text`, appending a marker with the
/// number of characters dropped.
#[must_use]
pub fn truncate_output(text: &str, cap: usize) -> String {
    let total = text.chars().count();
    if total <= cap {
        return text.to_string();
    }
    let kept: String = text.chars().take(cap).collect();
    format!("{kept}\n...[truncated {} chars]", total - cap)
}

/// Runs task commands.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    shell: String,
    output_cap: usize,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            output_cap: DEFAULT_OUTPUT_CAP,
        }
    }
}

impl CommandExecutor {
    #[must_use]
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            output_cap: config.output_cap,
        }
    }

    /// Run `command` and capture its exit code and bounded output.
    pub async fn execute(
        &self,
        command: &str,
        envs: Option<&BTreeMap<String, String>>,
    ) -> ExecutionResult {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(envs) = envs {
            cmd.envs(envs);
        }

        match cmd.output().await {
            Ok(output) => ExecutionResult {
                exit_code: output.status.code(),
                stdout: Some(truncate_output(
                    &String::from_utf8_lossy(&output.stdout),
                    self.output_cap,
                )),
                stderr: Some(truncate_output(
                    &String::from_utf8_lossy(&output.stderr),
                    self.output_cap,
                )),
            },
            Err(e) => {
                tracing::warn!(shell = %self.shell, error = %e, "Failed to launch command");
                ExecutionResult {
                    exit_code: None,
                    stdout: None,
                    stderr: Some(e.to_string()),
                }
            }
        }
    }
}
