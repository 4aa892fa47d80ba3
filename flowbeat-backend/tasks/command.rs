use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use crate::flows::runner::WorkUnit;

pub const NAME: &str = "ShellCommand";

#[derive(Debug, Deserialize)]
struct Params {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// Runs a program; a non-zero exit fails the run with its stderr.
pub struct ShellCommand {
    command: String,
    args: Vec<String>,
    working_dir: Option<String>,
    timeout: Option<Duration>,
}

impl ShellCommand {
    pub fn from_config(config: &Value) -> Result<Self> {
        if !config.is_object() {
            bail!("{NAME} requires a 'command' parameter");
        }
        let params: Params =
            serde_json::from_value(config.clone()).context("invalid ShellCommand parameters")?;
        Ok(Self {
            command: params.command,
            args: params.args,
            working_dir: params.working_dir,
            timeout: params.timeout_secs.map(Duration::from_secs),
        })
    }
}

#[async_trait]
impl WorkUnit for ShellCommand {
    async fn run(&self) -> Result<()> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", self.command))?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .with_context(|| format!("'{}' timed out after {}s", self.command, limit.as_secs()))??,
            None => child.wait_with_output().await?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("'{}' exited with {}: {}", self.command, output.status, stderr.trim());
        }

        tracing::info!(
            unit = NAME,
            command = %self.command,
            stdout_bytes = output.stdout.len(),
            "Command succeeded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unit(config: Value) -> ShellCommand {
        ShellCommand::from_config(&config).unwrap()
    }

    #[test]
    fn test_requires_command() {
        assert!(ShellCommand::from_config(&json!("ShellCommand")).is_err());
        assert!(ShellCommand::from_config(&json!({ "class_name": "ShellCommand" })).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_zero_exit_succeeds() {
        unit(json!({ "class_name": "ShellCommand", "command": "true" }))
            .run()
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_reports_stderr() {
        let err = unit(json!({
            "class_name": "ShellCommand",
            "command": "sh",
            "args": ["-c", "echo broken >&2; exit 3"]
        }))
        .run()
        .await
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("broken"), "{msg}");
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let err = unit(json!({ "class_name": "ShellCommand", "command": "definitely-not-a-real-binary-xyz" }))
            .run()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }
}
