// src/exec/mod.rs — Shell execution collaborator

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use crate::infra::errors::{EngineError, EngineResult};

/// Captured output of one shell command. Output is always returned to the
/// driving agent, never silently swallowed.
#[derive(Debug, Clone)]
pub struct BashOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// External collaborator that runs shell commands for the driving agent.
#[async_trait]
pub trait BashExecutor: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> EngineResult<BashOutput>;
}

/// Runs commands with `sh -c` in the target system's directory.
pub struct LocalBashExecutor {
    workdir: PathBuf,
}

impl LocalBashExecutor {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl BashExecutor for LocalBashExecutor {
    async fn run(&self, command: &str, timeout: Duration) -> EngineResult<BashOutput> {
        tracing::debug!(%command, "running shell command");

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        // Timing out must fail the turn rather than hang the controller;
        // kill_on_drop reaps the abandoned process.
        let output = match tokio::time::timeout(timeout, child).await {
            Ok(result) => result
                .map_err(|e| EngineError::Fatal(anyhow::anyhow!("failed to spawn shell: {e}")))?,
            Err(_) => {
                return Err(EngineError::Timeout {
                    what: format!("bash command '{command}'"),
                    secs: timeout.as_secs(),
                })
            }
        };

        Ok(BashOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> LocalBashExecutor {
        LocalBashExecutor::new(std::env::temp_dir())
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let out = executor()
            .run("echo hello", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn test_captures_stderr_and_nonzero_exit() {
        let out = executor()
            .run("echo oops >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn test_timeout_fails_instead_of_hanging() {
        let err = executor()
            .run("sleep 30", Duration::from_millis(50))
            .await
            .unwrap_err();
        match err {
            EngineError::Timeout { what, .. } => assert!(what.contains("sleep 30")),
            other => panic!("expected Timeout, got {other:?}"),
        }
    }
}
