//! AI CLI subprocess.
//!
//! The reviewer and scorer treat the AI as a text-in/text-out binary:
//! `{binary} --print --dangerously-skip-permissions {prompt}`. The
//! permission-bypass flag lets it run in a scratch directory that is not a
//! repository; credentials live in the CLI's own home-directory store.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

use crate::util::truncate_with_ellipsis;

/// How much stderr is kept on failures.
const STDERR_CAP: usize = 500;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("CLI exited with {code}: {stderr}")]
    NonZero { code: i32, stderr: String },
    #[error("CLI produced no output")]
    EmptyOutput,
    #[error("CLI timed out after {0}s")]
    Timeout(u64),
}

pub struct CliAgent {
    binary: PathBuf,
    timeout: Duration,
}

impl CliAgent {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    /// Run the CLI over a prompt and return trimmed stdout.
    pub async fn run(&self, prompt: &str) -> Result<String, AgentError> {
        let child = Command::new(&self.binary)
            .arg("--print")
            .arg("--dangerously-skip-permissions")
            .arg(prompt)
            .current_dir(std::env::temp_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AgentError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(AgentError::Spawn {
                    binary: self.binary.display().to_string(),
                    source,
                })
            }
            // Dropping the future kills the child (kill_on_drop).
            Err(_) => return Err(AgentError::Timeout(self.timeout.as_secs())),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::NonZero {
                code: output.status.code().unwrap_or(-1),
                stderr: truncate_with_ellipsis(stderr.trim(), STDERR_CAP),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if stdout.is_empty() {
            return Err(AgentError::EmptyOutput);
        }
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Write an executable shell script standing in for the AI CLI.
    fn fake_cli(tmp: &TempDir, script_body: &str) -> PathBuf {
        let path = tmp.path().join("fake-cli");
        std::fs::write(&path, format!("#!/bin/sh\n{script_body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[tokio::test]
    async fn returns_stdout_on_success() {
        let tmp = TempDir::new().unwrap();
        let cli = fake_cli(&tmp, "echo 'LGTM'");
        let agent = CliAgent::new(cli, Duration::from_secs(5));
        let output = agent.run("review this").await.unwrap();
        assert_eq!(output, "LGTM");
    }

    #[tokio::test]
    async fn prompt_is_passed_as_last_argument() {
        let tmp = TempDir::new().unwrap();
        // Echo back the final argument.
        let cli = fake_cli(&tmp, r#"for a in "$@"; do last="$a"; done; echo "$last""#);
        let agent = CliAgent::new(cli, Duration::from_secs(5));
        let output = agent.run("the actual prompt").await.unwrap();
        assert_eq!(output, "the actual prompt");
    }

    #[tokio::test]
    async fn nonzero_exit_captures_stderr() {
        let tmp = TempDir::new().unwrap();
        let cli = fake_cli(&tmp, "echo 'credential missing' >&2; exit 3");
        let agent = CliAgent::new(cli, Duration::from_secs(5));
        match agent.run("x").await {
            Err(AgentError::NonZero { code, stderr }) => {
                assert_eq!(code, 3);
                assert!(stderr.contains("credential missing"));
            }
            other => panic!("expected NonZero, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_output_is_a_failure() {
        let tmp = TempDir::new().unwrap();
        let cli = fake_cli(&tmp, "exit 0");
        let agent = CliAgent::new(cli, Duration::from_secs(5));
        assert!(matches!(agent.run("x").await, Err(AgentError::EmptyOutput)));
    }

    #[tokio::test]
    async fn slow_cli_times_out() {
        let tmp = TempDir::new().unwrap();
        let cli = fake_cli(&tmp, "sleep 5; echo done");
        let agent = CliAgent::new(cli, Duration::from_millis(200));
        assert!(matches!(agent.run("x").await, Err(AgentError::Timeout(_))));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let agent = CliAgent::new(
            PathBuf::from("/nonexistent/definitely-not-a-cli"),
            Duration::from_secs(1),
        );
        assert!(matches!(agent.run("x").await, Err(AgentError::Spawn { .. })));
    }
}
