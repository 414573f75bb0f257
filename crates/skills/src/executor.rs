use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use switchboard_core::{Error, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs a process skill: JSON arguments on stdin, JSON (or plain text) on
/// stdout. The child is killed when the timeout fires or `cancel` trips.
pub struct ProcessRunner {
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(command: &str, args: &[String], working_dir: &Path, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            args: args.to_vec(),
            working_dir: working_dir.to_path_buf(),
            timeout,
        }
    }

    /// `./run.sh` style commands resolve against the skill folder, bare names
    /// go through `PATH`.
    fn program(&self) -> PathBuf {
        let p = Path::new(&self.command);
        if p.is_relative() && self.command.contains('/') {
            self.working_dir.join(p)
        } else {
            p.to_path_buf()
        }
    }

    pub async fn run(&self, input: &Value, cancel: &CancellationToken) -> Result<Value> {
        let input_str = serde_json::to_string(input)?;

        let mut cmd = Command::new(self.program());
        cmd.args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Resource(format!("Failed to spawn process '{}': {}", self.command, e))
        })?;

        // Feeding stdin and collecting output run together, both inside the
        // timeout, so a skill that ignores a large input cannot wedge the turn.
        let stdin = child.stdin.take();
        let command = &self.command;
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A skill that never reads stdin closes the pipe early; that
                // is not an error.
                if let Err(e) = stdin.write_all(input_str.as_bytes()).await {
                    debug!(command = %command, error = %e, "Skill closed stdin early");
                }
            }
        };
        let exchange = async move {
            let (_, output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = tokio::select! {
            res = tokio::time::timeout(self.timeout, exchange) => match res {
                Ok(out) => out.map_err(|e| Error::Resource(format!("Process execution failed: {}", e)))?,
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "'{}' exceeded {}s",
                        self.command,
                        self.timeout.as_secs()
                    )));
                }
            },
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled(format!("'{}' cancelled", self.command)));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Resource(format!(
                "Process exited with code {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let result: Value = serde_json::from_str(stdout.trim())
            .unwrap_or_else(|_| serde_json::json!({ "output": stdout.to_string() }));

        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn runner(script: &str, timeout: Duration) -> ProcessRunner {
        ProcessRunner::new(
            "sh",
            &["-c".to_string(), script.to_string()],
            &std::env::temp_dir(),
            timeout,
        )
    }

    #[tokio::test]
    async fn test_json_stdout_is_parsed() {
        let r = runner("cat", Duration::from_secs(5));
        let out = r.run(&json!({"a": 1}), &CancellationToken::new()).await.unwrap();
        assert_eq!(out, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_plain_stdout_is_wrapped() {
        let r = runner("echo hello", Duration::from_secs(5));
        let out = r.run(&json!({}), &CancellationToken::new()).await.unwrap();
        assert_eq!(out["output"], "hello\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_stderr() {
        let r = runner("echo boom >&2; exit 3", Duration::from_secs(5));
        let err = r.run(&json!({}), &CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let r = runner("sleep 5", Duration::from_millis(200));
        let err = r.run(&json!({}), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_unread_large_input_still_times_out() {
        // Far more than a pipe buffer, to a process that never reads stdin.
        let big = json!({ "blob": "x".repeat(1 << 20) });
        let r = runner("sleep 5", Duration::from_millis(300));
        let started = std::time::Instant::now();
        let err = r.run(&big, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let r = runner("sleep 5", Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            c.cancel();
        });
        let err = r.run(&json!({}), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }
}
