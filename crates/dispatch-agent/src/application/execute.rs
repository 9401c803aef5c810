//! Shell command execution.
//!
//! Commands run under the platform shell (`sh -c` on Unix, `cmd /C` on
//! Windows) with captured stdout/stderr.  Every execution produces a
//! [`ResultMessage`], including failures: a command that cannot be spawned
//! or exceeds the local timeout is reported with return code -1 and the
//! failure text on stderr, so the server side always gets exactly one
//! result per command.

use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use dispatch_core::protocol::messages::ResultMessage;
use tokio::process::Command;
use tracing::debug;

/// Return code reported when no real exit status exists (spawn failure,
/// timeout, or termination by signal).
const SYNTHETIC_FAILURE_CODE: i32 = -1;

/// Runs `command_text` under the platform shell, bounded by `timeout`.
pub async fn run_shell_command(command_text: &str, timeout: Duration) -> ResultMessage {
    debug!(command = %command_text, "executing");

    let mut command = shell_command(command_text);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return failure_result(command_text, format!("failed to spawn shell: {e}"));
        }
        Err(_) => {
            // kill_on_drop reaps the child when the future is dropped here.
            return failure_result(
                command_text,
                format!("command timed out after {}s", timeout.as_secs()),
            );
        }
    };

    ResultMessage {
        command: command_text.to_string(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        return_code: output.status.code().unwrap_or(SYNTHETIC_FAILURE_CODE),
        timestamp: Utc::now(),
    }
}

fn shell_command(command_text: &str) -> Command {
    if cfg!(windows) {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(command_text);
        command
    } else {
        let mut command = Command::new("sh");
        command.arg("-c").arg(command_text);
        command
    }
}

fn failure_result(command_text: &str, stderr: String) -> ResultMessage {
    ResultMessage {
        command: command_text.to_string(),
        stdout: String::new(),
        stderr,
        return_code: SYNTHETIC_FAILURE_CODE,
        timestamp: Utc::now(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_echo_captures_stdout_and_zero_exit() {
        let result = run_shell_command("echo hello", TIMEOUT).await;
        assert_eq!(result.command, "echo hello");
        assert_eq!(result.stdout.trim(), "hello");
        assert!(result.stderr.is_empty());
        assert_eq!(result.return_code, 0);
    }

    #[tokio::test]
    async fn test_stderr_and_exit_code_are_captured() {
        let result = run_shell_command("echo oops >&2; exit 3", TIMEOUT).await;
        assert_eq!(result.stderr.trim(), "oops");
        assert_eq!(result.return_code, 3);
    }

    #[tokio::test]
    async fn test_unknown_command_is_a_result_not_a_crash() {
        let result = run_shell_command("definitely-not-a-real-binary-4242", TIMEOUT).await;
        assert_ne!(result.return_code, 0);
        assert!(!result.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_produces_synthetic_failure() {
        let result = run_shell_command("sleep 5", Duration::from_millis(100)).await;
        assert_eq!(result.return_code, SYNTHETIC_FAILURE_CODE);
        assert!(result.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn test_shell_pipeline_runs() {
        let result = run_shell_command("printf 'a\\nb\\nc\\n' | wc -l", TIMEOUT).await;
        assert_eq!(result.return_code, 0);
        assert_eq!(result.stdout.trim(), "3");
    }
}
