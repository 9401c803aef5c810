//! Interactive operator console on stdin/stdout.
//!
//! The console is the only place commands enter the system.  It owns the
//! prompt loop: built-in verbs (`sessions`, `use`, `help`, `exit`) are
//! handled locally, anything else is dispatched to the selected session
//! and the console blocks until that command resolves.  Blocking is
//! deliberate: one operator, one command in flight, results printed in
//! the order they were issued.

use std::str::FromStr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::debug;

use crate::application::dispatch::{CommandRouter, DispatchError, DispatchOutcome};
use crate::application::sessions::{SessionId, SessionRegistry};

const HELP: &str = "\
Available commands:
  sessions          list active sessions
  use <session-id>  select the session subsequent commands go to
  help              show this help
  exit              shut the server down

Anything else is sent to the selected session as a shell command.";

/// Runs the operator prompt until `exit`, stdin EOF, or external shutdown.
pub async fn run_console(
    router: Arc<CommandRouter>,
    registry: Arc<SessionRegistry>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let prompt = match router.selected() {
            Some(id) => format!("({id}) > "),
            None => "> ".to_string(),
        };
        if write_all(&mut stdout, &prompt).await.is_err() {
            break;
        }

        let line = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if handle_line(line, &router, &registry, &mut stdout).await {
                    let _ = shutdown_tx.send(true);
                    break;
                }
            }
            // EOF on stdin (e.g. piped input exhausted) stops the server.
            Ok(None) => {
                debug!("stdin closed, shutting down");
                let _ = shutdown_tx.send(true);
                break;
            }
            Err(e) => {
                debug!(error = %e, "stdin read failed, shutting down");
                let _ = shutdown_tx.send(true);
                break;
            }
        }
    }
}

/// Handles one input line.  Returns true when the operator asked to exit.
async fn handle_line(
    line: &str,
    router: &CommandRouter,
    registry: &SessionRegistry,
    stdout: &mut tokio::io::Stdout,
) -> bool {
    match line {
        "exit" | "quit" => return true,
        "help" => {
            let _ = write_all(stdout, HELP).await;
            let _ = write_all(stdout, "\n").await;
        }
        "sessions" => {
            let _ = write_all(stdout, &render_sessions(registry)).await;
        }
        _ if line.starts_with("use ") => {
            let argument = line["use ".len()..].trim();
            let outcome = SessionId::from_str(argument)
                .map_err(|e| e.to_string())
                .and_then(|id| router.select(id).map_err(|e| e.to_string()));
            let reply = match outcome {
                Ok(()) => format!("Now interacting with {}\n", argument),
                Err(e) => format!("{e}\n"),
            };
            let _ = write_all(stdout, &reply).await;
        }
        command => {
            let reply = match router.dispatch(command).await {
                Ok(DispatchOutcome::Completed(result)) => render_result(&result),
                Ok(DispatchOutcome::Timeout) => {
                    "Command timed out; session remains active\n".to_string()
                }
                Err(e @ DispatchError::NoActiveSession) => {
                    format!("{e}. Run 'sessions' then 'use <session-id>'.\n")
                }
                Err(e) => format!("{e}\n"),
            };
            let _ = write_all(stdout, &reply).await;
        }
    }
    false
}

fn render_sessions(registry: &SessionRegistry) -> String {
    let sessions = registry.list_active();
    if sessions.is_empty() {
        return "No active sessions\n".to_string();
    }
    let mut out = String::new();
    out.push_str(&format!(
        "{:<14} {:<24} {:<21} {}\n",
        "SESSION", "CLIENT", "ADDRESS", "LAST ACTIVITY"
    ));
    for session in sessions {
        out.push_str(&format!(
            "{:<14} {:<24} {:<21} {}\n",
            session.id.to_string(),
            session.client_label,
            session.peer_addr.to_string(),
            session.last_activity.format("%Y-%m-%d %H:%M:%S"),
        ));
    }
    out
}

fn render_result(result: &dispatch_core::protocol::messages::ResultMessage) -> String {
    let mut out = String::new();
    out.push_str(&format!("Command:     {}\n", result.command));
    out.push_str(&format!("Return Code: {}\n", result.return_code));
    if !result.stdout.is_empty() {
        out.push_str("[STDOUT]\n");
        out.push_str(&result.stdout);
        if !result.stdout.ends_with('\n') {
            out.push('\n');
        }
    }
    if !result.stderr.is_empty() {
        out.push_str("[STDERR]\n");
        out.push_str(&result.stderr);
        if !result.stderr.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

async fn write_all(stdout: &mut tokio::io::Stdout, text: &str) -> std::io::Result<()> {
    stdout.write_all(text.as_bytes()).await?;
    stdout.flush().await
}

// ── Tests ─────────────────────────────────────────────────────────────────────
