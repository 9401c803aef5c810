//! Append-only event log on disk.
//!
//! The server keeps one main log for server-level events plus one file per
//! session, all under the configured log directory.  Per-session files are
//! named after the session id (`SESSION-0001.log`), so an operator can
//! replay exactly what one agent saw without grepping a shared file.
//!
//! Event records are operator-facing audit output and are written here
//! directly; diagnostic logging stays on `tracing` and is configured in
//! `main`.  A sink that fails to write reports through `tracing` and the
//! session carries on, because losing an audit line must never take down a
//! live connection.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::error;

use crate::application::sessions::SessionId;

const MAIN_LOG: &str = "MAIN.log";

/// Handle to the log directory; creates per-session sinks on demand.
pub struct EventLog {
    directory: PathBuf,
    main: EventSink,
}

impl EventLog {
    /// Opens (creating if needed) the log directory and the main log file.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the directory or main log file
    /// cannot be created.
    pub fn open(directory: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(directory)?;
        let main = EventSink::open(directory.join(MAIN_LOG), "MAIN".to_string())?;
        Ok(Self {
            directory: directory.to_path_buf(),
            main,
        })
    }

    /// Sink for server-level events.
    pub fn main(&self) -> &EventSink {
        &self.main
    }

    /// Opens the dedicated sink for one session.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the session log file cannot be
    /// created.
    pub fn session(&self, id: SessionId) -> std::io::Result<EventSink> {
        let path = self.directory.join(format!("{id}.log"));
        EventSink::open(path, id.to_string())
    }
}

/// One append-only log file.  Cheap to clone; writers on different clones
/// serialise through a shared lock so records never interleave.
#[derive(Clone)]
pub struct EventSink {
    label: String,
    file: Arc<Mutex<File>>,
}

impl EventSink {
    fn open(path: PathBuf, label: String) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            label,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Appends one timestamped record.  Write failures are reported via
    /// `tracing` and otherwise swallowed.
    pub fn record(&self, event: &str) {
        let line = format!(
            "{} | INFO    | [{}] {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            self.label,
            event
        );
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|()| file.flush()) {
            error!(sink = %self.label, error = %e, "failed to append event record");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
