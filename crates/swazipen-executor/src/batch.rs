//! Timeout-bounded batch execution.
//!
//! A batch run is spawned through the PTY launcher like an interactive
//! session, but it is never registered or multiplexed: the caller gets a
//! single [`BatchOutcome`] once the process exits or the deadline passes,
//! whichever comes first.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use swazipen_core::context::{DEFAULT_BATCH_TIMEOUT, DEFAULT_KILL_GRACE};
use swazipen_pty::{PtyError, PtyEvent, SpawnRequest, TerminalSize};
use thiserror::Error;

use crate::command::{CommandBuildError, CommandParts};

/// Appended to the output of a run that hit its deadline.
pub const TIMEOUT_NOTE: &str = "\n\n[process killed by timeout]\n";
/// Signal reported for a run that hit its deadline.
const TIMEOUT_SIGNAL: &str = "SIGTERM";

/// Batch error.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Command build error: {0}")]
    Command(#[from] CommandBuildError),
    #[error("Spawn failed: {0}")]
    Spawn(#[from] PtyError),
}

/// A single bounded execution.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub command: CommandParts,
    pub cwd: PathBuf,
    pub size: TerminalSize,
    pub term: Option<String>,
    pub timeout: Duration,
    pub kill_grace: Duration,
}

impl BatchRequest {
    #[must_use]
    pub fn new(command: CommandParts, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command,
            cwd: cwd.into(),
            size: TerminalSize::default(),
            term: None,
            timeout: DEFAULT_BATCH_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    #[must_use]
    pub fn term(mut self, term: impl Into<String>) -> Self {
        self.term = Some(term.into());
        self
    }
}

/// Result of a batch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    /// Combined terminal output, escape sequences included.
    pub output: String,
    /// `None` when the run died of a signal or was killed by the timeout.
    pub exit_code: Option<u32>,
    pub signal: Option<String>,
    #[serde(skip)]
    pub timed_out: bool,
}

enum Finish {
    Exited(swazipen_pty::ExitStatus),
    TimedOut,
}

/// Run a process to completion or until `request.timeout` elapses.
///
/// Resolves exactly once: the exit event and the deadline race inside one
/// `select!`, and the losing branch is dropped.
///
/// # Errors
/// Returns error if the process cannot be spawned.
pub async fn run_bounded(request: BatchRequest) -> Result<BatchOutcome, BatchError> {
    let BatchRequest {
        command,
        cwd,
        size,
        term,
        timeout,
        kill_grace,
    } = request;

    let program = command.program.clone();
    let mut spawn_request = command.into_spawn_request(cwd).size(size);
    if let Some(term) = term {
        spawn_request = spawn_request.term(term);
    }
    let (process, mut events) = swazipen_pty::spawn(spawn_request).await?;
    tracing::debug!(%program, pid = ?process.pid(), ?timeout, "Batch run started");

    let mut output = Vec::new();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let finish = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(PtyEvent::Output(chunk)) => output.extend_from_slice(&chunk),
                Some(PtyEvent::Exit(status)) => break Finish::Exited(status),
                None => break Finish::Exited(process.wait().await),
            },
            () = &mut deadline => break Finish::TimedOut,
        }
    };

    let outcome = match finish {
        Finish::Exited(status) => BatchOutcome {
            output: String::from_utf8_lossy(&output).into_owned(),
            exit_code: status.code,
            signal: status.signal,
            timed_out: false,
        },
        Finish::TimedOut => {
            process.terminate(kill_grace).await;
            // Keep whatever was already read before the kill.
            while let Ok(PtyEvent::Output(chunk)) = events.try_recv() {
                output.extend_from_slice(&chunk);
            }
            tracing::info!(%program, ?timeout, "Batch run killed by timeout");
            let mut text = String::from_utf8_lossy(&output).into_owned();
            text.push_str(TIMEOUT_NOTE);
            BatchOutcome {
                output: text,
                exit_code: None,
                signal: Some(TIMEOUT_SIGNAL.to_string()),
                timed_out: true,
            }
        }
    };
    Ok(outcome)
}
