//! PTY-backed child processes.
//!
//! Every spawned process is served by three helper threads:
//! - a reader that turns PTY output into [`PtyEvent::Output`] chunks,
//! - a writer fed by a channel, so input is applied in arrival order,
//! - a waiter that publishes the exit status and emits [`PtyEvent::Exit`]
//!   once the reader has drained.

use std::{
    fmt,
    io::{ErrorKind, Read, Write},
    path::PathBuf,
    sync::{Mutex, PoisonError, mpsc as std_mpsc},
    thread,
    time::Duration,
};

use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::runtime::resolve_executable;

const READ_CHUNK_SIZE: usize = 8 * 1024;
/// Upper bound on how long the exit event waits for trailing output.
const DRAIN_GRACE: Duration = Duration::from_millis(250);
const DEFAULT_TERM: &str = "xterm-256color";
const DEFAULT_LANG: &str = "C.UTF-8";

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    #[must_use]
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Both dimensions are non-zero.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

impl From<TerminalSize> for PtySize {
    fn from(size: TerminalSize) -> Self {
        Self {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// How a child process ended.
///
/// A signal death carries the `SIG*` name and no code. Both are `None` only
/// when the status could not be collected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<u32>,
    pub signal: Option<String>,
}

impl ExitStatus {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

impl From<portable_pty::ExitStatus> for ExitStatus {
    fn from(status: portable_pty::ExitStatus) -> Self {
        match status.signal() {
            Some(description) => Self {
                code: None,
                signal: Some(signal_name(description)),
            },
            None => Self {
                code: Some(status.exit_code()),
                signal: None,
            },
        }
    }
}

/// `strsignal(3)` wording, glibc and BSD, for the signals a session can die of.
const SIGNAL_DESCRIPTIONS: &[(&str, &str)] = &[
    ("Hangup", "SIGHUP"),
    ("Interrupt", "SIGINT"),
    ("Quit", "SIGQUIT"),
    ("Illegal instruction", "SIGILL"),
    ("Trace/breakpoint trap", "SIGTRAP"),
    ("Aborted", "SIGABRT"),
    ("Abort trap", "SIGABRT"),
    ("Bus error", "SIGBUS"),
    ("Floating point exception", "SIGFPE"),
    ("Floating-point exception", "SIGFPE"),
    ("Killed", "SIGKILL"),
    ("User defined signal 1", "SIGUSR1"),
    ("User signal 1", "SIGUSR1"),
    ("Segmentation fault", "SIGSEGV"),
    ("User defined signal 2", "SIGUSR2"),
    ("User signal 2", "SIGUSR2"),
    ("Broken pipe", "SIGPIPE"),
    ("Alarm clock", "SIGALRM"),
    ("Terminated", "SIGTERM"),
    ("CPU time limit exceeded", "SIGXCPU"),
    ("Cputime limit exceeded", "SIGXCPU"),
    ("File size limit exceeded", "SIGXFSZ"),
    ("Filesize limit exceeded", "SIGXFSZ"),
];

/// Map a signal description back to its `SIG*` name.
///
/// Names pass through; unknown descriptions are kept verbatim.
fn signal_name(description: &str) -> String {
    if description.starts_with("SIG") {
        return description.to_owned();
    }
    SIGNAL_DESCRIPTIONS
        .iter()
        .find(|(text, _)| description.eq_ignore_ascii_case(text))
        .map_or_else(|| description.to_owned(), |(_, name)| (*name).to_owned())
}

/// Event emitted by a running process, in order.
///
/// `Exit` is always the last event on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Raw output bytes, terminal escape sequences included.
    Output(Vec<u8>),
    /// The process terminated.
    Exit(ExitStatus),
}

/// Parameters for [`spawn`].
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Program name or path; bare names are looked up on `PATH`.
    pub program: String,
    pub args: Vec<String>,
    /// Working directory of the child.
    pub cwd: PathBuf,
    pub size: TerminalSize,
    /// `TERM` to set when the server environment has none.
    pub term: Option<String>,
    /// Extra environment, applied last.
    pub env: Vec<(String, String)>,
}

impl SpawnRequest {
    #[must_use]
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            size: TerminalSize::default(),
            term: None,
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub const fn size(mut self, size: TerminalSize) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub fn term(mut self, term: impl Into<String>) -> Self {
        self.term = Some(term.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// PTY error.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Failed to open PTY: {0}")]
    Open(String),
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },
    #[error("Invalid terminal size {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },
    #[error("Failed to resize PTY: {0}")]
    Resize(String),
    #[error("Process has exited")]
    Exited,
    #[error("Process input is closed")]
    InputClosed,
    #[error("Failed to signal process: {0}")]
    Signal(#[from] std::io::Error),
    #[error("Spawn task failed: {0}")]
    Join(String),
}

/// Handle to a running child attached to a PTY.
pub struct PtyProcess {
    program: String,
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    stdin_tx: mpsc::UnboundedSender<Vec<u8>>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
}

impl fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyProcess")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("exit", &self.exit_status())
            .finish_non_exhaustive()
    }
}

/// Spawn a program attached to a fresh PTY.
///
/// Returns the process handle and its ordered event stream.
///
/// # Errors
/// Fails if the size is invalid, the executable cannot be found, or the PTY
/// or child cannot be created.
pub async fn spawn(
    request: SpawnRequest,
) -> Result<(PtyProcess, mpsc::UnboundedReceiver<PtyEvent>), PtyError> {
    if !request.size.is_valid() {
        return Err(PtyError::InvalidSize {
            cols: request.size.cols,
            rows: request.size.rows,
        });
    }

    tokio::task::spawn_blocking(move || spawn_pty_process(request))
        .await
        .map_err(|e| PtyError::Join(e.to_string()))?
}

impl PtyProcess {
    /// Program as requested by the caller.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    #[must_use]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_rx.borrow().clone()
    }

    /// Queue input for the child.
    ///
    /// # Errors
    /// Returns error if the process has exited or its input is closed.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if self.has_exited() {
            return Err(PtyError::Exited);
        }
        self.stdin_tx
            .send(data.to_vec())
            .map_err(|_| PtyError::InputClosed)
    }

    /// Propagate a viewport change to the PTY.
    ///
    /// # Errors
    /// Returns error if the size is invalid or the ioctl fails.
    pub fn resize(&self, size: TerminalSize) -> Result<(), PtyError> {
        if !size.is_valid() {
            return Err(PtyError::InvalidSize {
                cols: size.cols,
                rows: size.rows,
            });
        }
        self.master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(size.into())
            .map_err(|e| PtyError::Resize(e.to_string()))
    }

    /// Ask the child to terminate. No-op once it has exited.
    ///
    /// # Errors
    /// Returns error if the signal cannot be delivered.
    pub fn kill(&self) -> Result<(), PtyError> {
        if self.has_exited() {
            return Ok(());
        }
        self.killer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .kill()?;
        Ok(())
    }

    /// Kill the child, escalating to a forced kill after `grace`.
    ///
    /// Returns once the exit has been observed, or after a second `grace`
    /// following the forced kill.
    pub async fn terminate(&self, grace: Duration) {
        if self.has_exited() {
            return;
        }
        if let Err(error) = self.kill() {
            tracing::debug!(pid = ?self.pid, %error, "Polite kill failed");
        }
        if self.wait_exit_for(grace).await {
            return;
        }

        self.force_kill();
        if !self.wait_exit_for(grace).await {
            tracing::warn!(pid = ?self.pid, program = %self.program, "Process survived forced kill");
        }
    }

    async fn wait_exit_for(&self, limit: Duration) -> bool {
        let mut exit_rx = self.exit_rx.clone();
        tokio::time::timeout(limit, exit_rx.wait_for(Option::is_some))
            .await
            .is_ok_and(|res| res.is_ok())
    }

    /// Wait for the child to exit.
    pub async fn wait(&self) -> ExitStatus {
        let mut exit_rx = self.exit_rx.clone();
        match exit_rx.wait_for(Option::is_some).await {
            Ok(status) => (*status).clone().unwrap_or_default(),
            Err(_) => self.exit_status().unwrap_or_default(),
        }
    }

    #[cfg(unix)]
    #[allow(unsafe_code)]
    fn force_kill(&self) {
        let Some(pid) = self.pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
            return;
        };
        // A reaped pid may already belong to someone else.
        if self.has_exited() {
            return;
        }
        tracing::debug!(pid, "Escalating to SIGKILL");
        // SAFETY: kill(2) has no memory-safety preconditions.
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    fn force_kill(&self) {
        let _ = self
            .killer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .kill();
    }
}

fn spawn_pty_process(
    request: SpawnRequest,
) -> Result<(PtyProcess, mpsc::UnboundedReceiver<PtyEvent>), PtyError> {
    let executable = resolve_executable(&request.program)
        .ok_or_else(|| PtyError::ExecutableNotFound(request.program.clone()))?;

    let pair = native_pty_system()
        .openpty(request.size.into())
        .map_err(|e| PtyError::Open(e.to_string()))?;

    let mut command = CommandBuilder::new(&executable);
    command.args(&request.args);
    command.cwd(&request.cwd);
    if command.get_env("TERM").is_none() {
        command.env("TERM", request.term.as_deref().unwrap_or(DEFAULT_TERM));
    }
    if command.get_env("LANG").is_none() {
        command.env("LANG", DEFAULT_LANG);
    }
    for (key, value) in &request.env {
        command.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(command)
        .map_err(|e| PtyError::Spawn {
            program: request.program.clone(),
            reason: e.to_string(),
        })?;
    // The reader only sees EOF once every slave handle is closed.
    drop(pair.slave);

    let reader = match pair.master.try_clone_reader() {
        Ok(reader) => reader,
        Err(e) => {
            terminate_child(child);
            return Err(PtyError::Open(e.to_string()));
        }
    };
    let writer = match pair.master.take_writer() {
        Ok(writer) => writer,
        Err(e) => {
            terminate_child(child);
            return Err(PtyError::Open(e.to_string()));
        }
    };

    let pid = child.process_id();
    let killer = child.clone_killer();
    tracing::debug!(program = %request.program, ?pid, cwd = %request.cwd.display(), "Spawned PTY process");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = watch::channel(None);
    let (drained_tx, drained_rx) = std_mpsc::channel();

    spawn_read_loop(reader, events_tx.clone(), drained_tx);
    spawn_write_loop(writer, stdin_rx);
    spawn_wait_loop(child, exit_tx, events_tx, drained_rx);

    let process = PtyProcess {
        program: request.program,
        pid,
        master: Mutex::new(pair.master),
        killer: Mutex::new(killer),
        stdin_tx,
        exit_rx,
    };
    Ok((process, events_rx))
}

fn terminate_child(mut child: Box<dyn Child + Send + Sync>) {
    let _ = child.kill();
    let _ = child.wait();
}

fn spawn_read_loop(
    mut reader: Box<dyn Read + Send>,
    events_tx: mpsc::UnboundedSender<PtyEvent>,
    drained_tx: std_mpsc::Sender<()>,
) {
    thread::spawn(move || {
        let mut buffer = [0_u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => {
                    if events_tx.send(PtyEvent::Output(buffer[..read].to_vec())).is_err() {
                        break;
                    }
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                // EIO once the child side hangs up.
                Err(_) => break,
            }
        }
        let _ = drained_tx.send(());
    });
}

fn spawn_write_loop(
    mut writer: Box<dyn Write + Send>,
    mut stdin_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    thread::spawn(move || {
        while let Some(input) = stdin_rx.blocking_recv() {
            if input.is_empty() {
                continue;
            }
            if writer.write_all(&input).and_then(|()| writer.flush()).is_err() {
                break;
            }
        }
    });
}

fn spawn_wait_loop(
    mut child: Box<dyn Child + Send + Sync>,
    exit_tx: watch::Sender<Option<ExitStatus>>,
    events_tx: mpsc::UnboundedSender<PtyEvent>,
    drained_rx: std_mpsc::Receiver<()>,
) {
    thread::spawn(move || {
        let status = match child.wait() {
            Ok(status) => ExitStatus::from(status),
            Err(error) => {
                tracing::warn!(%error, "Failed to collect PTY child status");
                ExitStatus::default()
            }
        };
        exit_tx.send_replace(Some(status.clone()));

        // A grandchild holding the slave open would block the reader forever.
        let _ = drained_rx.recv_timeout(DRAIN_GRACE);
        let _ = events_tx.send(PtyEvent::Exit(status));
    });
}
