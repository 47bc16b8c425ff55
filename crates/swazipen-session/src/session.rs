//! A single live session: one PTY process plus the scratch file it runs.

use std::{
    fmt,
    path::PathBuf,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use swazipen_core::{SessionId, SessionMode, SessionState};
use swazipen_executor::ScratchFile;
use swazipen_pty::PtyProcess;
use tokio::task::JoinHandle;

use crate::registry::RegistryEntry;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// The process ended on its own; called from its output pump.
    Exited,
    /// Explicit kill request.
    Killed,
    /// A new session was created under the same id.
    Replaced,
    /// The owning connection closed.
    Disconnected,
}

impl fmt::Display for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exited => "exited",
            Self::Killed => "killed",
            Self::Replaced => "replaced",
            Self::Disconnected => "disconnected",
        })
    }
}

/// Owns exactly one process and at most one scratch file.
///
/// Whoever removes a session from the registry owns its teardown; the
/// scratch file is taken out of its slot before deletion so that it is
/// removed at most once.
pub struct Session {
    id: SessionId,
    mode: SessionMode,
    generation: u64,
    process: PtyProcess,
    scratch: Mutex<Option<ScratchFile>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        mode: SessionMode,
        process: PtyProcess,
        scratch: Option<ScratchFile>,
    ) -> Self {
        Self {
            id,
            mode,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            process,
            scratch: Mutex::new(scratch),
            pump: Mutex::new(None),
            state: Mutex::new(SessionState::Creating),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub const fn mode(&self) -> SessionMode {
        self.mode
    }

    #[must_use]
    pub const fn process(&self) -> &PtyProcess {
        &self.process
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Path of the scratch file, while it still exists.
    #[must_use]
    pub fn scratch_path(&self) -> Option<PathBuf> {
        lock(&self.scratch)
            .as_ref()
            .map(|scratch| scratch.path().to_path_buf())
    }

    pub(crate) fn attach_pump(&self, pump: JoinHandle<()>) {
        *lock(&self.pump) = Some(pump);
    }

    /// Mark the session live once it is registered. Only a `Creating`
    /// session moves; a teardown that already started wins.
    pub(crate) fn mark_running(&self) {
        let mut state = lock(&self.state);
        if *state == SessionState::Creating {
            *state = SessionState::Running;
        }
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    fn abort_pump(&self) {
        let pump = lock(&self.pump).take();
        if let Some(pump) = pump {
            pump.abort();
        }
    }

    /// Stop the process and release every resource the session holds.
    ///
    /// The output pump is aborted first unless it is the caller, so a dying
    /// session never emits anything after an explicit teardown.
    pub(crate) async fn shutdown(&self, grace: Duration, reason: Teardown) {
        self.set_state(SessionState::Exiting);
        if reason != Teardown::Exited {
            self.abort_pump();
        }

        self.process.terminate(grace).await;

        let scratch = lock(&self.scratch).take();
        if let Some(scratch) = scratch {
            let path = scratch.path().to_path_buf();
            if let Err(error) = scratch.remove().await {
                tracing::warn!(id = %self.id, path = %path.display(), %error, "Failed to remove scratch file");
            }
        }

        self.set_state(SessionState::Gone);
        tracing::debug!(id = %self.id, %reason, "Session torn down");
    }

    /// Synchronous best-effort teardown for drop paths.
    pub(crate) fn shutdown_now(&self) {
        self.set_state(SessionState::Exiting);
        self.abort_pump();
        if let Err(error) = self.process.kill() {
            tracing::warn!(id = %self.id, %error, "Failed to kill session process");
        }

        let scratch = lock(&self.scratch).take();
        if let Some(scratch) = scratch {
            let path = scratch.path().to_path_buf();
            if let Err(error) = scratch.remove_blocking() {
                tracing::warn!(id = %self.id, path = %path.display(), %error, "Failed to remove scratch file");
            }
        }
        self.set_state(SessionState::Gone);
    }
}

impl RegistryEntry for Session {
    fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .field("process", &self.process)
            .field("scratch", &self.scratch_path())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use swazipen_pty::SpawnRequest;

    use super::*;

    async fn sleeper(dir: &std::path::Path) -> PtyProcess {
        let request = SpawnRequest::new("sh", dir).args(["-c", "sleep 30"]);
        swazipen_pty::spawn(request).await.unwrap().0
    }

    #[tokio::test]
    async fn test_generations_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let a = Session::new("x".into(), SessionMode::Repl, sleeper(dir.path()).await, None);
        let b = Session::new("x".into(), SessionMode::Repl, sleeper(dir.path()).await, None);
        assert_ne!(a.generation(), b.generation());

        a.shutdown(Duration::from_millis(100), Teardown::Killed).await;
        b.shutdown(Duration::from_millis(100), Teardown::Killed).await;
    }

    #[tokio::test]
    async fn test_shutdown_kills_and_removes_scratch_once() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchFile::create(dir.path(), "run.sl".as_ref(), "sleep 30")
            .await
            .unwrap();
        let path = scratch.path().to_path_buf();
        let session = Session::new(
            "r1".into(),
            SessionMode::Run,
            sleeper(dir.path()).await,
            Some(scratch),
        );
        assert_eq!(session.state(), SessionState::Creating);
        assert!(session.state().is_live());
        session.mark_running();
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.scratch_path(), Some(path.clone()));

        session.shutdown(Duration::from_millis(200), Teardown::Killed).await;
        assert!(session.process().has_exited());
        assert!(!path.exists());
        assert_eq!(session.scratch_path(), None);
        assert_eq!(session.state(), SessionState::Gone);

        // A second teardown finds nothing left to release.
        session.shutdown(Duration::from_millis(200), Teardown::Disconnected).await;
        assert_eq!(session.state(), SessionState::Gone);
        session.mark_running();
        assert_eq!(session.state(), SessionState::Gone);
    }

    #[tokio::test]
    async fn test_shutdown_now_removes_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchFile::create(dir.path(), "a.sl".as_ref(), "").await.unwrap();
        let path = scratch.path().to_path_buf();
        let session = Session::new(
            "r1".into(),
            SessionMode::Run,
            sleeper(dir.path()).await,
            Some(scratch),
        );

        session.shutdown_now();
        assert!(!path.exists());
        assert_eq!(session.state(), SessionState::Gone);
        tokio_test::assert_ok!(
            tokio::time::timeout(Duration::from_secs(5), session.process().wait()).await
        );
    }
}
