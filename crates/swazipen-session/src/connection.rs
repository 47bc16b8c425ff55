//! Lifecycle controller for the sessions of one client connection.
//!
//! A [`Connection`] owns a private [`SessionRegistry`] and an outbound event
//! channel. Each session gets an output pump task that forwards PTY output in
//! order and, on natural exit, claims the session by generation so a stale
//! pump can never tear down a newer session that reused the id.
//!
//! Teardown ownership is decided by whoever removes the session from the
//! registry: the pump (exit), [`Connection::kill`], a replacing
//! [`Connection::create`], or [`Connection::close`].

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use swazipen_core::{ProjectContext, SessionId, SessionMode};
use swazipen_executor::{RuntimeCommand, ScratchFile, prepare_run_target};
use swazipen_pty::{ExitStatus, PtyEvent, TerminalSize};
use tokio::sync::mpsc;

use crate::{
    error::SessionError,
    events::SessionEvent,
    registry::{RegistryClosed, RegistryEntry, SessionRegistry},
    session::{Session, Teardown},
};

/// Parameters of a create request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateRequest {
    pub mode: SessionMode,
    pub size: TerminalSize,
    /// Source text to snapshot for a RUN.
    pub source: Option<String>,
    /// Project-relative name of the file a RUN executes.
    pub filename: Option<String>,
}

impl CreateRequest {
    #[must_use]
    pub fn run(source: impl Into<String>, filename: Option<String>) -> Self {
        Self {
            mode: SessionMode::Run,
            source: Some(source.into()),
            filename,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn repl() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn size(mut self, size: TerminalSize) -> Self {
        self.size = size;
        self
    }

    /// Zero dimensions fall back to the defaults.
    fn effective_size(&self) -> TerminalSize {
        let fallback = TerminalSize::default();
        TerminalSize::new(
            if self.size.cols == 0 { fallback.cols } else { self.size.cols },
            if self.size.rows == 0 { fallback.rows } else { self.size.rows },
        )
    }
}

/// All sessions belonging to one client.
pub struct Connection {
    ctx: Arc<ProjectContext>,
    command: RuntimeCommand,
    registry: Arc<SessionRegistry<Session>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Connection {
    /// Create a connection whose events are delivered to `events`.
    #[must_use]
    pub fn new(ctx: Arc<ProjectContext>, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        let command = RuntimeCommand::from_config(&ctx.runtime);
        Self {
            ctx,
            command,
            registry: Arc::new(SessionRegistry::new()),
            events,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistry<Session> {
        &self.registry
    }

    /// Live session under `id`, if any.
    #[must_use]
    pub fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.registry.get(id)
    }

    fn grace(&self) -> Duration {
        self.ctx.runtime.kill_grace
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Event receiver dropped");
        }
    }

    /// Start a session under `id`, or a generated id if none is given.
    ///
    /// A live session under the same id is torn down completely, without a
    /// notification, before the new one starts. Failures are reported as an
    /// error event for the id; the returned id is always the one addressed.
    pub async fn create(&self, id: Option<SessionId>, request: CreateRequest) -> SessionId {
        let id = id.unwrap_or_else(SessionId::generate);

        if let Some(previous) = self.registry.remove(&id) {
            tracing::info!(%id, "Replacing live session");
            previous.shutdown(self.grace(), Teardown::Replaced).await;
        }

        match self.start(&id, request).await {
            Ok(()) => {}
            Err(SessionError::ConnectionClosed) => {
                tracing::debug!(%id, "Create raced with connection close");
            }
            Err(error) => {
                tracing::warn!(%id, %error, "Failed to create session");
                self.emit(SessionEvent::error(id.clone(), error.to_string()));
            }
        }
        id
    }

    async fn start(&self, id: &SessionId, request: CreateRequest) -> Result<(), SessionError> {
        let size = request.effective_size();
        let mode = request.mode;

        let (parts, scratch) = match mode {
            SessionMode::Run => {
                let source = request.source.as_deref().unwrap_or_default();
                let target =
                    prepare_run_target(&self.ctx, request.filename.as_deref(), source).await?;
                (self.command.build_run(target.path()), target.into_scratch())
            }
            SessionMode::Repl => (self.command.build_repl(), None),
        };

        let spawned = match parts {
            Ok(parts) => {
                let request = parts
                    .into_spawn_request(self.ctx.root())
                    .size(size)
                    .term(self.ctx.runtime.term.clone());
                swazipen_pty::spawn(request).await.map_err(SessionError::from)
            }
            Err(error) => Err(error.into()),
        };
        let (process, pty_events) = match spawned {
            Ok(spawned) => spawned,
            Err(error) => {
                discard_scratch(id, scratch).await;
                return Err(error);
            }
        };

        let pid = process.pid();
        let session = Arc::new(Session::new(id.clone(), mode, process, scratch));
        match self.registry.put(id.clone(), Arc::clone(&session)) {
            Ok(None) => {}
            Ok(Some(previous)) => previous.shutdown(self.grace(), Teardown::Replaced).await,
            Err(RegistryClosed(session)) => {
                session.shutdown(self.grace(), Teardown::Disconnected).await;
                return Err(SessionError::ConnectionClosed);
            }
        }
        session.mark_running();

        tracing::info!(%id, %mode, ?pid, cols = size.cols, rows = size.rows, "Session created");
        self.emit(SessionEvent::created(id.clone()));

        let pump = OutputPump {
            id: id.clone(),
            generation: session.generation(),
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            grace: self.grace(),
        };
        session.attach_pump(tokio::spawn(pump.run(pty_events)));
        Ok(())
    }

    /// Forward input bytes. Unknown ids are ignored.
    pub fn input(&self, id: &SessionId, data: &[u8]) {
        let Some(session) = self.registry.get(id) else {
            tracing::trace!(%id, "Dropping input for unknown session");
            return;
        };
        if let Err(error) = session.process().write(data) {
            tracing::warn!(%id, %error, "Failed to deliver input");
            self.emit(SessionEvent::error(id.clone(), error.to_string()));
        }
    }

    /// Propagate a viewport change. Unknown ids are ignored.
    pub fn resize(&self, id: &SessionId, size: TerminalSize) {
        let Some(session) = self.registry.get(id) else {
            tracing::trace!(%id, "Dropping resize for unknown session");
            return;
        };
        if let Err(error) = session.process().resize(size) {
            tracing::warn!(%id, %error, "Failed to resize session");
            self.emit(SessionEvent::error(id.clone(), error.to_string()));
        }
    }

    /// Terminate the session under `id`. A no-op if none is live.
    pub async fn kill(&self, id: &SessionId) {
        let Some(session) = self.registry.remove(id) else {
            tracing::trace!(%id, "Kill for unknown session");
            return;
        };
        session.shutdown(self.grace(), Teardown::Killed).await;
        tracing::info!(%id, "Session killed");
        self.emit(SessionEvent::killed(id.clone()));
    }

    /// Tear down every session. Nothing is emitted; the client is gone.
    pub async fn close(&self) {
        let sessions = self.registry.drain_all();
        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "Closing connection sessions");
        let grace = self.grace();
        join_all(
            sessions
                .iter()
                .map(|session| session.shutdown(grace, Teardown::Disconnected)),
        )
        .await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.registry.is_closed() {
            return;
        }
        for session in self.registry.drain_all() {
            tracing::warn!(id = %session.id(), "Connection dropped without close");
            session.shutdown_now();
        }
    }
}

async fn discard_scratch(id: &SessionId, scratch: Option<ScratchFile>) {
    let Some(scratch) = scratch else {
        return;
    };
    let path = scratch.path().to_path_buf();
    if let Err(error) = scratch.remove().await {
        tracing::warn!(%id, path = %path.display(), %error, "Failed to remove scratch file");
    }
}

/// Forwards one session's PTY events to the connection.
struct OutputPump {
    id: SessionId,
    generation: u64,
    registry: Arc<SessionRegistry<Session>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    grace: Duration,
}

impl OutputPump {
    async fn run(self, mut pty_events: mpsc::UnboundedReceiver<PtyEvent>) {
        let status = loop {
            match pty_events.recv().await {
                Some(PtyEvent::Output(chunk)) => {
                    let _ = self.events.send(SessionEvent::data(self.id.clone(), chunk));
                }
                Some(PtyEvent::Exit(status)) => break status,
                None => break ExitStatus::default(),
            }
        };

        let Some(session) = self.registry.remove_if(&self.id, self.generation) else {
            tracing::debug!(id = %self.id, "Exit of a session that was already claimed");
            return;
        };
        tracing::info!(id = %self.id, code = ?status.code, signal = ?status.signal, "Session exited");
        let _ = self.events.send(SessionEvent::exit(self.id.clone(), status));
        session.shutdown(self.grace, Teardown::Exited).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use swazipen_core::{RunPolicy, RuntimeConfig, SessionState};
    use tempfile::TempDir;

    use super::*;
    use crate::events::SessionEventKind;

    const STEP: Duration = Duration::from_secs(10);

    struct Harness {
        dir: TempDir,
        conn: Connection,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    fn harness_with(runtime: &str, policy: RunPolicy) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ProjectContext::new(dir.path())
            .unwrap()
            .with_runtime(
                RuntimeConfig::default()
                    .with_command(runtime)
                    .with_kill_grace(Duration::from_millis(200)),
            )
            .with_run_policy(policy);
        let (tx, events) = mpsc::unbounded_channel();
        Harness {
            dir,
            conn: Connection::new(Arc::new(ctx), tx),
            events,
        }
    }

    fn harness() -> Harness {
        harness_with("sh", RunPolicy::AlwaysScratch)
    }

    impl Harness {
        async fn next(&mut self) -> SessionEvent {
            tokio::time::timeout(STEP, self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed")
        }

        /// Collect events until one satisfies `done`, inclusive.
        async fn until(&mut self, done: impl Fn(&SessionEvent) -> bool) -> Vec<SessionEvent> {
            let mut seen = Vec::new();
            loop {
                let event = self.next().await;
                let stop = done(&event);
                seen.push(event);
                if stop {
                    return seen;
                }
            }
        }

        fn scratch_entries(&self) -> usize {
            std::fs::read_dir(self.dir.path().join(".temp")).map_or(0, Iterator::count)
        }
    }

    fn output_of(events: &[SessionEvent], id: &SessionId) -> String {
        let bytes: Vec<u8> = events
            .iter()
            .filter(|e| &e.id == id)
            .filter_map(|e| match &e.kind {
                SessionEventKind::Data(chunk) => Some(chunk.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn is_exit(event: &SessionEvent) -> bool {
        matches!(event.kind, SessionEventKind::Exit(_))
    }

    async fn wait_until(check: impl Fn() -> bool) {
        tokio::time::timeout(STEP, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition never became true");
    }

    #[tokio::test]
    async fn test_run_session_outputs_then_exits_and_cleans_up() {
        let mut h = harness();
        let id = h
            .conn
            .create(
                Some("r1".into()),
                CreateRequest::run("sleep 0.3; echo 1", Some("run.sl".into())),
            )
            .await;
        assert_eq!(id.as_str(), "r1");

        let scratch = h.conn.session(&id).unwrap().scratch_path().unwrap();
        assert!(scratch.exists());
        assert!(scratch.starts_with(h.dir.path().join(".temp")));
        assert!(scratch.to_string_lossy().ends_with("-run.sl"));

        let events = h.until(is_exit).await;
        assert_eq!(events[0], SessionEvent::created(id.clone()));
        assert!(output_of(&events, &id).contains('1'));
        let Some(SessionEventKind::Exit(status)) = events.last().map(|e| &e.kind) else {
            panic!("expected exit");
        };
        assert_eq!(status.code, Some(0));

        wait_until(|| !scratch.exists()).await;
        assert!(!h.conn.registry().contains(&id));
    }

    #[tokio::test]
    async fn test_output_precedes_exit_in_order() {
        let mut h = harness();
        let id = h
            .conn
            .create(
                Some("o1".into()),
                CreateRequest::run("printf A; sleep 0.1; printf B; sleep 0.1; printf C", None),
            )
            .await;
        let events = h.until(is_exit).await;
        assert!(output_of(&events, &id).contains("ABC"));
        assert!(is_exit(events.last().unwrap()));
    }

    #[tokio::test]
    async fn test_repl_keeps_state_between_inputs() {
        let mut h = harness();
        let id = h.conn.create(Some("i1".into()), CreateRequest::repl()).await;
        assert_eq!(h.next().await, SessionEvent::created(id.clone()));

        h.conn.input(&id, b"x=5\n");
        h.conn.input(&id, b"echo \"value:$x\"\n");

        let mut output = String::new();
        while !output.contains("value:5") {
            let event = h.next().await;
            assert!(!is_exit(&event), "repl exited early");
            output.push_str(&output_of(&[event], &id));
        }

        let session = h.conn.session(&id).unwrap();
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.scratch_path(), None);

        h.conn.kill(&id).await;
        let events = h.until(|e| e.kind == SessionEventKind::Killed).await;
        assert!(!events.iter().any(is_exit));
        assert!(h.conn.registry().is_empty());
        assert!(session.process().has_exited());
    }

    #[tokio::test]
    async fn test_create_replaces_live_session_silently() {
        let mut h = harness();
        let id: SessionId = "r2".into();
        h.conn
            .create(Some(id.clone()), CreateRequest::run("sleep 30", None))
            .await;
        let old = h.conn.session(&id).unwrap();
        let old_scratch = old.scratch_path().unwrap();

        h.conn
            .create(Some(id.clone()), CreateRequest::run("echo second", None))
            .await;
        assert!(old.process().has_exited());
        assert!(!old_scratch.exists());
        assert_eq!(old.state(), SessionState::Gone);

        let events = h.until(is_exit).await;
        let created = events
            .iter()
            .filter(|e| e.kind == SessionEventKind::Created)
            .count();
        assert_eq!(created, 2);
        assert!(!events.iter().any(|e| e.kind == SessionEventKind::Killed));
        assert!(output_of(&events, &id).contains("second"));
        assert_eq!(events.iter().filter(|e| is_exit(e)).count(), 1);

        wait_until(|| h.conn.registry().is_empty()).await;
        wait_until(|| h.scratch_entries() == 0).await;
    }

    #[tokio::test]
    async fn test_unknown_ids_are_ignored() {
        let mut h = harness();
        let live = h.conn.create(Some("live".into()), CreateRequest::repl()).await;
        assert_eq!(h.next().await, SessionEvent::created(live.clone()));

        let ghost: SessionId = "ghost".into();
        h.conn.input(&ghost, b"echo hi\n");
        h.conn.resize(&ghost, TerminalSize::new(100, 40));
        h.conn.kill(&ghost).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        while let Ok(event) = h.events.try_recv() {
            assert_eq!(event.id, live);
        }
        assert_eq!(h.conn.registry().ids(), vec![live.clone()]);
        h.conn.close().await;
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let mut h = harness();
        let id = h.conn.create(Some("k".into()), CreateRequest::repl()).await;
        h.conn.kill(&id).await;
        h.conn.kill(&id).await;

        let events = h.until(|e| e.kind == SessionEventKind::Killed).await;
        assert_eq!(events[0], SessionEvent::created(id.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        while let Ok(event) = h.events.try_recv() {
            assert_ne!(event.kind, SessionEventKind::Killed);
        }
    }

    #[tokio::test]
    async fn test_failed_scratch_removal_still_releases_id() {
        let mut h = harness();
        let id = h
            .conn
            .create(Some("r".into()), CreateRequest::run("sleep 30", None))
            .await;
        assert_eq!(h.next().await, SessionEvent::created(id.clone()));
        let session = h.conn.session(&id).unwrap();
        assert_eq!(session.state(), SessionState::Running);

        // A non-empty directory where the scratch file was cannot be unlinked.
        let path = session.scratch_path().unwrap();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), "x").unwrap();

        h.conn.kill(&id).await;
        let events = h.until(|e| e.kind == SessionEventKind::Killed).await;
        assert_eq!(events.last(), Some(&SessionEvent::killed(id.clone())));
        assert!(h.conn.session(&id).is_none());
        assert!(h.conn.registry().is_empty());
        assert_eq!(session.state(), SessionState::Gone);
        assert!(session.process().has_exited());
        assert!(path.is_dir());
    }

    #[tokio::test]
    async fn test_resize_live_session() {
        let mut h = harness();
        let id = h.conn.create(None, CreateRequest::repl()).await;
        assert!(id.as_str().starts_with("term-"));
        assert_eq!(h.next().await, SessionEvent::created(id.clone()));

        h.conn.resize(&id, TerminalSize::new(120, 40));
        h.conn.input(&id, b"stty size\n");
        let mut output = String::new();
        while !output.contains("40 120") {
            output.push_str(&output_of(&[h.next().await], &id));
        }
        h.conn.close().await;
    }

    #[tokio::test]
    async fn test_close_sweeps_sessions_silently() {
        let mut h = harness();
        let repl = h.conn.create(Some("a".into()), CreateRequest::repl()).await;
        let run = h
            .conn
            .create(Some("b".into()), CreateRequest::run("sleep 30", None))
            .await;
        let repl_session = h.conn.session(&repl).unwrap();
        let run_session = h.conn.session(&run).unwrap();
        let scratch = run_session.scratch_path().unwrap();

        h.conn.close().await;
        assert!(h.conn.registry().is_empty());
        assert!(h.conn.registry().is_closed());
        assert!(repl_session.process().has_exited());
        assert!(run_session.process().has_exited());
        assert!(!scratch.exists());

        tokio::time::sleep(Duration::from_millis(200)).await;
        while let Ok(event) = h.events.try_recv() {
            assert!(matches!(
                event.kind,
                SessionEventKind::Created | SessionEventKind::Data(_)
            ));
        }

        // Creates after close are torn down and never registered.
        h.conn.create(Some("late".into()), CreateRequest::repl()).await;
        assert!(h.conn.registry().is_empty());
        assert_eq!(h.scratch_entries(), 0);
    }

    #[tokio::test]
    async fn test_drop_without_close_sweeps_scratch() {
        let h = harness();
        let id = h
            .conn
            .create(Some("d".into()), CreateRequest::run("sleep 30", None))
            .await;
        let session = h.conn.session(&id).unwrap();
        let scratch = session.scratch_path().unwrap();

        drop(h.conn);
        assert!(!scratch.exists());
        tokio::time::timeout(STEP, session.process().wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_error_and_removes_scratch() {
        let mut h = harness_with("swazi-not-installed", RunPolicy::AlwaysScratch);
        let id = h
            .conn
            .create(Some("bad".into()), CreateRequest::run("print(1)", None))
            .await;

        let event = h.next().await;
        assert_eq!(event.id, id);
        assert!(matches!(event.kind, SessionEventKind::Error(_)));
        assert!(h.conn.registry().is_empty());
        assert_eq!(h.scratch_entries(), 0);
    }

    #[tokio::test]
    async fn test_invalid_filename_reports_error() {
        let mut h = harness();
        let id = h
            .conn
            .create(
                Some("e".into()),
                CreateRequest::run("echo 1", Some("../escape.sl".into())),
            )
            .await;
        let event = h.next().await;
        assert_eq!(event.id, id);
        assert!(matches!(event.kind, SessionEventKind::Error(_)));
        assert!(!h.dir.path().parent().unwrap().join("escape.sl").exists());
    }

    #[tokio::test]
    async fn test_resident_file_runs_in_place() {
        let mut h = harness_with("sh", RunPolicy::PreferResident);
        std::fs::write(h.dir.path().join("main.sl"), "echo resident").unwrap();

        let id = h
            .conn
            .create(
                Some("m".into()),
                CreateRequest::run("echo ignored", Some("main.sl".into())),
            )
            .await;
        assert_eq!(h.conn.session(&id).and_then(|s| s.scratch_path()), None);

        let events = h.until(is_exit).await;
        let output = output_of(&events, &id);
        assert!(output.contains("resident"));
        assert!(!output.contains("ignored"));
        assert!(Path::new(&h.dir.path().join("main.sl")).exists());
        assert_eq!(h.scratch_entries(), 0);
    }

    #[test]
    fn test_zero_size_falls_back_to_default() {
        let request = CreateRequest::repl().size(TerminalSize::new(0, 50));
        assert_eq!(request.effective_size(), TerminalSize::new(80, 50));
    }
}
