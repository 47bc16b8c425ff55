//! Project context shared by every session of a server instance.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;

/// Runtime invoked when nothing else is configured.
pub const DEFAULT_RUNTIME: &str = "swazi";
/// `TERM` handed to children when the server has none.
pub const DEFAULT_TERM: &str = "xterm-256color";
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(500);
/// Project-local directory holding scratch source snapshots.
pub const SCRATCH_DIR_NAME: &str = ".temp";

/// Which file a RUN session executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPolicy {
    /// Execute the on-disk file when one exists under the requested name,
    /// otherwise snapshot the submitted source into a scratch file.
    #[default]
    PreferResident,
    /// Always snapshot the submitted source.
    AlwaysScratch,
}

/// How the language runtime is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Runtime command line; may carry leading flags (`"swazi --no-color"`).
    pub command: String,
    pub term: String,
    /// Deadline for batch executions.
    pub batch_timeout: Duration,
    /// Time a killed process gets before it is force-killed.
    pub kill_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_RUNTIME.to_string(),
            term: DEFAULT_TERM.to_string(),
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    #[must_use]
    pub const fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    #[must_use]
    pub fn with_term(mut self, term: impl Into<String>) -> Self {
        self.term = term.into();
        self
    }
}

/// Context error.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Project root not found: {path}")]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Project root is not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// Project the sessions of one server instance operate on.
///
/// The root is read-only for this subsystem; it is the working directory of
/// every spawned runtime and the parent of the scratch directory.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    root: PathBuf,
    pub runtime: RuntimeConfig,
    pub run_policy: RunPolicy,
}

impl ProjectContext {
    /// Create a context rooted at an existing directory.
    ///
    /// # Errors
    /// Returns error if the path does not exist or is not a directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, ContextError> {
        let root = root.as_ref();
        let root = root.canonicalize().map_err(|source| ContextError::NotFound {
            path: root.to_path_buf(),
            source,
        })?;
        if !root.is_dir() {
            return Err(ContextError::NotADirectory(root));
        }
        Ok(Self {
            root,
            runtime: RuntimeConfig::default(),
            run_policy: RunPolicy::default(),
        })
    }

    #[must_use]
    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    #[must_use]
    pub const fn with_run_policy(mut self, policy: RunPolicy) -> Self {
        self.run_policy = policy;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join(SCRATCH_DIR_NAME)
    }
}
