//! Command-line and environment configuration.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use swazipen_core::{ProjectContext, RunPolicy, RuntimeConfig};

/// Browser IDE backend serving interactive runtime sessions.
#[derive(Debug, Clone, Parser)]
#[command(name = "swazipen", version, about)]
pub struct Args {
    /// Project directory; sessions run with this as their working directory.
    pub path: PathBuf,

    #[arg(long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    #[arg(long, env = "SWAZIPEN_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Runtime command line, e.g. `swazi` or `/opt/swazi/bin/swazi --color`.
    #[arg(long, env = "SWAZIPEN_RUNTIME", default_value = swazipen_core::context::DEFAULT_RUNTIME)]
    pub runtime: String,

    /// Deadline for `POST /api/execute` runs.
    #[arg(long, env = "SWAZIPEN_EXEC_TIMEOUT_MS", default_value_t = 15_000)]
    pub exec_timeout_ms: u64,

    /// Wait between a polite kill and SIGKILL.
    #[arg(long, env = "SWAZIPEN_KILL_GRACE_MS", default_value_t = 500)]
    pub kill_grace_ms: u64,

    #[arg(long, env = "SWAZIPEN_TERM", default_value = swazipen_core::context::DEFAULT_TERM)]
    pub term: String,

    /// Always snapshot RUN sources, even when the file exists on disk.
    #[arg(long, env = "SWAZIPEN_ALWAYS_SCRATCH")]
    pub always_scratch: bool,
}

impl Args {
    /// Address to bind.
    ///
    /// # Errors
    /// Returns error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        let addr = if host.contains(':') {
            format!("[{host}]:{}", self.port)
        } else {
            format!("{host}:{}", self.port)
        };
        addr.parse()
            .with_context(|| format!("Invalid bind address {addr}"))
    }

    /// Build the shared project context.
    ///
    /// # Errors
    /// Returns error if the project path is not an existing directory.
    pub fn project_context(&self) -> Result<ProjectContext> {
        let runtime = RuntimeConfig::default()
            .with_command(self.runtime.clone())
            .with_term(self.term.clone())
            .with_batch_timeout(Duration::from_millis(self.exec_timeout_ms))
            .with_kill_grace(Duration::from_millis(self.kill_grace_ms));
        let policy = if self.always_scratch {
            RunPolicy::AlwaysScratch
        } else {
            RunPolicy::PreferResident
        };
        let ctx = ProjectContext::new(&self.path)
            .with_context(|| format!("Cannot open project {}", self.path.display()))?;
        Ok(ctx.with_runtime(runtime).with_run_policy(policy))
    }
}
