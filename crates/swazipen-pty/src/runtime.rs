//! Runtime executable resolution.

use std::path::{Path, PathBuf};

/// Resolve an executable by name.
///
/// The search order is:
/// 1. `~/`-prefixed paths, expanded against the user's home directory.
/// 2. Explicit paths (absolute or containing a separator), canonicalized so
///    they stay valid when the child runs in another working directory.
/// 3. The current process PATH via `which`.
#[must_use]
pub fn resolve_executable(executable: &str) -> Option<PathBuf> {
    let executable = executable.trim();
    if executable.is_empty() {
        return None;
    }

    if let Some(rest) = executable.strip_prefix("~/") {
        let path = dirs::home_dir()?.join(rest);
        return path.is_file().then_some(path);
    }

    let path = Path::new(executable);
    if path.is_absolute() || path.components().count() > 1 {
        return std::fs::canonicalize(path).ok().filter(|p| p.is_file());
    }

    which::which(executable).ok()
}

/// Async version of [`resolve_executable`], run off the reactor.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || resolve_executable(&executable))
        .await
        .ok()
        .flatten()
}
