use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::process::Command;

/// Runs external programs. Swapped for a recording fake in tests.
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        command.kill_on_drop(true);
        command.output().await
    }
}

/// Renders a command for error messages and logs.
pub fn command_line(command: &Command) -> String {
    let std = command.as_std();
    let mut parts = vec![std.get_program().to_string_lossy().to_string()];
    parts.extend(std.get_args().map(|arg| arg.to_string_lossy().to_string()));
    parts.join(" ")
}

/// Finds an executable either at the configured location or by name in
/// `PATH` followed by `extra_dirs`.
pub fn locate_executable(configured: &str, extra_dirs: &[PathBuf]) -> Option<PathBuf> {
    let candidate = Path::new(configured);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path_dirs = std::env::var_os("PATH")
        .map(|value| std::env::split_paths(&value).collect::<Vec<_>>())
        .unwrap_or_default();
    path_dirs
        .iter()
        .chain(extra_dirs.iter())
        .map(|dir| dir.join(configured))
        .find(|path| path.is_file())
}
