use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

/// Told about every file the engine finished writing or deleting.
///
/// Called from the event loop, so implementations must return immediately
/// and do any slow work elsewhere.
pub trait MediaIndexInvalidator: Send + Sync {
    fn invalidate(&self, path: &Path, deleted: bool);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInvalidator;

impl MediaIndexInvalidator for LoggingInvalidator {
    fn invalidate(&self, path: &Path, deleted: bool) {
        tracing::debug!(path = %path.display(), deleted, "media index invalidation");
    }
}

/// Runs `<command> <path> deleted|updated` for every finished item.
#[derive(Debug, Clone)]
pub struct HookInvalidator {
    command: PathBuf,
}

impl HookInvalidator {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl MediaIndexInvalidator for HookInvalidator {
    fn invalidate(&self, path: &Path, deleted: bool) {
        let mut command = Command::new(&self.command);
        command
            .arg(path)
            .arg(if deleted { "deleted" } else { "updated" })
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let path = path.to_path_buf();
        let hook = self.command.clone();
        tokio::spawn(async move {
            match command.status().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    tracing::warn!(
                        hook = %hook.display(),
                        path = %path.display(),
                        ?status,
                        "media hook failed"
                    );
                }
                Err(err) => {
                    tracing::warn!(hook = %hook.display(), %err, "failed to run media hook");
                }
            }
        });
    }
}
