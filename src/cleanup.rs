//! Lifecycle of the short-lived files ssh reads at startup.
//!
//! Each side file gets a delayed deletion task. Deletion is idempotent and
//! shutting the queue down deletes everything still pending right away.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::command::SideFile;

pub struct CleanupQueue {
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl CleanupQueue {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Delete `path` after `delay`, or as soon as the queue shuts down.
    pub fn schedule(&self, path: PathBuf, delay: Duration) {
        if self.cancel.is_cancelled() {
            remove_side_file(&path);
            return;
        }

        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    debug!("deleting {} early, shutting down", path.display());
                }
            }
            remove_side_file(&path);
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Number of deletions that have not run yet.
    pub fn pending(&self) -> usize {
        self.tasks.lock().iter().filter(|t| !t.is_finished()).count()
    }

    /// Cancel every timer and wait until all scheduled files are gone.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("side file cleanup task failed: {}", e);
            }
        }
    }
}

impl Default for CleanupQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a side file readable only by the current user.
pub fn write_side_file(file: &SideFile) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut handle = options.open(&file.path)?;
    handle.write_all(file.contents.expose().as_bytes())?;
    handle.write_all(b"\n")?;
    Ok(())
}

/// Remove a side file. Returns true if a file was actually deleted.
pub fn remove_side_file(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("deleted side file {}", path.display());
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("failed to delete side file {}: {}", path.display(), e);
            false
        }
    }
}
