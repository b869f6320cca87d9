//! Supervisor side: track worker sockets and unlink them on exit

use super::{protocol, WorkerNotice, WORKER_ID_ENV};
use crate::exit::{ExitHook, ExitRegistry};
use crate::instrument::orphan::is_socket;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use uuid::Uuid;

/// Tracks where workers listen and removes their socket files when the
/// supervising process exits
pub struct Coordinator {
    exits: Arc<ExitRegistry>,
    tracked: Mutex<HashSet<PathBuf>>,
}

/// A spawned worker process
pub struct Worker {
    pub id: Uuid,
    pub child: Child,
}

impl Worker {
    /// Ask the worker to exit so it runs its own cleanup
    pub fn terminate(&self) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            // already reaped
            return Ok(());
        };
        // SAFETY: kill(2) with a pid we spawned and a valid signal number.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Coordinator {
    /// Create a coordinator that registers with the process exit registry
    pub fn new() -> Self {
        Self::with_exit_registry(ExitRegistry::global())
    }

    pub fn with_exit_registry(exits: Arc<ExitRegistry>) -> Self {
        Self {
            exits,
            tracked: Mutex::new(HashSet::new()),
        }
    }

    /// Socket paths that will be unlinked on exit
    pub fn tracked_paths(&self) -> Vec<PathBuf> {
        self.tracked.lock().iter().cloned().collect()
    }

    /// Handle a worker notice
    ///
    /// Returns `true` if this registered a new path for cleanup. Each path
    /// is registered once no matter how many workers report it.
    pub async fn observe(&self, notice: &WorkerNotice) -> bool {
        let WorkerNotice::Listening { worker_id, address } = notice;

        let Some(path) = address.as_path() else {
            tracing::debug!("Worker {} listens on {}, nothing to unlink", worker_id, address);
            return false;
        };

        if !is_socket(path).await.unwrap_or(false) {
            tracing::debug!("Worker {} reported {:?} but it is not a socket", worker_id, path);
            return false;
        }

        if !self.tracked.lock().insert(path.to_path_buf()) {
            return false;
        }

        tracing::info!("Worker {} listening on {:?}, will unlink on exit", worker_id, path);
        self.exits.register(ExitHook::UnlinkPath(path.to_path_buf()));
        true
    }

    /// Read notices from a worker until its stream closes
    pub async fn watch<R: AsyncRead + Unpin>(&self, mut reader: R) -> Result<()> {
        while let Some(frame) = protocol::read_frame(&mut reader).await? {
            match protocol::deserialize::<WorkerNotice>(&frame) {
                Ok(notice) => {
                    self.observe(&notice).await;
                }
                Err(e) => tracing::warn!("Ignoring worker message: {}", e),
            }
        }
        Ok(())
    }

    /// Spawn a worker and watch its stdout for notices
    ///
    /// The worker's stdout is taken over for notices; it should log to
    /// stderr.
    pub fn spawn_worker(self: &Arc<Self>, mut command: Command) -> Result<Worker> {
        let id = Uuid::new_v4();
        command
            .env(WORKER_ID_ENV, id.to_string())
            .stdout(Stdio::piped());

        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("worker stdout was not captured"))?;

        tracing::info!("Spawned worker {} (pid {:?})", id, child.id());

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = coordinator.watch(stdout).await {
                tracing::error!("Worker {} notice stream failed: {}", id, e);
            }
            tracing::debug!("Worker {} notice stream closed", id);
        });

        Ok(Worker { id, child })
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}
