//! Supervisor/worker coordination
//!
//! A worker process holds the listening handle, so only the worker's exit
//! closes it. When the supervisor is the one shutting down, it removes the
//! socket path itself, which it learns from the worker's `Listening` notice.
//!
//! Workers are told who they are through `PROXIABLE_WORKER_ID` and report
//! over their stdout pipe.
//!
//! Workers share the coordinator, not the socket. Each worker binds its
//! path itself, so a second worker on a path already held by a live worker
//! probes it as live and fails to listen. Give each worker its own path
//! (or run one worker per path, as `proxiable supervise` does).

mod coordinator;
pub mod protocol;

pub use coordinator::{Coordinator, Worker};

use crate::address::ListenAddr;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Environment variable carrying a worker's ID
pub const WORKER_ID_ENV: &str = "PROXIABLE_WORKER_ID";

/// Messages from a worker to its supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerNotice {
    /// The worker started listening on `address`
    Listening {
        worker_id: Uuid,
        address: ListenAddr,
    },
}

/// This process's worker ID, if it runs under a supervisor
pub fn worker_id() -> Option<Uuid> {
    std::env::var(WORKER_ID_ENV)
        .ok()
        .and_then(|value| value.parse().ok())
}

/// Send a notice to the supervisor over stdout
pub async fn announce(notice: &WorkerNotice) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    protocol::write_frame(&mut stdout, notice).await
}
