//! Orphaned socket detection
//!
//! A bind that fails with `AddrInUse` on a socket path is either racing a
//! live listener or tripping over the file a crashed process left behind.
//! Connecting to the path tells them apart: a refused connection means
//! nobody is accepting, so the file can go.

use crate::address::ListenAddr;
use crate::server::{RetryDecision, Server, ServerEvent};
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use tokio::net::UnixStream;

/// Outcome of a liveness probe against an existing socket file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// Connection refused; nothing listens behind the file
    Orphan,
    /// Connection accepted by a live listener
    Live,
    /// Any other connect failure, e.g. permission denied
    Ambiguous(io::ErrorKind),
}

/// What sits at a socket path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inspection {
    Missing,
    NotASocket,
    Probed(ProbeResult),
}

/// Whether `path` is a socket special file
pub async fn is_socket(path: &Path) -> io::Result<bool> {
    let metadata = tokio::fs::metadata(path).await?;
    Ok(metadata.file_type().is_socket())
}

/// Connect to `path` and classify the result
///
/// The probe connection is dropped immediately on success.
pub async fn probe(path: &Path) -> ProbeResult {
    match UnixStream::connect(path).await {
        Ok(stream) => {
            drop(stream);
            ProbeResult::Live
        }
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => ProbeResult::Orphan,
        Err(e) => ProbeResult::Ambiguous(e.kind()),
    }
}

/// Stat the path and probe it if it is a socket
pub async fn inspect(path: &Path) -> Inspection {
    match is_socket(path).await {
        Ok(true) => Inspection::Probed(probe(path).await),
        Ok(false) => Inspection::NotASocket,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Inspection::Missing,
        Err(e) => {
            tracing::debug!("stat {:?} failed: {}", path, e);
            Inspection::NotASocket
        }
    }
}

/// Decide how `server` should continue after `address` was reported in use
///
/// An orphaned socket file is removed and the bind retried. A live or
/// ambiguous endpoint is left alone and the bind repeated once so its error
/// reaches the caller. Anything that is not a socket file is not ours to
/// repair.
pub async fn retry_if_orphaned(server: &Server, address: &ListenAddr) -> RetryDecision {
    let Some(path) = address.as_path() else {
        tracing::debug!("Nothing to do, {} is not a UNIX domain socket address", address);
        return RetryDecision::Surface;
    };

    let result = match inspect(path).await {
        Inspection::Probed(result) => result,
        Inspection::Missing | Inspection::NotASocket => {
            tracing::debug!("Nothing to do, {:?} is not a UNIX domain socket", path);
            return RetryDecision::Surface;
        }
    };

    server.mark_probing();
    server.emit(ServerEvent::Probed(result));

    match result {
        ProbeResult::Live => {
            tracing::debug!("{:?} has a live listener", path);
            RetryDecision::Rebind
        }
        ProbeResult::Ambiguous(kind) => {
            tracing::debug!("probe of {:?} inconclusive ({:?}), leaving it in place", path, kind);
            RetryDecision::Rebind
        }
        ProbeResult::Orphan => {
            tracing::debug!("retry {:?} after unlinking", path);
            match tokio::fs::remove_file(path).await {
                Ok(()) => server.emit(ServerEvent::Unlinked(path.to_path_buf())),
                Err(e) => {
                    tracing::warn!("Failed to unlink orphaned socket {:?}: {}", path, e)
                }
            }
            RetryDecision::Retry
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_inspect_classifies_paths() {
        let dir = tempdir().unwrap();

        let missing = dir.path().join("missing.sock");
        assert_eq!(inspect(&missing).await, Inspection::Missing);

        let regular = dir.path().join("regular.sock");
        std::fs::write(&regular, b"not a socket").unwrap();
        assert_eq!(inspect(&regular).await, Inspection::NotASocket);

        let stale = dir.path().join("stale.sock");
        drop(std::os::unix::net::UnixListener::bind(&stale).unwrap());
        assert_eq!(inspect(&stale).await, Inspection::Probed(ProbeResult::Orphan));

        let live = dir.path().join("live.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&live).unwrap();
        assert_eq!(inspect(&live).await, Inspection::Probed(ProbeResult::Live));
    }

    #[tokio::test]
    async fn test_regular_file_is_never_removed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.sock");
        std::fs::write(&path, b"precious").unwrap();

        let server = Server::new();
        let decision = retry_if_orphaned(&server, &ListenAddr::Path(path.clone())).await;
        assert_eq!(decision, RetryDecision::Surface);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_tcp_address_is_not_probed() {
        let server = Server::new();
        let addr: ListenAddr = "127.0.0.1:1".parse().unwrap();
        assert_eq!(retry_if_orphaned(&server, &addr).await, RetryDecision::Surface);
    }
}
