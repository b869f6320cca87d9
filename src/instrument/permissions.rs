//! Socket file permissions

use super::orphan::is_socket;
use crate::address::ListenAddr;
use crate::server::{Server, ServerEvent};
use std::fs::Permissions;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Read/write for owner, group and others, so a proxy running as another
/// user can connect
pub const DEFAULT_SOCKET_MODE: u32 = 0o666;

/// chmod the socket file behind a listening server
///
/// Best effort: failures are logged and reported as an event. Returns
/// whether `address` is a socket file, i.e. whether there is anything to
/// clean up on exit.
pub async fn set_read_writable(server: &Server, address: &ListenAddr, mode: u32) -> bool {
    let Some(path) = address.as_path() else {
        tracing::debug!("Nothing to do, we are not a UNIX domain socket server.");
        return false;
    };

    match is_socket(path).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!("{:?} is not a socket, leaving permissions alone", path);
            return false;
        }
        Err(e) => {
            tracing::debug!("stat {:?} failed: {}", path, e);
            return false;
        }
    }

    tracing::debug!("chmod {:o} {:?}", mode, path);
    let result = tokio::fs::set_permissions(path, Permissions::from_mode(mode)).await;
    report_chmod(server, path, mode, result);
    true
}

/// Emit the outcome of a chmod; a failure never affects the listener
fn report_chmod(server: &Server, path: &Path, mode: u32, result: io::Result<()>) {
    match result {
        Ok(()) => server.emit(ServerEvent::PermissionsRelaxed {
            path: path.to_path_buf(),
            mode,
        }),
        Err(e) => {
            tracing::warn!("Failed to chmod {:?}: {}", path, e);
            server.emit(ServerEvent::PermissionsFailed {
                path: path.to_path_buf(),
                kind: e.kind(),
            });
        }
    }
}
