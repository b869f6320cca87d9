//! Server module - bind lifecycle for path and TCP listeners

mod lifecycle;
mod listener;

pub use lifecycle::{Attempt, Lifecycle, LifecycleHooks, RetryDecision};
pub use listener::{BoundListener, Connection};

use crate::address::ListenAddr;
use crate::instrument::orphan::ProbeResult;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Errors returned by [`Server::listen`]
#[derive(Debug, Error)]
pub enum BindError {
    #[error("address already in use: {address}")]
    AddressInUse {
        address: ListenAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: ListenAddr,
        #[source]
        source: io::Error,
    },

    #[error("server is already listening on {0}")]
    AlreadyListening(ListenAddr),

    #[error("a bind is already in progress")]
    InProgress,

    #[error("server is closed")]
    Closed,
}

impl BindError {
    fn from_io(address: &ListenAddr, source: io::Error) -> Self {
        let address = address.clone();
        if source.kind() == io::ErrorKind::AddrInUse {
            BindError::AddressInUse { address, source }
        } else {
            BindError::Bind { address, source }
        }
    }

    pub fn is_address_in_use(&self) -> bool {
        matches!(self, BindError::AddressInUse { .. })
    }

    /// Underlying I/O error kind, if the bind primitive failed
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            BindError::AddressInUse { source, .. } | BindError::Bind { source, .. } => {
                Some(source.kind())
            }
            _ => None,
        }
    }
}

/// Notifications broadcast by a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A bind attempt failed
    BindFailed {
        kind: io::ErrorKind,
        attempt: Attempt,
    },
    /// The orphan detector probed an existing socket file
    Probed(ProbeResult),
    /// A stale socket file was removed
    Unlinked(PathBuf),
    PermissionsRelaxed { path: PathBuf, mode: u32 },
    PermissionsFailed { path: PathBuf, kind: io::ErrorKind },
    Listening(ListenAddr),
    Closed,
}

struct State {
    lifecycle: Lifecycle,
    binding: bool,
    address: Option<ListenAddr>,
    listener: Option<Arc<BoundListener>>,
}

struct Inner {
    id: Uuid,
    state: Mutex<State>,
    hooks: Mutex<Option<Arc<dyn LifecycleHooks>>>,
    events: broadcast::Sender<ServerEvent>,
}

/// Handle to a bindable, listenable endpoint
///
/// Clones share the same underlying server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// Create an unbound server
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                state: Mutex::new(State {
                    lifecycle: Lifecycle::Unbound,
                    binding: false,
                    address: None,
                    listener: None,
                }),
                hooks: Mutex::new(None),
                events,
            }),
        }
    }

    /// Get server ID
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> Lifecycle {
        self.inner.state.lock().lifecycle
    }

    /// Bound address, `None` until the server is listening
    pub fn local_addr(&self) -> Option<ListenAddr> {
        self.inner.state.lock().address.clone()
    }

    /// Whether the OS handle is still open
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().listener.is_some()
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Install lifecycle hooks
    ///
    /// Returns `false` and leaves the existing hooks in place if the server
    /// already has hooks.
    pub fn install_hooks(&self, hooks: Arc<dyn LifecycleHooks>) -> bool {
        let mut slot = self.inner.hooks.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(hooks);
        true
    }

    pub fn has_hooks(&self) -> bool {
        self.inner.hooks.lock().is_some()
    }

    /// Bind and start listening on `address`
    ///
    /// Failed binds are handed to the installed hooks, which decide whether
    /// to retry. Without hooks the first error is returned.
    pub async fn listen(&self, address: impl Into<ListenAddr>) -> Result<ListenAddr, BindError> {
        let address = address.into();
        self.begin_bind()?;
        let _binding = BindingGuard(self);
        self.bind_until_settled(&address).await
    }

    fn begin_bind(&self) -> Result<(), BindError> {
        let mut state = self.inner.state.lock();
        match state.lifecycle {
            Lifecycle::Closed => return Err(BindError::Closed),
            Lifecycle::Listening => {
                let address = state.address.clone().ok_or(BindError::InProgress)?;
                return Err(BindError::AlreadyListening(address));
            }
            Lifecycle::Unbound | Lifecycle::Probing => {}
        }
        if state.binding {
            return Err(BindError::InProgress);
        }
        state.binding = true;
        Ok(())
    }

    async fn bind_until_settled(&self, address: &ListenAddr) -> Result<ListenAddr, BindError> {
        let hooks = self.inner.hooks.lock().clone();
        let mut attempt = Attempt::Initial;

        loop {
            let error = match listener::bind(address).await {
                Ok(bound) => return self.enter_listening(address, bound, hooks.as_deref()).await,
                Err(source) => BindError::from_io(address, source),
            };

            tracing::debug!("bind {} failed ({:?}): {}", address, attempt, error);
            if let Some(kind) = error.io_kind() {
                self.emit(ServerEvent::BindFailed { kind, attempt });
            }

            let Some(active) = hooks.as_deref() else {
                return Err(error);
            };
            let decision = match attempt {
                Attempt::Final => RetryDecision::Surface,
                _ => active.on_bind_error(self, address, &error, attempt).await,
            };
            match attempt.advance(decision) {
                Some(next) => attempt = next,
                None => return Err(error),
            }
        }
    }

    async fn enter_listening(
        &self,
        requested: &ListenAddr,
        bound: BoundListener,
        hooks: Option<&dyn LifecycleHooks>,
    ) -> Result<ListenAddr, BindError> {
        let address = bound.local_addr(requested);
        {
            let mut state = self.inner.state.lock();
            if !state.lifecycle.can_bind() {
                // closed while the bind was in flight
                drop(bound);
                if let ListenAddr::Path(path) = &address {
                    remove_socket_file(path);
                }
                return Err(BindError::Closed);
            }
            state.lifecycle = Lifecycle::Listening;
            state.address = Some(address.clone());
            state.listener = Some(Arc::new(bound));
        }

        tracing::info!("Server {} listening on {}", self.id(), address);
        self.emit(ServerEvent::Listening(address.clone()));

        if let Some(hooks) = hooks {
            hooks.on_listening(self, &address).await;
        }
        Ok(address)
    }

    /// Accept the next connection on the bound listener
    ///
    /// An accept in flight keeps the OS handle alive until it completes, even
    /// across [`Server::close`].
    pub async fn accept(&self) -> io::Result<Connection> {
        let listener = self
            .inner
            .state
            .lock()
            .listener
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "server is not listening"))?;
        listener.accept().await
    }

    /// Close the server
    ///
    /// Drops the OS handle and, for a path-bound listener, removes the
    /// socket file. Synchronous so it can run from exit handlers. Returns
    /// `false` if the server was already closed.
    pub fn close(&self) -> bool {
        let (listener, address) = {
            let mut state = self.inner.state.lock();
            if state.lifecycle == Lifecycle::Closed {
                return false;
            }
            let was_listening = state.lifecycle == Lifecycle::Listening;
            state.lifecycle = Lifecycle::Closed;
            let address = if was_listening {
                state.address.clone()
            } else {
                None
            };
            (state.listener.take(), address)
        };

        drop(listener);
        if let Some(ListenAddr::Path(path)) = &address {
            remove_socket_file(path);
        }

        tracing::debug!("Server {} closed", self.id());
        self.emit(ServerEvent::Closed);
        true
    }

    /// Move an unbound server into `Probing`
    pub(crate) fn mark_probing(&self) {
        let mut state = self.inner.state.lock();
        if state.lifecycle == Lifecycle::Unbound {
            state.lifecycle = Lifecycle::Probing;
        }
    }

    pub(crate) fn emit(&self, event: ServerEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Server")
            .field("id", &self.inner.id)
            .field("lifecycle", &state.lifecycle)
            .field("address", &state.address)
            .finish()
    }
}

/// Clears the in-flight flag even if the `listen` future is dropped
struct BindingGuard<'a>(&'a Server);

impl Drop for BindingGuard<'_> {
    fn drop(&mut self) {
        self.0.inner.state.lock().binding = false;
    }
}

fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed socket file {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove socket file {:?}: {}", path, e),
    }
}
