//! Instrumentation that makes a server proxiable
//!
//! Wrapping a [`Server`] installs lifecycle hooks that:
//! - recover from `AddrInUse` caused by an orphaned socket file
//! - chmod the socket so a proxy running as another user can connect
//! - close the server (and with it the socket file) on process exit
//! - tell the supervising process where a worker listens
//!
//! ```no_run
//! # async fn run() -> Result<(), proxiable::server::BindError> {
//! let server = proxiable::wrap(proxiable::server::Server::new());
//! server.listen(std::path::PathBuf::from("/var/run/proxiable.sock")).await?;
//! # Ok(())
//! # }
//! ```

pub mod orphan;
pub mod permissions;

use crate::address::ListenAddr;
use crate::cluster::{self, WorkerNotice};
use crate::config::{Config, ConfigError};
use crate::exit::{ExitHook, ExitRegistry};
use crate::server::{Attempt, BindError, LifecycleHooks, RetryDecision, Server};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

pub use permissions::DEFAULT_SOCKET_MODE;

/// Bounds on the orphan retry cycle
///
/// The default retries without limit and without delay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total bind attempts before `AddrInUse` is surfaced; `None` is unbounded
    pub max_attempts: Option<u32>,
    /// Pause before each retry
    pub backoff: Duration,
}

/// Options applied by [`Proxiable`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiableOptions {
    /// Mode set on the socket file once listening
    pub socket_mode: u32,
    pub retry: RetryPolicy,
}

impl Default for ProxiableOptions {
    fn default() -> Self {
        Self {
            socket_mode: DEFAULT_SOCKET_MODE,
            retry: RetryPolicy::default(),
        }
    }
}

impl ProxiableOptions {
    /// Build options from a loaded config
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            socket_mode: config.socket_mode()?,
            retry: RetryPolicy {
                max_attempts: config.retry.max_attempts,
                backoff: Duration::from_millis(config.retry.backoff_ms),
            },
        })
    }
}

/// Installs proxiable behaviour on servers
pub struct Proxiable {
    options: ProxiableOptions,
    exits: Arc<ExitRegistry>,
}

impl Proxiable {
    /// Create a wrapper that registers exit hooks with the process registry
    pub fn new(options: ProxiableOptions) -> Self {
        Self {
            options,
            exits: ExitRegistry::global(),
        }
    }

    /// Register exit hooks with `exits` instead of the process registry
    pub fn with_exit_registry(mut self, exits: Arc<ExitRegistry>) -> Self {
        self.exits = exits;
        self
    }

    pub fn options(&self) -> &ProxiableOptions {
        &self.options
    }

    /// Instrument `target` if it is a [`Server`] or `Arc<Server>`, then hand
    /// it back
    ///
    /// Any other value is returned untouched. A borrowed `&Server` is not
    /// `'static` and cannot be recognized here; use [`Proxiable::instrument`]
    /// for those.
    pub fn wrap<T: Any>(&self, target: T) -> T {
        let any = &target as &dyn Any;
        let server = any
            .downcast_ref::<Server>()
            .or_else(|| any.downcast_ref::<Arc<Server>>().map(|server| &**server));
        match server {
            Some(server) => {
                self.instrument(server);
            }
            None => tracing::debug!(
                "Invalid argument: {} is not a Server",
                std::any::type_name::<T>()
            ),
        }
        target
    }

    /// Install hooks on `server`; returns `false` if it already has hooks
    pub fn instrument(&self, server: &Server) -> bool {
        let hooks = Arc::new(Instrumentation {
            options: self.options.clone(),
            exits: Arc::clone(&self.exits),
        });
        let installed = server.install_hooks(hooks);
        if installed {
            tracing::debug!("Instrumented server {}", server.id());
        } else {
            tracing::debug!("Server {} is already instrumented", server.id());
        }
        installed
    }
}

impl Default for Proxiable {
    fn default() -> Self {
        Self::new(ProxiableOptions::default())
    }
}

/// Make `target` proxiable with default options
///
/// Returns the same value; non-server values pass through untouched.
pub fn wrap<T: Any>(target: T) -> T {
    Proxiable::default().wrap(target)
}

struct Instrumentation {
    options: ProxiableOptions,
    exits: Arc<ExitRegistry>,
}

#[async_trait]
impl LifecycleHooks for Instrumentation {
    async fn on_bind_error(
        &self,
        server: &Server,
        address: &ListenAddr,
        error: &BindError,
        attempt: Attempt,
    ) -> RetryDecision {
        if !error.is_address_in_use() {
            return RetryDecision::Surface;
        }

        if let Some(max) = self.options.retry.max_attempts {
            if attempt.failures() >= max {
                tracing::warn!("Giving up on {} after {} bind attempts", address, attempt.failures());
                return RetryDecision::Surface;
            }
        }

        let decision = orphan::retry_if_orphaned(server, address).await;
        if decision == RetryDecision::Retry && !self.options.retry.backoff.is_zero() {
            tokio::time::sleep(self.options.retry.backoff).await;
        }
        decision
    }

    async fn on_listening(&self, server: &Server, address: &ListenAddr) {
        if permissions::set_read_writable(server, address, self.options.socket_mode).await {
            self.exits.register(ExitHook::CloseServer(server.clone()));
        }

        if let Some(worker_id) = cluster::worker_id() {
            let notice = WorkerNotice::Listening {
                worker_id,
                address: address.clone(),
            };
            if let Err(e) = cluster::announce(&notice).await {
                tracing::warn!("Failed to notify supervisor: {}", e);
            }
        }
    }
}
