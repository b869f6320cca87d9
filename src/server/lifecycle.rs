//! Lifecycle states, bind attempts and the hook seam used by instrumentation

use super::{BindError, Server};
use crate::address::ListenAddr;
use async_trait::async_trait;

/// Server lifecycle
///
/// `Unbound -> (Probing)* -> Listening -> Closed`. A server never returns to
/// `Unbound`, and `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unbound,
    /// An address-in-use failure is being investigated
    Probing,
    Listening,
    Closed,
}

impl Lifecycle {
    /// Whether `listen` may be called in this state
    pub fn can_bind(&self) -> bool {
        matches!(self, Lifecycle::Unbound | Lifecycle::Probing)
    }
}

/// Which bind attempt of a single `listen` call is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// The caller's own bind
    Initial,
    /// The nth bind after a stale socket file was removed
    Retry(u32),
    /// Rebind after a probe found the path occupied; its outcome is final
    Final,
}

impl Attempt {
    /// Number of failed binds including the current one, for retry caps
    pub fn failures(&self) -> u32 {
        match self {
            Attempt::Initial => 1,
            Attempt::Retry(n) => n + 1,
            Attempt::Final => u32::MAX,
        }
    }

    /// Next attempt state for a hook decision, `None` when the error surfaces
    pub(crate) fn advance(self, decision: RetryDecision) -> Option<Attempt> {
        match (self, decision) {
            (Attempt::Final, _) | (_, RetryDecision::Surface) => None,
            (_, RetryDecision::Rebind) => Some(Attempt::Final),
            (Attempt::Initial, RetryDecision::Retry) => Some(Attempt::Retry(1)),
            (Attempt::Retry(n), RetryDecision::Retry) => Some(Attempt::Retry(n.saturating_add(1))),
        }
    }
}

/// What to do after a failed bind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Bind again and keep consulting the hooks on failure
    Retry,
    /// Bind once more and surface whatever that attempt produces
    Rebind,
    /// Give the error to the caller now
    Surface,
}

/// Callbacks a server runs around its bind lifecycle
///
/// At most one set of hooks is installed per server. `on_bind_error` is only
/// consulted while the server has not reached `Listening`; `on_listening`
/// runs exactly once, on the transition into `Listening`.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn on_bind_error(
        &self,
        server: &Server,
        address: &ListenAddr,
        error: &BindError,
        attempt: Attempt,
    ) -> RetryDecision;

    async fn on_listening(&self, server: &Server, address: &ListenAddr);
}
