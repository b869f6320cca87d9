//! proxiable - stale-socket recovery and cleanup for UNIX domain socket servers
//!
//! This crate provides:
//! - Orphan detection: an `AddrInUse` bind on a socket path is retried after
//!   removing the file if nothing is listening behind it
//! - Permission relaxation: the socket file is made read/write for everyone
//!   so a reverse proxy running as another user can connect
//! - Exit cleanup: the socket file is removed when the process exits, also
//!   when a supervisor runs the listener inside a worker process
//!
//! # Architecture
//!
//! A [`server::Server`] owns the bind lifecycle. [`wrap`] installs hooks on
//! it that consult [`instrument::orphan`] on failed binds and run
//! [`instrument::permissions`] and [`exit`] registration once it listens.
//! [`cluster::Coordinator`] covers the supervisor side.
//!
//! Diagnostics go through `tracing` under the crate's module targets
//! (`RUST_LOG=proxiable=debug`).

pub mod address;
pub mod cluster;
pub mod config;
pub mod exit;
pub mod instrument;
pub mod server;

pub use address::ListenAddr;
pub use instrument::{wrap, Proxiable, ProxiableOptions, RetryPolicy};
pub use server::{BindError, Server};
