//! Process exit cleanup
//!
//! Exit handlers run synchronously from `atexit`, after `main` returns or on
//! `std::process::exit`. They cannot await anything, so every hook is a
//! blocking close or unlink. Nothing here runs on SIGKILL.

use crate::server::Server;
use parking_lot::Mutex;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

static ATEXIT_INSTALLED: AtomicBool = AtomicBool::new(false);
static GLOBAL: OnceLock<Arc<ExitRegistry>> = OnceLock::new();

/// Cleanup to perform on exit
#[derive(Debug)]
pub enum ExitHook {
    /// Close the server if its handle is still open, which removes its
    /// socket file
    CloseServer(Server),
    /// Remove a socket file this process never held a handle for
    UnlinkPath(PathBuf),
}

impl ExitHook {
    fn run(self) {
        match self {
            ExitHook::CloseServer(server) => {
                if server.is_open() {
                    tracing::debug!("Closing server {} on exit", server.id());
                    server.close();
                }
            }
            ExitHook::UnlinkPath(path) => match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!("unlinked {:?}", path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to unlink {:?}: {}", path, e),
            },
        }
    }
}

/// Hooks to run once when the process exits
#[derive(Debug, Default)]
pub struct ExitRegistry {
    hooks: Mutex<Vec<ExitHook>>,
}

impl ExitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, run from `atexit`
    ///
    /// The `atexit` handler is installed the first time this is called.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| {
            install_atexit();
            Arc::new(Self::new())
        }))
    }

    pub fn register(&self, hook: ExitHook) {
        tracing::debug!("Registered exit hook {:?}", hook);
        self.hooks.lock().push(hook);
    }

    /// Number of hooks not yet run
    pub fn pending(&self) -> usize {
        self.hooks.lock().len()
    }

    /// Run and discard every registered hook
    ///
    /// Calling this again only runs hooks registered since the last call.
    /// A panicking hook is contained and the rest still run.
    pub fn run(&self) {
        let hooks = std::mem::take(&mut *self.hooks.lock());
        for hook in hooks {
            if catch_unwind(AssertUnwindSafe(|| hook.run())).is_err() {
                tracing::error!("Exit hook panicked");
            }
        }
        tracing::debug!("Exit hooks finished");
    }
}

/// Register the global runner with atexit (idempotent).
fn install_atexit() {
    if ATEXIT_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    // SAFETY: `run_global` is a plain `extern "C" fn` with no arguments that
    // never unwinds across the FFI boundary (hooks run under catch_unwind).
    let rc = unsafe { libc::atexit(run_global) };
    if rc != 0 {
        tracing::warn!("atexit registration failed, socket files will not be cleaned up on exit");
    }
}

extern "C" fn run_global() {
    if let Some(registry) = GLOBAL.get() {
        registry.run();
    }
}
