// Graceful shutdown: shared stop flag for sweepers and dispatch loops, plus signal trapping

use anyhow::Result;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared shutdown state; clones observe the same flag
#[derive(Clone)]
pub struct ShutdownState {
    shutdown_requested: Arc<AtomicBool>,
    cleanup_complete: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            cleanup_complete: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Request a shutdown and wake every waiter
    pub fn request_shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            log::info!("[Shutdown] Shutdown requested");
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has been requested
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_shutdown_requested() {
                return;
            }
            notified.await;
        }
    }

    pub fn mark_cleanup_complete(&self) {
        self.cleanup_complete.store(true, Ordering::SeqCst);
        log::info!("[Shutdown] Cleanup complete");
    }

    pub fn is_cleanup_complete(&self) -> bool {
        self.cleanup_complete.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of graceful shutdown cleanup
#[derive(Debug, Clone, Default)]
pub struct ShutdownResult {
    /// Sessions that were still executing and got cancelled
    pub sessions_cancelled: usize,
    /// Agent workspaces that were torn down
    pub workspaces_cleaned: usize,
    /// Branches left in place because their work was not merged
    pub preserved_branches: Vec<String>,
    pub errors: Vec<String>,
}

impl ShutdownResult {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct ShutdownHandler {
    state: ShutdownState,
}

impl ShutdownHandler {
    pub fn with_state(state: ShutdownState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &ShutdownState {
        &self.state
    }

    /// Flag shutdown, run `cleanup` and log what it did
    pub async fn handle_shutdown<F, Fut>(&self, cleanup: F) -> Result<ShutdownResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ShutdownResult>>,
    {
        self.state.request_shutdown();
        log::info!("[Shutdown] Starting graceful shutdown...");

        let result = cleanup().await?;

        log::info!(
            "[Shutdown] Shutdown complete: {} session(s) cancelled, {} workspace(s) cleaned, {} branch(es) preserved",
            result.sessions_cancelled,
            result.workspaces_cleaned,
            result.preserved_branches.len()
        );
        for branch in &result.preserved_branches {
            log::info!("[Shutdown] Preserved branch: {}", branch);
        }
        for error in &result.errors {
            log::warn!("[Shutdown] Cleanup error: {}", error);
        }

        self.state.mark_cleanup_complete();
        Ok(result)
    }
}

/// Register handlers for SIGINT (Ctrl+C), SIGTERM and SIGHUP
#[cfg(unix)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])
        .map_err(|e| anyhow::anyhow!("Failed to register signal handlers: {}", e))?;

    thread::spawn(move || {
        for signal in signals.forever() {
            match signal {
                SIGINT => log::info!("[Shutdown] Received SIGINT (Ctrl+C)"),
                SIGTERM => log::info!("[Shutdown] Received SIGTERM"),
                SIGHUP => log::info!("[Shutdown] Received SIGHUP"),
                _ => continue,
            }
            state.request_shutdown();
        }
    });

    log::info!("[Shutdown] Signal handlers registered (SIGINT, SIGTERM, SIGHUP)");
    Ok(())
}

#[cfg(windows)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    ctrlc::set_handler(move || {
        log::info!("[Shutdown] Received Ctrl+C");
        state.request_shutdown();
    })
    .map_err(|e| anyhow::anyhow!("Failed to register Ctrl+C handler: {}", e))?;

    log::info!("[Shutdown] Signal handler registered (Ctrl+C)");
    Ok(())
}
