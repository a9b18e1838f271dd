//! Cooperative shutdown signalling.
//!
//! The teacher's `shutdown.rs` exposes this as free functions over a global
//! `Lazy` channel; the rest of the teacher's tasks (`task_monitor`) call
//! instance methods on a `Shutdown` value that is never actually defined
//! anywhere in that snapshot. This module resolves the gap with a small
//! `Clone`-able handle, threaded explicitly through the composition root
//! rather than reached for globally.

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Signal every clone's `await_shutdown()` to resolve.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`Shutdown::shutdown`] has been called. Safe to await
    /// from multiple clones concurrently.
    pub async fn await_shutdown(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        // A closed sender (all Shutdown handles dropped) is treated the same
        // as a shutdown signal: there is nothing left to wait for.
        let _ = rx.changed().await;
    }

    /// Installs a task that calls [`Shutdown::shutdown`] on SIGINT/SIGTERM
    /// (or Ctrl-C on non-Unix platforms).
    pub fn watch_signals(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("received shutdown signal");
            handle.shutdown();
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn await_shutdown_resolves_after_signal() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();

        let handle = tokio::spawn(async move {
            waiter.await_shutdown().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("await_shutdown should resolve promptly")
            .unwrap();
        assert!(shutdown.is_shutting_down());
    }

    #[tokio::test]
    async fn already_shut_down_returns_immediately() {
        let shutdown = Shutdown::new();
        shutdown.shutdown();
        tokio::time::timeout(Duration::from_millis(50), shutdown.await_shutdown())
            .await
            .unwrap();
    }
}
