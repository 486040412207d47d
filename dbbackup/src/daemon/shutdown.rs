//! Stop the `check --daemon` loop on SIGTERM or SIGINT.
//!
//! A pass already in progress finishes; launched task processes live in
//! their own process groups and are not signalled.

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn trigger(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("No loop is listening for shutdown: {}", e);
        }
    }

    /// Wait for SIGTERM or SIGINT, then notify every subscriber.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Cannot listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        };

        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    warn!("Cannot listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, stopping after the current pass"),
            _ = terminate => info!("Received SIGTERM, stopping after the current pass"),
        }
        self.trigger();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_reaches_subscribers() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();
        let handle = tokio::spawn(async move { rx.recv().await.is_ok() });
        coordinator.trigger();
        assert!(handle.await.unwrap());
    }
}
