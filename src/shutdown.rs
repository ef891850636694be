//! Process-wide running flag
//!
//! Cloned into every long-lived task. Once triggered it never resets.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Clear the running flag. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once [`Shutdown::trigger`] has been called.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // Sender lives in self, so the channel cannot close under us.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_resolves_after_trigger() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());

        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        shutdown.trigger();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_triggered());

        // Late waiters return immediately.
        shutdown.wait().await;
    }
}
