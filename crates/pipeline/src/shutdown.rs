//! Cooperative shutdown broadcast

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

struct Inner {
    tx: broadcast::Sender<()>,
    triggered: AtomicBool,
}

/// Shutdown signal shared by every long-running worker
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                tx,
                triggered: AtomicBool::new(false),
            }),
        }
    }

    /// Broadcast shutdown; later calls are no-ops
    pub fn trigger(&self) {
        if !self.inner.triggered.swap(true, Ordering::SeqCst) {
            info!("Shutdown triggered");
            let _ = self.inner.tx.send(());
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.inner.tx.subscribe(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-worker receiving end of [`Shutdown`]
pub struct ShutdownListener {
    rx: broadcast::Receiver<()>,
    inner: Arc<Inner>,
}

impl ShutdownListener {
    /// Resolve once shutdown has been triggered, including before subscribing
    pub async fn recv(&mut self) {
        if self.inner.triggered.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.rx.recv().await;
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_listener_wakes_on_trigger() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.subscribe();

        let waiter = tokio::spawn(async move {
            listener.recv().await;
        });
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.trigger();

        let mut listener = shutdown.subscribe();
        assert!(listener.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), listener.recv())
            .await
            .unwrap();
    }
}
