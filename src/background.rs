//! Background task registry for tracking spawned async tasks.
//!
//! Session tasks outlive the request that started them; they are registered
//! here so graceful shutdown can wait for in-flight persistence to finish.

// std::sync::Mutex is correct here — the lock is never held across .await.
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Registry for background tasks that should be awaited on shutdown.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl BackgroundTasks {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn a background task and register its handle.
    ///
    /// Registration is synchronous so the handle is tracked before this
    /// method returns, even if the task completes immediately.
    pub fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);

        let mut guard = self.handles.lock().expect("mutex poisoned");
        guard.retain(|h| !h.is_finished());
        guard.push(handle);
    }

    /// Wait for all registered background tasks to complete.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().expect("mutex poisoned"));

        let count = handles.len();
        if count == 0 {
            return;
        }

        info!(count, "Waiting for background tasks to complete");

        for (i, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(()) => {}
                Err(e) => {
                    warn!(task = i, error = %e, "Background task panicked");
                }
            }
        }

        info!("All background tasks completed");
    }

    /// Get the number of pending tasks.
    pub fn pending_count(&self) -> usize {
        let mut guard = self.handles.lock().expect("mutex poisoned");
        guard.retain(|h| !h.is_finished());
        guard.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn spawn_and_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let tasks = BackgroundTasks::new();

        let c1 = counter.clone();
        tasks.spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = c1.fetch_add(1, Ordering::SeqCst);
        });

        let c2 = counter.clone();
        tasks.spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = c2.fetch_add(1, Ordering::SeqCst);
        });

        tasks.shutdown().await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_empty_is_noop() {
        let tasks = BackgroundTasks::new();
        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_registers_immediately() {
        let tasks = BackgroundTasks::new();
        tasks.spawn(async {});
        assert!(tasks.pending_count() <= 1);
    }
}
