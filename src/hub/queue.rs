//! Client-side offline queue.
//!
//! Outbound dispatches are tagged with a client-generated idempotency key
//! and queued FIFO while the server is unreachable. On reconnect the queue
//! flushes in order; each operation reuses its original key, so retries
//! after partial failure cannot double-create messages. An operation that
//! exhausts its retry budget stays at the head of the queue for manual
//! retry.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};
use ulid::Ulid;

// ============================================================================
// Retry Policy
// ============================================================================

/// Exponential backoff: `initial * 2^attempt`, capped, for a bounded number
/// of attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            cap: Duration::from_secs(16),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` failures (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let doubled = self
            .initial
            .checked_mul(1u32 << attempt.min(31))
            .unwrap_or(self.cap);
        doubled.min(self.cap)
    }
}

// ============================================================================
// Queue
// ============================================================================

/// One queued outbound dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedDispatch {
    pub idempotency_key: String,
    pub conversation_id: String,
    pub agent_id: String,
    pub content: String,
}

#[derive(Debug)]
struct QueuedEntry {
    dispatch: QueuedDispatch,
    attempts: u32,
}

/// Result of a flush pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Operations delivered this pass.
    pub delivered: usize,
    /// Idempotency key of the operation that exhausted its retry budget,
    /// if the flush stopped early. It remains queued.
    pub stalled: Option<String>,
}

/// FIFO queue of dispatches awaiting delivery.
#[derive(Debug, Default)]
pub struct OfflineQueue {
    entries: VecDeque<QueuedEntry>,
    policy: RetryPolicy,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            entries: VecDeque::new(),
            policy,
        }
    }

    /// Queue a dispatch, generating its idempotency key.
    pub fn enqueue(
        &mut self,
        conversation_id: impl Into<String>,
        agent_id: impl Into<String>,
        content: impl Into<String>,
    ) -> QueuedDispatch {
        let dispatch = QueuedDispatch {
            idempotency_key: format!("idem_{}", Ulid::new()),
            conversation_id: conversation_id.into(),
            agent_id: agent_id.into(),
            content: content.into(),
        };
        self.entries.push_back(QueuedEntry {
            dispatch: dispatch.clone(),
            attempts: 0,
        });
        dispatch
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys of queued operations, front first.
    pub fn pending_keys(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.dispatch.idempotency_key.clone())
            .collect()
    }

    /// Clear the attempt counter of a stalled head entry so the next flush
    /// retries it.
    pub fn reset_attempts(&mut self) {
        for entry in &mut self.entries {
            entry.attempts = 0;
        }
    }

    /// Flush queued operations in order through `send`.
    ///
    /// Each failed send backs off per the retry policy. When an operation
    /// exhausts its attempts, flushing stops so FIFO order is preserved and
    /// the operation stays queued for manual retry.
    pub async fn flush<F, Fut, T, E>(&mut self, mut send: F) -> FlushOutcome
    where
        F: FnMut(QueuedDispatch) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut delivered = 0;

        while let Some(entry) = self.entries.front_mut() {
            let key = entry.dispatch.idempotency_key.clone();

            loop {
                if entry.attempts >= self.policy.max_attempts {
                    warn!(
                        idempotency_key = %key,
                        attempts = entry.attempts,
                        "dispatch exhausted retries, leaving queued"
                    );
                    return FlushOutcome {
                        delivered,
                        stalled: Some(key),
                    };
                }

                match send(entry.dispatch.clone()).await {
                    Ok(_) => {
                        debug!(idempotency_key = %key, "queued dispatch delivered");
                        break;
                    }
                    Err(e) => {
                        let delay = self.policy.delay(entry.attempts);
                        entry.attempts += 1;
                        debug!(
                            idempotency_key = %key,
                            attempt = entry.attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "dispatch failed, backing off"
                        );
                        if entry.attempts >= self.policy.max_attempts {
                            continue;
                        }
                        tokio::time::sleep(delay).await;
                    }
                }
            }

            let _ = self.entries.pop_front();
            delivered += 1;
        }

        FlushOutcome {
            delivered,
            stalled: None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(1),
            cap: Duration::from_millis(4),
            max_attempts: 5,
        }
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(4), Duration::from_secs(16));
        // Capped from here on
        assert_eq!(policy.delay(5), Duration::from_secs(16));
        assert_eq!(policy.delay(40), Duration::from_secs(16));
    }

    #[tokio::test]
    async fn flush_delivers_in_fifo_order() {
        let mut queue = OfflineQueue::with_policy(fast_policy());
        queue.enqueue("conv_1", "claude-code", "first");
        queue.enqueue("conv_1", "claude-code", "second");
        queue.enqueue("conv_1", "claude-code", "third");

        let seen: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let outcome = queue
            .flush(|dispatch| {
                seen.lock().unwrap().push(dispatch.content.clone());
                async { Ok::<_, std::io::Error>(()) }
            })
            .await;

        assert_eq!(outcome.delivered, 3);
        assert!(outcome.stalled.is_none());
        assert!(queue.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn retries_reuse_the_same_idempotency_key() {
        let mut queue = OfflineQueue::with_policy(fast_policy());
        let queued = queue.enqueue("conv_1", "claude-code", "flaky");

        let calls = AtomicUsize::new(0);
        let keys: Mutex<Vec<String>> = Mutex::new(Vec::new());

        let outcome = queue
            .flush(|dispatch| {
                keys.lock().unwrap().push(dispatch.idempotency_key.clone());
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(std::io::Error::other("offline"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(outcome.delivered, 1);
        let keys = keys.lock().unwrap();
        assert_eq!(keys.len(), 3);
        assert!(keys.iter().all(|k| *k == queued.idempotency_key));
    }

    #[tokio::test]
    async fn exhausted_entry_stays_queued_and_blocks_later_entries() {
        let mut queue = OfflineQueue::with_policy(fast_policy());
        let dead = queue.enqueue("conv_1", "claude-code", "dead");
        queue.enqueue("conv_1", "claude-code", "behind");

        let outcome = queue
            .flush(|_| async { Err::<(), _>(std::io::Error::other("offline")) })
            .await;

        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.stalled.as_deref(), Some(dead.idempotency_key.as_str()));
        // Both entries remain, order preserved
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pending_keys()[0], dead.idempotency_key);
    }

    #[tokio::test]
    async fn manual_retry_after_reset_succeeds() {
        let mut queue = OfflineQueue::with_policy(fast_policy());
        queue.enqueue("conv_1", "claude-code", "eventually");

        let outcome = queue
            .flush(|_| async { Err::<(), _>(std::io::Error::other("offline")) })
            .await;
        assert!(outcome.stalled.is_some());

        // Without a reset, the stalled entry is not retried
        let outcome = queue
            .flush(|_| async { Ok::<_, std::io::Error>(()) })
            .await;
        assert_eq!(outcome.delivered, 0);

        queue.reset_attempts();
        let outcome = queue
            .flush(|_| async { Ok::<_, std::io::Error>(()) })
            .await;
        assert_eq!(outcome.delivered, 1);
        assert!(queue.is_empty());
    }
}
