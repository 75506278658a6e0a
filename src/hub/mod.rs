//! Fan-out of streaming and lifecycle events to conversation subscribers.
//!
//! One agent run feeds any number of subscribers: the originating browser
//! tab, other tabs, and other clients on the same conversation. Delivery is
//! best-effort in-memory with bounded per-subscriber buffers; when a buffer
//! fills, the oldest `stream` chunk is evicted first — lifecycle events are
//! never dropped. Reconnecting clients call [`SyncHub::resume`] to learn
//! whether to attach to a live stream, replay a finished response, or show a
//! terminal error.

mod queue;

pub use queue::{FlushOutcome, OfflineQueue, QueuedDispatch, RetryPolicy};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::warn;

use crate::api::{ResumeOutcome, StreamEvent};
use crate::store::{SessionStatus, Store, StoreResult};

// ============================================================================
// Constants
// ============================================================================

/// Default per-subscriber buffer size before stream chunks are evicted.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

// ============================================================================
// Subscriber Queue
// ============================================================================

struct SubscriberQueue {
    events: Mutex<VecDeque<StreamEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an event, evicting the oldest stream chunk when full.
    /// Lifecycle events always land; an incoming chunk that cannot displace
    /// anything is dropped. Returns false when the incoming event was dropped.
    fn push(&self, event: StreamEvent) -> bool {
        let mut events = self.events.lock().expect("subscriber queue poisoned");
        if events.len() >= self.capacity {
            if let Some(oldest_chunk) = events.iter().position(StreamEvent::is_stream) {
                let _ = events.remove(oldest_chunk);
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            } else if event.is_stream() {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        events.push_back(event);
        drop(events);
        self.notify.notify_one();
        true
    }

    fn pop(&self) -> Option<StreamEvent> {
        self.events
            .lock()
            .expect("subscriber queue poisoned")
            .pop_front()
    }
}

struct SubscriberSlot {
    id: u64,
    queue: Arc<SubscriberQueue>,
}

// ============================================================================
// Subscription
// ============================================================================

/// A subscriber's ordered event channel. Dropping it releases the buffer.
pub struct Subscription {
    id: u64,
    conversation_id: Option<String>,
    queue: Arc<SubscriberQueue>,
    hub: SyncHub,
}

impl Subscription {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> StreamEvent {
        loop {
            if let Some(event) = self.queue.pop() {
                return event;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.queue.pop()
    }

    /// Number of stream chunks this subscriber has missed due to a full buffer.
    pub fn dropped_chunks(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.conversation_id.as_deref(), self.id);
    }
}

// ============================================================================
// SyncHub
// ============================================================================

/// Single-process publish/subscribe surface keyed by conversation id.
#[derive(Clone)]
pub struct SyncHub {
    store: Store,
    subscribers: Arc<DashMap<String, Vec<SubscriberSlot>>>,
    global: Arc<Mutex<Vec<SubscriberSlot>>>,
    next_id: Arc<AtomicU64>,
    buffer_capacity: usize,
}

impl SyncHub {
    pub fn new(store: Store) -> Self {
        Self::with_buffer(store, DEFAULT_SUBSCRIBER_BUFFER)
    }

    pub fn with_buffer(store: Store, buffer_capacity: usize) -> Self {
        Self {
            store,
            subscribers: Arc::new(DashMap::new()),
            global: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            buffer_capacity,
        }
    }

    // ------------------------------------------------------------------------
    // Publish
    // ------------------------------------------------------------------------

    /// Deliver an event to all subscribers of its conversation, and — for
    /// lifecycle events — to the global channel for sidebar updates.
    pub fn publish(&self, event: StreamEvent) {
        let conversation_id = event.conversation_id().to_string();

        if let Some(slots) = self.subscribers.get(&conversation_id) {
            for slot in slots.iter() {
                if !slot.queue.push(event.clone()) {
                    warn!(
                        conversation_id = %conversation_id,
                        subscriber = slot.id,
                        "subscriber buffer full, dropped stream chunk"
                    );
                }
            }
        }

        if !event.is_stream() {
            let global = self.global.lock().expect("global subscribers poisoned");
            for slot in global.iter() {
                let _ = slot.queue.push(event.clone());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Subscribe
    // ------------------------------------------------------------------------

    /// Subscribe to one conversation's events (including stream chunks).
    pub fn subscribe(&self, conversation_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(self.buffer_capacity));
        self.subscribers
            .entry(conversation_id.to_string())
            .or_default()
            .push(SubscriberSlot {
                id,
                queue: queue.clone(),
            });
        Subscription {
            id,
            conversation_id: Some(conversation_id.to_string()),
            queue,
            hub: self.clone(),
        }
    }

    /// Subscribe to lifecycle events across all conversations.
    pub fn subscribe_global(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(self.buffer_capacity));
        self.global
            .lock()
            .expect("global subscribers poisoned")
            .push(SubscriberSlot {
                id,
                queue: queue.clone(),
            });
        Subscription {
            id,
            conversation_id: None,
            queue,
            hub: self.clone(),
        }
    }

    fn unsubscribe(&self, conversation_id: Option<&str>, id: u64) {
        match conversation_id {
            Some(conversation_id) => {
                if let Some(mut slots) = self.subscribers.get_mut(conversation_id) {
                    slots.retain(|slot| slot.id != id);
                    if slots.is_empty() {
                        drop(slots);
                        self.subscribers
                            .remove_if(conversation_id, |_, slots| slots.is_empty());
                    }
                }
            }
            None => {
                self.global
                    .lock()
                    .expect("global subscribers poisoned")
                    .retain(|slot| slot.id != id);
            }
        }
    }

    /// Number of live subscribers for a conversation.
    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.subscribers
            .get(conversation_id)
            .map(|slots| slots.len())
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------------
    // Resumption
    // ------------------------------------------------------------------------

    /// Work out what a reconnecting client should do, from the canonical
    /// store state of the conversation's latest session.
    pub fn resume(&self, conversation_id: &str) -> StoreResult<ResumeOutcome> {
        let Some(session) = self.store.latest_session(conversation_id)? else {
            return Ok(ResumeOutcome::Idle);
        };

        Ok(match session.status {
            SessionStatus::Pending | SessionStatus::Processing => {
                ResumeOutcome::Attach { session }
            }
            SessionStatus::Completed => ResumeOutcome::Replay { session },
            SessionStatus::Error | SessionStatus::Timeout | SessionStatus::Cancelled => {
                ResumeOutcome::Terminal { session }
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
