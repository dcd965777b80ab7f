//! Progress event broadcasting.
//!
//! Each subscriber owns a bounded queue. Publishing never blocks the
//! download path: when a subscriber's queue is full the oldest
//! non-terminal event is evicted to make room. Terminal events
//! (completed, failed, cancelled) are never dropped, so a slow consumer
//! always learns the final state of every task even if it misses
//! intermediate progress.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::task::{TaskId, TaskStatus};

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A single progress or state-change event for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub resource_name: String,
    pub status: TaskStatus,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub progress_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

struct SubscriberQueue {
    events: Mutex<VecDeque<TaskEvent>>,
    notify: Notify,
    closed: AtomicBool,
}

struct Shared {
    subscribers: Mutex<Vec<(u64, Arc<SubscriberQueue>)>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// Fan-out publisher for task events.
#[derive(Clone)]
pub struct EventBroadcaster {
    shared: Arc<Shared>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Register a new subscriber. Events published before this call are
    /// not replayed.
    pub fn subscribe(&self) -> EventSubscriber {
        let queue = Arc::new(SubscriberQueue {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.subscribers.lock().push((id, Arc::clone(&queue)));
        EventSubscriber {
            id,
            queue,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Deliver an event to every live subscriber without blocking.
    pub fn publish(&self, event: TaskEvent) {
        let subscribers = self.shared.subscribers.lock();
        for (_, queue) in subscribers.iter() {
            let mut events = queue.events.lock();
            if events.len() >= self.shared.capacity {
                // Evict the oldest non-terminal event. If the buffer is
                // all terminal events, a non-terminal newcomer is the
                // one that gets dropped instead.
                match events.iter().position(|e| !e.is_terminal()) {
                    Some(idx) => {
                        let _ = events.remove(idx);
                    }
                    None if !event.is_terminal() => continue,
                    // A terminal event may briefly exceed capacity.
                    None => {}
                }
            }
            events.push_back(event.clone());
            drop(events);
            queue.notify.notify_one();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().len()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// Receiving half of a subscription. Dropping it unregisters the
/// subscriber.
pub struct EventSubscriber {
    id: u64,
    queue: Arc<SubscriberQueue>,
    shared: Arc<Shared>,
}

impl EventSubscriber {
    /// Wait for the next event. Returns `None` once the subscription is
    /// closed and drained.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        loop {
            if let Some(event) = self.queue.events.lock().pop_front() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Take the next event if one is immediately available.
    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        self.queue.events.lock().pop_front()
    }

    /// Number of events currently buffered.
    pub fn len(&self) -> usize {
        self.queue.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        self.shared.subscribers.lock().retain(|(id, _)| *id != self.id);
        self.queue.closed.store(true, Ordering::Release);
    }
}
