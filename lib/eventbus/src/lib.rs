//  LIB.rs
//    by Bas Kloosterman
//
//  Description:
//!   Implements the Event Bus: a priority-ordered publish-subscribe
//!   structure, plus the Re-Evaluation Engine it drives (§4.6).
//

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use model::{WorkflowEvent, WorkflowEventType};

pub mod re_evaluation;

pub use re_evaluation::{apply_action, re_evaluate};

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &WorkflowEvent);
}

struct QueuedEvent {
    event: WorkflowEvent,
    seq: u64,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool { self.event.priority == other.event.priority && self.seq == other.seq }
}
impl Eq for QueuedEvent {}
impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl Ord for QueuedEvent {
    /// `BinaryHeap` is a max-heap: higher [`model::EventPriority`] (declared
    /// ascending Low..Critical, so `Critical` sorts greatest) pops first;
    /// within a priority, the *earlier* sequence number must pop first, so
    /// sequence comparison is reversed.
    fn cmp(&self, other: &Self) -> Ordering {
        self.event.priority.cmp(&other.event.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority-ordered pub-sub bus (§4.6). `publish` is synchronous and returns
/// immediately after enqueueing; delivery happens when a caller drains the
/// queue via [`EventBus::dispatch_pending`].
pub struct EventBus {
    queue: Mutex<BinaryHeap<QueuedEvent>>,
    subscribers: Mutex<HashMap<WorkflowEventType, Vec<Arc<dyn EventHandler>>>>,
    next_seq: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self { Self { queue: Mutex::new(BinaryHeap::new()), subscribers: Mutex::new(HashMap::new()), next_seq: AtomicU64::new(0) } }

    pub fn subscribe(&self, event_type: WorkflowEventType, handler: Arc<dyn EventHandler>) {
        let mut subscribers = self.subscribers.lock().expect("event bus subscriber lock poisoned");
        subscribers.entry(event_type).or_default().push(handler);
    }

    pub fn publish(&self, event: WorkflowEvent) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
        let mut queue = self.queue.lock().expect("event bus queue lock poisoned");
        queue.push(QueuedEvent { event, seq });
    }

    pub fn pending_count(&self) -> usize { self.queue.lock().expect("event bus queue lock poisoned").len() }

    /// Drains the queue in priority order (ties broken by submission order),
    /// invoking every subscriber registered for each event's type. Delivery
    /// is at-least-once per process: a handler that panics or the process
    /// restarting before this call completes may redeliver; handlers are
    /// expected to dedupe on `event.event_id`.
    pub async fn dispatch_pending(&self) -> usize {
        let mut dispatched = 0;
        loop {
            let next = {
                let mut queue = self.queue.lock().expect("event bus queue lock poisoned");
                queue.pop()
            };
            let Some(queued) = next else { break };

            let handlers: Vec<Arc<dyn EventHandler>> = {
                let subscribers = self.subscribers.lock().expect("event bus subscriber lock poisoned");
                subscribers.get(&queued.event.event_type).cloned().unwrap_or_default()
            };
            for handler in handlers {
                handler.handle(&queued.event).await;
            }
            dispatched += 1;
        }
        dispatched
    }
}

impl Default for EventBus {
    fn default() -> Self { Self::new() }
}
