//! Supervisor lifecycle events and their fan-out.
//!
//! Each supervisor owns one [`EventBus`]; everything it emits is also
//! mirrored onto the process-wide [`global`] bus so observers can watch
//! supervisors they did not start. Handlers run on the emit path and must
//! not block; a panicking handler is isolated so its peers still receive
//! the event.

// Layer 1: Standard library imports
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

// Layer 2: Third-party crate imports
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

// Layer 3: Internal module imports
use crate::cluster::{ExitReason, NodeId, Subscription};

/// Why a supervisor stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopReason {
    /// Stopped on request.
    Normal,

    /// The automatic-restart ceiling was breached.
    MaxRestartsExceeded,

    /// An unrecoverable internal failure.
    Error {
        /// Failure description.
        message: String,
    },
}

/// Lifecycle events published by a supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// The supervisor finished starting all declared children.
    SupervisorStarted {
        supervisor_id: String,
        node: NodeId,
    },

    /// The supervisor stopped; no further events follow.
    SupervisorStopped {
        supervisor_id: String,
        reason: StopReason,
    },

    /// A child was spawned and registered.
    ChildStarted {
        supervisor_id: String,
        child_id: String,
        node: NodeId,
    },

    /// A child left the table without a successor.
    ChildStopped {
        supervisor_id: String,
        child_id: String,
        reason: ExitReason,
    },

    /// A child was replaced by a fresh incarnation on the same node.
    ChildRestarted {
        supervisor_id: String,
        child_id: String,
        node: NodeId,
        /// The child's restart counter after this restart.
        attempt: u32,
    },

    /// A child was revived on a different node.
    ChildMigrated {
        supervisor_id: String,
        child_id: String,
        from_node: NodeId,
        to_node: NodeId,
    },

    /// A node failure was observed; the listed children are about to go
    /// through the crash-handling path.
    NodeFailureDetected {
        supervisor_id: String,
        node: NodeId,
        affected_children: Vec<String>,
    },
}

impl LifecycleEvent {
    /// The supervisor the event belongs to.
    pub fn supervisor_id(&self) -> &str {
        match self {
            LifecycleEvent::SupervisorStarted { supervisor_id, .. }
            | LifecycleEvent::SupervisorStopped { supervisor_id, .. }
            | LifecycleEvent::ChildStarted { supervisor_id, .. }
            | LifecycleEvent::ChildStopped { supervisor_id, .. }
            | LifecycleEvent::ChildRestarted { supervisor_id, .. }
            | LifecycleEvent::ChildMigrated { supervisor_id, .. }
            | LifecycleEvent::NodeFailureDetected { supervisor_id, .. } => supervisor_id,
        }
    }
}

/// Handler invoked for each lifecycle event.
pub type EventHandler = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

struct BusInner {
    subscribers: Mutex<Vec<(u64, EventHandler)>>,
    next_id: AtomicU64,
}

/// Fan-out of lifecycle events to subscribed observers.
///
/// The subscriber lock is taken only to (un)subscribe and to snapshot the
/// list; handlers run outside it, so a handler may itself subscribe or
/// unsubscribe without deadlocking.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribes a handler. Dropping the returned guard (or calling
    /// `cancel`) unsubscribes it.
    pub fn subscribe(&self, handler: EventHandler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((id, handler));
        let inner = Arc::clone(&self.inner);
        Subscription::new(move || {
            inner
                .subscribers
                .lock()
                .retain(|(sub_id, _)| *sub_id != id);
        })
    }

    /// Delivers an event to every subscriber, in subscription order.
    ///
    /// A panicking handler is contained; remaining handlers still run.
    pub fn emit(&self, event: &LifecycleEvent) {
        let handlers: Vec<EventHandler> = {
            let subscribers = self.inner.subscribers.lock();
            subscribers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(
                    supervisor_id = event.supervisor_id(),
                    "lifecycle event handler panicked; continuing with remaining handlers"
                );
            }
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

/// Process-wide aggregate bus. Every supervisor mirrors its events here.
pub fn global() -> &'static EventBus {
    static GLOBAL: OnceLock<EventBus> = OnceLock::new();
    GLOBAL.get_or_init(EventBus::new)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn started(id: &str) -> LifecycleEvent {
        LifecycleEvent::SupervisorStarted {
            supervisor_id: id.into(),
            node: NodeId::new("local"),
        }
    }

    #[test]
    fn test_subscribers_receive_events_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = Arc::clone(&seen);
        let _sub_a = bus.subscribe(Arc::new(move |e| a.lock().push(("a", e.clone()))));
        let b = Arc::clone(&seen);
        let _sub_b = bus.subscribe(Arc::new(move |e| b.lock().push(("b", e.clone()))));

        bus.emit(&started("s1"));

        let events = seen.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "a");
        assert_eq!(events[1].0, "b");
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&count);
        let sub = bus.subscribe(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        bus.emit(&started("s1"));
        sub.cancel();
        bus.emit(&started("s1"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let _bad = bus.subscribe(Arc::new(|_| panic!("handler bug")));
        let seen = Arc::clone(&count);
        let _good = bus.subscribe(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        bus.emit(&started("s1"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = LifecycleEvent::ChildMigrated {
            supervisor_id: "s1".into(),
            child_id: "w1".into(),
            from_node: NodeId::new("node-a"),
            to_node: NodeId::new("local"),
        };
        let json = serde_json::to_string(&event).unwrap_or_default();
        assert!(json.contains("child_migrated"));
        assert!(json.contains("node-a"));
    }

    #[test]
    fn test_global_bus_is_shared() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let sub = global().subscribe(Arc::new(move |e| {
            if e.supervisor_id() == "global-test" {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }));

        global().emit(&started("global-test"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        sub.cancel();
    }
}
