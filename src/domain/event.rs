//! Typed event bus: `domain.*`, `process.*`, `service.*`, `task.*`
//! categories, forwarded to subscribers over non-blocking sends.
//!
//! Grounded on the teacher crate's `coordination::ResultAggregator`
//! (`Arc<Mutex<Vec<_>>>` accumulation pattern in `src/coordination.rs`)
//! for the in-process fan-out shape, generalized from "collect results"
//! to "broadcast one event to N subscribers, dropping dead ones
//! silently" per §4.3. A single domain process is single-threaded per
//! §5, so subscribers are plain closures rather than separate tasks;
//! cross-process delivery (to an actual server or gateway) happens by a
//! handler publishing a framed message through `transport`, outside this
//! module's scope.

use crate::ids::ProcessHandle;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Domain(DomainEvent),
    Process(ProcessEvent),
    Service(ServiceEvent),
    Task(TaskEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    BootBegin,
    BootComplete,
    ShutdownBegin,
    ShutdownComplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProcessEvent {
    Spawn { alias: String, handle: ProcessHandle },
    Exit { alias: String, handle: ProcessHandle, exit_code: Option<i32> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceEvent {
    Call {
        service: String,
        process: ProcessHandle,
        duration_micros: u64,
        pending_micros: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskEvent {
    Done { task_id: crate::ids::CorrelationId },
}

/// A subscriber's category filter; events outside it are never passed to
/// the closure. `All` is the common case for the orchestrator's own
/// internal subscribers (e.g. a CLI session watching boot progress).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    All,
    Domain,
    Process,
    Service,
    Task,
}

impl Category {
    fn matches(self, event: &Event) -> bool {
        match (self, event) {
            (Category::All, _) => true,
            (Category::Domain, Event::Domain(_)) => true,
            (Category::Process, Event::Process(_)) => true,
            (Category::Service, Event::Service(_)) => true,
            (Category::Task, Event::Task(_)) => true,
            _ => false,
        }
    }
}

type Subscriber = Box<dyn FnMut(&Event) -> bool + Send>;

struct Subscription {
    category: Category,
    subscriber: Subscriber,
}

/// In-process event bus. A subscriber closure returns `false` to signal
/// it is dead and should be dropped silently on the next publish, per
/// §4.3's "dead subscribers are dropped silently".
#[derive(Default)]
pub struct EventBus {
    subscriptions: Vec<Subscription>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, category: Category, subscriber: Subscriber) {
        self.subscriptions.push(Subscription { category, subscriber });
    }

    pub fn publish(&mut self, event: Event) {
        self.subscriptions.retain_mut(|subscription| {
            if subscription.category.matches(&event) {
                (subscription.subscriber)(&event)
            } else {
                true
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn subscribers_only_see_their_category() {
        let seen = Arc::new(Mutex::new(0));
        let seen_clone = seen.clone();

        let mut bus = EventBus::new();
        bus.subscribe(
            Category::Process,
            Box::new(move |_event| {
                *seen_clone.lock().unwrap() += 1;
                true
            }),
        );

        bus.publish(Event::Domain(DomainEvent::BootBegin));
        assert_eq!(*seen.lock().unwrap(), 0);

        bus.publish(Event::Process(ProcessEvent::Exit {
            alias: "ECHO".into(),
            handle: ProcessHandle::new(1, crate::ids::IpcId::new()),
            exit_code: Some(0),
        }));
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn dead_subscriber_is_dropped_after_returning_false() {
        let mut bus = EventBus::new();
        bus.subscribe(Category::All, Box::new(|_event| false));
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(Event::Domain(DomainEvent::BootComplete));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
