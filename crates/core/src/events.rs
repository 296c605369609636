//! Event System
//!
//! Pub/sub bus for lifecycle progress. The orchestrator emits an event for
//! every state transition and milestone; the CLI subscribes to print a
//! per-device timeline.

use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use tracing::trace;

use crate::lifecycle::LifecycleState;

/// Events emitted by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A device moved to a new lifecycle state
    StateChanged {
        device: String,
        from: LifecycleState,
        to: LifecycleState,
    },
    /// The emulator process was started
    EmulatorSpawned {
        device: String,
        serial: String,
        pid: Option<u32>,
    },
    /// The device finished booting
    DeviceReady {
        device: String,
        serial: String,
        elapsed: Duration,
    },
    PackageInstalled { device: String, package: String },
    ActivityLaunched {
        device: String,
        component: String,
        pid: Option<u32>,
    },
    /// A lifecycle step failed
    StepFailed {
        device: String,
        operation: String,
        kind: &'static str,
        message: String,
    },
    /// The emulator process is gone
    EmulatorStopped { device: String, serial: String },
}

impl Event {
    /// Identifier of the device the event concerns
    pub fn device(&self) -> &str {
        match self {
            Event::StateChanged { device, .. }
            | Event::EmulatorSpawned { device, .. }
            | Event::DeviceReady { device, .. }
            | Event::PackageInstalled { device, .. }
            | Event::ActivityLaunched { device, .. }
            | Event::StepFailed { device, .. }
            | Event::EmulatorStopped { device, .. } => device,
        }
    }
}

/// Subscriber handle for receiving events
#[derive(Clone)]
pub struct EventSubscription {
    receiver: Receiver<Event>,
}

impl EventSubscription {
    /// Receive the next event (blocking)
    pub fn recv(&self) -> Result<Event, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&self) -> Result<Event, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// All events received so far, without blocking
    pub fn drain(&self) -> Vec<Event> {
        self.receiver.try_iter().collect()
    }

    /// Get an iterator over events
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.receiver.iter()
    }
}

/// Event bus for publish/subscribe pattern
pub struct EventBus {
    subscribers: RwLock<Vec<Sender<Event>>>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> EventSubscription {
        let (sender, receiver) = unbounded();
        self.subscribers.write().push(sender);
        EventSubscription { receiver }
    }

    /// Emit an event to all subscribers, dropping the ones that went away
    pub fn emit(&self, event: Event) -> usize {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());

        trace!("Event {:?} delivered to {} subscribers", event, subscribers.len());
        subscribers.len()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed() -> Event {
        Event::PackageInstalled {
            device: "emulator-1".into(),
            package: "apk-1".into(),
        }
    }

    #[test]
    fn test_event_bus() {
        let bus = EventBus::new();
        let sub1 = bus.subscribe();
        let sub2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        let delivered = bus.emit(installed());
        assert_eq!(delivered, 2);

        assert_eq!(sub1.try_recv().unwrap().device(), "emulator-1");
        assert!(sub2.try_recv().is_ok());
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        assert_eq!(bus.emit(installed()), 1);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.drain(), vec![installed()]);
    }
}
