//! The event-bus surface: `message`, `friend-event`, `group-event`
//! topics, plus the push-RPC path, both normalized to the same
//! `BusEvent` shape before reaching the Hub's dispatcher.
//!
//! The wire protocol to the platform's real bus is out of scope per the
//! spec; only the topic/key/body contract is binding. `InMemoryEventBus`
//! is the default transport -- an mpsc channel any producer (a bus
//! consumer fiber, or the push-RPC handler) can feed, grounded in the
//! reference repo's channel-centric `state.rs` registries.

use bytes::Bytes;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Message,
    FriendEvent,
    GroupEvent,
}

impl Topic {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(Topic::Message),
            "friend-event" => Some(Topic::FriendEvent),
            "group-event" => Some(Topic::GroupEvent),
            _ => None,
        }
    }
}

/// One event as received from the bus or the push-RPC endpoint.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub topic: String,
    pub key: String,
    pub body: Bytes,
}

/// Producer handle shared by bus-consumer fibers and the push-RPC handler.
#[derive(Clone)]
pub struct EventBusHandle {
    tx: mpsc::Sender<BusEvent>,
}

impl EventBusHandle {
    /// Non-blocking enqueue onto the internal event channel, per spec
    /// `push(event)`. Drops and logs if the dispatcher is saturated.
    pub fn push(&self, event: BusEvent) {
        if self.tx.try_send(event).is_err() {
            tracing::warn!("event channel full, dropping inbound event");
        }
    }
}

/// Consumer-side half, owned by the Hub's dispatcher task.
pub struct EventBusReceiver {
    rx: mpsc::Receiver<BusEvent>,
}

impl EventBusReceiver {
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }
}

/// Creates a bounded in-process event channel. `capacity` bounds how many
/// events may be queued before producers start dropping (see `push`).
pub fn channel(capacity: usize) -> (EventBusHandle, EventBusReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventBusHandle { tx }, EventBusReceiver { rx })
}
