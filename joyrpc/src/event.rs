use crate::url::Url;

/// Observable lifecycle events emitted by invokers and their clusters.
///
/// Delivered over a lossy broadcast channel; consumers that lag drop events
/// rather than slow the runtime down.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Opened,
    Closed,
    NodeAdded(Url),
    NodeRemoved(Url),
    NodeDead(Url),
    RegistryDown,
    RegistryUp,
}

pub type EventSender = tokio::sync::broadcast::Sender<Event>;
pub type EventReceiver = tokio::sync::broadcast::Receiver<Event>;

pub(crate) fn channel() -> EventSender {
    tokio::sync::broadcast::channel(64).0
}

/// Drains everything currently buffered on a receiver. Test and metrics aid.
#[must_use]
pub fn drain_events(receiver: &mut EventReceiver) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}
