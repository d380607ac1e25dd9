//! Typed broadcast event streams
//!
//! Every component owns an `EventBus` for its own event enum. Each
//! subscriber gets a private crossbeam channel, so delivery is FIFO per
//! subscriber and a slow subscriber never blocks the emitter. Channels
//! are bounded; events for a full subscriber are dropped and counted.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Events queued per subscriber before further ones are dropped
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Event with a stable wire name
pub trait NamedEvent {
    fn name(&self) -> &'static str;
}

struct Subscriber<E> {
    id: u64,
    tx: Sender<E>,
}

/// Broadcast bus
pub struct EventBus<E> {
    subscribers: Mutex<Vec<Subscriber<E>>>,
    capacity: usize,
    next_id: AtomicU64,
    emitted: AtomicU64,
    lagged: AtomicU64,
}

impl<E: Clone + Send> EventBus<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Bus whose subscribers each queue at most `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            emitted: AtomicU64::new(0),
            lagged: AtomicU64::new(0),
        }
    }

    /// Attach a new subscriber
    ///
    /// Events emitted before this call are not replayed.
    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = channel::bounded(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Subscriber { id, tx });
        Subscription { id, rx }
    }

    /// Deliver an event to every live subscriber
    ///
    /// Subscribers whose handle was dropped are pruned here. A subscriber
    /// with a full queue misses this event.
    pub fn emit(&self, event: E) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subscribers.lock();
        if subs.is_empty() {
            return;
        }
        let mut lagged = 0u64;
        subs.retain(|s| match s.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                lagged += 1;
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        if lagged > 0 {
            self.lagged.fetch_add(lagged, Ordering::Relaxed);
        }
    }

    /// Number of attached subscribers (including ones not yet pruned)
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Total events emitted since creation
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Deliveries dropped because a subscriber queue was full
    pub fn lagged(&self) -> u64 {
        self.lagged.load(Ordering::Relaxed)
    }

    /// Explicitly detach a subscriber by id
    pub fn detach(&self, id: u64) {
        self.subscribers.lock().retain(|s| s.id != id);
    }
}

impl<E: Clone + Send> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a subscription; dropping it detaches
pub struct Subscription<E> {
    id: u64,
    rx: Receiver<E>,
}

impl<E> Subscription<E> {
    /// Subscriber id, usable with [`EventBus::detach`]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event if one is queued
    pub fn try_recv(&self) -> Option<E> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for the next event
    pub fn recv_timeout(&self, timeout: Duration) -> Option<E> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Everything queued so far, in delivery order
    pub fn drain(&self) -> Vec<E> {
        self.rx.try_iter().collect()
    }

    /// Number of queued events
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Ping {
        A(u32),
        B,
    }

    impl NamedEvent for Ping {
        fn name(&self) -> &'static str {
            match self {
                Ping::A(_) => "a",
                Ping::B => "b",
            }
        }
    }

    #[test]
    fn test_fifo_per_subscriber() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        for i in 0..5 {
            bus.emit(Ping::A(i));
        }
        bus.emit(Ping::B);

        let events = sub.drain();
        assert_eq!(events.len(), 6);
        assert_eq!(events[0], Ping::A(0));
        assert_eq!(events[4], Ping::A(4));
        assert_eq!(events[5].name(), "b");
    }

    #[test]
    fn test_broadcast_to_all() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.emit(Ping::B);
        assert_eq!(a.try_recv(), Some(Ping::B));
        assert_eq!(b.try_recv(), Some(Ping::B));
        assert_eq!(a.try_recv(), None);
    }

    #[test]
    fn test_drop_detaches() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        {
            let _gone = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 2);
        }
        bus.emit(Ping::B);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(keep.pending(), 1);
    }

    #[test]
    fn test_undrained_subscriber_is_capped() {
        let bus = EventBus::with_capacity(8);
        let slow = bus.subscribe();
        let fast = bus.subscribe();
        for i in 0..100 {
            bus.emit(Ping::A(i));
            assert_eq!(fast.try_recv(), Some(Ping::A(i)));
        }
        assert_eq!(slow.pending(), 8);
        assert_eq!(bus.lagged(), 92);
        assert_eq!(bus.subscriber_count(), 2);

        // Oldest events are kept, later ones were dropped
        let kept = slow.drain();
        assert_eq!(kept.first(), Some(&Ping::A(0)));
        assert_eq!(kept.last(), Some(&Ping::A(7)));

        bus.emit(Ping::B);
        assert_eq!(slow.try_recv(), Some(Ping::B));
    }

    #[test]
    fn test_explicit_detach() {
        let bus: EventBus<Ping> = EventBus::new();
        let sub = bus.subscribe();
        bus.detach(sub.id());
        bus.emit(Ping::B);
        assert_eq!(sub.try_recv(), None);
        assert_eq!(bus.emitted(), 1);
    }
}
