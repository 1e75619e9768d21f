//! Subscriber lists for component notifications
//!
//! A [`Signal`] delivers each emitted value to its connected slots in
//! connection order, then to every channel handed out by
//! [`Signal::subscribe`]. Slots run on the emitter's queue; a slot that
//! needs its own context enqueues onto its own [`Dispatcher`](crate::Dispatcher).

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slots<T> {
    next_id: u64,
    slots: Vec<(u64, Slot<T>)>,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
}

pub struct Signal<T> {
    inner: Arc<Mutex<Slots<T>>>,
}

impl<T: Clone + Send + 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slots {
                next_id: 0,
                slots: Vec::new(),
                subscribers: Vec::new(),
            })),
        }
    }

    /// Attach a callback; it stays attached until the returned
    /// [`Connection`] is explicitly disconnected
    pub fn connect<F>(&self, slot: F) -> Connection
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.slots.push((id, Arc::new(slot)));
            id
        };

        let weak: Weak<Mutex<Slots<T>>> = Arc::downgrade(&self.inner);
        Connection::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().slots.retain(|(slot_id, _)| *slot_id != id);
            }
        })
    }

    /// Receive every future emission on a channel
    ///
    /// The subscription ends when the receiver is dropped.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    pub fn emit(&self, value: &T) {
        // Slots may connect or disconnect while running.
        let slots: Vec<Slot<T>> = self
            .inner
            .lock()
            .slots
            .iter()
            .map(|(_, slot)| Arc::clone(slot))
            .collect();
        for slot in slots {
            slot(value);
        }

        self.inner
            .lock()
            .subscribers
            .retain(|tx| tx.send(value.clone()).is_ok());
    }

    pub fn slot_count(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

impl<T: Clone + Send + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Link between a [`Signal`] and one connected slot
pub struct Connection {
    disconnect: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Connection {
    fn new<F: FnOnce() + Send + 'static>(disconnect: F) -> Self {
        Self {
            disconnect: Mutex::new(Some(Box::new(disconnect))),
        }
    }

    /// Detach the slot; later emissions no longer reach it
    pub fn disconnect(&self) {
        if let Some(disconnect) = self.disconnect.lock().take() {
            disconnect();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.disconnect.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_slots_receive_in_order() {
        let signal: Signal<u32> = Signal::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let a = Arc::clone(&log);
        let _c1 = signal.connect(move |v| a.lock().push(("a", *v)));
        let b = Arc::clone(&log);
        let _c2 = signal.connect(move |v| b.lock().push(("b", *v)));

        signal.emit(&1);
        signal.emit(&2);
        assert_eq!(*log.lock(), vec![("a", 1), ("b", 1), ("a", 2), ("b", 2)]);
    }

    #[test]
    fn test_disconnect() {
        let signal: Signal<()> = Signal::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let connection = signal.connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        signal.emit(&());
        connection.disconnect();
        assert!(!connection.is_connected());
        signal.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(signal.slot_count(), 0);
    }

    #[test]
    fn test_disconnect_after_signal_dropped() {
        let signal: Signal<()> = Signal::new();
        let connection = signal.connect(|_| {});
        drop(signal);
        connection.disconnect();
    }

    #[test]
    fn test_subscribe_and_prune() {
        let signal: Signal<&'static str> = Signal::new();
        let mut rx = signal.subscribe();
        let dropped = signal.subscribe();
        drop(dropped);

        signal.emit(&"hello");
        assert_eq!(rx.try_recv().unwrap(), "hello");
        assert_eq!(signal.inner.lock().subscribers.len(), 1);
    }
}
