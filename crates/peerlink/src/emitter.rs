//! Typed observer registry

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::warn;

/// Events kept for a subscriber that has not arrived yet; the oldest are
/// dropped beyond this
pub const MAX_HELD: usize = 1024;

/// Fans events out to every subscriber.
///
/// Events emitted before anyone subscribed are held and handed to the first
/// subscriber, so errors raised during startup are not lost. At most
/// [`MAX_HELD`] events are held.
pub struct Emitter<E> {
    inner: Mutex<Inner<E>>,
}

struct Inner<E> {
    subscribers: Vec<mpsc::UnboundedSender<E>>,
    held: VecDeque<E>,
    dropped: usize,
    subscribed: bool,
}

impl<E: Clone> Emitter<E> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                held: VecDeque::new(),
                dropped: 0,
                subscribed: false,
            }),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        for event in inner.held.drain(..) {
            let _ = tx.send(event);
        }
        inner.subscribed = true;
        inner.subscribers.push(tx);
        rx
    }

    pub fn emit(&self, event: E) {
        let mut inner = self.inner.lock();
        if !inner.subscribed {
            if inner.held.len() == MAX_HELD {
                inner.held.pop_front();
                inner.dropped += 1;
                if inner.dropped == 1 {
                    warn!(limit = MAX_HELD, "no subscriber, dropping oldest held events");
                }
            }
            inner.held.push_back(event);
            return;
        }
        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

impl<E: Clone> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_held_until_first_subscriber() {
        let emitter = Emitter::new();
        emitter.emit(1);
        emitter.emit(2);

        let mut first = emitter.subscribe();
        emitter.emit(3);
        let mut second = emitter.subscribe();
        emitter.emit(4);

        assert_eq!(first.try_recv().ok(), Some(1));
        assert_eq!(first.try_recv().ok(), Some(2));
        assert_eq!(first.try_recv().ok(), Some(3));
        assert_eq!(first.try_recv().ok(), Some(4));
        assert_eq!(second.try_recv().ok(), Some(4));
        assert!(second.try_recv().is_err());
    }

    #[test]
    fn test_held_events_are_bounded() {
        let emitter = Emitter::new();
        for n in 0..MAX_HELD + 5 {
            emitter.emit(n);
        }

        let mut rx = emitter.subscribe();
        let mut got = Vec::new();
        while let Ok(n) = rx.try_recv() {
            got.push(n);
        }
        assert_eq!(got.len(), MAX_HELD);
        assert_eq!(got.first(), Some(&5));
        assert_eq!(got.last(), Some(&(MAX_HELD + 4)));
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let emitter = Emitter::new();
        let rx = emitter.subscribe();
        let _keep = emitter.subscribe();
        drop(rx);
        emitter.emit("x");
        assert_eq!(emitter.subscriber_count(), 1);
    }
}
