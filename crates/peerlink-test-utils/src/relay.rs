//! In-process signaling relay

use async_trait::async_trait;
use parking_lot::Mutex;
use peerlink_core::{MessageType, SignalMessage};
use peerlink_transport::{Relay, SignalEvent, SignalLink, TransportError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A relay hub living in the test process.
///
/// Links register under their id on `start` and get `OPEN` back (or
/// `ID-TAKEN`). Messages are stamped with the sender id and routed by
/// `dst`; an `OFFER` to an unknown peer is answered with `EXPIRE`.
/// Clones share the same hub.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    hub: Arc<Hub>,
}

#[derive(Default)]
struct Hub {
    state: Mutex<HubState>,
    next_link: AtomicU64,
    next_id: AtomicU64,
}

#[derive(Default)]
struct HubState {
    links: HashMap<String, Registered>,
    log: Vec<SignalMessage>,
    held_kinds: HashSet<MessageType>,
    held: Vec<SignalMessage>,
    listing_disabled: bool,
    leave_on_close: bool,
}

struct Registered {
    link: u64,
    events: mpsc::UnboundedSender<SignalEvent>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tell the other peers with `LEAVE` when a link closes
    pub fn leave_on_close(&self, enabled: bool) {
        self.hub.state.lock().leave_on_close = enabled;
    }

    /// Make `list_peers` fail like a relay with listing turned off
    pub fn disable_listing(&self) {
        self.hub.state.lock().listing_disabled = true;
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.hub.state.lock().links.contains_key(id)
    }

    /// Every message routed so far, in order
    pub fn messages(&self) -> Vec<SignalMessage> {
        self.hub.state.lock().log.clone()
    }

    pub fn count(&self, kind: MessageType) -> usize {
        self.hub
            .state
            .lock()
            .log
            .iter()
            .filter(|m| m.kind == kind)
            .count()
    }

    /// Stop delivering messages of `kind` until [`release`](Self::release)
    pub fn hold(&self, kind: MessageType) {
        self.hub.state.lock().held_kinds.insert(kind);
    }

    /// Deliver held messages of `kind` in their original order
    pub fn release(&self, kind: MessageType) {
        let released: Vec<SignalMessage> = {
            let mut state = self.hub.state.lock();
            state.held_kinds.remove(&kind);
            let (out, keep): (Vec<_>, Vec<_>) =
                state.held.drain(..).partition(|m| m.kind == kind);
            state.held = keep;
            out
        };
        for message in released {
            self.hub.deliver(message);
        }
    }

    /// Hand `message` to the link registered as `id`
    pub fn inject(&self, id: &str, message: SignalMessage) -> bool {
        self.raise(id, SignalEvent::Message(message))
    }

    /// Simulate the link of `id` dropping
    pub fn drop_link(&self, id: &str) -> bool {
        self.raise(id, SignalEvent::Disconnected)
    }

    /// Simulate the relay closing the link of `id`
    pub fn close_link(&self, id: &str) -> bool {
        self.raise(id, SignalEvent::Close)
    }

    fn raise(&self, id: &str, event: SignalEvent) -> bool {
        let state = self.hub.state.lock();
        state
            .links
            .get(id)
            .is_some_and(|r| r.events.send(event).is_ok())
    }
}

impl Hub {
    fn register(&self, link: u64, id: &str, events: &mpsc::UnboundedSender<SignalEvent>) -> bool {
        let mut state = self.state.lock();
        if let Some(existing) = state.links.get(id) {
            if existing.link != link && !existing.events.is_closed() {
                return false;
            }
        }
        state.links.insert(
            id.to_string(),
            Registered {
                link,
                events: events.clone(),
            },
        );
        true
    }

    fn unregister(&self, link: u64, id: &str) {
        let leave = {
            let mut state = self.state.lock();
            if !state.links.get(id).is_some_and(|r| r.link == link) {
                return;
            }
            state.links.remove(id);
            state.leave_on_close
        };
        if leave {
            let others: Vec<_> = self
                .state
                .lock()
                .links
                .values()
                .map(|r| r.events.clone())
                .collect();
            for events in others {
                let mut message = SignalMessage::new(MessageType::Leave);
                message.src = Some(id.to_string());
                let _ = events.send(SignalEvent::Message(message));
            }
        }
    }

    fn route(&self, from: &str, mut message: SignalMessage) {
        message.src = Some(from.to_string());
        {
            let mut state = self.state.lock();
            state.log.push(message.clone());
            if state.held_kinds.contains(&message.kind) {
                state.held.push(message);
                return;
            }
        }
        self.deliver(message);
    }

    fn deliver(&self, message: SignalMessage) {
        let state = self.state.lock();
        let Some(dst) = message.dst.clone() else {
            return;
        };
        match state.links.get(&dst) {
            Some(target) => {
                let _ = target.events.send(SignalEvent::Message(message));
            }
            None if message.kind == MessageType::Offer => {
                let Some(src) = message.src.as_deref() else {
                    return;
                };
                if let Some(sender) = state.links.get(src) {
                    let mut expire = SignalMessage::new(MessageType::Expire);
                    expire.src = Some(dst);
                    let _ = sender.events.send(SignalEvent::Message(expire));
                }
            }
            None => {}
        }
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    fn open_link(&self, events: mpsc::UnboundedSender<SignalEvent>) -> Box<dyn SignalLink> {
        Box::new(MemoryLink {
            hub: self.hub.clone(),
            link: self.hub.next_link.fetch_add(1, Ordering::SeqCst),
            events,
            id: Mutex::new(None),
            queue: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    async fn retrieve_id(&self) -> Result<String, TransportError> {
        Ok(format!("peer{}", self.hub.next_id.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn list_peers(&self) -> Result<Vec<String>, TransportError> {
        let state = self.hub.state.lock();
        if state.listing_disabled {
            return Err(TransportError::HttpStatus(401));
        }
        let mut peers: Vec<String> = state.links.keys().cloned().collect();
        peers.sort();
        Ok(peers)
    }
}

struct MemoryLink {
    hub: Arc<Hub>,
    link: u64,
    events: mpsc::UnboundedSender<SignalEvent>,
    id: Mutex<Option<String>>,
    queue: Mutex<Vec<SignalMessage>>,
    closed: AtomicBool,
}

impl SignalLink for MemoryLink {
    fn start(&self, id: &str, _token: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if !self.hub.register(self.link, id, &self.events) {
            let _ = self
                .events
                .send(SignalEvent::Message(SignalMessage::new(MessageType::IdTaken)));
            return;
        }
        *self.id.lock() = Some(id.to_string());
        let _ = self
            .events
            .send(SignalEvent::Message(SignalMessage::new(MessageType::Open)));

        let queued: Vec<SignalMessage> = self.queue.lock().drain(..).collect();
        for message in queued {
            self.hub.route(id, message);
        }
    }

    fn send(&self, message: SignalMessage) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let id = self.id.lock().clone();
        match id {
            Some(id) => self.hub.route(&id, message),
            None => self.queue.lock().push(message),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(id) = self.id.lock().take() {
            self.hub.unregister(self.link, &id);
        }
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn recv(rx: &mut mpsc::UnboundedReceiver<SignalEvent>) -> Option<SignalEvent> {
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .ok()
            .flatten()
    }

    fn message(kind: MessageType, dst: &str) -> SignalMessage {
        let mut m = SignalMessage::new(kind);
        m.dst = Some(dst.to_string());
        m
    }

    #[tokio::test]
    async fn test_open_and_duplicate_id() {
        let relay = MemoryRelay::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = relay.open_link(tx_a);
        let b = relay.open_link(tx_b);

        a.start("alice", "t");
        b.start("alice", "t");

        match recv(&mut rx_a).await {
            Some(SignalEvent::Message(m)) => assert_eq!(m.kind, MessageType::Open),
            other => panic!("unexpected {:?}", other),
        }
        match recv(&mut rx_b).await {
            Some(SignalEvent::Message(m)) => assert_eq!(m.kind, MessageType::IdTaken),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_queued_until_start_and_src_stamped() {
        let relay = MemoryRelay::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = relay.open_link(tx_a);
        let b = relay.open_link(tx_b);
        b.start("bob", "t");
        let _ = recv(&mut rx_b).await;

        a.send(message(MessageType::Candidate, "bob"));
        assert_eq!(relay.count(MessageType::Candidate), 0);
        a.start("alice", "t");

        match recv(&mut rx_b).await {
            Some(SignalEvent::Message(m)) => {
                assert_eq!(m.kind, MessageType::Candidate);
                assert_eq!(m.src.as_deref(), Some("alice"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offer_to_unknown_peer_expires() {
        let relay = MemoryRelay::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = relay.open_link(tx);
        a.start("alice", "t");
        let _ = recv(&mut rx).await;

        a.send(message(MessageType::Offer, "ghost"));
        match recv(&mut rx).await {
            Some(SignalEvent::Message(m)) => {
                assert_eq!(m.kind, MessageType::Expire);
                assert_eq!(m.src.as_deref(), Some("ghost"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_frees_id_and_sends_leave() {
        let relay = MemoryRelay::new();
        relay.leave_on_close(true);
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = relay.open_link(tx_a);
        let b = relay.open_link(tx_b);
        a.start("alice", "t");
        b.start("bob", "t");
        let _ = recv(&mut rx_b).await;

        a.close();
        assert!(!relay.is_registered("alice"));
        match recv(&mut rx_b).await {
            Some(SignalEvent::Message(m)) => {
                assert_eq!(m.kind, MessageType::Leave);
                assert_eq!(m.src.as_deref(), Some("alice"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
