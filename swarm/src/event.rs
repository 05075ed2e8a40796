use std::{collections::HashMap, net::SocketAddr};
use bytes::Bytes;
use crate::{block::{BlockData, BlockInfo}, p2p::PeerKey, Bitfield, ID};

// Everything that happens inside the engine, in the order it happened.
// The request and choke schedulers react to these first, then subscribers
// registered on the client see them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEvent {

    // Handshake completed.
    PeerConnected { peer: PeerKey, address: SocketAddr, peer_id: ID },

    PeerDisconnected { peer: PeerKey, address: SocketAddr, error: Option<String> },

    // The peer told us what it has, either with a bitfield or implicitly by
    // sending something else first. Carries the pieces announced at that
    // point, later haves arrive as their own events.
    BitfieldReceived { peer: PeerKey, bitfield: Bitfield },

    Have { peer: PeerKey, piece: usize },

    // The peer choked or unchoked us.
    PeerChoked { peer: PeerKey },

    PeerUnchoked { peer: PeerKey },

    PeerInterested { peer: PeerKey },

    PeerNotInterested { peer: PeerKey },

    // Incoming request and cancel.
    BlockRequested { peer: PeerKey, block: BlockInfo },

    RequestCancelled { peer: PeerKey, block: BlockInfo },

    // Raw block payload off the wire, not yet accepted.
    BlockReceived { peer: PeerKey, block: BlockData },

    // A requested block was written to the store.
    BlockComplete { peer: PeerKey, block: BlockInfo },

    PieceTimeout { peer: PeerKey, block: BlockInfo },

    // No request for this piece is in flight anymore.
    PieceCancelled { piece: usize },

    PieceComplete { piece: usize },

    PieceCorrupt { piece: usize },

    DownloadComplete,

    Extended { peer: PeerKey, id: u8, payload: Bytes },

    PortReceived { peer: PeerKey, port: u16 },

    AnnounceSucceeded { seeders: u32, leechers: u32, peers: usize },

    AnnounceFailed { reason: String },

}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PeerConnected,
    PeerDisconnected,
    BitfieldReceived,
    Have,
    PeerChoked,
    PeerUnchoked,
    PeerInterested,
    PeerNotInterested,
    BlockRequested,
    RequestCancelled,
    BlockReceived,
    BlockComplete,
    PieceTimeout,
    PieceCancelled,
    PieceComplete,
    PieceCorrupt,
    DownloadComplete,
    Extended,
    PortReceived,
    AnnounceSucceeded,
    AnnounceFailed,
}

impl SwarmEvent {

    pub fn kind(&self) -> EventKind {
        match self {
            SwarmEvent::PeerConnected { .. } => EventKind::PeerConnected,
            SwarmEvent::PeerDisconnected { .. } => EventKind::PeerDisconnected,
            SwarmEvent::BitfieldReceived { .. } => EventKind::BitfieldReceived,
            SwarmEvent::Have { .. } => EventKind::Have,
            SwarmEvent::PeerChoked { .. } => EventKind::PeerChoked,
            SwarmEvent::PeerUnchoked { .. } => EventKind::PeerUnchoked,
            SwarmEvent::PeerInterested { .. } => EventKind::PeerInterested,
            SwarmEvent::PeerNotInterested { .. } => EventKind::PeerNotInterested,
            SwarmEvent::BlockRequested { .. } => EventKind::BlockRequested,
            SwarmEvent::RequestCancelled { .. } => EventKind::RequestCancelled,
            SwarmEvent::BlockReceived { .. } => EventKind::BlockReceived,
            SwarmEvent::BlockComplete { .. } => EventKind::BlockComplete,
            SwarmEvent::PieceTimeout { .. } => EventKind::PieceTimeout,
            SwarmEvent::PieceCancelled { .. } => EventKind::PieceCancelled,
            SwarmEvent::PieceComplete { .. } => EventKind::PieceComplete,
            SwarmEvent::PieceCorrupt { .. } => EventKind::PieceCorrupt,
            SwarmEvent::DownloadComplete => EventKind::DownloadComplete,
            SwarmEvent::Extended { .. } => EventKind::Extended,
            SwarmEvent::PortReceived { .. } => EventKind::PortReceived,
            SwarmEvent::AnnounceSucceeded { .. } => EventKind::AnnounceSucceeded,
            SwarmEvent::AnnounceFailed { .. } => EventKind::AnnounceFailed,
        }
    }

    // The peer this event concerns, if any.
    pub fn peer(&self) -> Option<PeerKey> {
        match self {
            SwarmEvent::PeerConnected { peer, .. }
            | SwarmEvent::PeerDisconnected { peer, .. }
            | SwarmEvent::BitfieldReceived { peer, .. }
            | SwarmEvent::Have { peer, .. }
            | SwarmEvent::PeerChoked { peer }
            | SwarmEvent::PeerUnchoked { peer }
            | SwarmEvent::PeerInterested { peer }
            | SwarmEvent::PeerNotInterested { peer }
            | SwarmEvent::BlockRequested { peer, .. }
            | SwarmEvent::RequestCancelled { peer, .. }
            | SwarmEvent::BlockReceived { peer, .. }
            | SwarmEvent::BlockComplete { peer, .. }
            | SwarmEvent::PieceTimeout { peer, .. }
            | SwarmEvent::Extended { peer, .. }
            | SwarmEvent::PortReceived { peer, .. } => Some(*peer),
            _ => None,
        }
    }
}

pub type Subscriber = Box<dyn FnMut(&SwarmEvent) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

// Per-kind subscriber lists.
#[derive(Default)]
pub struct EventBus {
    subscribers: HashMap<EventKind, Vec<(SubscriptionId, Subscriber)>>,
    next_id: u64,
}

impl EventBus {

    pub fn subscribe(&mut self, kind: EventKind, subscriber: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.entry(kind).or_default().push((id, subscriber));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        for list in self.subscribers.values_mut() {
            if let Some(pos) = list.iter().position(|(s, _)| *s == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn publish(&mut self, event: &SwarmEvent) {
        if let Some(list) = self.subscribers.get_mut(&event.kind()) {
            for (_, subscriber) in list.iter_mut() {
                subscriber(event);
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_publish_by_kind() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::default();

        let log = seen.clone();
        bus.subscribe(EventKind::PieceComplete, Box::new(move |e: &SwarmEvent| log.lock().unwrap().push(e.clone())));

        bus.publish(&SwarmEvent::PieceComplete { piece: 4 });
        bus.publish(&SwarmEvent::PieceCorrupt { piece: 5 });
        bus.publish(&SwarmEvent::DownloadComplete);

        assert_eq!(*seen.lock().unwrap(), vec![SwarmEvent::PieceComplete { piece: 4 }]);
    }

    #[test]
    fn test_unsubscribe() {
        let count = Arc::new(Mutex::new(0));
        let mut bus = EventBus::default();

        let c = count.clone();
        let id = bus.subscribe(EventKind::DownloadComplete, Box::new(move |_: &SwarmEvent| *c.lock().unwrap() += 1));
        bus.publish(&SwarmEvent::DownloadComplete);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&SwarmEvent::DownloadComplete);

        assert_eq!(*count.lock().unwrap(), 1);
    }
}
