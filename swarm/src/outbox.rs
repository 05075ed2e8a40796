use std::{collections::VecDeque, net::SocketAddr};
use bytes::Bytes;
use crate::{event::SwarmEvent, p2p::PeerKey};

// Effects the engine asks its driver to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {

    // Open a transport connection, report back with `Client::on_connected`.
    Connect { peer: PeerKey, address: SocketAddr },

    Send { peer: PeerKey, data: Bytes },

    // Close the transport, no further data will be accepted for this peer.
    Close { peer: PeerKey },

    // HTTP GET to the tracker, report back with `Client::on_tracker_response`.
    Announce { ticket: u64, url: String },

    CancelAnnounce { ticket: u64 },

}

// Queues filled while the engine handles one input.
#[derive(Debug, Default)]
pub(crate) struct Outbox {

    pub commands: VecDeque<Command>,

    // Events waiting to be dispatched to the schedulers and subscribers.
    pub events: VecDeque<SwarmEvent>,

}

impl Outbox {

    pub fn connect(&mut self, peer: PeerKey, address: SocketAddr) {
        self.commands.push_back(Command::Connect { peer, address });
    }

    pub fn send(&mut self, peer: PeerKey, data: Bytes) {
        self.commands.push_back(Command::Send { peer, data });
    }

    pub fn close(&mut self, peer: PeerKey) {
        self.commands.push_back(Command::Close { peer });
    }

    pub fn announce(&mut self, ticket: u64, url: String) {
        self.commands.push_back(Command::Announce { ticket, url });
    }

    pub fn cancel_announce(&mut self, ticket: u64) {
        self.commands.push_back(Command::CancelAnnounce { ticket });
    }

    pub fn event(&mut self, event: SwarmEvent) {
        self.events.push_back(event);
    }
}
