use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    time::{Duration, Instant},
};
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{
    block::{BlockData, BlockInfo},
    event::SwarmEvent,
    stats::ThroughputStats,
    time::TimerId,
    Bitfield,
    ID,
};
use super::{
    handshake::{Handshake, HandshakeCodec},
    message::{Message, MessageCodec},
    state::{ConnState, SessionState},
    PeerError,
    PeerKey,
    Result,
};

// What a connection needs to know about the local side.
#[derive(Debug, Clone, Copy)]
pub struct PeerContext {

    pub info_hash: ID,

    pub client_id: ID,

    pub num_pieces: usize,

    pub rate_window: usize,

    // Peers with no pieces aren't required to send a bitfield.
    pub send_empty_bitfield: bool,

    // Largest frame accepted from the peer.
    pub max_message_len: usize,

}

// One remote peer. Decodes its byte stream, keeps the choke and interest
// flags for both directions and buffers outgoing frames until the client
// flushes them to the transport. No scheduling decisions are made here,
// everything of interest is reported as a `SwarmEvent`.
pub struct PeerConnection {

    pub key: PeerKey,

    pub address: SocketAddr,

    pub peer_id: Option<ID>,

    // We opened the connection.
    pub outbound: bool,

    pub conn_state: ConnState,

    pub state: SessionState,

    // Pieces the peer has.
    pub bitfield: Bitfield,

    // Set once a bitfield, or any message standing in for one, arrived.
    pub introduced: bool,

    pub throughput: ThroughputStats,

    // Times a piece this peer contributed to failed its hash check.
    pub corrupt_pieces: HashMap<usize, u32>,

    // Requests from the peer waiting to be served.
    pub upload_queue: VecDeque<BlockInfo>,

    pub serve_timer: Option<TimerId>,

    pub connected_at: Option<Instant>,

    pub last_sent: Instant,

    // Start of the current stretch with no interest either way.
    idle_since: Option<Instant>,

    ctx: PeerContext,

    codec: MessageCodec,

    recv_buf: BytesMut,

    send_buf: BytesMut,

}

impl PeerConnection {

    fn new(key: PeerKey, address: SocketAddr, outbound: bool, ctx: PeerContext, now: Instant) -> Self {
        Self {
            key,
            address,
            peer_id: None,
            outbound,
            conn_state: ConnState::NotConnected,
            state: SessionState::default(),
            bitfield: Bitfield::repeat(false, ctx.num_pieces),
            introduced: false,
            throughput: ThroughputStats::new(ctx.rate_window),
            corrupt_pieces: HashMap::new(),
            upload_queue: VecDeque::new(),
            serve_timer: None,
            connected_at: None,
            last_sent: now,
            idle_since: None,
            ctx,
            codec: MessageCodec::new(ctx.max_message_len),
            recv_buf: BytesMut::new(),
            send_buf: BytesMut::new(),
        }
    }

    // Outbound connection, the transport connect is requested by the client.
    pub fn connect(key: PeerKey, address: SocketAddr, ctx: PeerContext, now: Instant) -> Self {
        let mut peer = Self::new(key, address, true, ctx, now);
        peer.conn_state = ConnState::AwaitConnection;
        tracing::debug!("connecting to {}", address);
        peer
    }

    // Inbound connection, the transport is already up.
    pub fn accept(key: PeerKey, address: SocketAddr, ctx: PeerContext, now: Instant) -> Self {
        let mut peer = Self::new(key, address, false, ctx, now);
        peer.write_handshake(now);
        tracing::debug!("accepted connection from {}", address);
        peer
    }

    pub fn on_transport_connected(&mut self, now: Instant) -> Result<()> {
        if self.conn_state != ConnState::AwaitConnection {
            return Err(PeerError::UnexpectedMessage(self.conn_state));
        }
        self.write_handshake(now);
        Ok(())
    }

    fn write_handshake(&mut self, now: Instant) {
        let handshake = Handshake::new(self.ctx.info_hash, self.ctx.client_id);
        // Encoding into a buffer can't fail.
        let _ = HandshakeCodec.encode(handshake, &mut self.send_buf);
        self.connected_at = Some(now);
        self.conn_state = ConnState::AwaitHandshake;
    }

    // Feeds bytes read from the transport. Errors mean the connection must be
    // closed with that error.
    pub fn on_data(
        &mut self,
        data: &[u8],
        local: &Bitfield,
        now: Instant,
        events: &mut VecDeque<SwarmEvent>,
    ) -> Result<()> {

        if !matches!(self.conn_state, ConnState::AwaitHandshake | ConnState::Connected) {
            return Err(PeerError::UnexpectedMessage(self.conn_state));
        }
        self.recv_buf.extend_from_slice(data);

        if self.conn_state == ConnState::AwaitHandshake {
            match HandshakeCodec.decode(&mut self.recv_buf)? {
                Some(handshake) => self.on_handshake(handshake, local, now, events)?,
                None => return Ok(()),
            }
        }

        while let Some(msg) = self.codec.decode(&mut self.recv_buf)? {
            self.on_message(msg, events)?;
        }

        Ok(())
    }

    fn on_handshake(
        &mut self,
        handshake: Handshake,
        local: &Bitfield,
        now: Instant,
        events: &mut VecDeque<SwarmEvent>,
    ) -> Result<()> {
        tracing::trace!("read: {:?}", handshake);

        if handshake.info_hash != self.ctx.info_hash {
            return Err(PeerError::IncorrectInfoHash);
        }
        if handshake.peer_id == self.ctx.client_id {
            return Err(PeerError::ConnectedToSelf);
        }

        self.peer_id = Some(handshake.peer_id);
        self.conn_state = ConnState::Connected;
        self.connected_at = Some(now);
        self.idle_since = Some(now);
        tracing::info!("connected to {} ({})", self.address, String::from_utf8_lossy(&handshake.peer_id));

        events.push_back(SwarmEvent::PeerConnected {
            peer: self.key,
            address: self.address,
            peer_id: handshake.peer_id,
        });

        if local.any() || self.ctx.send_empty_bitfield {
            self.send_bitfield(local);
        }
        Ok(())
    }

    fn on_message(&mut self, msg: Message, events: &mut VecDeque<SwarmEvent>) -> Result<()> {
        tracing::trace!("read from {}: {}", self.address, msg);

        if let Message::Bitfield(bitfield) = msg {
            // Bitfield can only be sent directly after handshake.
            if self.introduced {
                return Err(PeerError::UnexpectedBitfield);
            }
            return self.on_bitfield(bitfield, events);
        }

        if !self.introduced && !matches!(msg, Message::KeepAlive) {
            // A peer with no pieces may skip the bitfield.
            self.introduced = true;
            events.push_back(SwarmEvent::BitfieldReceived { peer: self.key, bitfield: self.bitfield.clone() });
        }

        let peer = self.key;
        match msg {

            Message::KeepAlive | Message::Bitfield(_) => {},

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.peer_choking = true;
                    events.push_back(SwarmEvent::PeerChoked { peer });
                }
            },

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.peer_choking = false;
                    events.push_back(SwarmEvent::PeerUnchoked { peer });
                }
            },

            Message::Interested => {
                if !self.state.peer_interested {
                    self.state.peer_interested = true;
                    events.push_back(SwarmEvent::PeerInterested { peer });
                }
            },

            Message::NotInterested => {
                if self.state.peer_interested {
                    self.state.peer_interested = false;
                    events.push_back(SwarmEvent::PeerNotInterested { peer });
                }
            },

            Message::Have { idx } => {
                let idx = idx as usize;
                if idx >= self.ctx.num_pieces {
                    tracing::warn!("have msg with invalid idx: {}", idx);
                    return Err(PeerError::InvalidMessage);
                }
                // Peer already has piece.
                if self.bitfield[idx] {
                    return Ok(());
                }
                self.bitfield.set(idx, true);
                self.state.num_pieces += 1;
                events.push_back(SwarmEvent::Have { peer, piece: idx });
            },

            Message::Request(block) => {
                events.push_back(SwarmEvent::BlockRequested { peer, block });
            },

            Message::Cancel(block) => {
                self.upload_queue.retain(|queued| *queued != block);
                events.push_back(SwarmEvent::RequestCancelled { peer, block });
            },

            Message::Block(block) => {
                self.throughput.down += block.data.len() as u64;
                events.push_back(SwarmEvent::BlockReceived { peer, block });
            },

            Message::Port { port } => {
                events.push_back(SwarmEvent::PortReceived { peer, port });
            },

            Message::Extended { id, payload } => {
                events.push_back(SwarmEvent::Extended { peer, id, payload });
            },
        }

        Ok(())
    }

    fn on_bitfield(&mut self, mut bitfield: Bitfield, events: &mut VecDeque<SwarmEvent>) -> Result<()> {
        let num_pieces = self.ctx.num_pieces;
        if bitfield.len() != (num_pieces + 7) / 8 * 8 {
            tracing::warn!("bitfield of {} bits for {} pieces", bitfield.len(), num_pieces);
            return Err(PeerError::InvalidMessage);
        }
        // Spare bits must be cleared.
        if bitfield[num_pieces..].any() {
            return Err(PeerError::InvalidMessage);
        }
        bitfield.truncate(num_pieces);

        tracing::debug!("{} has {}/{} pieces", self.address, bitfield.count_ones(), num_pieces);
        self.state.num_pieces = bitfield.count_ones();
        self.introduced = true;
        events.push_back(SwarmEvent::BitfieldReceived { peer: self.key, bitfield: bitfield.clone() });
        self.bitfield = bitfield;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.conn_state == ConnState::Connected
    }

    pub fn is_seeder(&self) -> bool {
        self.introduced && self.state.num_pieces == self.ctx.num_pieces
    }

    pub fn has_piece(&self, idx: usize) -> bool {
        self.bitfield.get(idx).map(|b| *b).unwrap_or(false)
    }

    fn send(&mut self, msg: Message) {
        if !self.is_connected() {
            tracing::debug!("dropping {} to {}, not connected", msg, self.address);
            return;
        }
        tracing::trace!("send to {}: {}", self.address, msg);
        msg.encode(&mut self.send_buf);
    }

    pub fn request_piece(&mut self, block: BlockInfo) {
        self.send(Message::Request(block));
    }

    pub fn cancel_request(&mut self, block: BlockInfo) {
        self.send(Message::Cancel(block));
    }

    pub fn send_block(&mut self, block: BlockData) {
        self.throughput.up += block.data.len() as u64;
        self.send(Message::Block(block));
    }

    pub fn send_have(&mut self, idx: usize) {
        self.send(Message::Have { idx: idx as u32 });
    }

    pub fn send_bitfield(&mut self, bitfield: &Bitfield) {
        self.send(Message::Bitfield(bitfield.clone()));
    }

    pub fn send_extended(&mut self, id: u8, payload: Bytes) {
        self.send(Message::Extended { id, payload });
    }

    pub fn send_keep_alive(&mut self) {
        self.send(Message::KeepAlive);
    }

    // Returns whether a message was sent.
    pub fn set_interested(&mut self, interested: bool) -> bool {
        if self.state.am_interested == interested || !self.is_connected() {
            return false;
        }
        self.state.am_interested = interested;
        self.send(if interested { Message::Interested } else { Message::NotInterested });
        true
    }

    // Returns whether a message was sent. Choking drops queued uploads, the
    // peer has to request them again.
    pub fn set_choking(&mut self, choking: bool) -> bool {
        if self.state.am_choking == choking || !self.is_connected() {
            return false;
        }
        self.state.am_choking = choking;
        if choking {
            self.upload_queue.clear();
        }
        self.send(if choking { Message::Choke } else { Message::Unchoke });
        true
    }

    // Frames written since the last call.
    pub fn take_outgoing(&mut self, now: Instant) -> Option<Bytes> {
        if self.send_buf.is_empty() {
            return None;
        }
        self.last_sent = now;
        Some(self.send_buf.split().freeze())
    }

    pub fn needs_keep_alive(&self, now: Instant, interval: Duration) -> bool {
        self.is_connected() && now.saturating_duration_since(self.last_sent) >= interval
    }

    // Whether neither side has been interested for longer than the timeout.
    pub fn is_idle(&mut self, now: Instant, timeout: Duration) -> bool {
        if !self.is_connected() {
            return false;
        }
        if self.state.am_interested || self.state.peer_interested {
            self.idle_since = None;
            return false;
        }
        let since = *self.idle_since.get_or_insert(now);
        now.saturating_duration_since(since) >= timeout
    }

    // Moves to a terminal state. Returns false if already closed.
    pub fn close(&mut self, error: Option<PeerError>, events: &mut VecDeque<SwarmEvent>) -> bool {
        if self.conn_state.is_terminal() {
            return false;
        }
        self.conn_state = match (&error, self.conn_state) {
            (_, ConnState::AwaitConnection) => ConnState::Failed,
            (Some(_), _) => ConnState::ClosedWithError,
            (None, _) => ConnState::Closed,
        };
        match &error {
            Some(e) => tracing::warn!("closing {}: {}", self.address, e),
            None => tracing::info!("closing {}", self.address),
        }
        self.upload_queue.clear();
        events.push_back(SwarmEvent::PeerDisconnected {
            peer: self.key,
            address: self.address,
            error: error.map(|e| e.to_string()),
        });
        true
    }

    // Last step before the client drops the connection. Returns the serve
    // timer so the caller can cancel it.
    pub fn deinitialize(&mut self) -> Option<TimerId> {
        self.conn_state = ConnState::Deinitialized;
        self.recv_buf.clear();
        self.send_buf.clear();
        self.upload_queue.clear();
        self.serve_timer.take()
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("address", &self.address)
            .field("conn_state", &self.conn_state)
            .field("state", &self.state)
            .finish()
    }
}
