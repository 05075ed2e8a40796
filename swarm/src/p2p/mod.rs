mod connection;
pub mod message;
pub mod handshake;
pub mod state;

pub use connection::{PeerConnection, PeerContext};
pub use message::{Message, MessageCodec};
pub use handshake::{Handshake, HandshakeCodec};

type Result<T, E = PeerError> = std::result::Result<T, E>;

slotmap::new_key_type! {
    // Stable handle of a peer connection, stale once the peer is removed.
    pub struct PeerKey;
}

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("connected to ourselves")]
    ConnectedToSelf,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("message length {0} exceeds limit")]
    MessageTooLarge(usize),

    #[error("data received in state {0:?}")]
    UnexpectedMessage(state::ConnState),

    #[error("bitfield sent after other messages")]
    UnexpectedBitfield,

    #[error("invalid block request")]
    InvalidRequest,

    #[error("connection timeout")]
    Timeout,
}
