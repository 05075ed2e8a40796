mod config;
mod de;
mod metainfo;
mod info;
mod block;
mod store;
mod time;
mod outbox;
mod picker;
mod choker;
mod client;
pub mod event;
pub mod p2p;
pub mod tracker;
pub mod stats;
pub mod net;

// Most commonly used block size - 16KB.
pub const BLOCK_SIZE: usize = 0x4000;

pub type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

// 20 byte SHA1 hash, used for info hashes, piece hashes and peer ids.
pub type ID = [u8; 20];

// Re-exports
pub use config::{BitfieldFill, ChokeMetric, Config, SelectionPolicy};
pub use metainfo::{MetaInfo, MetaInfoError};
pub use info::TorrentDescriptor;
pub use block::{BlockData, BlockInfo};
pub use store::{PieceStore, StoreError};
pub use time::{TimerId, TimerQueue};
pub use outbox::Command;
pub use client::{Client, Timer};
pub use event::{EventKind, SwarmEvent};
pub use p2p::PeerKey;
pub use picker::RequestId;
