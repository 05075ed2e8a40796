use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::ID;
use super::PeerError;

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

pub const HANDSHAKE_LEN: usize = 68;

#[derive(Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol:   [u8; 19],
    pub reserved:   [u8; 8],
    pub info_hash:  ID,
    pub peer_id:    ID,
}

impl Handshake {
    pub fn new(info_hash: ID, peer_id: ID) -> Self {
        let mut reserved = [0; 8];
        // Extension protocol supported.
        reserved[5] |= 0x10;
        Self {
            protocol: PROTOCOL,
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {

    type Error = PeerError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(19);
        dst.extend_from_slice(&item.protocol);
        dst.extend_from_slice(&item.reserved);
        dst.extend_from_slice(&item.info_hash);
        dst.extend_from_slice(&item.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {

    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.is_empty() {
            return Ok(None);
        }

        // Fail early on a bad length byte instead of waiting for 68 bytes.
        if src[0] != 19 {
            return Err(PeerError::IncorrectProtocol);
        }

        if src.len() < HANDSHAKE_LEN {
            // Handshake not fully received.
            return Ok(None);
        }
        src.advance(1);

        let mut protocol = [0; 19];
        src.copy_to_slice(&mut protocol);
        if protocol != PROTOCOL {
            return Err(PeerError::IncorrectProtocol);
        }

        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);

        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);

        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            protocol,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("protocol", &String::from_utf8_lossy(&self.protocol))
            .field("reserved", &self.reserved)
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const INFO_HASH: ID = hex!("d984f67af9917b214cd8b6048ab5624c7df6a07a");

    fn raw(info_hash: &ID) -> BytesMut {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"BitTorrent protocol");
        src.extend_from_slice(&[0; 8]);
        src.extend_from_slice(info_hash);
        src.extend_from_slice(b"-SW0100-abcdefghijkl");
        src
    }

    #[test]
    fn test_handshake_decoding() {
        let mut src = raw(&INFO_HASH);
        let handshake = HandshakeCodec.decode(&mut src).unwrap().unwrap();
        assert_eq!(handshake.protocol, PROTOCOL);
        assert_eq!(handshake.reserved, [0; 8]);
        assert_eq!(handshake.info_hash, INFO_HASH);
        assert_eq!(&handshake.peer_id, b"-SW0100-abcdefghijkl");
        assert!(!handshake.supports_extensions());
        assert!(src.is_empty());
    }

    #[test]
    fn test_handshake_encoding() {
        let mut dst = BytesMut::new();
        HandshakeCodec.encode(Handshake::new(INFO_HASH, *b"-SW0100-abcdefghijkl"), &mut dst).unwrap();
        assert_eq!(dst.len(), HANDSHAKE_LEN);
        let decoded = HandshakeCodec.decode(&mut dst).unwrap().unwrap();
        assert!(decoded.supports_extensions());
        assert_eq!(decoded.info_hash, INFO_HASH);
    }

    #[test]
    fn test_handshake_decoding_with_incomplete_data() {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"BitTorrent protocol");
        assert!(HandshakeCodec.decode(&mut src).unwrap().is_none());
        assert_eq!(src.len(), 20);
    }

    #[test]
    fn test_handshake_decoding_with_invalid_protocol() {
        let mut src = BytesMut::new();
        src.put_u8(20);
        src.extend_from_slice(b"Invalid protocol");
        assert!(matches!(HandshakeCodec.decode(&mut src), Err(PeerError::IncorrectProtocol)));

        let mut src = raw(&INFO_HASH);
        src[1] = b'b';
        assert!(matches!(HandshakeCodec.decode(&mut src), Err(PeerError::IncorrectProtocol)));
    }

    #[test]
    fn test_handshake_decoding_leaves_extra_data() {
        let mut src = raw(&INFO_HASH);
        src.extend_from_slice(&[0, 0, 0, 1, 2]);
        assert!(HandshakeCodec.decode(&mut src).unwrap().is_some());
        assert_eq!(&src[..], &[0, 0, 0, 1, 2]);
    }
}
