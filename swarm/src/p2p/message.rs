use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{block, Bitfield};
use super::PeerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {

    // The keep alive message advises peers not to close the connection,
    // even if they haven’t received a message in some time.
    KeepAlive,

    // A choke message tells a peer that no further requests will be satisfied.
    Choke,

    // Conversely unchoke signifies that requests from the peer will be served.
    Unchoke,

    // Notifies a peer that the client is interested in making requests for blocks.
    Interested,

    // Notifies a peer the client is no longer interested in requesting blocks.
    NotInterested,

    // Tells a peer that the client has a piece, referenced by the piece index.
    Have { idx: u32 },

    // Pieces the sender has, sent once right after the handshake. Raw, the
    // receiver checks the length against its own piece count.
    Bitfield(Bitfield),

    // Piece index, offset within the piece and length of the wanted block.
    Request(block::BlockInfo),

    // Block payload, referencing piece index and block offset.
    Block(block::BlockData),

    // Withdraws an earlier request.
    Cancel(block::BlockInfo),

    // The port the sender's DHT node listens on.
    Port { port: u16 },

    // Extension protocol message, sub id 0 is the extension handshake.
    Extended { id: u8, payload: Bytes },
}

impl Message {

    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have { .. } => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request(_) => Some(6),
            Message::Block(_) => Some(7),
            Message::Cancel(_) => Some(8),
            Message::Port { .. } => Some(9),
            Message::Extended { .. } => Some(20),
        }
    }

    // Appends the length prefixed frame to dst.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {

            // [0, 0, 0, 0]
            Message::KeepAlive => dst.put_u32(0),

            // [0, 0, 0, 1, id]
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(self.id().unwrap_or_default());
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(*idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(raw);
            },

            // request: <len=0013><id=6><index><begin><length>
            // cancel: <len=0013><id=8><index><begin><length>
            Message::Request(block) | Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(self.id().unwrap_or_default());
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(&block.data);
            },

            // port: <len=0003><id=9><listen-port>
            Message::Port { port } => {
                dst.put_u32(3);
                dst.put_u8(9);
                dst.put_u16(*port);
            },

            // extended: <len=0002+X><id=20><sub id><payload>
            Message::Extended { id, payload } => {
                dst.put_u32(2 + payload.len() as u32);
                dst.put_u8(20);
                dst.put_u8(*id);
                dst.extend_from_slice(payload);
            },
        }
    }
}

// Two stage decoder: the length prefix is consumed as soon as it arrives and
// remembered until the whole body is buffered.
#[derive(Debug)]
pub struct MessageCodec {
    max_len: usize,
    pending: Option<usize>,
}

impl MessageCodec {
    pub fn new(max_len: usize) -> Self {
        Self { max_len, pending: None }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(crate::config::MAX_BLOCK_SIZE + 9)
    }
}

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        msg.encode(dst);
        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        let msg_len = match self.pending {
            Some(len) => len,
            None => {
                // Can't read message length.
                if src.len() < 4 { return Ok(None); }
                let len = src.get_u32() as usize;
                if len == 0 {
                    return Ok(Some(Message::KeepAlive));
                }
                if len > self.max_len {
                    return Err(PeerError::MessageTooLarge(len));
                }
                len
            },
        };

        if src.len() < msg_len {
            // Haven't received all of message.
            self.pending = Some(msg_len);
            src.reserve(msg_len - src.len());
            return Ok(None);
        }
        self.pending = None;

        let mut body = src.split_to(msg_len);
        let id = body.get_u8();
        let payload_len = body.len();

        let fixed_len = |expected: usize| {
            if payload_len == expected { Ok(()) } else { Err(PeerError::InvalidMessage) }
        };

        let msg = match id {
            0 => { fixed_len(0)?; Message::Choke },
            1 => { fixed_len(0)?; Message::Unchoke },
            2 => { fixed_len(0)?; Message::Interested },
            3 => { fixed_len(0)?; Message::NotInterested },
            4 => {
                fixed_len(4)?;
                Message::Have { idx: body.get_u32() }
            },
            5 => Message::Bitfield(Bitfield::from_vec(body.to_vec())),
            6 | 8 => {
                fixed_len(12)?;
                let piece_idx = body.get_u32() as usize;
                let offset = body.get_u32() as usize;
                let len = body.get_u32() as usize;
                let block = block::BlockInfo { piece_idx, offset, len };
                if id == 6 { Message::Request(block) } else { Message::Cancel(block) }
            },
            7 => {
                if payload_len < 8 {
                    return Err(PeerError::InvalidMessage);
                }
                let piece_idx = body.get_u32() as usize;
                let offset = body.get_u32() as usize;
                Message::Block(block::BlockData { piece_idx, offset, data: body.freeze() })
            },
            9 => {
                fixed_len(2)?;
                Message::Port { port: body.get_u16() }
            },
            20 => {
                if payload_len < 1 {
                    return Err(PeerError::InvalidMessage);
                }
                let id = body.get_u8();
                Message::Extended { id, payload: body.freeze() }
            },
            id => {
                tracing::warn!("invalid message id: {}", id);
                return Err(PeerError::InvalidMessageId(id));
            },
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece idx: {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(f, "request for block {{ piece idx: {}, offset {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::Block(block) => write!(f, "block data {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.data.len(),
            ),
            Message::Cancel(block) => write!(f, "cancel for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len
            ),
            Message::Port { port } => write!(f, "port {}", port),
            Message::Extended { id, payload } => write!(f, "extended id {} with {} bytes", id, payload.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    #[test]
    fn test_msg_stream() {

        let mut codec = MessageCodec::default();
        let mut out_buf = BytesMut::new();
        let mut buf = BytesMut::new();
        // Keep alive
        buf.extend_from_slice(&[0, 0, 0, 0]);
        // Choke
        buf.extend_from_slice(&[0, 0, 0, 1, 0]);
        // Unchoke
        buf.extend_from_slice(&[0, 0, 0, 1, 1]);
        // Interested
        buf.extend_from_slice(&[0, 0, 0, 1, 2]);
        // Not interested
        buf.extend_from_slice(&[0, 0, 0, 1, 3]);
        // Have
        buf.extend_from_slice(&[0, 0, 0, 5, 4, 0, 0, 0, 0xb]);
        // Bitfield
        buf.extend_from_slice(&[0, 0, 0, 4, 5, 0x1, 0x2, 0x3]);
        // Request
        buf.extend_from_slice(&[0, 0, 0, 0xd, 0x6, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);
        // Piece
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1, 0x2, 0x3]);
        // Cancel
        buf.extend_from_slice(&[0, 0, 0, 0xd, 0x8, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);
        // Port
        buf.extend_from_slice(&[0, 0, 0, 3, 9, 0x1a, 0xe1]);
        // Extended handshake
        buf.extend_from_slice(&[0, 0, 0, 4, 20, 0, b'd', b'e']);

        let expected = [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { idx: 0xb },
            Message::Bitfield(BitVec::<u8, Msb0>::from_slice(&[0x1, 0x2, 0x3])),
            Message::Request(block::BlockInfo { piece_idx: 0xb, offset: 0x134000, len: 0x4000 }),
            Message::Block(block::BlockData { piece_idx: 0xb, offset: 0x134000, data: Bytes::from_static(&[0x1, 0x2, 0x3]) }),
            Message::Cancel(block::BlockInfo { piece_idx: 0xb, offset: 0x134000, len: 0x4000 }),
            Message::Port { port: 6881 },
            Message::Extended { id: 0, payload: Bytes::from_static(b"de") },
        ];
        let expected_buf = buf.clone();

        for msg in expected.into_iter() {
            codec.encode(msg.clone(), &mut out_buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg, "decoded message does not match expected");
        }

        assert!(buf.is_empty());
        assert_eq!(out_buf, expected_buf, "encoded stream does not match expected");
    }

    #[test]
    fn test_msg_decode_chunked() {

        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();

        // Add 1/2 of interested message
        buf.extend_from_slice(&[0, 0, 0]);
        let decoded = codec.decode(&mut buf).unwrap();
        assert_eq!(decoded, None);
        // Add other 1/2
        buf.extend_from_slice(&[1, 2]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Interested);

        // Add 1/2 of piece message
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1]);
        let decoded = codec.decode(&mut buf).unwrap();
        assert_eq!(decoded, None);
        // Add other 1/2 followed by the start of the next frame.
        buf.extend_from_slice(&[0x2, 0x3, 0, 0]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Block(block::BlockData { piece_idx: 0xb, offset: 0x134000, data: Bytes::from_static(&[0x1, 0x2, 0x3]) }));
        assert_eq!(&buf[..], &[0, 0]);
    }

    #[test]
    fn test_msg_decode_empty() {
        let mut src = BytesMut::new();
        let mut codec = MessageCodec::default();
        let message = codec.decode(&mut src).unwrap();
        assert_eq!(message, None);
    }

    #[test]
    fn test_msg_decode_invalid_id() {
        let mut src = BytesMut::from(&[0u8, 0, 0, 1, 255][..]); // Message ID 255 is invalid
        let mut codec = MessageCodec::default();
        match codec.decode(&mut src) {
            Err(PeerError::InvalidMessageId(id)) => assert_eq!(id, 255),
            _ => panic!("expected PeerError::InvalidMessageId"),
        }
    }

    #[test]
    fn test_msg_decode_oversized() {
        let mut src = BytesMut::from(&[0u8, 0x10, 0, 0, 7][..]);
        let mut codec = MessageCodec::new(1 << 16);
        assert!(matches!(codec.decode(&mut src), Err(PeerError::MessageTooLarge(0x100000))));
    }

    #[test]
    fn test_msg_decode_bad_payload_length() {
        // Have with a 3 byte index.
        let mut src = BytesMut::from(&[0u8, 0, 0, 4, 4, 0, 0, 1][..]);
        let mut codec = MessageCodec::default();
        assert!(matches!(codec.decode(&mut src), Err(PeerError::InvalidMessage)));
    }

    #[test]
    fn test_bitfield_encoded_length() {
        // 10 pieces need two bytes on the wire.
        let mut bitfield = Bitfield::repeat(false, 10);
        bitfield.set(0, true);
        bitfield.set(9, true);
        let mut buf = BytesMut::new();
        Message::Bitfield(bitfield).encode(&mut buf);
        assert_eq!(&buf[..], &[0, 0, 0, 3, 5, 0x80, 0x40]);
    }
}
