use std::{collections::HashMap, net::{IpAddr, Ipv4Addr, SocketAddr}};
use bytes::Buf;
use serde::de;
use serde_bytes::ByteBuf;
use serde_derive::{Deserialize, Serialize};
use super::{Result, TrackerError};

#[derive(Deserialize, Debug, Default)]
pub struct AnnounceResponse {

    // If present, then no other keys may be present.
    // The value is a human-readable error message as to why the request failed (string).
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,

    // Similar to failure reason, but the response still gets processed normally.
    #[serde(rename = "warning message")]
    pub warning_message: Option<String>,

    // Interval in seconds that the client should wait between sending regular requests to the tracker
    pub interval: Option<u64>,

    // Minimum announce interval. If present clients must not reannounce more frequently than this.
    #[serde(rename = "min interval")]
    pub min_interval: Option<u64>,

    // A string that the client should send back on its next announcements.
    #[serde(rename = "tracker id")]
    pub tracker_id: Option<String>,

    // Number of peers with the entire file, i.e. seeders (integer)
    pub complete: Option<u32>,

    // Number of non-seeder peers, aka "leechers" (integer)
    pub incomplete: Option<u32>,

    #[serde(default)]
    #[serde(deserialize_with = "peer_deserialize")]
    pub peers: Vec<SocketAddr>,
}

impl AnnounceResponse {

    // Decodes a response body, a failure reason is turned into an error.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let resp: AnnounceResponse = serde_bencode::from_bytes(raw)?;
        tracing::debug!("announce response: {:?}", resp);
        if let Some(failure) = resp.failure_reason {
            return Err(TrackerError::ResponseError(failure));
        }
        Ok(resp)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeFile {

    // Peers with the entire file.
    pub complete: u32,

    // Completed events seen.
    pub downloaded: u64,

    pub incomplete: u32,

}

#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeResponse {
    // Keyed by raw 20 byte info hash.
    pub files: HashMap<ByteBuf, ScrapeFile>,
}

// The tracker can either return a dictionary model or a compacted string.
// This is based on the value of the "compact" parameter.
// However, even if we request a compacted string, the tracker can still return a dictionary model.
fn peer_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string of bytes or a list of dictionaries")
        }

        // String model.
        // The first 4 bytes are the IP address and the last 2 bytes are the port number.
        // All in network (big-endian) byte order.
        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("peer string not multiple of 6"));
            }

            let num_peers = v.len() / 6;
            let mut peers = Vec::with_capacity(num_peers);
            for _ in 0..num_peers {
                peers.push(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(v.get_u32())),
                    v.get_u16(),
                ));
            }

            Ok(peers)
        }

        fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_bytes(v.as_bytes())
        }

        // Dictionary model.
        // The dictionary model is a list of dictionaries, each with the keys "peer id", "ip" and "port".
        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                match peer.ip.parse::<IpAddr>() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, peer.port)),
                    Err(_) => tracing::debug!("skipping peer with unparseable ip: {}", peer.ip),
                }
            }

            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_binary() {
        let s = "64383a636f6d706c65746569396531303a696e636f6d706c657465693165383a696e74657276616c69313830306531323a6d696e20696e74657276616c693138303065353a706565727336303a52454d051ae1ca2f2a2ec00884937726decc61759ab8138851ab05e8f6bb5062f69770469247493ad4d005879f2ec8d54237ce44ea6043db8806c8d565";
        let response = AnnounceResponse::from_bytes(&hex::decode(s).unwrap()).unwrap();
        assert_eq!(response.interval, Some(1800));
        assert_eq!(response.min_interval, Some(1800));
        assert_eq!(response.complete, Some(9));
        assert_eq!(response.incomplete, Some(1));
        assert_eq!(response.peers.len(), 10);
        assert!(response.peers.contains(&SocketAddr::new(IpAddr::V4(Ipv4Addr::new(97, 117, 154, 184)), 5000)));
        assert!(response.peers.contains(&SocketAddr::new(IpAddr::V4(Ipv4Addr::new(5, 135, 159, 46)), 51413)));
    }

    #[test]
    fn test_parse_response_dict_model() {
        let raw = b"d8:intervali900e5:peersld7:peer id20:-SW0100-abcdefghijkl2:ip9:10.0.0.214:porti6881eed2:ip3:::14:porti51413eed2:ip7:unknown4:porti1eeee";
        let response = AnnounceResponse::from_bytes(raw).unwrap();
        assert_eq!(response.interval, Some(900));
        assert_eq!(response.peers, vec![
            "10.0.0.21:6881".parse().unwrap(),
            "[::1]:51413".parse().unwrap(),
        ]);
    }

    #[test]
    fn test_failure_reason() {
        let raw = b"d14:failure reason17:torrent not founde";
        match AnnounceResponse::from_bytes(raw) {
            Err(TrackerError::ResponseError(reason)) => assert_eq!(reason, "torrent not found"),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_scrape_response() {
        let mut files = HashMap::new();
        files.insert(ByteBuf::from(vec![0xaa; 20]), ScrapeFile { complete: 2, downloaded: 5, incomplete: 3 });
        let scrape = ScrapeResponse { files };
        let raw = serde_bencode::to_bytes(&scrape).unwrap();
        let decoded: ScrapeResponse = serde_bencode::from_bytes(&raw).unwrap();
        assert_eq!(decoded, scrape);
        assert!(raw.starts_with(b"d5:filesd20:"));
    }
}
