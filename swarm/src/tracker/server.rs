use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};
use rand::{rngs::StdRng, seq::IteratorRandom, Rng, SeedableRng};
use serde_bytes::ByteBuf;
use serde_derive::Serialize;
use crate::ID;
use super::{Event, ScrapeFile, ScrapeResponse};

const DEFAULT_NUM_WANT: usize = 50;
const MAX_NUM_WANT: usize = 200;

// Members silent for this many intervals are dropped.
const EXPIRY_INTERVALS: u32 = 3;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AnnounceError {

    #[error("torrent not found")]
    NotFound,

    #[error("bad request: {0}")]
    BadRequest(String),

}

type Result<T> = std::result::Result<T, AnnounceError>;

#[derive(Debug, Clone)]
pub struct ClientRecord {

    pub peer_id: ID,

    // Where other peers can reach this one.
    pub address: SocketAddr,

    pub last_seen: Instant,

    pub uploaded: u64,

    pub downloaded: u64,

    pub left: u64,

}

// Membership of one swarm.
#[derive(Debug, Default)]
pub struct CloudInfo {

    pub leechers: HashMap<ID, ClientRecord>,

    pub seeders: HashMap<ID, ClientRecord>,

    // Completed events received.
    pub completed: u64,

}

impl CloudInfo {

    fn remove(&mut self, peer_id: &ID) -> Option<ClientRecord> {
        self.leechers.remove(peer_id).or_else(|| self.seeders.remove(peer_id))
    }

    fn scrape(&self) -> ScrapeFile {
        ScrapeFile {
            complete: self.seeders.len() as u32,
            downloaded: self.completed,
            incomplete: self.leechers.len() as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {

    pub info_hash: ID,

    pub peer_id: ID,

    pub address: SocketAddr,

    pub uploaded: u64,

    pub downloaded: u64,

    pub left: u64,

    pub event: Option<Event>,

    pub num_want: Option<usize>,

    pub compact: bool,

    // Echo of the id from an earlier reply.
    pub tracker_id: Option<String>,

}

fn parse_id(name: &str, raw: Option<&Vec<u8>>) -> Result<ID> {
    let raw = raw.ok_or_else(|| AnnounceError::BadRequest(format!("missing {}", name)))?;
    raw.as_slice()
        .try_into()
        .map_err(|_| AnnounceError::BadRequest(format!("{} must be 20 bytes", name)))
}

fn parse_num<T: std::str::FromStr>(name: &str, raw: Option<&Vec<u8>>) -> Result<Option<T>> {
    match raw {
        None => Ok(None),
        Some(raw) => std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Some)
            .ok_or_else(|| AnnounceError::BadRequest(format!("invalid {}", name))),
    }
}

// Percent-decoded query parameters, the last occurrence of a key wins.
fn parse_query(query: &str) -> HashMap<String, Vec<u8>> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (
                String::from_utf8_lossy(&urlencoding::decode_binary(key.as_bytes())).into_owned(),
                urlencoding::decode_binary(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

impl AnnounceRequest {

    // Builds a request from the announce query string. `remote` is used
    // unless the peer supplied its own ip.
    pub fn from_query(query: &str, remote: IpAddr) -> Result<Self> {
        let params = parse_query(query);

        let info_hash = parse_id("info_hash", params.get("info_hash"))?;
        let peer_id = parse_id("peer_id", params.get("peer_id"))?;
        let port: u16 = parse_num("port", params.get("port"))?
            .ok_or_else(|| AnnounceError::BadRequest("missing port".into()))?;

        let event = match params.get("event").map(|e| String::from_utf8_lossy(e).into_owned()) {
            None => None,
            Some(e) if e.is_empty() => None,
            Some(e) => Some(e.parse::<Event>().map_err(AnnounceError::BadRequest)?),
        };

        // A leaving peer needs to say who it is, nothing more.
        let left = match parse_num("left", params.get("left"))? {
            Some(left) => left,
            None if event == Some(Event::Stopped) => 0,
            None => return Err(AnnounceError::BadRequest("missing left".into())),
        };

        let ip = params
            .get("ip")
            .and_then(|ip| std::str::from_utf8(ip).ok())
            .and_then(|ip| ip.parse::<IpAddr>().ok())
            .unwrap_or(remote);

        Ok(Self {
            info_hash,
            peer_id,
            address: SocketAddr::new(ip, port),
            uploaded: parse_num("uploaded", params.get("uploaded"))?.unwrap_or(0),
            downloaded: parse_num("downloaded", params.get("downloaded"))?.unwrap_or(0),
            left,
            event,
            num_want: parse_num("numwant", params.get("numwant"))?,
            compact: params.get("compact").map(|c| c.as_slice() != b"0").unwrap_or(true),
            tracker_id: params.get("trackerid").map(|id| String::from_utf8_lossy(id).into_owned()),
        })
    }
}

// Info hashes named in a scrape query, none means all.
pub fn scrape_hashes(query: &str) -> Result<Vec<ID>> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, _)| *key == "info_hash")
        .map(|(_, value)| {
            let raw = urlencoding::decode_binary(value.as_bytes()).into_owned();
            parse_id("info_hash", Some(&raw))
        })
        .collect()
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DictPeer {

    #[serde(rename = "peer id")]
    pub peer_id: ByteBuf,

    pub ip: String,

    pub port: u16,

}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum PeerList {

    // 6 bytes per IPv4 peer.
    Compact(ByteBuf),

    Dict(Vec<DictPeer>),

}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AnnounceReply {

    pub interval: u64,

    #[serde(rename = "min interval")]
    pub min_interval: u64,

    pub complete: u32,

    pub incomplete: u32,

    #[serde(rename = "tracker id")]
    pub tracker_id: String,

    pub peers: PeerList,

}

impl AnnounceReply {
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Serialize)]
struct Failure<'a> {
    #[serde(rename = "failure reason")]
    reason: &'a str,
}

// Bencoded body for a rejected request.
pub fn failure_body(reason: &str) -> Vec<u8> {
    serde_bencode::to_bytes(&Failure { reason })
        .unwrap_or_else(|_| format!("d14:failure reason{}:{}e", reason.len(), reason).into_bytes())
}

// Swarm membership tables for every torrent this tracker serves.
#[derive(Debug)]
pub struct Tracker {

    clouds: HashMap<ID, CloudInfo>,

    interval: Duration,

    // Handed out in every reply, clients send it back.
    id: String,

    rng: StdRng,

}

impl Tracker {

    pub fn new(interval: Duration) -> Self {
        Self::with_rng(interval, StdRng::from_entropy())
    }

    pub fn with_seed(interval: Duration, seed: u64) -> Self {
        Self::with_rng(interval, StdRng::seed_from_u64(seed))
    }

    fn with_rng(interval: Duration, mut rng: StdRng) -> Self {
        let id = hex::encode(rng.gen::<[u8; 8]>());
        Self {
            clouds: HashMap::new(),
            interval,
            id,
            rng,
        }
    }

    // Starts serving a torrent. Returns false if it was already served.
    pub fn register(&mut self, info_hash: ID) -> bool {
        if self.clouds.contains_key(&info_hash) {
            return false;
        }
        tracing::info!("tracking {}", hex::encode(info_hash));
        self.clouds.insert(info_hash, CloudInfo::default());
        true
    }

    pub fn cloud(&self, info_hash: &ID) -> Option<&CloudInfo> {
        self.clouds.get(info_hash)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn announce(&mut self, req: &AnnounceRequest, now: Instant) -> Result<AnnounceReply> {

        let cloud = self.clouds.get_mut(&req.info_hash).ok_or(AnnounceError::NotFound)?;
        let previous = cloud.remove(&req.peer_id);
        tracing::debug!(
            "announce {:?} from {} for {}, left {}",
            req.event,
            req.address,
            hex::encode(req.info_hash),
            req.left,
        );
        if let Some(id) = req.tracker_id.as_deref().filter(|id| *id != self.id) {
            tracing::debug!("{} echoed unknown tracker id {}", req.address, id);
        }

        if req.event != Some(Event::Stopped) {
            let was_seeder = previous.map(|p| p.left == 0).unwrap_or(false);
            if req.event == Some(Event::Completed) && !was_seeder {
                cloud.completed += 1;
            }
            let record = ClientRecord {
                peer_id: req.peer_id,
                address: req.address,
                last_seen: now,
                uploaded: req.uploaded,
                downloaded: req.downloaded,
                left: req.left,
            };
            if req.left == 0 {
                cloud.seeders.insert(req.peer_id, record);
            } else {
                cloud.leechers.insert(req.peer_id, record);
            }
        }

        // Seeders only need leechers. A leaving peer needs nobody.
        let num_want = match req.event {
            Some(Event::Stopped) => 0,
            _ => req.num_want.unwrap_or(DEFAULT_NUM_WANT).min(MAX_NUM_WANT),
        };
        let seeders = cloud.seeders.values().filter(|_| req.left > 0);
        let sample: Vec<&ClientRecord> = cloud.leechers
            .values()
            .chain(seeders)
            .filter(|p| p.peer_id != req.peer_id)
            .choose_multiple(&mut self.rng, num_want);

        let peers = if req.compact {
            let mut compact = Vec::with_capacity(sample.len() * 6);
            for peer in sample.iter() {
                // IPv6 peers have no compact form.
                if let IpAddr::V4(ip) = peer.address.ip() {
                    compact.extend_from_slice(&ip.octets());
                    compact.extend_from_slice(&peer.address.port().to_be_bytes());
                }
            }
            PeerList::Compact(ByteBuf::from(compact))
        } else {
            PeerList::Dict(
                sample
                    .iter()
                    .map(|peer| DictPeer {
                        peer_id: ByteBuf::from(peer.peer_id.to_vec()),
                        ip: peer.address.ip().to_string(),
                        port: peer.address.port(),
                    })
                    .collect(),
            )
        };

        Ok(AnnounceReply {
            interval: self.interval.as_secs(),
            min_interval: self.interval.as_secs() / 2,
            complete: cloud.seeders.len() as u32,
            incomplete: cloud.leechers.len() as u32,
            tracker_id: self.id.clone(),
            peers,
        })
    }

    // Counters for the given torrents, every registered one if empty.
    pub fn scrape(&self, info_hashes: &[ID]) -> ScrapeResponse {
        let files = self.clouds
            .iter()
            .filter(|(hash, _)| info_hashes.is_empty() || info_hashes.contains(hash))
            .map(|(hash, cloud)| (ByteBuf::from(hash.to_vec()), cloud.scrape()))
            .collect();
        ScrapeResponse { files }
    }

    // Drops members that stopped announcing. Returns how many went.
    pub fn expire(&mut self, now: Instant) -> usize {
        let max_age = self.interval * EXPIRY_INTERVALS;
        let mut removed = 0;
        for cloud in self.clouds.values_mut() {
            let before = cloud.leechers.len() + cloud.seeders.len();
            cloud.leechers.retain(|_, p| now.saturating_duration_since(p.last_seen) < max_age);
            cloud.seeders.retain(|_, p| now.saturating_duration_since(p.last_seen) < max_age);
            removed += before - cloud.leechers.len() - cloud.seeders.len();
        }
        if removed > 0 {
            tracing::debug!("expired {} swarm members", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use crate::tracker::AnnounceResponse;

    const HASH: ID = [0xab; 20];
    const REMOTE: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));

    fn request(peer: u8, left: u64, event: Option<Event>) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: HASH,
            peer_id: [peer; 20],
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, peer)), 6881),
            uploaded: 0,
            downloaded: 0,
            left,
            event,
            num_want: None,
            compact: true,
            tracker_id: None,
        }
    }

    fn tracker() -> Tracker {
        let mut tracker = Tracker::with_seed(Duration::from_secs(1800), 5);
        tracker.register(HASH);
        tracker
    }

    fn peers(reply: &AnnounceReply) -> Vec<SocketAddr> {
        let raw = reply.to_bytes().unwrap();
        AnnounceResponse::from_bytes(&raw).unwrap().peers
    }

    #[test]
    fn test_started_excludes_requester() {
        let mut tracker = tracker();
        let now = Instant::now();

        let reply = tracker.announce(&request(1, 100, Some(Event::Started)), now).unwrap();
        assert!(peers(&reply).is_empty());
        assert_eq!(reply.incomplete, 1);

        let mut req = request(2, 100, Some(Event::Started));
        req.tracker_id = Some(reply.tracker_id.clone());
        let reply = tracker.announce(&req, now).unwrap();
        assert_eq!(peers(&reply), vec!["10.0.0.1:6881".parse().unwrap()]);
        assert_eq!(reply.incomplete, 2);
        assert_eq!(reply.interval, 1800);

        // The id survives the round trip through bencode.
        assert_eq!(reply.tracker_id, tracker.id());
        let parsed = AnnounceResponse::from_bytes(&reply.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.tracker_id.as_deref(), Some(tracker.id()));
    }

    #[test]
    fn test_unknown_torrent() {
        let mut tracker = tracker();
        let mut req = request(1, 100, Some(Event::Started));
        req.info_hash = [0; 20];
        assert_eq!(tracker.announce(&req, Instant::now()), Err(AnnounceError::NotFound));
    }

    #[test]
    fn test_completed_and_stopped() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.announce(&request(1, 100, Some(Event::Started)), now).unwrap();
        tracker.announce(&request(2, 0, Some(Event::Started)), now).unwrap();

        let reply = tracker.announce(&request(1, 0, Some(Event::Completed)), now).unwrap();
        assert_eq!((reply.complete, reply.incomplete), (2, 0));
        // Seeders aren't told about other seeders.
        assert!(peers(&reply).is_empty());
        assert_eq!(tracker.cloud(&HASH).unwrap().completed, 1);

        let reply = tracker.announce(&request(1, 0, Some(Event::Stopped)), now).unwrap();
        assert_eq!(reply.complete, 1);
        assert!(peers(&reply).is_empty());

        let scrape = tracker.scrape(&[HASH]);
        assert_eq!(
            scrape.files.get(&ByteBuf::from(HASH.to_vec())),
            Some(&ScrapeFile { complete: 1, downloaded: 1, incomplete: 0 })
        );
    }

    #[test]
    fn test_dict_peer_list() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.announce(&request(1, 100, None), now).unwrap();
        let mut req = request(2, 100, None);
        req.compact = false;
        let reply = tracker.announce(&req, now).unwrap();
        match &reply.peers {
            PeerList::Dict(peers) => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].ip, "10.0.0.1");
                assert_eq!(peers[0].peer_id.as_slice(), &[1u8; 20]);
            },
            other => panic!("expected dict peers, got {:?}", other),
        }
        assert_eq!(peers(&reply), vec!["10.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn test_expire() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.announce(&request(1, 100, None), now).unwrap();
        tracker.announce(&request(2, 100, None), now + Duration::from_secs(3600)).unwrap();
        assert_eq!(tracker.expire(now + Duration::from_secs(5400)), 1);
        assert_eq!(tracker.cloud(&HASH).unwrap().leechers.len(), 1);
    }

    #[test]
    fn test_parse_query() {
        let query = format!(
            "info_hash={}&peer_id={}&port=6881&uploaded=1&downloaded=2&left=3&event=started&numwant=10&compact=0",
            urlencoding::encode_binary(&HASH),
            urlencoding::encode_binary(&[b'x'; 20]),
        );
        let req = AnnounceRequest::from_query(&query, REMOTE).unwrap();
        assert_eq!(req.info_hash, HASH);
        assert_eq!(req.address, SocketAddr::new(REMOTE, 6881));
        assert_eq!((req.uploaded, req.downloaded, req.left), (1, 2, 3));
        assert_eq!(req.event, Some(Event::Started));
        assert_eq!(req.num_want, Some(10));
        assert!(!req.compact);
        assert_eq!(req.tracker_id, None);

        let req = AnnounceRequest::from_query(&format!("{}&trackerid=a1b2", query), REMOTE).unwrap();
        assert_eq!(req.tracker_id.as_deref(), Some("a1b2"));
    }

    #[test]
    fn test_parse_query_errors() {
        let ids = format!(
            "info_hash={}&peer_id={}&port=6881",
            urlencoding::encode_binary(&HASH),
            urlencoding::encode_binary(&[b'x'; 20]),
        );
        // Leaving only needs ids.
        assert!(AnnounceRequest::from_query(&format!("{}&event=stopped", ids), REMOTE).is_ok());
        assert_eq!(
            AnnounceRequest::from_query(&ids, REMOTE),
            Err(AnnounceError::BadRequest("missing left".into()))
        );
        assert!(matches!(
            AnnounceRequest::from_query(&format!("{}&left=0&event=paused", ids), REMOTE),
            Err(AnnounceError::BadRequest(_))
        ));
        assert!(matches!(
            AnnounceRequest::from_query("info_hash=abc&peer_id=x&port=1&left=0", REMOTE),
            Err(AnnounceError::BadRequest(_))
        ));
    }

    #[test]
    fn test_scrape_hashes() {
        let query = format!("info_hash={}&info_hash={}", urlencoding::encode_binary(&HASH), urlencoding::encode_binary(&[1; 20]));
        assert_eq!(scrape_hashes(&query).unwrap(), vec![HASH, [1; 20]]);
        assert!(scrape_hashes("").unwrap().is_empty());
        assert!(scrape_hashes("info_hash=short").is_err());
    }

    #[test]
    fn test_failure_body() {
        assert_eq!(failure_body("torrent not found"), b"d14:failure reason17:torrent not founde".to_vec());
    }
}
