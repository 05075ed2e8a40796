use url::Url;
use crate::ID;

mod http;
mod discovery;
pub mod server;
pub mod service;

pub use http::{AnnounceResponse, ScrapeFile, ScrapeResponse};
pub(crate) use discovery::SwarmDiscovery;
pub use discovery::{keep_outbound, CandidateCache};
pub use server::{AnnounceError, AnnounceRequest, Tracker};

type Result<T> = std::result::Result<T, TrackerError>;

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    RequestError(String),

    #[error("error deserializing response: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("timeout")]
    Timeout,

    #[error("response error: {0}")]
    ResponseError(String),

}

#[derive(Debug, Clone)]
pub struct AnnounceParams {

    // Hash of info dict.
    pub info_hash: ID,

    // Urlencoded 20-byte string used as a unique ID for the client.
    pub client_id: ID,

    // Port we accept connections on.
    pub port: u16,

    // The total amount uploaded since the client sent the 'started' event.
    pub uploaded: u64,

    // The total amount downloaded since the client sent the 'started' event.
    pub downloaded: u64,

    // The number of bytes this client still has to download.
    pub left: u64,

    // If not specified, then this request is one performed at regular intervals.
    pub event: Option<Event>,

    // Number of peers that the client would like to receive from the tracker.
    pub num_want: Option<usize>,

    // Echoed back from an earlier response.
    pub tracker_id: Option<String>,

}

impl AnnounceParams {

    pub fn url(&self, announce: &Url) -> String {
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            announce.as_str(),
            if announce.query().is_some() { "&" } else { "?" },
            urlencoding::encode_binary(&self.info_hash),
            urlencoding::encode_binary(&self.client_id),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left,
        );
        if let Some(event) = self.event {
            url.push_str(&format!("&event={}", event));
        }
        if let Some(num_peers) = self.num_want {
            url.push_str(&format!("&numwant={}", num_peers));
        }
        if let Some(tracker_id) = &self.tracker_id {
            url.push_str(&format!("&trackerid={}", urlencoding::encode(tracker_id)));
        }
        url
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {

    Started,

    Completed,

    Stopped,

}

impl Event {

    // Higher priority announces replace lower ones still in flight.
    pub fn priority(event: Option<Event>) -> u8 {
        match event {
            None => 0,
            Some(Event::Started) => 1,
            Some(Event::Completed) => 2,
            Some(Event::Stopped) => 3,
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Completed => write!(f, "completed"),
            Event::Started => write!(f, "started"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

impl std::str::FromStr for Event {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "started" => Ok(Event::Started),
            "completed" => Ok(Event::Completed),
            "stopped" => Ok(Event::Stopped),
            other => Err(format!("unknown event: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announce_url() {
        let params = AnnounceParams {
            info_hash: [0xff; 20],
            client_id: *b"-SW0100-abcdefghijkl",
            port: 6881,
            uploaded: 10,
            downloaded: 20,
            left: 30,
            event: Some(Event::Started),
            num_want: Some(50),
            tracker_id: None,
        };
        let url = params.url(&Url::parse("http://tracker.test:6969/announce").unwrap());
        assert!(url.starts_with("http://tracker.test:6969/announce?info_hash=%FF%FF"));
        assert!(url.contains("&peer_id=-SW0100-abcdefghijkl&port=6881&uploaded=10&downloaded=20&left=30&compact=1"));
        assert!(url.ends_with("&event=started&numwant=50"));
    }

    #[test]
    fn test_event_priority() {
        assert!(Event::priority(Some(Event::Stopped)) > Event::priority(Some(Event::Completed)));
        assert!(Event::priority(Some(Event::Completed)) > Event::priority(Some(Event::Started)));
        assert!(Event::priority(Some(Event::Started)) > Event::priority(None));
        assert_eq!("stopped".parse::<Event>(), Ok(Event::Stopped));
        assert!("paused".parse::<Event>().is_err());
    }
}
