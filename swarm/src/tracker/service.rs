use std::{
    convert::Infallible,
    future::Future,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};
use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    body::Incoming,
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1,
    service::service_fn,
    Request,
    Response,
    StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use super::server::{failure_body, scrape_hashes, AnnounceError, AnnounceRequest, Tracker};

pub type SharedTracker = Arc<Mutex<Tracker>>;

// Accepts HTTP connections until `shutdown` resolves, expiring silent swarm
// members once per announce interval.
pub async fn serve<F>(listener: TcpListener, tracker: SharedTracker, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    let interval = tracker.lock().unwrap_or_else(PoisonError::into_inner).interval();
    let mut expiry = tokio::time::interval(interval);
    tracing::info!("tracker listening on {}", listener.local_addr()?);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {

            _ = &mut shutdown => {
                tracing::info!("tracker shutting down");
                return Ok(());
            }

            _ = expiry.tick() => {
                tracker.lock().unwrap_or_else(PoisonError::into_inner).expire(Instant::now());
            }

            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("accept failed: {}", e);
                        continue;
                    }
                };
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let response = handle(&tracker, req, remote);
                        async move { Ok::<_, Infallible>(response) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
                        tracing::debug!("connection from {} failed: {}", remote, e);
                    }
                });
            }
        }
    }
}

fn handle(tracker: &Mutex<Tracker>, req: Request<Incoming>, remote: SocketAddr) -> Response<Full<Bytes>> {
    let query = req.uri().query().unwrap_or("");
    tracing::trace!("{} {} from {}", req.method(), req.uri().path(), remote);

    match req.uri().path() {

        "/announce" => {
            let reply = AnnounceRequest::from_query(query, remote.ip()).and_then(|announce| {
                tracker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .announce(&announce, Instant::now())
            });
            match reply.map(|reply| reply.to_bytes()) {
                Ok(Ok(body)) => respond(StatusCode::OK, body),
                Ok(Err(e)) => {
                    tracing::error!("could not encode announce reply: {}", e);
                    respond(StatusCode::INTERNAL_SERVER_ERROR, failure_body("internal error"))
                },
                Err(e) => reject(e),
            }
        },

        "/scrape" => {
            let files = scrape_hashes(query)
                .map(|hashes| tracker.lock().unwrap_or_else(PoisonError::into_inner).scrape(&hashes));
            match files.map(|files| serde_bencode::to_bytes(&files)) {
                Ok(Ok(body)) => respond(StatusCode::OK, body),
                Ok(Err(e)) => {
                    tracing::error!("could not encode scrape reply: {}", e);
                    respond(StatusCode::INTERNAL_SERVER_ERROR, failure_body("internal error"))
                },
                Err(e) => reject(e),
            }
        },

        _ => respond(StatusCode::NOT_FOUND, failure_body("not found")),
    }
}

fn reject(error: AnnounceError) -> Response<Full<Bytes>> {
    tracing::debug!("rejecting request: {}", error);
    let status = match error {
        AnnounceError::NotFound => StatusCode::NOT_FOUND,
        AnnounceError::BadRequest(_) => StatusCode::BAD_REQUEST,
    };
    respond(status, failure_body(&error.to_string()))
}

fn respond(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::{tracker::AnnounceResponse, ID};

    const HASH: ID = [0x42; 20];

    async fn start() -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut tracker = Tracker::with_seed(Duration::from_secs(60), 1);
        tracker.register(HASH);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(serve(listener, Arc::new(Mutex::new(tracker)), async move {
            let _ = rx.await;
        }));
        (addr, tx)
    }

    fn announce_url(addr: SocketAddr, hash: &ID, peer: u8, port: u16, event: &str) -> String {
        format!(
            "http://{}/announce?info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left=10&event={}",
            addr,
            urlencoding::encode_binary(hash),
            urlencoding::encode_binary(&[peer; 20]),
            port,
            event,
        )
    }

    #[tokio::test]
    async fn test_announce_over_http() {
        let (addr, _shutdown) = start().await;

        let first = reqwest::get(announce_url(addr, &HASH, 1, 7001, "started")).await.unwrap();
        assert_eq!(first.status(), 200);
        let body = first.bytes().await.unwrap();
        assert!(AnnounceResponse::from_bytes(&body).unwrap().peers.is_empty());

        let second = reqwest::get(announce_url(addr, &HASH, 2, 7002, "started")).await.unwrap();
        let body = second.bytes().await.unwrap();
        let response = AnnounceResponse::from_bytes(&body).unwrap();
        assert_eq!(response.peers, vec!["127.0.0.1:7001".parse().unwrap()]);
        assert_eq!(response.interval, Some(60));
        assert_eq!(response.incomplete, Some(2));
    }

    #[tokio::test]
    async fn test_rejections() {
        let (addr, _shutdown) = start().await;

        let unknown = reqwest::get(announce_url(addr, &[0; 20], 1, 7001, "started")).await.unwrap();
        assert_eq!(unknown.status(), 404);
        assert_eq!(&unknown.bytes().await.unwrap()[..], b"d14:failure reason17:torrent not founde");

        let bad_event = reqwest::get(announce_url(addr, &HASH, 1, 7001, "paused")).await.unwrap();
        assert_eq!(bad_event.status(), 400);

        let missing = reqwest::get(format!("http://{}/announce?port=1", addr)).await.unwrap();
        assert_eq!(missing.status(), 400);

        let other = reqwest::get(format!("http://{}/index.html", addr)).await.unwrap();
        assert_eq!(other.status(), 404);
    }

    #[tokio::test]
    async fn test_scrape_over_http() {
        let (addr, _shutdown) = start().await;
        reqwest::get(announce_url(addr, &HASH, 1, 7001, "started")).await.unwrap();

        let url = format!("http://{}/scrape?info_hash={}", addr, urlencoding::encode_binary(&HASH));
        let body = reqwest::get(url).await.unwrap().bytes().await.unwrap();
        let scrape: crate::tracker::ScrapeResponse = serde_bencode::from_bytes(&body).unwrap();
        let file = scrape.files.values().next().unwrap();
        assert_eq!((file.complete, file.incomplete, file.downloaded), (0, 1, 0));
    }
}
