//! HTTP tracker client
//!
//! Announces are plain GET requests with the binary fields percent-encoded
//! by hand; `reqwest` would re-encode them as UTF-8 otherwise.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::bencode::{decode, BencodeDict};
use crate::dht::message::parse_compact_peers;
use crate::error::TorrentError;
use crate::tracker::{parse_compact_peers6, AnnounceRequest, AnnounceResponse, ScrapeResponse, TrackerTransport};

/// Request timeout of one HTTP exchange
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval assumed when the tracker leaves it out
const FALLBACK_INTERVAL: u32 = 1800;

pub struct HttpTracker {
    client: reqwest::Client,
    url: String,
    /// `tracker id` handed out by the tracker, echoed on later announces
    tracker_id: Mutex<Option<String>>,
}

impl HttpTracker {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let parsed = url::Url::parse(&url)
            .map_err(|e| TorrentError::tracker_error_full("Invalid announce URL", url.clone(), e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TorrentError::tracker_error_with_tracker("Not an HTTP tracker", url).into());
        }
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("swarm-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, url, tracker_id: Mutex::new(None) })
    }

    pub fn tracker_id(&self) -> Option<String> {
        self.tracker_id.lock().ok().and_then(|id| id.clone())
    }

    /// Full announce URL for `request`
    pub fn announce_url(&self, request: &AnnounceRequest) -> String {
        let mut url = self.url.clone();
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(&format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&key={:08x}",
            urlencoding::encode_binary(&request.info_hash),
            urlencoding::encode_binary(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
            request.key,
        ));
        if request.numwant >= 0 {
            url.push_str(&format!("&numwant={}", request.numwant));
        }
        if let Some(event) = request.event.as_str() {
            url.push_str("&event=");
            url.push_str(event);
        }
        if let Some(id) = self.tracker_id() {
            url.push_str("&trackerid=");
            url.push_str(&urlencoding::encode(&id));
        }
        url
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TorrentError::network_error_full("Tracker request failed", self.url.clone(), e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TorrentError::tracker_error_with_tracker(format!("HTTP status {}", status), self.url.clone()).into());
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| TorrentError::network_error_full("Failed to read tracker response", self.url.clone(), e.to_string()))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl TrackerTransport for HttpTracker {
    fn url(&self) -> &str {
        &self.url
    }

    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let url = self.announce_url(request);
        debug!("HTTP announce ({}) to {}", request.event, self.url);
        let body = self.get(&url).await?;
        let response = parse_announce(&body, &self.url)?;
        if let Some(id) = &response.tracker_id {
            if let Ok(mut current) = self.tracker_id.lock() {
                *current = Some(id.clone());
            }
        }
        if let Some(warning) = &response.warning {
            warn!("Tracker {} warning: {}", self.url, warning);
        }
        Ok(response)
    }

    async fn scrape(&self, info_hash: &[u8; 20]) -> Result<ScrapeResponse> {
        let base = scrape_url(&self.url)
            .ok_or_else(|| TorrentError::tracker_error_with_tracker("Tracker does not support scrape", self.url.clone()))?;
        let sep = if base.contains('?') { '&' } else { '?' };
        let url = format!("{}{}info_hash={}", base, sep, urlencoding::encode_binary(info_hash));
        let body = self.get(&url).await?;
        parse_scrape(&body, info_hash, &self.url)
    }
}

impl std::fmt::Debug for HttpTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTracker").field("url", &self.url).finish()
    }
}

/// Scrape URL of an announce URL: the last path segment must start with
/// `announce`, which is replaced by `scrape`
pub fn scrape_url(announce: &str) -> Option<String> {
    let (base, query) = match announce.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (announce, None),
    };
    let slash = base.rfind('/')?;
    let segment = base[slash + 1..].strip_prefix("announce")?;
    let mut url = format!("{}/scrape{}", &base[..slash], segment);
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    Some(url)
}

fn response_dict(body: &[u8], tracker: &str) -> Result<BencodeDict> {
    let value = decode(body).map_err(|e| TorrentError::tracker_error_full("Unreadable tracker response", tracker, e.to_string()))?;
    let dict = value
        .into_dict()
        .ok_or_else(|| TorrentError::tracker_error_with_tracker("Tracker response is not a dictionary", tracker))?;
    if let Some(reason) = dict.get_bytes("failure reason") {
        return Err(TorrentError::tracker_error_with_tracker(String::from_utf8_lossy(reason), tracker).into());
    }
    Ok(dict)
}

fn counter(dict: &BencodeDict, key: &str) -> Option<u32> {
    dict.get_integer(key).and_then(|v| u32::try_from(v).ok())
}

/// Parse a bencoded announce response
pub fn parse_announce(body: &[u8], tracker: &str) -> Result<AnnounceResponse> {
    let dict = response_dict(body, tracker)?;

    let mut peers = match dict.get("peers") {
        Some(value) => match (value.as_bytes(), value.as_list()) {
            (Some(compact), _) => parse_compact_peers(compact)?,
            (_, Some(list)) => list
                .iter()
                .filter_map(|entry| entry.as_dict())
                .filter_map(|entry| {
                    let ip: IpAddr = entry.get_str("ip")?.parse().ok()?;
                    let port = u16::try_from(entry.get_integer("port")?).ok()?;
                    Some(SocketAddr::new(ip, port))
                })
                .collect(),
            _ => Vec::new(),
        },
        None => Vec::new(),
    };
    if let Some(compact6) = dict.get_bytes("peers6") {
        peers.extend(parse_compact_peers6(compact6)?);
    }

    Ok(AnnounceResponse {
        interval: counter(&dict, "interval").unwrap_or(FALLBACK_INTERVAL),
        min_interval: counter(&dict, "min interval"),
        complete: counter(&dict, "complete"),
        incomplete: counter(&dict, "incomplete"),
        peers,
        warning: dict.get_bytes("warning message").map(|w| String::from_utf8_lossy(w).into_owned()),
        tracker_id: dict.get_bytes("tracker id").map(|id| String::from_utf8_lossy(id).into_owned()),
    })
}

/// Parse a bencoded scrape response for one torrent
pub fn parse_scrape(body: &[u8], info_hash: &[u8; 20], tracker: &str) -> Result<ScrapeResponse> {
    let dict = response_dict(body, tracker)?;
    let entry = dict
        .get_dict("files")
        .and_then(|files| files.get(info_hash))
        .and_then(|entry| entry.as_dict())
        .ok_or_else(|| TorrentError::tracker_error_with_tracker("Torrent missing from scrape response", tracker))?;
    Ok(ScrapeResponse {
        complete: counter(entry, "complete").unwrap_or(0),
        downloaded: counter(entry, "downloaded").unwrap_or(0),
        incomplete: counter(entry, "incomplete").unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::BencodeValue;
    use crate::tracker::TrackerEvent;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_scrape_url() {
        assert_eq!(scrape_url("http://t.example/announce").as_deref(), Some("http://t.example/scrape"));
        assert_eq!(scrape_url("http://t.example/x/announce.php").as_deref(), Some("http://t.example/x/scrape.php"));
        assert_eq!(
            scrape_url("http://t.example/announce?passkey=abc").as_deref(),
            Some("http://t.example/scrape?passkey=abc")
        );
        assert_eq!(scrape_url("http://t.example/a"), None);
        assert_eq!(scrape_url("http://t.example/announce/x"), None);
    }

    #[test]
    fn test_announce_url_encodes_binary_fields() {
        let tracker = HttpTracker::new("http://t.example/announce?passkey=abc").unwrap();
        let mut request = AnnounceRequest::new([0xff; 20], *b"-SE0100-abcdefghijkl", 6881).with_event(TrackerEvent::Started);
        request.numwant = 50;
        let url = tracker.announce_url(&request);
        assert!(url.starts_with("http://t.example/announce?passkey=abc&info_hash=%FF%FF"));
        assert!(url.contains("&peer_id=-SE0100-abcdefghijkl"));
        assert!(url.contains("&compact=1"));
        assert!(url.contains("&numwant=50"));
        assert!(url.ends_with("&event=started"));
        assert!(!url.contains("trackerid"));
    }

    #[test]
    fn test_parse_compact_announce() {
        let body = b"d8:completei5e10:incompletei3e8:intervali900e12:min intervali60e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x0a\x00\x00\x02\x1a\xe2e";
        let response = parse_announce(body, "t").unwrap();
        assert_eq!(response.interval, 900);
        assert_eq!(response.min_interval, Some(60));
        assert_eq!(response.complete, Some(5));
        assert_eq!(response.incomplete, Some(3));
        assert_eq!(
            response.peers,
            vec!["127.0.0.1:6881".parse().unwrap(), "10.0.0.2:6882".parse().unwrap()]
        );
    }

    #[test]
    fn test_parse_dictionary_peers() {
        let body = b"d8:intervali1800e5:peersld2:ip9:10.0.0.257:peer id20:aaaaaaaaaaaaaaaaaaaa4:porti51413eed2:ip3:bad4:porti1eeee";
        let response = parse_announce(body, "t").unwrap();
        assert_eq!(response.peers, vec!["10.0.0.25:51413".parse().unwrap()]);
    }

    #[test]
    fn test_failure_reason_is_tracker_error() {
        let err = parse_announce(b"d14:failure reason9:not founde", "t").unwrap_err();
        match crate::error::kind_of(&err) {
            Some(TorrentError::TrackerError { message, .. }) => assert_eq!(message, "not found"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_parse_scrape() {
        let ih = [7u8; 20];
        let mut entry = BencodeDict::new();
        entry.insert("complete", 4i64);
        entry.insert("downloaded", 10i64);
        entry.insert("incomplete", 2i64);
        let mut files = BencodeDict::new();
        files.insert(ih, entry);
        let body = BencodeValue::Dict(BencodeDict::new().with("files", files)).encode();
        let scrape = parse_scrape(&body, &ih, "t").unwrap();
        assert_eq!(scrape, ScrapeResponse { complete: 4, downloaded: 10, incomplete: 2 });
        assert!(parse_scrape(&body, &[8u8; 20], "t").is_err());
    }

    /// Serve one canned body per connection and report each request line
    async fn serve(bodies: Vec<Vec<u8>>) -> (String, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            for body in bodies {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                let line = String::from_utf8_lossy(&request).lines().next().unwrap_or_default().to_string();
                tx.send(line).unwrap();
                let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", body.len());
                socket.write_all(head.as_bytes()).await.unwrap();
                socket.write_all(&body).await.unwrap();
                socket.shutdown().await.ok();
            }
        });
        (format!("http://{}/announce", addr), rx)
    }

    #[tokio::test]
    async fn test_announce_echoes_tracker_id() {
        let first = b"d8:intervali600e10:tracker id3:abc5:peers6:\x7f\x00\x00\x01\x1a\xe1e".to_vec();
        let second = b"d8:intervali600e5:peers0:e".to_vec();
        let (url, mut requests) = serve(vec![first, second]).await;
        let tracker = HttpTracker::new(url).unwrap();
        let request = AnnounceRequest::new([1u8; 20], [2u8; 20], 6881);

        let response = tracker.announce(&request).await.unwrap();
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
        assert_eq!(tracker.tracker_id().as_deref(), Some("abc"));
        assert!(!requests.recv().await.unwrap().contains("trackerid"));

        let response = tracker.announce(&request).await.unwrap();
        assert!(response.peers.is_empty());
        assert!(requests.recv().await.unwrap().contains("&trackerid=abc"));
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert!(HttpTracker::new("udp://t.example:80").is_err());
        assert!(HttpTracker::new("::nope").is_err());
    }
}
