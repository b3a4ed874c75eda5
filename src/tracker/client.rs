//! Tracker client
//!
//! One client per announce URL, shared by every torrent that lists it.

use anyhow::Result;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::tracker::{
    open_transport, AnnounceRequest, AnnounceResponse, ScrapeResponse, TrackerProtocol, TrackerTransport,
};

/// Consecutive failures after which a client is no longer used
pub const MAX_TRACKER_FAILURES: u32 = 3;

pub struct TrackerClient {
    id: u32,
    url: String,
    protocol: Option<TrackerProtocol>,
    transport: Arc<dyn TrackerTransport>,
    failures: AtomicU32,
}

impl TrackerClient {
    /// Open a client for `url`, choosing the transport from its scheme
    pub fn open(id: u32, url: &str) -> Result<Self> {
        Ok(Self::new(id, open_transport(url)?))
    }

    pub fn new(id: u32, transport: Arc<dyn TrackerTransport>) -> Self {
        let url = transport.url().to_string();
        Self { id, protocol: TrackerProtocol::from_url(&url), url, transport, failures: AtomicU32::new(0) }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// `None` for transports that are not bound to a URL scheme
    pub fn protocol(&self) -> Option<TrackerProtocol> {
        self.protocol
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> bool {
        self.failures() < MAX_TRACKER_FAILURES
    }

    pub async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let result = self.transport.announce(request).await;
        self.record(&result);
        result
    }

    pub async fn scrape(&self, info_hash: &[u8; 20]) -> Result<ScrapeResponse> {
        let result = self.transport.scrape(info_hash).await;
        self.record(&result);
        result
    }

    fn record<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => {
                if self.failures.swap(0, Ordering::Relaxed) > 0 {
                    debug!("Tracker {} recovered", self.url);
                }
            }
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures == MAX_TRACKER_FAILURES {
                    warn!("Tracker {} unavailable after {} failures: {}", self.url, failures, e);
                } else {
                    debug!("Tracker {} failed ({}): {}", self.url, failures, e);
                }
            }
        }
    }
}

impl std::fmt::Debug for TrackerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerClient")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("failures", &self.failures())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::TorrentError;
    use crate::tracker::TrackerEvent;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted transport recording every announced event
    pub(crate) struct MockTransport {
        pub url: String,
        pub peers: Vec<SocketAddr>,
        pub interval: u32,
        pub fail: AtomicBool,
        pub events: Mutex<Vec<TrackerEvent>>,
        /// Events whose announce ran to the end
        pub answered: Mutex<Vec<TrackerEvent>>,
        /// Latency of every announce, in milliseconds
        pub delay_ms: AtomicU64,
    }

    impl MockTransport {
        pub fn new(url: &str, peers: Vec<SocketAddr>, interval: u32) -> Arc<Self> {
            Arc::new(Self {
                url: url.to_string(),
                peers,
                interval,
                fail: AtomicBool::new(false),
                events: Mutex::new(Vec::new()),
                answered: Mutex::new(Vec::new()),
                delay_ms: AtomicU64::new(0),
            })
        }

        pub fn answered(&self) -> Vec<TrackerEvent> {
            self.answered.lock().unwrap().clone()
        }

        pub fn events(&self) -> Vec<TrackerEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TrackerTransport for MockTransport {
        fn url(&self) -> &str {
            &self.url
        }

        async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
            self.events.lock().unwrap().push(request.event);
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(TorrentError::timeout_with_target("mock announce", self.url.clone()).into());
            }
            self.answered.lock().unwrap().push(request.event);
            Ok(AnnounceResponse {
                interval: self.interval,
                complete: Some(2),
                incomplete: Some(5),
                peers: self.peers.clone(),
                ..AnnounceResponse::default()
            })
        }

        async fn scrape(&self, _info_hash: &[u8; 20]) -> Result<ScrapeResponse> {
            Ok(ScrapeResponse { complete: 2, downloaded: 9, incomplete: 5 })
        }
    }

    #[tokio::test]
    async fn test_unavailable_after_three_failures() {
        let transport = MockTransport::new("udp://mock:1", Vec::new(), 1800);
        transport.fail.store(true, Ordering::SeqCst);
        let client = TrackerClient::new(1, transport.clone());
        assert_eq!(client.protocol(), Some(TrackerProtocol::Udp));
        let request = AnnounceRequest::new([1u8; 20], [2u8; 20], 6881);

        for _ in 0..2 {
            assert!(client.announce(&request).await.is_err());
            assert!(client.available());
        }
        assert!(client.announce(&request).await.is_err());
        assert!(!client.available());
        assert_eq!(client.failures(), 3);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let transport = MockTransport::new("http://mock/announce", Vec::new(), 1800);
        let client = TrackerClient::new(1, transport.clone());
        let request = AnnounceRequest::new([1u8; 20], [2u8; 20], 6881);

        transport.fail.store(true, Ordering::SeqCst);
        assert!(client.announce(&request).await.is_err());
        transport.fail.store(false, Ordering::SeqCst);
        assert!(client.announce(&request).await.is_ok());
        assert_eq!(client.failures(), 0);
        assert_eq!(client.scrape(&[1u8; 20]).await.unwrap().downloaded, 9);
    }
}
