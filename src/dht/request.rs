//! DHT request correlation
//!
//! Every outbound query registers a [`ResponseSlot`] under a fresh
//! transaction id. The slot is resolved exactly once, either by the
//! matching response or by the timeout, whichever happens first. Async
//! callers await the slot; synchronous callers block on it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::dht::message::{DhtMessage, QueryType};
use crate::dht::node::NodeId;

/// How long a query may stay unanswered
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(4);

/// Final state of a request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// A response or error reply with the matching transaction id
    Answered(DhtMessage),
    /// Nothing arrived in time
    TimedOut,
}

impl RequestOutcome {
    /// The reply, if one arrived
    pub fn into_message(self) -> Option<DhtMessage> {
        match self {
            RequestOutcome::Answered(message) => Some(message),
            RequestOutcome::TimedOut => None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One-shot completion cell shared by the issuer and the receive loop
#[derive(Debug, Default)]
pub struct ResponseSlot {
    state: Mutex<Option<RequestOutcome>>,
    condvar: Condvar,
    notify: Notify,
}

impl ResponseSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the slot; returns false if it was already resolved
    pub fn complete(&self, outcome: RequestOutcome) -> bool {
        {
            let mut state = lock(&self.state);
            if state.is_some() {
                return false;
            }
            *state = Some(outcome);
        }
        self.condvar.notify_one();
        self.notify.notify_one();
        true
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.state).is_some()
    }

    /// Current outcome, if resolved
    pub fn outcome(&self) -> Option<RequestOutcome> {
        lock(&self.state).clone()
    }

    /// Await the outcome, resolving to `TimedOut` after `timeout`
    pub async fn wait(&self, timeout: Duration) -> RequestOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            // notify_one stores a permit, so a completion racing this
            // check still wakes the wait below
            if tokio::time::timeout_at(deadline, self.notify.notified()).await.is_err() {
                self.complete(RequestOutcome::TimedOut);
                return self.outcome().unwrap_or(RequestOutcome::TimedOut);
            }
        }
    }

    /// Block the calling thread until the outcome is known
    ///
    /// Must not be called from inside the async runtime.
    pub fn blocking_wait(&self, timeout: Duration) -> RequestOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if let Some(outcome) = state.as_ref() {
                return outcome.clone();
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                *state = Some(RequestOutcome::TimedOut);
                return RequestOutcome::TimedOut;
            }
            state = self
                .condvar
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }
}

/// Bookkeeping for a request that left the registry
#[derive(Debug, Clone)]
pub struct PendingInfo {
    pub transaction_id: Vec<u8>,
    pub node_id: Option<NodeId>,
    pub addr: SocketAddr,
    pub query_type: QueryType,
    pub elapsed: Duration,
}

#[derive(Debug)]
struct PendingEntry {
    slot: Arc<ResponseSlot>,
    node_id: Option<NodeId>,
    addr: SocketAddr,
    query_type: QueryType,
    created_at: Instant,
}

impl PendingEntry {
    fn info(&self, transaction_id: Vec<u8>) -> PendingInfo {
        PendingInfo {
            transaction_id,
            node_id: self.node_id,
            addr: self.addr,
            query_type: self.query_type,
            elapsed: self.created_at.elapsed(),
        }
    }
}

/// In-flight requests keyed by transaction id
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<Vec<u8>, PendingEntry>>,
    next_id: AtomicU16,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a transaction id that is not in flight and register a slot
    pub fn register(
        &self,
        addr: SocketAddr,
        node_id: Option<NodeId>,
        query_type: QueryType,
    ) -> (Vec<u8>, Arc<ResponseSlot>) {
        let slot = Arc::new(ResponseSlot::new());
        let mut entries = lock(&self.entries);
        let transaction_id = loop {
            let candidate = self.next_id.fetch_add(1, Ordering::Relaxed).to_be_bytes().to_vec();
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        entries.insert(
            transaction_id.clone(),
            PendingEntry {
                slot: Arc::clone(&slot),
                node_id,
                addr,
                query_type,
                created_at: Instant::now(),
            },
        );
        trace!("Registered {} transaction {} to {}", query_type, hex::encode(&transaction_id), addr);
        (transaction_id, slot)
    }

    /// Hand a reply to the request with the same transaction id
    ///
    /// Matching is by exact byte comparison of the transaction id only.
    /// Replies with an unknown id return `None` and have no side effects.
    pub fn resolve(&self, message: DhtMessage) -> Option<PendingInfo> {
        let transaction_id = message.transaction_id().to_vec();
        let entry = lock(&self.entries).remove(&transaction_id)?;
        let info = entry.info(transaction_id);
        entry.slot.complete(RequestOutcome::Answered(message));
        Some(info)
    }

    /// Drop a request whose waiter gave up
    pub fn cancel(&self, transaction_id: &[u8]) -> Option<PendingInfo> {
        let entry = lock(&self.entries).remove(transaction_id)?;
        entry.slot.complete(RequestOutcome::TimedOut);
        Some(entry.info(transaction_id.to_vec()))
    }

    /// Time out every request older than `max_age`
    pub fn sweep(&self, max_age: Duration) -> Vec<PendingInfo> {
        let expired: Vec<(Vec<u8>, PendingEntry)> = {
            let mut entries = lock(&self.entries);
            let ids: Vec<Vec<u8>> = entries
                .iter()
                .filter(|(_, e)| e.created_at.elapsed() >= max_age)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        if !expired.is_empty() {
            debug!("Swept {} expired DHT transactions", expired.len());
        }

        expired
            .into_iter()
            .map(|(id, entry)| {
                entry.slot.complete(RequestOutcome::TimedOut);
                entry.info(id)
            })
            .collect()
    }

    /// Number of requests in flight
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
