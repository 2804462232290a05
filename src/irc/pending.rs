/// Correlation of multi-line replies (WHO, LIST) with the requests that
/// asked for them.
///
/// A request registers a pending entry keyed by its target, informational
/// lines append to the entry, and the terminal line resolves it. Each entry
/// carries a deadline timer; whichever of terminal line and deadline removes
/// the entry first wins, and the other becomes a no-op.
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestKind {
    Who,
    List,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Who => "WHO",
            Self::List => "LIST",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("{0} request timed out")]
    Timeout(RequestKind),
    #[error("{0} request could not be sent: relay connection is down")]
    Disconnected(RequestKind),
}

/// One RPL_WHOREPLY (352) row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WhoEntry {
    pub channel: String,
    pub username: String,
    pub hostname: String,
    pub server: String,
    pub nick: String,
    /// `H`/`G` followed by `*` and membership glyphs.
    pub flags: String,
    pub hopcount: u32,
    pub realname: String,
}

impl WhoEntry {
    pub fn is_away(&self) -> bool {
        self.flags.starts_with('G')
    }

    pub fn is_network_operator(&self) -> bool {
        self.flags.contains('*')
    }
}

/// One RPL_LIST (322) row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListEntry {
    pub channel: String,
    pub user_count: usize,
    pub topic: String,
}

type Reply<T> = Result<Vec<T>, RequestError>;

struct Pending<T> {
    /// Registration order; servers answer commands in the order sent.
    seq: u64,
    waiters: Vec<oneshot::Sender<Reply<T>>>,
    results: Vec<T>,
    truncated: bool,
    timer: Option<JoinHandle<()>>,
}

impl<T: Clone> Pending<T> {
    fn finish(mut self, reply: Reply<T>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        for waiter in self.waiters {
            // Waiters that gave up are fine to skip.
            let _ = waiter.send(reply.clone());
        }
    }
}

/// Whether `register` created a new entry (so the command must be sent)
/// or joined one already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    New,
    Joined,
}

/// Table of in-flight requests of one kind.
pub struct PendingTable<T> {
    kind: RequestKind,
    timeout: Duration,
    cap: Option<usize>,
    next_seq: AtomicU64,
    entries: Arc<Mutex<HashMap<String, Pending<T>>>>,
}

impl<T> fmt::Debug for PendingTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTable")
            .field("kind", &self.kind)
            .field("timeout", &self.timeout)
            .field("in_flight", &self.entries.lock().len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> PendingTable<T> {
    pub fn new(kind: RequestKind, timeout: Duration) -> Self {
        Self {
            kind,
            timeout,
            cap: None,
            next_seq: AtomicU64::new(0),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Limit how many rows one request may accumulate.
    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = Some(cap);
        self
    }

    /// Register interest in `key`. Must be called inside a tokio runtime.
    pub fn register(&self, key: &str) -> (Registration, PendingReply<T>) {
        let (tx, rx) = oneshot::channel();
        let reply = PendingReply {
            kind: self.kind,
            rx,
        };

        let mut entries = self.entries.lock();
        if let Some(pending) = entries.get_mut(key) {
            pending.waiters.push(tx);
            return (Registration::Joined, reply);
        }

        let timer = tokio::spawn(expire_after(
            Arc::clone(&self.entries),
            key.to_owned(),
            self.kind,
            self.timeout,
        ));
        entries.insert(
            key.to_owned(),
            Pending {
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                waiters: vec![tx],
                results: Vec::new(),
                truncated: false,
                timer: Some(timer),
            },
        );
        (Registration::New, reply)
    }

    /// Append a row. Returns false when nothing is pending under `key`.
    pub fn push(&self, key: &str, item: T) -> bool {
        let mut entries = self.entries.lock();
        let Some(pending) = entries.get_mut(key) else {
            return false;
        };
        match self.cap {
            Some(cap) if pending.results.len() >= cap => {
                if !pending.truncated {
                    pending.truncated = true;
                    warn!(kind = %self.kind, key, cap, "reply exceeded row cap, dropping the rest");
                }
            }
            _ => pending.results.push(item),
        }
        true
    }

    /// Resolve `key` with everything accumulated so far.
    pub fn resolve(&self, key: &str) -> bool {
        let Some(mut pending) = self.entries.lock().remove(key) else {
            debug!(kind = %self.kind, key, "terminal line with nothing pending");
            return false;
        };
        let results = std::mem::take(&mut pending.results);
        pending.finish(Ok(results));
        true
    }

    /// Reject `key` with `err`.
    pub fn fail(&self, key: &str, err: RequestError) -> bool {
        let removed = self.entries.lock().remove(key);
        match removed {
            Some(pending) => {
                pending.finish(Err(err));
                true
            }
            None => false,
        }
    }

    /// The first candidate with an entry pending.
    pub fn route(&self, candidates: &[&str]) -> Option<String> {
        let entries = self.entries.lock();
        candidates
            .iter()
            .find(|c| entries.contains_key(**c))
            .map(|hit| (*hit).to_owned())
    }

    /// The oldest pending key that `accept` allows.
    pub fn oldest(&self, accept: impl Fn(&str) -> bool) -> Option<String> {
        self.entries
            .lock()
            .iter()
            .filter(|(key, _)| accept(key))
            .min_by_key(|(_, pending)| pending.seq)
            .map(|(key, _)| key.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

async fn expire_after<T: Clone>(
    entries: Arc<Mutex<HashMap<String, Pending<T>>>>,
    key: String,
    kind: RequestKind,
    timeout: Duration,
) {
    tokio::time::sleep(timeout).await;
    let expired = entries.lock().remove(&key);
    if let Some(mut pending) = expired {
        warn!(%kind, key, "request timed out after {timeout:?}");
        // This task is the timer; aborting ourselves is pointless.
        pending.timer = None;
        pending.finish(Err(RequestError::Timeout(kind)));
    }
}

/// The eventual answer to a registered request.
#[derive(Debug)]
pub struct PendingReply<T> {
    kind: RequestKind,
    rx: oneshot::Receiver<Reply<T>>,
}

impl<T> Future for PendingReply<T> {
    type Output = Reply<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let kind = self.kind;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(reply)) => Poll::Ready(reply),
            // Table dropped with the entry still in it.
            Poll::Ready(Err(_)) => Poll::Ready(Err(RequestError::Disconnected(kind))),
            Poll::Pending => Poll::Pending,
        }
    }
}
