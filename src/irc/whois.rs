/// WHOIS pacing.
///
/// The tracker only ever calls [`WhoisQueue::add`]; when the lookup
/// finishes is learned from the 318 reply, never from the queue.
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::message::Message;
use super::state::irc_lower;

/// Accepts nicks to look up and sends WHOIS for them at its own pace.
pub trait WhoisQueue: Send + Sync {
    fn add(&self, nick: &str);
}

/// Sends at most one WHOIS per `interval` on the relay's outgoing channel.
///
/// Duplicate nicks collapse while queued, and a dispatched nick is not sent
/// again until its `timeout` has passed.
#[derive(Debug, Clone)]
pub struct PacedWhoisQueue {
    tx: mpsc::UnboundedSender<String>,
}

impl PacedWhoisQueue {
    pub fn spawn(
        outgoing: mpsc::UnboundedSender<Message>,
        interval: Duration,
        timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_pacer(rx, outgoing, interval, timeout));
        (Self { tx }, handle)
    }
}

impl WhoisQueue for PacedWhoisQueue {
    fn add(&self, nick: &str) {
        if self.tx.send(nick.to_owned()).is_err() {
            debug!(nick, "whois pacer stopped, lookup dropped");
        }
    }
}

async fn run_pacer(
    mut rx: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<Message>,
    interval: Duration,
    timeout: Duration,
) {
    let mut queue: VecDeque<String> = VecDeque::new();
    let mut queued: HashSet<String> = HashSet::new();
    let mut in_flight: HashMap<String, Instant> = HashMap::new();

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            nick = rx.recv() => {
                let Some(nick) = nick else { break };
                in_flight.retain(|_, sent| sent.elapsed() < timeout);
                let key = irc_lower(&nick);
                if queued.contains(&key) || in_flight.contains_key(&key) {
                    trace!(nick, "whois already queued or in flight");
                    continue;
                }
                queued.insert(key);
                queue.push_back(nick);
            }
            _ = ticker.tick(), if !queue.is_empty() => {
                let Some(nick) = queue.pop_front() else { continue };
                let key = irc_lower(&nick);
                queued.remove(&key);
                if outgoing.send(Message::new("WHOIS", vec![nick.clone()])).is_err() {
                    debug!("relay outgoing channel closed, whois pacer exiting");
                    break;
                }
                trace!(nick, "whois dispatched");
                in_flight.insert(key, Instant::now());
            }
        }
    }
}
