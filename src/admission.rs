/// Per-sender admission control for messages about to be relayed.
///
/// Every sender gets a sliding-window record: a trailing hour of send
/// timestamps plus the last few bodies. A message is refused when it breaks a
/// burst, per-minute, or per-hour ceiling, or repeats the same body too often.
/// Rate violations escalate through short cooldowns to a long block; duplicate
/// spam blocks immediately and counts double.
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::metrics;

const HOUR: Duration = Duration::from_secs(60 * 60);
const MINUTE: Duration = Duration::from_secs(60);
/// Bodies remembered per sender for duplicate detection.
const HISTORY_LEN: usize = 10;
/// Cumulative warnings at which a rate violation becomes a long block.
const BLOCK_AFTER_WARNINGS: u32 = 3;
/// Warnings added by one duplicate-spam violation.
const SPAM_WARNING_WEIGHT: u32 = 2;

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub max_messages_per_minute: usize,
    pub max_messages_per_hour: usize,
    pub burst_limit: usize,
    pub burst_window: Duration,
    pub duplicate_message_threshold: usize,
    pub duplicate_time_window: Duration,
    pub spam_cooldown: Duration,
    pub rate_limit_cooldown: Duration,
    /// Most sender records kept; the least recently active is evicted.
    pub max_senders: usize,
    /// Records idle this long are dropped by cleanup.
    pub record_ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_messages_per_minute: 20,
            max_messages_per_hour: 300,
            burst_limit: 5,
            burst_window: Duration::from_secs(10),
            duplicate_message_threshold: 3,
            duplicate_time_window: Duration::from_secs(30),
            spam_cooldown: Duration::from_secs(5 * 60),
            rate_limit_cooldown: Duration::from_secs(30),
            max_senders: 10_000,
            record_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            cleanup_interval: HOUR,
        }
    }
}

/// Which rate ceiling a sender hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimit {
    Burst,
    PerMinute,
    PerHour,
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Burst => "burst",
            Self::PerMinute => "per-minute",
            Self::PerHour => "per-hour",
        })
    }
}

/// Why a message was not admitted. `Display` renders the reason shown to
/// the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Still cooling down from an earlier violation.
    Blocked { remaining_secs: u64 },
    /// Rate ceiling hit; short cooldown applied.
    RateWarning {
        limit: RateLimit,
        warnings: u32,
        cooldown_secs: u64,
    },
    /// Rate ceiling hit with enough prior warnings for a long block.
    RateBlocked { limit: RateLimit, cooldown_secs: u64 },
    /// The same body sent too many times in the duplicate window.
    Spam { repeats: usize, cooldown_secs: u64 },
}

impl Violation {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Blocked { .. } => "blocked",
            Self::RateWarning { limit, .. } | Self::RateBlocked { limit, .. } => match limit {
                RateLimit::Burst => "burst",
                RateLimit::PerMinute => "per_minute",
                RateLimit::PerHour => "per_hour",
            },
            Self::Spam { .. } => "spam",
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked { remaining_secs } => {
                write!(f, "you are temporarily blocked, try again in {remaining_secs}s")
            }
            Self::RateWarning {
                limit,
                warnings,
                cooldown_secs,
            } => write!(
                f,
                "slow down: {limit} limit exceeded (warning {warnings}/{BLOCK_AFTER_WARNINGS}), \
                 wait {cooldown_secs}s"
            ),
            Self::RateBlocked {
                limit,
                cooldown_secs,
            } => write!(
                f,
                "blocked for {cooldown_secs}s after repeated {limit} limit violations"
            ),
            Self::Spam {
                repeats,
                cooldown_secs,
            } => write!(
                f,
                "blocked for {cooldown_secs}s: same message sent {repeats} times (spam)"
            ),
        }
    }
}

#[derive(Debug)]
struct SenderRecord {
    display_name: String,
    message_count: u64,
    last_message: Option<Instant>,
    /// Admitted send times within the trailing hour, oldest first.
    recent_messages: VecDeque<Instant>,
    message_history: VecDeque<(Instant, String)>,
    warning_count: u32,
    /// Long block from escalation or spam, as opposed to a rate cooldown.
    is_blocked: bool,
    blocked_until: Option<Instant>,
    last_warning: Option<Instant>,
    last_touched: Instant,
}

impl SenderRecord {
    fn new(display_name: &str, now: Instant) -> Self {
        Self {
            display_name: display_name.to_owned(),
            message_count: 0,
            last_message: None,
            recent_messages: VecDeque::new(),
            message_history: VecDeque::new(),
            warning_count: 0,
            is_blocked: false,
            blocked_until: None,
            last_warning: None,
            last_touched: now,
        }
    }

    fn sent_within(&self, window: Duration, now: Instant) -> usize {
        self.recent_messages
            .iter()
            .rev()
            .take_while(|t| now.saturating_duration_since(**t) < window)
            .count()
    }

    fn rate_limit_hit(&self, config: &AdmissionConfig, now: Instant) -> Option<RateLimit> {
        if self.sent_within(config.burst_window, now) >= config.burst_limit {
            Some(RateLimit::Burst)
        } else if self.sent_within(MINUTE, now) >= config.max_messages_per_minute {
            Some(RateLimit::PerMinute)
        } else if self.recent_messages.len() >= config.max_messages_per_hour {
            Some(RateLimit::PerHour)
        } else {
            None
        }
    }

    /// Copies of `body` in the duplicate window, counting this one.
    fn repeats_of(&self, body: &str, window: Duration, now: Instant) -> usize {
        1 + self
            .message_history
            .iter()
            .filter(|(at, old)| now.saturating_duration_since(*at) < window && old == body)
            .count()
    }

    fn block_remaining(&self, now: Instant) -> Option<Duration> {
        self.blocked_until
            .filter(|until| now < *until)
            .map(|until| until - now)
    }

    fn stats(&self, sender_id: &str, now: Instant) -> SenderStats {
        SenderStats {
            sender_id: sender_id.to_owned(),
            display_name: self.display_name.clone(),
            message_count: self.message_count,
            messages_last_hour: self.sent_within(HOUR, now),
            warning_count: self.warning_count,
            is_blocked: self.is_blocked,
            blocked_for_secs: self.block_remaining(now).map(ceil_secs),
            idle_secs: self
                .last_message
                .map(|at| now.saturating_duration_since(at).as_secs()),
        }
    }
}

/// Read-only view of one sender, for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SenderStats {
    pub sender_id: String,
    pub display_name: String,
    pub message_count: u64,
    pub messages_last_hour: usize,
    pub warning_count: u32,
    pub is_blocked: bool,
    /// Seconds left on the current block or cooldown.
    pub blocked_for_secs: Option<u64>,
    pub idle_secs: Option<u64>,
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Sliding-window rate and spam gate, consulted before every relay.
pub struct AdmissionController {
    config: AdmissionConfig,
    records: Mutex<HashMap<String, SenderRecord>>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Decide whether `sender_id` may send `body` now. `None` admits the
    /// message and records it.
    pub fn check_message(
        &self,
        sender_id: &str,
        display_name: &str,
        body: &str,
    ) -> Option<Violation> {
        self.check_message_at(sender_id, display_name, body, Instant::now())
    }

    pub fn check_message_at(
        &self,
        sender_id: &str,
        display_name: &str,
        body: &str,
        now: Instant,
    ) -> Option<Violation> {
        let violation = self.evaluate(sender_id, display_name, body, now);
        if let Some(v) = &violation {
            metrics::record_admission_violation(v.kind());
        }
        violation
    }

    fn evaluate(
        &self,
        sender_id: &str,
        display_name: &str,
        body: &str,
        now: Instant,
    ) -> Option<Violation> {
        let config = &self.config;
        let mut records = self.records.lock();

        if !records.contains_key(sender_id) && records.len() >= config.max_senders {
            evict_least_recent(&mut records);
        }
        let record = records
            .entry(sender_id.to_owned())
            .or_insert_with(|| SenderRecord::new(display_name, now));
        if record.display_name != display_name {
            record.display_name = display_name.to_owned();
        }
        record.last_touched = now;

        if let Some(remaining) = record.block_remaining(now) {
            return Some(Violation::Blocked {
                remaining_secs: ceil_secs(remaining),
            });
        }
        if record.blocked_until.take().is_some() && record.is_blocked {
            debug!(sender_id, "block expired, warnings cleared");
            record.is_blocked = false;
            record.warning_count = 0;
        }

        while record
            .recent_messages
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= HOUR)
        {
            record.recent_messages.pop_front();
        }

        if let Some(limit) = record.rate_limit_hit(config, now) {
            record.warning_count += 1;
            record.last_warning = Some(now);
            if record.warning_count >= BLOCK_AFTER_WARNINGS {
                record.is_blocked = true;
                record.blocked_until = Some(now + config.spam_cooldown);
                warn!(sender_id, %limit, warnings = record.warning_count, "sender blocked");
                return Some(Violation::RateBlocked {
                    limit,
                    cooldown_secs: config.spam_cooldown.as_secs(),
                });
            }
            record.blocked_until = Some(now + config.rate_limit_cooldown);
            debug!(sender_id, %limit, warnings = record.warning_count, "rate warning");
            return Some(Violation::RateWarning {
                limit,
                warnings: record.warning_count,
                cooldown_secs: config.rate_limit_cooldown.as_secs(),
            });
        }

        let repeats = record.repeats_of(body, config.duplicate_time_window, now);
        if repeats >= config.duplicate_message_threshold {
            record.is_blocked = true;
            record.blocked_until = Some(now + config.spam_cooldown);
            record.warning_count += SPAM_WARNING_WEIGHT;
            record.last_warning = Some(now);
            warn!(sender_id, repeats, "duplicate spam, sender blocked");
            return Some(Violation::Spam {
                repeats,
                cooldown_secs: config.spam_cooldown.as_secs(),
            });
        }

        record.recent_messages.push_back(now);
        record.message_history.push_back((now, body.to_owned()));
        while record.message_history.len() > HISTORY_LEN {
            record.message_history.pop_front();
        }
        record.message_count += 1;
        record.last_message = Some(now);
        None
    }

    // ── Administration ───────────────────────────────────────────

    /// Lift a sender's block and forgive one warning.
    pub fn force_unblock(&self, sender_id: &str) -> bool {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(sender_id) else {
            return false;
        };
        record.is_blocked = false;
        record.blocked_until = None;
        record.warning_count = record.warning_count.saturating_sub(1);
        info!(sender_id, "sender unblocked");
        true
    }

    pub fn clear_warnings(&self, sender_id: &str) -> bool {
        match self.records.lock().get_mut(sender_id) {
            Some(record) => {
                record.warning_count = 0;
                record.last_warning = None;
                true
            }
            None => false,
        }
    }

    /// Senders currently serving a block or cooldown.
    pub fn blocked_senders(&self) -> Vec<SenderStats> {
        self.blocked_senders_at(Instant::now())
    }

    pub fn blocked_senders_at(&self, now: Instant) -> Vec<SenderStats> {
        let records = self.records.lock();
        let mut blocked: Vec<_> = records
            .iter()
            .filter(|(_, r)| r.block_remaining(now).is_some())
            .map(|(id, r)| r.stats(id, now))
            .collect();
        blocked.sort_by(|a, b| a.sender_id.cmp(&b.sender_id));
        blocked
    }

    pub fn sender_stats(&self, sender_id: &str) -> Option<SenderStats> {
        self.records
            .lock()
            .get(sender_id)
            .map(|r| r.stats(sender_id, Instant::now()))
    }

    /// Forget every sender.
    pub fn reset_all(&self) {
        let mut records = self.records.lock();
        info!(senders = records.len(), "admission records reset");
        records.clear();
    }

    pub fn tracked_senders(&self) -> usize {
        self.records.lock().len()
    }

    /// Drop records idle longer than `record_ttl`. Returns how many went.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let ttl = self.config.record_ttl;
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| now.saturating_duration_since(r.last_touched) < ttl);
        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, "expired idle sender records");
        }
        removed
    }
}

fn evict_least_recent(records: &mut HashMap<String, SenderRecord>) {
    let oldest = records
        .iter()
        .min_by_key(|(_, r)| r.last_touched)
        .map(|(id, _)| id.clone());
    if let Some(id) = oldest {
        debug!(sender_id = %id, "sender table full, evicting least recent");
        records.remove(&id);
    }
}

/// Periodically expire idle sender records.
pub fn spawn_cleanup(controller: Arc<AdmissionController>) -> JoinHandle<()> {
    let period = controller.config.cleanup_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            controller.cleanup();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn controller() -> AdmissionController {
        AdmissionController::new(AdmissionConfig::default())
    }

    /// Send `n` distinct messages at `at`, asserting each is admitted.
    fn admit_burst(ctl: &AdmissionController, sender: &str, at: Instant, n: usize, tag: &str) {
        for i in 0..n {
            let body = format!("{tag} {i}");
            assert_eq!(ctl.check_message_at(sender, "Alice", &body, at), None, "{body}");
        }
    }

    // ── Rate ceilings ────────────────────────────────────────────

    #[test]
    fn sixth_message_in_burst_window_is_refused() {
        let ctl = controller();
        let t0 = Instant::now();
        for i in 0..5 {
            let at = t0 + Duration::from_millis(500 * i);
            assert_eq!(ctl.check_message_at("u1", "Alice", &format!("m{i}"), at), None);
        }
        let v = ctl
            .check_message_at("u1", "Alice", "m5", t0 + secs(3))
            .unwrap();
        assert!(v.to_string().contains("burst"), "{v}");
        assert_eq!(
            v,
            Violation::RateWarning {
                limit: RateLimit::Burst,
                warnings: 1,
                cooldown_secs: 30
            }
        );
    }

    #[test]
    fn blocked_sender_is_refused_without_recording() {
        let ctl = controller();
        let t0 = Instant::now();
        admit_burst(&ctl, "u1", t0, 5, "hi");
        assert!(ctl.check_message_at("u1", "Alice", "more", t0).is_some());

        let before = ctl.sender_stats("u1").unwrap().message_count;
        for s in [1, 10, 29] {
            let v = ctl.check_message_at("u1", "Alice", "again", t0 + secs(s));
            assert_eq!(v, Some(Violation::Blocked { remaining_secs: 30 - s }));
        }
        assert_eq!(ctl.sender_stats("u1").unwrap().message_count, before);
    }

    #[test]
    fn third_rate_violation_blocks_for_spam_cooldown() {
        let ctl = controller();
        let t0 = Instant::now();

        admit_burst(&ctl, "u1", t0, 5, "a");
        assert!(matches!(
            ctl.check_message_at("u1", "Alice", "x", t0),
            Some(Violation::RateWarning { warnings: 1, .. })
        ));

        let t1 = t0 + secs(31);
        admit_burst(&ctl, "u1", t1, 5, "b");
        assert!(matches!(
            ctl.check_message_at("u1", "Alice", "x", t1),
            Some(Violation::RateWarning { warnings: 2, .. })
        ));

        let t2 = t1 + secs(31);
        admit_burst(&ctl, "u1", t2, 5, "c");
        assert_eq!(
            ctl.check_message_at("u1", "Alice", "x", t2),
            Some(Violation::RateBlocked {
                limit: RateLimit::Burst,
                cooldown_secs: 300
            })
        );

        assert_eq!(
            ctl.check_message_at("u1", "Alice", "y", t2 + secs(299)),
            Some(Violation::Blocked { remaining_secs: 1 })
        );
        assert_eq!(ctl.check_message_at("u1", "Alice", "y", t2 + secs(300)), None);
        assert_eq!(ctl.sender_stats("u1").unwrap().warning_count, 0);
    }

    #[test]
    fn short_cooldown_keeps_warnings() {
        let ctl = controller();
        let t0 = Instant::now();
        admit_burst(&ctl, "u1", t0, 5, "a");
        ctl.check_message_at("u1", "Alice", "x", t0);
        assert_eq!(ctl.check_message_at("u1", "Alice", "later", t0 + secs(30)), None);
        assert_eq!(ctl.sender_stats("u1").unwrap().warning_count, 1);
    }

    #[test]
    fn per_minute_ceiling() {
        let ctl = AdmissionController::new(AdmissionConfig {
            burst_limit: 100,
            max_messages_per_minute: 3,
            ..AdmissionConfig::default()
        });
        let t0 = Instant::now();
        admit_burst(&ctl, "u1", t0, 3, "m");
        let v = ctl.check_message_at("u1", "Alice", "m", t0 + secs(59)).unwrap();
        assert_eq!(v.kind(), "per_minute");
        assert!(v.to_string().contains("per-minute"));
    }

    #[test]
    fn per_hour_ceiling_uses_trailing_hour() {
        let ctl = AdmissionController::new(AdmissionConfig {
            burst_limit: 100,
            max_messages_per_minute: 100,
            max_messages_per_hour: 4,
            ..AdmissionConfig::default()
        });
        let t0 = Instant::now();
        admit_burst(&ctl, "u1", t0, 4, "m");
        let v = ctl.check_message_at("u1", "Alice", "m", t0 + secs(120)).unwrap();
        assert_eq!(v.kind(), "per_hour");

        // An hour after the first four, the window is empty again.
        let later = t0 + HOUR + secs(1);
        assert_eq!(ctl.check_message_at("u1", "Alice", "fresh", later), None);
    }

    // ── Duplicate spam ───────────────────────────────────────────

    #[test]
    fn third_identical_message_is_spam() {
        let ctl = controller();
        let t0 = Instant::now();
        assert_eq!(ctl.check_message_at("u1", "Alice", "buy now", t0), None);
        assert_eq!(ctl.check_message_at("u1", "Alice", "buy now", t0 + secs(5)), None);
        let v = ctl
            .check_message_at("u1", "Alice", "buy now", t0 + secs(10))
            .unwrap();
        assert_eq!(
            v,
            Violation::Spam {
                repeats: 3,
                cooldown_secs: 300
            }
        );
        assert!(v.to_string().contains("spam"));

        let stats = ctl.sender_stats("u1").unwrap();
        assert_eq!(stats.warning_count, 2);
        assert!(stats.is_blocked);
    }

    #[test]
    fn repeats_outside_window_are_not_spam() {
        let ctl = controller();
        let t0 = Instant::now();
        ctl.check_message_at("u1", "Alice", "hello", t0);
        ctl.check_message_at("u1", "Alice", "hello", t0 + secs(20));
        assert_eq!(ctl.check_message_at("u1", "Alice", "hello", t0 + secs(31)), None);
    }

    // ── Administration and bounds ────────────────────────────────

    #[test]
    fn force_unblock_and_listing() {
        let ctl = controller();
        let t0 = Instant::now();
        for i in 0..3 {
            ctl.check_message_at("spammer", "Spam", "same", t0 + secs(i));
        }
        ctl.check_message_at("quiet", "Quiet", "hi", t0);

        let blocked = ctl.blocked_senders_at(t0 + secs(5));
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].sender_id, "spammer");
        assert_eq!(blocked[0].display_name, "Spam");

        assert!(ctl.force_unblock("spammer"));
        assert!(!ctl.force_unblock("nobody"));
        let stats = ctl.sender_stats("spammer").unwrap();
        assert!(!stats.is_blocked);
        assert_eq!(stats.warning_count, 1);
        assert!(ctl.blocked_senders_at(t0 + secs(5)).is_empty());

        assert!(ctl.clear_warnings("spammer"));
        assert_eq!(ctl.sender_stats("spammer").unwrap().warning_count, 0);
    }

    #[test]
    fn capacity_evicts_least_recent_sender() {
        let ctl = AdmissionController::new(AdmissionConfig {
            max_senders: 2,
            ..AdmissionConfig::default()
        });
        let t0 = Instant::now();
        ctl.check_message_at("a", "A", "hi", t0);
        ctl.check_message_at("b", "B", "hi", t0 + secs(1));
        ctl.check_message_at("a", "A", "again", t0 + secs(2));
        ctl.check_message_at("c", "C", "hi", t0 + secs(3));

        assert_eq!(ctl.tracked_senders(), 2);
        assert!(ctl.sender_stats("b").is_none());
        assert!(ctl.sender_stats("a").is_some());
    }

    #[test]
    fn cleanup_expires_idle_records() {
        let ctl = controller();
        let t0 = Instant::now();
        ctl.check_message_at("old", "Old", "hi", t0);
        ctl.check_message_at("new", "New", "hi", t0 + secs(60));

        let week = secs(7 * 24 * 60 * 60);
        assert_eq!(ctl.cleanup_at(t0 + week), 1);
        assert!(ctl.sender_stats("old").is_none());
        assert_eq!(ctl.tracked_senders(), 1);

        ctl.reset_all();
        assert_eq!(ctl.tracked_senders(), 0);
    }

    #[test]
    fn display_name_is_refreshed() {
        let ctl = controller();
        let t0 = Instant::now();
        ctl.check_message_at("u1", "Alice", "hi", t0);
        ctl.check_message_at("u1", "Alice B", "hey", t0 + secs(1));
        assert_eq!(ctl.sender_stats("u1").unwrap().display_name, "Alice B");
    }
}
