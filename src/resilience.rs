/// Connection health tracking, circuit breaking, and reconnection.
///
/// Transports report every send/receive outcome with
/// [`ResilienceManager::record_success`] and
/// [`ResilienceManager::record_failure`]. Failures start a single background
/// recovery loop that asks the owner of the transport to reconnect through a
/// [`ReconnectRequest`] and backs off exponentially between attempts. Only one
/// recovery loop runs at a time across all services.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::irc::state::now_secs;
use crate::metrics;

/// The IRC side of the bridge.
pub const RELAY_CHAT: &str = "relay-chat";
/// The other chat network.
pub const PRIMARY_CHAT: &str = "primary-chat";

/// Recovery attempts kept for inspection.
const HISTORY_LEN: usize = 10;
/// A healthy service silent for this many check intervals is reported.
const SILENCE_INTERVALS: u32 = 3;

#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fractional jitter applied to each backoff delay, e.g. 0.2 for ±20%.
    pub jitter_range: f64,
    pub health_check_interval: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: Duration,
    /// How long a reconnect request may go unanswered.
    pub reconnect_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_range: 0.2,
            health_check_interval: Duration::from_secs(30),
            circuit_breaker_threshold: 3,
            circuit_breaker_timeout: Duration::from_secs(5 * 60),
            reconnect_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResilienceError {
    #[error("a recovery is already in progress")]
    RecoveryInProgress,
    #[error("recovery of {0} failed after all retries")]
    RecoveryExhausted(String),
}

/// Health of one monitored service.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    pub is_healthy: bool,
    #[serde(skip)]
    pub last_successful: Instant,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_error: Option<String>,
}

impl ConnectionHealth {
    fn new(now: Instant) -> Self {
        Self {
            is_healthy: true,
            last_successful: now,
            consecutive_failures: 0,
            total_failures: 0,
            last_error: None,
        }
    }
}

/// One pass of a recovery loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryAttempt {
    pub service: String,
    pub attempt: u32,
    /// Unix seconds when the attempt finished.
    pub timestamp: u64,
    #[serde(rename = "delay_ms", serialize_with = "as_millis")]
    pub delay: Duration,
    pub reason: String,
    pub success: bool,
    pub error: Option<String>,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Status signals for logging and notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResilienceEvent {
    RecoveryStarted { service: String, reason: String },
    RecoverySucceeded { service: String, attempt: u32 },
    RecoveryFailed { service: String, attempts: u32 },
    CircuitTripped { service: String, failures: u32 },
    CircuitReset { service: String },
    /// Healthy but nothing has succeeded for `silent_for`.
    ServiceSilent { service: String, silent_for: Duration },
}

impl fmt::Display for ResilienceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RecoveryStarted { service, reason } => {
                write!(f, "{service}: recovery started ({reason})")
            }
            Self::RecoverySucceeded { service, attempt } => {
                write!(f, "{service}: recovered on attempt {attempt}")
            }
            Self::RecoveryFailed { service, attempts } => {
                write!(f, "{service}: recovery failed after {attempts} attempts")
            }
            Self::CircuitTripped { service, failures } => {
                write!(f, "{service}: circuit breaker tripped after {failures} failures")
            }
            Self::CircuitReset { service } => write!(f, "{service}: circuit breaker reset"),
            Self::ServiceSilent {
                service,
                silent_for,
            } => write!(f, "{service}: no successful operation for {}s", silent_for.as_secs()),
        }
    }
}

/// Ask the owner of `service` to reconnect. Answer `true` once the
/// connection is back; dropping `respond` counts as failure.
#[derive(Debug)]
pub struct ReconnectRequest {
    pub service: String,
    pub attempt: u32,
    pub respond: oneshot::Sender<bool>,
}

#[derive(Debug, Default)]
struct State {
    health: HashMap<String, ConnectionHealth>,
    /// Service → when its breaker tripped.
    breakers: HashMap<String, Instant>,
    history: VecDeque<RecoveryAttempt>,
}

pub struct ResilienceManager {
    config: ResilienceConfig,
    state: Mutex<State>,
    recovering: AtomicBool,
    events: broadcast::Sender<ResilienceEvent>,
    reconnects: mpsc::UnboundedSender<ReconnectRequest>,
}

/// Holds the process-wide recovery latch; releases it on drop.
struct RecoveryLatch(Arc<ResilienceManager>);

impl Drop for RecoveryLatch {
    fn drop(&mut self) {
        self.0.recovering.store(false, Ordering::Release);
    }
}

impl ResilienceManager {
    /// Build a manager and the receiving end of its reconnect requests.
    pub fn new(
        config: ResilienceConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ReconnectRequest>) {
        let (reconnects, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let manager = Arc::new(Self {
            config,
            state: Mutex::new(State::default()),
            recovering: AtomicBool::new(false),
            events,
            reconnects,
        });
        (manager, rx)
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.events.subscribe()
    }

    /// Start tracking `service` as healthy.
    pub fn monitor(&self, service: &str) {
        self.state
            .lock()
            .health
            .entry(service.to_owned())
            .or_insert_with(|| ConnectionHealth::new(Instant::now()));
    }

    fn emit(&self, event: ResilienceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ── Health signals ───────────────────────────────────────────

    pub fn record_success(&self, service: &str) {
        let now = Instant::now();
        let was_tripped = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let health = state
                .health
                .entry(service.to_owned())
                .or_insert_with(|| ConnectionHealth::new(now));
            health.is_healthy = true;
            health.last_successful = now;
            health.consecutive_failures = 0;
            state.breakers.remove(service).is_some()
        };
        metrics::record_service_success(service);
        if was_tripped {
            info!(service, "circuit breaker reset after success");
            self.emit(ResilienceEvent::CircuitReset {
                service: service.to_owned(),
            });
        }
    }

    /// Record a failed operation and start recovery if none is running.
    pub fn record_failure(self: &Arc<Self>, service: &str, error: impl fmt::Display) {
        let now = Instant::now();
        let error = error.to_string();
        let (tripped, failures, held_open) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let health = state
                .health
                .entry(service.to_owned())
                .or_insert_with(|| ConnectionHealth::new(now));
            health.consecutive_failures += 1;
            health.total_failures += 1;
            health.last_error = Some(error.clone());
            let failures = health.consecutive_failures;

            let mut tripped = false;
            if failures >= self.config.circuit_breaker_threshold {
                health.is_healthy = false;
                if !state.breakers.contains_key(service) {
                    state.breakers.insert(service.to_owned(), now);
                    tripped = true;
                }
            }
            let held_open = state.breakers.get(service).is_some_and(|at| {
                now.saturating_duration_since(*at) <= self.config.circuit_breaker_timeout
            });
            (tripped, failures, held_open)
        };

        metrics::record_service_failure(service);
        warn!(service, failures, "operation failed: {error}");
        if tripped {
            warn!(service, failures, "circuit breaker tripped");
            self.emit(ResilienceEvent::CircuitTripped {
                service: service.to_owned(),
                failures,
            });
        }
        if held_open {
            debug!(service, "circuit open, not starting recovery");
            return;
        }
        self.start_recovery(service, error);
    }

    /// Whether `service` may be used. An expired breaker resets here.
    pub fn is_available(&self, service: &str) -> bool {
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            let expired = match state.breakers.get(service) {
                None => return true,
                Some(at) => {
                    now.saturating_duration_since(*at) > self.config.circuit_breaker_timeout
                }
            };
            if !expired {
                return false;
            }
            state.breakers.remove(service);
        }
        info!(service, "circuit breaker timed out, allowing traffic");
        self.emit(ResilienceEvent::CircuitReset {
            service: service.to_owned(),
        });
        true
    }

    /// Clear a breaker immediately. Returns whether one was set.
    pub fn reset_breaker(&self, service: &str) -> bool {
        let removed = self.state.lock().breakers.remove(service).is_some();
        if removed {
            info!(service, "circuit breaker reset manually");
            self.emit(ResilienceEvent::CircuitReset {
                service: service.to_owned(),
            });
        }
        removed
    }

    // ── Recovery ─────────────────────────────────────────────────

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    fn try_latch(self: &Arc<Self>) -> Option<RecoveryLatch> {
        self.recovering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RecoveryLatch(Arc::clone(self)))
    }

    fn start_recovery(self: &Arc<Self>, service: &str, reason: String) {
        let Some(latch) = self.try_latch() else {
            debug!(service, "recovery already running");
            return;
        };
        let manager = Arc::clone(self);
        let service = service.to_owned();
        tokio::spawn(async move {
            manager.run_recovery(&service, &reason).await;
            drop(latch);
        });
    }

    /// Run a recovery loop now, unless one is already running.
    pub async fn force_recovery(self: &Arc<Self>, service: &str) -> Result<(), ResilienceError> {
        let latch = self.try_latch().ok_or(ResilienceError::RecoveryInProgress)?;
        let recovered = self.run_recovery(service, "manual recovery").await;
        drop(latch);
        if recovered {
            Ok(())
        } else {
            Err(ResilienceError::RecoveryExhausted(service.to_owned()))
        }
    }

    async fn run_recovery(&self, service: &str, reason: &str) -> bool {
        info!(service, reason, "starting recovery");
        self.emit(ResilienceEvent::RecoveryStarted {
            service: service.to_owned(),
            reason: reason.to_owned(),
        });

        for attempt in 1..=self.config.max_retries {
            let delay = self.backoff_delay(attempt);
            debug!(service, attempt, ?delay, "waiting before reconnect");
            tokio::time::sleep(delay).await;

            let outcome = self.request_reconnect(service, attempt).await;
            self.push_history(RecoveryAttempt {
                service: service.to_owned(),
                attempt,
                timestamp: now_secs(),
                delay,
                reason: reason.to_owned(),
                success: outcome.is_ok(),
                error: outcome.as_ref().err().cloned(),
            });

            match outcome {
                Ok(()) => {
                    self.record_success(service);
                    info!(service, attempt, "recovery succeeded");
                    self.emit(ResilienceEvent::RecoverySucceeded {
                        service: service.to_owned(),
                        attempt,
                    });
                    return true;
                }
                Err(e) => warn!(service, attempt, "reconnect attempt failed: {e}"),
            }
        }

        warn!(service, attempts = self.config.max_retries, "recovery exhausted");
        self.emit(ResilienceEvent::RecoveryFailed {
            service: service.to_owned(),
            attempts: self.config.max_retries,
        });
        false
    }

    async fn request_reconnect(&self, service: &str, attempt: u32) -> Result<(), String> {
        let (respond, answer) = oneshot::channel();
        let request = ReconnectRequest {
            service: service.to_owned(),
            attempt,
            respond,
        };
        if self.reconnects.send(request).is_err() {
            return Err("no reconnect handler".into());
        }
        match tokio::time::timeout(self.config.reconnect_timeout, answer).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err("reconnect failed".into()),
            Ok(Err(_)) => Err("reconnect handler dropped the request".into()),
            Err(_) => Err(format!(
                "no reconnect answer within {}s",
                self.config.reconnect_timeout.as_secs()
            )),
        }
    }

    fn push_history(&self, attempt: RecoveryAttempt) {
        let mut state = self.state.lock();
        state.history.push_back(attempt);
        while state.history.len() > HISTORY_LEN {
            state.history.pop_front();
        }
    }

    /// Delay before `attempt` (1-based) without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.config
            .base_delay
            .saturating_mul(1 << shift)
            .min(self.config.max_delay)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        let jitter = self.config.jitter_range.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        delay.mul_f64(factor)
    }

    // ── Health sweep ─────────────────────────────────────────────

    /// Report healthy services that have gone quiet. Health is not changed.
    pub fn check_health(&self) -> Vec<(String, Duration)> {
        let now = Instant::now();
        let threshold = self.config.health_check_interval * SILENCE_INTERVALS;
        let silent: Vec<(String, Duration)> = {
            let state = self.state.lock();
            state
                .health
                .iter()
                .filter(|(_, h)| h.is_healthy)
                .map(|(s, h)| (s.clone(), now.saturating_duration_since(h.last_successful)))
                .filter(|(_, quiet)| *quiet > threshold)
                .collect()
        };
        for (service, silent_for) in &silent {
            self.emit(ResilienceEvent::ServiceSilent {
                service: service.clone(),
                silent_for: *silent_for,
            });
        }
        silent
    }

    pub fn spawn_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.health_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.check_health();
            }
        })
    }

    // ── Snapshots ────────────────────────────────────────────────

    pub fn health(&self, service: &str) -> Option<ConnectionHealth> {
        self.state.lock().health.get(service).cloned()
    }

    pub fn health_snapshot(&self) -> BTreeMap<String, ConnectionHealth> {
        self.state
            .lock()
            .health
            .iter()
            .map(|(s, h)| (s.clone(), h.clone()))
            .collect()
    }

    /// Tripped services and how long ago each tripped.
    pub fn tripped_breakers(&self) -> BTreeMap<String, Duration> {
        let now = Instant::now();
        self.state
            .lock()
            .breakers
            .iter()
            .map(|(s, at)| (s.clone(), now.saturating_duration_since(*at)))
            .collect()
    }

    pub fn recovery_history(&self) -> Vec<RecoveryAttempt> {
        self.state.lock().history.iter().cloned().collect()
    }
}
