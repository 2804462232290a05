//! Prometheus metrics for the bridge.
//!
//! All metric name constants live here. Call sites use the helpers below
//! rather than raw strings so names stay in one place.
//!
//! Two background tasks are spawned by the binary:
//! - `spawn_event_listener`  logs resilience events and counts outcomes
//! - `spawn_tracker_collector` samples tracker sizes into gauges

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::irc::tracker::SharedTracker;
use crate::resilience::ResilienceEvent;

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Messages refused by the admission controller, by violation kind.
pub const ADMISSION_VIOLATIONS: &str = "lagoon_bridge_admission_violations_total";

// ---------------------------------------------------------------------------
// Connection resilience
// ---------------------------------------------------------------------------

/// Successful transport operations, by service.
pub const SERVICE_SUCCESSES: &str = "lagoon_bridge_service_successes_total";
/// Failed transport operations, by service.
pub const SERVICE_FAILURES: &str = "lagoon_bridge_service_failures_total";
/// Circuit breaker trips, by service.
pub const BREAKER_TRIPS: &str = "lagoon_bridge_circuit_breaker_trips_total";
/// Finished recovery loops, by service and outcome.
pub const RECOVERIES: &str = "lagoon_bridge_recoveries_total";
/// Health sweeps that found a service silent.
pub const SERVICE_SILENT: &str = "lagoon_bridge_service_silent_total";

// ---------------------------------------------------------------------------
// IRC relay
// ---------------------------------------------------------------------------

/// Inbound IRC lines, by command.
pub const IRC_MESSAGES: &str = "lagoon_bridge_irc_messages_total";
/// Users currently mirrored (gauge).
pub const TRACKED_USERS: &str = "lagoon_bridge_tracked_users";
/// Channels currently mirrored (gauge).
pub const TRACKED_CHANNELS: &str = "lagoon_bridge_tracked_channels";
/// Outstanding WHOIS/WHO/LIST requests (gauge).
pub const PENDING_REQUESTS: &str = "lagoon_bridge_pending_requests";

#[inline]
pub fn record_admission_violation(kind: &'static str) {
    counter!(ADMISSION_VIOLATIONS, "kind" => kind).increment(1);
}

#[inline]
pub fn record_service_success(service: &str) {
    counter!(SERVICE_SUCCESSES, "service" => service.to_owned()).increment(1);
}

#[inline]
pub fn record_service_failure(service: &str) {
    counter!(SERVICE_FAILURES, "service" => service.to_owned()).increment(1);
}

#[inline]
pub fn record_irc_message(command: &str) {
    counter!(IRC_MESSAGES, "command" => command.to_owned()).increment(1);
}

/// Install the Prometheus exporter with its own HTTP listener.
pub fn install_exporter(
    addr: SocketAddr,
) -> Result<(), metrics_exporter_prometheus::BuildError> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(%addr, "prometheus exporter listening");
    Ok(())
}

// ---------------------------------------------------------------------------
// Background collectors
// ---------------------------------------------------------------------------

/// Log every resilience event and count the ones worth graphing.
pub fn spawn_event_listener(mut rx: broadcast::Receiver<ResilienceEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "resilience event listener lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match &event {
                ResilienceEvent::CircuitTripped { service, .. } => {
                    counter!(BREAKER_TRIPS, "service" => service.clone()).increment(1);
                    warn!("{event}");
                }
                ResilienceEvent::RecoverySucceeded { service, .. } => {
                    counter!(RECOVERIES, "service" => service.clone(), "outcome" => "success")
                        .increment(1);
                    info!("{event}");
                }
                ResilienceEvent::RecoveryFailed { service, .. } => {
                    counter!(RECOVERIES, "service" => service.clone(), "outcome" => "failure")
                        .increment(1);
                    warn!("{event}");
                }
                ResilienceEvent::ServiceSilent { service, .. } => {
                    counter!(SERVICE_SILENT, "service" => service.clone()).increment(1);
                    warn!("{event}");
                }
                ResilienceEvent::RecoveryStarted { .. } | ResilienceEvent::CircuitReset { .. } => {
                    info!("{event}");
                }
            }
        }
    })
}

/// Sample tracker sizes every `period`.
pub fn spawn_tracker_collector(tracker: SharedTracker, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let stats = tracker.lock().stats();
            gauge!(TRACKED_USERS).set(stats.users as f64);
            gauge!(TRACKED_CHANNELS).set(stats.channels as f64);
            gauge!(PENDING_REQUESTS, "kind" => "whois").set(stats.pending_whois as f64);
            gauge!(PENDING_REQUESTS, "kind" => "who").set(stats.pending_who as f64);
            gauge!(PENDING_REQUESTS, "kind" => "list").set(stats.pending_list as f64);
        }
    })
}
