/// Bridge configuration from `LAGOON_BRIDGE_*` environment variables.
///
/// Every variable is optional; unset ones take the defaults of the
/// component configs. A set but unparseable value is an error naming the
/// variable rather than a silent fallback.
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::admission::AdmissionConfig;
use crate::irc::connection::RelayConfig;
use crate::irc::tracker::TrackerConfig;
use crate::resilience::ResilienceConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    pub admission: AdmissionConfig,
    pub resilience: ResilienceConfig,
    pub tracker: TrackerConfig,
    pub relay: RelayConfig,
    /// Prometheus exporter address; no exporter when unset.
    pub metrics_addr: Option<SocketAddr>,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let mut config = Self::default();

        let a = &mut config.admission;
        env.set("LAGOON_BRIDGE_MAX_PER_MINUTE", &mut a.max_messages_per_minute)?;
        env.set("LAGOON_BRIDGE_MAX_PER_HOUR", &mut a.max_messages_per_hour)?;
        env.set("LAGOON_BRIDGE_BURST_LIMIT", &mut a.burst_limit)?;
        env.secs("LAGOON_BRIDGE_BURST_WINDOW_SECS", &mut a.burst_window)?;
        env.set("LAGOON_BRIDGE_DUPLICATE_THRESHOLD", &mut a.duplicate_message_threshold)?;
        env.secs("LAGOON_BRIDGE_DUPLICATE_WINDOW_SECS", &mut a.duplicate_time_window)?;
        env.secs("LAGOON_BRIDGE_SPAM_COOLDOWN_SECS", &mut a.spam_cooldown)?;
        env.secs("LAGOON_BRIDGE_RATE_COOLDOWN_SECS", &mut a.rate_limit_cooldown)?;
        env.set("LAGOON_BRIDGE_MAX_SENDERS", &mut a.max_senders)?;

        let r = &mut config.resilience;
        env.set("LAGOON_BRIDGE_MAX_RETRIES", &mut r.max_retries)?;
        env.millis("LAGOON_BRIDGE_BASE_DELAY_MS", &mut r.base_delay)?;
        env.millis("LAGOON_BRIDGE_MAX_DELAY_MS", &mut r.max_delay)?;
        env.set("LAGOON_BRIDGE_JITTER", &mut r.jitter_range)?;
        env.secs("LAGOON_BRIDGE_HEALTH_CHECK_SECS", &mut r.health_check_interval)?;
        env.set("LAGOON_BRIDGE_BREAKER_THRESHOLD", &mut r.circuit_breaker_threshold)?;
        env.secs("LAGOON_BRIDGE_BREAKER_TIMEOUT_SECS", &mut r.circuit_breaker_timeout)?;
        if !(0.0..=1.0).contains(&r.jitter_range) {
            return Err(invalid("LAGOON_BRIDGE_JITTER", r.jitter_range, "must be within 0..=1"));
        }
        if r.circuit_breaker_threshold == 0 {
            return Err(invalid("LAGOON_BRIDGE_BREAKER_THRESHOLD", 0, "must be at least 1"));
        }

        let t = &mut config.tracker;
        env.secs("LAGOON_BRIDGE_WHO_TIMEOUT_SECS", &mut t.who_timeout)?;
        env.secs("LAGOON_BRIDGE_LIST_TIMEOUT_SECS", &mut t.list_timeout)?;
        env.secs("LAGOON_BRIDGE_GC_INTERVAL_SECS", &mut t.gc_interval)?;

        let relay = &mut config.relay;
        env.set("LAGOON_BRIDGE_IRC_SERVER", &mut relay.server)?;
        env.set("LAGOON_BRIDGE_IRC_NICK", &mut relay.nick)?;
        env.set("LAGOON_BRIDGE_IRC_USER", &mut relay.username)?;
        env.set("LAGOON_BRIDGE_IRC_REALNAME", &mut relay.realname)?;
        if let Some(list) = lookup("LAGOON_BRIDGE_IRC_CHANNELS") {
            relay.channels = list
                .split(',')
                .map(|c| c.trim().to_owned())
                .filter(|c| !c.is_empty())
                .collect();
        }
        env.secs("LAGOON_BRIDGE_PING_INTERVAL_SECS", &mut relay.ping_interval)?;
        env.secs("LAGOON_BRIDGE_REGISTER_TIMEOUT_SECS", &mut relay.register_timeout)?;
        env.millis("LAGOON_BRIDGE_WHOIS_INTERVAL_MS", &mut relay.whois_interval)?;
        env.secs("LAGOON_BRIDGE_WHOIS_TIMEOUT_SECS", &mut relay.whois_timeout)?;

        if let Some(addr) = lookup("LAGOON_BRIDGE_METRICS_ADDR") {
            config.metrics_addr = Some(parse("LAGOON_BRIDGE_METRICS_ADDR", &addr)?);
        }
        Ok(config)
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn set<T>(&self, var: &'static str, slot: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = (self.0)(var) {
            *slot = parse(var, &raw)?;
        }
        Ok(())
    }

    fn secs(&self, var: &'static str, slot: &mut Duration) -> Result<(), ConfigError> {
        if let Some(raw) = (self.0)(var) {
            *slot = Duration::from_secs(parse(var, &raw)?);
        }
        Ok(())
    }

    fn millis(&self, var: &'static str, slot: &mut Duration) -> Result<(), ConfigError> {
        if let Some(raw) = (self.0)(var) {
            *slot = Duration::from_millis(parse(var, &raw)?);
        }
        Ok(())
    }
}

fn parse<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(var, raw, e))
}

fn invalid(var: &'static str, value: impl ToString, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
