pub mod admission;
pub mod config;
pub mod irc;
pub mod metrics;
pub mod resilience;
