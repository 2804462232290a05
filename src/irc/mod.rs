pub mod codec;
pub mod connection;
pub mod event;
pub mod message;
pub mod modes;
pub mod pending;
pub mod state;
pub mod tracker;
pub mod whois;
