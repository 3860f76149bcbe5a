use std::time::Duration;

pub(crate) const RETRANSMIT_INTERVAL: Duration = Duration::from_secs(3);
pub(crate) const SESSION_EXPIRY: Duration = Duration::from_secs(60);

// Wire messages must be strictly smaller than this, both ways.
pub(crate) const MAX_MESSAGE_SIZE: usize = 1000;

pub mod connection;
pub mod listener;
pub mod message;

pub use listener::Listener;
