use std::net::SocketAddr;
use std::time::Duration;

/// Where accepted connections get relayed, and how patient the relay is.
#[derive(Copy, Clone, Debug)]
pub(crate) struct ForwardSettings {
    pub(crate) destination: SocketAddr,
    pub(crate) connect_timeout: Duration,
    pub(crate) queue: usize,
}
