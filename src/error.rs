use std::io;

use thiserror::Error;

/// Errors that abort a single listen attempt. Construction failures never
/// affect other listeners; the caller decides whether the process survives.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("invalid endpoint configuration: {0}")]
    Config(String),

    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid TLS configuration: {0}")]
    Tls(String),

    #[error("transport registration failed: {0}")]
    Registration(String),
}

/// Outcome classification for a single accept. Only `Closed` terminates the
/// accept loop; everything else drops the offending connection and the loop
/// keeps going.
#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("listener closed")]
    Closed,

    #[error("failed to accept connection: {0}")]
    Io(#[from] io::Error),

    #[error("rejected connection: {0}")]
    ProxyHeader(#[from] ProxyHeaderError),
}

impl AcceptError {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Why a required PROXY protocol header could not be taken off the front of
/// a connection.
#[derive(Debug, Error)]
pub enum ProxyHeaderError {
    #[error("connection ended before a complete PROXY header")]
    Truncated,

    #[error("PROXY header exceeds {0} bytes")]
    Oversized(usize),

    #[error("malformed PROXY header: {0}")]
    Malformed(String),

    #[error("timed out waiting for PROXY header")]
    TimedOut,

    #[error("i/o error while reading PROXY header: {0}")]
    Io(#[from] io::Error),
}
