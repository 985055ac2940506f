use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::AcceptError;

pub mod proxy_header;
pub mod registry;
pub mod tls;
pub mod uds;

/// Marker for byte streams the transport layer hands around. Raw sockets,
/// header-stripped sockets and TLS-wrapped sockets all end up behind this.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

impl Debug for dyn AsyncStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("<AsyncStream>")
    }
}

/// The unified connection type every layer operates on.
pub type Stream = Box<dyn AsyncStream>;

/// Peer identity of an accepted connection. Starts out as the immediate
/// socket peer; a PROXY header upgrades it to the declared originating
/// address.
#[derive(Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Unix(Option<PathBuf>),
    Inet(SocketAddr),
}

impl Display for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerAddr::Unix(Some(path)) => write!(f, "unix:{}", path.display()),
            PeerAddr::Unix(None) => write!(f, "unix:(unnamed)"),
            PeerAddr::Inet(socket_addr) => write!(f, "{}", socket_addr),
        }
    }
}

impl Debug for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[peer: {}]", self)
    }
}

/// A fully wrapped connection on its way to the handler. Ownership moves to
/// the handler; the accept loop keeps nothing.
pub struct AcceptedConn {
    pub stream: Stream,
    pub peer: PeerAddr,
}

/// Blocking "accept the next connection" capability. The raw socket binder
/// and the PROXY header decorator implement the same interface, so the
/// listener composes them at construction time and never looks back.
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(&self) -> Result<(Stream, PeerAddr), AcceptError>;
}

/// A bound, running listener as the registry hands it back: enough surface
/// to report where it listens and to shut it down.
#[async_trait]
pub trait TransportListener: Send + Sync {
    fn local_endpoint(&self) -> String;

    async fn close(&self) -> std::io::Result<()>;
}

/// Callback invoked once per accepted, fully wrapped connection. Must return
/// quickly; anything long-running gets dispatched to its own task.
pub trait ConnHandler: Send + Sync {
    fn handle(&self, conn: AcceptedConn);
}

impl<F> ConnHandler for F
where
    F: Fn(AcceptedConn) + Send + Sync,
{
    fn handle(&self, conn: AcceptedConn) {
        self(conn)
    }
}
