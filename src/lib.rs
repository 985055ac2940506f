//! A pluggable stream transport over Unix domain sockets.
//!
//! The listener binds a local socket endpoint, accepts connections, and hands
//! each one to an external handler. Two optional decorators sit in between:
//!
//! - a PROXY protocol layer that requires every connection to declare its
//!   true originating address before it surfaces (for deployments behind a
//!   local load balancer or relay), and
//! - server-side TLS termination, where the handshake runs lazily inside the
//!   first read or write the handler performs.
//!
//! Transports are looked up by name through an explicitly populated
//! [`TransportRegistry`]; nothing registers itself at load time.

pub mod error;
pub mod transport;

pub use error::{AcceptError, ListenError, ProxyHeaderError};
pub use transport::registry::{register_builtin, ListenFn, StreamSettings, TransportRegistry};
pub use transport::tls::{TlsServerConfig, TlsServerStream, TlsSettings};
pub use transport::uds::{resolve_endpoint, UdsEndpoint, UdsListener, UdsSettings, PROTOCOL_NAME};
pub use transport::{
    AcceptedConn, Acceptor, AsyncStream, ConnHandler, PeerAddr, Stream, TransportListener,
};
