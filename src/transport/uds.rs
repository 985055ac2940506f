use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::error::{AcceptError, ListenError};
use crate::transport::proxy_header::ProxyHeaderAcceptor;
use crate::transport::registry::StreamSettings;
use crate::transport::tls::TlsServerConfig;
use crate::transport::{AcceptedConn, Acceptor, ConnHandler, PeerAddr, Stream, TransportListener};

/// Registry name for this transport.
pub const PROTOCOL_NAME: &str = "uds";

/// After this many accept failures in a row the loop stops spinning hot and
/// naps between attempts. Any success resets the count.
const TRANSIENT_FAILURE_THRESHOLD: u32 = 8;
const TRANSIENT_FAILURE_DELAY: Duration = Duration::from_millis(100);

/// Where the socket lives. Immutable once resolved; the listener keeps it
/// around to report where it is bound.
#[derive(Clone, PartialEq, Eq)]
pub enum UdsEndpoint {
    Path(PathBuf),
    /// Linux abstract namespace, written `@name` in configuration. No
    /// filesystem entry, vanishes with the last listener.
    #[cfg(target_os = "linux")]
    Abstract(Vec<u8>),
}

impl Display for UdsEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            UdsEndpoint::Path(path) => write!(f, "{}", path.display()),
            #[cfg(target_os = "linux")]
            UdsEndpoint::Abstract(name) => write!(f, "@{}", String::from_utf8_lossy(name)),
        }
    }
}

impl Debug for UdsEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[endpoint: {}]", self)
    }
}

/// Transport-level switches for one listener, snapshotted at construction.
#[derive(Clone, Debug)]
pub struct UdsSettings {
    /// Socket path, or `@name` for a Linux abstract socket.
    pub listen: String,
    /// Require every connection to open with a PROXY protocol header. There
    /// is no permissive variant; a header-less connection is dropped.
    pub accept_proxy_header: bool,
    /// How long a connection may take to produce its PROXY header.
    pub proxy_header_timeout: Duration,
}

pub fn resolve_endpoint(listen: &str) -> Result<UdsEndpoint, ListenError> {
    let listen = listen.trim();
    if listen.is_empty() {
        return Err(ListenError::Config("endpoint path is empty".to_owned()));
    }
    if let Some(name) = listen.strip_prefix('@') {
        #[cfg(target_os = "linux")]
        {
            if name.is_empty() {
                return Err(ListenError::Config("abstract endpoint name is empty".to_owned()));
            }
            return Ok(UdsEndpoint::Abstract(name.as_bytes().to_vec()));
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = name;
            return Err(ListenError::Config(
                "abstract socket endpoints are only available on linux".to_owned(),
            ));
        }
    }
    Ok(UdsEndpoint::Path(PathBuf::from(listen)))
}

fn bind_error(endpoint: &UdsEndpoint, source: std::io::Error) -> ListenError {
    ListenError::Bind {
        endpoint: endpoint.to_string(),
        source,
    }
}

fn bind_endpoint(endpoint: &UdsEndpoint) -> Result<UnixListener, ListenError> {
    match endpoint {
        UdsEndpoint::Path(path) => UnixListener::bind(path).map_err(|e| bind_error(endpoint, e)),
        #[cfg(target_os = "linux")]
        UdsEndpoint::Abstract(name) => {
            use std::os::linux::net::SocketAddrExt;
            let addr = std::os::unix::net::SocketAddr::from_abstract_name(name)
                .map_err(|e| bind_error(endpoint, e))?;
            let listener = std::os::unix::net::UnixListener::bind_addr(&addr)
                .map_err(|e| bind_error(endpoint, e))?;
            listener
                .set_nonblocking(true)
                .map_err(|e| bind_error(endpoint, e))?;
            UnixListener::from_std(listener).map_err(|e| bind_error(endpoint, e))
        }
    }
}

/// The undecorated accepting object: a bound socket that yields raw streams
/// and their immediate peers.
struct UdsAcceptor {
    listener: UnixListener,
}

#[async_trait]
impl Acceptor for UdsAcceptor {
    async fn accept(&self) -> Result<(Stream, PeerAddr), AcceptError> {
        let (stream, addr) = self.listener.accept().await?;
        let peer = PeerAddr::Unix(addr.as_pathname().map(|p| p.to_owned()));
        Ok((Box::new(stream), peer))
    }
}

/// A bound Unix socket listener with its accept loop already running. One
/// loop per instance, started at construction, stopped only by `close()`.
pub struct UdsListener {
    endpoint: UdsEndpoint,
    shutdown: CancellationToken,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdsListener {
    /// Resolves and binds the endpoint, stacks the decorators the settings
    /// ask for, and spawns the accept loop. Returns as soon as the loop task
    /// is scheduled; it never blocks on connections. Both failure modes here
    /// (bad endpoint, bind refusal) are fatal to this attempt only.
    pub async fn listen(
        settings: UdsSettings,
        tls: Option<TlsServerConfig>,
        handler: Arc<dyn ConnHandler>,
    ) -> Result<Self, ListenError> {
        let endpoint = resolve_endpoint(&settings.listen)?;
        let listener = bind_endpoint(&endpoint)?;
        let mut acceptor: Box<dyn Acceptor> = Box::new(UdsAcceptor { listener });
        if settings.accept_proxy_header {
            info!("requiring PROXY protocol headers on {}", endpoint);
            acceptor = Box::new(ProxyHeaderAcceptor::require(
                acceptor,
                settings.proxy_header_timeout,
            ));
        }
        let shutdown = CancellationToken::new();
        let loop_task = tokio::task::spawn(run(acceptor, tls, handler, shutdown.clone()));
        info!("now listening on {}", endpoint);
        Ok(Self {
            endpoint,
            shutdown,
            loop_task: Mutex::new(Some(loop_task)),
        })
    }

    pub fn endpoint(&self) -> &UdsEndpoint {
        &self.endpoint
    }

    /// Stops the accept loop and releases the socket. Safe to call while the
    /// loop is parked in accept, and safe to call more than once; only the
    /// first call does anything.
    pub async fn close(&self) -> std::io::Result<()> {
        self.shutdown.cancel();
        let loop_task = self.loop_task.lock().await.take();
        if let Some(loop_task) = loop_task {
            if let Err(e) = loop_task.await {
                warn!("accept loop did not stop cleanly: {}", e);
            }
        }
        if let UdsEndpoint::Path(path) = &self.endpoint {
            match std::fs::remove_file(path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TransportListener for UdsListener {
    fn local_endpoint(&self) -> String {
        self.endpoint.to_string()
    }

    async fn close(&self) -> std::io::Result<()> {
        UdsListener::close(self).await
    }
}

/// Registry adapter: builds the TLS termination config when the settings
/// carry one, then brings the listener up.
pub fn listen_uds(
    settings: StreamSettings,
    handler: Arc<dyn ConnHandler>,
) -> Pin<Box<dyn Future<Output = Result<Box<dyn TransportListener>, ListenError>> + Send>> {
    Box::pin(async move {
        let tls = settings.tls.as_ref().map(TlsServerConfig::new).transpose()?;
        let listener = UdsListener::listen(settings.uds, tls, handler).await?;
        Ok(Box::new(listener) as Box<dyn TransportListener>)
    })
}

/// The accept loop. Two states: running, and stopped once the shutdown token
/// fires or the acceptor reports closure. A failed accept drops that one
/// connection and keeps the loop alive.
async fn run(
    acceptor: Box<dyn Acceptor>,
    tls: Option<TlsServerConfig>,
    handler: Arc<dyn ConnHandler>,
    shutdown: CancellationToken,
) {
    let mut consecutive_failures: u32 = 0;
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = acceptor.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                consecutive_failures = 0;
                let stream = match &tls {
                    Some(tls_config) => Box::new(tls_config.wrap(stream)) as Stream,
                    None => stream,
                };
                trace!("accepted connection from {}", peer);
                handler.handle(AcceptedConn { stream, peer });
            }
            Err(e) if e.is_shutdown() => break,
            Err(e) => {
                warn!("failed to accept connection: {}", e);
                consecutive_failures = consecutive_failures.saturating_add(1);
                if consecutive_failures >= TRANSIENT_FAILURE_THRESHOLD {
                    sleep(TRANSIENT_FAILURE_DELAY).await;
                }
            }
        }
    }
    trace!("accept loop stopped");
}
