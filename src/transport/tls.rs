use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{server, Accept, TlsAcceptor};

use crate::error::ListenError;
use crate::transport::Stream;

/// TLS material as it arrives from configuration: PEM paths plus optional
/// ALPN. Absent section means no TLS wrapping at all.
#[derive(Clone, Debug)]
pub struct TlsSettings {
    pub certificate: PathBuf,
    pub key: PathBuf,
    pub alpn: Vec<String>,
}

/// Server-side TLS termination for accepted connections. Built once at
/// listener construction; `wrap` is called per connection and performs no
/// I/O by itself.
pub struct TlsServerConfig {
    acceptor: TlsAcceptor,
}

impl TlsServerConfig {
    pub fn new(settings: &TlsSettings) -> Result<Self, ListenError> {
        let certs = load_certs(&settings.certificate)?;
        let key = load_private_key(&settings.key)?;
        let mut server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ListenError::Tls(format!("certificate rejected: {}", e)))?;
        if !settings.alpn.is_empty() {
            server_config.alpn_protocols = settings
                .alpn
                .iter()
                .map(|p| p.as_bytes().to_vec())
                .collect();
        }
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Wraps a connection without touching the wire. The handshake runs
    /// inside the first read or write the handler performs, so a peer that
    /// never speaks TLS only ever fails in the handler, not in the accept
    /// loop.
    pub fn wrap(&self, stream: Stream) -> TlsServerStream {
        TlsServerStream {
            state: HandshakeState::Pending(self.acceptor.accept(stream)),
        }
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ListenError> {
    let file = File::open(path)
        .map_err(|e| ListenError::Tls(format!("cannot open certificate {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ListenError::Tls(format!("cannot parse certificate {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(ListenError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ListenError> {
    let file = File::open(path)
        .map_err(|e| ListenError::Tls(format!("cannot open key {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let items = rustls_pemfile::read_all(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ListenError::Tls(format!("cannot parse key {}: {}", path.display(), e)))?;
    for item in items {
        match item {
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }
    Err(ListenError::Tls(format!(
        "no private key found in {}",
        path.display()
    )))
}

enum HandshakeState {
    Pending(Accept<Stream>),
    Active(server::TlsStream<Stream>),
    Failed(std::io::ErrorKind, String),
}

/// A connection that still owes the peer a TLS handshake. Reads and writes
/// drive the handshake to completion first, then pass through the session.
/// A failed handshake keeps failing on every later call.
pub struct TlsServerStream {
    state: HandshakeState,
}

impl TlsServerStream {
    fn poll_handshake(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        loop {
            match &mut self.state {
                HandshakeState::Pending(accept) => match Pin::new(accept).poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(tls_stream)) => {
                        self.state = HandshakeState::Active(tls_stream);
                    }
                    Poll::Ready(Err(e)) => {
                        self.state = HandshakeState::Failed(e.kind(), e.to_string());
                        return Poll::Ready(Err(e));
                    }
                },
                HandshakeState::Active(_) => return Poll::Ready(Ok(())),
                HandshakeState::Failed(kind, message) => {
                    return Poll::Ready(Err(std::io::Error::new(*kind, message.clone())))
                }
            }
        }
    }
}

impl AsyncRead for TlsServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        ready!(me.poll_handshake(cx))?;
        match &mut me.state {
            HandshakeState::Active(tls_stream) => Pin::new(tls_stream).poll_read(cx, buf),
            _ => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "tls session unavailable",
            ))),
        }
    }
}

impl AsyncWrite for TlsServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let me = self.get_mut();
        ready!(me.poll_handshake(cx))?;
        match &mut me.state {
            HandshakeState::Active(tls_stream) => Pin::new(tls_stream).poll_write(cx, buf),
            _ => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "tls session unavailable",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        ready!(me.poll_handshake(cx))?;
        match &mut me.state {
            HandshakeState::Active(tls_stream) => Pin::new(tls_stream).poll_flush(cx),
            _ => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        match &mut me.state {
            HandshakeState::Active(tls_stream) => Pin::new(tls_stream).poll_shutdown(cx),
            // Never finished (or never started) a session, nothing to wind down
            _ => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use rustls::pki_types::ServerName;
    use rustls::RootCertStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsConnector;

    use super::*;

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("resources/test")
            .join(name)
    }

    fn test_settings() -> TlsSettings {
        TlsSettings {
            certificate: fixture("cert.pem"),
            key: fixture("key.pem"),
            alpn: vec![],
        }
    }

    fn test_connector() -> TlsConnector {
        let mut root_store = RootCertStore::empty();
        for cert in load_certs(&fixture("cert.pem")).expect("test certificate") {
            root_store.add(cert).expect("test certificate is a valid root");
        }
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(client_config))
    }

    #[test]
    fn rejects_missing_certificate() {
        let settings = TlsSettings {
            certificate: fixture("does-not-exist.pem"),
            key: fixture("key.pem"),
            alpn: vec![],
        };
        assert!(matches!(TlsServerConfig::new(&settings), Err(ListenError::Tls(_))));
    }

    #[tokio::test]
    async fn handshake_runs_inside_first_read() {
        let server_config = TlsServerConfig::new(&test_settings()).expect("test material loads");
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut server_stream = server_config.wrap(Box::new(server_io));

        let client = tokio::spawn(async move {
            let domain = ServerName::try_from("localhost").expect("static name");
            let mut tls = test_connector()
                .connect(domain, client_io)
                .await
                .expect("client handshake");
            tls.write_all(b"ping").await.expect("client write");
            tls.flush().await.expect("client flush");
            let mut reply = [0u8; 4];
            tls.read_exact(&mut reply).await.expect("client read");
            reply
        });

        let mut request = [0u8; 4];
        server_stream.read_exact(&mut request).await.expect("server read");
        assert_eq!(&request, b"ping");
        server_stream.write_all(b"pong").await.expect("server write");
        server_stream.flush().await.expect("server flush");

        assert_eq!(client.await.expect("client task"), *b"pong");
    }

    #[tokio::test]
    async fn plaintext_peer_fails_in_the_stream_not_the_listener() {
        let server_config = TlsServerConfig::new(&test_settings()).expect("test material loads");
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut server_stream = server_config.wrap(Box::new(server_io));

        let mut client_io = client_io;
        client_io.write_all(b"this is not a client hello").await.expect("plain write");

        let mut buf = [0u8; 16];
        let first = server_stream.read(&mut buf).await;
        assert!(first.is_err());
        // Failure sticks for the rest of the connection's life
        let second = server_stream.read(&mut buf).await;
        assert!(second.is_err());
    }
}
