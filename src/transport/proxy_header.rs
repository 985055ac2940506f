use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_util::time::FutureExt;
use tracing::{debug, trace};

use crate::error::{AcceptError, ProxyHeaderError};
use crate::transport::{Acceptor, PeerAddr, Stream};

/// Longest possible v1 header including CRLF.
const V1_MAX: usize = 107;
/// Fixed 12-byte signature opening a v2 header.
const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// A parsed PROXY protocol header. `source` is absent for `UNKNOWN` (v1) and
/// `LOCAL` (v2) headers, which tell the receiver to keep the socket peer.
#[derive(Debug)]
pub struct ProxyHeader {
    pub source: Option<PeerAddr>,
}

/// Decorates an acceptor so every connection must open with a valid PROXY
/// protocol header before it surfaces upstream. There is no permissive mode:
/// a connection that cannot produce one is dropped here.
pub struct ProxyHeaderAcceptor {
    inner: Box<dyn Acceptor>,
    header_timeout: Duration,
}

impl ProxyHeaderAcceptor {
    pub fn require(inner: Box<dyn Acceptor>, header_timeout: Duration) -> Self {
        Self {
            inner,
            header_timeout,
        }
    }
}

#[async_trait]
impl Acceptor for ProxyHeaderAcceptor {
    async fn accept(&self) -> Result<(Stream, PeerAddr), AcceptError> {
        let (stream, socket_peer) = self.inner.accept().await?;
        let (stream, header) = match read_proxy_header(stream).timeout(self.header_timeout).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => {
                debug!("dropped connection from {}: {}", socket_peer, e);
                return Err(AcceptError::ProxyHeader(e));
            }
            Err(_elapsed) => {
                debug!("dropped connection from {}: no PROXY header in time", socket_peer);
                return Err(AcceptError::ProxyHeader(ProxyHeaderError::TimedOut));
            }
        };
        let peer = match header.source {
            Some(declared) => {
                trace!("{} declared originating address {}", socket_peer, declared);
                declared
            }
            None => socket_peer,
        };
        Ok((stream, peer))
    }
}

/// Takes the PROXY header off the front of `stream`. Bytes read past the
/// header are replayed ahead of the remaining stream, so the payload is
/// untouched from the handler's point of view.
pub(crate) async fn read_proxy_header(
    mut stream: Stream,
) -> Result<(Stream, ProxyHeader), ProxyHeaderError> {
    let mut buf = Vec::with_capacity(256);
    loop {
        if let Some((header, consumed)) = parse_header(&buf)? {
            let rest = buf.split_off(consumed);
            let stream = if rest.is_empty() {
                stream
            } else {
                Box::new(PrefixedStream::new(rest, stream)) as Stream
            };
            return Ok((stream, header));
        }
        let mut chunk = [0u8; 256];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyHeaderError::Truncated);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Attempts to parse a complete header from the front of `buf`. `None` means
/// the bytes so far are a valid prefix and more input is needed.
fn parse_header(buf: &[u8]) -> Result<Option<(ProxyHeader, usize)>, ProxyHeaderError> {
    let sig_overlap = buf.len().min(V2_SIGNATURE.len());
    if buf[..sig_overlap] == V2_SIGNATURE[..sig_overlap] {
        return parse_v2(buf);
    }
    let v1_overlap = buf.len().min(6);
    if buf[..v1_overlap] == b"PROXY "[..v1_overlap] {
        return parse_v1(buf);
    }
    Err(ProxyHeaderError::Malformed(
        "does not open with a PROXY protocol signature".to_owned(),
    ))
}

fn parse_v1(buf: &[u8]) -> Result<Option<(ProxyHeader, usize)>, ProxyHeaderError> {
    let window = &buf[..buf.len().min(V1_MAX)];
    let Some(crlf) = window.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() >= V1_MAX {
            return Err(ProxyHeaderError::Oversized(V1_MAX));
        }
        return Ok(None);
    };
    let line = std::str::from_utf8(&buf[..crlf])
        .map_err(|_| ProxyHeaderError::Malformed("v1 header is not ASCII".to_owned()))?;
    let mut tokens = line.split(' ');
    // First token is "PROXY", checked by the caller
    let _ = tokens.next();
    let source = match tokens.next() {
        Some("UNKNOWN") => None,
        Some("TCP4") => Some(parse_v1_addrs::<Ipv4Addr>(&mut tokens, line)?),
        Some("TCP6") => Some(parse_v1_addrs::<Ipv6Addr>(&mut tokens, line)?),
        _ => {
            return Err(ProxyHeaderError::Malformed(format!(
                "unrecognised v1 protocol in '{}'",
                line
            )))
        }
    };
    Ok(Some((ProxyHeader { source }, crlf + 2)))
}

fn parse_v1_addrs<A>(
    tokens: &mut std::str::Split<'_, char>,
    line: &str,
) -> Result<PeerAddr, ProxyHeaderError>
where
    A: std::str::FromStr + Into<IpAddr>,
{
    let malformed = || ProxyHeaderError::Malformed(format!("bad v1 address block in '{}'", line));
    let src_ip: A = tokens.next().and_then(|t| t.parse().ok()).ok_or_else(malformed)?;
    let _dst_ip: A = tokens.next().and_then(|t| t.parse().ok()).ok_or_else(malformed)?;
    let src_port: u16 = tokens.next().and_then(|t| t.parse().ok()).ok_or_else(malformed)?;
    let _dst_port: u16 = tokens.next().and_then(|t| t.parse().ok()).ok_or_else(malformed)?;
    if tokens.next().is_some() {
        return Err(malformed());
    }
    Ok(PeerAddr::Inet(SocketAddr::new(src_ip.into(), src_port)))
}

fn parse_v2(buf: &[u8]) -> Result<Option<(ProxyHeader, usize)>, ProxyHeaderError> {
    if buf.len() < 16 {
        return Ok(None);
    }
    let version = buf[12] >> 4;
    if version != 2 {
        return Err(ProxyHeaderError::Malformed(format!(
            "unsupported v2 version nibble {:#x}",
            version
        )));
    }
    let command = buf[12] & 0x0F;
    let family = buf[13] >> 4;
    let len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    let total = 16 + len;
    if buf.len() < total {
        return Ok(None);
    }
    let addrs = &buf[16..total];
    let source = match command {
        // LOCAL: health checks and the like, keep the socket peer
        0x0 => None,
        0x1 => parse_v2_addrs(family, addrs)?,
        other => {
            return Err(ProxyHeaderError::Malformed(format!(
                "unsupported v2 command {:#x}",
                other
            )))
        }
    };
    Ok(Some((ProxyHeader { source }, total)))
}

fn parse_v2_addrs(family: u8, addrs: &[u8]) -> Result<Option<PeerAddr>, ProxyHeaderError> {
    let short = || ProxyHeaderError::Malformed("v2 address block too short".to_owned());
    match family {
        // AF_UNSPEC carries no address
        0x0 => Ok(None),
        0x1 => {
            if addrs.len() < 12 {
                return Err(short());
            }
            let src_ip = Ipv4Addr::new(addrs[0], addrs[1], addrs[2], addrs[3]);
            let src_port = u16::from_be_bytes([addrs[8], addrs[9]]);
            Ok(Some(PeerAddr::Inet(SocketAddr::new(src_ip.into(), src_port))))
        }
        0x2 => {
            if addrs.len() < 36 {
                return Err(short());
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&addrs[..16]);
            let src_ip = Ipv6Addr::from(octets);
            let src_port = u16::from_be_bytes([addrs[32], addrs[33]]);
            Ok(Some(PeerAddr::Inet(SocketAddr::new(src_ip.into(), src_port))))
        }
        0x3 => {
            if addrs.len() < 216 {
                return Err(short());
            }
            let path_bytes = &addrs[..108];
            let end = path_bytes.iter().position(|b| *b == 0).unwrap_or(108);
            let path = PathBuf::from(bytes_to_os_str(&path_bytes[..end]));
            Ok(Some(PeerAddr::Unix((!path.as_os_str().is_empty()).then_some(path))))
        }
        other => Err(ProxyHeaderError::Malformed(format!(
            "unsupported v2 address family {:#x}",
            other
        ))),
    }
}

fn bytes_to_os_str(bytes: &[u8]) -> std::ffi::OsString {
    use std::os::unix::ffi::OsStringExt;
    std::ffi::OsString::from_vec(bytes.to_vec())
}

/// Replays buffered bytes before reading from the wrapped stream. Writes go
/// straight through.
struct PrefixedStream {
    prefix: Vec<u8>,
    pos: usize,
    inner: Stream,
}

impl PrefixedStream {
    fn new(prefix: Vec<u8>, inner: Stream) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn boxed(stream: tokio::io::DuplexStream) -> Stream {
        Box::new(stream)
    }

    #[tokio::test]
    async fn v1_tcp4_header_with_payload() {
        let (client, server) = tokio::io::duplex(512);
        let mut client = client;
        client
            .write_all(b"PROXY TCP4 192.0.2.7 198.51.100.1 56324 443\r\nping")
            .await
            .unwrap();
        let (mut stream, header) = read_proxy_header(boxed(server)).await.unwrap();
        assert_eq!(
            header.source,
            Some(PeerAddr::Inet("192.0.2.7:56324".parse().unwrap()))
        );
        let mut payload = [0u8; 4];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"ping");
    }

    #[tokio::test]
    async fn v1_tcp6_header() {
        let (client, server) = tokio::io::duplex(512);
        let mut client = client;
        client
            .write_all(b"PROXY TCP6 2001:db8::1 2001:db8::2 4000 443\r\n")
            .await
            .unwrap();
        let (_stream, header) = read_proxy_header(boxed(server)).await.unwrap();
        assert_eq!(
            header.source,
            Some(PeerAddr::Inet("[2001:db8::1]:4000".parse().unwrap()))
        );
    }

    #[tokio::test]
    async fn v1_unknown_falls_back_to_socket_peer() {
        let (client, server) = tokio::io::duplex(512);
        let mut client = client;
        client.write_all(b"PROXY UNKNOWN\r\n").await.unwrap();
        let (_stream, header) = read_proxy_header(boxed(server)).await.unwrap();
        assert!(header.source.is_none());
    }

    #[tokio::test]
    async fn garbage_is_rejected() {
        let (client, server) = tokio::io::duplex(512);
        let mut client = client;
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        let err = read_proxy_header(boxed(server)).await.unwrap_err();
        assert!(matches!(err, ProxyHeaderError::Malformed(_)));
    }

    #[tokio::test]
    async fn early_disconnect_is_truncated() {
        let (client, server) = tokio::io::duplex(512);
        let mut client = client;
        client.write_all(b"PROXY TCP4 192.0.2.7").await.unwrap();
        drop(client);
        let err = read_proxy_header(boxed(server)).await.unwrap_err();
        assert!(matches!(err, ProxyHeaderError::Truncated));
    }

    #[tokio::test]
    async fn endless_v1_line_is_oversized() {
        let (client, server) = tokio::io::duplex(512);
        let mut client = client;
        let mut long = b"PROXY TCP4 ".to_vec();
        long.extend(std::iter::repeat(b'1').take(150));
        client.write_all(&long).await.unwrap();
        let err = read_proxy_header(boxed(server)).await.unwrap_err();
        assert!(matches!(err, ProxyHeaderError::Oversized(_)));
    }

    fn v2_header(command: u8, family: u8, addrs: &[u8]) -> Vec<u8> {
        let mut buf = V2_SIGNATURE.to_vec();
        buf.push(0x20 | command);
        buf.push((family << 4) | 0x1);
        buf.extend((addrs.len() as u16).to_be_bytes());
        buf.extend_from_slice(addrs);
        buf
    }

    #[test]
    fn v2_inet_header() {
        let mut addrs = Vec::new();
        addrs.extend([192, 0, 2, 7]);
        addrs.extend([198, 51, 100, 1]);
        addrs.extend(56324u16.to_be_bytes());
        addrs.extend(443u16.to_be_bytes());
        let buf = v2_header(0x1, 0x1, &addrs);
        let (header, consumed) = parse_header(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(
            header.source,
            Some(PeerAddr::Inet("192.0.2.7:56324".parse().unwrap()))
        );
    }

    #[test]
    fn v2_local_falls_back_to_socket_peer() {
        let buf = v2_header(0x0, 0x0, &[]);
        let (header, _) = parse_header(&buf).unwrap().unwrap();
        assert!(header.source.is_none());
    }

    #[test]
    fn v2_prefix_needs_more_bytes() {
        let mut addrs = Vec::new();
        addrs.extend([192, 0, 2, 7]);
        addrs.extend([198, 51, 100, 1]);
        addrs.extend(56324u16.to_be_bytes());
        addrs.extend(443u16.to_be_bytes());
        let buf = v2_header(0x1, 0x1, &addrs);
        for cut in [4, 12, 15, buf.len() - 1] {
            assert!(parse_header(&buf[..cut]).unwrap().is_none(), "cut at {}", cut);
        }
    }
}
