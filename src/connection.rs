//! Connection types: the byte-stream abstraction every session runs on, and the
//! metadata that travels with it through nested tunnels.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::SystemTime;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Anything a session can run on: a TCP socket, a TLS stream, an upgraded HTTP/1.1
/// connection or a single HTTP/2 stream.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Tls,
}

/// Application protocol chosen for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedProtocol {
    None,
    Http11,
    H2c,
    H2,
}

impl NegotiatedProtocol {
    pub fn is_http2(self) -> bool {
        matches!(self, NegotiatedProtocol::H2 | NegotiatedProtocol::H2c)
    }
}

impl fmt::Display for NegotiatedProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiatedProtocol::None => "none",
            NegotiatedProtocol::Http11 => "http/1.1",
            NegotiatedProtocol::H2c => "h2c",
            NegotiatedProtocol::H2 => "h2",
        };
        f.write_str(name)
    }
}

/// Metadata of one inbound connection, including connections that live inside a tunnel.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: String,
    pub peername: Option<SocketAddr>,
    pub transport: TransportKind,
    pub protocol: NegotiatedProtocol,
    /// 0 for sockets accepted from the listener, +1 for every CONNECT tunnel around it.
    pub depth: usize,
    pub sni: Option<String>,
    /// Authority of the CONNECT request that opened the enclosing tunnel.
    pub tunnel_authority: Option<String>,
    pub timestamp_start: SystemTime,
    pub timestamp_tls_setup: Option<SystemTime>,
}

impl ConnectionInfo {
    pub fn new(peername: Option<SocketAddr>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            peername,
            transport: TransportKind::Tcp,
            protocol: NegotiatedProtocol::None,
            depth: 0,
            sni: None,
            tunnel_authority: None,
            timestamp_start: SystemTime::now(),
            timestamp_tls_setup: None,
        }
    }

    /// Metadata for a connection carried inside a tunnel opened on this one.
    pub fn nested(&self, authority: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            peername: self.peername,
            transport: TransportKind::Tcp,
            protocol: NegotiatedProtocol::None,
            depth: self.depth + 1,
            sni: None,
            tunnel_authority: Some(authority.to_string()),
            timestamp_start: SystemTime::now(),
            timestamp_tls_setup: None,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.transport == TransportKind::Tls
    }

    pub fn scheme(&self) -> &'static str {
        if self.is_tls() {
            "https"
        } else {
            "http"
        }
    }
}

/// Replays bytes that were read while sniffing the protocol before handing reads to the
/// wrapped transport.
pub struct Rewind<T> {
    prefix: Option<Bytes>,
    inner: T,
}

impl<T> Rewind<T> {
    pub fn new(inner: T, prefix: Bytes) -> Self {
        let prefix = if prefix.is_empty() { None } else { Some(prefix) };
        Self { prefix, inner }
    }

    pub fn into_inner(self) -> (T, Bytes) {
        (self.inner, self.prefix.unwrap_or_default())
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            if !prefix.is_empty() {
                let n = prefix.len().min(buf.remaining());
                buf.put_slice(&prefix[..n]);
                prefix.advance(n);
                if !prefix.is_empty() {
                    self.prefix = Some(prefix);
                }
                return Poll::Ready(Ok(()));
            }
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
