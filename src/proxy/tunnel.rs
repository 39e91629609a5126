//! CONNECT tunnels.
//!
//! Inbound, [`establish`] validates a CONNECT exchange and decides whether the tunnel is
//! intercepted (a nested session runs on its bytes) or relayed raw to the authority.
//! Outbound, a tunnel is a chain of [`Hop`]s, each wrapping the transport built by the
//! previous one, so an upstream can sit behind any mix of proxies and TLS layers.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use h2::{Reason, RecvStream, SendStream};
use http::{Method, Request};
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::Config;
use crate::connection::{BoxedTransport, ConnectionInfo, NegotiatedProtocol, Rewind};
use crate::proxy::context::SharedContext;
use crate::proxy::layers::http::{serve_connection, Exchange};
use crate::proxy::layers::tcp;
use crate::proxy::layers::tls::{connect_tls, ALPN_HTTP1};
use crate::{Error, Result};

const MAX_CONNECT_RESPONSE: usize = 16 * 1024;
const ALPN_H2_ONLY: &[u8] = b"\x02h2";

/// A `host:port` pair. IPv6 hosts are stored without brackets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Authority {
    pub host: String,
    pub port: u16,
}

impl Authority {
    /// Parses a CONNECT authority, where the port is mandatory.
    pub fn parse(authority: &str) -> Result<Self> {
        let (host, port) = parse_authority(authority)?;
        match port {
            Some(port) => Ok(Self { host, port }),
            None => Err(Error::protocol(format!(
                "authority {} has no port",
                authority
            ))),
        }
    }

    pub fn parse_with_default(authority: &str, default_port: u16) -> Result<Self> {
        let (host, port) = parse_authority(authority)?;
        Ok(Self {
            host,
            port: port.unwrap_or(default_port),
        })
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_authority(authority: &str) -> Result<(String, Option<u16>)> {
    static AUTHORITY_RE: OnceLock<Regex> = OnceLock::new();
    let re = AUTHORITY_RE.get_or_init(|| {
        Regex::new(r"^(?P<host>[^:\[\]/\s]+|\[[0-9A-Fa-f:.]+\])(?::(?P<port>\d{1,5}))?$")
            .expect("authority pattern is valid")
    });

    let captures = re
        .captures(authority)
        .ok_or_else(|| Error::protocol(format!("invalid authority: {:?}", authority)))?;
    let host = captures
        .name("host")
        .map(|m| m.as_str().trim_start_matches('[').trim_end_matches(']'))
        .unwrap_or_default()
        .to_ascii_lowercase();

    let port = match captures.name("port") {
        Some(port) => match port.as_str().parse::<u16>() {
            Ok(0) | Err(_) => {
                return Err(Error::protocol(format!("invalid port in {}", authority)));
            }
            Ok(port) => Some(port),
        },
        None => None,
    };
    Ok((host, port))
}

/// One step of an outbound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hop {
    /// Must come first.
    Tcp(Authority),
    Tls {
        sni: String,
        /// Wire-format ALPN list; empty sends no ALPN extension.
        alpn: &'static [u8],
    },
    Http1Connect(Authority),
    Http2Connect(Authority),
}

#[derive(Debug, Clone, Copy)]
pub struct ChainOptions {
    pub insecure: bool,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl ChainOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            insecure: config.ssl_insecure,
            connect_timeout: config.upstream_timeout(),
            handshake_timeout: config.handshake_timeout(),
        }
    }
}

/// The transport produced by a hop chain.
pub struct Connected {
    pub transport: BoxedTransport,
    /// ALPN outcome of the last TLS hop, `None` when the last hop was not TLS.
    pub protocol: NegotiatedProtocol,
}

/// Hops that reach `target` given the configured upstream proxy. Callers append a
/// [`Hop::Tls`] when the target itself speaks TLS.
pub fn route(config: &Config, target: &Authority) -> Result<Vec<Hop>> {
    let Some(proxy_url) = config.upstream_proxy() else {
        return Ok(vec![Hop::Tcp(target.clone())]);
    };

    let url = url::Url::parse(proxy_url)?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::tunnel(format!("upstream proxy {} has no host", proxy_url)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::tunnel(format!("upstream proxy {} has no port", proxy_url)))?;
    let proxy = Authority {
        host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        port,
    };

    let mut hops = vec![Hop::Tcp(proxy.clone())];
    match url.scheme() {
        "http" => {}
        "https" => hops.push(Hop::Tls {
            sni: proxy.host.clone(),
            alpn: if config.upstream_proxy_http2 {
                ALPN_H2_ONLY
            } else {
                ALPN_HTTP1
            },
        }),
        other => {
            return Err(Error::tunnel(format!(
                "unsupported upstream proxy scheme: {}",
                other
            )))
        }
    }
    hops.push(if config.upstream_proxy_http2 {
        Hop::Http2Connect(target.clone())
    } else {
        Hop::Http1Connect(target.clone())
    });
    Ok(hops)
}

/// Builds the outbound transport hop by hop.
pub async fn connect_chain(hops: &[Hop], options: &ChainOptions) -> Result<Connected> {
    let mut transport: Option<BoxedTransport> = None;
    let mut protocol = NegotiatedProtocol::None;

    for hop in hops {
        let next: BoxedTransport = match (hop, transport.take()) {
            (Hop::Tcp(target), None) => {
                let stream = tokio::time::timeout(
                    options.connect_timeout,
                    TcpStream::connect((target.host.as_str(), target.port)),
                )
                .await
                .map_err(|_| Error::timeout(format!("connecting to {}", target)))?
                .map_err(|e| Error::tunnel(format!("cannot reach {}: {}", target, e)))?;
                stream.set_nodelay(true)?;
                protocol = NegotiatedProtocol::None;
                Box::new(stream)
            }
            (Hop::Tls { sni, alpn }, Some(io)) => {
                let (stream, negotiated) = connect_tls(
                    io,
                    sni,
                    alpn,
                    options.insecure,
                    options.handshake_timeout,
                )
                .await?;
                protocol = negotiated;
                Box::new(stream)
            }
            (Hop::Http1Connect(target), Some(io)) => {
                protocol = NegotiatedProtocol::None;
                http1_connect(io, target).await?
            }
            (Hop::Http2Connect(target), Some(io)) => {
                protocol = NegotiatedProtocol::None;
                http2_connect(io, target).await?
            }
            (hop, _) => {
                return Err(Error::internal(format!("hop {:?} out of order", hop)));
            }
        };
        transport = Some(next);
    }

    let transport = transport.ok_or_else(|| Error::internal("empty hop chain"))?;
    Ok(Connected {
        transport,
        protocol,
    })
}

/// Sends `CONNECT` over an HTTP/1.1 proxy connection. Bytes the proxy sent after its
/// response head are kept for the caller.
async fn http1_connect(mut io: BoxedTransport, target: &Authority) -> Result<BoxedTransport> {
    let request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", target);
    io.write_all(request.as_bytes()).await?;
    io.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if io.read_buf(&mut buf).await? == 0 {
            return Err(Error::tunnel(format!(
                "upstream proxy closed during CONNECT {}",
                target
            )));
        }

        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut response = httparse::Response::new(&mut headers);
            match response.parse(&buf) {
                Ok(httparse::Status::Complete(len)) => Some((len, response.code.unwrap_or(0))),
                Ok(httparse::Status::Partial) => None,
                Err(e) => {
                    return Err(Error::tunnel(format!(
                        "malformed CONNECT response from upstream proxy: {}",
                        e
                    )))
                }
            }
        };

        match parsed {
            Some((len, code)) if (200..300).contains(&code) => {
                let rest = buf.split_off(len).freeze();
                return Ok(Box::new(Rewind::new(io, rest)));
            }
            Some((_, code)) => {
                return Err(Error::tunnel(format!(
                    "upstream proxy answered CONNECT {} with {}",
                    target, code
                )));
            }
            None if buf.len() > MAX_CONNECT_RESPONSE => {
                return Err(Error::tunnel("CONNECT response head too large"));
            }
            None => {}
        }
    }
}

/// Opens an HTTP/2 CONNECT stream and exposes it as a byte transport.
async fn http2_connect(io: BoxedTransport, target: &Authority) -> Result<BoxedTransport> {
    let (client, connection) = h2::client::handshake(io).await?;
    let label = target.to_string();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("HTTP/2 CONNECT session for {} ended: {}", label, e);
        }
    });

    let mut client = client.ready().await?;
    let request = Request::builder()
        .method(Method::CONNECT)
        .uri(target.to_string())
        .body(())?;
    let (response, send) = client.send_request(request, false)?;
    let response = response.await?;
    if !response.status().is_success() {
        return Err(Error::tunnel(format!(
            "upstream proxy answered HTTP/2 CONNECT {} with {}",
            target,
            response.status()
        )));
    }
    Ok(Box::new(H2Io::new(send, response.into_body())))
}

/// Byte-stream view of one HTTP/2 stream. Used both for an inbound CONNECT stream and
/// for an outbound CONNECT to an HTTP/2 proxy.
pub struct H2Io {
    send: SendStream<Bytes>,
    recv: RecvStream,
    buffered: Bytes,
    shut_down: bool,
}

impl H2Io {
    pub fn new(send: SendStream<Bytes>, recv: RecvStream) -> Self {
        Self {
            send,
            recv,
            buffered: Bytes::new(),
            shut_down: false,
        }
    }
}

fn h2_to_io(e: h2::Error) -> io::Error {
    if e.is_io() {
        if let Some(io_error) = e.into_io() {
            return io_error;
        }
        return io::Error::new(io::ErrorKind::Other, "HTTP/2 transport error");
    }
    io::Error::new(io::ErrorKind::Other, e)
}

impl AsyncRead for H2Io {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.buffered.is_empty() {
                let n = self.buffered.len().min(buf.remaining());
                let chunk = self.buffered.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            match ready!(self.recv.poll_data(cx)) {
                Some(Ok(data)) => {
                    let _ = self.recv.flow_control().release_capacity(data.len());
                    self.buffered = data;
                }
                Some(Err(e))
                    if e.reason() == Some(Reason::NO_ERROR)
                        || e.reason() == Some(Reason::CANCEL) =>
                {
                    return Poll::Ready(Ok(()));
                }
                Some(Err(e)) => return Poll::Ready(Err(h2_to_io(e))),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for H2Io {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        self.send.reserve_capacity(buf.len());
        loop {
            // A zero grant is consumed by this poll; the next one parks on the stream.
            match ready!(self.send.poll_capacity(cx)) {
                Some(Ok(0)) => continue,
                Some(Ok(n)) => {
                    let n = n.min(buf.len());
                    self.send
                        .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                        .map_err(h2_to_io)?;
                    return Poll::Ready(Ok(n));
                }
                Some(Err(e)) => return Poll::Ready(Err(h2_to_io(e))),
                None => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.shut_down {
            self.shut_down = true;
            self.send
                .send_data(Bytes::new(), true)
                .map_err(h2_to_io)?;
        }
        Poll::Ready(Ok(()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Establishing,
    Open,
    Closed,
}

pub enum TunnelMode {
    /// A nested session is attached to the tunnel bytes.
    Intercept,
    /// Bytes are relayed to an upstream connection opened before the CONNECT was answered.
    Raw(BoxedTransport),
}

/// An accepted CONNECT, not yet bound to the inbound byte stream.
pub struct Tunnel {
    pub authority: Authority,
    pub mode: TunnelMode,
    pub state: TunnelState,
}

impl Tunnel {
    pub fn is_raw(&self) -> bool {
        matches!(self.mode, TunnelMode::Raw(_))
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("authority", &self.authority)
            .field("raw", &self.is_raw())
            .field("state", &self.state)
            .finish()
    }
}

/// Validates a CONNECT exchange and prepares its tunnel. Errors are meant to be answered
/// on the exchange: bad authority → 400, depth exceeded → 508, unreachable → 502.
pub async fn establish(
    ctx: &SharedContext,
    conn: &ConnectionInfo,
    exchange: &Exchange,
) -> Result<Tunnel> {
    let authority = Authority::parse(&exchange.target)?;

    if conn.depth >= ctx.config.max_tunnel_depth {
        return Err(Error::resource_limit(format!(
            "tunnel depth {} reached for CONNECT {}",
            ctx.config.max_tunnel_depth, authority
        )));
    }

    if ctx.config.is_tls_passthrough(&authority.host) {
        let hops = route(&ctx.config, &authority)?;
        let connected = connect_chain(&hops, &ChainOptions::from_config(&ctx.config))
            .await
            .map_err(|e| match e {
                Error::Timeout(_) | Error::Tunnel(_) => e,
                other => Error::tunnel(format!("CONNECT {}: {}", authority, other)),
            })?;
        info!("Relaying CONNECT {} without interception", authority);
        return Ok(Tunnel {
            authority,
            mode: TunnelMode::Raw(connected.transport),
            state: TunnelState::Establishing,
        });
    }

    debug!("Intercepting CONNECT {}", authority);
    Ok(Tunnel {
        authority,
        mode: TunnelMode::Intercept,
        state: TunnelState::Establishing,
    })
}

/// Runs an established tunnel over the inbound byte stream until either side closes.
pub async fn run(
    ctx: SharedContext,
    mut tunnel: Tunnel,
    inbound: BoxedTransport,
    conn: ConnectionInfo,
) -> Result<()> {
    tunnel.state = TunnelState::Open;
    let authority = tunnel.authority.to_string();
    let result = match tunnel.mode {
        TunnelMode::Intercept => {
            let nested = conn.nested(&authority);
            serve_connection(ctx, inbound, nested).await
        }
        TunnelMode::Raw(upstream) => tcp::relay(inbound, upstream, ctx.shutdown.child_token())
            .await
            .map(|_| ()),
    };
    debug!("Tunnel to {} closed", authority);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyMode;

    #[test]
    fn test_parse_authority() {
        let a = Authority::parse("Example.com:443").unwrap();
        assert_eq!(a.host, "example.com");
        assert_eq!(a.port, 443);

        let v6 = Authority::parse("[::1]:8080").unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "[::1]:8080");

        assert!(Authority::parse("example.com").is_err());
        assert!(Authority::parse("example.com:0").is_err());
        assert!(Authority::parse("example.com:99999").is_err());
        assert!(Authority::parse("/path:80").is_err());
        assert_eq!(
            Authority::parse_with_default("example.com", 80).unwrap().port,
            80
        );
    }

    #[test]
    fn test_route_through_upstream_proxy() {
        let target = Authority::parse("example.com:443").unwrap();
        let mut config = Config::default();
        assert_eq!(
            route(&config, &target).unwrap(),
            vec![Hop::Tcp(target.clone())]
        );

        config.mode = ProxyMode::Upstream;
        config.upstream_server = Some("http://proxy.local:3128".to_string());
        assert_eq!(
            route(&config, &target).unwrap(),
            vec![
                Hop::Tcp(Authority {
                    host: "proxy.local".to_string(),
                    port: 3128
                }),
                Hop::Http1Connect(target.clone()),
            ]
        );

        config.upstream_server = Some("https://proxy.local".to_string());
        config.upstream_proxy_http2 = true;
        let hops = route(&config, &target).unwrap();
        assert_eq!(hops.len(), 3);
        assert_eq!(
            hops[1],
            Hop::Tls {
                sni: "proxy.local".to_string(),
                alpn: ALPN_H2_ONLY
            }
        );
        assert_eq!(hops[2], Hop::Http2Connect(target));
    }

    #[tokio::test]
    async fn test_http1_connect_keeps_trailing_bytes() {
        let mock = tokio_test::io::Builder::new()
            .write(b"CONNECT a.example:443 HTTP/1.1\r\nHost: a.example:443\r\n\r\n")
            .read(b"HTTP/1.1 200 Connection Established\r\n\r\nhello")
            .build();
        let target = Authority::parse("a.example:443").unwrap();
        let mut io = http1_connect(Box::new(mock), &target).await.unwrap();

        let mut buf = [0u8; 5];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_http1_connect_refused() {
        let mock = tokio_test::io::Builder::new()
            .write(b"CONNECT a.example:443 HTTP/1.1\r\nHost: a.example:443\r\n\r\n")
            .read(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
            .build();
        let target = Authority::parse("a.example:443").unwrap();
        let err = http1_connect(Box::new(mock), &target).await.err().unwrap();
        assert!(matches!(err, Error::Tunnel(_)));
    }

    #[tokio::test]
    async fn test_http2_connect_stream_carries_bytes() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            let mut connection = h2::server::handshake(server_io).await.unwrap();
            while let Some(Ok((request, mut respond))) = connection.accept().await {
                assert_eq!(request.method(), Method::CONNECT);
                let recv = request.into_body();
                tokio::spawn(async move {
                    let response = http::Response::builder().status(200).body(()).unwrap();
                    let send = respond.send_response(response, false).unwrap();
                    let mut echo = H2Io::new(send, recv);
                    let mut buf = [0u8; 4];
                    echo.read_exact(&mut buf).await.unwrap();
                    echo.write_all(&buf).await.unwrap();
                    echo.shutdown().await.unwrap();
                });
            }
        });

        let target = Authority::parse("b.example:443").unwrap();
        let mut io = http2_connect(Box::new(client_io), &target).await.unwrap();
        io.write_all(b"ping").await.unwrap();
        let mut out = Vec::new();
        io.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ping");
    }

    #[tokio::test]
    async fn test_http2_connect_stream_waits_for_window() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            // Default 64 KiB stream window on the receiving side.
            let mut connection = h2::server::handshake(server_io).await.unwrap();
            while let Some(Ok((request, mut respond))) = connection.accept().await {
                let recv = request.into_body();
                tokio::spawn(async move {
                    let response = http::Response::builder().status(200).body(()).unwrap();
                    let send = respond.send_response(response, false).unwrap();
                    let mut sink = H2Io::new(send, recv);
                    let mut received = Vec::new();
                    sink.read_to_end(&mut received).await.unwrap();
                    sink.write_all(&(received.len() as u64).to_be_bytes())
                        .await
                        .unwrap();
                    sink.shutdown().await.unwrap();
                });
            }
        });

        let target = Authority::parse("bulk.example:443").unwrap();
        let mut io = http2_connect(Box::new(client_io), &target).await.unwrap();
        let payload = vec![7u8; 512 * 1024];
        let written = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            io.write_all(&payload).await.unwrap();
            io.shutdown().await.unwrap();
            let mut len = [0u8; 8];
            io.read_exact(&mut len).await.unwrap();
            u64::from_be_bytes(len)
        })
        .await
        .unwrap();
        assert_eq!(written, payload.len() as u64);
    }

    #[tokio::test]
    async fn test_unreachable_tcp_hop() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let hops = vec![Hop::Tcp(Authority {
            host: "127.0.0.1".to_string(),
            port,
        })];
        let options = ChainOptions::from_config(&Config::default());
        let err = connect_chain(&hops, &options).await.err().unwrap();
        assert!(matches!(err, Error::Tunnel(_)));
    }
}
