#![allow(dead_code)]

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use mockproxy::certs::CertificateAuthority;
use mockproxy::config::Config;
use mockproxy::proxy::{ProxyContext, ProxyServer, SharedContext};
use mockproxy::{MockResponse, RuleAction, RuleSet};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

/// Binds a proxy on an ephemeral port and runs it in the background.
pub async fn start_proxy(config: Config, rules: RuleSet) -> (SocketAddr, SharedContext) {
    let config = Config {
        proxy_port: 0,
        ..config
    };
    let ca = CertificateAuthority::generate().unwrap();
    let ctx = ProxyContext::new(config, ca, Arc::new(rules)).shared();
    let server = ProxyServer::bind(ctx.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    (addr, ctx)
}

pub fn respond(status: u16, body: &str) -> RuleAction {
    RuleAction::Respond(MockResponse::new(status).with_body(body))
}

pub async fn read_head<S: AsyncRead + Unpin>(io: &mut S) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        io.read_exact(&mut byte).await.unwrap();
        buf.push(byte[0]);
    }
    String::from_utf8(buf).unwrap()
}

/// Reads until `needle` shows up, returning everything read so far.
pub async fn read_until<S: AsyncRead + Unpin>(io: &mut S, needle: &[u8]) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    while !buf.windows(needle.len()).any(|w| w == needle) {
        let n = io.read(&mut chunk).await.unwrap();
        assert!(n > 0, "EOF before {:?}: {}", needle, String::from_utf8_lossy(&buf));
        buf.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Sends CONNECT on an existing stream and returns the response head.
pub async fn send_connect<S: AsyncRead + AsyncWrite + Unpin>(io: &mut S, authority: &str) -> String {
    let request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", authority);
    io.write_all(request.as_bytes()).await.unwrap();
    read_head(io).await
}

/// Opens a TCP connection to the proxy and establishes a tunnel to `authority`.
pub async fn connect_tunnel(proxy: SocketAddr, authority: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let head = send_connect(&mut stream, authority).await;
    assert!(
        head.starts_with("HTTP/1.1 200 Connection Established\r\n"),
        "{}",
        head
    );
    stream
}

/// TLS client handshake. With a CA the chain and hostname are verified; without one
/// verification is off.
pub async fn tls_connect<S>(io: S, host: &str, alpn: &[u8], ca: Option<&X509>) -> SslStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut builder = SslConnector::builder(SslMethod::tls_client()).unwrap();
    match ca {
        Some(ca) => builder.cert_store_mut().add_cert(ca.clone()).unwrap(),
        None => builder.set_verify(SslVerifyMode::NONE),
    }
    if !alpn.is_empty() {
        builder.set_alpn_protos(alpn).unwrap();
    }
    let connector = builder.build();
    let mut config = connector.configure().unwrap();
    if ca.is_none() {
        config.set_verify_hostname(false);
    }
    let ssl = config.into_ssl(host).unwrap();
    let mut stream = SslStream::new(ssl, io).unwrap();
    Pin::new(&mut stream).connect().await.unwrap();
    stream
}

/// Starts an h2 client session over `io` with its connection driven in the background.
pub async fn h2_client<S>(io: S) -> h2::client::SendRequest<bytes::Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client, connection) = h2::client::handshake(io).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client.ready().await.unwrap()
}

pub async fn h2_body(mut body: h2::RecvStream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.unwrap();
        let _ = body.flow_control().release_capacity(chunk.len());
        out.extend_from_slice(&chunk);
    }
    out
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
