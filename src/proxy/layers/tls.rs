//! TLS interception: protocol sniffing, ClientHello inspection, the server-side handshake
//! with ALPN selection, and the upstream TLS client.

use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use openssl::ssl::{
    select_next_proto, AlpnError, Ssl, SslAcceptor, SslConnector, SslMethod, SslVerifyMode,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_openssl::SslStream;
use tracing::debug;

use crate::certs::CertificateRecord;
use crate::connection::{BoxedTransport, NegotiatedProtocol};
use crate::{Error, Result};

/// Client connection preface that opens every HTTP/2 connection.
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// ALPN lists in wire format.
pub const ALPN_H2_HTTP1: &[u8] = b"\x02h2\x08http/1.1";
pub const ALPN_HTTP1: &[u8] = b"\x08http/1.1";

/// Upper bound on buffered handshake bytes while waiting for a complete ClientHello.
const MAX_CLIENT_HELLO: usize = 64 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloData {
    pub sni: Option<String>,
    pub alpn_protocols: Vec<String>,
}

impl ClientHelloData {
    pub fn offers(&self, protocol: &str) -> bool {
        self.alpn_protocols.iter().any(|p| p == protocol)
    }
}

/// What the first bytes of a connection look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sniffed {
    Tls(ClientHelloData),
    H2c,
    Http1,
    /// Peer closed before sending anything.
    Closed,
}

/// Reads just enough of `io` to classify the connection. The bytes consumed are returned
/// so the caller can replay them through [`crate::connection::Rewind`].
pub async fn sniff<T: AsyncRead + Unpin>(io: &mut T) -> Result<(Sniffed, Bytes)> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let n = io.read_buf(&mut buf).await?;
        let eof = n == 0;
        if eof && buf.is_empty() {
            return Ok((Sniffed::Closed, Bytes::new()));
        }

        let verdict = classify(&buf);
        match verdict {
            Some(sniffed) => return Ok((sniffed, buf.freeze())),
            None if eof => {
                if buf[0] == 0x16 {
                    return Err(Error::handshake("connection closed inside ClientHello"));
                }
                return Ok((Sniffed::Http1, buf.freeze()));
            }
            None if buf.len() >= MAX_CLIENT_HELLO => {
                return Err(Error::protocol("ClientHello exceeds size limit"));
            }
            None => continue,
        }
    }
}

/// `None` means more bytes are needed to decide.
fn classify(buf: &[u8]) -> Option<Sniffed> {
    if buf.first() == Some(&0x16) {
        if buf.len() < 5 {
            return None;
        }
        if !starts_like_tls_record(buf) {
            return Some(Sniffed::Http1);
        }
        return get_client_hello(buf)
            .map(|_| Sniffed::Tls(parse_client_hello(buf).unwrap_or_default()));
    }

    let n = buf.len().min(H2_PREFACE.len());
    if buf[..n] == H2_PREFACE[..n] {
        if n == H2_PREFACE.len() {
            return Some(Sniffed::H2c);
        }
        return None;
    }
    Some(Sniffed::Http1)
}

/// Concatenates handshake records until one complete handshake message is available.
fn get_client_hello(data: &[u8]) -> Option<Vec<u8>> {
    let mut message = Vec::new();
    let mut offset = 0;

    while offset + 5 <= data.len() {
        let header = &data[offset..offset + 5];
        if !starts_like_tls_record(header) {
            return None;
        }
        let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if record_len == 0 {
            return None;
        }
        offset += 5;
        let body = data.get(offset..offset + record_len)?;
        message.extend_from_slice(body);
        offset += record_len;

        if message.len() >= 4 {
            let wanted = u32::from_be_bytes([0, message[1], message[2], message[3]]) as usize + 4;
            if message.len() >= wanted {
                message.truncate(wanted);
                return Some(message);
            }
        }
    }
    None
}

fn parse_client_hello(data: &[u8]) -> Option<ClientHelloData> {
    let message = get_client_hello(data)?;
    if message.first() != Some(&0x01) {
        return None;
    }
    let body = &message[4..];
    if body.len() < 38 {
        return None;
    }

    // legacy_version + random
    let mut offset = 34;
    let session_id_len = *body.get(offset)? as usize;
    offset += 1 + session_id_len;

    let suites = body.get(offset..offset + 2)?;
    offset += 2 + u16::from_be_bytes([suites[0], suites[1]]) as usize;

    let compression_len = *body.get(offset)? as usize;
    offset += 1 + compression_len;

    let Some(ext_len) = body.get(offset..offset + 2) else {
        return Some(ClientHelloData::default());
    };
    let ext_len = u16::from_be_bytes([ext_len[0], ext_len[1]]) as usize;
    offset += 2;

    match body.get(offset..offset + ext_len) {
        Some(extensions) => {
            let (sni, alpn_protocols) = parse_extensions(extensions);
            Some(ClientHelloData {
                sni,
                alpn_protocols,
            })
        }
        None => Some(ClientHelloData::default()),
    }
}

fn parse_extensions(data: &[u8]) -> (Option<String>, Vec<String>) {
    let mut sni = None;
    let mut alpn = Vec::new();
    let mut offset = 0;

    while offset + 4 <= data.len() {
        let kind = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;
        let Some(ext) = data.get(offset..offset + len) else {
            break;
        };
        match kind {
            0x0000 => sni = parse_sni_extension(ext).or(sni),
            0x0010 => alpn = parse_alpn_extension(ext),
            _ => {}
        }
        offset += len;
    }

    (sni, alpn)
}

fn parse_sni_extension(data: &[u8]) -> Option<String> {
    if data.len() < 5 {
        return None;
    }
    let list_end = 2 + u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < list_end {
        return None;
    }

    let mut offset = 2;
    while offset + 3 <= list_end {
        let name_type = data[offset];
        let len = u16::from_be_bytes([data[offset + 1], data[offset + 2]]) as usize;
        offset += 3;
        let name = data.get(offset..offset + len)?;
        if name_type == 0 {
            if let Ok(host) = std::str::from_utf8(name) {
                return Some(host.to_string());
            }
        }
        offset += len;
    }
    None
}

fn parse_alpn_extension(data: &[u8]) -> Vec<String> {
    let mut protocols = Vec::new();
    if data.len() < 2 {
        return protocols;
    }
    let list_end = (2 + u16::from_be_bytes([data[0], data[1]]) as usize).min(data.len());

    let mut offset = 2;
    while offset < list_end {
        let len = data[offset] as usize;
        offset += 1;
        let Some(proto) = data.get(offset..offset + len) else {
            break;
        };
        if let Ok(proto) = std::str::from_utf8(proto) {
            protocols.push(proto.to_string());
        }
        offset += len;
    }
    protocols
}

fn starts_like_tls_record(data: &[u8]) -> bool {
    data.len() >= 5 && matches!(data[0], 20..=23) && data[1] == 0x03 && matches!(data[2], 1..=4)
}

fn negotiated<S>(stream: &SslStream<S>) -> NegotiatedProtocol {
    match stream.ssl().selected_alpn_protocol() {
        Some(b"h2") => NegotiatedProtocol::H2,
        _ => NegotiatedProtocol::Http11,
    }
}

fn build_acceptor(record: &CertificateRecord, http2_enabled: bool) -> Result<SslAcceptor> {
    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;
    builder.set_verify(SslVerifyMode::NONE);
    builder.set_private_key(&record.key)?;
    builder.set_certificate(&record.cert)?;
    builder.add_extra_chain_cert(record.ca_cert.clone())?;
    builder.check_private_key()?;

    let server_protos: &'static [u8] = if http2_enabled {
        ALPN_H2_HTTP1
    } else {
        ALPN_HTTP1
    };
    builder.set_alpn_select_callback(move |_ssl, client| {
        select_next_proto(server_protos, client).ok_or(AlpnError::NOACK)
    });
    Ok(builder.build())
}

/// Terminates TLS on an inbound transport. No ALPN overlap, or no offer, yields HTTP/1.1.
pub async fn accept_tls(
    io: BoxedTransport,
    record: &CertificateRecord,
    http2_enabled: bool,
    timeout: Duration,
) -> Result<(SslStream<BoxedTransport>, NegotiatedProtocol)> {
    let acceptor = build_acceptor(record, http2_enabled)?;
    let ssl = Ssl::new(acceptor.context())?;
    let mut stream = SslStream::new(ssl, io)?;

    tokio::time::timeout(timeout, Pin::new(&mut stream).accept())
        .await
        .map_err(|_| Error::timeout(format!("client TLS handshake for {}", record.hostname)))?
        .map_err(|e| Error::handshake(format!("client handshake for {}: {}", record.hostname, e)))?;

    let protocol = negotiated(&stream);
    debug!("TLS established with client for {} ({})", record.hostname, protocol);
    Ok((stream, protocol))
}

/// Opens TLS to an upstream over an existing transport. `alpn` is a wire-format list; an
/// empty list sends no ALPN extension.
pub async fn connect_tls(
    io: BoxedTransport,
    host: &str,
    alpn: &[u8],
    insecure: bool,
    timeout: Duration,
) -> Result<(SslStream<BoxedTransport>, NegotiatedProtocol)> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    if insecure {
        builder.set_verify(SslVerifyMode::NONE);
    }
    if !alpn.is_empty() {
        builder.set_alpn_protos(alpn)?;
    }
    let connector = builder.build();

    let mut config = connector.configure()?;
    if insecure {
        config.set_verify_hostname(false);
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let ssl = config.into_ssl(host)?;
    let mut stream = SslStream::new(ssl, io)?;

    tokio::time::timeout(timeout, Pin::new(&mut stream).connect())
        .await
        .map_err(|_| Error::timeout(format!("upstream TLS handshake with {}", host)))?
        .map_err(|e| Error::handshake(format!("upstream handshake with {}: {}", host, e)))?;

    let protocol = negotiated(&stream);
    debug!("TLS established with upstream {} ({})", host, protocol);
    Ok((stream, protocol))
}
