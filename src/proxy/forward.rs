//! Pass-through forwarding of exchanges to their real upstream.
//!
//! The upstream is reached through the same hop chain as raw tunnels, so an upstream
//! proxy is honoured here too. TLS upstreams pick their version through ALPN; plaintext
//! upstreams always speak HTTP/1.1. Headers are translated whenever the inbound and
//! upstream versions differ, and body framing is left to the outbound framer.

use std::collections::HashMap;

use bytes::Bytes;
use h2::Reason;
use http::header::HOST;
use http::{HeaderMap, HeaderValue, Request, Response, Version};
use hyper::body::Body;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::UpstreamHttp2;
use crate::connection::NegotiatedProtocol;
use crate::error::TranslationError;
use crate::proxy::body::{incoming, send_body_h2, H2RecvBody, ProxyBody};
use crate::proxy::context::SharedContext;
use crate::proxy::layers::http::Exchange;
use crate::proxy::layers::http2::configure_client;
use crate::proxy::layers::tls::{ALPN_H2_HTTP1, ALPN_HTTP1};
use crate::proxy::translate::{
    h1_request_to_h2, h1_response_to_h2, h2_request_to_h1, h2_response_to_h1, header_list,
    is_hop_by_hop, to_header_map, H1RequestHead, H1ResponseHead, HeaderList,
};
use crate::proxy::tunnel::{self, Authority, ChainOptions, Hop};
use crate::{Error, Result};

const MAX_IDLE_PER_UPSTREAM: usize = 8;

/// What the forwarder got back, plus what it actually sent.
pub struct Forwarded {
    pub response: Response<ProxyBody>,
    /// Header list as written to the upstream; HTTP/2 lists include pseudo-headers.
    pub sent_headers: HeaderList,
    pub upstream_protocol: NegotiatedProtocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    scheme: String,
    authority: Authority,
    offer_h2: bool,
}

enum Upstream {
    Http1(http1::SendRequest<ProxyBody>),
    Http2(h2::client::SendRequest<Bytes>),
}

/// Upstream connections kept between exchanges. HTTP/2 senders are shared while their
/// connection is open; HTTP/1.1 senders are handed back once their response is consumed.
#[derive(Default)]
pub struct UpstreamPool {
    http1: Mutex<HashMap<PoolKey, Vec<http1::SendRequest<ProxyBody>>>>,
    http2: Mutex<HashMap<PoolKey, h2::client::SendRequest<Bytes>>>,
}

impl UpstreamPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn idle_http1(&self) -> usize {
        self.http1.lock().await.values().map(Vec::len).sum()
    }

    pub async fn open_http2(&self) -> usize {
        self.http2.lock().await.len()
    }

    pub async fn clear(&self) {
        self.http1.lock().await.clear();
        self.http2.lock().await.clear();
    }

    async fn take_http2(&self, key: &PoolKey) -> Option<h2::client::SendRequest<Bytes>> {
        let sender = self.http2.lock().await.get(key)?.clone();
        match sender.ready().await {
            Ok(sender) => Some(sender),
            Err(e) => {
                debug!("Dropping pooled HTTP/2 connection to {}: {}", key.authority, e);
                self.http2.lock().await.remove(key);
                None
            }
        }
    }

    async fn take_http1(&self, key: &PoolKey) -> Option<http1::SendRequest<ProxyBody>> {
        let mut idle = self.http1.lock().await;
        let senders = idle.get_mut(key)?;
        while let Some(sender) = senders.pop() {
            if sender.is_ready() && !sender.is_closed() {
                return Some(sender);
            }
        }
        None
    }

    async fn put_http1(&self, key: PoolKey, sender: http1::SendRequest<ProxyBody>) {
        let mut idle = self.http1.lock().await;
        let senders = idle.entry(key).or_default();
        if senders.len() < MAX_IDLE_PER_UPSTREAM {
            senders.push(sender);
        }
    }

    async fn checkout(&self, ctx: &SharedContext, key: &PoolKey) -> Result<Upstream> {
        if let Some(sender) = self.take_http2(key).await {
            return Ok(Upstream::Http2(sender));
        }
        if let Some(sender) = self.take_http1(key).await {
            return Ok(Upstream::Http1(sender));
        }

        let upstream = connect(ctx, key).await?;
        if let Upstream::Http2(sender) = &upstream {
            self.http2.lock().await.insert(key.clone(), sender.clone());
        }
        Ok(upstream)
    }
}

impl std::fmt::Debug for UpstreamPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamPool").finish_non_exhaustive()
    }
}

async fn connect(ctx: &SharedContext, key: &PoolKey) -> Result<Upstream> {
    let mut hops = tunnel::route(&ctx.config, &key.authority)?;
    if key.scheme == "https" {
        hops.push(Hop::Tls {
            sni: key.authority.host.clone(),
            alpn: if key.offer_h2 { ALPN_H2_HTTP1 } else { ALPN_HTTP1 },
        });
    }

    let connected = tunnel::connect_chain(&hops, &ChainOptions::from_config(&ctx.config))
        .await
        .map_err(|e| match e {
            Error::Timeout(_) => e,
            other => Error::forwarding_failed(format!("connecting to {}: {}", key.authority, other)),
        })?;
    info!(
        "Connected to upstream {} ({})",
        key.authority,
        if connected.protocol == NegotiatedProtocol::H2 { "h2" } else { "http/1.1" }
    );

    if connected.protocol == NegotiatedProtocol::H2 {
        let mut builder = h2::client::Builder::new();
        configure_client(&mut builder);
        let (sender, connection) = builder
            .handshake::<_, Bytes>(connected.transport)
            .await
            .map_err(|e| Error::forwarding_failed(format!("HTTP/2 handshake with {}: {}", key.authority, e)))?;
        let label = key.authority.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Upstream HTTP/2 connection to {} ended: {}", label, e);
            }
        });
        return Ok(Upstream::Http2(sender));
    }

    let mut builder = http1::Builder::new();
    builder.preserve_header_case(true);
    let (sender, connection) = builder
        .handshake(TokioIo::new(connected.transport))
        .await
        .map_err(|e| Error::forwarding_failed(format!("HTTP/1.1 handshake with {}: {}", key.authority, e)))?;
    let label = key.authority.to_string();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("Upstream HTTP/1.1 connection to {} ended: {}", label, e);
        }
    });
    Ok(Upstream::Http1(sender))
}

fn pool_key(ctx: &SharedContext, exchange: &Exchange) -> Result<PoolKey> {
    let authority = exchange
        .authority
        .as_deref()
        .ok_or(TranslationError::MissingAuthority)?;
    let tls = exchange.scheme.eq_ignore_ascii_case("https");
    let authority = Authority::parse_with_default(authority, if tls { 443 } else { 80 })?;
    let offer_h2 = tls
        && match ctx.config.upstream_http2 {
            UpstreamHttp2::Always => true,
            UpstreamHttp2::Never => false,
            UpstreamHttp2::Fallback => exchange.is_http2(),
        };
    Ok(PoolKey {
        scheme: if tls { "https" } else { "http" }.to_string(),
        authority,
        offer_h2,
    })
}

/// Sends `exchange` upstream and returns the response head with a streaming body. The
/// connect and the wait for the response head share one `upstream_timeout`.
pub async fn forward(ctx: &SharedContext, exchange: &Exchange, body: ProxyBody) -> Result<Forwarded> {
    let key = pool_key(ctx, exchange)?;
    let limit = ctx.config.upstream_timeout();

    let exchange_result = tokio::time::timeout(limit, async {
        match ctx.upstreams.checkout(ctx, &key).await? {
            Upstream::Http1(sender) => send_http1(ctx, key.clone(), sender, exchange, body).await,
            Upstream::Http2(sender) => send_http2(sender, exchange, body).await,
        }
    })
    .await;

    match exchange_result {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!(
            "no response from {} within {:?}",
            key.authority, limit
        ))),
    }
}

/// Request head for an HTTP/1.1 upstream.
fn h1_request(exchange: &Exchange) -> Result<(H1RequestHead, HeaderMap)> {
    let head = if exchange.is_http2() {
        h2_request_to_h1(&exchange.h2_header_list())?
    } else {
        let mut headers: HeaderList = exchange
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("proxy-connection"))
            .cloned()
            .collect();
        let has_host = headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("host"));
        if let (false, Some(authority)) = (has_host, &exchange.authority) {
            headers.insert(0, ("host".to_string(), authority.clone()));
        }
        H1RequestHead {
            method: exchange.method.to_string(),
            target: exchange.target.clone(),
            headers,
        }
    };
    let map = to_header_map(&head.headers)?;
    Ok((head, map))
}

async fn send_http1(
    ctx: &SharedContext,
    key: PoolKey,
    mut sender: http1::SendRequest<ProxyBody>,
    exchange: &Exchange,
    body: ProxyBody,
) -> Result<Forwarded> {
    let (head, headers) = h1_request(exchange)?;
    let mut request = Request::builder()
        .method(exchange.method.clone())
        .uri(head.target.as_str())
        .version(Version::HTTP_11)
        .body(body)?;
    *request.headers_mut() = headers;
    if !request.headers().contains_key(HOST) {
        if let Some(authority) = &exchange.authority {
            let value = HeaderValue::from_str(authority)
                .map_err(|_| TranslationError::InvalidHeader(format!("host: {}", authority)))?;
            request.headers_mut().insert(HOST, value);
        }
    }

    sender
        .ready()
        .await
        .map_err(|e| Error::forwarding_failed(format!("upstream {} not ready: {}", key.authority, e)))?;
    let response = sender
        .send_request(request)
        .await
        .map_err(|e| Error::forwarding_failed(format!("{} {}: {}", exchange.method, exchange.url(), e)))?;

    // The connection becomes reusable once the response body has been read out.
    let pool_ctx = ctx.clone();
    tokio::spawn(async move {
        if sender.ready().await.is_ok() {
            pool_ctx.upstreams.put_http1(key, sender).await;
        }
    });

    let (mut parts, upstream_body) = response.into_parts();
    let status = parts.status.as_u16();
    let list = h1_response_to_h2(&H1ResponseHead {
        status,
        headers: header_list(&parts.headers),
    });
    parts.headers = to_header_map(&list)?;
    parts.version = inbound_version(exchange);

    Ok(Forwarded {
        response: Response::from_parts(parts, incoming(upstream_body)),
        sent_headers: head.headers,
        upstream_protocol: NegotiatedProtocol::Http11,
    })
}

/// Header list for an HTTP/2 upstream, pseudo-headers first.
fn h2_request(exchange: &Exchange) -> Result<HeaderList> {
    if exchange.is_http2() {
        let list = exchange
            .h2_header_list()
            .into_iter()
            .filter(|(name, _)| !is_hop_by_hop(name))
            .collect();
        return Ok(list);
    }
    let head = H1RequestHead {
        method: exchange.method.to_string(),
        target: exchange.url(),
        headers: exchange.headers.clone(),
    };
    Ok(h1_request_to_h2(&head, &exchange.scheme)?)
}

fn pseudo<'a>(list: &'a [(String, String)], name: &str) -> Option<&'a str> {
    list.iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

async fn send_http2(
    sender: h2::client::SendRequest<Bytes>,
    exchange: &Exchange,
    body: ProxyBody,
) -> Result<Forwarded> {
    let list = h2_request(exchange)?;
    let scheme = pseudo(&list, ":scheme").unwrap_or(&exchange.scheme);
    let authority = pseudo(&list, ":authority").ok_or(TranslationError::MissingAuthority)?;
    let path = pseudo(&list, ":path").unwrap_or("/");

    let mut request = Request::builder()
        .method(exchange.method.clone())
        .uri(format!("{}://{}{}", scheme, authority, path))
        .version(Version::HTTP_2)
        .body(())?;
    *request.headers_mut() = to_header_map(&list)?;

    let mut sender = sender
        .ready()
        .await
        .map_err(|e| Error::forwarding_failed(format!("upstream HTTP/2 session closed: {}", e)))?;
    let end_of_stream = body.is_end_stream();
    let (response, mut send) = sender
        .send_request(request, end_of_stream)
        .map_err(|e| Error::forwarding_failed(format!("{} {}: {}", exchange.method, exchange.url(), e)))?;

    if !end_of_stream {
        tokio::spawn(async move {
            if let Err(e) = send_body_h2(body, &mut send).await {
                debug!("Upstream request body aborted: {}", e);
                send.send_reset(Reason::CANCEL);
            }
        });
    }

    let response = response
        .await
        .map_err(|e| Error::forwarding_failed(format!("{} {}: {}", exchange.method, exchange.url(), e)))?;
    let (mut parts, recv) = response.into_parts();

    if !exchange.is_http2() {
        let mut list = vec![(":status".to_string(), parts.status.as_str().to_string())];
        list.extend(header_list(&parts.headers));
        parts.headers = to_header_map(&h2_response_to_h1(&list)?.headers)?;
    }
    parts.version = inbound_version(exchange);

    Ok(Forwarded {
        response: Response::from_parts(parts, H2RecvBody::new(recv).boxed()),
        sent_headers: list,
        upstream_protocol: NegotiatedProtocol::H2,
    })
}

fn inbound_version(exchange: &Exchange) -> Version {
    if exchange.is_http2() {
        Version::HTTP_2
    } else {
        Version::HTTP_11
    }
}
