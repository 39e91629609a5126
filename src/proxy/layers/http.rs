//! Protocol sessions.
//!
//! [`serve_connection`] is the single entry point for every byte stream, whether it came
//! from the listener or from inside a CONNECT tunnel: it sniffs the first bytes,
//! terminates TLS when needed, and hands the connection to the HTTP/1.1 or HTTP/2 session.
//! Each request those sessions parse becomes an [`Exchange`] and goes through
//! [`dispatch`].

use std::fmt;
use std::time::SystemTime;

use futures_util::future::BoxFuture;
use http::header::{CONTENT_TYPE, HOST};
use http::{HeaderValue, Method, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::connection::{BoxedTransport, ConnectionInfo, NegotiatedProtocol, Rewind, TransportKind};
use crate::error::TranslationError;
use crate::filter::Matchable;
use crate::flow::{HTTPFlow, HTTPResponse};
use crate::proxy::body::{full, ProxyBody};
use crate::proxy::context::SharedContext;
use crate::proxy::forward;
use crate::proxy::layers::tls::{self, ClientHelloData, Sniffed};
use crate::proxy::layers::{http1, http2};
use crate::proxy::translate::{header_list, HeaderList};
use crate::proxy::tunnel::{self, Tunnel};
use crate::rules::{MockResponse, RuleAction};
use crate::{Error, Result};

/// How an exchange was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Mocked,
    Forwarded,
    TunnelEstablished,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Active,
    Closing,
    Closed,
}

/// Lifecycle bookkeeping for one connection.
#[derive(Debug)]
pub struct Session {
    conn_id: String,
    state: SessionState,
}

impl Session {
    pub fn new(conn_id: &str) -> Self {
        Self {
            conn_id: conn_id.to_string(),
            state: SessionState::Negotiating,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!("session {}: {:?} -> {:?}", self.conn_id, self.state, next);
            self.state = next;
        }
    }
}

/// One request/response unit, independent of the wire version it arrived on.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub id: String,
    /// Inbound protocol.
    pub protocol: NegotiatedProtocol,
    pub method: Method,
    /// Origin-form path and query, or `host:port` for CONNECT.
    pub target: String,
    /// From the URI, else Host, else the enclosing CONNECT.
    pub authority: Option<String>,
    pub scheme: String,
    /// Regular headers in arrival order, without pseudo-headers.
    pub headers: HeaderList,
    pub tls: bool,
    pub depth: usize,
}

impl Exchange {
    pub fn from_parts(parts: &http::request::Parts, conn: &ConnectionInfo) -> Result<Self> {
        let is_connect = parts.method == Method::CONNECT;
        let host_header = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let authority = parts
            .uri
            .authority()
            .map(|a| a.to_string())
            .or(host_header)
            .or_else(|| conn.tunnel_authority.clone());

        let target = if is_connect {
            authority.clone().ok_or(TranslationError::MissingAuthority)?
        } else {
            parts
                .uri
                .path_and_query()
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| "/".to_string())
        };

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            protocol: conn.protocol,
            method: parts.method.clone(),
            target,
            authority,
            scheme: parts
                .uri
                .scheme_str()
                .unwrap_or_else(|| conn.scheme())
                .to_string(),
            headers: header_list(&parts.headers),
            tls: conn.is_tls(),
            depth: conn.depth,
        })
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    pub fn is_http2(&self) -> bool {
        self.protocol.is_http2()
    }

    pub fn http_version(&self) -> &'static str {
        if self.is_http2() {
            "HTTP/2.0"
        } else {
            "HTTP/1.1"
        }
    }

    pub fn url(&self) -> String {
        match &self.authority {
            Some(authority) if !self.is_connect() => {
                format!("{}://{}{}", self.scheme, authority, self.target)
            }
            _ => self.target.clone(),
        }
    }

    /// The request as an HTTP/2 header list, pseudo-headers first.
    pub fn h2_header_list(&self) -> HeaderList {
        let mut list = vec![(":method".to_string(), self.method.to_string())];
        if !self.is_connect() {
            list.push((":scheme".to_string(), self.scheme.clone()));
        }
        if let Some(authority) = &self.authority {
            list.push((":authority".to_string(), authority.clone()));
        }
        if !self.is_connect() {
            list.push((":path".to_string(), self.target.clone()));
        }
        list.extend(self.headers.iter().cloned());
        list
    }
}

impl Matchable for Exchange {
    fn method(&self) -> &str {
        self.method.as_str()
    }

    fn host(&self) -> &str {
        self.authority.as_deref().map(authority_host).unwrap_or("")
    }

    fn url(&self) -> String {
        Exchange::url(self)
    }

    fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    fn is_http2(&self) -> bool {
        Exchange::is_http2(self)
    }

    fn is_tls(&self) -> bool {
        self.tls
    }
}

/// Host part of an authority, without port or IPv6 brackets.
pub fn authority_host(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split_once(']').map(|(host, _)| host).unwrap_or(rest);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    }
}

/// What the session has to put on the wire for a dispatched exchange.
pub enum Reply {
    Respond(Response<ProxyBody>),
    /// Answer with the tunnel success encoding, then run the tunnel on the stream.
    Tunnel(Tunnel),
    Close,
    Reset,
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Respond(response) => write!(f, "Respond({})", response.status()),
            Reply::Tunnel(tunnel) => write!(f, "Tunnel({})", tunnel.authority),
            Reply::Close => f.write_str("Close"),
            Reply::Reset => f.write_str("Reset"),
        }
    }
}

#[derive(Debug)]
pub struct Dispatched {
    pub outcome: DispatchOutcome,
    pub reply: Reply,
    /// The exchange itself was malformed. HTTP/2 sessions reset the stream instead of
    /// sending the error response.
    pub protocol_error: bool,
}

impl Dispatched {
    fn new(outcome: DispatchOutcome, reply: Reply) -> Self {
        Self {
            outcome,
            reply,
            protocol_error: false,
        }
    }
}

/// Plain-text response carrying the error status for `error`.
pub fn error_response(error: &Error) -> Response<ProxyBody> {
    let mut response = Response::new(full(error.to_string()));
    *response.status_mut() = error.status_code();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

fn fail(flow: &mut HTTPFlow, exchange: &Exchange, error: Error) -> Dispatched {
    if error.is_protocol_error() {
        debug!("{} {}: {}", exchange.method, exchange.url(), error);
    } else {
        warn!("{} {}: {}", exchange.method, exchange.url(), error);
    }
    let response = error_response(&error);
    flow.response = Some(HTTPResponse::new(
        response.status().as_u16(),
        exchange.http_version(),
        header_list(response.headers()),
    ));
    flow.set_error(error.to_string());
    Dispatched {
        outcome: DispatchOutcome::Error,
        reply: Reply::Respond(response),
        protocol_error: error.is_protocol_error(),
    }
}

fn mock(flow: &mut HTTPFlow, exchange: &Exchange, mock: MockResponse) -> Dispatched {
    let content = mock.body_bytes();
    match mock.into_response() {
        Ok(response) => {
            let mut recorded = HTTPResponse::new(
                response.status().as_u16(),
                exchange.http_version(),
                header_list(response.headers()),
            );
            recorded.set_content(content.to_vec());
            flow.response = Some(recorded);
            Dispatched::new(DispatchOutcome::Mocked, Reply::Respond(response))
        }
        Err(e) => fail(flow, exchange, Error::internal(format!("invalid mock response: {}", e))),
    }
}

/// Routes one exchange: CONNECT to the tunnel chain, everything else through the rule
/// source to a mock response or the forwarder. Never fails; errors become error replies.
pub async fn dispatch(
    ctx: &SharedContext,
    conn: &ConnectionInfo,
    exchange: Exchange,
    body: ProxyBody,
) -> Dispatched {
    let mut flow = HTTPFlow::new(conn, &exchange);

    let dispatched = if exchange.is_connect() {
        match tunnel::establish(ctx, conn, &exchange).await {
            Ok(tunnel) => {
                flow.response = Some(HTTPResponse::new(200, exchange.http_version(), Vec::new()));
                Dispatched::new(DispatchOutcome::TunnelEstablished, Reply::Tunnel(tunnel))
            }
            Err(e) => fail(&mut flow, &exchange, e),
        }
    } else {
        match ctx.rules.match_exchange(&exchange).await {
            None => {
                debug!("No rule matched {} {}", exchange.method, exchange.url());
                let unmatched = MockResponse::new(503)
                    .with_header("content-type", "text/plain")
                    .with_body("No rule matched");
                mock(&mut flow, &exchange, unmatched)
            }
            Some(RuleAction::Respond(response)) => mock(&mut flow, &exchange, response),
            Some(RuleAction::PassThrough) => match forward::forward(ctx, &exchange, body).await {
                Ok(forwarded) => {
                    flow.upstream_request_headers = Some(forwarded.sent_headers);
                    flow.upstream_http_version = Some(forwarded.upstream_protocol.to_string());
                    flow.response = Some(HTTPResponse::new(
                        forwarded.response.status().as_u16(),
                        exchange.http_version(),
                        header_list(forwarded.response.headers()),
                    ));
                    Dispatched::new(DispatchOutcome::Forwarded, Reply::Respond(forwarded.response))
                }
                Err(e) => fail(&mut flow, &exchange, e),
            },
            Some(RuleAction::Close) => Dispatched::new(DispatchOutcome::Mocked, Reply::Close),
            Some(RuleAction::Reset) => Dispatched::new(DispatchOutcome::Mocked, Reply::Reset),
        }
    };

    flow.outcome = dispatched.outcome;
    ctx.flows.record(flow);
    dispatched
}

fn certificate_hostname(hello: &ClientHelloData, conn: &ConnectionInfo, default: &str) -> String {
    hello
        .sni
        .clone()
        .or_else(|| {
            conn.tunnel_authority
                .as_deref()
                .map(|a| authority_host(a).to_string())
        })
        .unwrap_or_else(|| default.to_string())
}

/// Runs a full session over `io`: sniff, optional TLS termination, then HTTP/1.1 or
/// HTTP/2 until the peer goes away. Boxed because tunnels call back into it.
pub fn serve_connection(
    ctx: SharedContext,
    io: BoxedTransport,
    conn: ConnectionInfo,
) -> BoxFuture<'static, Result<()>> {
    let span = info_span!(
        "conn",
        id = %conn.id.get(..8).unwrap_or(&conn.id),
        depth = conn.depth,
    );
    Box::pin(serve(ctx, io, conn).instrument(span))
}

async fn serve(ctx: SharedContext, mut io: BoxedTransport, mut conn: ConnectionInfo) -> Result<()> {
    let mut session = Session::new(&conn.id);

    let (sniffed, prefix) = tokio::time::timeout(ctx.config.handshake_timeout(), tls::sniff(&mut io))
        .await
        .map_err(|_| Error::timeout("waiting for the first bytes of a connection"))??;
    let io: BoxedTransport = Box::new(Rewind::new(io, prefix));

    let (io, protocol): (BoxedTransport, NegotiatedProtocol) = match sniffed {
        Sniffed::Closed => {
            session.transition(SessionState::Closed);
            return Ok(());
        }
        Sniffed::Tls(hello) => {
            let hostname = certificate_hostname(&hello, &conn, &ctx.config.default_hostname);
            let record = ctx.ca.cert_for_host(&hostname).await?;
            let (stream, protocol) = tls::accept_tls(
                io,
                &record,
                ctx.config.http2_enabled,
                ctx.config.handshake_timeout(),
            )
            .await?;
            conn.transport = TransportKind::Tls;
            conn.sni = hello.sni;
            conn.timestamp_tls_setup = Some(SystemTime::now());
            (Box::new(stream), protocol)
        }
        Sniffed::H2c if ctx.config.http2_enabled => (io, NegotiatedProtocol::H2c),
        Sniffed::H2c | Sniffed::Http1 => (io, NegotiatedProtocol::Http11),
    };

    conn.protocol = protocol;
    session.transition(SessionState::Active);
    info!(
        "{} session from {} ({})",
        protocol,
        conn.peername
            .map(|p| p.to_string())
            .unwrap_or_else(|| "tunnel".to_string()),
        conn.tunnel_authority.as_deref().unwrap_or("direct"),
    );

    let result = if protocol.is_http2() {
        http2::serve(&ctx, io, conn, &mut session).await
    } else {
        http1::serve(&ctx, io, conn, &mut session).await
    };
    session.transition(SessionState::Closed);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::proxy::body::{collect, empty};
    use crate::proxy::context::ProxyContext;
    use crate::rules::RuleSet;
    use std::sync::Arc;

    fn parts(request: http::Request<()>) -> http::request::Parts {
        request.into_parts().0
    }

    #[test]
    fn test_exchange_from_origin_form() {
        let conn = ConnectionInfo::new(None);
        let request = http::Request::get("/a?b=1")
            .header("Host", "example.com:8080")
            .body(())
            .unwrap();
        let exchange = Exchange::from_parts(&parts(request), &conn).unwrap();
        assert_eq!(exchange.authority.as_deref(), Some("example.com:8080"));
        assert_eq!(exchange.target, "/a?b=1");
        assert_eq!(exchange.scheme, "http");
        assert_eq!(exchange.url(), "http://example.com:8080/a?b=1");
        assert_eq!(Matchable::host(&exchange), "example.com");
    }

    #[test]
    fn test_exchange_inherits_tunnel_authority() {
        let conn = ConnectionInfo::new(None).nested("inner.example:443");
        let request = http::Request::get("/").body(()).unwrap();
        let exchange = Exchange::from_parts(&parts(request), &conn).unwrap();
        assert_eq!(exchange.authority.as_deref(), Some("inner.example:443"));
        assert_eq!(exchange.depth, 1);
    }

    #[test]
    fn test_connect_exchange() {
        let conn = ConnectionInfo::new(None);
        let request = http::Request::connect("example.com:443").body(()).unwrap();
        let exchange = Exchange::from_parts(&parts(request), &conn).unwrap();
        assert!(exchange.is_connect());
        assert_eq!(exchange.target, "example.com:443");
        assert_eq!(
            exchange.h2_header_list(),
            vec![
                (":method".to_string(), "CONNECT".to_string()),
                (":authority".to_string(), "example.com:443".to_string()),
            ]
        );
    }

    #[test]
    fn test_authority_host() {
        assert_eq!(authority_host("example.com:443"), "example.com");
        assert_eq!(authority_host("example.com"), "example.com");
        assert_eq!(authority_host("[::1]:8080"), "::1");
    }

    #[test]
    fn test_session_transitions() {
        let mut session = Session::new("abc");
        assert_eq!(session.state(), SessionState::Negotiating);
        session.transition(SessionState::Active);
        session.transition(SessionState::Closing);
        assert_eq!(session.state(), SessionState::Closing);
    }

    fn exchange_for(conn: &ConnectionInfo, request: http::Request<()>) -> Exchange {
        Exchange::from_parts(&parts(request), conn).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_without_rules_is_503() {
        let ctx = ProxyContext::for_tests(Config::default(), Arc::new(RuleSet::new()));
        let conn = ConnectionInfo::new(None);
        let request = http::Request::get("/").header("host", "a.test").body(()).unwrap();

        let dispatched = dispatch(&ctx, &conn, exchange_for(&conn, request), empty()).await;
        assert_eq!(dispatched.outcome, DispatchOutcome::Mocked);
        match dispatched.reply {
            Reply::Respond(response) => {
                assert_eq!(response.status(), 503);
                let body = collect(response.into_body()).await.unwrap();
                assert_eq!(&body[..], b"No rule matched");
            }
            other => panic!("unexpected reply {:?}", other),
        }
        let flows = ctx.flows.list();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].outcome, DispatchOutcome::Mocked);
    }

    #[tokio::test]
    async fn test_dispatch_connect_errors() {
        let config = Config {
            max_tunnel_depth: 1,
            ..Config::default()
        };
        let ctx = ProxyContext::for_tests(config, Arc::new(RuleSet::new()));

        let conn = ConnectionInfo::new(None).nested("outer.example:443");
        let request = http::Request::connect("inner.example:443").body(()).unwrap();
        let dispatched = dispatch(&ctx, &conn, exchange_for(&conn, request), empty()).await;
        assert_eq!(dispatched.outcome, DispatchOutcome::Error);
        match dispatched.reply {
            Reply::Respond(response) => assert_eq!(response.status(), 508),
            other => panic!("unexpected reply {:?}", other),
        }

        let root = ConnectionInfo::new(None);
        let request = http::Request::connect("example.com:0").body(()).unwrap();
        let dispatched = dispatch(&ctx, &root, exchange_for(&root, request), empty()).await;
        assert!(dispatched.protocol_error);
        match dispatched.reply {
            Reply::Respond(response) => assert_eq!(response.status(), 400),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_connect_intercepts() {
        let ctx = ProxyContext::for_tests(Config::default(), Arc::new(RuleSet::new()));
        let conn = ConnectionInfo::new(None);
        let request = http::Request::connect("example.com:443").body(()).unwrap();
        let dispatched = dispatch(&ctx, &conn, exchange_for(&conn, request), empty()).await;
        assert_eq!(dispatched.outcome, DispatchOutcome::TunnelEstablished);
        match dispatched.reply {
            Reply::Tunnel(tunnel) => assert!(!tunnel.is_raw()),
            other => panic!("unexpected reply {:?}", other),
        }
    }
}
