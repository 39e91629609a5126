//! HTTP/1.1 sessions: one exchange at a time on a hyper server connection.

use std::sync::Arc;

use http::header::{CONNECTION, UPGRADE};
use http::{HeaderMap, HeaderValue, Method, Request, Response, Version};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::{BoxedTransport, ConnectionInfo};
use crate::proxy::body::{empty, incoming, ProxyBody};
use crate::proxy::context::SharedContext;
use crate::proxy::layers::http::{dispatch, error_response, Exchange, Reply, Session, SessionState};
use crate::proxy::tunnel;
use crate::{Error, Result};

pub async fn serve(
    ctx: &SharedContext,
    io: BoxedTransport,
    conn: ConnectionInfo,
    session: &mut Session,
) -> Result<()> {
    let cancel = ctx.shutdown.child_token();
    // Cancelled by the exchange whose response ends keep-alive.
    let last_exchange = CancellationToken::new();
    let conn = Arc::new(conn);
    let service = {
        let ctx = ctx.clone();
        let last_exchange = last_exchange.clone();
        service_fn(move |req| handle(ctx.clone(), conn.clone(), last_exchange.clone(), req))
    };

    let connection = http1::Builder::new()
        .preserve_header_case(true)
        .keep_alive(true)
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades();
    tokio::pin!(connection);

    let mut closing = false;
    let result = loop {
        tokio::select! {
            result = connection.as_mut() => break result,
            _ = last_exchange.cancelled(), if !closing => {
                closing = true;
                session.transition(SessionState::Closing);
            }
            _ = cancel.cancelled(), if !closing => {
                closing = true;
                session.transition(SessionState::Closing);
                connection.as_mut().graceful_shutdown();
            }
        }
    };
    session.transition(SessionState::Closing);

    match result {
        Ok(()) => Ok(()),
        Err(e) if is_benign(&e) => {
            debug!("HTTP/1.1 session ended: {}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn is_benign(error: &hyper::Error) -> bool {
    if error.is_incomplete_message() || error.is_canceled() || error.is_closed() || error.is_user() {
        return true;
    }
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        source = inner.source();
    }
    false
}

async fn handle(
    ctx: SharedContext,
    conn: Arc<ConnectionInfo>,
    last_exchange: CancellationToken,
    mut req: Request<Incoming>,
) -> Result<Response<ProxyBody>> {
    let on_upgrade = (req.method() == Method::CONNECT).then(|| hyper::upgrade::on(&mut req));
    let (mut parts, body) = req.into_parts();
    strip_h2c_upgrade(&mut parts.headers);
    let version = parts.version;
    let request_headers = parts.headers.clone();

    let exchange = match Exchange::from_parts(&parts, &conn) {
        Ok(exchange) => exchange,
        Err(e) => return Ok(error_response(&e)),
    };
    debug!("{} {}", exchange.method, exchange.url());

    let dispatched = dispatch(&ctx, &conn, exchange, incoming(body)).await;
    match dispatched.reply {
        Reply::Respond(response) => {
            if ends_keep_alive(version, &request_headers, response.headers()) {
                last_exchange.cancel();
            }
            Ok(response)
        }
        Reply::Tunnel(tunnel) => {
            let Some(on_upgrade) = on_upgrade else {
                return Ok(error_response(&Error::internal("tunnel without CONNECT")));
            };
            let conn = (*conn).clone();
            tokio::spawn(async move {
                match on_upgrade.await {
                    Ok(upgraded) => {
                        let io: BoxedTransport = Box::new(TokioIo::new(upgraded));
                        if let Err(e) = tunnel::run(ctx, tunnel, io, conn).await {
                            debug!("Tunnel ended with error: {}", e);
                        }
                    }
                    Err(e) => debug!("CONNECT upgrade failed: {}", e),
                }
            });
            Ok(connect_established())
        }
        // Failing the service makes hyper drop the connection without a response.
        Reply::Close | Reply::Reset => Err(Error::Cancelled),
    }
}

fn has_connection_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Whether the connection closes once this exchange's response is written.
pub fn ends_keep_alive(version: Version, request: &HeaderMap, response: &HeaderMap) -> bool {
    let client_keeps_alive = match version {
        Version::HTTP_10 => has_connection_token(request, "keep-alive"),
        _ => !has_connection_token(request, "close"),
    };
    !client_keeps_alive || has_connection_token(response, "close")
}

/// `200 Connection Established` with no body.
pub fn connect_established() -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

/// Drops an `Upgrade: h2c` offer; the exchange is served as plain HTTP/1.1.
pub fn strip_h2c_upgrade(headers: &mut HeaderMap) {
    let offers_h2c = headers
        .get_all(UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("h2c"));
    if !offers_h2c {
        return;
    }

    headers.remove(UPGRADE);
    headers.remove("http2-settings");
    let remaining: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| {
            !t.is_empty()
                && !t.eq_ignore_ascii_case("upgrade")
                && !t.eq_ignore_ascii_case("http2-settings")
        })
        .map(str::to_string)
        .collect();
    headers.remove(CONNECTION);
    if !remaining.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&remaining.join(", ")) {
            headers.insert(CONNECTION, value);
        }
    }
}
