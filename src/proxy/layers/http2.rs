//! HTTP/2 sessions on the h2 crate.
//!
//! The h2 `Connection` owns the transport and is only polled from the accept loop, so
//! frames from concurrent streams are written by a single writer. Every stream runs in
//! its own task; a failing stream is reset on its own and never tears down the session.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use h2::server::SendResponse;
use h2::{Reason, RecvStream};
use http::{Request, Response, StatusCode};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{BoxedTransport, ConnectionInfo};
use crate::proxy::body::{empty, send_body_h2, H2RecvBody, ProxyBody};
use crate::proxy::context::SharedContext;
use crate::proxy::layers::http::{dispatch, Exchange, Reply, Session, SessionState};
use crate::proxy::translate::{h1_response_to_h2, header_list, to_header_map, H1ResponseHead};
use crate::proxy::tunnel::{self, H2Io, Tunnel};
use crate::{Error, Result};

const INITIAL_WINDOW_SIZE: u32 = 1024 * 1024;
const INITIAL_CONNECTION_WINDOW_SIZE: u32 = 4 * 1024 * 1024;
const MAX_HEADER_LIST_SIZE: u32 = 64 * 1024;

pub fn configure_server(builder: &mut h2::server::Builder, max_concurrent_streams: u32) {
    builder
        .max_concurrent_streams(max_concurrent_streams)
        .max_header_list_size(MAX_HEADER_LIST_SIZE)
        .initial_window_size(INITIAL_WINDOW_SIZE)
        .initial_connection_window_size(INITIAL_CONNECTION_WINDOW_SIZE);
}

pub fn configure_client(builder: &mut h2::client::Builder) {
    builder
        .max_header_list_size(MAX_HEADER_LIST_SIZE)
        .initial_window_size(INITIAL_WINDOW_SIZE)
        .initial_connection_window_size(INITIAL_CONNECTION_WINDOW_SIZE);
}

/// The peer went away or said goodbye cleanly.
pub fn is_transport_close(error: &h2::Error) -> bool {
    if let Some(io_error) = error.get_io() {
        matches!(
            io_error.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
        )
    } else {
        error.is_go_away() && error.is_remote() && error.reason() == Some(Reason::NO_ERROR)
    }
}

pub async fn serve(
    ctx: &SharedContext,
    io: BoxedTransport,
    conn: ConnectionInfo,
    session: &mut Session,
) -> Result<()> {
    let mut builder = h2::server::Builder::new();
    configure_server(&mut builder, ctx.config.max_concurrent_streams);
    let mut connection =
        tokio::time::timeout(ctx.config.handshake_timeout(), builder.handshake::<_, Bytes>(io))
            .await
            .map_err(|_| Error::timeout("HTTP/2 connection preface"))??;

    // Cancelled on shutdown or when a rule asks to close the connection.
    let cancel = ctx.shutdown.child_token();
    let conn = Arc::new(conn);
    let mut streams = JoinSet::new();
    let mut closing = false;

    let result = loop {
        tokio::select! {
            next = connection.accept() => match next {
                Some(Ok((request, respond))) => {
                    streams.spawn(handle_stream(
                        ctx.clone(),
                        conn.clone(),
                        cancel.clone(),
                        request,
                        respond,
                    ));
                }
                Some(Err(e)) if is_transport_close(&e) => break Ok(()),
                Some(Err(e)) => break Err(Error::from(e)),
                None => break Ok(()),
            },
            Some(joined) = streams.join_next(), if !streams.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!("HTTP/2 stream task panicked: {}", e);
                    }
                }
            }
            _ = cancel.cancelled(), if !closing => {
                closing = true;
                session.transition(SessionState::Closing);
                connection.graceful_shutdown();
            }
        }
    };

    session.transition(SessionState::Closing);
    streams.abort_all();
    while streams.join_next().await.is_some() {}
    result
}

async fn handle_stream(
    ctx: SharedContext,
    conn: Arc<ConnectionInfo>,
    cancel: CancellationToken,
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
) {
    let stream_id = respond.stream_id();
    let (parts, recv) = request.into_parts();
    let exchange = match Exchange::from_parts(&parts, &conn) {
        Ok(exchange) => exchange,
        Err(e) => {
            debug!("stream {:?}: {}", stream_id, e);
            respond.send_reset(Reason::PROTOCOL_ERROR);
            return;
        }
    };
    debug!("stream {:?}: {} {}", stream_id, exchange.method, exchange.url());

    // A CONNECT stream keeps its receive half for the tunnel.
    let (body, tunnel_recv) = if exchange.is_connect() {
        (empty(), Some(recv))
    } else {
        (H2RecvBody::new(recv).boxed(), None)
    };

    // A reset from the client drops the dispatch future, and with it any upstream
    // connection or tunnel it was opening.
    let dispatched = tokio::select! {
        dispatched = dispatch(&ctx, &conn, exchange, body) => dispatched,
        reset = std::future::poll_fn(|cx| respond.poll_reset(cx)) => {
            match reset {
                Ok(reason) => debug!("stream {:?} reset by client: {:?}", stream_id, reason),
                Err(e) => debug!("stream {:?} lost: {}", stream_id, e),
            }
            return;
        }
    };
    if dispatched.protocol_error {
        respond.send_reset(Reason::PROTOCOL_ERROR);
        return;
    }

    let result = match dispatched.reply {
        Reply::Respond(response) => send_response(&mut respond, response).await,
        Reply::Tunnel(tunnel) => match tunnel_recv {
            Some(recv) => open_tunnel(ctx, &conn, &mut respond, tunnel, recv).await,
            None => Err(Error::internal("tunnel reply for a non-CONNECT stream")),
        },
        Reply::Reset => {
            respond.send_reset(Reason::CANCEL);
            Ok(())
        }
        Reply::Close => {
            respond.send_reset(Reason::CANCEL);
            cancel.cancel();
            Ok(())
        }
    };

    if let Err(e) = result {
        debug!("stream {:?} failed: {}", stream_id, e);
    }
}

/// Re-encodes response headers for HTTP/2: lower-case names, no connection-specific
/// fields.
fn h2_response_head(response: Response<ProxyBody>) -> Result<(Response<()>, ProxyBody)> {
    let (mut parts, body) = response.into_parts();
    let head = H1ResponseHead {
        status: parts.status.as_u16(),
        headers: header_list(&parts.headers),
    };
    parts.headers = to_header_map(&h1_response_to_h2(&head))?;
    Ok((Response::from_parts(parts, ()), body))
}

async fn send_response(
    respond: &mut SendResponse<Bytes>,
    response: Response<ProxyBody>,
) -> Result<()> {
    let (head, body) = match h2_response_head(response) {
        Ok(converted) => converted,
        Err(e) => {
            respond.send_reset(Reason::INTERNAL_ERROR);
            return Err(e);
        }
    };

    let end_of_stream = hyper::body::Body::is_end_stream(&body);
    let mut send = respond.send_response(head, end_of_stream)?;
    if !end_of_stream {
        if let Err(e) = send_body_h2(body, &mut send).await {
            send.send_reset(Reason::INTERNAL_ERROR);
            return Err(e);
        }
    }
    Ok(())
}

/// `:status 200` without END_STREAM, then the stream itself becomes the tunnel.
async fn open_tunnel(
    ctx: SharedContext,
    conn: &ConnectionInfo,
    respond: &mut SendResponse<Bytes>,
    tunnel: Tunnel,
    recv: RecvStream,
) -> Result<()> {
    let response = Response::builder().status(StatusCode::OK).body(())?;
    let send = respond.send_response(response, false)?;
    let io: BoxedTransport = Box::new(H2Io::new(send, recv));
    tunnel::run(ctx, tunnel, io, conn.clone()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::proxy::context::ProxyContext;
    use crate::proxy::layers::http::serve_connection;
    use crate::proxy::tunnel::H2Io;
    use crate::rules::{MockResponse, RuleAction, RuleSet};
    use http::Method;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn h2c_client(ctx: SharedContext) -> h2::client::SendRequest<Bytes> {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        tokio::spawn(serve_connection(ctx, Box::new(server_io), ConnectionInfo::new(None)));
        let (client, connection) = h2::client::handshake(client_io).await.unwrap();
        tokio::spawn(connection);
        client.ready().await.unwrap()
    }

    #[tokio::test]
    async fn test_reset_stream_leaves_siblings_intact() {
        let rules = RuleSet::new();
        rules.push("~u /reset", RuleAction::Reset).unwrap();
        rules
            .push(
                "~u /ok",
                RuleAction::Respond(
                    MockResponse::new(200)
                        .with_header("Connection", "close")
                        .with_header("X-Mock", "yes")
                        .with_body("fine"),
                ),
            )
            .unwrap();
        let ctx = ProxyContext::for_tests(Config::default(), Arc::new(rules));
        let mut client = h2c_client(ctx).await;

        let (reset, _) = client
            .send_request(Request::get("http://mock.test/reset").body(()).unwrap(), true)
            .unwrap();
        let mut client = client.ready().await.unwrap();
        let (ok, _) = client
            .send_request(Request::get("http://mock.test/ok").body(()).unwrap(), true)
            .unwrap();

        let err = reset.await.unwrap_err();
        assert_eq!(err.reason(), Some(Reason::CANCEL));

        let response = ok.await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.headers().get("connection").is_none());
        assert_eq!(response.headers()["x-mock"], "yes");
        let mut body = response.into_body();
        let chunk = body.data().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"fine");

        // The session still takes new streams.
        let mut client = client.ready().await.unwrap();
        let (again, _) = client
            .send_request(Request::get("http://mock.test/ok").body(()).unwrap(), true)
            .unwrap();
        assert_eq!(again.await.unwrap().status(), 200);
    }

    #[tokio::test]
    async fn test_unmatched_stream_gets_503() {
        let ctx = ProxyContext::for_tests(Config::default(), Arc::new(RuleSet::new()));
        let mut client = h2c_client(ctx.clone()).await;
        let (response, _) = client
            .send_request(Request::get("http://nothing.test/").body(()).unwrap(), true)
            .unwrap();
        assert_eq!(response.await.unwrap().status(), 503);

        let flows = ctx.flows.list();
        assert_eq!(flows[0].request.http_version, "HTTP/2.0");
        assert_eq!(flows[0].client_conn.alpn, "h2c");
    }

    #[tokio::test]
    async fn test_client_reset_releases_upstream_connection() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let (requested_tx, requested_rx) = tokio::sync::oneshot::channel();
        let (released_tx, released_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            let mut head = Vec::new();
            let mut chunk = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0);
                head.extend_from_slice(&chunk[..n]);
            }
            let _ = requested_tx.send(());
            // Never answers. The read returns once the proxy drops the connection.
            let released = socket.read(&mut chunk).await.map(|n| n == 0).unwrap_or(true);
            let _ = released_tx.send(released);
        });

        let rules = RuleSet::new();
        rules.push("~u /slow", RuleAction::PassThrough).unwrap();
        let config = Config {
            upstream_timeout_ms: 20_000,
            ..Config::default()
        };
        let ctx = ProxyContext::for_tests(config, Arc::new(rules));
        let mut client = h2c_client(ctx).await;

        let request = Request::get(format!("http://{}/slow", upstream_addr))
            .body(())
            .unwrap();
        let (_response, mut stream) = client.send_request(request, true).unwrap();
        requested_rx.await.unwrap();
        stream.send_reset(Reason::CANCEL);

        let released = tokio::time::timeout(Duration::from_secs(5), released_rx)
            .await
            .expect("upstream connection still open after the stream was reset")
            .unwrap();
        assert!(released);
    }

    async fn open_connect(
        client: &mut h2::client::SendRequest<Bytes>,
        authority: &str,
    ) -> (Response<RecvStream>, h2::SendStream<Bytes>) {
        let request = Request::builder()
            .method(Method::CONNECT)
            .uri(authority)
            .body(())
            .unwrap();
        let (response, send) = client.send_request(request, false).unwrap();
        (response.await.unwrap(), send)
    }

    #[tokio::test]
    async fn test_connect_stream_carries_nested_h2c_session() {
        let rules = RuleSet::new();
        rules
            .push(
                "~d inner.test & ~http2",
                RuleAction::Respond(MockResponse::new(200).with_body("nested")),
            )
            .unwrap();
        let ctx = ProxyContext::for_tests(Config::default(), Arc::new(rules));
        let mut client = h2c_client(ctx.clone()).await;

        let (response, send) = open_connect(&mut client, "inner.test:80").await;
        assert_eq!(response.status(), 200);
        assert!(!response.body().is_end_stream());

        let tunnel = H2Io::new(send, response.into_body());
        let (inner, connection) = h2::client::handshake(tunnel).await.unwrap();
        tokio::spawn(connection);
        let mut inner = inner.ready().await.unwrap();
        let (nested, _) = inner
            .send_request(Request::get("http://inner.test/x").body(()).unwrap(), true)
            .unwrap();
        let nested = nested.await.unwrap();
        assert_eq!(nested.status(), 200);
        let mut body = nested.into_body();
        let chunk = body.data().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"nested");

        let flows = ctx.flows.list();
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].outcome, crate::DispatchOutcome::TunnelEstablished);
        assert_eq!(flows[0].request.http_version, "HTTP/2.0");
        assert_eq!(flows[1].client_conn.depth, 1);
        assert_eq!(
            flows[1].client_conn.tunnel_authority.as_deref(),
            Some("inner.test:80")
        );
    }

    #[tokio::test]
    async fn test_failed_connect_answers_502_on_its_stream_only() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let config = Config {
            tls_passthrough: vec!["127.0.0.1".to_string()],
            ..Config::default()
        };
        let ctx = ProxyContext::for_tests(config, Arc::new(RuleSet::new()));
        let mut client = h2c_client(ctx).await;

        let (response, _send) = open_connect(&mut client, &format!("127.0.0.1:{}", port)).await;
        assert_eq!(response.status(), 502);

        let mut client = client.ready().await.unwrap();
        let (sibling, _) = client
            .send_request(Request::get("http://other.test/").body(()).unwrap(), true)
            .unwrap();
        assert_eq!(sibling.await.unwrap().status(), 503);
    }

    fn frame(kind: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let len = payload.len() as u32;
        let mut out = vec![(len >> 16) as u8, (len >> 8) as u8, len as u8, kind, flags];
        out.extend_from_slice(&stream_id.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    async fn read_frame(io: &mut tokio::io::DuplexStream) -> (u8, u8, u32, Vec<u8>) {
        let mut head = [0u8; 9];
        io.read_exact(&mut head).await.unwrap();
        let len = u32::from_be_bytes([0, head[0], head[1], head[2]]) as usize;
        let stream_id = u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & 0x7fff_ffff;
        let mut payload = vec![0u8; len];
        io.read_exact(&mut payload).await.unwrap();
        (head[3], head[4], stream_id, payload)
    }

    #[tokio::test]
    async fn test_streams_beyond_limit_are_refused() {
        const SETTINGS: u8 = 0x4;
        const HEADERS: u8 = 0x1;
        const RST_STREAM: u8 = 0x3;
        const END_STREAM: u8 = 0x1;
        const END_HEADERS: u8 = 0x4;

        let config = Config {
            max_concurrent_streams: 1,
            ..Config::default()
        };
        let ctx = ProxyContext::for_tests(config, Arc::new(RuleSet::new()));
        let (mut client, server) = tokio::io::duplex(256 * 1024);
        tokio::spawn(serve_connection(ctx, Box::new(server), ConnectionInfo::new(None)));

        let mut hello = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n".to_vec();
        hello.extend(frame(SETTINGS, 0, 0, &[]));
        client.write_all(&hello).await.unwrap();
        loop {
            let (kind, flags, _, _) = read_frame(&mut client).await;
            if kind == SETTINGS && flags == 0 {
                break;
            }
        }

        // GET http://mock.test/ : indexed :method, :scheme, :path and a literal :authority.
        let mut block = vec![0x82, 0x86, 0x84, 0x01, 0x09];
        block.extend_from_slice(b"mock.test");
        let mut burst = frame(SETTINGS, 0x1, 0, &[]);
        // Stream 1 keeps its request body open so it still counts as active.
        burst.extend(frame(HEADERS, END_HEADERS, 1, &block));
        burst.extend(frame(HEADERS, END_HEADERS | END_STREAM, 3, &block));
        client.write_all(&burst).await.unwrap();

        let refused = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let (kind, _, stream_id, payload) = read_frame(&mut client).await;
                if kind == RST_STREAM {
                    break (stream_id, u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]));
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(refused, (3, u32::from(Reason::REFUSED_STREAM)));
    }
}
