//! Listener: accepts TCP connections and runs a session task per connection.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::connection::{BoxedTransport, ConnectionInfo};
use crate::proxy::context::SharedContext;
use crate::proxy::layers::http::serve_connection;
use crate::Result;

/// A bound proxy listener.
#[derive(Debug)]
pub struct ProxyServer {
    ctx: SharedContext,
    listener: TcpListener,
}

impl ProxyServer {
    pub async fn bind(ctx: SharedContext) -> Result<Self> {
        let addr = ctx.config.proxy_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Proxy server listening on {}", listener.local_addr()?);
        Ok(Self { ctx, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> &SharedContext {
        &self.ctx
    }

    /// Accepts until the context's shutdown token is cancelled, then waits for the
    /// running sessions to wind down.
    pub async fn run(self) -> Result<()> {
        let shutdown = self.ctx.shutdown.clone();
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("New connection from {}", peer);
                        let ctx = self.ctx.clone();
                        sessions.spawn(async move {
                            if let Err(e) = Self::handle_connection(ctx, stream, peer).await {
                                debug!("Connection from {} ended with error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = shutdown.cancelled() => break,
            }
        }

        info!("Proxy server stopping, {} sessions open", sessions.len());
        while sessions.join_next().await.is_some() {}
        self.ctx.upstreams.clear().await;
        Ok(())
    }

    async fn handle_connection(ctx: SharedContext, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nodelay(true)?;
        serve_connection(ctx, Box::new(stream), ConnectionInfo::new(Some(peer))).await
    }

    /// Runs a session on a byte stream accepted elsewhere.
    pub async fn serve_transport(&self, io: BoxedTransport, peer: Option<SocketAddr>) -> Result<()> {
        serve_connection(self.ctx.clone(), io, ConnectionInfo::new(peer)).await
    }
}
