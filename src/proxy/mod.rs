//! Transport and protocol core of the proxy.
//!
//! Every accepted byte stream goes through the same stack: protocol sniffing, optional
//! TLS termination, then an HTTP/1.1 or HTTP/2 session whose exchanges are mocked,
//! forwarded or turned into CONNECT tunnels. Tunnels feed their bytes back into the same
//! stack one level deeper.

pub mod body;
pub mod context;
pub mod forward;
pub mod layers;
pub mod server;
pub mod translate;
pub mod tunnel;

pub use context::{ProxyContext, SharedContext};
pub use layers::http::{serve_connection, DispatchOutcome, Exchange};
pub use server::ProxyServer;
