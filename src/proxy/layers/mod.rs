//! Protocol layer implementations

pub mod http;
pub mod http1;
pub mod http2;
pub mod tcp;
pub mod tls;

pub use http::{dispatch, Dispatched, Exchange, Reply, Session, SessionState};
pub use tls::{ClientHelloData, Sniffed};
