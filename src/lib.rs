pub mod certs;
pub mod config;
pub mod connection;
pub mod error;
pub mod filter;
pub mod flow;
pub mod proxy;
pub mod rules;
pub mod server;

pub use error::{Error, Result, TranslationError};
pub use flow::{FlowStore, HTTPFlow};
pub use proxy::{DispatchOutcome, Exchange, ProxyContext, ProxyServer};
pub use rules::{MockResponse, RuleAction, RuleSet, RuleSource};
pub use server::MockProxyServer;
