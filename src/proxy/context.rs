//! State shared by every connection of one proxy instance.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::certs::CertificateAuthority;
use crate::config::Config;
use crate::flow::FlowStore;
use crate::proxy::forward::UpstreamPool;
use crate::rules::RuleSource;

pub struct ProxyContext {
    pub config: Arc<Config>,
    pub ca: CertificateAuthority,
    pub rules: Arc<dyn RuleSource>,
    pub flows: FlowStore,
    pub upstreams: UpstreamPool,
    /// Cancelled on shutdown; sessions and tunnels hold child tokens.
    pub shutdown: CancellationToken,
}

pub type SharedContext = Arc<ProxyContext>;

impl ProxyContext {
    pub fn new(config: Config, ca: CertificateAuthority, rules: Arc<dyn RuleSource>) -> Self {
        let flows = FlowStore::new(config.max_flows);
        Self {
            config: Arc::new(config),
            ca,
            rules,
            flows,
            upstreams: UpstreamPool::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shared(self) -> SharedContext {
        Arc::new(self)
    }
}

#[cfg(test)]
impl ProxyContext {
    pub(crate) fn for_tests(config: Config, rules: Arc<dyn RuleSource>) -> SharedContext {
        let ca = CertificateAuthority::generate().expect("test CA");
        Self::new(config, ca, rules).shared()
    }
}

impl std::fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyContext")
            .field("config", &self.config)
            .field("flows", &self.flows.len())
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}
