use std::path::Path;
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};

use crate::certs::CertificateAuthority;
use crate::config::Config;
use crate::proxy::{ProxyContext, ProxyServer, SharedContext};
use crate::rules::{RuleSet, RuleSource};
use crate::Result;

const CA_CERT_FILE: &str = "mockproxy-ca-cert.pem";
const CA_KEY_FILE: &str = "mockproxy-ca-key.pem";

/// The proxy with its CA, rules and flow store wired up.
pub struct MockProxyServer {
    ctx: SharedContext,
}

impl MockProxyServer {
    /// Loads the CA and the rule file named by `config`.
    pub async fn new(config: Config) -> Result<Self> {
        let rules: Arc<dyn RuleSource> = match &config.rules_path {
            Some(path) => {
                let rules = RuleSet::load(config.expand_path(path))?;
                info!("Loaded {} rules from {}", rules.len(), path);
                Arc::new(rules)
            }
            None => Arc::new(RuleSet::new()),
        };
        Self::with_rules(config, rules).await
    }

    pub async fn with_rules(config: Config, rules: Arc<dyn RuleSource>) -> Result<Self> {
        let ca = load_ca(&config)?;
        Ok(Self {
            ctx: ProxyContext::new(config, ca, rules).shared(),
        })
    }

    pub fn context(&self) -> &SharedContext {
        &self.ctx
    }

    pub async fn bind(&self) -> Result<ProxyServer> {
        ProxyServer::bind(self.ctx.clone()).await
    }

    pub fn shutdown(&self) {
        self.ctx.shutdown.cancel();
    }

    /// Serves until Ctrl-C or until [`MockProxyServer::shutdown`] is called.
    pub async fn run(self) -> Result<()> {
        let proxy = self.bind().await?;
        info!("Proxy listening on: {}", proxy.local_addr()?);

        let shutdown = self.ctx.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!("Failed to listen for Ctrl+C: {}", e);
                        return;
                    }
                    info!("Received shutdown signal");
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        });

        proxy.run().await?;
        info!("Shut down gracefully");
        Ok(())
    }
}

/// Explicit CA paths win; otherwise the CA lives in `confdir`, or in memory when no
/// `confdir` is set.
fn load_ca(config: &Config) -> Result<CertificateAuthority> {
    if let Some((cert, key)) = config.ca_paths() {
        return CertificateAuthority::load_or_generate(cert, key);
    }
    if config.confdir.is_empty() {
        return CertificateAuthority::generate();
    }
    let confdir = config.expand_path(&config.confdir);
    let confdir = Path::new(&confdir);
    CertificateAuthority::load_or_generate(confdir.join(CA_CERT_FILE), confdir.join(CA_KEY_FILE))
}
