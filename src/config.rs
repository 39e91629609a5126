use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub proxy_host: String,
    pub proxy_port: u16,
    /// Offer h2 via ALPN and accept h2c prior-knowledge connections.
    pub http2_enabled: bool,
    pub max_concurrent_streams: u32,
    pub max_tunnel_depth: usize,
    pub handshake_timeout_ms: u64,
    pub upstream_timeout_ms: u64,
    /// Skip upstream certificate verification.
    pub ssl_insecure: bool,
    pub mode: ProxyMode,
    /// Upstream proxy URL (`http://host:port` or `https://host:port`) used in upstream mode.
    pub upstream_server: Option<String>,
    /// Open HTTP/2 CONNECT streams to the upstream proxy instead of HTTP/1.1 CONNECT.
    pub upstream_proxy_http2: bool,
    pub upstream_http2: UpstreamHttp2,
    /// Hosts whose CONNECT tunnels are relayed untouched instead of intercepted.
    pub tls_passthrough: Vec<String>,
    /// Certificate name used when neither SNI nor a CONNECT authority is known.
    pub default_hostname: String,
    pub ca_cert_path: Option<String>,
    pub ca_key_path: Option<String>,
    pub max_flows: usize,
    pub rules_path: Option<String>,
    pub confdir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    Regular,
    Upstream,
}

/// Which protocol to offer a TLS upstream during pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamHttp2 {
    /// Offer h2 only when the inbound exchange was HTTP/2.
    Fallback,
    Always,
    Never,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_host: "127.0.0.1".to_string(),
            proxy_port: 8000,
            http2_enabled: true,
            max_concurrent_streams: 100,
            max_tunnel_depth: 8,
            handshake_timeout_ms: 10_000,
            upstream_timeout_ms: 30_000,
            ssl_insecure: false,
            mode: ProxyMode::Regular,
            upstream_server: None,
            upstream_proxy_http2: false,
            upstream_http2: UpstreamHttp2::Fallback,
            tls_passthrough: Vec::new(),
            default_hostname: "localhost".to_string(),
            ca_cert_path: None,
            ca_key_path: None,
            max_flows: 10000,
            rules_path: None,
            confdir: "~/.mockproxy".to_string(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path
            .as_ref()
            .to_str()
            .ok_or_else(|| Error::internal("config path is not valid UTF-8"))?;
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy_host, self.proxy_port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn upstream_proxy(&self) -> Option<&str> {
        match self.mode {
            ProxyMode::Upstream => self.upstream_server.as_deref(),
            ProxyMode::Regular => None,
        }
    }

    pub fn is_tls_passthrough(&self, host: &str) -> bool {
        self.tls_passthrough
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(host))
    }

    pub fn expand_path(&self, path: &str) -> String {
        if let Some(rest) = path.strip_prefix('~') {
            if let Some(home) = dirs::home_dir() {
                return format!("{}{}", home.display(), rest);
            }
        }
        path.to_string()
    }

    pub fn ca_paths(&self) -> Option<(String, String)> {
        match (&self.ca_cert_path, &self.ca_key_path) {
            (Some(cert), Some(key)) => Some((self.expand_path(cert), self.expand_path(key))),
            _ => None,
        }
    }
}
