use anyhow::Context;
use clap::Parser;
use mockproxy::{config::Config, config::ProxyMode, server::MockProxyServer};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "mockproxy")]
#[command(about = "Intercepting HTTP/1.1 and HTTP/2 proxy that mocks or forwards traffic")]
struct Cli {
    #[arg(short, long, default_value = "127.0.0.1")]
    listen_host: String,

    #[arg(short = 'p', long, default_value = "8000")]
    listen_port: u16,

    /// JSON rule file: a list of `{"filter": ..., "action": ...}` objects.
    #[arg(short, long)]
    rules: Option<String>,

    /// Forward through this upstream proxy (`http://host:port` or `https://host:port`).
    #[arg(long)]
    upstream: Option<String>,

    /// Relay CONNECT tunnels to this host without interception. Repeatable.
    #[arg(long = "passthrough")]
    passthrough: Vec<String>,

    #[arg(long)]
    no_http2: bool,

    #[arg(long)]
    ssl_insecure: bool,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level.as_str())),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    info!("Starting mockproxy");

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => Config::default(),
    };

    config.proxy_host = cli.listen_host;
    config.proxy_port = cli.listen_port;
    if let Some(rules) = cli.rules {
        config.rules_path = Some(rules);
    }
    if let Some(upstream) = cli.upstream {
        config.mode = ProxyMode::Upstream;
        config.upstream_server = Some(upstream);
    }
    config.tls_passthrough.extend(cli.passthrough);
    if cli.no_http2 {
        config.http2_enabled = false;
    }
    if cli.ssl_insecure {
        config.ssl_insecure = true;
    }

    let server = MockProxyServer::new(config)
        .await
        .context("initialising the proxy")?;
    server.run().await?;

    Ok(())
}
