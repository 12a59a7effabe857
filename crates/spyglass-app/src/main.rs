//! Spyglass - interactive TLS-intercepting proxy.
//!
//! Thin CLI around [`spyglass_proxy::ProxyServer`]: parses flags into a
//! [`ProxyConfig`], bootstraps root CA material when interception is
//! requested, runs the server until Ctrl-C, then closes it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use spyglass_proxy::{
    CertificateAuthority, ProxyConfig, ProxyKind, ProxyServer, DEFAULT_PROXY_PORT,
};

/// Spyglass - interactive TLS-intercepting proxy
#[derive(Parser, Debug)]
#[command(name = "spyglass", version, about)]
struct Args {
    /// Port to listen on
    #[arg(long, short, default_value_t = DEFAULT_PROXY_PORT)]
    port: u16,

    /// Listener flavor: http or https
    #[arg(long, default_value = "http")]
    kind: String,

    /// Hostname for the listener's own certificate (required with --kind https)
    #[arg(long)]
    hostname: Option<String>,

    /// Aggregate bandwidth cap in KB/s
    #[arg(long)]
    throttle: Option<i64>,

    /// Intercept every CONNECT instead of tunneling
    #[arg(long)]
    force_intercept_https: bool,

    /// Skip upstream certificate verification (dangerous)
    #[arg(long)]
    dangerously_ignore_unauthorized: bool,

    /// Keep the console quiet
    #[arg(long)]
    silent: bool,

    /// Directory holding the root CA material (defaults to the Spyglass
    /// data directory)
    #[arg(long)]
    ca_dir: Option<PathBuf>,
}

fn init_logging(silent: bool) {
    let default = if silent { "error" } else { "spyglass=info,warn" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.silent);

    let ca = match &args.ca_dir {
        Some(dir) => CertificateAuthority::new(dir),
        None => CertificateAuthority::with_default_dir().context("resolving CA directory")?,
    };
    let ca = Arc::new(ca);

    let kind = match args.kind.as_str() {
        "https" => ProxyKind::Https,
        _ => ProxyKind::Http,
    };

    // Interception needs a root the user can install into their trust
    // store; generate one on first use and point at it.
    if args.force_intercept_https && !ca.root_exists() {
        ca.generate_root().context("generating root CA")?;
        tracing::info!(
            cert = %ca.root_cert_path().display(),
            "new root CA generated; install it in your trust store to avoid certificate warnings"
        );
    }

    // Negative throttle values are rejected here; the typed config only
    // carries unsigned rates.
    let throttle = match args.throttle {
        Some(rate) if rate <= 0 => anyhow::bail!("invalid throttle rate {rate}, must be a positive integer"),
        Some(rate) => Some(rate as u64),
        None => None,
    };

    let mut config = ProxyConfig::new(args.port)
        .with_kind(kind)
        .with_force_intercept_https(args.force_intercept_https)
        .with_ignore_upstream_tls_errors(args.dangerously_ignore_unauthorized)
        .with_silent(args.silent);
    if let Some(hostname) = args.hostname {
        config = config.with_hostname(hostname);
    }
    if let Some(rate) = throttle {
        config = config.with_throttle(rate);
    }

    let server = ProxyServer::new(config, ca).context("constructing proxy server")?;
    server.start().await.context("starting proxy server")?;

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("shutting down");
    server.close().await;

    Ok(())
}
