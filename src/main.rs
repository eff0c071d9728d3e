use anyhow::{Context, Result};
use clap::Parser;
use ldap_honeypot::event::{EventSink, JsonFileSink, TracingSink};
use ldap_honeypot::server::ServerContext;
use ldap_honeypot::{run_metrics_server, tls, Config, HoneypotServer, Metrics};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const EVENT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "ldap-honeypot")]
#[command(about = "LDAP v3 honeypot - answers directory clients convincingly and records every request")]
struct Args {
    /// Configuration file path (defaults apply when omitted)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen URL (overrides config; e.g. ldap://:1389)
    #[arg(short = 'l', long, value_name = "URL")]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_honeypot={},info", log_level))
        .init();

    info!("Starting LDAP honeypot");

    let mut config = match &args.config {
        Some(path) => {
            info!("Configuration source: file {:?}", path);
            Config::from_file(path)?
        }
        None => {
            info!("No --config given, using defaults");
            Config::default()
        }
    };
    if let Some(url) = args.listen {
        config.listen.url = url;
        config.validate()?;
    }

    info!("Configuration loaded:");
    info!("  Listen URL: {}", config.listen.url);
    if let Some(url) = &config.listen.ldaps_url {
        info!("  LDAPS URL: {}", url);
    }
    info!("  Credentials: {}", config.credentials.len());

    let tls_acceptor = match &config.tls {
        Some(tls_cfg) => {
            let acceptor = tls::build_acceptor(tls_cfg)?;
            info!("TLS enabled (LDAPS and StartTLS) with {}", tls_cfg.cert_file);
            acceptor
        }
        None => {
            let names = tls::self_signed_names(&config.root_dse.naming_contexts);
            info!("No tls section, using a self-signed certificate for {:?}", names);
            tls::self_signed_acceptor(names)?
        }
    };

    let (sink, event_writer) = match config.events_file() {
        Some(path) => {
            info!("Writing events to {}", path);
            let (sink, writer) = JsonFileSink::open(Path::new(path))
                .await
                .with_context(|| format!("Open events file {}", path))?;
            let sink: Arc<dyn EventSink> = Arc::new(sink);
            (sink, Some(writer))
        }
        None => {
            let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
            (sink, None)
        }
    };

    let metrics = Arc::new(Metrics::new());
    let cancel = CancellationToken::new();
    let ctx = Arc::new(ServerContext::from_config(
        &config,
        sink,
        Arc::clone(&metrics),
        Some(tls_acceptor),
        cancel.clone(),
    )?);

    let mut tasks = JoinSet::new();

    if let Some(addr) = config.metrics_listen.clone() {
        let metrics = Arc::clone(&metrics);
        let cancel = cancel.clone();
        tasks.spawn(async move { run_metrics_server(&addr, metrics, cancel).await });
    }

    let mut urls = vec![config.listen.url.clone()];
    urls.extend(config.listen.ldaps_url.clone());
    for url in urls {
        let server = HoneypotServer::new(url, Arc::clone(&ctx));
        tasks.spawn(async move { server.start().await });
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, shutting down");
            }
            cancel.cancel();
        });
    }

    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.context("Listener task panicked").and_then(|r| r);
        if let Err(e) = outcome {
            error!("{:#}", e);
            cancel.cancel();
            if result.is_ok() {
                result = Err(e);
            }
        }
    }

    // Connection tasks still holding the context drop it once they see the cancellation
    drop(ctx);
    if let Some(writer) = event_writer {
        if tokio::time::timeout(EVENT_FLUSH_TIMEOUT, writer).await.is_err() {
            warn!("Timed out flushing the events file");
        }
    }

    info!("LDAP honeypot stopped");
    result
}
