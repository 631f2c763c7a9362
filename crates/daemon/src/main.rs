//! BuildSeal Daemon
//!
//! Watches build runs on the orchestrator, derives signed provenance
//! attestations, and distributes them to the configured storage backends.

use buildseal_daemon::cluster::HttpRunClient;
use buildseal_daemon::config::DaemonConfig;
use buildseal_daemon::reconciler::{Reconciler, ReconcilerOptions};
use buildseal_daemon::storage::build_backends;
use buildseal_daemon::tsa::HttpTimestampAuthority;
use buildseal_common::{KeyAlgorithm, KeyPair, TrustBundle};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "buildseald")]
#[command(about = "BuildSeal daemon - build provenance generation and signing")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.buildseal/config.toml")]
    config: PathBuf,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Reconcile worker count override
    #[arg(short, long)]
    workers: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("BuildSeal daemon v{}", env!("CARGO_PKG_VERSION"));

    let config_path = expand_home(&cli.config);
    let mut config = DaemonConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(workers) = cli.workers {
        config.reconciler.workers = workers;
    }
    tokio::fs::create_dir_all(&config.store_path).await?;

    let signing_key = load_or_generate_key(&config).await?;
    info!(
        algorithm = ?signing_key.algorithm(),
        keyid = signing_key.keyid().unwrap_or_default(),
        "signing key loaded"
    );

    let client = Arc::new(HttpRunClient::new(
        config.orchestrator.endpoint.clone(),
        config.reconciler.call_timeout(),
    )?);
    let backends = build_backends(&config, client.clone())?;
    info!(
        backends = ?backends.iter().map(|b| b.name()).collect::<Vec<_>>(),
        formats = ?config.engine.payload_formats,
        "storage configured"
    );

    let options = ReconcilerOptions::from(&config.reconciler);
    let mut reconciler = Reconciler::new(
        client.clone(),
        backends,
        config.engine.clone(),
        options,
        signing_key,
    );
    if let Some(bundle_path) = &config.engine.trust_bundle_path {
        let bundle = TrustBundle::load(bundle_path).await?;
        info!(certs = bundle.len(), "identity verification enabled");
        reconciler = reconciler.with_trust_bundle(bundle);
    }
    if let Some(tsa_url) = &config.engine.timestamp_authority_url {
        reconciler = reconciler.with_timestamper(Box::new(HttpTimestampAuthority::new(
            tsa_url.clone(),
            config.reconciler.call_timeout(),
        )?));
    }
    let reconciler = Arc::new(reconciler);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run_handle = tokio::spawn(reconciler.clone().run(shutdown_rx));

    // Periodic resync converges runs whose watch events were missed.
    let resync_reconciler = reconciler.clone();
    let resync_interval = config.reconciler.resync_interval();
    let resync_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(resync_interval);
        loop {
            ticker.tick().await;
            match resync_reconciler.resync().await {
                Ok(enqueued) if enqueued > 0 => info!(enqueued, "resync enqueued runs"),
                Ok(_) => {}
                Err(e) => warn!("resync failed: {}", e),
            }
        }
    });

    // SIGHUP reloads key material and the trust bundle.
    let reload_reconciler = reconciler.clone();
    let reload_config = config.clone();
    tokio::spawn(async move {
        let Ok(mut hangup) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        else {
            return;
        };
        while hangup.recv().await.is_some() {
            match KeyPair::load(reload_config.signing_key_path()).await {
                Ok(key) => reload_reconciler.swap_signing_key(key),
                Err(e) => error!("signing key reload failed: {}", e),
            }
            if let Some(bundle_path) = &reload_config.engine.trust_bundle_path {
                match TrustBundle::load(bundle_path).await {
                    Ok(bundle) => reload_reconciler.swap_trust_bundle(Some(bundle)),
                    Err(e) => error!("trust bundle reload failed: {}", e),
                }
            }
        }
    });

    info!(
        orchestrator = %config.orchestrator.endpoint,
        workers = config.reconciler.workers,
        "daemon started"
    );

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    let _ = shutdown_tx.send(true);
    resync_handle.abort();
    let _ = run_handle.await;

    info!("daemon shutdown complete");
    Ok(())
}

/// Load the signing key, generating and persisting one on first run.
async fn load_or_generate_key(config: &DaemonConfig) -> anyhow::Result<KeyPair> {
    let path = config.signing_key_path();
    if path.exists() {
        return Ok(KeyPair::load(&path).await?);
    }
    warn!(path = %path.display(), "no signing key found, generating one");
    let key = KeyPair::generate(KeyAlgorithm::Ed25519)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    key.save(&path).await?;
    Ok(key)
}

fn expand_home(path: &std::path::Path) -> PathBuf {
    let Some(text) = path.to_str() else {
        return path.to_path_buf();
    };
    match (text.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}
