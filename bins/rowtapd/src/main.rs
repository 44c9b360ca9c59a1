//! rowtapd, the change-data-capture pipeline daemon.
//!
//! Loads the YAML configuration, connects the state catalog, then runs
//! the worker pool (one changelog reader per source cluster plus the
//! streamer workers) until SIGINT. Everything shuts down cooperatively
//! through one cancellation token.
//!
//! ```bash
//! rowtapd --config /etc/rowtap/rowtap.yml
//! RUST_LOG=debug rowtapd --config rowtap.yml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rowtap_core::AppConfig;
use rowtap_db::{Addr, StateStore};

#[derive(Parser, Debug)]
#[command(name = "rowtapd")]
#[command(about = "MySQL change-data-capture pipeline daemon")]
struct Args {
    /// Path to the pipeline YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Handle only this source cluster (overrides the config file)
    #[arg(long)]
    cluster: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut cfg = match &args.config {
        Some(path) => AppConfig::load(path).context("load config")?,
        None => AppConfig::default(),
    };
    if args.cluster.is_some() {
        cfg.cluster_filter = args.cluster;
    }
    let cfg = Arc::new(cfg);

    let state_addr = Addr {
        host: cfg.state_db.host.clone(),
        port: cfg.state_db.port,
        user: cfg.state_db.user.clone(),
        password: cfg.state_db.password.clone(),
        db: Some(cfg.state_db.db.clone()),
    };
    let state = Arc::new(StateStore::connect(&state_addr).await.context("connect state store")?);

    let shutdown = CancellationToken::new();
    let pipeline = tokio::spawn(rowtap_stream::run(cfg.clone(), state, shutdown.clone()));

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {
            // An invariant violation cancelled from inside the pool.
        }
    }

    match pipeline.await {
        Ok(Ok(())) => {
            info!("pipeline stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "pipeline failed");
            Err(e)
        }
        Err(e) => Err(anyhow::anyhow!("pipeline task panicked: {e}")),
    }
}
