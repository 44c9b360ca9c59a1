//! # rowtap-stream
//!
//! The pipeline's moving parts: the per-cluster changelog (binlog)
//! reader, the consistent snapshotter and the streamer worker pool, plus
//! the supervisor that keeps them running.
//!
//! Components never hold references to each other; they meet at the state
//! catalog and at named topics on the pipes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rowtap_core::AppConfig;
use rowtap_db::StateStore;
use rowtap_pipe::Pipe;

pub mod changelog;
mod convert;
pub mod snapshot;
pub mod streamer;

pub use changelog::ChangelogReader;

/// Worker failure classes; the supervisor restarts everything except
/// invariant violations, which take the process down.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("shutdown requested")]
    Shutdown,
    #[error("invariant violation: {0}")]
    Invariant(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Current time in microseconds, the envelope timestamp unit.
pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// How long an idle streamer sleeps before rescanning for free tables.
const IDLE_RETRY: Duration = Duration::from_secs(3);
/// Cadence for discovering newly registered source clusters.
const CLUSTER_SCAN: Duration = Duration::from_secs(10);

/// Run readers and streamer workers until shutdown.
///
/// Returns an error only for invariant-class failures; everything else is
/// restarted in place with backoff.
pub async fn run(
    cfg: Arc<AppConfig>,
    state: Arc<StateStore>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let in_pipe = rowtap_pipe::create(&cfg.changelog_pipe_type, &cfg, shutdown.clone())?;
    let mut out_pipes: HashMap<String, Arc<dyn Pipe>> = HashMap::new();
    for kind in rowtap_pipe::kinds() {
        out_pipes.insert(kind.to_string(), rowtap_pipe::create(kind, &cfg, shutdown.clone())?);
    }
    let out_pipes = Arc::new(out_pipes);

    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    // One changelog reader per source cluster, discovered at runtime.
    {
        let cfg = cfg.clone();
        let state = state.clone();
        let in_pipe = in_pipe.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let mut readers: JoinSet<Result<(), WorkerError>> = JoinSet::new();
            let mut running: Vec<String> = Vec::new();
            let mut scan = tokio::time::interval(CLUSTER_SCAN);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = scan.tick() => {
                        let clusters = match state.clusters().await {
                            Ok(c) => c,
                            Err(e) => {
                                warn!(error = %e, "cluster scan failed");
                                continue;
                            }
                        };
                        for cluster in clusters {
                            if let Some(filter) = &cfg.cluster_filter {
                                if *filter != cluster {
                                    continue;
                                }
                            }
                            if running.contains(&cluster) {
                                continue;
                            }
                            info!(cluster = cluster.as_str(), "starting changelog reader");
                            running.push(cluster.clone());
                            readers.spawn(
                                ChangelogReader::new(
                                    cfg.clone(),
                                    state.clone(),
                                    in_pipe.clone(),
                                    cluster,
                                    shutdown.clone(),
                                )
                                .run(),
                            );
                        }
                    }
                    Some(done) = readers.join_next(), if !readers.is_empty() => {
                        match done {
                            Ok(Err(WorkerError::Invariant(msg))) => {
                                error!(msg = msg.as_str(), "reader invariant violation");
                                shutdown.cancel();
                                return Err(anyhow::anyhow!("invariant violation: {msg}"));
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "reader task panicked"),
                        }
                    }
                }
            }
            readers.shutdown().await;
            Ok(())
        });
    }

    // The streamer pool.
    for worker_id in 0..cfg.max_num_procs.max(1) {
        let cfg = cfg.clone();
        let state = state.clone();
        let in_pipe = in_pipe.clone();
        let out_pipes = out_pipes.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            info!(worker_id, "streamer worker started");
            let mut backoff = Duration::from_secs(1);
            while !shutdown.is_cancelled() {
                match streamer::worker(&cfg, &state, &in_pipe, &out_pipes, &shutdown).await {
                    Ok(true) => {
                        backoff = Duration::from_secs(1);
                    }
                    Ok(false) => {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(IDLE_RETRY) => {}
                        }
                    }
                    Err(WorkerError::Shutdown) => break,
                    Err(WorkerError::Invariant(msg)) => {
                        error!(worker_id, msg = msg.as_str(), "invariant violation");
                        shutdown.cancel();
                        return Err(anyhow::anyhow!("invariant violation: {msg}"));
                    }
                    Err(WorkerError::Other(e)) => {
                        warn!(worker_id, error = %e, "streamer failed, backing off");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(Duration::from_secs(30));
                    }
                }
            }
            info!(worker_id, "streamer worker finished");
            Ok(())
        });
    }

    let mut failure = None;
    while let Some(done) = tasks.join_next().await {
        match done {
            Ok(Ok(())) => {}
            Ok(Err(e)) => failure = Some(e),
            Err(e) => warn!(error = %e, "worker task panicked"),
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
