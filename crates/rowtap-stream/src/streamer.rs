//! Streamer worker: changelog buffer → output topic, one table at a time.
//!
//! A worker claims a table by winning its row lock, optionally bootstraps
//! it from a consistent snapshot, then tails the table's changelog topic,
//! re-encoding envelope events with the output encoder.
//!
//! The snapshot/binlog seam is closed in two steps before bootstrapping:
//! wait until the cluster's changelog reader has published a start
//! position for the table, then wait until the snapshot replica's
//! executed GTID set contains that position. Every row the snapshot can
//! then see is at or after the reader's start, so nothing falls between
//! snapshot and changelog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use metrics::counter;
use mysql_async::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rowtap_core::encoder::{self, row_key};
use rowtap_core::{AppConfig, Encoder, EventKind, TableSchema};
use rowtap_db::{schema, Endpoint, GtidSet, Lock, StateRow, StateStore};
use rowtap_pipe::{Consumer, Pipe, Producer};

use crate::snapshot::snapshot_table;
use crate::{now_micros, WorkerError};

/// Run one worker pass: claim a table if any is free and stream it until
/// shutdown or failure. `Ok(false)` means nothing was free to work on.
pub async fn worker(
    cfg: &Arc<AppConfig>,
    state: &Arc<StateStore>,
    in_pipe: &Arc<dyn Pipe>,
    out_pipes: &HashMap<String, Arc<dyn Pipe>>,
    shutdown: &CancellationToken,
) -> Result<bool, WorkerError> {
    let Some(claimed) = claim_table(cfg, state, out_pipes, shutdown).await? else {
        return Ok(false);
    };
    let row = claimed.row;

    // Heartbeat the lock rows while the table is being streamed; a
    // snapshot can easily outlive the lock TTL.
    let locks = Arc::new(tokio::sync::Mutex::new(claimed.locks));
    let heartbeat_stop = CancellationToken::new();
    let heartbeat = {
        let locks = locks.clone();
        let stop = heartbeat_stop.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(rowtap_db::lock::LOCK_TTL / 3);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tick.tick() => {
                        for lock in locks.lock().await.iter_mut() {
                            if let Err(e) = lock.refresh().await {
                                warn!(error = %e, "lock refresh failed");
                            }
                        }
                    }
                }
            }
        })
    };

    let outcome = stream_claimed(cfg, state, in_pipe, out_pipes, &row, shutdown).await;

    heartbeat_stop.cancel();
    let _ = heartbeat.await;

    // Locks release after producers are closed inside stream_claimed, so
    // the next owner never races a half-open output.
    for lock in locks.lock().await.iter_mut() {
        if let Err(e) = lock.unlock().await {
            warn!(error = %e, "lock release failed, row expires on its own");
        }
    }

    outcome.map(|_| true)
}

struct Claimed {
    row: StateRow,
    /// Table lock first, then the optional cluster ticket.
    locks: Vec<Lock>,
}

/// Scan the catalog and try to win a free table's lock.
async fn claim_table(
    cfg: &Arc<AppConfig>,
    state: &Arc<StateStore>,
    out_pipes: &HashMap<String, Arc<dyn Pipe>>,
    shutdown: &CancellationToken,
) -> Result<Option<Claimed>, WorkerError> {
    let rows = match &cfg.cluster_filter {
        Some(cluster) => state.get_for_cluster(cluster).await.context("read state")?,
        None => state.get_all().await.context("read state")?,
    };

    for row in rows {
        if shutdown.is_cancelled() {
            return Err(WorkerError::Shutdown);
        }
        if row.errored {
            continue;
        }
        if !out_pipes.contains_key(&row.output) {
            // Protocol-violation class: skip the row, keep the rest going.
            warn!(id = row.id, output = row.output.as_str(), "unknown output pipe type");
            continue;
        }

        let mut table_lock = Lock::new(state.pool().clone());
        if !table_lock
            .try_lock(&format!("table_id.{}", row.id))
            .await
            .context("acquire table lock")?
        {
            continue;
        }

        // Bounded per-cluster concurrency, when configured.
        let mut locks = vec![table_lock];
        if cfg.cluster_concurrency > 0 {
            let mut ticket = Lock::new(state.pool().clone());
            let name = format!("{}.{}", row.service, row.cluster);
            if !ticket
                .try_lock_shared(&name, cfg.cluster_concurrency)
                .await
                .context("acquire cluster ticket")?
            {
                debug!(cluster = row.cluster.as_str(), "all cluster concurrency tickets taken");
                locks[0].unlock().await.context("release table lock")?;
                continue;
            }
            locks.push(ticket);
        }

        info!(
            id = row.id,
            service = row.service.as_str(),
            db = row.db.as_str(),
            table = row.table.as_str(),
            output = row.output.as_str(),
            "table claimed"
        );
        return Ok(Some(Claimed { row, locks }));
    }

    Ok(None)
}

async fn stream_claimed(
    cfg: &Arc<AppConfig>,
    state: &Arc<StateStore>,
    in_pipe: &Arc<dyn Pipe>,
    out_pipes: &HashMap<String, Arc<dyn Pipe>>,
    row: &StateRow,
    shutdown: &CancellationToken,
) -> Result<(), WorkerError> {
    let out_pipe = out_pipes.get(&row.output).expect("checked during claim");

    let schema = load_schema(state, row).await?;
    let mut out_encoder = encoder::create(&row.output_format, &cfg.namespace, schema.clone())
        .context("build output encoder")?;
    let mut env_encoder = encoder::create(&cfg.internal_encoding, &cfg.namespace, schema)
        .context("build envelope encoder")?;

    let topic = cfg.output_topic(&row.service, &row.db, &row.table);
    let mut producer = out_pipe.new_producer(&topic).await.context("open output producer")?;
    producer.set_format(&row.output_format);
    info!(topic = topic.as_str(), format = row.output_format.as_str(), "streaming to topic");

    // The changelog consumer must exist before the snapshot runs so no
    // event published during the snapshot is missed.
    let changelog_topic = cfg.changelog_topic(&row.service, &row.db, &row.table);
    let mut consumer =
        in_pipe.new_consumer(&changelog_topic).await.context("open changelog consumer")?;

    let outcome = run_table(
        cfg,
        state,
        row,
        out_encoder.as_mut(),
        env_encoder.as_mut(),
        producer.as_mut(),
        consumer.as_mut(),
        shutdown,
    )
    .await;

    match &outcome {
        Ok(()) => {
            let _ = consumer.close().await;
        }
        Err(_) => {
            // Release without committing: the next owner replays from the
            // last committed offset and downstream dedupes by seqno.
            let _ = consumer.close_on_failure().await;
        }
    }
    if let Err(e) = producer.close().await {
        warn!(topic = topic.as_str(), error = %e, "output producer close failed");
    }
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn run_table(
    cfg: &Arc<AppConfig>,
    state: &Arc<StateStore>,
    row: &StateRow,
    out_encoder: &mut dyn Encoder,
    env_encoder: &mut dyn Encoder,
    producer: &mut dyn Producer,
    consumer: &mut dyn Consumer,
    shutdown: &CancellationToken,
) -> Result<(), WorkerError> {
    // The cluster's changelog reader publishes a GTID for the table once
    // it is tailing; bootstrapping before that could lose the seam.
    let reader_start = wait_for_reader(state, row.id, shutdown).await?;

    let replica = state
        .get_addr(&row.cluster, Endpoint::Replica)
        .await
        .context("resolve snapshot replica")?;
    wait_for_gtid(&replica, &reader_start, shutdown).await?;

    let needs_bootstrap = state
        .get_table_new_flag(
            &row.service,
            &row.cluster,
            &row.db,
            &row.table,
            &row.input,
            &row.output,
            row.version,
        )
        .await
        .context("read bootstrap flag")?;

    if needs_bootstrap {
        // Schema-carrying outputs lead with the table's schema so the
        // snapshot rows are interpretable.
        if let Some(payload) = out_encoder
            .encode_schema(0, now_micros())
            .context("encode initial schema event")?
        {
            producer
                .push_schema(row.table.clone(), payload)
                .await
                .context("push initial schema")?;
        }

        let snap_gtid = snapshot_table(
            cfg,
            &replica,
            &row.db,
            &row.table,
            out_encoder,
            producer,
            shutdown,
        )
        .await?;
        debug!(table = row.table.as_str(), gtid = snap_gtid.as_str(), "bootstrap finished");

        state.clear_new_flag(row.id, row.version).await.context("clear bootstrap flag")?;
        counter!("rowtap_streamer_bootstraps_total", 1, "table" => row.table.clone());
    }

    if !cfg.changelog_buffer {
        return Ok(());
    }

    tail_changelog(cfg, state, row, out_encoder, env_encoder, producer, consumer, shutdown).await
}

/// Poll the state row until the changelog reader has published a start
/// position for this table.
async fn wait_for_reader(
    state: &Arc<StateStore>,
    id: i64,
    shutdown: &CancellationToken,
) -> Result<String, WorkerError> {
    debug!(id, "waiting for changelog reader to start publishing");
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Err(WorkerError::Shutdown),
            _ = tick.tick() => {
                let row = state.get_by_id(id).await.context("poll state row")?;
                if !row.gtid.is_empty() {
                    debug!(id, gtid = row.gtid.as_str(), "changelog reader confirmed started");
                    return Ok(row.gtid);
                }
            }
        }
    }
}

/// Poll the replica until its executed GTID set contains `target`.
async fn wait_for_gtid(
    replica: &rowtap_db::Addr,
    target: &str,
    shutdown: &CancellationToken,
) -> Result<(), WorkerError> {
    let target: GtidSet =
        target.parse().map_err(|e| anyhow!("reader start position: {e}"))?;
    debug!(target = %target, "waiting for snapshot replica to catch up");

    let mut conn = rowtap_db::connect(replica).await.context("open replica connection")?;
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Err(WorkerError::Shutdown),
            _ = tick.tick() => {
                let executed: String = conn
                    .query_first("SELECT @@global.gtid_executed")
                    .await
                    .context("read replica gtid_executed")?
                    .unwrap_or_default();
                let executed: GtidSet =
                    executed.parse().map_err(|e| anyhow!("replica gtid set: {e}"))?;
                if executed.contains(&target) {
                    debug!(replica_at = %executed, "snapshot replica caught up");
                    return Ok(());
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn tail_changelog(
    cfg: &Arc<AppConfig>,
    state: &Arc<StateStore>,
    row: &StateRow,
    out_encoder: &mut dyn Encoder,
    env_encoder: &mut dyn Encoder,
    producer: &mut dyn Producer,
    consumer: &mut dyn Consumer,
    shutdown: &CancellationToken,
) -> Result<(), WorkerError> {
    let mut last_seq: u64 = 0;
    let mut batch: Vec<(Option<String>, Vec<u8>)> = Vec::new();
    let mut persist =
        tokio::time::interval(Duration::from_secs(cfg.state_update_timeout_secs.max(1)));
    persist.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = persist.tick() => {
                flush(producer, &mut batch).await?;
                if last_seq > 0 {
                    state.update_seqno(row.id, last_seq).await.context("persist seqno")?;
                }
            }
            available = consumer.fetch_next() => {
                if !available {
                    // Shutdown-initiated; drain and leave cleanly.
                    flush(producer, &mut batch).await?;
                    if last_seq > 0 {
                        state.update_seqno(row.id, last_seq).await.context("persist seqno")?;
                    }
                    return if shutdown.is_cancelled() {
                        Ok(())
                    } else {
                        Err(anyhow!("changelog consumer closed").into())
                    };
                }
                let message = consumer.pop().map_err(|e| anyhow!("changelog pop: {e}"))?;
                let event =
                    env_encoder.decode_event(&message.payload).context("decode envelope event")?;

                // Changelog seqnos start at 1; zero is reserved for the
                // snapshot stream and must never appear here.
                if event.seq_no == 0 {
                    return Err(WorkerError::Invariant(format!(
                        "{}.{}: seqno 0 in changelog stream",
                        row.db, row.table
                    )));
                }
                if event.seq_no < last_seq {
                    return Err(WorkerError::Invariant(format!(
                        "{}.{}: seqno regressed from {last_seq} to {}",
                        row.db, row.table, event.seq_no
                    )));
                }
                if event.seq_no == last_seq {
                    // Replayed message; downstream already has it.
                    counter!("rowtap_streamer_duplicates_total", 1, "table" => row.table.clone());
                    continue;
                }
                last_seq = event.seq_no;

                match event.kind {
                    EventKind::Schema => {
                        // The reader bumped the version and stored the new
                        // schema before publishing this event.
                        flush(producer, &mut batch).await?;
                        let current = state.get_by_id(row.id).await.context("reload state row")?;
                        let fresh = load_schema(state, &current).await?;
                        env_encoder.update_schema(fresh.clone()).context("update envelope schema")?;
                        out_encoder.update_schema(fresh).context("update output schema")?;
                        if out_encoder.schema_carrying() {
                            let payload = out_encoder
                                .encode_event(&event)
                                .context("encode schema event")?;
                            producer.push(payload).await.context("push schema event")?;
                        }
                        info!(
                            table = row.table.as_str(),
                            seq_no = event.seq_no,
                            "schema change propagated"
                        );
                    }
                    EventKind::Insert | EventKind::Delete => {
                        let payload =
                            out_encoder.encode_event(&event).context("re-encode event")?;
                        batch.push((Some(row_key(&event.key)), payload));
                        counter!("rowtap_streamer_events_total", 1, "table" => row.table.clone());
                        if batch.len() >= cfg.pipe_batch_size {
                            flush(producer, &mut batch).await?;
                        }
                    }
                }
            }
        }
    }
}

async fn flush(
    producer: &mut dyn Producer,
    batch: &mut Vec<(Option<String>, Vec<u8>)>,
) -> Result<(), WorkerError> {
    if !batch.is_empty() {
        producer
            .push_batch(std::mem::take(batch))
            .await
            .context("push output batch")?;
    }
    Ok(())
}

/// The table's current schema: the stored blob when present, otherwise
/// extracted from the source and backfilled.
async fn load_schema(state: &Arc<StateStore>, row: &StateRow) -> Result<TableSchema, WorkerError> {
    match &row.raw_schema {
        Some(raw) if !raw.is_empty() => {
            Ok(TableSchema::from_raw(raw).map_err(|e| anyhow!("stored schema: {e}"))?)
        }
        _ => {
            let master = state
                .get_addr(&row.cluster, Endpoint::Master)
                .await
                .context("resolve master for schema")?;
            let schema = schema::extract_from(&master, &row.db, &row.table)
                .await
                .context("extract schema")?;
            state
                .save_raw_schema_if_empty(row.id, &schema.to_raw())
                .await
                .context("backfill schema")?;
            Ok(schema)
        }
    }
}
