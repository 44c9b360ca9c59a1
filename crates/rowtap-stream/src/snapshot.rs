//! Consistent snapshotter.
//!
//! Bootstraps a newly registered table by streaming its full image from a
//! read replica at a fixed GTID. The repeatable-read transaction pins the
//! view; `@@global.gtid_executed` read inside it names a position at or
//! after every row we will see, which is what the streamer's GTID barrier
//! compares against.
//!
//! Snapshot rows are synthetic inserts with `seqno = 0`, encoded with the
//! table's *output* encoder and pushed straight to the output producer;
//! the changelog path is not involved.

use std::time::{Duration, Instant};

use anyhow::Context;
use mysql_async::prelude::*;
use mysql_async::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use rowtap_core::encoder::row_key;
use rowtap_core::{AppConfig, Datum, Encoder, EventKind, TypeFamily};
use rowtap_db::Addr;
use rowtap_pipe::Producer;

use crate::convert::datum_from_value;
use crate::{now_micros, WorkerError};

/// Byte/row rate limiter. Sleeps whenever the running rates exceed both
/// targets; a zero target disables that dimension.
pub struct Throttle {
    bytes_per_sec: u64,
    rows_per_sec: u64,
    started: Instant,
    bytes: u64,
    rows: u64,
}

impl Throttle {
    pub fn new(target_mb: u64, target_iops: u64) -> Throttle {
        Throttle {
            bytes_per_sec: target_mb * 1024 * 1024,
            rows_per_sec: target_iops,
            started: Instant::now(),
            bytes: 0,
            rows: 0,
        }
    }

    fn account(&mut self, bytes: u64) {
        self.bytes += bytes;
        self.rows += 1;
    }

    /// How long the work done so far should have taken at the target
    /// rates, beyond the time actually elapsed.
    fn backlog(&self, elapsed: Duration) -> Duration {
        let mut due = Duration::ZERO;
        if self.bytes_per_sec > 0 {
            due = due.max(Duration::from_secs_f64(self.bytes as f64 / self.bytes_per_sec as f64));
        }
        if self.rows_per_sec > 0 {
            due = due.max(Duration::from_secs_f64(self.rows as f64 / self.rows_per_sec as f64));
        }
        due.saturating_sub(elapsed)
    }

    async fn pace(&mut self, bytes: u64) {
        self.account(bytes);
        let backlog = self.backlog(self.started.elapsed());
        if backlog > Duration::from_millis(10) {
            tokio::time::sleep(backlog).await;
        }
    }
}

/// Progress reporter at ten-percent steps, tolerant of the approximate
/// (and possibly low) total from `information_schema`.
struct Progress {
    total: u64,
    done: u64,
    last_decile: u64,
    table: String,
}

impl Progress {
    fn new(table: &str, total: u64) -> Progress {
        Progress { total: total.max(1), done: 0, last_decile: 0, table: table.to_string() }
    }

    fn step(&mut self) {
        self.done += 1;
        let pct = (self.done * 100 / self.total).min(100);
        let decile = pct / 10;
        if decile > self.last_decile {
            self.last_decile = decile;
            info!(
                table = self.table.as_str(),
                done = self.done,
                pct,
                total = self.total,
                "snapshotting"
            );
        }
    }
}

/// Stream one table's consistent image into `producer`.
///
/// Returns the `gtid_executed` set captured inside the snapshot
/// transaction.
pub async fn snapshot_table(
    cfg: &AppConfig,
    replica: &Addr,
    db: &str,
    table: &str,
    encoder: &dyn Encoder,
    producer: &mut dyn Producer,
    shutdown: &CancellationToken,
) -> Result<String, WorkerError> {
    let addr = replica.clone().with_db(db);
    let mut conn = rowtap_db::connect(&addr)
        .await
        .context("open snapshot connection")?;

    conn.query_drop("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .await
        .context("set isolation level")?;
    conn.query_drop("START TRANSACTION WITH CONSISTENT SNAPSHOT")
        .await
        .context("open snapshot transaction")?;

    let gtid: String = conn
        .query_first("SELECT @@global.gtid_executed")
        .await
        .context("read gtid_executed")?
        .unwrap_or_default();

    // Approximate row count, for progress reporting only.
    let total: u64 = conn
        .exec_first::<Option<u64>, _, _>(
            "SELECT table_rows FROM information_schema.tables \
             WHERE table_schema = ? AND table_name = ?",
            (db, table),
        )
        .await
        .context("read table_rows")?
        .flatten()
        .unwrap_or(0);

    info!(db, table, total, gtid = gtid.as_str(), "snapshot reader started");

    let families: Vec<TypeFamily> =
        encoder.schema().columns.iter().map(|c| c.family()).collect();
    let mut throttle = Throttle::new(cfg.throttle_target_mb, cfg.throttle_target_iops);
    let mut progress = Progress::new(table, total);
    let mut batch: Vec<(Option<String>, Vec<u8>)> = Vec::new();

    {
        let mut rows = conn
            .query_iter(format!("SELECT * FROM `{table}`"))
            .await
            .context("open streaming select")?;

        while let Some(row) = rows.next().await.context("fetch snapshot row")? {
            if shutdown.is_cancelled() {
                return Err(WorkerError::Shutdown);
            }
            let values: Vec<Value> = row.unwrap();
            if values.len() != families.len() {
                return Err(WorkerError::Invariant(format!(
                    "{db}.{table}: row has {} columns, schema has {}",
                    values.len(),
                    families.len()
                )));
            }
            let datums: Vec<Datum> = values
                .iter()
                .zip(families.iter())
                .map(|(v, f)| datum_from_value(v, *f))
                .collect();

            let event = encoder
                .event_from_row(EventKind::Insert, &datums, 0, now_micros())
                .context("build snapshot event")?;
            let key = row_key(&event.key);
            let payload = encoder.encode_event(&event).context("encode snapshot row")?;

            let size = payload.len() as u64;
            batch.push((Some(key), payload));
            if batch.len() >= cfg.pipe_batch_size {
                producer
                    .push_batch(std::mem::take(&mut batch))
                    .await
                    .context("push snapshot batch")?;
            }

            progress.step();
            throttle.pace(size).await;
        }
    }

    if !batch.is_empty() {
        producer.push_batch(batch).await.context("push final snapshot batch")?;
    }

    // Read-only transaction; nothing to keep.
    conn.query_drop("ROLLBACK").await.context("close snapshot transaction")?;
    debug!(db, table, done = progress.done, "snapshot reader finished");

    Ok(gtid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_backlog_tracks_slowest_target() {
        let mut t = Throttle::new(1, 0); // 1 MB/s, unlimited rows
        t.account(2 * 1024 * 1024);
        let backlog = t.backlog(Duration::from_millis(500));
        assert!(backlog > Duration::from_millis(1400) && backlog < Duration::from_millis(1600));

        let mut t = Throttle::new(0, 10); // 10 rows/s
        for _ in 0..5 {
            t.account(1);
        }
        let backlog = t.backlog(Duration::ZERO);
        assert_eq!(backlog, Duration::from_millis(500));
    }

    #[test]
    fn throttle_disabled_never_backs_up() {
        let mut t = Throttle::new(0, 0);
        t.account(u32::MAX as u64);
        assert_eq!(t.backlog(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn progress_tolerates_done_past_total() {
        let mut p = Progress::new("t", 3);
        for _ in 0..10 {
            p.step();
        }
        assert_eq!(p.done, 10);
        assert_eq!(p.last_decile, 10);
    }

    #[test]
    fn progress_with_zero_estimate() {
        let mut p = Progress::new("t", 0);
        p.step();
        assert_eq!(p.done, 1);
    }
}
