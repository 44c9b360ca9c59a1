//! Changelog reader: MySQL binlog → per-table changelog topics.
//!
//! One reader per source cluster. It tails the row-based binlog from the
//! earliest GTID position saved across the cluster's registered tables,
//! demultiplexes row events per table, assigns per-table seqnos, encodes
//! them with the envelope encoder and pushes them keyed by row key.
//!
//! Schema changes are detected by comparing the table-map event's column
//! signature with the cached one; the new schema is re-extracted from
//! `information_schema`, the version bumped, and a `schema` event is
//! published in-stream before any rows that use it.
//!
//! An `UPDATE` expands to a delete of the before-image followed by an
//! insert of the after-image, on consecutive seqnos.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use futures::StreamExt;
use metrics::counter;
use mysql_async::binlog::events::TableMapEvent;
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::binlog::EventType;
use mysql_async::prelude::*;
use mysql_async::{BinlogStreamRequest, Sid};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rowtap_core::encoder::{self, row_key};
use rowtap_core::{AppConfig, Datum, Encoder, EventKind, TableSchema, TypeFamily};
use rowtap_db::{schema, Endpoint, GtidSet, StateStore};
use rowtap_pipe::{Pipe, Producer};

use crate::convert::datum_from_value;
use crate::WorkerError;

/// Binlog tail of one source cluster.
pub struct ChangelogReader {
    cfg: Arc<AppConfig>,
    state: Arc<StateStore>,
    pipe: Arc<dyn Pipe>,
    cluster: String,
    shutdown: CancellationToken,
}

/// Everything the reader keeps per demultiplexed table.
struct TableStream {
    id: i64,
    service: String,
    version: i64,
    encoder: Box<dyn Encoder>,
    producer: Box<dyn Producer>,
    seq_no: u64,
    /// Binlog column-type signature from the last table-map event.
    signature: Option<Vec<u8>>,
    pending: Vec<(Option<String>, Vec<u8>)>,
}

impl ChangelogReader {
    pub fn new(
        cfg: Arc<AppConfig>,
        state: Arc<StateStore>,
        pipe: Arc<dyn Pipe>,
        cluster: String,
        shutdown: CancellationToken,
    ) -> Self {
        ChangelogReader { cfg, state, pipe, cluster, shutdown }
    }

    /// Tail the binlog until shutdown, reconnecting with bounded backoff
    /// on transient errors and resuming at the last persisted position.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        let mut backoff = Duration::from_secs(1);
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            match self.stream_binlog().await {
                Ok(()) | Err(WorkerError::Shutdown) => return Ok(()),
                Err(WorkerError::Invariant(msg)) => return Err(WorkerError::Invariant(msg)),
                Err(e) => {
                    warn!(
                        cluster = self.cluster.as_str(),
                        error = %e,
                        "changelog reader failed, reconnecting"
                    );
                    counter!("rowtap_reader_restarts_total", 1, "cluster" => self.cluster.clone());
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
    }

    async fn stream_binlog(&mut self) -> Result<(), WorkerError> {
        let master = self
            .state
            .get_addr(&self.cluster, Endpoint::Master)
            .await
            .context("resolve cluster master")?;

        // Start where the earliest table left off; a fresh cluster starts
        // at the server's current executed set.
        let rows = self.state.get_for_cluster(&self.cluster).await.context("load state rows")?;
        let saved = self.state.get_gtid(&self.cluster).await.context("read saved position")?;
        let mut progress: GtidSet = if saved.is_empty() {
            let mut conn = rowtap_db::connect(&master).await.context("probe master position")?;
            let executed: String = conn
                .query_first("SELECT @@global.gtid_executed")
                .await
                .context("read gtid_executed")?
                .unwrap_or_default();
            executed.parse().map_err(|e| anyhow!("server gtid set: {e}"))?
        } else {
            saved.parse().map_err(|e| anyhow!("saved gtid set: {e}"))?
        };

        // Publishing a position for fresh rows is what releases streamers
        // waiting on this table.
        for row in &rows {
            if row.gtid.is_empty() && !row.errored {
                self.state
                    .init_gtid(row.id, &progress.to_string())
                    .await
                    .context("publish start gtid")?;
            }
        }

        let sids: Vec<Sid> = progress
            .to_string()
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|e| anyhow!("gtid set for binlog request: {e}"))?;

        let conn = rowtap_db::connect(&master).await.context("open binlog connection")?;
        let binlog = conn
            .get_binlog_stream(
                BinlogStreamRequest::new(self.cfg.server_id).with_gtid().with_gtid_set(sids),
            )
            .await
            .context("request binlog stream")?;
        let mut binlog = Box::pin(binlog);

        info!(
            cluster = self.cluster.as_str(),
            position = %progress,
            "changelog reader started"
        );

        let mut tables: HashMap<(String, String), TableStream> = HashMap::new();
        let mut table_maps: HashMap<u64, TableMapEvent<'static>> = HashMap::new();
        let mut pending_gtid: Option<(String, u64)> = None;
        let mut tick =
            tokio::time::interval(Duration::from_secs(self.cfg.state_update_timeout_secs.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.checkpoint(&mut tables, &progress).await;
                    return Ok(());
                }
                _ = tick.tick() => {
                    self.checkpoint(&mut tables, &progress).await;
                    self.refresh_tables(&mut tables, &progress).await?;
                }
                event = binlog.next() => {
                    let Some(event) = event else {
                        self.checkpoint(&mut tables, &progress).await;
                        return Err(anyhow!("binlog stream ended").into());
                    };
                    let event = event.context("read binlog event")?;
                    self.handle_event(
                        event,
                        &mut tables,
                        &mut table_maps,
                        &mut pending_gtid,
                        &mut progress,
                        &master,
                    )
                    .await?;
                }
            }
        }
    }

    /// Flush pending batches and persist `{gtid, seqno}` per table.
    async fn checkpoint(
        &self,
        tables: &mut HashMap<(String, String), TableStream>,
        progress: &GtidSet,
    ) {
        let position = progress.to_string();
        for ((db, table), stream) in tables.iter_mut() {
            if !stream.pending.is_empty() {
                let batch = std::mem::take(&mut stream.pending);
                if let Err(e) = stream.producer.push_batch(batch).await {
                    warn!(db = db.as_str(), table = table.as_str(), error = %e, "changelog flush failed");
                    continue;
                }
            }
            if let Err(e) = self.state.update_progress(stream.id, &position, stream.seq_no).await {
                // Retried on the next tick; replay is bounded by the
                // checkpoint cadence.
                warn!(db = db.as_str(), table = table.as_str(), error = %e, "state checkpoint failed");
            }
        }
    }

    /// Pick up tables registered (or dropped) at runtime.
    async fn refresh_tables(
        &self,
        tables: &mut HashMap<(String, String), TableStream>,
        progress: &GtidSet,
    ) -> Result<(), WorkerError> {
        let rows = self.state.get_for_cluster(&self.cluster).await.context("reload state rows")?;
        let position = progress.to_string();
        let mut live: HashSet<(String, String)> = HashSet::new();
        for row in &rows {
            if row.errored {
                continue;
            }
            live.insert((row.db.clone(), row.table.clone()));
            if row.gtid.is_empty() {
                self.state.init_gtid(row.id, &position).await.context("publish start gtid")?;
            }
        }
        tables.retain(|key, stream| {
            let keep = live.contains(key);
            if !keep {
                debug!(id = stream.id, "table deregistered, dropping stream");
            }
            keep
        });
        Ok(())
    }

    async fn handle_event(
        &self,
        event: mysql_async::binlog::events::Event,
        tables: &mut HashMap<(String, String), TableStream>,
        table_maps: &mut HashMap<u64, TableMapEvent<'static>>,
        pending_gtid: &mut Option<(String, u64)>,
        progress: &mut GtidSet,
        master: &rowtap_db::Addr,
    ) -> Result<(), WorkerError> {
        use mysql_async::binlog::events as ev;

        let event_type = match event.header().event_type() {
            Ok(t) => t,
            Err(_) => {
                // Protocol-violation class: log, skip, continue.
                warn!(cluster = self.cluster.as_str(), "unknown binlog event type, skipping");
                return Ok(());
            }
        };
        let timestamp = i64::from(event.header().timestamp()) * 1_000_000;

        match event_type {
            EventType::TABLE_MAP_EVENT => {
                let tme: ev::TableMapEvent = event.read_event().context("decode table map")?;
                table_maps.insert(tme.table_id(), tme.into_owned());
            }
            EventType::GTID_EVENT => {
                let g: ev::GtidEvent = event.read_event().context("decode gtid event")?;
                let source = uuid::Uuid::from_bytes(g.sid()).as_hyphenated().to_string();
                *pending_gtid = Some((source, g.gno()));
            }
            EventType::XID_EVENT => {
                if let Some((source, gno)) = pending_gtid.take() {
                    progress.merge(&source, gno);
                }
            }
            EventType::QUERY_EVENT => {
                // BEGIN opens the transaction the pending GTID names; any
                // other statement (DDL, COMMIT) closes it.
                let q: ev::QueryEvent = event.read_event().context("decode query event")?;
                if !q.query().eq_ignore_ascii_case("BEGIN") {
                    if let Some((source, gno)) = pending_gtid.take() {
                        progress.merge(&source, gno);
                    }
                }
            }
            EventType::WRITE_ROWS_EVENT => {
                let e: ev::WriteRowsEvent = event.read_event().context("decode write rows")?;
                let Some(tme) = table_maps.get(&e.table_id()) else {
                    warn!(table_id = e.table_id(), "rows event without table map, skipping");
                    return Ok(());
                };
                let images = collect_images(e.rows(tme), ImageSplit::AfterAsInsert)?;
                self.emit_rows(tables, master, tme, timestamp, images).await?;
            }
            EventType::DELETE_ROWS_EVENT => {
                let e: ev::DeleteRowsEvent = event.read_event().context("decode delete rows")?;
                let Some(tme) = table_maps.get(&e.table_id()) else {
                    warn!(table_id = e.table_id(), "rows event without table map, skipping");
                    return Ok(());
                };
                let images = collect_images(e.rows(tme), ImageSplit::BeforeAsDelete)?;
                self.emit_rows(tables, master, tme, timestamp, images).await?;
            }
            EventType::UPDATE_ROWS_EVENT => {
                let e: ev::UpdateRowsEvent = event.read_event().context("decode update rows")?;
                let Some(tme) = table_maps.get(&e.table_id()) else {
                    warn!(table_id = e.table_id(), "rows event without table map, skipping");
                    return Ok(());
                };
                let images = collect_images(e.rows(tme), ImageSplit::DeleteThenInsert)?;
                self.emit_rows(tables, master, tme, timestamp, images).await?;
            }
            EventType::ROTATE_EVENT
            | EventType::FORMAT_DESCRIPTION_EVENT
            | EventType::PREVIOUS_GTIDS_EVENT
            | EventType::ANONYMOUS_GTID_EVENT
            | EventType::STOP_EVENT
            | EventType::HEARTBEAT_EVENT => {}
            other => {
                debug!(?other, "ignoring binlog event");
            }
        }
        Ok(())
    }

    /// Demultiplex one rows-event worth of images into the table's
    /// changelog topic.
    async fn emit_rows(
        &self,
        tables: &mut HashMap<(String, String), TableStream>,
        master: &rowtap_db::Addr,
        tme: &TableMapEvent<'static>,
        timestamp: i64,
        images: Vec<(EventKind, BinlogRow)>,
    ) -> Result<(), WorkerError> {
        let db = tme.database_name().to_string();
        let table = tme.table_name().to_string();
        let signature = column_signature(tme);
        let key = (db.clone(), table.clone());

        if !tables.contains_key(&key) {
            match self.open_table(&db, &table).await? {
                Some(stream) => {
                    tables.insert(key.clone(), stream);
                }
                None => return Ok(()), // unregistered table
            }
        }

        // Column-signature drift means the source table was altered.
        let drifted = {
            let stream = tables.get_mut(&key).expect("inserted above");
            match &stream.signature {
                Some(known) => *known != signature,
                None => {
                    let cols = stream.encoder.schema().columns.len();
                    stream.signature = Some(signature.clone());
                    cols != signature.len()
                }
            }
        };
        if drifted {
            if let Err(e) = self.evolve_schema(&key, tables, master, timestamp, signature).await {
                // A lost primary key is invariant class and must reach the
                // supervisor; only ordinary schema-resolution failures are
                // fatal for this table alone.
                if matches!(e, WorkerError::Invariant(_)) {
                    return Err(e);
                }
                if let Some(stream) = tables.remove(&key) {
                    error!(
                        db = db.as_str(),
                        table = table.as_str(),
                        error = %e,
                        "schema resolution failed, parking table"
                    );
                    let _ = self.state.mark_errored(stream.id).await;
                    counter!("rowtap_reader_table_errors_total", 1, "table" => table.clone());
                }
                return Ok(());
            }
        }

        let stream = tables.get_mut(&key).expect("present unless parked");
        let families: Vec<TypeFamily> =
            stream.encoder.schema().columns.iter().map(|c| c.family()).collect();

        for (kind, image) in images {
            let datums = binlog_row_datums(&image, &families);
            stream.seq_no += 1;
            let event = stream
                .encoder
                .event_from_row(kind, &datums, stream.seq_no, timestamp)
                .context("build changelog event")?;
            let payload = stream.encoder.encode_event(&event).context("encode changelog event")?;
            stream.pending.push((Some(row_key(&event.key)), payload));
            counter!("rowtap_reader_events_total", 1, "table" => table.clone());
        }

        if stream.pending.len() >= self.cfg.pipe_batch_size {
            let batch = std::mem::take(&mut stream.pending);
            stream.producer.push_batch(batch).await.context("push changelog batch")?;
        }
        Ok(())
    }

    /// Build the per-table stream for a registered table, or `None` when
    /// the table is not (or no longer) registered.
    async fn open_table(&self, db: &str, table: &str) -> Result<Option<TableStream>, WorkerError> {
        let rows = self.state.get_for_cluster(&self.cluster).await.context("load state rows")?;
        let Some(row) = rows
            .iter()
            .find(|r| r.db == db && r.table == table && r.input == "mysql" && !r.errored)
        else {
            return Ok(None);
        };

        let schema = match &row.raw_schema {
            Some(raw) if !raw.is_empty() => {
                TableSchema::from_raw(raw).map_err(|e| anyhow!("stored schema: {e}"))?
            }
            _ => {
                // Registered without a schema; extract and backfill.
                let master = self
                    .state
                    .get_addr(&self.cluster, Endpoint::Master)
                    .await
                    .context("resolve master for schema")?;
                let schema =
                    schema::extract_from(&master, db, table).await.context("extract schema")?;
                self.state
                    .save_raw_schema_if_empty(row.id, &schema.to_raw())
                    .await
                    .context("backfill schema")?;
                schema
            }
        };
        if schema.key_columns().is_empty() {
            return Err(WorkerError::Invariant(format!("{db}.{table} has no primary key")));
        }

        let encoder = encoder::create(&self.cfg.internal_encoding, &self.cfg.namespace, schema)
            .context("build envelope encoder")?;
        let topic = self.cfg.changelog_topic(&row.service, db, table);
        let mut producer =
            self.pipe.new_producer(&topic).await.context("open changelog producer")?;
        producer.set_format(&self.cfg.internal_encoding);

        info!(db, table, topic = topic.as_str(), seq_no = row.seq_no, "table stream opened");
        Ok(Some(TableStream {
            id: row.id,
            service: row.service.clone(),
            version: row.version,
            encoder,
            producer,
            seq_no: row.seq_no,
            signature: None,
            pending: Vec::new(),
        }))
    }

    /// Re-extract the schema, bump the version, publish the `schema`
    /// event in-stream.
    async fn evolve_schema(
        &self,
        key: &(String, String),
        tables: &mut HashMap<(String, String), TableStream>,
        master: &rowtap_db::Addr,
        timestamp: i64,
        signature: Vec<u8>,
    ) -> Result<(), WorkerError> {
        let (db, table) = key;
        let stream = tables.get_mut(key).expect("caller checked presence");

        let schema = schema::extract_from(master, db, table).await.context("extract schema")?;
        if schema.key_columns().is_empty() {
            return Err(WorkerError::Invariant(format!("{db}.{table} lost its primary key")));
        }
        if schema.columns.len() != signature.len() {
            return Err(WorkerError::Other(anyhow!(
                "{db}.{table}: information_schema has {} columns, binlog has {}",
                schema.columns.len(),
                signature.len()
            )));
        }

        let version =
            self.state.bump_version(stream.id, &schema.to_raw()).await.context("bump version")?;
        stream.version = version;
        stream.encoder.update_schema(schema).context("update envelope schema")?;
        stream.signature = Some(signature);

        stream.seq_no += 1;
        if let Some(payload) = stream
            .encoder
            .encode_schema(stream.seq_no, timestamp)
            .context("encode schema event")?
        {
            stream.pending.push((None, payload));
        }

        info!(
            db = db.as_str(),
            table = table.as_str(),
            version,
            service = stream.service.as_str(),
            "schema version bumped"
        );
        Ok(())
    }
}

/// How to turn a rows-event row pair into envelope events.
enum ImageSplit {
    AfterAsInsert,
    BeforeAsDelete,
    DeleteThenInsert,
}

fn collect_images<T, I>(rows: I, split: ImageSplit) -> Result<Vec<(EventKind, T)>, WorkerError>
where
    I: Iterator<Item = std::io::Result<(Option<T>, Option<T>)>>,
{
    let mut images = Vec::new();
    for row in rows {
        let (before, after) = row.context("decode binlog row")?;
        match split {
            ImageSplit::AfterAsInsert => {
                let after = after.ok_or_else(|| anyhow!("write rows event missing after-image"))?;
                images.push((EventKind::Insert, after));
            }
            ImageSplit::BeforeAsDelete => {
                let before =
                    before.ok_or_else(|| anyhow!("delete rows event missing before-image"))?;
                images.push((EventKind::Delete, before));
            }
            ImageSplit::DeleteThenInsert => {
                let before =
                    before.ok_or_else(|| anyhow!("update rows event missing before-image"))?;
                let after = after.ok_or_else(|| anyhow!("update rows event missing after-image"))?;
                images.push((EventKind::Delete, before));
                images.push((EventKind::Insert, after));
            }
        }
    }
    Ok(images)
}

/// Binlog column-type codes; drift signals an `ALTER` on the source.
fn column_signature(tme: &TableMapEvent<'_>) -> Vec<u8> {
    (0..tme.columns_count() as usize)
        .map(|i| tme.get_column_type(i).ok().flatten().map(|t| t as u8).unwrap_or(u8::MAX))
        .collect()
}

/// One binlog row image in schema column order.
fn binlog_row_datums(row: &BinlogRow, families: &[TypeFamily]) -> Vec<Datum> {
    (0..row.len())
        .map(|i| {
            let family = families.get(i).copied().unwrap_or(TypeFamily::Bytes);
            match row.as_ref(i) {
                Some(BinlogValue::Value(v)) => datum_from_value(v, family),
                _ => Datum::Null,
            }
        })
        .collect()
}
