//! State catalog.
//!
//! One row per registered `(service, cluster, db, table, input, output)`
//! tuple, carrying the output format, schema version, serialized raw
//! schema, last saved GTID set, bootstrap flag and seqno high-water mark.
//! Also holds the cluster connection registry and the lock rows.
//!
//! All writes are row-scoped; `update_seqno` is monotonic and idempotent
//! so reader and streamer may both checkpoint the same table.

use mysql_async::prelude::*;
use mysql_async::{Pool, Row};
use tracing::info;

use crate::{Addr, DbError, Endpoint, Result};

/// One registered table.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRow {
    pub id: i64,
    pub service: String,
    pub cluster: String,
    pub db: String,
    pub table: String,
    pub input: String,
    pub output: String,
    pub output_format: String,
    pub version: i64,
    pub raw_schema: Option<String>,
    pub gtid: String,
    pub need_bootstrap: bool,
    pub seq_no: u64,
    pub errored: bool,
}

const STATE_COLUMNS: &str = "id, service, cluster, `db`, tableName, input, output, \
     outputFormat, version, rawSchema, gtid, needBootstrap, seqNo, errored";

fn row_from(mut row: Row) -> StateRow {
    StateRow {
        id: row.take("id").unwrap_or_default(),
        service: row.take("service").unwrap_or_default(),
        cluster: row.take("cluster").unwrap_or_default(),
        db: row.take("db").unwrap_or_default(),
        table: row.take("tableName").unwrap_or_default(),
        input: row.take("input").unwrap_or_default(),
        output: row.take("output").unwrap_or_default(),
        output_format: row.take("outputFormat").unwrap_or_default(),
        version: row.take("version").unwrap_or_default(),
        raw_schema: row.take::<Option<String>, _>("rawSchema").flatten(),
        gtid: row.take::<Option<String>, _>("gtid").flatten().unwrap_or_default(),
        need_bootstrap: row.take("needBootstrap").unwrap_or_default(),
        seq_no: row.take("seqNo").unwrap_or_default(),
        errored: row.take("errored").unwrap_or_default(),
    }
}

pub struct StateStore {
    pool: Pool,
}

impl StateStore {
    /// Connect to the catalog database, creating it and its tables when
    /// missing.
    pub async fn connect(addr: &Addr) -> Result<StateStore> {
        let db = addr.db.clone().unwrap_or_else(|| "rowtap".to_string());

        let mut bootstrap = Addr { db: None, ..addr.clone() };
        let mut conn = crate::connect(&bootstrap).await?;
        conn.query_drop(format!("CREATE DATABASE IF NOT EXISTS `{db}`")).await?;
        conn.disconnect().await?;

        bootstrap.db = Some(db.clone());
        let pool = Pool::new(bootstrap.opts());
        let mut conn = pool.get_conn().await?;
        conn.query_drop(
            "CREATE TABLE IF NOT EXISTS state (
                id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                service VARCHAR(128) NOT NULL,
                cluster VARCHAR(128) NOT NULL,
                `db` VARCHAR(128) NOT NULL,
                tableName VARCHAR(128) NOT NULL,
                input VARCHAR(32) NOT NULL DEFAULT 'mysql',
                output VARCHAR(32) NOT NULL,
                outputFormat VARCHAR(32) NOT NULL,
                version BIGINT NOT NULL DEFAULT 0,
                rawSchema LONGTEXT,
                gtid TEXT,
                needBootstrap BOOLEAN NOT NULL DEFAULT TRUE,
                seqNo BIGINT UNSIGNED NOT NULL DEFAULT 0,
                errored BOOLEAN NOT NULL DEFAULT FALSE,
                UNIQUE KEY state_loc (service, cluster, `db`, tableName, input, output)
            )",
        )
        .await?;
        conn.query_drop(
            "CREATE TABLE IF NOT EXISTS locks (
                name VARCHAR(191) NOT NULL PRIMARY KEY,
                owner VARCHAR(64) NOT NULL,
                expires DATETIME NOT NULL
            )",
        )
        .await?;
        conn.query_drop(
            "CREATE TABLE IF NOT EXISTS clusters (
                name VARCHAR(128) NOT NULL PRIMARY KEY,
                host VARCHAR(255) NOT NULL,
                port INT NOT NULL,
                user VARCHAR(64) NOT NULL,
                pw VARCHAR(128) NOT NULL,
                replicaHost VARCHAR(255),
                replicaPort INT
            )",
        )
        .await?;
        drop(conn);

        info!(db = db.as_str(), "state catalog ready");
        Ok(StateStore { pool })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn get_all(&self) -> Result<Vec<StateRow>> {
        let mut conn = self.pool.get_conn().await?;
        let rows: Vec<Row> = conn
            .query(format!("SELECT {STATE_COLUMNS} FROM state ORDER BY id"))
            .await?;
        Ok(rows.into_iter().map(row_from).collect())
    }

    pub async fn get_for_cluster(&self, cluster: &str) -> Result<Vec<StateRow>> {
        let mut conn = self.pool.get_conn().await?;
        let rows: Vec<Row> = conn
            .exec(
                format!("SELECT {STATE_COLUMNS} FROM state WHERE cluster = ? ORDER BY id"),
                (cluster,),
            )
            .await?;
        Ok(rows.into_iter().map(row_from).collect())
    }

    pub async fn get_by_id(&self, id: i64) -> Result<StateRow> {
        let mut conn = self.pool.get_conn().await?;
        let row: Option<Row> = conn
            .exec_first(format!("SELECT {STATE_COLUMNS} FROM state WHERE id = ?"), (id,))
            .await?;
        row.map(row_from).ok_or(DbError::NoSuchTable(id))
    }

    /// Distinct source clusters with registered tables.
    pub async fn clusters(&self) -> Result<Vec<String>> {
        let mut conn = self.pool.get_conn().await?;
        Ok(conn
            .query("SELECT DISTINCT cluster FROM state WHERE errored = FALSE ORDER BY cluster")
            .await?)
    }

    pub async fn get_table_new_flag(
        &self,
        service: &str,
        cluster: &str,
        db: &str,
        table: &str,
        input: &str,
        output: &str,
        version: i64,
    ) -> Result<bool> {
        let mut conn = self.pool.get_conn().await?;
        let flag: Option<bool> = conn
            .exec_first(
                "SELECT needBootstrap FROM state WHERE service=? AND cluster=? AND `db`=? \
                 AND tableName=? AND input=? AND output=? AND version=?",
                (service, cluster, db, table, input, output, version),
            )
            .await?;
        Ok(flag.unwrap_or(false))
    }

    /// Irreversibly clears the bootstrap flag for one `(id, version)`.
    pub async fn clear_new_flag(&self, id: i64, version: i64) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(
            "UPDATE state SET needBootstrap = FALSE WHERE id = ? AND version = ?",
            (id, version),
        )
        .await?;
        Ok(())
    }

    /// Monotonic, idempotent seqno checkpoint.
    pub async fn update_seqno(&self, id: i64, seq_no: u64) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(
            "UPDATE state SET seqNo = GREATEST(seqNo, ?) WHERE id = ?",
            (seq_no, id),
        )
        .await?;
        Ok(())
    }

    /// Reader checkpoint: GTID set plus seqno in one write.
    pub async fn update_progress(&self, id: i64, gtid: &str, seq_no: u64) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(
            "UPDATE state SET gtid = ?, seqNo = GREATEST(seqNo, ?) WHERE id = ?",
            (gtid, seq_no, id),
        )
        .await?;
        Ok(())
    }

    /// The earliest saved GTID position across a cluster's tables; empty
    /// when no table has one yet.
    pub async fn get_gtid(&self, cluster: &str) -> Result<String> {
        let rows = self.get_for_cluster(cluster).await?;
        Ok(crate::gtid::earliest(rows.iter().map(|r| r.gtid.as_str()))
            .map(|set| set.to_string())
            .unwrap_or_default())
    }

    /// Save one GTID position for every table of a cluster.
    pub async fn save_gtid(&self, cluster: &str, gtid: &str) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop("UPDATE state SET gtid = ? WHERE cluster = ?", (gtid, cluster)).await?;
        Ok(())
    }

    /// Publish the reader's start position for rows that have none yet.
    /// This is what releases streamers waiting on the table.
    pub async fn init_gtid(&self, id: i64, gtid: &str) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(
            "UPDATE state SET gtid = ? WHERE id = ? AND (gtid IS NULL OR gtid = '')",
            (gtid, id),
        )
        .await?;
        Ok(())
    }

    /// Backfill the stored schema for rows registered without one. Does
    /// not bump the version.
    pub async fn save_raw_schema_if_empty(&self, id: i64, raw_schema: &str) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(
            "UPDATE state SET rawSchema = ? WHERE id = ? \
             AND (rawSchema IS NULL OR rawSchema = '')",
            (raw_schema, id),
        )
        .await?;
        Ok(())
    }

    /// Bump the schema version atomically with the new raw schema.
    pub async fn bump_version(&self, id: i64, raw_schema: &str) -> Result<i64> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(
            "UPDATE state SET version = version + 1, rawSchema = ? WHERE id = ?",
            (raw_schema, id),
        )
        .await?;
        let version: Option<i64> = conn
            .exec_first("SELECT version FROM state WHERE id = ?", (id,))
            .await?;
        version.ok_or(DbError::NoSuchTable(id))
    }

    /// Schema-resolution failures park the table without stopping others.
    pub async fn mark_errored(&self, id: i64) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop("UPDATE state SET errored = TRUE WHERE id = ?", (id,)).await?;
        Ok(())
    }

    /// Register a table for ingestion. Returns `(id, created)`; an
    /// existing registration is returned as-is.
    #[allow(clippy::too_many_arguments)]
    pub async fn register_table(
        &self,
        service: &str,
        cluster: &str,
        db: &str,
        table: &str,
        input: &str,
        output: &str,
        output_format: &str,
        raw_schema: &str,
    ) -> Result<(i64, bool)> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(
            "INSERT INTO state (service, cluster, `db`, tableName, input, output, \
             outputFormat, rawSchema) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE id = LAST_INSERT_ID(id)",
            (service, cluster, db, table, input, output, output_format, raw_schema),
        )
        .await?;
        let created = conn.affected_rows() == 1;
        let id = conn.last_insert_id().unwrap_or_default() as i64;
        if created {
            info!(service, cluster, db, table, output, id, "registered table");
        }
        Ok((id, created))
    }

    pub async fn deregister_table(&self, id: i64) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop("DELETE FROM state WHERE id = ?", (id,)).await?;
        Ok(())
    }

    /// Register a source cluster's endpoints.
    pub async fn register_cluster(
        &self,
        name: &str,
        master: &Addr,
        replica: Option<&Addr>,
    ) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(
            "INSERT INTO clusters (name, host, port, user, pw, replicaHost, replicaPort) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE host=VALUES(host), port=VALUES(port), \
             user=VALUES(user), pw=VALUES(pw), replicaHost=VALUES(replicaHost), \
             replicaPort=VALUES(replicaPort)",
            (
                name,
                &master.host,
                master.port,
                &master.user,
                &master.password,
                replica.map(|r| r.host.clone()),
                replica.map(|r| r.port),
            ),
        )
        .await?;
        Ok(())
    }

    /// Resolve a cluster's endpoint. The replica falls back to the master
    /// when none is registered.
    pub async fn get_addr(&self, cluster: &str, endpoint: Endpoint) -> Result<Addr> {
        let mut conn = self.pool.get_conn().await?;
        let row: Option<Row> = conn
            .exec_first(
                "SELECT host, port, user, pw, replicaHost, replicaPort \
                 FROM clusters WHERE name = ?",
                (cluster,),
            )
            .await?;
        let mut row = row.ok_or_else(|| DbError::UnknownCluster(cluster.to_string()))?;
        let host: String = row.take("host").unwrap_or_default();
        let port: u16 = row.take("port").unwrap_or(3306);
        let user: String = row.take("user").unwrap_or_default();
        let password: String = row.take("pw").unwrap_or_default();
        let replica_host: Option<String> = row.take::<Option<String>, _>("replicaHost").flatten();
        let replica_port: Option<u16> = row.take::<Option<u16>, _>("replicaPort").flatten();

        let addr = match endpoint {
            Endpoint::Replica => Addr {
                host: replica_host.unwrap_or_else(|| host.clone()),
                port: replica_port.unwrap_or(port),
                user,
                password,
                db: None,
            },
            Endpoint::Master => Addr { host, port, user, password, db: None },
        };
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> Addr {
        Addr {
            host: "localhost".into(),
            port: 3306,
            user: "root".into(),
            password: String::new(),
            db: Some("rowtap_test_state".into()),
        }
    }

    /// Probe for a local MySQL; tests return early when none is running.
    async fn test_store() -> Option<StateStore> {
        match StateStore::connect(&test_addr()).await {
            Ok(store) => Some(store),
            Err(_) => {
                eprintln!("no local MySQL detected, skipping");
                None
            }
        }
    }

    #[tokio::test]
    async fn register_update_deregister() {
        let Some(store) = test_store().await else { return };

        let (id, created) = store
            .register_table("svc1", "c1", "db1", "t_state", "mysql", "kafka", "json", "{}")
            .await
            .unwrap();
        let (id2, created2) = store
            .register_table("svc1", "c1", "db1", "t_state", "mysql", "kafka", "json", "{}")
            .await
            .unwrap();
        assert_eq!(id, id2);
        assert!(!created2 || created, "second registration must not create");

        let row = store.get_by_id(id).await.unwrap();
        assert_eq!(row.table, "t_state");
        assert!(row.need_bootstrap);
        assert_eq!(row.seq_no, 0);

        store.update_seqno(id, 10).await.unwrap();
        store.update_seqno(id, 7).await.unwrap();
        assert_eq!(store.get_by_id(id).await.unwrap().seq_no, 10);

        store.init_gtid(id, "uuid:1-5").await.unwrap();
        store.init_gtid(id, "uuid:1-9").await.unwrap();
        assert_eq!(store.get_by_id(id).await.unwrap().gtid, "uuid:1-5");

        store.save_gtid("c1", "uuid:1-20").await.unwrap();
        assert_eq!(store.get_gtid("c1").await.unwrap(), "uuid:1-20");

        let v = store.bump_version(id, "{\"db\":\"db1\"}").await.unwrap();
        assert_eq!(v, row.version + 1);

        store.clear_new_flag(id, v).await.unwrap();
        assert!(!store.get_by_id(id).await.unwrap().need_bootstrap);

        store.deregister_table(id).await.unwrap();
        assert!(store.get_by_id(id).await.is_err());
    }

    #[tokio::test]
    async fn cluster_registry_resolves_endpoints() {
        let Some(store) = test_store().await else { return };

        let master = Addr {
            host: "db-master".into(),
            port: 3306,
            user: "tap".into(),
            password: "pw".into(),
            db: None,
        };
        let replica = Addr { host: "db-replica".into(), port: 3307, ..master.clone() };
        store.register_cluster("c_ep", &master, Some(&replica)).await.unwrap();

        let m = store.get_addr("c_ep", Endpoint::Master).await.unwrap();
        assert_eq!(m.host, "db-master");
        let r = store.get_addr("c_ep", Endpoint::Replica).await.unwrap();
        assert_eq!((r.host.as_str(), r.port), ("db-replica", 3307));

        // Replica falls back to master when absent.
        store.register_cluster("c_solo", &master, None).await.unwrap();
        let r = store.get_addr("c_solo", Endpoint::Replica).await.unwrap();
        assert_eq!(r.host, "db-master");

        assert!(store.get_addr("nope", Endpoint::Master).await.is_err());
    }
}
