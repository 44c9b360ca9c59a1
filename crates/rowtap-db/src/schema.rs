//! Schema service.
//!
//! Extracts ordered column lists from `information_schema.columns` and
//! derives post-`ALTER` schemas by replaying the clause against a
//! throwaway scratch table, so production data is never touched.

use mysql_async::prelude::*;
use tracing::debug;

use rowtap_core::encoder::avro::render_schema;
use rowtap_core::{ColumnSchema, TableSchema};

use crate::{Addr, DbError, Endpoint, Loc, Result, StateStore};

/// Database that holds scratch tables for `ALTER` simulation.
const SCRATCH_DB: &str = "rowtap_scratch";

pub struct SchemaService<'a> {
    state: &'a StateStore,
}

impl<'a> SchemaService<'a> {
    pub fn new(state: &'a StateStore) -> Self {
        SchemaService { state }
    }

    /// Current schema of a live table, read from the cluster's master.
    pub async fn get_raw(&self, loc: &Loc, table: &str) -> Result<TableSchema> {
        let addr = self.state.get_addr(&loc.cluster, Endpoint::Master).await?;
        let mut conn = crate::connect(&addr).await?;
        extract(&mut conn, &loc.db, table).await
    }

    /// Schema after applying `alter_clause`, derived without touching the
    /// production table: the current shape is cloned into a scratch
    /// table, altered there and re-extracted.
    ///
    /// A clause that would leave the table without a primary key is
    /// rejected.
    pub async fn mutate_table(
        &self,
        loc: &Loc,
        table: &str,
        alter_clause: &str,
    ) -> Result<TableSchema> {
        let addr = self.state.get_addr(&loc.cluster, Endpoint::Master).await?;
        let mut conn = crate::connect(&addr).await?;
        let db = loc.db.as_str();

        let scratch = format!("`{SCRATCH_DB}`.`{table}`");
        conn.query_drop(format!("CREATE DATABASE IF NOT EXISTS `{SCRATCH_DB}`")).await?;
        conn.query_drop(format!("DROP TABLE IF EXISTS {scratch}")).await?;
        conn.query_drop(format!("CREATE TABLE {scratch} LIKE `{db}`.`{table}`")).await?;

        let outcome = async {
            conn.query_drop(format!("ALTER TABLE {scratch} {alter_clause}")).await?;
            let mutated = extract(&mut conn, SCRATCH_DB, table).await?;
            if mutated.key_columns().is_empty() {
                return Err(DbError::Schema(format!(
                    "mutation drops the primary key of {db}.{table}"
                )));
            }
            Ok(TableSchema { db: db.to_string(), ..mutated })
        }
        .await;

        let _ = conn.query_drop(format!("DROP TABLE IF EXISTS {scratch}")).await;
        outcome
    }

    /// Render the current schema in the requested output format.
    /// JSON/MsgPack carry the raw schema; Avro gets a record schema.
    pub async fn convert(
        &self,
        loc: &Loc,
        table: &str,
        format: &str,
        namespace: &str,
    ) -> Result<String> {
        let schema = self.get_raw(loc, table).await?;
        match format {
            "avro" => Ok(render_schema(namespace, &schema)),
            _ => Ok(schema.to_raw()),
        }
    }
}

/// Ordered `(name, type, key ordinal)` list for one table.
pub async fn extract(
    conn: &mut mysql_async::Conn,
    db: &str,
    table: &str,
) -> Result<TableSchema> {
    let rows: Vec<(String, String, String)> = conn
        .exec(
            "SELECT column_name, data_type, column_type \
             FROM information_schema.columns \
             WHERE table_schema = ? AND table_name = ? \
             ORDER BY ordinal_position",
            (db, table),
        )
        .await?;
    if rows.is_empty() {
        return Err(DbError::Schema(format!("no such table: {db}.{table}")));
    }

    // Primary-key member positions, in key order.
    let key_rows: Vec<(String, u32)> = conn
        .exec(
            "SELECT column_name, seq_in_index FROM information_schema.statistics \
             WHERE table_schema = ? AND table_name = ? AND index_name = 'PRIMARY' \
             ORDER BY seq_in_index",
            (db, table),
        )
        .await?;

    let columns = rows
        .into_iter()
        .map(|(name, data_type, column_type)| {
            let key_ordinal = key_rows
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, ord)| *ord);
            ColumnSchema { name, data_type, column_type, key_ordinal }
        })
        .collect();

    debug!(db, table, "extracted schema");
    Ok(TableSchema { db: db.to_string(), table: table.to_string(), columns })
}

/// Extract against a known address instead of a registered cluster.
pub async fn extract_from(addr: &Addr, db: &str, table: &str) -> Result<TableSchema> {
    let mut conn = crate::connect(addr).await?;
    extract(&mut conn, db, table).await
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

    fn test_loc() -> Loc {
        Loc {
            service: "svc1".into(),
            cluster: "schema_test_cluster".into(),
            db: "rowtap_test_schema".into(),
        }
    }

    async fn test_env() -> Option<StateStore> {
        let store = StateStore::connect(&test_addr()).await.ok()?;
        let master = Addr { db: None, ..test_addr() };
        store.register_cluster("schema_test_cluster", &master, None).await.ok()?;
        let mut conn = crate::connect(&master).await.ok()?;
        conn.query_drop("CREATE DATABASE IF NOT EXISTS rowtap_test_schema").await.ok()?;
        conn.query_drop("DROP TABLE IF EXISTS rowtap_test_schema.t1").await.ok()?;
        conn.query_drop(
            "CREATE TABLE rowtap_test_schema.t1 (\
             f1 int not null primary key, f3 int not null default 0, f4 int)",
        )
        .await
        .ok()?;
        Some(store)
    }

    #[tokio::test]
    async fn extract_orders_columns_and_keys() {
        let Some(store) = test_env().await else {
            eprintln!("no local MySQL detected, skipping");
            return;
        };
        let svc = SchemaService::new(&store);
        let schema = svc.get_raw(&test_loc(), "t1").await.unwrap();
        let names: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["f1", "f3", "f4"]);
        // "int(11)" pre-8.0.19, "int" after display widths were dropped.
        assert!(schema.columns[0].column_type.starts_with("int"));
        assert_eq!(schema.key_columns()[0].name, "f1");
    }

    #[tokio::test]
    async fn mutate_matches_direct_alter() {
        let Some(store) = test_env().await else {
            eprintln!("no local MySQL detected, skipping");
            return;
        };
        let svc = SchemaService::new(&store);

        let mutated = svc
            .mutate_table(&test_loc(), "t1", "ADD f2 varchar(32)")
            .await
            .unwrap();

        // Apply the same ALTER for real and compare shapes.
        let master = Addr { db: None, ..test_addr() };
        let mut conn = crate::connect(&master).await.unwrap();
        conn.query_drop("ALTER TABLE rowtap_test_schema.t1 ADD f2 varchar(32)").await.unwrap();
        let direct = svc.get_raw(&test_loc(), "t1").await.unwrap();

        assert_eq!(mutated.columns, direct.columns);
        assert_eq!(mutated.db, "rowtap_test_schema");
    }

    #[tokio::test]
    async fn dropping_the_primary_key_is_rejected() {
        let Some(store) = test_env().await else {
            eprintln!("no local MySQL detected, skipping");
            return;
        };
        let svc = SchemaService::new(&store);
        let err = svc
            .mutate_table(&test_loc(), "t1", "DROP PRIMARY KEY")
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Schema(_)));
    }
}
