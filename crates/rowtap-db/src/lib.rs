//! # rowtap-db
//!
//! MySQL-facing support for the pipeline: source addressing, the state
//! catalog (registered tables, versions, GTIDs, bootstrap flags), the
//! row-backed distributed locks, GTID set algebra and the schema service.

use mysql_async::{Opts, OptsBuilder};
use serde::{Deserialize, Serialize};

pub mod gtid;
pub mod lock;
pub mod schema;
pub mod state;

pub use gtid::GtidSet;
pub use lock::Lock;
pub use schema::SchemaService;
pub use state::{StateRow, StateStore};

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("mysql: {0}")]
    MySql(#[from] mysql_async::Error),
    #[error("unknown cluster: {0}")]
    UnknownCluster(String),
    #[error("no state row for id {0}")]
    NoSuchTable(i64),
    #[error("bad gtid set: {0}")]
    BadGtid(String),
    #[error("schema: {0}")]
    Schema(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Logical location of a table's source database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Loc {
    pub service: String,
    pub cluster: String,
    pub db: String,
}

/// Network address of a MySQL endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addr {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub db: Option<String>,
}

/// Which endpoint of a cluster to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// The binlog source.
    Master,
    /// The snapshot replica; falls back to master when none registered.
    Replica,
}

impl Addr {
    pub fn opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(Some(self.user.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.db.clone())
            .into()
    }

    pub fn with_db(mut self, db: &str) -> Addr {
        self.db = Some(db.to_string());
        self
    }
}

/// Open a single connection to an address.
pub async fn connect(addr: &Addr) -> Result<mysql_async::Conn> {
    Ok(mysql_async::Conn::new(addr.opts()).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_opts_carry_db() {
        let addr = Addr {
            host: "localhost".into(),
            port: 3306,
            user: "root".into(),
            password: String::new(),
            db: None,
        };
        let with = addr.clone().with_db("db1");
        assert_eq!(with.db.as_deref(), Some("db1"));
        let opts = with.opts();
        assert_eq!(opts.db_name(), Some("db1"));
        assert_eq!(opts.tcp_port(), 3306);
    }
}
