//! # rowtap-core
//!
//! Foundational types for the rowtap change-data-capture pipeline: the
//! common event envelope every component exchanges, the table schema model,
//! the application configuration, and the row/schema encoders (JSON,
//! MsgPack, Avro).
//!
//! The envelope is deliberately small: every record a table produces is an
//! `insert`, a `delete`, or a `schema` event, carrying the table's
//! per-table sequence number. Downstream consumers dedupe and order by that
//! sequence number alone.

pub mod config;
pub mod encoder;
pub mod types;

pub use config::AppConfig;
pub use encoder::{row_key, row_key_from_schema, Encoder};
pub use types::{ColumnSchema, CommonEvent, Datum, EventKind, Field, TableSchema, TypeFamily};
