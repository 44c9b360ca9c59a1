//! Common event envelope and table schema model.
//!
//! The JSON rendering of [`CommonEvent`] is a wire contract: field order is
//! `Type, Key, SeqNo, Timestamp, Fields` and `Fields` is omitted for
//! deletes. Both the changelog buffer (internal encoding) and the JSON
//! output format serialize this struct directly.

use serde::{Deserialize, Serialize};

/// Kind of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Insert,
    Delete,
    Schema,
}

/// A portable, NULL-aware column value.
///
/// Untagged so the JSON form is the bare value. Wider variants come first
/// in the integer/float groups so deserialization never truncates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datum {
    Null,
    Int32(i32),
    Int64(i64),
    Double(f64),
    Float(f32),
    Text(String),
    Bytes(Vec<u8>),
}

impl Datum {
    /// String form used for row-key framing.
    pub fn render(&self) -> String {
        match self {
            Datum::Null => String::new(),
            Datum::Int32(v) => v.to_string(),
            Datum::Int64(v) => v.to_string(),
            Datum::Double(v) => v.to_string(),
            Datum::Float(v) => v.to_string(),
            Datum::Text(s) => s.clone(),
            Datum::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }
}

/// One named value inside an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: Datum,
}

/// The envelope every emitted record conforms to.
///
/// For `insert`: `key` holds the primary-key values, `fields` the full row.
/// For `delete`: `key` only, `fields` omitted.
/// For `schema`: `key` holds the primary-key column *names*, `fields` maps
/// column name to rendered column type (e.g. `"int(11)"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonEvent {
    #[serde(rename = "Type")]
    pub kind: EventKind,
    #[serde(rename = "Key")]
    pub key: Vec<Datum>,
    #[serde(rename = "SeqNo")]
    pub seq_no: u64,
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(rename = "Fields", skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<Field>>,
}

/// MySQL type families mapped to portable value shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    Int32,
    Int64,
    Float32,
    Float64,
    Text,
    Bytes,
}

impl TypeFamily {
    /// Classify a MySQL `DATA_TYPE` string.
    pub fn from_data_type(data_type: &str) -> TypeFamily {
        match data_type {
            "int" | "integer" | "tinyint" | "smallint" | "mediumint" => TypeFamily::Int32,
            "bigint" | "bit" | "year" => TypeFamily::Int64,
            "float" => TypeFamily::Float32,
            "double" | "decimal" | "numeric" => TypeFamily::Float64,
            "char" | "varchar" | "date" | "datetime" | "timestamp" | "time" => TypeFamily::Text,
            // text/blob families, binary, varbinary and anything unknown
            _ => TypeFamily::Bytes,
        }
    }
}

/// One column of a registered table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    /// Type family, e.g. `"int"`, `"varchar"`.
    pub data_type: String,
    /// Full rendered type, e.g. `"int(11)"`, `"varchar(32)"`.
    pub column_type: String,
    /// 1-based position within the primary key, if part of it.
    #[serde(default)]
    pub key_ordinal: Option<u32>,
}

impl ColumnSchema {
    pub fn family(&self) -> TypeFamily {
        TypeFamily::from_data_type(&self.data_type)
    }
}

/// Ordered column list of one table at one schema version.
///
/// The JSON serialization of this struct is the `raw_schema` blob kept in
/// the state catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub db: String,
    pub table: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    /// Primary-key columns in key order.
    pub fn key_columns(&self) -> Vec<&ColumnSchema> {
        let mut keys: Vec<&ColumnSchema> = self
            .columns
            .iter()
            .filter(|c| c.key_ordinal.is_some())
            .collect();
        keys.sort_by_key(|c| c.key_ordinal);
        keys
    }

    /// Indexes of the primary-key columns within `columns`, in key order.
    pub fn key_indexes(&self) -> Vec<usize> {
        let mut keys: Vec<(u32, usize)> = self
            .columns
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.key_ordinal.map(|o| (o, i)))
            .collect();
        keys.sort();
        keys.into_iter().map(|(_, i)| i).collect()
    }

    /// Parse a `raw_schema` blob back into a schema.
    pub fn from_raw(raw: &str) -> Result<TableSchema, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Serialize into the `raw_schema` blob form.
    pub fn to_raw(&self) -> String {
        serde_json::to_string(self).expect("schema serialization cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, dt: &str, ct: &str, key: Option<u32>) -> ColumnSchema {
        ColumnSchema {
            name: name.into(),
            data_type: dt.into(),
            column_type: ct.into(),
            key_ordinal: key,
        }
    }

    #[test]
    fn insert_event_json_shape() {
        let ev = CommonEvent {
            kind: EventKind::Insert,
            key: vec![Datum::Int32(101)],
            seq_no: 0,
            timestamp: 0,
            fields: Some(vec![
                Field { name: "f1".into(), value: Datum::Int32(101) },
                Field { name: "f3".into(), value: Datum::Int32(0) },
                Field { name: "f4".into(), value: Datum::Null },
            ]),
        };
        assert_eq!(
            serde_json::to_string(&ev).unwrap(),
            r#"{"Type":"insert","Key":[101],"SeqNo":0,"Timestamp":0,"Fields":[{"Name":"f1","Value":101},{"Name":"f3","Value":0},{"Name":"f4","Value":null}]}"#
        );
    }

    #[test]
    fn delete_event_omits_fields() {
        let ev = CommonEvent {
            kind: EventKind::Delete,
            key: vec![Datum::Int32(101)],
            seq_no: 7,
            timestamp: 0,
            fields: None,
        };
        assert_eq!(
            serde_json::to_string(&ev).unwrap(),
            r#"{"Type":"delete","Key":[101],"SeqNo":7,"Timestamp":0}"#
        );
    }

    #[test]
    fn event_json_round_trip() {
        let src = r#"{"Type":"insert","Key":[11],"SeqNo":3,"Timestamp":0,"Fields":[{"Name":"f1","Value":11},{"Name":"f2","Value":"bbb11"}]}"#;
        let ev: CommonEvent = serde_json::from_str(src).unwrap();
        assert_eq!(ev.kind, EventKind::Insert);
        assert_eq!(ev.seq_no, 3);
        // Untagged integers land in the narrowest fitting variant and
        // render the same bytes on re-serialization.
        assert_eq!(ev.key, vec![Datum::Int32(11)]);
        assert_eq!(serde_json::to_string(&ev).unwrap(), src);
    }

    #[test]
    fn type_families() {
        assert_eq!(TypeFamily::from_data_type("mediumint"), TypeFamily::Int32);
        assert_eq!(TypeFamily::from_data_type("bigint"), TypeFamily::Int64);
        assert_eq!(TypeFamily::from_data_type("bit"), TypeFamily::Int64);
        assert_eq!(TypeFamily::from_data_type("year"), TypeFamily::Int64);
        assert_eq!(TypeFamily::from_data_type("float"), TypeFamily::Float32);
        assert_eq!(TypeFamily::from_data_type("decimal"), TypeFamily::Float64);
        assert_eq!(TypeFamily::from_data_type("datetime"), TypeFamily::Text);
        assert_eq!(TypeFamily::from_data_type("longblob"), TypeFamily::Bytes);
        assert_eq!(TypeFamily::from_data_type("varbinary"), TypeFamily::Bytes);
        assert_eq!(TypeFamily::from_data_type("geometry"), TypeFamily::Bytes);
    }

    #[test]
    fn key_columns_respect_ordinal_order() {
        let schema = TableSchema {
            db: "db1".into(),
            table: "t".into(),
            columns: vec![
                col("b", "int", "int(11)", Some(2)),
                col("x", "varchar", "varchar(32)", None),
                col("a", "int", "int(11)", Some(1)),
            ],
        };
        let keys: Vec<&str> = schema.key_columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(schema.key_indexes(), vec![2, 0]);
    }

    #[test]
    fn raw_schema_round_trip() {
        let schema = TableSchema {
            db: "db1".into(),
            table: "t".into(),
            columns: vec![col("f1", "int", "int(11)", Some(1))],
        };
        let raw = schema.to_raw();
        assert_eq!(TableSchema::from_raw(&raw).unwrap(), schema);
    }
}
