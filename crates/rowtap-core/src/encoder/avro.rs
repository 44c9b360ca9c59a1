//! Avro encoder.
//!
//! Schema-rigid: the Avro record schema is fixed when the encoder is
//! created and there is no way to notify a live encoder of an `ALTER`.
//! Rows whose field list is a superset of the pinned schema silently lose
//! the unknown tail; `update_schema` is a no-op. Subscribers that need the
//! new columns pick them up on service restart.
//!
//! Deletes have no row image on the wire: every data field is null,
//! `is_deleted` is true, `ref_key` carries the seqno and `row_key` the
//! base64 of the prefix-framed primary key.

use apache_avro::types::{Record, Value};
use apache_avro::{from_avro_datum, to_avro_datum, Schema};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;

use crate::types::{CommonEvent, Datum, EventKind, Field, TableSchema, TypeFamily};

use super::{row_key, EncodeError, Encoder};

pub struct AvroEncoder {
    schema: TableSchema,
    avro: Schema,
}

impl AvroEncoder {
    pub fn new(namespace: &str, schema: TableSchema) -> Result<Self, EncodeError> {
        let avro = Schema::parse_str(&render_schema(namespace, &schema))?;
        Ok(AvroEncoder { schema, avro })
    }

    /// The rendered Avro schema JSON.
    pub fn avro_schema_json(&self) -> String {
        self.avro.canonical_form()
    }
}

/// Render a table schema into Avro record-schema JSON.
///
/// Also used by the schema service's `convert_to_avro`.
pub fn render_schema(namespace: &str, schema: &TableSchema) -> String {
    let mut fields: Vec<serde_json::Value> = schema
        .columns
        .iter()
        .map(|c| {
            json!({
                "name": sanitize(&c.name),
                "type": ["null", avro_type(c.family())],
                "default": null,
            })
        })
        .collect();
    fields.push(json!({"name": "ref_key", "type": ["null", "long"], "default": null}));
    fields.push(json!({"name": "row_key", "type": ["null", "string"], "default": null}));
    fields.push(json!({"name": "is_deleted", "type": ["null", "boolean"], "default": null}));

    json!({
        "type": "record",
        "name": format!("{}.{}_{}", sanitize(namespace), sanitize(&schema.db), sanitize(&schema.table)),
        "fields": fields,
    })
    .to_string()
}

fn avro_type(family: TypeFamily) -> &'static str {
    match family {
        TypeFamily::Int32 => "int",
        TypeFamily::Int64 => "long",
        TypeFamily::Float32 => "float",
        TypeFamily::Float64 => "double",
        TypeFamily::Text => "string",
        TypeFamily::Bytes => "bytes",
    }
}

/// Avro names allow `[A-Za-z0-9_]` only.
fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn to_avro_value(family: TypeFamily, d: &Datum) -> Value {
    match (family, d) {
        (_, Datum::Null) => Value::Null,
        (TypeFamily::Int32, Datum::Int32(v)) => Value::Int(*v),
        (TypeFamily::Int32, Datum::Int64(v)) => Value::Int(*v as i32),
        (TypeFamily::Int64, Datum::Int32(v)) => Value::Long(i64::from(*v)),
        (TypeFamily::Int64, Datum::Int64(v)) => Value::Long(*v),
        (TypeFamily::Float32, Datum::Float(v)) => Value::Float(*v),
        (TypeFamily::Float32, Datum::Double(v)) => Value::Float(*v as f32),
        (TypeFamily::Float64, Datum::Double(v)) => Value::Double(*v),
        (TypeFamily::Float64, Datum::Float(v)) => Value::Double(f64::from(*v)),
        (TypeFamily::Bytes, Datum::Bytes(b)) => Value::Bytes(b.clone()),
        (TypeFamily::Bytes, Datum::Text(s)) => Value::Bytes(s.clone().into_bytes()),
        (TypeFamily::Text, _) => Value::String(d.render()),
        // Off-family leftovers degrade to their rendered form.
        (TypeFamily::Bytes, _) => Value::Bytes(d.render().into_bytes()),
        (TypeFamily::Int32, _) | (TypeFamily::Int64, _) => Value::Null,
        (TypeFamily::Float32, _) | (TypeFamily::Float64, _) => Value::Null,
    }
}

fn from_avro_value(v: Value) -> Datum {
    match unwrap_union(v) {
        Value::Null => Datum::Null,
        Value::Int(v) => Datum::Int32(v),
        Value::Long(v) => Datum::Int64(v),
        Value::Float(v) => Datum::Float(v),
        Value::Double(v) => Datum::Double(v),
        Value::String(s) => Datum::Text(s),
        Value::Bytes(b) => Datum::Bytes(b),
        Value::Boolean(b) => Datum::Int32(i32::from(b)),
        other => Datum::Text(format!("{other:?}")),
    }
}

fn unwrap_union(v: Value) -> Value {
    match v {
        Value::Union(_, inner) => *inner,
        other => other,
    }
}

impl Encoder for AvroEncoder {
    fn kind(&self) -> &'static str {
        "avro"
    }

    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn schema_carrying(&self) -> bool {
        false
    }

    fn encode_event(&self, ev: &CommonEvent) -> Result<Vec<u8>, EncodeError> {
        if ev.kind == EventKind::Schema {
            return Err(EncodeError::Malformed(
                "avro stream cannot carry schema events".into(),
            ));
        }
        let mut record = Record::new(&self.avro)
            .ok_or_else(|| EncodeError::Malformed("schema is not a record".into()))?;

        let empty: Vec<Field> = Vec::new();
        let fields = ev.fields.as_ref().unwrap_or(&empty);
        for (i, col) in self.schema.columns.iter().enumerate() {
            // Deletes carry no row image. Inserts match by position first;
            // a field list that grew past the pinned schema is cut off
            // here, a missing column reads as null.
            let value = if ev.kind == EventKind::Delete {
                Value::Null
            } else {
                let by_pos = fields.get(i).filter(|f| f.name == col.name);
                let field = by_pos.or_else(|| fields.iter().find(|f| f.name == col.name));
                field.map_or(Value::Null, |f| to_avro_value(col.family(), &f.value))
            };
            record.put(&sanitize(&col.name), value);
        }
        record.put("ref_key", Value::Long(ev.seq_no as i64));
        record.put("row_key", Value::String(BASE64.encode(row_key(&ev.key))));
        record.put("is_deleted", Value::Boolean(ev.kind == EventKind::Delete));

        Ok(to_avro_datum(&self.avro, record)?)
    }

    fn decode_event(&self, payload: &[u8]) -> Result<CommonEvent, EncodeError> {
        let mut reader = payload;
        let value = from_avro_datum(&self.avro, &mut reader, None)?;
        let pairs = match value {
            Value::Record(pairs) => pairs,
            other => {
                return Err(EncodeError::Malformed(format!(
                    "expected avro record, got {other:?}"
                )))
            }
        };

        let mut seq_no = 0u64;
        let mut deleted = false;
        let mut row_key_b64 = String::new();
        let mut data: Vec<Field> = Vec::new();
        for (name, value) in pairs {
            match name.as_str() {
                "ref_key" => {
                    if let Datum::Int64(v) = from_avro_value(value) {
                        seq_no = v as u64;
                    }
                }
                "row_key" => {
                    if let Datum::Text(s) = from_avro_value(value) {
                        row_key_b64 = s;
                    }
                }
                "is_deleted" => {
                    deleted = matches!(from_avro_value(value), Datum::Int32(1));
                }
                _ => data.push(Field { name, value: from_avro_value(value) }),
            }
        }

        if deleted {
            let framed = BASE64
                .decode(&row_key_b64)
                .map_err(|e| EncodeError::Malformed(format!("bad row_key: {e}")))?;
            return Ok(CommonEvent {
                kind: EventKind::Delete,
                key: vec![Datum::Text(String::from_utf8_lossy(&framed).into_owned())],
                seq_no,
                timestamp: 0,
                fields: None,
            });
        }

        let key = self
            .schema
            .key_indexes()
            .into_iter()
            .map(|i| data.get(i).map_or(Datum::Null, |f| f.value.clone()))
            .collect();
        Ok(CommonEvent {
            kind: EventKind::Insert,
            key,
            seq_no,
            timestamp: 0,
            fields: Some(data),
        })
    }

    fn update_schema(&mut self, _schema: TableSchema) -> Result<(), EncodeError> {
        // Pinned for the encoder's lifetime; ALTERs become visible only
        // after a restart builds a fresh encoder.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnSchema;

    fn col(name: &str, dt: &str, key: Option<u32>) -> ColumnSchema {
        ColumnSchema {
            name: name.into(),
            data_type: dt.into(),
            column_type: format!("{dt}(11)"),
            key_ordinal: key,
        }
    }

    fn schema() -> TableSchema {
        TableSchema {
            db: "db1".into(),
            table: "t1".into(),
            columns: vec![col("f1", "int", Some(1)), col("f3", "int", None), col("f4", "int", None)],
        }
    }

    #[test]
    fn schema_render_parses_and_names() {
        let rendered = render_schema("hp", &schema());
        // Must be a valid Avro record schema.
        Schema::parse_str(&rendered).unwrap();
        assert!(rendered.contains(r#""name":"hp.db1_t1""#));
        for meta in ["ref_key", "row_key", "is_deleted"] {
            assert!(rendered.contains(meta), "missing {meta}");
        }
    }

    #[test]
    fn sanitize_rewrites_illegal_names() {
        assert_eq!(sanitize("e2e-test.table"), "e2e_test_table");
        assert_eq!(sanitize("1col"), "_1col");
    }

    #[test]
    fn insert_round_trip() {
        let enc = AvroEncoder::new("hp", schema()).unwrap();
        let ev = enc
            .event_from_row(
                EventKind::Insert,
                &[Datum::Int32(101), Datum::Int32(0), Datum::Null],
                5,
                0,
            )
            .unwrap();
        let bytes = enc.encode_event(&ev).unwrap();
        let back = enc.decode_event(&bytes).unwrap();
        assert_eq!(back.kind, EventKind::Insert);
        assert_eq!(back.seq_no, 5);
        let fields = back.fields.unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].value, Datum::Int32(101));
        assert_eq!(fields[2].value, Datum::Null);
        assert_eq!(back.key, vec![Datum::Int32(101)]);
    }

    #[test]
    fn superset_rows_drop_the_unknown_tail() {
        // Encoder pinned to [f1, f3, f4]; the table has since grown f2.
        let enc = AvroEncoder::new("hp", schema()).unwrap();
        let ev = CommonEvent {
            kind: EventKind::Insert,
            key: vec![Datum::Int32(11)],
            seq_no: 9,
            timestamp: 0,
            fields: Some(vec![
                Field { name: "f1".into(), value: Datum::Int32(11) },
                Field { name: "f3".into(), value: Datum::Int32(0) },
                Field { name: "f4".into(), value: Datum::Null },
                Field { name: "f2".into(), value: Datum::Text("bbb11".into()) },
            ]),
        };
        let bytes = enc.encode_event(&ev).unwrap();
        let back = enc.decode_event(&bytes).unwrap();
        let names: Vec<&str> =
            back.fields.as_ref().unwrap().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["f1", "f3", "f4"]);
    }

    #[test]
    fn delete_shape() {
        let enc = AvroEncoder::new("hp", schema()).unwrap();
        let ev = CommonEvent {
            kind: EventKind::Delete,
            key: vec![Datum::Int32(101)],
            seq_no: 7,
            timestamp: 0,
            fields: None,
        };
        let bytes = enc.encode_event(&ev).unwrap();
        let back = enc.decode_event(&bytes).unwrap();
        assert_eq!(back.kind, EventKind::Delete);
        assert_eq!(back.seq_no, 7);
        assert!(back.fields.is_none());
        // The delete key is the prefix-framed primary key.
        assert_eq!(back.key, vec![Datum::Text("3101".into())]);
    }

    #[test]
    fn schema_events_are_refused() {
        let enc = AvroEncoder::new("hp", schema()).unwrap();
        let ev = crate::encoder::schema_event(&schema(), 1, 0);
        assert!(enc.encode_event(&ev).is_err());
        assert!(enc.encode_schema(1, 0).unwrap().is_none());
    }
}
