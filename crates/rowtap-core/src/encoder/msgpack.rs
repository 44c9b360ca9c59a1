//! MsgPack encoder: named-map serialization of the envelope, so decoding
//! does not depend on field order or a side-channel schema.

use crate::types::{CommonEvent, TableSchema};

use super::{EncodeError, Encoder};

pub struct MsgPackEncoder {
    schema: TableSchema,
}

impl MsgPackEncoder {
    pub fn new(schema: TableSchema) -> Self {
        MsgPackEncoder { schema }
    }
}

impl Encoder for MsgPackEncoder {
    fn kind(&self) -> &'static str {
        "msgpack"
    }

    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn schema_carrying(&self) -> bool {
        true
    }

    fn encode_event(&self, ev: &CommonEvent) -> Result<Vec<u8>, EncodeError> {
        Ok(rmp_serde::to_vec_named(ev)?)
    }

    fn decode_event(&self, payload: &[u8]) -> Result<CommonEvent, EncodeError> {
        Ok(rmp_serde::from_slice(payload)?)
    }

    fn update_schema(&mut self, schema: TableSchema) -> Result<(), EncodeError> {
        self.schema = schema;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Encoder;
    use crate::types::{ColumnSchema, Datum, EventKind};

    fn schema() -> TableSchema {
        TableSchema {
            db: "db1".into(),
            table: "t".into(),
            columns: vec![
                ColumnSchema {
                    name: "f1".into(),
                    data_type: "int".into(),
                    column_type: "int(11)".into(),
                    key_ordinal: Some(1),
                },
                ColumnSchema {
                    name: "f2".into(),
                    data_type: "varchar".into(),
                    column_type: "varchar(32)".into(),
                    key_ordinal: None,
                },
            ],
        }
    }

    #[test]
    fn round_trip_preserves_event() {
        let enc = MsgPackEncoder::new(schema());
        let src = enc
            .event_from_row(
                EventKind::Insert,
                &[Datum::Int32(11), Datum::Text("bbb11".into())],
                4,
                0,
            )
            .unwrap();
        let bytes = enc.encode_event(&src).unwrap();
        let back = enc.decode_event(&bytes).unwrap();
        assert_eq!(back.kind, EventKind::Insert);
        assert_eq!(back.seq_no, 4);
        let fields = back.fields.unwrap();
        assert_eq!(fields[1].name, "f2");
        assert_eq!(fields[1].value, Datum::Text("bbb11".into()));
    }

    #[test]
    fn delete_round_trip() {
        let enc = MsgPackEncoder::new(schema());
        let bytes = enc
            .encode_row(EventKind::Delete, &[Datum::Int32(9), Datum::Null], 12, 0)
            .unwrap();
        let back = enc.decode_event(&bytes).unwrap();
        assert_eq!(back.kind, EventKind::Delete);
        assert!(back.fields.is_none());
        assert_eq!(back.key, vec![Datum::Int32(9)]);
    }
}
