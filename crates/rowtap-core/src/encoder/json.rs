//! JSON encoder: the envelope struct serialized verbatim.
//!
//! Doubles as the default internal (changelog buffer) encoding.

use crate::types::{CommonEvent, TableSchema};

use super::{EncodeError, Encoder};

pub struct JsonEncoder {
    schema: TableSchema,
}

impl JsonEncoder {
    pub fn new(schema: TableSchema) -> Self {
        JsonEncoder { schema }
    }
}

impl Encoder for JsonEncoder {
    fn kind(&self) -> &'static str {
        "json"
    }

    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn schema_carrying(&self) -> bool {
        true
    }

    fn encode_event(&self, ev: &CommonEvent) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(ev)?)
    }

    fn decode_event(&self, payload: &[u8]) -> Result<CommonEvent, EncodeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    fn update_schema(&mut self, schema: TableSchema) -> Result<(), EncodeError> {
        self.schema = schema;
        Ok(())
    }
}
