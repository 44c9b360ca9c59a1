//! MySQL wire values → portable datums.
//!
//! Both the snapshotter (text/binary protocol rows) and the changelog
//! reader (binlog row images) produce `mysql_async::Value`s; the column's
//! type family from the cached schema decides the portable shape.

use mysql_async::Value;

use rowtap_core::{Datum, TypeFamily};

/// NULL-aware conversion of one column value.
pub fn datum_from_value(value: &Value, family: TypeFamily) -> Datum {
    match value {
        Value::NULL => Datum::Null,
        Value::Int(v) => int_datum(*v, family),
        Value::UInt(v) => int_datum(*v as i64, family),
        Value::Float(v) => match family {
            TypeFamily::Float32 => Datum::Float(*v),
            TypeFamily::Float64 => Datum::Double(f64::from(*v)),
            _ => Datum::Text(v.to_string()),
        },
        Value::Double(v) => match family {
            TypeFamily::Float32 => Datum::Float(*v as f32),
            TypeFamily::Float64 => Datum::Double(*v),
            _ => Datum::Text(v.to_string()),
        },
        Value::Bytes(bytes) => bytes_datum(bytes, family),
        Value::Date(y, mo, d, h, mi, s, us) => {
            let mut text = format!("{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}:{s:02}");
            if *us > 0 {
                text.push_str(&format!(".{us:06}"));
            }
            match family {
                TypeFamily::Bytes => Datum::Bytes(text.into_bytes()),
                _ => Datum::Text(text),
            }
        }
        Value::Time(neg, d, h, mi, s, us) => {
            let sign = if *neg { "-" } else { "" };
            let hours = u32::from(*h) + u32::from(*d) * 24;
            let mut text = format!("{sign}{hours:02}:{mi:02}:{s:02}");
            if *us > 0 {
                text.push_str(&format!(".{us:06}"));
            }
            match family {
                TypeFamily::Bytes => Datum::Bytes(text.into_bytes()),
                _ => Datum::Text(text),
            }
        }
    }
}

fn int_datum(v: i64, family: TypeFamily) -> Datum {
    match family {
        TypeFamily::Int32 => Datum::Int32(v as i32),
        TypeFamily::Int64 => Datum::Int64(v),
        TypeFamily::Float32 => Datum::Float(v as f32),
        TypeFamily::Float64 => Datum::Double(v as f64),
        TypeFamily::Text => Datum::Text(v.to_string()),
        TypeFamily::Bytes => Datum::Bytes(v.to_string().into_bytes()),
    }
}

fn bytes_datum(bytes: &[u8], family: TypeFamily) -> Datum {
    // The text protocol delivers every column as bytes; parse towards the
    // schema's family.
    let text = || String::from_utf8_lossy(bytes);
    match family {
        TypeFamily::Int32 => text().trim().parse::<i32>().map_or(Datum::Null, Datum::Int32),
        TypeFamily::Int64 => text().trim().parse::<i64>().map_or(Datum::Null, Datum::Int64),
        TypeFamily::Float32 => text().trim().parse::<f32>().map_or(Datum::Null, Datum::Float),
        TypeFamily::Float64 => text().trim().parse::<f64>().map_or(Datum::Null, Datum::Double),
        TypeFamily::Text => Datum::Text(text().into_owned()),
        TypeFamily::Bytes => Datum::Bytes(bytes.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_null_for_every_family() {
        for family in [
            TypeFamily::Int32,
            TypeFamily::Int64,
            TypeFamily::Float32,
            TypeFamily::Float64,
            TypeFamily::Text,
            TypeFamily::Bytes,
        ] {
            assert_eq!(datum_from_value(&Value::NULL, family), Datum::Null);
        }
    }

    #[test]
    fn integers_respect_width() {
        assert_eq!(datum_from_value(&Value::Int(101), TypeFamily::Int32), Datum::Int32(101));
        assert_eq!(
            datum_from_value(&Value::Int(5_000_000_000), TypeFamily::Int64),
            Datum::Int64(5_000_000_000)
        );
        assert_eq!(datum_from_value(&Value::UInt(7), TypeFamily::Int64), Datum::Int64(7));
    }

    #[test]
    fn text_protocol_bytes_parse_toward_family() {
        assert_eq!(
            datum_from_value(&Value::Bytes(b"101".to_vec()), TypeFamily::Int32),
            Datum::Int32(101)
        );
        assert_eq!(
            datum_from_value(&Value::Bytes(b"2.5".to_vec()), TypeFamily::Float64),
            Datum::Double(2.5)
        );
        assert_eq!(
            datum_from_value(&Value::Bytes(b"abc".to_vec()), TypeFamily::Text),
            Datum::Text("abc".into())
        );
        assert_eq!(
            datum_from_value(&Value::Bytes(vec![0xde, 0xad]), TypeFamily::Bytes),
            Datum::Bytes(vec![0xde, 0xad])
        );
    }

    #[test]
    fn temporal_values_render_as_text() {
        assert_eq!(
            datum_from_value(&Value::Date(2023, 1, 2, 3, 4, 5, 0), TypeFamily::Text),
            Datum::Text("2023-01-02 03:04:05".into())
        );
        assert_eq!(
            datum_from_value(&Value::Time(true, 1, 2, 3, 4, 0), TypeFamily::Text),
            Datum::Text("-26:03:04".into())
        );
    }

    #[test]
    fn floats_respect_family() {
        assert_eq!(datum_from_value(&Value::Float(1.5), TypeFamily::Float32), Datum::Float(1.5));
        assert_eq!(
            datum_from_value(&Value::Double(2.25), TypeFamily::Float64),
            Datum::Double(2.25)
        );
        assert_eq!(
            datum_from_value(&Value::Float(1.5), TypeFamily::Float64),
            Datum::Double(1.5)
        );
    }
}
