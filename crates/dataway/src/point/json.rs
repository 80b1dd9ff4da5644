//! 🦆 JSON encoding: a body is an array of `{"measurement","tags","fields","time"}` objects.
//!
//! ⚠️ `serde_json::Map` is key-sorted, so tags come back in ascending key order.

use serde_json::{Map, Number, Value};

use crate::error::{DatawayError, Result};
use crate::point::{FieldValue, Point};

fn to_value(pt: &Point) -> Value {
    let tags: Map<String, Value> =
        pt.tags().iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect();
    let fields: Map<String, Value> = pt
        .fields()
        .iter()
        .map(|(k, v)| {
            let v = match v {
                FieldValue::Int(i) => Value::from(*i),
                FieldValue::Uint(u) => Value::from(*u),
                // NaN/inf have no JSON spelling
                FieldValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
                FieldValue::Bool(b) => Value::Bool(*b),
                FieldValue::Str(s) => Value::String(s.clone()),
            };
            (k.clone(), v)
        })
        .collect();

    let mut obj = Map::new();
    obj.insert("measurement".into(), Value::String(pt.name().to_string()));
    obj.insert("tags".into(), Value::Object(tags));
    obj.insert("fields".into(), Value::Object(fields));
    obj.insert("time".into(), Value::from(pt.time()));
    Value::Object(obj)
}

/// ✍️ Appends one point as a JSON object (no array brackets).
pub fn encode_point(pt: &Point, out: &mut Vec<u8>) -> Result<()> {
    serde_json::to_writer(&mut *out, &to_value(pt))?;
    Ok(())
}

/// 📦 Encodes a batch as a JSON array.
pub fn encode(points: &[Point]) -> Result<Vec<u8>> {
    let mut out = vec![b'['];
    for (idx, pt) in points.iter().enumerate() {
        if idx > 0 {
            out.push(b',');
        }
        encode_point(pt, &mut out)?;
    }
    out.push(b']');
    Ok(out)
}

pub fn decode(data: &[u8]) -> Result<Vec<Point>> {
    let values: Vec<Value> = serde_json::from_slice(data)?;
    values.iter().map(from_value).collect()
}

fn from_value(v: &Value) -> Result<Point> {
    let invalid = |why: &str| DatawayError::InvalidPoint(format!("json point: {why}"));
    let name = v.get("measurement").and_then(Value::as_str).ok_or_else(|| invalid("missing measurement"))?;
    let mut pt = Point::new(name);
    if let Some(tags) = v.get("tags").and_then(Value::as_object) {
        for (k, tv) in tags {
            let tv = tv.as_str().ok_or_else(|| invalid("tag values must be strings"))?;
            pt = pt.with_tag(k.as_str(), tv);
        }
    }
    let fields = v.get("fields").and_then(Value::as_object).ok_or_else(|| invalid("missing fields"))?;
    for (k, fv) in fields {
        let fv = match fv {
            Value::Bool(b) => FieldValue::Bool(*b),
            Value::String(s) => FieldValue::Str(s.clone()),
            Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
                (Some(i), _, _) => FieldValue::Int(i),
                (None, Some(u), _) => FieldValue::Uint(u),
                (None, None, Some(f)) => FieldValue::Float(f),
                _ => return Err(invalid("unrepresentable number")),
            },
            _ => return Err(invalid("unsupported field type")),
        };
        pt = pt.with_field(k.as_str(), fv);
    }
    let time = v.get("time").and_then(Value::as_i64).unwrap_or_default();
    Ok(pt.with_time(time))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_json_points_come_home_intact() -> anyhow::Result<()> {
        let pts = vec![
            Point::new("disk")
                .with_tag("device", "sda")
                .with_tag("host", "h1")
                .with_field("free", 100i64)
                .with_field("ratio", 0.5f64)
                .with_field("ok", true)
                .with_field("label", "root")
                .with_time(99),
            Point::new("net").with_field("b", 1i64).with_time(100),
        ];
        let encoded = encode(&pts)?;
        assert!(encoded.starts_with(b"[") && encoded.ends_with(b"]"));
        let decoded = decode(&encoded)?;
        assert_eq!(decoded.len(), 2);
        // 🧪 JSON objects are key-sorted, so compare tag-by-tag and field-by-field
        for (got, want) in decoded.iter().zip(&pts) {
            assert_eq!(got.name(), want.name());
            assert_eq!(got.time(), want.time());
            for (k, v) in want.tags() {
                assert_eq!(got.get_tag(k), Some(v.as_str()), "tag {k} went missing");
            }
            for (k, v) in want.fields() {
                let found = got.fields().iter().find(|(gk, _)| gk == k).map(|(_, gv)| gv);
                assert_eq!(found, Some(v), "field {k} changed on the way back");
            }
        }
        Ok(())
    }

    #[test]
    fn the_one_where_a_nameless_point_is_refused() {
        assert!(decode(br#"[{"fields":{"a":1}}]"#).is_err());
    }
}
