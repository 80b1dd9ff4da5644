//! 📏 Line protocol: `name[,k=v...] f=v[,f=v...] ts`, one point per line.
//!
//! Escaping: `,` `=` space and `\` are backslash-escaped in names and keys;
//! string field values are double-quoted with `"` and `\` escaped.
//! Integer fields end in `i`, unsigned in `u`, bare numbers are floats.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{DatawayError, Result};
use crate::point::{FieldValue, Point};

/// ✍️ Appends one point (no trailing newline).
pub fn encode_point(pt: &Point, out: &mut Vec<u8>) {
    escape_into(pt.name(), b", ", out);
    for (k, v) in pt.tags() {
        out.push(b',');
        escape_into(k, b",= ", out);
        out.push(b'=');
        escape_into(v, b",= ", out);
    }
    out.push(b' ');
    for (idx, (k, v)) in pt.fields().iter().enumerate() {
        if idx > 0 {
            out.push(b',');
        }
        escape_into(k, b",= ", out);
        out.push(b'=');
        match v {
            FieldValue::Int(i) => out.extend_from_slice(format!("{i}i").as_bytes()),
            FieldValue::Uint(u) => out.extend_from_slice(format!("{u}u").as_bytes()),
            FieldValue::Float(f) => out.extend_from_slice(f.to_string().as_bytes()),
            FieldValue::Bool(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
            FieldValue::Str(s) => {
                out.push(b'"');
                escape_into(s, b"\"", out);
                out.push(b'"');
            }
        }
    }
    out.push(b' ');
    out.extend_from_slice(pt.time().to_string().as_bytes());
}

/// 📦 Encodes a batch, points joined by `\n`.
pub fn encode(points: &[Point]) -> Vec<u8> {
    let mut out = Vec::new();
    for (idx, pt) in points.iter().enumerate() {
        if idx > 0 {
            out.push(b'\n');
        }
        encode_point(pt, &mut out);
    }
    out
}

fn escape_into(s: &str, special: &[u8], out: &mut Vec<u8>) {
    for &b in s.as_bytes() {
        if b == b'\\' || special.contains(&b) {
            out.push(b'\\');
        }
        out.push(b);
    }
}

/// 📖 Decodes newline-separated points. Blank lines and `#` comments are skipped.
pub fn decode(data: &[u8]) -> Result<Vec<Point>> {
    let mut points = Vec::new();
    let mut start = 0;
    // 🔍 memchr hunts the newlines, we just parse what falls out
    for end in memchr::memchr_iter(b'\n', data).chain(std::iter::once(data.len())) {
        let line = &data[start..end];
        start = end + 1;
        let line = std::str::from_utf8(line)
            .map_err(|_| DatawayError::InvalidPoint("line is not utf-8".into()))?
            .trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        points.push(decode_line(line)?);
    }
    Ok(points)
}

fn decode_line(line: &str) -> Result<Point> {
    let sections: Vec<&str> = split_unescaped(line, b' ', true)
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect();
    let (keys, fields, ts) = match sections.as_slice() {
        [keys, fields] => (*keys, *fields, None),
        [keys, fields, ts] => (*keys, *fields, Some(*ts)),
        _ => return Err(bad(line, "expected `name[,tags] fields [ts]`")),
    };

    let mut key_parts = split_unescaped(keys, b',', false).into_iter();
    let name = unescape(key_parts.next().unwrap_or_default());
    if name.is_empty() {
        return Err(bad(line, "empty measurement"));
    }
    let mut pt = Point::new(name);
    for tag in key_parts {
        let (k, v) = split_kv(tag).ok_or_else(|| bad(line, "tag without `=`"))?;
        pt = pt.with_tag(unescape(k), unescape(v));
    }

    for field in split_unescaped(fields, b',', true) {
        let (k, v) = split_kv(field).ok_or_else(|| bad(line, "field without `=`"))?;
        pt = pt.with_field(unescape(k), parse_field(v).ok_or_else(|| bad(line, "bad field value"))?);
    }
    if pt.fields().is_empty() {
        return Err(bad(line, "no fields"));
    }

    let time = match ts {
        Some(ts) => ts.parse::<i64>().map_err(|_| bad(line, "bad timestamp"))?,
        None => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default(),
    };
    Ok(pt.with_time(time))
}

fn bad(line: &str, why: &str) -> DatawayError {
    DatawayError::InvalidPoint(format!("{why}: {line:?}"))
}

fn parse_field(v: &str) -> Option<FieldValue> {
    if let Some(inner) = v.strip_prefix('"') {
        return inner.strip_suffix('"').map(|s| FieldValue::Str(unescape(s)));
    }
    match v {
        "t" | "T" | "true" | "True" | "TRUE" => return Some(FieldValue::Bool(true)),
        "f" | "F" | "false" | "False" | "FALSE" => return Some(FieldValue::Bool(false)),
        _ => {}
    }
    if let Some(i) = v.strip_suffix('i') {
        return i.parse().ok().map(FieldValue::Int);
    }
    if let Some(u) = v.strip_suffix('u') {
        return u.parse().ok().map(FieldValue::Uint);
    }
    v.parse().ok().map(FieldValue::Float)
}

/// ✂️ Splits on `delim`, honoring backslash escapes and (optionally) double quotes.
/// Returned slices still carry their escapes.
fn split_unescaped(s: &str, delim: u8, quotes: bool) -> Vec<&str> {
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let (mut start, mut i, mut in_quotes) = (0, 0, false);
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 2;
                continue;
            }
            b'"' if quotes => in_quotes = !in_quotes,
            c if c == delim && !in_quotes => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    out.push(&s[start.min(s.len())..]);
    out
}

fn split_kv(s: &str) -> Option<(&str, &str)> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'=' => return Some((&s[..i], &s[i + 1..])),
            _ => i += 1,
        }
    }
    None
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_two_points_become_two_lines() {
        let pts = vec![
            Point::new("test-1").with_field("f1", 1i64).with_field("f2", false).with_time(123),
            Point::new("test-2").with_field("f1", 1i64).with_field("f2", false).with_time(123),
        ];
        assert_eq!(
            String::from_utf8_lossy(&encode(&pts)),
            "test-1 f1=1i,f2=false 123\ntest-2 f1=1i,f2=false 123"
        );
    }

    #[test]
    fn the_one_where_spicy_characters_survive_the_round_trip() -> anyhow::Result<()> {
        let pts = vec![
            Point::new("we ird,name")
                .with_tag("k=1", "v a,l")
                .with_tag("host", "h1")
                .with_field("msg", "say \"hi\" \\ bye, ok")
                .with_field("u", 42u64)
                .with_field("f", 1.5f64)
                .with_field("i", -3i64)
                .with_field("b", true)
                .with_time(1_700_000_000_000_000_000),
            Point::new("plain").with_field("x", 0.25f64).with_time(1),
        ];
        let decoded = decode(&encode(&pts))?;
        assert_eq!(decoded, pts, "line protocol should give back exactly what it was handed");
        Ok(())
    }

    #[test]
    fn the_one_where_comments_and_blank_lines_are_ignored() -> anyhow::Result<()> {
        let pts = decode(b"# hello\n\ncpu,host=a usage=1 10\n\n")?;
        assert_eq!(pts.len(), 1);
        assert_eq!(pts[0].get_tag("host"), Some("a"));
        assert_eq!(pts[0].fields()[0].1, FieldValue::Float(1.0));
        Ok(())
    }

    #[test]
    fn the_one_where_a_point_without_fields_is_rejected() {
        assert!(decode(b"cpu,host=a").is_err(), "no fields, no point");
        assert!(decode(b"cpu x=\"open 1").is_err(), "unterminated string should not pass");
    }
}
