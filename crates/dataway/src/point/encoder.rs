//! ✂️ The point encoder: turns a slice of points into batch-limited chunks.
//!
//! Each call to `next_chunk` fills the caller's buffer with as many points as the
//! limit allows and advances a cursor. A chunk of zero points means the slice is done.
//!
//! 🧠 Knowledge graph:
//! - `BatchLimit::Bytes` keeps every chunk within the byte limit. A single point that
//!   cannot fit even alone is skipped and counted (`take_skipped`), never sent.
//! - `BatchLimit::Points` caps the point count per chunk.
//! - Line protocol joins points with `\n`; JSON wraps them in `[` `,` `]`.

use crate::error::{DatawayError, Result};
use crate::point::{Encoding, Point, json, line_protocol};

/// 📏 How big a chunk may get. Byte limits win over point limits at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchLimit {
    Points(usize),
    Bytes(usize),
}

#[derive(Debug)]
pub struct PointEncoder {
    encoding: Encoding,
    limit: BatchLimit,
    scratch: Vec<u8>,
    skipped: usize,
}

impl PointEncoder {
    pub fn new(encoding: Encoding, limit: BatchLimit) -> Result<Self> {
        if encoding == Encoding::Protobuf {
            return Err(DatawayError::UnsupportedEncoding("protobuf"));
        }
        Ok(Self { encoding, limit, scratch: Vec::new(), skipped: 0 })
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// 🧮 Points skipped for being larger than the byte limit, since the last call.
    pub fn take_skipped(&mut self) -> usize {
        std::mem::take(&mut self.skipped)
    }

    fn encode_one(&mut self, pt: &Point) -> Result<()> {
        self.scratch.clear();
        match self.encoding {
            Encoding::LineProtocol => line_protocol::encode_point(pt, &mut self.scratch),
            Encoding::Json => json::encode_point(pt, &mut self.scratch)?,
            Encoding::Protobuf => return Err(DatawayError::UnsupportedEncoding("protobuf")),
        }
        Ok(())
    }

    /// 📦 Fills `buf` (cleared first) with the next chunk of `points[*cursor..]`.
    /// Returns the number of points in the chunk; `0` once nothing is left.
    pub fn next_chunk(&mut self, points: &[Point], cursor: &mut usize, buf: &mut Vec<u8>) -> Result<usize> {
        buf.clear();
        let json = self.encoding == Encoding::Json;
        // framing bytes: `[` + `]` for JSON
        let framing = if json { 2 } else { 0 };
        let mut n = 0;

        while *cursor < points.len() {
            self.encode_one(&points[*cursor])?;
            let sep = usize::from(n > 0);

            match self.limit {
                BatchLimit::Bytes(max) => {
                    if self.scratch.len() + framing > max {
                        // too big to ever fit, even alone
                        self.skipped += 1;
                        *cursor += 1;
                        continue;
                    }
                    let closing = usize::from(json);
                    if n > 0 && buf.len() + sep + self.scratch.len() + closing > max {
                        break;
                    }
                }
                BatchLimit::Points(max) => {
                    if n >= max.max(1) {
                        break;
                    }
                }
            }

            if n == 0 {
                if json {
                    buf.push(b'[');
                }
            } else {
                buf.push(if json { b',' } else { b'\n' });
            }
            buf.extend_from_slice(&self.scratch);
            n += 1;
            *cursor += 1;
        }

        if n > 0 && json {
            buf.push(b']');
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(n: usize) -> Vec<Point> {
        (0..n)
            .map(|i| Point::new(format!("m{i}")).with_tag("host", "abc").with_field("v", i as i64).with_time(i as i64))
            .collect()
    }

    fn chunks(enc: &mut PointEncoder, pts: &[Point]) -> anyhow::Result<Vec<(usize, Vec<u8>)>> {
        let (mut cursor, mut buf, mut out) = (0, Vec::new(), Vec::new());
        loop {
            let n = enc.next_chunk(pts, &mut cursor, &mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.push((n, buf.clone()));
        }
    }

    #[test]
    fn the_one_where_no_chunk_outgrows_the_byte_limit() -> anyhow::Result<()> {
        let pts = points(200);
        for enc in [Encoding::LineProtocol, Encoding::Json] {
            let mut encoder = PointEncoder::new(enc, BatchLimit::Bytes(256))?;
            let got = chunks(&mut encoder, &pts)?;
            assert!(got.len() > 1, "{enc}: 200 points should not fit in 256 bytes");
            assert_eq!(got.iter().map(|(n, _)| n).sum::<usize>(), 200, "{enc}: every point accounted for");
            for (_, body) in &got {
                assert!(body.len() <= 256, "{enc}: chunk of {} bytes broke the limit", body.len());
            }
            // 🧪 every chunk decodes back to whole points
            let decoded: usize = got.iter().map(|(_, b)| crate::point::decode(enc, b).map(|p| p.len())).sum::<Result<usize>>()?;
            assert_eq!(decoded, 200);
        }
        Ok(())
    }

    #[test]
    fn the_one_where_point_limits_cut_even_slices() -> anyhow::Result<()> {
        let mut encoder = PointEncoder::new(Encoding::LineProtocol, BatchLimit::Points(30))?;
        let got = chunks(&mut encoder, &points(100))?;
        assert_eq!(got.iter().map(|(n, _)| *n).collect::<Vec<_>>(), vec![30, 30, 30, 10]);
        Ok(())
    }

    #[test]
    fn the_one_where_the_chonky_point_is_skipped_not_sent() -> anyhow::Result<()> {
        let mut pts = points(3);
        pts.insert(1, Point::new("huge").with_field("blob", "x".repeat(2048)).with_time(1));
        let mut encoder = PointEncoder::new(Encoding::LineProtocol, BatchLimit::Bytes(1024))?;
        let got = chunks(&mut encoder, &pts)?;
        assert_eq!(got.iter().map(|(n, _)| n).sum::<usize>(), 3);
        assert_eq!(encoder.take_skipped(), 1, "the 2KB point cannot fit in 1KB");
        assert_eq!(encoder.take_skipped(), 0, "take resets the counter");
        Ok(())
    }

    #[test]
    fn the_one_where_protobuf_is_politely_declined() {
        assert!(matches!(
            PointEncoder::new(Encoding::Protobuf, BatchLimit::Points(1)),
            Err(DatawayError::UnsupportedEncoding(_))
        ));
    }

    #[test]
    fn the_one_where_nothing_in_means_nothing_out() -> anyhow::Result<()> {
        let mut encoder = PointEncoder::new(Encoding::Json, BatchLimit::Points(10))?;
        assert!(chunks(&mut encoder, &[])?.is_empty());
        Ok(())
    }
}
