//! 📦 Body — one ready-to-POST payload plus everything needed to POST it later.
//!
//! 🎬 *[a body is born in the builder. it may travel through memory. it may sleep on disk.
//! it may wake up in the fail-cache, three retries older and wiser.]*
//!
//! 🧠 Knowledge graph:
//! - Bodies come from `pool::BodyPool` and go back to it. The pool resets them; nobody else does.
//! - `dump`/`load` move a body to and from its disk record (`DWB1` framing below).
//! - `zipper::Zipper` gzips the payload in place when the builder or a flusher asks.
//!
//! Disk record layout (all integers little-endian):
//! ```text
//! "DWB1" | cat u8 | enc u8 | flags u8 | npts u32 | raw_len u32 | created_at i64
//! | n_headers u16 | (klen u16, key, vlen u16, value)* | url_len u16, url
//! | payload_len u32, payload
//! ```

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::category::Category;
use crate::error::{DatawayError, Result};
use crate::point::Encoding;

pub mod pool;
pub mod zipper;

pub use pool::{BodyPool, ScratchBuffers};
pub use zipper::Zipper;

const RECORD_MAGIC: &[u8; 4] = b"DWB1";
const FLAG_GZIP: u8 = 0b01;
const FLAG_CACHE_ALL: u8 = 0b10;

/// 🔍 gzip streams open with `1f 8b`.
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or_default()
}

/// 🧭 Where a body was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyFrom {
    #[default]
    Memory,
    WalDisk,
    FailCache,
}

impl BodyFrom {
    pub fn label(self) -> &'static str {
        match self {
            BodyFrom::Memory => "mem",
            BodyFrom::WalDisk => "disk",
            BodyFrom::FailCache => "fail-cache",
        }
    }
}

/// 🔑 Who owns the body's byte buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// allocated by the pool, lives and dies with the body
    Owned,
    /// lent by the caller (a flusher's scratch), handed back on release
    Reusable,
}

#[derive(Debug)]
pub struct Body {
    pub(crate) buf: Vec<u8>,
    /// scratch for the disk record form
    pub(crate) marshal: Vec<u8>,
    raw_len: usize,
    gzon: bool,
    npts: Option<usize>,
    enc: Encoding,
    cat: Category,
    from: BodyFrom,
    headers: Vec<(String, String)>,
    dynamic_url: Option<String>,
    created_at: i64,
    cache_all: bool,
    kind: BufferKind,
}

impl Body {
    pub(crate) fn empty(kind: BufferKind) -> Self {
        Self {
            buf: Vec::new(),
            marshal: Vec::new(),
            raw_len: 0,
            gzon: false,
            npts: None,
            enc: Encoding::LineProtocol,
            cat: Category::Unknown,
            from: BodyFrom::Memory,
            headers: Vec::new(),
            dynamic_url: None,
            created_at: 0,
            cache_all: false,
            kind,
        }
    }

    /// 🧽 Back to factory settings. Buffers are cleared, not freed.
    pub(crate) fn reset(&mut self) {
        self.buf.clear();
        self.marshal.clear();
        self.raw_len = 0;
        self.gzon = false;
        self.npts = None;
        self.enc = Encoding::LineProtocol;
        self.cat = Category::Unknown;
        self.from = BodyFrom::Memory;
        self.headers.clear();
        self.dynamic_url = None;
        self.created_at = 0;
        self.cache_all = false;
    }

    /// 🏗️ Fills a fresh body from an encoded chunk. Used by the builder and by tests.
    pub fn fill(&mut self, cat: Category, enc: Encoding, payload: &[u8], npts: usize) {
        self.buf.clear();
        self.buf.extend_from_slice(payload);
        self.raw_len = payload.len();
        self.gzon = false;
        self.npts = Some(npts);
        self.enc = enc;
        self.cat = cat;
        self.created_at = unix_now();
    }

    /// 🫁 Replaces the raw payload with its gzip form. `raw_len` keeps the pre-compression size.
    pub fn gzip_with(&mut self, zipper: &mut Zipper) -> std::io::Result<()> {
        if self.gzon {
            return Ok(());
        }
        let zipped = zipper.zip(&self.buf)?;
        self.buf.clear();
        self.buf.extend_from_slice(zipped);
        self.gzon = true;
        Ok(())
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf
    }

    pub fn raw_len(&self) -> usize {
        self.raw_len
    }

    pub fn gzon(&self) -> bool {
        self.gzon
    }

    pub fn npts(&self) -> Option<usize> {
        self.npts
    }

    pub fn encoding(&self) -> Encoding {
        self.enc
    }

    pub fn category(&self) -> Category {
        self.cat
    }

    pub fn from(&self) -> BodyFrom {
        self.from
    }

    pub(crate) fn set_from(&mut self, from: BodyFrom) {
        self.from = from;
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = (key.into(), value.into());
        match self.headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&key)) {
            Some(slot) => slot.1 = value,
            None => self.headers.push((key, value)),
        }
    }

    pub fn dynamic_url(&self) -> Option<&str> {
        self.dynamic_url.as_deref()
    }

    pub fn set_dynamic_url(&mut self, url: Option<String>) {
        self.dynamic_url = url;
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    #[cfg(test)]
    pub(crate) fn set_created_at(&mut self, at: i64) {
        self.created_at = at;
    }

    pub fn cache_all(&self) -> bool {
        self.cache_all
    }

    pub fn set_cache_all(&mut self, on: bool) {
        self.cache_all = on;
    }

    /// 💾 Writes the disk record form into `out` (cleared first).
    pub fn dump(&self, out: &mut Vec<u8>) -> Result<()> {
        out.clear();
        out.extend_from_slice(RECORD_MAGIC);
        out.push(self.cat.as_u8());
        out.push(self.enc.as_u8());
        let mut flags = 0;
        if self.gzon {
            flags |= FLAG_GZIP;
        }
        if self.cache_all {
            flags |= FLAG_CACHE_ALL;
        }
        out.push(flags);
        out.extend_from_slice(&len_u32(self.npts.unwrap_or_default())?.to_le_bytes());
        out.extend_from_slice(&len_u32(self.raw_len)?.to_le_bytes());
        out.extend_from_slice(&self.created_at.to_le_bytes());

        let n_headers = u16::try_from(self.headers.len()).map_err(|_| DatawayError::CorruptedRecord("too many headers"))?;
        out.extend_from_slice(&n_headers.to_le_bytes());
        for (k, v) in &self.headers {
            put_short(out, k.as_bytes())?;
            put_short(out, v.as_bytes())?;
        }
        put_short(out, self.dynamic_url.as_deref().unwrap_or_default().as_bytes())?;
        out.extend_from_slice(&len_u32(self.buf.len())?.to_le_bytes());
        out.extend_from_slice(&self.buf);
        Ok(())
    }

    /// 📖 Reads a disk record back into this body. Provenance is left to the caller.
    pub fn load(&mut self, record: &[u8]) -> Result<()> {
        let mut r = RecordReader { data: record };
        if r.take(4)? != RECORD_MAGIC {
            return Err(DatawayError::CorruptedRecord("bad magic"));
        }
        self.cat = Category::from_u8(r.u8()?).ok_or(DatawayError::CorruptedRecord("bad category"))?;
        self.enc = Encoding::from_u8(r.u8()?).ok_or(DatawayError::CorruptedRecord("bad encoding"))?;
        let flags = r.u8()?;
        let npts = r.u32()? as usize;
        self.raw_len = r.u32()? as usize;
        self.created_at = r.i64()?;

        self.headers.clear();
        for _ in 0..r.u16()? {
            let k = r.short_str()?;
            let v = r.short_str()?;
            self.headers.push((k, v));
        }
        let url = r.short_str()?;
        self.dynamic_url = (!url.is_empty()).then_some(url);

        let payload_len = r.u32()? as usize;
        let payload = r.take(payload_len)?;
        self.buf.clear();
        self.buf.extend_from_slice(payload);

        self.npts = (npts > 0).then_some(npts);
        self.cache_all = flags & FLAG_CACHE_ALL != 0;
        // 🔍 trust the bytes over the flag
        self.gzon = is_gzip(&self.buf);
        Ok(())
    }

    /// 📖 `load` from the body's own `marshal` scratch.
    pub(crate) fn load_marshaled(&mut self) -> Result<()> {
        let record = std::mem::take(&mut self.marshal);
        let res = self.load(&record);
        self.marshal = record;
        res
    }
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cat: {}, enc: {}, gzip: {}, npts: {:?}, raw: {}, payload: {}, from: {}",
            self.cat,
            self.enc,
            self.gzon,
            self.npts,
            self.raw_len,
            self.buf.len(),
            self.from.label()
        )
    }
}

fn len_u32(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| DatawayError::CorruptedRecord("length overflows u32"))
}

fn put_short(out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    let n = u16::try_from(data.len()).map_err(|_| DatawayError::CorruptedRecord("string too long"))?;
    out.extend_from_slice(&n.to_le_bytes());
    out.extend_from_slice(data);
    Ok(())
}

struct RecordReader<'a> {
    data: &'a [u8],
}

impl<'a> RecordReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(DatawayError::CorruptedRecord("truncated"));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn short_str(&mut self) -> Result<String> {
        let n = self.u16()? as usize;
        String::from_utf8(self.take(n)?.to_vec()).map_err(|_| DatawayError::CorruptedRecord("non utf-8 string"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Body {
        let mut b = Body::empty(BufferKind::Owned);
        b.fill(Category::Logging, Encoding::LineProtocol, b"log,host=h msg=\"hi\" 1", 1);
        b.set_header("X-Global-Tags", "host=h");
        b.set_dynamic_url(Some("https://dw.example.com/v1/write/logging?token=tkn_x".into()));
        b.set_cache_all(true);
        b
    }

    #[test]
    fn the_one_where_a_body_naps_on_disk_and_wakes_up_the_same() -> anyhow::Result<()> {
        let mut zipper = Zipper::default();
        let mut original = sample();
        original.gzip_with(&mut zipper)?;

        let mut record = Vec::new();
        original.dump(&mut record)?;

        let mut loaded = Body::empty(BufferKind::Owned);
        loaded.load(&record)?;
        assert_eq!(loaded.category(), Category::Logging);
        assert_eq!(loaded.encoding(), Encoding::LineProtocol);
        assert_eq!(loaded.npts(), Some(1));
        assert_eq!(loaded.raw_len(), original.raw_len());
        assert!(loaded.gzon(), "gzip sniffed back from the payload bytes");
        assert!(loaded.cache_all());
        assert_eq!(loaded.payload(), original.payload());
        assert_eq!(loaded.headers(), original.headers());
        assert_eq!(loaded.dynamic_url(), original.dynamic_url());
        assert_eq!(loaded.created_at(), original.created_at());
        Ok(())
    }

    #[test]
    fn the_one_where_truncated_records_are_called_out() -> anyhow::Result<()> {
        let mut record = Vec::new();
        sample().dump(&mut record)?;
        let mut body = Body::empty(BufferKind::Owned);
        for cut in [0, 3, 10, record.len() - 1] {
            assert!(
                matches!(body.load(&record[..cut]), Err(DatawayError::CorruptedRecord(_))),
                "a record cut at {cut} bytes should not load"
            );
        }
        Ok(())
    }

    #[test]
    fn the_one_where_gzip_magic_is_sniffed() {
        assert!(is_gzip(&[0x1f, 0x8b, 0x08]));
        assert!(!is_gzip(b"cpu x=1i 1"));
        assert!(!is_gzip(&[0x1f]));
    }

    #[test]
    fn the_one_where_reset_leaves_nothing_behind() {
        let mut b = sample();
        b.reset();
        assert!(b.payload().is_empty() && b.headers().is_empty());
        assert_eq!(b.npts(), None);
        assert_eq!(b.dynamic_url(), None);
        assert!(!b.cache_all());
    }
}
