//! 🗄️ FileDiskCache — a directory of length-prefixed record segments.
//!
//! ```text
//! <dir>/data               active segment, appended to by put
//! <dir>/data.0000000001    sealed segments, read oldest first
//! ```
//! Each record is `len u32 LE | bytes`. A sealed segment is deleted once a reader walks
//! off its end. Opening a directory picks up whatever a previous process left behind,
//! the active file included (it is sealed on open).
//!
//! 🧠 Knowledge graph:
//! - `size()` counts unread bytes. Reads and drops subtract, rollbacks add back.
//! - A full cache drops the oldest unread records one at a time, never more than it needs.
//! - Readers only see sealed segments. The active file is sealed once it reaches the
//!   segment size, or when a reader finds nothing sealed and the oldest record in the
//!   active file has waited `seal_after`.
//!
//! ⚠️ All file I/O is blocking and happens under one mutex. Records are small and the
//! callers are few (a handful of flushers per category), so nobody waits long.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, warn};

use super::disk_cache::{DiskCache, DiskCacheOptions, ReadMark};
use crate::error::{DatawayError, Result};

const ACTIVE: &str = "data";
const HEADER: u64 = 4;

#[derive(Debug)]
pub struct FileDiskCache {
    dir: PathBuf,
    opts: DiskCacheOptions,
    segment_size: u64,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Segment {
    seq: u64,
    size: u64,
}

#[derive(Debug)]
struct Reader {
    seq: u64,
    file: File,
    pos: u64,
    /// records before this offset were dropped for room, rollbacks cannot bring them back
    floor: u64,
}

#[derive(Debug, Default)]
struct Inner {
    active: Option<File>,
    active_size: u64,
    /// when the oldest record in the active file was written
    active_since: Option<Instant>,
    sealed: VecDeque<Segment>,
    next_seq: u64,
    reader: Option<Reader>,
    /// unread bytes, sealed and active
    total: u64,
}

impl FileDiskCache {
    /// 📂 Opens (or creates) a cache directory.
    pub fn open(dir: impl AsRef<Path>, opts: DiskCacheOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut sealed = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(seq) = name.to_str().and_then(|n| n.strip_prefix("data.")).and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            sealed.push(Segment { seq, size: entry.metadata()?.len() });
        }
        sealed.sort_by_key(|s| s.seq);

        let mut inner = Inner {
            next_seq: sealed.last().map(|s| s.seq + 1).unwrap_or(1),
            total: sealed.iter().map(|s| s.size).sum(),
            sealed: sealed.into(),
            ..Default::default()
        };

        let active_path = dir.join(ACTIVE);
        if let Ok(meta) = fs::metadata(&active_path) {
            inner.active_size = meta.len();
            inner.total += meta.len();
        }
        let segment_size = opts.segment_size.min(opts.capacity / 8).max(HEADER + 1);
        let cache = Self { dir, opts, segment_size, inner: Mutex::new(inner) };
        {
            let mut inner = cache.lock();
            cache.seal_locked(&mut inner)?;
            debug!(
                "🗄️ opened disk cache {} with {} sealed segments, {} bytes",
                cache.dir.display(),
                inner.sealed.len(),
                inner.total
            );
        }
        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn segment_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{ACTIVE}.{seq:010}"))
    }

    /// 🔒 Renames the active file into the next sealed segment.
    fn seal_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.active_size == 0 {
            return Ok(());
        }
        if let Some(mut f) = inner.active.take() {
            f.flush()?;
        }
        let seq = inner.next_seq;
        fs::rename(self.dir.join(ACTIVE), self.segment_path(seq))?;
        inner.sealed.push_back(Segment { seq, size: inner.active_size });
        inner.next_seq += 1;
        inner.active_size = 0;
        inner.active_since = None;
        Ok(())
    }

    /// ⏰ Whether a reader with nothing sealed to read may seal the active file.
    fn active_is_ripe(&self, inner: &Inner) -> bool {
        inner.active_size > 0 && inner.active_since.is_some_and(|t| t.elapsed() >= self.opts.seal_after)
    }

    /// 🗑️ Deletes the oldest sealed segment. Returns how many of its bytes were still unread.
    fn retire_front_locked(&self, inner: &mut Inner) -> Result<Option<u64>> {
        let Some(seg) = inner.sealed.pop_front() else {
            return Ok(None);
        };
        let read = match inner.reader.take() {
            Some(r) if r.seq == seg.seq => r.pos,
            other => {
                inner.reader = other;
                0
            }
        };
        match fs::remove_file(self.segment_path(seg.seq)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let unread = seg.size.saturating_sub(read);
        inner.total = inner.total.saturating_sub(unread);
        Ok(Some(unread))
    }

    /// 📖 Steps over the oldest unread record, copying it into `buf` when given one.
    /// Returns where it was and how many bytes it took up.
    fn next_record_locked(&self, inner: &mut Inner, mut buf: Option<&mut Vec<u8>>) -> Result<Option<(ReadMark, u64)>> {
        loop {
            if inner.reader.is_none() {
                let Some(seg) = inner.sealed.front() else {
                    return Ok(None);
                };
                let seq = seg.seq;
                match File::open(self.segment_path(seq)) {
                    Ok(file) => inner.reader = Some(Reader { seq, file, pos: 0, floor: 0 }),
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        warn!("⚠️ segment {} vanished from {}", seq, self.dir.display());
                        self.retire_front_locked(inner)?;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let seg_size = inner.sealed.front().map(|s| s.size).unwrap_or_default();
            let Some(reader) = inner.reader.as_mut() else {
                continue;
            };
            if reader.pos + HEADER > seg_size {
                // walked off the end, this segment is done
                self.retire_front_locked(inner)?;
                continue;
            }

            let mark = ReadMark { segment: reader.seq, offset: reader.pos };
            reader.file.seek(SeekFrom::Start(reader.pos))?;
            let mut len = [0u8; 4];
            reader.file.read_exact(&mut len)?;
            let len = u32::from_le_bytes(len) as u64;
            if reader.pos + HEADER + len > seg_size {
                warn!(
                    "⚠️ torn record at {}:{} in {}, skipping the rest of the segment",
                    reader.seq,
                    reader.pos,
                    self.dir.display()
                );
                self.retire_front_locked(inner)?;
                continue;
            }
            if let Some(buf) = buf.as_deref_mut() {
                buf.clear();
                buf.resize(len as usize, 0);
                reader.file.read_exact(buf)?;
            }
            reader.pos += HEADER + len;
            inner.total = inner.total.saturating_sub(HEADER + len);
            return Ok(Some((mark, HEADER + len)));
        }
    }

    /// 🗑️ Drops the oldest unread record to make room. Returns its size.
    fn drop_record_locked(&self, inner: &mut Inner) -> Result<Option<u64>> {
        if inner.sealed.is_empty() {
            self.seal_locked(inner)?;
        }
        let dropped = self.next_record_locked(inner, None)?;
        if let Some(reader) = inner.reader.as_mut() {
            reader.floor = reader.pos;
        }
        Ok(dropped.map(|(_, size)| size))
    }
}

impl DiskCache for FileDiskCache {
    fn put(&self, data: &[u8]) -> Result<u64> {
        let need = HEADER + data.len() as u64;
        if need > self.opts.capacity {
            return Err(DatawayError::DiskFull);
        }
        let len = u32::try_from(data.len()).map_err(|_| DatawayError::DiskFull)?;

        let mut inner = self.lock();
        let mut dropped = 0;
        while inner.total + need > self.opts.capacity {
            if self.opts.no_drop {
                return Err(DatawayError::DiskFull);
            }
            match self.drop_record_locked(&mut inner)? {
                Some(size) => dropped += size,
                None => break,
            }
        }
        if dropped > 0 {
            warn!("🗑️ disk cache {} full, dropped {} bytes of the oldest records", self.dir.display(), dropped);
        }

        if inner.active.is_none() {
            inner.active = Some(OpenOptions::new().create(true).append(true).open(self.dir.join(ACTIVE))?);
        }
        if let Some(f) = inner.active.as_mut() {
            f.write_all(&len.to_le_bytes())?;
            f.write_all(data)?;
        }
        if inner.active_since.is_none() {
            inner.active_since = Some(Instant::now());
        }
        inner.active_size += need;
        inner.total += need;

        if inner.active_size >= self.segment_size {
            self.seal_locked(&mut inner)?;
        }
        Ok(dropped)
    }

    fn get(&self, buf: &mut Vec<u8>) -> Result<Option<ReadMark>> {
        let mut inner = self.lock();
        if inner.sealed.is_empty() && self.active_is_ripe(&inner) {
            self.seal_locked(&mut inner)?;
        }
        Ok(self.next_record_locked(&mut inner, Some(buf))?.map(|(mark, _)| mark))
    }

    fn rollback(&self, mark: ReadMark) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.reader.as_mut() {
            Some(reader) if reader.seq == mark.segment && reader.pos > mark.offset && mark.offset >= reader.floor => {
                inner.total += reader.pos - mark.offset;
                reader.pos = mark.offset;
            }
            _ => warn!(
                "⚠️ cannot roll back {:?} in {}, the record was dropped or the segment moved on",
                mark,
                self.dir.display()
            ),
        }
        Ok(())
    }

    fn rotate(&self) -> Result<()> {
        let mut inner = self.lock();
        self.seal_locked(&mut inner)
    }

    fn size(&self) -> u64 {
        self.lock().total
    }
}
