//! 💾 The disk tier contract, plus an in-memory stand-in for tests.
//!
//! # Contract 📜
//! - `put` appends one opaque record. When the cache is at capacity it either drops the
//!   oldest data (returns how many bytes went) or, with `no_drop`, refuses with `DiskFull`.
//! - `get` pops the oldest record into the caller's buffer and returns a `ReadMark`.
//! - `rollback(mark)` puts that record back at the front, as if it was never read.
//!   Callers serialize get/rollback pairs per cache (the WAL queue's disk lock does).
//! - `rotate` seals the active write segment so readers can see it.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{DatawayError, Result};

/// 📍 Where a record was read from. Opaque outside the cache that minted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadMark {
    pub(crate) segment: u64,
    pub(crate) offset: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct DiskCacheOptions {
    /// unread bytes the cache may hold, record headers included
    pub capacity: u64,
    /// refuse puts instead of dropping old data
    pub no_drop: bool,
    /// active segment size that triggers a rotation (capped at an eighth of `capacity`)
    pub segment_size: u64,
    /// how long records may sit in the active segment before a reader seals it
    pub seal_after: Duration,
}

impl Default for DiskCacheOptions {
    fn default() -> Self {
        Self { capacity: 2 << 30, no_drop: false, segment_size: 20 << 20, seal_after: Duration::from_secs(1) }
    }
}

pub trait DiskCache: Send + Sync + Debug {
    /// Returns the number of bytes dropped to make room.
    fn put(&self, data: &[u8]) -> Result<u64>;
    fn get(&self, buf: &mut Vec<u8>) -> Result<Option<ReadMark>>;
    fn rollback(&self, mark: ReadMark) -> Result<()>;
    fn rotate(&self) -> Result<()>;
    /// bytes currently held
    fn size(&self) -> u64;
}

/// 🧪 A disk cache that never touches a disk. Same capacity and drop rules.
#[derive(Debug)]
pub struct MemDiskCache {
    opts: DiskCacheOptions,
    inner: Mutex<MemInner>,
}

#[derive(Debug, Default)]
struct MemInner {
    records: VecDeque<Vec<u8>>,
    size: u64,
    seq: u64,
    in_flight: Option<(u64, Vec<u8>)>,
}

impl MemDiskCache {
    pub fn new(opts: DiskCacheOptions) -> Self {
        Self { opts, inner: Mutex::new(MemInner::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemInner> {
        // a panicked holder leaves plain data behind, still usable
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DiskCache for MemDiskCache {
    fn put(&self, data: &[u8]) -> Result<u64> {
        let need = data.len() as u64;
        if need > self.opts.capacity {
            return Err(DatawayError::DiskFull);
        }
        let mut inner = self.lock();
        let mut dropped = 0;
        while inner.size + need > self.opts.capacity {
            if self.opts.no_drop {
                return Err(DatawayError::DiskFull);
            }
            match inner.records.pop_front() {
                Some(old) => {
                    inner.size -= old.len() as u64;
                    dropped += old.len() as u64;
                }
                None => break,
            }
        }
        inner.size += need;
        inner.records.push_back(data.to_vec());
        Ok(dropped)
    }

    fn get(&self, buf: &mut Vec<u8>) -> Result<Option<ReadMark>> {
        let mut inner = self.lock();
        let Some(record) = inner.records.pop_front() else {
            return Ok(None);
        };
        inner.size -= record.len() as u64;
        inner.seq += 1;
        let seq = inner.seq;
        buf.clear();
        buf.extend_from_slice(&record);
        inner.in_flight = Some((seq, record));
        let mark = ReadMark { segment: seq, offset: 0 };
        Ok(Some(mark))
    }

    fn rollback(&self, mark: ReadMark) -> Result<()> {
        let mut inner = self.lock();
        match inner.in_flight.take() {
            Some((seq, record)) if seq == mark.segment => {
                inner.size += record.len() as u64;
                inner.records.push_front(record);
            }
            other => inner.in_flight = other,
        }
        Ok(())
    }

    fn rotate(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.lock().size
    }
}
