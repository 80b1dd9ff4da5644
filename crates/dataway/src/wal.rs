//! 🚰 WAL queue — a bounded memory channel with a disk cache for overflow.
//!
//! 🎬 *[the channel fills. the producer does not wait. the overflow goes to disk.
//! the flusher, unaware of any of this, just asks for the next body.]*
//!
//! 🧠 Knowledge graph:
//! - `put`: memory first (`try_send`), disk when memory is full. Never blocks on memory.
//!   No-drop queues retry a full disk until it has room or the process is shutting down.
//! - `get`: memory first (`try_recv`), then one disk record. Disk bodies wear the caller's
//!   scratch buffers (`BodyPool::get_with`).
//! - `disk_get`: hands out a `DiskLease` over one disk record. `commit` consumes it;
//!   `rollback` (or dropping the lease) puts it back for next time. The fail-cache uses this.
//! - One queue per category, plus the disk-only fail-cache.

use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender, TrySendError};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::body::{Body, BodyFrom, BodyPool, BufferKind, ScratchBuffers};
use crate::context::RuntimeContext;
use crate::error::{DatawayError, Result};

pub mod disk_cache;
pub mod file_cache;

pub use disk_cache::{DiskCache, DiskCacheOptions, MemDiskCache, ReadMark};
pub use file_cache::FileDiskCache;

#[derive(Debug, Clone, Copy)]
pub struct WalQueueOptions {
    /// memory slots; `None` makes the queue disk-only
    pub mem_cap: Option<usize>,
    pub no_drop: bool,
    /// pause between retries of a full no-drop disk
    pub no_drop_retry: Duration,
}

impl Default for WalQueueOptions {
    fn default() -> Self {
        Self { mem_cap: Some(1), no_drop: false, no_drop_retry: Duration::from_millis(100) }
    }
}

#[derive(Debug)]
pub struct WalQueue {
    label: &'static str,
    mem: Option<(Sender<Body>, Receiver<Body>)>,
    disk: Arc<dyn DiskCache>,
    pool: Arc<BodyPool>,
    ctx: RuntimeContext,
    opts: WalQueueOptions,
    /// serializes disk reads while a lease is out
    disk_lock: Mutex<()>,
}

impl WalQueue {
    pub fn new(
        label: &'static str,
        disk: Arc<dyn DiskCache>,
        pool: Arc<BodyPool>,
        ctx: RuntimeContext,
        opts: WalQueueOptions,
    ) -> Self {
        let mem = opts.mem_cap.map(|cap| async_channel::bounded(cap.max(1)));
        Self { label, mem, disk, pool, ctx, opts, disk_lock: Mutex::new(()) }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// 📏 Bodies currently parked in memory.
    pub fn mem_len(&self) -> usize {
        self.mem.as_ref().map(|(tx, _)| tx.len()).unwrap_or_default()
    }

    pub fn disk_size(&self) -> u64 {
        self.disk.size()
    }

    pub fn pool(&self) -> &Arc<BodyPool> {
        &self.pool
    }

    /// 📥 Queues a body. Memory if there is room, otherwise disk. The body goes back
    /// to the pool once it is on disk (or once the disk said no).
    pub async fn put(&self, body: Body) -> Result<()> {
        let mut body = match &self.mem {
            Some((tx, _)) => match tx.try_send(body) {
                Ok(()) => {
                    self.ctx.metrics.wal_mem_len.with_label_values(&[self.label]).inc();
                    return Ok(());
                }
                Err(TrySendError::Full(b)) | Err(TrySendError::Closed(b)) => b,
            },
            None => body,
        };

        let res = self.put_disk(&mut body).await;
        self.pool.release(body);
        res
    }

    /// 💾 Writes a copy of `body` straight to disk. The caller keeps the body.
    pub async fn cache(&self, body: &Body) -> Result<()> {
        let mut record = Vec::with_capacity(body.payload().len() + 64);
        body.dump(&mut record)?;
        self.put_record(&record).await
    }

    async fn put_disk(&self, body: &mut Body) -> Result<()> {
        let mut record = std::mem::take(&mut body.marshal);
        let res = match body.dump(&mut record) {
            Ok(()) => self.put_record(&record).await,
            Err(e) => Err(e),
        };
        body.marshal = record;
        res
    }

    async fn put_record(&self, record: &[u8]) -> Result<()> {
        let metrics = &self.ctx.metrics;
        let mut attempts: u64 = 0;
        loop {
            match self.disk.put(record) {
                Ok(dropped) => {
                    if dropped > 0 {
                        metrics.wal_dropped.with_label_values(&[self.label, "disk-full"]).inc();
                    }
                    metrics.wal_disk_bytes.with_label_values(&[self.label, "put"]).inc_by(record.len() as u64);
                    return Ok(());
                }
                Err(DatawayError::DiskFull) if self.opts.no_drop && !self.ctx.exit.is_set() => {
                    attempts += 1;
                    metrics.wal_put_retried.with_label_values(&[self.label]).inc();
                    if attempts % 100 == 1 {
                        warn!("⏳ {} disk cache full, no-drop put waiting (attempt {})", self.label, attempts);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.opts.no_drop_retry) => {}
                        _ = self.ctx.exit.wait() => {}
                    }
                }
                Err(e) => {
                    metrics.wal_dropped.with_label_values(&[self.label, "disk-error"]).inc();
                    return Err(e);
                }
            }
        }
    }

    /// 📤 Next body, memory first. `Ok(None)` when both tiers are empty.
    pub fn get(&self, scratch: &mut ScratchBuffers) -> Result<Option<Body>> {
        if let Some((_, rx)) = &self.mem {
            if let Ok(body) = rx.try_recv() {
                self.ctx.metrics.wal_mem_len.with_label_values(&[self.label]).dec();
                self.ctx.metrics.wal_points.with_label_values(&[self.label, BodyFrom::Memory.label()]).inc();
                return Ok(Some(body));
            }
        }

        // a lease is out, the disk tier waits for it
        let Ok(_guard) = self.disk_lock.try_lock() else {
            return Ok(None);
        };
        Ok(self.read_disk(scratch, BodyFrom::WalDisk)?.map(|(body, _)| body))
    }

    /// 🔐 Leases the next disk record. The lease must be committed once the body is
    /// delivered; anything else puts the record back.
    pub async fn disk_get(&self, scratch: &mut ScratchBuffers) -> Result<Option<DiskLease<'_>>> {
        let guard = self.disk_lock.lock().await;
        Ok(self
            .read_disk(scratch, BodyFrom::FailCache)?
            .map(|(body, mark)| DiskLease { queue: self, _guard: guard, mark: Some(mark), body }))
    }

    fn read_disk(&self, scratch: &mut ScratchBuffers, from: BodyFrom) -> Result<Option<(Body, ReadMark)>> {
        let mut body = self.pool.get_with(std::mem::take(scratch));
        let outcome = match self.disk.get(&mut body.marshal) {
            Ok(Some(mark)) => match body.load_marshaled() {
                Ok(()) => Ok(Some(mark)),
                Err(e) => {
                    self.ctx.metrics.wal_dropped.with_label_values(&[self.label, "corrupted"]).inc();
                    warn!("💀 dropped a corrupted record from {}: {}", self.label, e);
                    Err(e)
                }
            },
            other => other,
        };

        match outcome {
            Ok(Some(mark)) => {
                let metrics = &self.ctx.metrics;
                metrics.wal_points.with_label_values(&[self.label, from.label()]).inc();
                metrics.wal_disk_bytes.with_label_values(&[self.label, "get"]).inc_by(body.marshal.len() as u64);
                body.set_from(from);
                debug!("📤 {} read from disk: {}", self.label, body);
                Ok(Some((body, mark)))
            }
            other => {
                if let Some(back) = self.pool.release(body) {
                    *scratch = back;
                }
                other.map(|_| None)
            }
        }
    }

    /// 🔄 Seals the active disk segment so it becomes readable.
    pub fn rotate(&self) -> Result<()> {
        self.disk.rotate()
    }
}

/// 🔐 One disk record, checked out. Holds the queue's disk lock until it is settled.
#[derive(Debug)]
pub struct DiskLease<'a> {
    queue: &'a WalQueue,
    _guard: MutexGuard<'a, ()>,
    mark: Option<ReadMark>,
    body: Body,
}

impl DiskLease<'_> {
    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    fn take_body(&mut self) -> Body {
        std::mem::replace(&mut self.body, Body::empty(BufferKind::Owned))
    }

    /// ✅ The record is gone for good. Returns the caller's scratch buffers.
    pub fn commit(mut self) -> Option<ScratchBuffers> {
        self.mark = None;
        let body = self.take_body();
        self.queue.pool.release(body)
    }

    /// ↩️ The record goes back to the front of the disk queue.
    pub fn rollback(mut self) -> Option<ScratchBuffers> {
        if let Some(mark) = self.mark.take() {
            if let Err(e) = self.queue.disk.rollback(mark) {
                warn!("⚠️ {} rollback failed, record lost: {}", self.queue.label, e);
            }
        }
        let body = self.take_body();
        self.queue.pool.release(body)
    }
}

impl Drop for DiskLease<'_> {
    fn drop(&mut self) {
        if let Some(mark) = self.mark.take() {
            if let Err(e) = self.queue.disk.rollback(mark) {
                warn!("⚠️ {} rollback on drop failed: {}", self.queue.label, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::Category;
    use crate::context::test_context;
    use crate::point::Encoding;
    use tempfile::TempDir;

    fn queue(disk: Arc<dyn DiskCache>, opts: WalQueueOptions) -> WalQueue {
        WalQueue::new("logging", disk, Arc::new(BodyPool::new(16, 1 << 20)), test_context(), opts)
    }

    fn body(q: &WalQueue, i: usize) -> Body {
        let mut b = q.pool().get();
        b.fill(Category::Logging, Encoding::LineProtocol, format!("log msg=\"{i}\" {i}").as_bytes(), 1);
        b
    }

    fn payload_of(b: &Body) -> String {
        String::from_utf8_lossy(b.payload()).into_owned()
    }

    #[tokio::test]
    async fn the_one_where_memory_fills_and_disk_catches_the_rest() -> anyhow::Result<()> {
        let disk = Arc::new(MemDiskCache::new(DiskCacheOptions::default()));
        let q = queue(disk.clone(), WalQueueOptions { mem_cap: Some(2), ..Default::default() });
        for i in 0..5 {
            q.put(body(&q, i)).await?;
        }
        assert_eq!(q.mem_len(), 2);
        assert_eq!(disk.len(), 3);

        let mut scratch = ScratchBuffers::default();
        let mut froms = Vec::new();
        let mut seen = Vec::new();
        while let Some(b) = q.get(&mut scratch)? {
            froms.push(b.from());
            seen.push(payload_of(&b));
            if let Some(back) = q.pool().release(b) {
                scratch = back;
            }
        }
        assert_eq!(seen.len(), 5, "each put comes out exactly once");
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 5, "and never twice");
        assert_eq!(froms.iter().filter(|f| **f == BodyFrom::Memory).count(), 2);
        assert_eq!(froms.iter().filter(|f| **f == BodyFrom::WalDisk).count(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_disk_only_queue_goes_straight_to_disk() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let disk = Arc::new(FileDiskCache::open(dir.path().join("fc"), DiskCacheOptions::default())?);
        let q = queue(disk, WalQueueOptions { mem_cap: None, ..Default::default() });
        q.put(body(&q, 7)).await?;
        assert_eq!(q.mem_len(), 0);
        q.rotate()?;
        let mut scratch = ScratchBuffers::default();
        let b = q.get(&mut scratch)?.expect("💀 the body went to disk, it should come back");
        assert_eq!(payload_of(&b), "log msg=\"7\" 7");
        assert_eq!(b.kind(), BufferKind::Reusable);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_rolled_back_lease_is_served_again() -> anyhow::Result<()> {
        let disk = Arc::new(MemDiskCache::new(DiskCacheOptions::default()));
        let q = queue(disk.clone(), WalQueueOptions { mem_cap: None, ..Default::default() });
        let b = body(&q, 1);
        q.cache(&b).await?;
        q.pool().release(b);

        let mut scratch = ScratchBuffers::default();
        let lease = q.disk_get(&mut scratch).await?.expect("💀 one record was cached");
        assert_eq!(lease.body().from(), BodyFrom::FailCache);
        scratch = lease.rollback().unwrap_or_default();
        assert_eq!(disk.len(), 1, "rollback put it back");

        {
            let _dropped_on_the_floor = q.disk_get(&mut scratch).await?.expect("💀 still there");
        }
        assert_eq!(disk.len(), 1, "dropping a lease is a rollback too");

        let lease = q.disk_get(&mut scratch).await?.expect("💀 still there");
        assert_eq!(payload_of(lease.body()), "log msg=\"1\" 1");
        lease.commit();
        assert!(disk.is_empty(), "commit consumed it");
        assert!(q.disk_get(&mut scratch).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_no_drop_holds_the_line_under_pressure() -> anyhow::Result<()> {
        let disk = Arc::new(MemDiskCache::new(DiskCacheOptions { capacity: 400, no_drop: true, ..Default::default() }));
        let q = Arc::new(queue(
            disk,
            WalQueueOptions { mem_cap: Some(2), no_drop: true, no_drop_retry: Duration::from_millis(5) },
        ));

        let producer = {
            let q = q.clone();
            tokio::spawn(async move {
                for i in 0..40 {
                    let b = body(&q, i);
                    q.put(b).await?;
                }
                Ok::<_, DatawayError>(())
            })
        };

        let mut scratch = ScratchBuffers::default();
        let mut seen = Vec::new();
        while seen.len() < 40 {
            match q.get(&mut scratch)? {
                Some(b) => {
                    seen.push(payload_of(&b));
                    if let Some(back) = q.pool().release(b) {
                        scratch = back;
                    }
                }
                None => tokio::time::sleep(Duration::from_millis(2)).await,
            }
        }
        producer.await??;

        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 40, "no-drop means every body shows up");
        let m = &q.ctx.metrics;
        assert_eq!(m.wal_dropped.with_label_values(&["logging", "disk-full"]).get(), 0);
        assert!(m.wal_put_retried.with_label_values(&["logging"]).get() > 0, "the producer should have had to wait");
        Ok(())
    }
}
