//! ♻️ BodyPool — two lock-free free-lists of bodies, split by who owns the bytes.
//!
//! - `get()` hands out an `Owned` body: its buffers belong to the pool and stay warm.
//! - `get_with(scratch)` hands out a `Reusable` body wrapped around a caller's scratch
//!   buffers (a flusher reading from disk). `release` gives those buffers back.
//!
//! ⚠️ `release` is the only place bodies are reset. A body that comes out of `get*`
//! is always blank.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;

use super::{Body, BufferKind};

/// 🧰 A caller's pair of byte buffers: payload and disk record.
#[derive(Debug, Default)]
pub struct ScratchBuffers {
    pub send: Vec<u8>,
    pub marshal: Vec<u8>,
}

impl ScratchBuffers {
    pub fn with_capacity(cap: usize) -> Self {
        Self { send: Vec::with_capacity(cap), marshal: Vec::with_capacity(cap) }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub drops: u64,
}

#[derive(Debug)]
pub struct BodyPool {
    owned: ArrayQueue<Body>,
    reusable: ArrayQueue<Body>,
    /// owned bodies whose buffers grew past this are freed instead of kept
    max_retained: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    drops: AtomicU64,
}

impl BodyPool {
    pub fn new(capacity: usize, max_retained: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            owned: ArrayQueue::new(capacity),
            reusable: ArrayQueue::new(capacity),
            max_retained,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            drops: AtomicU64::new(0),
        }
    }

    fn pop_or_new(&self, list: &ArrayQueue<Body>, kind: BufferKind) -> Body {
        match list.pop() {
            Some(b) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                b
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Body::empty(kind)
            }
        }
    }

    /// 📤 A blank body with pool-owned buffers.
    pub fn get(&self) -> Body {
        self.pop_or_new(&self.owned, BufferKind::Owned)
    }

    /// 📤 A blank body wearing the caller's buffers.
    pub fn get_with(&self, scratch: ScratchBuffers) -> Body {
        let mut body = self.pop_or_new(&self.reusable, BufferKind::Reusable);
        body.buf = scratch.send;
        body.buf.clear();
        body.marshal = scratch.marshal;
        body.marshal.clear();
        body
    }

    /// 📥 Resets and shelves the body. For `Reusable` bodies the caller's buffers
    /// come back out, cleared and still allocated.
    pub fn release(&self, mut body: Body) -> Option<ScratchBuffers> {
        body.reset();
        let (list, handed_back) = match body.kind() {
            BufferKind::Owned => {
                if body.buf.capacity() > self.max_retained {
                    body.buf = Vec::new();
                }
                if body.marshal.capacity() > self.max_retained {
                    body.marshal = Vec::new();
                }
                (&self.owned, None)
            }
            BufferKind::Reusable => {
                let scratch = ScratchBuffers {
                    send: std::mem::take(&mut body.buf),
                    marshal: std::mem::take(&mut body.marshal),
                };
                (&self.reusable, Some(scratch))
            }
        };
        if list.push(body).is_err() {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
        handed_back
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::Category;
    use crate::point::Encoding;

    #[test]
    fn the_one_where_released_bodies_come_back_blank() {
        let pool = BodyPool::new(4, 1 << 20);
        let mut b = pool.get();
        b.fill(Category::Logging, Encoding::LineProtocol, b"x f=1i 1", 1);
        b.set_header("X-Test", "1");
        assert!(pool.release(b).is_none(), "owned bodies keep their buffers");

        let again = pool.get();
        assert_eq!(again.kind(), BufferKind::Owned);
        assert!(again.payload().is_empty() && again.headers().is_empty());
        assert_eq!(again.npts(), None);
        assert_eq!(pool.stats(), PoolStats { hits: 1, misses: 1, drops: 0 });
    }

    #[test]
    fn the_one_where_borrowed_buffers_are_returned_to_their_owner() {
        let pool = BodyPool::new(2, 1 << 20);
        let scratch = ScratchBuffers::with_capacity(4096);
        let mut b = pool.get_with(scratch);
        assert_eq!(b.kind(), BufferKind::Reusable);
        b.fill(Category::Tracing, Encoding::Json, b"[]", 1);

        let back = pool.release(b).expect("💀 reusable body must hand its buffers back");
        assert!(back.send.is_empty(), "handed back cleared");
        assert!(back.send.capacity() >= 4096, "handed back still allocated");
        assert!(back.marshal.capacity() >= 4096);
    }

    #[test]
    fn the_one_where_a_full_shelf_just_drops_the_extra() {
        let pool = BodyPool::new(1, 1 << 20);
        let (a, b) = (pool.get(), pool.get());
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.stats().drops, 1);
    }

    #[test]
    fn the_one_where_chonky_buffers_are_not_hoarded() {
        let pool = BodyPool::new(2, 16);
        let mut b = pool.get();
        b.fill(Category::Logging, Encoding::LineProtocol, &[b'x'; 64], 1);
        pool.release(b);
        assert_eq!(pool.get().buf.capacity(), 0);
    }
}
