//! Weight-byte access behind a uniform span interface.
//!
//! The forward pass addresses weights by `(offset, length)` handles. How the
//! bytes materialize depends on the access mode chosen at load time: a
//! memory map, a caller-supplied address region (for embedders that already
//! hold the blob), or a budgeted read-cache for targets without mmap.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use memmap2::Mmap;
use tracing::debug;

use crate::error::{ModelError, Result};

/// How checkpoint bytes are reached after construction.
pub enum AccessMode {
    /// Memory-map the checkpoint file.
    Mmap,
    /// Read tensors on demand, keeping at most `limit` bytes cached.
    ReadCache {
        /// Cache byte budget.
        limit: usize,
    },
    /// The caller already holds the checkpoint at `base` and guarantees the
    /// region outlives the model.
    Direct { base: *const u8, len: usize },
}

/// A caller-guaranteed in-memory checkpoint region.
pub struct DirectRegion {
    base: *const u8,
    len: usize,
}

// Safety: the embedder promises the region is immutable and outlives the
// model; it is only ever read.
unsafe impl Send for DirectRegion {}
unsafe impl Sync for DirectRegion {}

impl DirectRegion {
    /// # Safety
    /// `base..base + len` must be readable, immutable, and outlive the
    /// returned region.
    pub unsafe fn new(base: *const u8, len: usize) -> DirectRegion {
        DirectRegion { base, len }
    }

    pub fn bytes(&self) -> &[u8] {
        // Safety: constructor contract.
        unsafe { std::slice::from_raw_parts(self.base, self.len) }
    }
}

/// Byte buffer kept 4-aligned so cached float tensors can be viewed as
/// `&[f32]` without copying. Backed by a `Vec<f32>` solely for alignment.
struct AlignedBuf {
    words: Vec<f32>,
    len: usize,
}

impl AlignedBuf {
    fn alloc(len: usize) -> std::result::Result<AlignedBuf, ()> {
        let word_count = len.div_ceil(4);
        let mut words = Vec::new();
        words.try_reserve_exact(word_count).map_err(|_| ())?;
        words.resize(word_count, 0.0);
        Ok(AlignedBuf { words, len })
    }

    fn as_bytes(&self) -> &[u8] {
        // Safety: the backing allocation holds at least `len` bytes.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // Safety: as above, and the borrow is exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.len) }
    }
}

/// One cached tensor read. Entries are shared out as `Arc` so a span stays
/// valid across a matmul barrier even if the budget evicts the entry from
/// the list meanwhile.
pub struct CacheEntry {
    offset: u64,
    data: AlignedBuf,
    /// Hit counter, kept for statistics only; eviction ignores it.
    hits: AtomicU64,
}

impl CacheEntry {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }
}

struct CacheInner {
    file: File,
    /// LIFO: most recent insertion at the front, eviction from the back.
    entries: VecDeque<Arc<CacheEntry>>,
    total_bytes: usize,
}

/// Budgeted on-demand tensor cache for targets without mmap.
pub struct ReadCacheStore {
    limit: usize,
    inner: Mutex<CacheInner>,
}

impl ReadCacheStore {
    pub fn new(file: File, limit: usize) -> ReadCacheStore {
        ReadCacheStore {
            limit,
            inner: Mutex::new(CacheInner {
                file,
                entries: VecDeque::new(),
                total_bytes: 0,
            }),
        }
    }

    /// Serve an exact `(offset, len)` span, reading and caching on miss.
    ///
    /// One mutex covers lookup, eviction, allocation, and the read; callers
    /// from concurrent step threads simply serialize here.
    fn resolve(&self, offset: u64, len: usize) -> Result<Arc<CacheEntry>> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(entry) = inner
            .entries
            .iter()
            .find(|e| e.offset == offset && e.data.len == len)
        {
            entry.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.clone());
        }

        // Make room before inserting, so the live list never exceeds the
        // budget by more than the newest entry.
        while inner.total_bytes > self.limit {
            match inner.entries.pop_back() {
                Some(old) => {
                    inner.total_bytes -= old.data.len;
                    debug!(offset = old.offset, len = old.data.len, "evicting weight span");
                }
                None => break,
            }
        }

        let mut data =
            AlignedBuf::alloc(len).map_err(|_| ModelError::CacheAlloc { len })?;

        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(data.as_bytes_mut())?;

        let entry = Arc::new(CacheEntry {
            offset,
            data,
            hits: AtomicU64::new(0),
        });
        inner.total_bytes += len;
        inner.entries.push_front(entry.clone());
        Ok(entry)
    }

    /// Sum of live entry lengths, for tests and diagnostics.
    pub fn cached_bytes(&self) -> usize {
        self.inner.lock().unwrap().total_bytes
    }
}

/// The bytes behind every weight handle of one model.
pub enum WeightStore {
    Mmap(Mmap),
    Direct(DirectRegion),
    ReadCache(ReadCacheStore),
}

/// A resolved span of weight bytes, alive at least until dropped.
pub enum TensorSpan<'m> {
    Borrowed(&'m [u8]),
    Cached(Arc<CacheEntry>),
}

impl TensorSpan<'_> {
    pub fn bytes(&self) -> &[u8] {
        match self {
            TensorSpan::Borrowed(b) => b,
            TensorSpan::Cached(e) => e.data.as_bytes(),
        }
    }

    /// View the span as little-endian f32 values.
    ///
    /// The layout walker rejects misaligned float tensors at load, so this
    /// only fails on handles that were never validated.
    pub fn as_f32(&self) -> Result<&[f32]> {
        let bytes = self.bytes();
        // Safety: f32 has no invalid bit patterns; alignment is checked.
        let (pre, mid, post) = unsafe { bytes.align_to::<f32>() };
        if !pre.is_empty() || !post.is_empty() {
            return Err(ModelError::Misaligned { offset: 0 });
        }
        Ok(mid)
    }

    /// View the span as int8 quants.
    pub fn as_i8(&self) -> &[i8] {
        let bytes = self.bytes();
        // Safety: i8 and u8 share size and alignment.
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const i8, bytes.len()) }
    }
}

impl WeightStore {
    /// Resolve `len` bytes at `offset` into a span.
    ///
    /// Mmap and direct modes return the mapped bytes without locking; the
    /// read-cache serializes on its mutex.
    pub fn resolve(&self, offset: u64, len: usize) -> Result<TensorSpan<'_>> {
        match self {
            WeightStore::Mmap(map) => Ok(TensorSpan::Borrowed(slice_region(map, offset, len)?)),
            WeightStore::Direct(region) => {
                Ok(TensorSpan::Borrowed(slice_region(region.bytes(), offset, len)?))
            }
            WeightStore::ReadCache(cache) => cache.resolve(offset, len).map(TensorSpan::Cached),
        }
    }

    /// One-off copying read, used to materialize the embedding table at
    /// construction without occupying cache budget.
    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        match self {
            WeightStore::Mmap(_) | WeightStore::Direct(_) => {
                Ok(self.resolve(offset, len)?.bytes().to_vec())
            }
            WeightStore::ReadCache(cache) => {
                let mut inner = cache.inner.lock().unwrap();
                let mut data = vec![0u8; len];
                inner.file.seek(SeekFrom::Start(offset))?;
                inner.file.read_exact(&mut data)?;
                Ok(data)
            }
        }
    }
}

fn slice_region(bytes: &[u8], offset: u64, len: usize) -> Result<&[u8]> {
    let start = offset as usize;
    let end = start
        .checked_add(len)
        .ok_or(ModelError::SpanOutOfBounds {
            offset,
            len,
            total: bytes.len() as u64,
        })?;
    if end > bytes.len() {
        return Err(ModelError::SpanOutOfBounds {
            offset,
            len,
            total: bytes.len() as u64,
        });
    }
    Ok(&bytes[start..end])
}
