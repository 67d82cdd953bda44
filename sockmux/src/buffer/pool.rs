use std::cell::RefCell;
use std::fs::File;
use std::io;
use std::ptr;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::pooled::{BufferRecycler, FileCompletion, PooledBuffer};
use crate::config::{BufferConfig, BufferStrategy};

/// Source of [`PooledBuffer`]s shared by every listener thread.
///
/// `acquire` never blocks and never fails: pools grow on demand.
pub trait BufferPool: Send + Sync + 'static {
    /// Take an empty memory buffer from the pool.
    fn acquire(&self) -> PooledBuffer;

    /// Wrap a file region without copying it.
    ///
    /// `on_complete(file, fully_written)` fires exactly once, when the segment
    /// is released after transmission or abandoned. If the region is invalid
    /// the callback fires immediately with `false` and an error is returned.
    fn acquire_file_backed(
        &self,
        file: File,
        offset: u64,
        length: u64,
        on_complete: FileCompletion,
    ) -> io::Result<PooledBuffer>;

    /// Return a whole chain to the pool. Equivalent to dropping it.
    fn release(&self, chain: PooledBuffer) {
        drop(chain);
    }

    /// Capacity of each buffer returned by [`acquire`](Self::acquire).
    fn buffer_size(&self) -> usize;

    /// Acquire/release totals, for leak checks.
    fn stats(&self) -> PoolStats;
}

/// Snapshot of a pool's acquire and release totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub acquired: u64,
    pub released: u64,
}

impl PoolStats {
    /// Buffers currently held outside the pool.
    pub fn outstanding(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

thread_local! {
    /// Per-thread segment caches, one per live pool.
    static LOCAL_CACHE: RefCell<Vec<LocalSegments>> = const { RefCell::new(Vec::new()) };
}

struct LocalSegments {
    pool: Weak<PoolCore>,
    segments: Vec<Box<[u8]>>,
}

struct PoolCore {
    this: Weak<PoolCore>,
    buffer_size: usize,
    strategy: BufferStrategy,
    local_limit: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl PoolCore {
    fn allocate(&self) -> Box<[u8]> {
        vec![0u8; self.buffer_size].into_boxed_slice()
    }

    fn take_storage(&self) -> Box<[u8]> {
        match self.strategy {
            BufferStrategy::Unpooled => self.allocate(),
            BufferStrategy::Pooled => {
                let reused = self.free.lock().pop();
                reused.unwrap_or_else(|| self.allocate())
            }
            BufferStrategy::ThreadLocal => {
                let local = LOCAL_CACHE
                    .try_with(|cache| {
                        let mut cache = cache.borrow_mut();
                        let idx = self.local_index(&mut cache)?;
                        cache[idx].segments.pop()
                    })
                    .ok()
                    .flatten();
                local
                    .or_else(|| self.free.lock().pop())
                    .unwrap_or_else(|| self.allocate())
            }
        }
    }

    /// Find this pool's entry in a thread cache. Entries of dropped pools
    /// are evicted first, so a reused allocation address cannot match.
    fn local_index(&self, cache: &mut Vec<LocalSegments>) -> Option<usize> {
        cache.retain(|entry| entry.pool.strong_count() > 0);
        cache
            .iter()
            .position(|entry| ptr::eq(entry.pool.as_ptr(), self))
    }

    /// Keep up to `local_limit` segments in this thread's cache; hand back the rest.
    fn cache_locally(&self, mut storage: Vec<Box<[u8]>>) -> Vec<Box<[u8]>> {
        // With the TLS slot already torn down everything spills to the shared list.
        let _ = LOCAL_CACHE.try_with(|cache| {
            let mut cache = cache.borrow_mut();
            let idx = match self.local_index(&mut cache) {
                Some(idx) => idx,
                None => {
                    cache.push(LocalSegments {
                        pool: self.this.clone(),
                        segments: Vec::new(),
                    });
                    cache.len() - 1
                }
            };
            let segments = &mut cache[idx].segments;
            while segments.len() < self.local_limit {
                match storage.pop() {
                    Some(s) => segments.push(s),
                    None => break,
                }
            }
        });
        storage
    }
}

impl BufferRecycler for PoolCore {
    fn recycle(&self, storage: Vec<Box<[u8]>>) {
        self.released
            .fetch_add(storage.len() as u64, Ordering::Relaxed);
        match self.strategy {
            BufferStrategy::Unpooled => drop(storage),
            BufferStrategy::Pooled => self.free.lock().extend(storage),
            BufferStrategy::ThreadLocal => {
                let rest = self.cache_locally(storage);
                if !rest.is_empty() {
                    self.free.lock().extend(rest);
                }
            }
        }
    }

    fn release_file(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// The default [`BufferPool`]: fixed-size segments managed per [`BufferStrategy`].
///
/// Free-list mutations are serialized by a mutex; the pool is the one
/// structure every listener thread touches.
#[derive(Clone)]
pub struct StreamBufferPool {
    core: Arc<PoolCore>,
}

impl StreamBufferPool {
    pub fn new(buffer_size: usize, strategy: BufferStrategy) -> Self {
        Self::with_thread_cache(buffer_size, strategy, 64)
    }

    /// Create a pool whose [`BufferStrategy::ThreadLocal`] caches hold up to
    /// `local_limit` segments per thread.
    pub fn with_thread_cache(
        buffer_size: usize,
        strategy: BufferStrategy,
        local_limit: usize,
    ) -> Self {
        StreamBufferPool {
            core: Arc::new_cyclic(|this| PoolCore {
                this: this.clone(),
                buffer_size,
                strategy,
                local_limit,
                free: Mutex::new(Vec::new()),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &BufferConfig) -> Self {
        Self::with_thread_cache(config.size, config.strategy, config.thread_local_cache)
    }

    pub fn strategy(&self) -> BufferStrategy {
        self.core.strategy
    }

    /// Segments waiting on the shared free list.
    pub fn free_count(&self) -> usize {
        self.core.free.lock().len()
    }

    fn recycler(&self) -> Arc<dyn BufferRecycler> {
        self.core.clone()
    }
}

impl BufferPool for StreamBufferPool {
    fn acquire(&self) -> PooledBuffer {
        self.core.acquired.fetch_add(1, Ordering::Relaxed);
        PooledBuffer::pooled(self.core.take_storage(), self.recycler())
    }

    fn acquire_file_backed(
        &self,
        file: File,
        offset: u64,
        length: u64,
        on_complete: FileCompletion,
    ) -> io::Result<PooledBuffer> {
        let file_len = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                on_complete(file, false);
                return Err(e);
            }
        };
        let end = offset.checked_add(length);
        if end.is_none_or(|end| end > file_len) {
            on_complete(file, false);
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("file region {offset}+{length} exceeds file length {file_len}"),
            ));
        }
        self.core.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(PooledBuffer::file_region(
            file,
            offset,
            length,
            on_complete,
            Some(self.recycler()),
        ))
    }

    fn buffer_size(&self) -> usize {
        self.core.buffer_size
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.core.acquired.load(Ordering::Relaxed),
            released: self.core.released.load(Ordering::Relaxed),
        }
    }
}
