use std::fmt;
use std::fs::File;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::metrics;

/// Receives segments back from released [`PooledBuffer`] chains.
///
/// Implemented by buffer pools. A chain is returned with one `recycle` call
/// per run of consecutive segments owned by the same recycler.
pub trait BufferRecycler: Send + Sync + 'static {
    /// Take back the storage of released memory segments.
    fn recycle(&self, storage: Vec<Box<[u8]>>);

    /// A file-backed segment created by this recycler's pool was released.
    fn release_file(&self) {}
}

/// Callback invoked exactly once when a file-backed segment is released.
///
/// Receives the file handle back and whether every byte of the region
/// reached the wire. Dropping the handle closes the file.
pub type FileCompletion = Box<dyn FnOnce(File, bool) + Send>;

/// What backs a single segment of a [`PooledBuffer`] chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Memory owned by a pool, returned on release.
    Pooled,
    /// Shared bytes not owned by any pool.
    Unpooled,
    /// A region of a file, transmitted without copying into memory.
    File,
}

struct FileRegion {
    file: Option<File>,
    offset: u64,
    length: u64,
    sent: u64,
    on_complete: Option<FileCompletion>,
    recycler: Option<Arc<dyn BufferRecycler>>,
}

impl FileRegion {
    fn complete(mut self) {
        let fully_written = self.sent == self.length;
        if let (Some(file), Some(on_complete)) = (self.file.take(), self.on_complete.take()) {
            // Runs wherever the chain is dropped, often on a listener thread.
            let run = AssertUnwindSafe(move || on_complete(file, fully_written));
            if panic::catch_unwind(run).is_err() {
                metrics::SERVICER_PANICS.increment();
                warn!(
                    offset = self.offset,
                    length = self.length,
                    "file completion callback panicked"
                );
            }
        }
        if let Some(recycler) = self.recycler.take() {
            recycler.release_file();
        }
    }
}

enum Segment {
    Pooled {
        storage: Box<[u8]>,
        len: usize,
        recycler: Arc<dyn BufferRecycler>,
    },
    Unpooled(Bytes),
    File(FileRegion),
    Released,
}

/// A fixed-capacity byte buffer, optionally chained to further buffers.
///
/// The chain is singly linked and each node exclusively owns its successor.
/// Dropping the head releases every segment of the chain: memory goes back
/// to its pool and file regions fire their completion callback. Because
/// release is a move, a segment cannot be released twice or used after
/// release.
pub struct PooledBuffer {
    segment: Segment,
    next: Option<Box<PooledBuffer>>,
}

impl PooledBuffer {
    /// Wrap pool-owned storage. Used by [`BufferPool`](super::BufferPool)
    /// implementations; the storage is handed back to `recycler` on release.
    pub fn pooled(storage: Box<[u8]>, recycler: Arc<dyn BufferRecycler>) -> Self {
        PooledBuffer {
            segment: Segment::Pooled {
                storage,
                len: 0,
                recycler,
            },
            next: None,
        }
    }

    /// Wrap shared bytes without copying. The segment belongs to no pool.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        PooledBuffer {
            segment: Segment::Unpooled(data.into()),
            next: None,
        }
    }

    /// Wrap `length` bytes of `file` starting at `offset`.
    ///
    /// `on_complete` receives the file back when the segment is released.
    /// Used by [`BufferPool::acquire_file_backed`](super::BufferPool::acquire_file_backed).
    pub fn file_region(
        file: File,
        offset: u64,
        length: u64,
        on_complete: FileCompletion,
        recycler: Option<Arc<dyn BufferRecycler>>,
    ) -> Self {
        PooledBuffer {
            segment: Segment::File(FileRegion {
                file: Some(file),
                offset,
                length,
                sent: 0,
                on_complete: Some(on_complete),
                recycler,
            }),
            next: None,
        }
    }

    pub fn kind(&self) -> BufferKind {
        match self.segment {
            Segment::Pooled { .. } | Segment::Released => BufferKind::Pooled,
            Segment::Unpooled(_) => BufferKind::Unpooled,
            Segment::File(_) => BufferKind::File,
        }
    }

    /// Total bytes this segment can hold.
    pub fn capacity(&self) -> usize {
        match &self.segment {
            Segment::Pooled { storage, .. } => storage.len(),
            Segment::Unpooled(data) => data.len(),
            Segment::File(region) => region.length as usize,
            Segment::Released => 0,
        }
    }

    /// Bytes written into this segment (the write position).
    pub fn len(&self) -> usize {
        match &self.segment {
            Segment::Pooled { len, .. } => *len,
            Segment::Unpooled(data) => data.len(),
            Segment::File(region) => region.length as usize,
            Segment::Released => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes that can still be written into this segment.
    pub fn remaining_capacity(&self) -> usize {
        match &self.segment {
            Segment::Pooled { storage, len, .. } => storage.len() - len,
            _ => 0,
        }
    }

    /// The written bytes of a memory segment. Empty for file regions.
    pub fn data(&self) -> &[u8] {
        match &self.segment {
            Segment::Pooled { storage, len, .. } => &storage[..*len],
            Segment::Unpooled(data) => data,
            _ => &[],
        }
    }

    /// Unwritten space of a pooled segment, to be followed by [`advance`](Self::advance).
    pub fn spare_capacity_mut(&mut self) -> &mut [u8] {
        match &mut self.segment {
            Segment::Pooled { storage, len, .. } => &mut storage[*len..],
            _ => &mut [],
        }
    }

    /// Move the write position forward after filling spare capacity.
    pub fn advance(&mut self, n: usize) {
        if let Segment::Pooled { storage, len, .. } = &mut self.segment {
            debug_assert!(*len + n <= storage.len(), "advance({n}) past capacity");
            *len = (*len + n).min(storage.len());
        }
    }

    /// Copy as much of `src` as fits. Returns the number of bytes copied.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let spare = self.spare_capacity_mut();
        let n = spare.len().min(src.len());
        spare[..n].copy_from_slice(&src[..n]);
        self.advance(n);
        n
    }

    /// Reset the write position of a pooled segment.
    pub fn clear(&mut self) {
        if let Segment::Pooled { len, .. } = &mut self.segment {
            *len = 0;
        }
    }

    pub fn next(&self) -> Option<&PooledBuffer> {
        self.next.as_deref()
    }

    /// Replace the successor, returning the previous one.
    pub fn set_next(&mut self, next: PooledBuffer) -> Option<PooledBuffer> {
        self.next.replace(Box::new(next)).map(|b| *b)
    }

    /// Detach and return the rest of the chain.
    pub fn take_next(&mut self) -> Option<PooledBuffer> {
        self.next.take().map(|b| *b)
    }

    /// Link `tail` after the last segment of this chain.
    pub fn append(&mut self, tail: PooledBuffer) {
        let mut slot = &mut self.next;
        while let Some(node) = slot {
            slot = &mut node.next;
        }
        *slot = Some(Box::new(tail));
    }

    /// Iterate over every segment of the chain, starting with this one.
    pub fn segments(&self) -> Segments<'_> {
        Segments { cur: Some(self) }
    }

    /// Readable bytes across the whole chain.
    pub fn chain_len(&self) -> u64 {
        self.segments().map(|s| s.len() as u64).sum()
    }

    /// Bytes held in memory across the chain, leaving out file regions.
    pub fn memory_len(&self) -> u64 {
        self.segments().map(|s| s.data().len() as u64).sum()
    }

    /// Number of segments in the chain.
    pub fn segment_count(&self) -> usize {
        self.segments().count()
    }

    /// Copy the memory segments of the chain into one vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.chain_len() as usize);
        for segment in self.segments() {
            out.extend_from_slice(segment.data());
        }
        out
    }

    pub(crate) fn segment_mut(&mut self, index: usize) -> Option<&mut PooledBuffer> {
        let mut cur = Some(self);
        for _ in 0..index {
            cur = cur?.next.as_deref_mut();
        }
        cur
    }

    /// File handle and region position for the unsent part of a file segment.
    pub(crate) fn file_cursor(&self) -> Option<(&File, u64)> {
        match &self.segment {
            Segment::File(region) => region.file.as_ref().map(|f| (f, region.offset)),
            _ => None,
        }
    }

    /// Record how far into a file segment transmission has progressed.
    pub(crate) fn set_file_sent(&mut self, sent: u64) {
        if let Segment::File(region) = &mut self.segment {
            region.sent = sent.min(region.length);
        }
    }
}

/// Iterator over the segments of a chain.
pub struct Segments<'a> {
    cur: Option<&'a PooledBuffer>,
}

impl<'a> Iterator for Segments<'a> {
    type Item = &'a PooledBuffer;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.cur?;
        self.cur = cur.next.as_deref();
        Some(cur)
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("kind", &self.kind())
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("segments", &self.segment_count())
            .finish()
    }
}

/// Groups released storage so each recycler sees one call per run.
#[derive(Default)]
struct ReleaseBatch {
    recycler: Option<Arc<dyn BufferRecycler>>,
    storage: Vec<Box<[u8]>>,
}

impl ReleaseBatch {
    fn push(&mut self, segment: &mut Segment) {
        match mem::replace(segment, Segment::Released) {
            Segment::Pooled {
                storage, recycler, ..
            } => {
                if let Some(current) = &self.recycler
                    && !Arc::ptr_eq(current, &recycler)
                {
                    self.flush();
                }
                self.recycler = Some(recycler);
                self.storage.push(storage);
            }
            Segment::File(region) => region.complete(),
            Segment::Unpooled(_) | Segment::Released => {}
        }
    }

    fn flush(&mut self) {
        if let Some(recycler) = self.recycler.take()
            && !self.storage.is_empty()
        {
            recycler.recycle(mem::take(&mut self.storage));
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if matches!(self.segment, Segment::Released) && self.next.is_none() {
            return;
        }
        // Unlink iteratively so long chains do not recurse.
        let mut batch = ReleaseBatch::default();
        batch.push(&mut self.segment);
        let mut next = self.next.take();
        while let Some(mut node) = next {
            batch.push(&mut node.segment);
            next = node.next.take();
        }
        batch.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRecycler {
        calls: AtomicUsize,
        segments: AtomicUsize,
    }

    impl BufferRecycler for CountingRecycler {
        fn recycle(&self, storage: Vec<Box<[u8]>>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.segments.fetch_add(storage.len(), Ordering::SeqCst);
        }
    }

    fn segment(recycler: &Arc<CountingRecycler>, size: usize) -> PooledBuffer {
        PooledBuffer::pooled(vec![0u8; size].into_boxed_slice(), recycler.clone())
    }

    #[test]
    fn write_respects_capacity() {
        let recycler = Arc::new(CountingRecycler::default());
        let mut buf = segment(&recycler, 4);
        assert_eq!(buf.write(b"abcdef"), 4);
        assert_eq!(buf.data(), b"abcd");
        assert_eq!(buf.remaining_capacity(), 0);
        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn chain_is_released_in_one_call() {
        let recycler = Arc::new(CountingRecycler::default());
        let mut head = segment(&recycler, 8);
        head.write(b"one");
        let mut second = segment(&recycler, 8);
        second.write(b"two");
        head.append(second);
        head.append(PooledBuffer::from_bytes(&b"three"[..]));
        head.append(segment(&recycler, 8));

        assert_eq!(head.segment_count(), 4);
        assert_eq!(head.to_vec(), b"onetwothree");
        drop(head);

        assert_eq!(recycler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(recycler.segments.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn take_next_splits_ownership() {
        let recycler = Arc::new(CountingRecycler::default());
        let mut head = segment(&recycler, 8);
        head.set_next(segment(&recycler, 8));

        let tail = head.take_next().unwrap();
        drop(head);
        assert_eq!(recycler.segments.load(Ordering::SeqCst), 1);
        drop(tail);
        assert_eq!(recycler.segments.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn long_chain_drop_does_not_recurse() {
        let recycler = Arc::new(CountingRecycler::default());
        let mut head = segment(&recycler, 1);
        for _ in 0..100_000 {
            let mut node = segment(&recycler, 1);
            node.set_next(head);
            head = node;
        }
        drop(head);
        assert_eq!(recycler.segments.load(Ordering::SeqCst), 100_001);
    }

    #[test]
    fn file_region_reports_partial_send() {
        let path = std::env::temp_dir().join(format!("sockmux-pooled-{}", std::process::id()));
        std::fs::write(&path, b"0123456789").unwrap();
        let file = File::open(&path).unwrap();

        let result = Arc::new(AtomicUsize::new(0));
        let seen = result.clone();
        let mut buf = PooledBuffer::file_region(
            file,
            2,
            5,
            Box::new(move |_file, complete| {
                seen.store(if complete { 2 } else { 1 }, Ordering::SeqCst);
            }),
            None,
        );
        assert_eq!(buf.kind(), BufferKind::File);
        assert_eq!(buf.len(), 5);
        buf.set_file_sent(3);
        drop(buf);

        assert_eq!(result.load(Ordering::SeqCst), 1);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn panicking_completion_still_releases_chain() {
        let path = std::env::temp_dir().join(format!("sockmux-pooled-panic-{}", std::process::id()));
        std::fs::write(&path, b"0123456789").unwrap();
        let file = File::open(&path).unwrap();

        let recycler = Arc::new(CountingRecycler::default());
        let mut head = segment(&recycler, 8);
        head.append(PooledBuffer::file_region(
            file,
            0,
            10,
            Box::new(|_file, _complete| panic!("completion failed")),
            None,
        ));
        head.append(segment(&recycler, 8));
        drop(head);

        assert_eq!(recycler.segments.load(Ordering::SeqCst), 2);
        std::fs::remove_file(&path).unwrap();
    }
}
