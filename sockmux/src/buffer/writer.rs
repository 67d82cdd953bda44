use std::io;

use super::pool::BufferPool;
use super::pooled::PooledBuffer;

/// `io::Write` over a chain of pooled buffers.
///
/// Acquires a new segment from the pool whenever the current one fills, so
/// arbitrarily long output is built without reallocating.
pub struct BufferChainWriter<'p> {
    pool: &'p dyn BufferPool,
    head: Option<PooledBuffer>,
    current: Option<PooledBuffer>,
    written: usize,
}

impl<'p> BufferChainWriter<'p> {
    pub fn new(pool: &'p dyn BufferPool) -> Self {
        BufferChainWriter {
            pool,
            head: None,
            current: None,
            written: 0,
        }
    }

    pub fn pool(&self) -> &'p dyn BufferPool {
        self.pool
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Link an existing chain (for example a file region) after the bytes
    /// written so far.
    pub fn push_chain(&mut self, chain: PooledBuffer) {
        self.seal_current();
        self.written += chain.chain_len() as usize;
        self.link(chain);
    }

    /// Finish writing and return the chain, or `None` if nothing was written.
    pub fn finish(mut self) -> Option<PooledBuffer> {
        self.seal_current();
        self.head.take()
    }

    fn seal_current(&mut self) {
        if let Some(current) = self.current.take() {
            self.link(current);
        }
    }

    fn link(&mut self, chain: PooledBuffer) {
        match &mut self.head {
            Some(head) => head.append(chain),
            None => self.head = Some(chain),
        }
    }
}

impl io::Write for BufferChainWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self
            .current
            .as_ref()
            .is_some_and(|c| c.remaining_capacity() == 0)
        {
            self.seal_current();
        }
        let pool = self.pool;
        let current = self.current.get_or_insert_with(|| pool.acquire());
        let n = current.write(buf);
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "buffer pool returned a zero-capacity buffer",
            ));
        }
        self.written += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
