mod pool;
mod pooled;
pub(crate) mod transmit;
mod writer;

pub use pool::{BufferPool, PoolStats, StreamBufferPool};
pub use pooled::{BufferKind, BufferRecycler, FileCompletion, PooledBuffer, Segments};
pub use writer::BufferChainWriter;
