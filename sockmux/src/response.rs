//! Ordered response slots and the writer handed to request servicers.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::buffer::{BufferChainWriter, BufferPool, PooledBuffer};
use crate::handler::HandlerContext;
use crate::mailbox::{Command, LocalOp, push_local};

/// Produces response header bytes when the response is queued for writing.
///
/// Runs on the connection's listener thread, before the body chain.
pub type HeaderProducer = Box<dyn FnOnce(&mut BufferChainWriter<'_>) -> io::Result<()> + Send>;

/// Produces a replacement response when a file-backed segment fails before
/// any byte of its response reached the wire.
pub type FallbackProducer =
    Box<dyn FnOnce(&io::Error, &mut BufferChainWriter<'_>) -> io::Result<()> + Send>;

/// Cancels work associated with a request if its connection closes before
/// the response is fully written.
pub struct CancelHandle(Box<dyn FnOnce() + Send>);

impl CancelHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        CancelHandle(Box::new(cancel))
    }

    pub(crate) fn cancel(self) {
        (self.0)()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CancelHandle")
    }
}

/// The content supplied by [`ResponseWriter::write`].
pub(crate) struct Response {
    pub header: Option<HeaderProducer>,
    pub body: Option<PooledBuffer>,
    pub fallback: Option<FallbackProducer>,
}

impl Response {
    fn empty() -> Self {
        Response {
            header: None,
            body: None,
            fallback: None,
        }
    }
}

/// Fills one reserved slot of a connection's response queue.
///
/// Each request handed to a [`RequestServicer`](crate::RequestServicer)
/// comes with a writer bound to the slot reserved for it when the request
/// was accepted. Responses reach the wire in slot order, whatever order the
/// writers are used in. A writer may be moved to any thread.
///
/// Dropping a writer without calling [`write`](Self::write) fills its slot
/// with an empty response so later responses are not held back.
pub struct ResponseWriter {
    ctx: HandlerContext,
    slot: u64,
    filled: bool,
}

impl ResponseWriter {
    pub(crate) fn new(ctx: HandlerContext, slot: u64) -> Self {
        ResponseWriter {
            ctx,
            slot,
            filled: false,
        }
    }

    /// Fill the slot with an optional header producer and body chain.
    ///
    /// A no-op once the connection has closed; the body is released.
    pub fn write(self, header: Option<HeaderProducer>, body: Option<PooledBuffer>) {
        self.fill(Response {
            header,
            body,
            fallback: None,
        });
    }

    /// Like [`write`](Self::write), with a producer that replaces the whole
    /// response if a file-backed segment of `body` fails before the first
    /// byte is sent.
    pub fn write_with_fallback(
        self,
        header: Option<HeaderProducer>,
        body: Option<PooledBuffer>,
        fallback: FallbackProducer,
    ) {
        self.fill(Response {
            header,
            body,
            fallback: Some(fallback),
        });
    }

    /// Pool to build response bodies from.
    pub fn buffer_pool(&self) -> &Arc<dyn BufferPool> {
        &self.ctx.pool
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.ctx.shared.peer_addr()
    }

    fn fill(mut self, response: Response) {
        self.filled = true;
        self.deliver(response);
    }

    fn deliver(&self, response: Response) {
        let shared = &self.ctx.shared;
        if shared.is_closed() {
            return;
        }
        let token = shared.token();
        if shared.is_owner() {
            push_local(LocalOp::Fill {
                token,
                slot: self.slot,
                response,
            });
        } else {
            self.ctx.mailbox.send(Command::Fill {
                token,
                slot: self.slot,
                response,
            });
        }
    }
}

impl Drop for ResponseWriter {
    fn drop(&mut self) {
        if !self.filled {
            self.deliver(Response::empty());
        }
    }
}

impl fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("token", &self.ctx.shared.token())
            .field("slot", &self.slot)
            .finish()
    }
}

/// A response whose bytes are known and ready to transmit.
pub(crate) struct FilledResponse {
    pub chain: Option<PooledBuffer>,
    /// Memory bytes of `chain`, for backpressure accounting.
    pub bytes: u64,
    pub fallback: Option<FallbackProducer>,
    pub cancel: Option<CancelHandle>,
}

enum Slot {
    Pending { cancel: Option<CancelHandle> },
    Filled(FilledResponse),
}

/// FIFO of response slots for one connection.
///
/// Slot ids are assigned consecutively, so the position of slot `id` is
/// `id - front_id`. Only the front slot is ever taken for writing.
pub(crate) struct ResponseQueue {
    front_id: u64,
    slots: VecDeque<Slot>,
    filled_bytes: u64,
}

impl ResponseQueue {
    pub(crate) fn new() -> Self {
        ResponseQueue {
            front_id: 0,
            slots: VecDeque::new(),
            filled_bytes: 0,
        }
    }

    /// Append an unfilled slot and return its id.
    pub(crate) fn reserve(&mut self) -> u64 {
        let id = self.front_id + self.slots.len() as u64;
        self.slots.push_back(Slot::Pending { cancel: None });
        id
    }

    fn slot_mut(&mut self, id: u64) -> Option<&mut Slot> {
        let pos = id.checked_sub(self.front_id)?;
        self.slots.get_mut(pos as usize)
    }

    /// Attach a cancel handle to a slot still in the queue. Returns the
    /// handle back if the slot is gone.
    pub(crate) fn set_cancel(&mut self, id: u64, handle: CancelHandle) -> Option<CancelHandle> {
        match self.slot_mut(id) {
            Some(Slot::Pending { cancel }) => {
                *cancel = Some(handle);
                None
            }
            Some(Slot::Filled(filled)) => {
                filled.cancel = Some(handle);
                None
            }
            None => Some(handle),
        }
    }

    /// Fill slot `id`. Returns the response back if the slot does not exist
    /// or was already filled.
    pub(crate) fn fill(
        &mut self,
        id: u64,
        mut response: FilledResponse,
    ) -> Result<(), FilledResponse> {
        let bytes = response.bytes;
        let Some(slot) = self.slot_mut(id) else {
            return Err(response);
        };
        let Slot::Pending { cancel } = &mut *slot else {
            return Err(response);
        };
        if response.cancel.is_none() {
            response.cancel = cancel.take();
        }
        *slot = Slot::Filled(response);
        self.filled_bytes += bytes;
        Ok(())
    }

    /// Take the front response if it has been filled.
    pub(crate) fn pop_ready(&mut self) -> Option<FilledResponse> {
        if !matches!(self.slots.front(), Some(Slot::Filled(_))) {
            return None;
        }
        match self.slots.pop_front() {
            Some(Slot::Filled(response)) => {
                self.front_id += 1;
                self.filled_bytes -= response.bytes;
                Some(response)
            }
            _ => None,
        }
    }

    /// Whether the front slot is filled.
    pub(crate) fn head_ready(&self) -> bool {
        matches!(self.slots.front(), Some(Slot::Filled(_)))
    }

    /// Bytes held by filled slots.
    pub(crate) fn filled_bytes(&self) -> u64 {
        self.filled_bytes
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Empty the queue, releasing every chain and returning the cancel
    /// handles of unwritten responses.
    pub(crate) fn abandon(&mut self) -> Vec<CancelHandle> {
        self.filled_bytes = 0;
        self.front_id += self.slots.len() as u64;
        self.slots
            .drain(..)
            .filter_map(|slot| match slot {
                Slot::Pending { cancel } => cancel,
                Slot::Filled(filled) => filled.cancel,
            })
            .collect()
    }
}
