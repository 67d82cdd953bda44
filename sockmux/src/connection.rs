use std::any::Any;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::warn;

use crate::buffer::transmit::{Progress, Transmit, TransmitError};
use crate::buffer::{BufferChainWriter, BufferPool, PooledBuffer};
use crate::handler::ConnectionService;
use crate::metrics;
use crate::response::{
    CancelHandle, FallbackProducer, FilledResponse, Response, ResponseQueue, ResponseWriter,
};

/// Opaque connection token.
/// Encodes the connection index and generation for stale detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnToken {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ConnToken {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        ConnToken { index, generation }
    }

    /// Returns the connection slot index within its listener.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub(crate) fn mio_token(&self) -> Token {
        Token(self.index as usize)
    }
}

/// The part of a connection visible to handles on other threads.
pub(crate) struct ConnShared {
    token: ConnToken,
    owner: ThreadId,
    peer: SocketAddr,
    reading: AtomicBool,
    closed: AtomicBool,
}

impl ConnShared {
    /// Create shared state owned by the calling (listener) thread.
    pub(crate) fn new(token: ConnToken, peer: SocketAddr) -> Self {
        ConnShared {
            token,
            owner: thread::current().id(),
            peer,
            reading: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn token(&self) -> ConnToken {
        self.token
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn is_owner(&self) -> bool {
        thread::current().id() == self.owner
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    pub(crate) fn set_reading(&self, reading: bool) {
        self.reading.store(reading, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flag the connection closed. Returns whether it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        self.reading.store(false, Ordering::Release);
        self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Why a connection is being closed.
#[derive(Debug)]
pub(crate) enum CloseReason {
    PeerClosed,
    Cancelled,
    Shutdown,
    Io(io::Error),
    Protocol(io::Error),
    File(io::Error),
    Panic(&'static str),
}

/// One step of the read loop.
pub(crate) enum ReadStep {
    /// Bytes were read and serviced.
    Serviced,
    /// The socket has no more data for now.
    Drained,
    /// The peer shut down its write side.
    Eof,
}

enum Outgoing {
    Response {
        fallback: Option<FallbackProducer>,
        cancel: Option<CancelHandle>,
    },
    Immediate,
}

struct InFlight {
    transmit: Transmit,
    kind: Outgoing,
}

/// Per-connection state, confined to the owning listener thread.
pub(crate) struct Connection {
    stream: TcpStream,
    shared: Arc<ConnShared>,
    service: Box<dyn ConnectionService>,
    read_buf: Option<PooledBuffer>,
    responses: ResponseQueue,
    immediates: VecDeque<PooledBuffer>,
    immediate_bytes: u64,
    in_flight: Option<InFlight>,
    interest: Option<Interest>,
    /// Readable data may remain unread (the last read loop stopped early).
    pub(crate) read_pending: bool,
    /// The peer sent EOF; close once output drains.
    pub(crate) peer_closed: bool,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        shared: Arc<ConnShared>,
        service: Box<dyn ConnectionService>,
    ) -> Self {
        Connection {
            stream,
            shared,
            service,
            read_buf: None,
            responses: ResponseQueue::new(),
            immediates: VecDeque::new(),
            immediate_bytes: 0,
            in_flight: None,
            interest: None,
            read_pending: false,
            peer_closed: false,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ConnShared> {
        &self.shared
    }

    /// Read once into the current buffer and pass the bytes to the socket
    /// servicer.
    pub(crate) fn read_and_service(
        &mut self,
        pool: &dyn BufferPool,
    ) -> Result<ReadStep, CloseReason> {
        let is_new = match &self.read_buf {
            Some(buf) => buf.remaining_capacity() == 0,
            None => true,
        };
        if is_new {
            // The full buffer goes back to the pool before the next is taken.
            self.read_buf = None;
            self.read_buf = Some(pool.acquire());
        }
        let Some(buf) = self.read_buf.as_mut() else {
            return Ok(ReadStep::Drained);
        };

        let n = loop {
            match self.stream.read(buf.spare_capacity_mut()) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadStep::Drained);
                }
                Err(e) => return Err(CloseReason::Io(e)),
            }
        };
        if n == 0 {
            return Ok(ReadStep::Eof);
        }
        buf.advance(n);
        metrics::BYTES_RECEIVED.add(n as u64);

        let service = &mut self.service;
        let buf = &*buf;
        match panic::catch_unwind(AssertUnwindSafe(|| service.on_read(buf, n, is_new))) {
            Ok(Ok(())) => Ok(ReadStep::Serviced),
            Ok(Err(e)) => Err(CloseReason::Protocol(e)),
            Err(_) => Err(CloseReason::Panic("socket servicer")),
        }
    }

    pub(crate) fn idle(&mut self) -> Result<(), CloseReason> {
        let service = &mut self.service;
        panic::catch_unwind(AssertUnwindSafe(|| service.on_idle()))
            .map_err(|_| CloseReason::Panic("idle callback"))
    }

    /// Hand a decoded request and a fresh response slot to the request
    /// servicer.
    pub(crate) fn dispatch(
        &mut self,
        request: Box<dyn Any>,
        writer: impl FnOnce(u64) -> ResponseWriter,
    ) -> Result<(), CloseReason> {
        let slot = self.responses.reserve();
        let writer = writer(slot);
        let service = &mut self.service;
        let cancel = panic::catch_unwind(AssertUnwindSafe(|| service.on_request(request, writer)))
            .map_err(|_| CloseReason::Panic("request servicer"))?;
        if let Some(handle) = cancel {
            // A slot already written has nothing left to cancel.
            drop(self.responses.set_cancel(slot, handle));
        }
        Ok(())
    }

    pub(crate) fn push_immediate(&mut self, buffer: PooledBuffer) {
        self.immediate_bytes += buffer.memory_len();
        self.immediates.push_back(buffer);
    }

    /// Build the bytes of a filled response and store them in its slot.
    pub(crate) fn fill(
        &mut self,
        slot: u64,
        response: Response,
        pool: &dyn BufferPool,
    ) -> Result<(), CloseReason> {
        let mut writer = BufferChainWriter::new(pool);
        if let Some(header) = response.header {
            match panic::catch_unwind(AssertUnwindSafe(|| header(&mut writer))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(CloseReason::Protocol(e)),
                Err(_) => return Err(CloseReason::Panic("header producer")),
            }
        }
        if let Some(body) = response.body {
            writer.push_chain(body);
        }
        let chain = writer.finish();
        let bytes = chain.as_ref().map_or(0, PooledBuffer::memory_len);
        let filled = FilledResponse {
            chain,
            bytes,
            fallback: response.fallback,
            cancel: None,
        };
        // A slot filled twice keeps its first response.
        drop(self.responses.fill(slot, filled));
        Ok(())
    }

    /// Memory bytes accepted for output but not yet on the wire. File
    /// regions waiting to be sent are left out.
    pub(crate) fn outstanding(&self) -> u64 {
        let in_flight = self.in_flight.as_ref().map_or(0, |f| f.transmit.buffered());
        self.responses.filled_bytes() + self.immediate_bytes + in_flight
    }

    /// Nothing queued or being written.
    pub(crate) fn output_idle(&self) -> bool {
        self.in_flight.is_none() && self.immediates.is_empty() && self.responses.is_empty()
    }

    /// Write queued output until the socket blocks or nothing is ready.
    ///
    /// Immediate data goes out at the next response boundary; responses go
    /// out strictly in slot order and an unfilled head stops the queue.
    pub(crate) fn flush(&mut self, pool: &dyn BufferPool) -> Result<(), CloseReason> {
        loop {
            if self.in_flight.is_none() && !self.start_next() {
                return Ok(());
            }
            let Some(flight) = self.in_flight.as_mut() else {
                return Ok(());
            };
            match flight.transmit.write_to(&mut self.stream) {
                Ok(Progress::Complete) => {
                    // Releases the chain; a written response has nothing to cancel.
                    self.in_flight = None;
                }
                Ok(Progress::Blocked) => return Ok(()),
                Err(TransmitError::Socket(e)) => return Err(CloseReason::Io(e)),
                Err(TransmitError::File(e)) => {
                    metrics::FILE_FAILURES.increment();
                    let fallback = match &mut flight.kind {
                        Outgoing::Response { fallback, .. } if !flight.transmit.started() => {
                            fallback.take()
                        }
                        _ => None,
                    };
                    let Some(fallback) = fallback else {
                        return Err(CloseReason::File(e));
                    };
                    warn!(
                        peer = %self.shared.peer_addr(),
                        error = %e,
                        "file-backed response failed, sending fallback"
                    );
                    let mut writer = BufferChainWriter::new(pool);
                    match panic::catch_unwind(AssertUnwindSafe(|| fallback(&e, &mut writer))) {
                        Ok(Ok(())) => flight.transmit.replace(writer.finish()),
                        Ok(Err(_)) => return Err(CloseReason::File(e)),
                        Err(_) => return Err(CloseReason::Panic("fallback producer")),
                    }
                }
            }
        }
    }

    fn start_next(&mut self) -> bool {
        if let Some(buffer) = self.immediates.pop_front() {
            self.immediate_bytes -= buffer.memory_len();
            self.in_flight = Some(InFlight {
                transmit: Transmit::new(Some(buffer)),
                kind: Outgoing::Immediate,
            });
            return true;
        }
        match self.responses.pop_ready() {
            Some(response) => {
                self.in_flight = Some(InFlight {
                    transmit: Transmit::new(response.chain),
                    kind: Outgoing::Response {
                        fallback: response.fallback,
                        cancel: response.cancel,
                    },
                });
                true
            }
            None => false,
        }
    }

    /// Whether reading should be enabled, updating the flag seen by handles.
    /// Returns `(want_read, newly_engaged)`.
    pub(crate) fn update_reading(&mut self, threshold: u64) -> (bool, bool) {
        let want = !self.peer_closed && !self.shared.is_closed() && self.outstanding() <= threshold;
        let was = self.shared.is_reading();
        if want != was {
            self.shared.set_reading(want);
        }
        (want, was && !want)
    }

    /// Bring the selector registration in line with what the connection
    /// currently needs.
    pub(crate) fn apply_interest(&mut self, registry: &Registry, want_read: bool) -> io::Result<()> {
        let want_write = self.in_flight.is_some();
        let interest = match (want_read, want_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        if interest == self.interest {
            return Ok(());
        }
        let token = self.shared.token().mio_token();
        match (self.interest, interest) {
            (None, Some(i)) => registry.register(&mut self.stream, token, i)?,
            (Some(_), Some(i)) => registry.reregister(&mut self.stream, token, i)?,
            (Some(_), None) => registry.deregister(&mut self.stream)?,
            (None, None) => {}
        }
        self.interest = interest;
        Ok(())
    }

    /// Tear down: deregister, drop every queued buffer, and return the
    /// cancel handles of responses that never fully reached the wire.
    pub(crate) fn close(mut self, registry: &Registry) -> Vec<CancelHandle> {
        self.shared.mark_closed();
        if self.interest.take().is_some() {
            let _ = registry.deregister(&mut self.stream);
        }
        let mut cancels = self.responses.abandon();
        if let Some(InFlight {
            kind: Outgoing::Response {
                cancel: Some(handle),
                ..
            },
            ..
        }) = self.in_flight.take()
        {
            cancels.push(handle);
        }
        cancels
    }
}

struct Slot<T> {
    value: Option<T>,
    generation: u32,
}

/// Manages connection slots with a free list for O(1) allocation.
pub(crate) struct ConnectionTable<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
}

impl<T> ConnectionTable<T> {
    pub(crate) fn new(max_connections: u32) -> Self {
        let slots = (0..max_connections)
            .map(|_| Slot {
                value: None,
                generation: 0,
            })
            .collect();
        // Free list: indices in reverse order so pop gives lowest first.
        let free_list: Vec<u32> = (0..max_connections).rev().collect();
        ConnectionTable { slots, free_list }
    }

    /// Token the next [`insert`](Self::insert) will use, if a slot is free.
    pub(crate) fn vacant(&self) -> Option<ConnToken> {
        let idx = *self.free_list.last()?;
        Some(ConnToken::new(idx, self.slots[idx as usize].generation))
    }

    /// Occupy the slot returned by [`vacant`](Self::vacant).
    pub(crate) fn insert(&mut self, token: ConnToken, value: T) {
        debug_assert_eq!(self.free_list.last(), Some(&token.index));
        if self.free_list.last() == Some(&token.index) {
            self.free_list.pop();
            self.slots[token.index()].value = Some(value);
        }
    }

    /// Remove a live value. Stale tokens return `None`.
    pub(crate) fn remove(&mut self, token: ConnToken) -> Option<T> {
        let slot = self.slots.get_mut(token.index())?;
        if slot.generation != token.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(token.index);
        Some(value)
    }

    pub(crate) fn get_mut(&mut self, token: ConnToken) -> Option<&mut T> {
        self.slots
            .get_mut(token.index())
            .filter(|s| s.generation == token.generation)
            .and_then(|s| s.value.as_mut())
    }

    /// Current token of an occupied slot index.
    pub(crate) fn token_at(&self, index: usize) -> Option<ConnToken> {
        let slot = self.slots.get(index)?;
        slot.value
            .as_ref()
            .map(|_| ConnToken::new(index as u32, slot.generation))
    }

    /// Tokens of every live value.
    pub(crate) fn tokens(&self) -> Vec<ConnToken> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.value.is_some())
            .map(|(i, s)| ConnToken::new(i as u32, s.generation))
            .collect()
    }

    /// Number of active connections.
    pub(crate) fn active_count(&self) -> usize {
        self.slots.len().saturating_sub(self.free_list.len())
    }
}
