//! The per-thread event loop.
//!
//! Each listener owns a selector and every connection registered with it.
//! One loop iteration:
//!
//! 1. wait on the selector (bounded by `poll_timeout`),
//! 2. apply commands from other threads (registrations, executed callbacks,
//!    cross-thread response fills),
//! 3. on an empty wait, run every connection's idle callback,
//! 4. read from readable sockets, servicing each read immediately,
//! 5. flush output and recompute each touched connection's interest.
//!
//! Responses are flushed eagerly after they are filled; write interest is
//! only registered while a socket refuses bytes.

use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use mio::{Events, Poll, Token, Waker};
use tracing::{debug, error, warn};

use crate::buffer::BufferPool;
use crate::config::Config;
use crate::connection::{CloseReason, ConnShared, ConnToken, Connection, ConnectionTable, ReadStep};
use crate::counter;
use crate::error::Error;
use crate::handler::HandlerContext;
use crate::mailbox::{Command, LocalOp, Mailbox, Registration, Task, pop_local};
use crate::manager::ExitNotice;
use crate::metrics;
use crate::response::{Response, ResponseWriter};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Reads serviced per readiness event before yielding to other connections.
const MAX_READS_PER_EVENT: usize = 32;

/// Cross-thread view of a listener, held by the manager and acceptors.
#[derive(Clone)]
pub(crate) struct ListenerHandle {
    pub id: usize,
    pub mailbox: Mailbox,
    /// Connections registered or in flight to this listener.
    pub active: Arc<AtomicUsize>,
}

/// Start listener `id` on its own thread.
pub(crate) fn spawn(
    id: usize,
    config: &Config,
    pool: Arc<dyn BufferPool>,
    shutdown: Arc<AtomicBool>,
    exit: ExitNotice,
) -> Result<(ListenerHandle, thread::JoinHandle<()>), Error> {
    let poll = Poll::new()?;
    let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
    let (mailbox, commands) = Mailbox::new(waker);
    let active = Arc::new(AtomicUsize::new(0));
    let handle = ListenerHandle {
        id,
        mailbox: mailbox.clone(),
        active: active.clone(),
    };

    let max_connections = config.listener.max_connections;
    let events_capacity = config.events_capacity;
    let threshold = config.backpressure_threshold as u64;
    let poll_timeout = config.poll_timeout;

    let thread = thread::Builder::new()
        .name(format!("sockmux-listener-{id}"))
        .spawn(move || {
            let _exit = exit;
            counter::set_thread_shard(id);
            let mut listener = Listener {
                id,
                poll,
                events: Events::with_capacity(events_capacity),
                commands,
                mailbox,
                table: ConnectionTable::new(max_connections),
                active,
                shutdown,
                pool,
                threshold,
                poll_timeout,
                dirty: Vec::new(),
                retry_reads: Vec::new(),
            };
            listener.run();
        })?;
    Ok((handle, thread))
}

struct Listener {
    id: usize,
    poll: Poll,
    events: Events,
    commands: Receiver<Command>,
    mailbox: Mailbox,
    table: ConnectionTable<Connection>,
    active: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    pool: Arc<dyn BufferPool>,
    threshold: u64,
    poll_timeout: Duration,
    /// Connections whose output or interest must be recomputed.
    dirty: Vec<ConnToken>,
    /// Connections with unread input and read interest restored.
    retry_reads: Vec<ConnToken>,
}

struct Ready {
    index: usize,
    error: bool,
    readable: bool,
}

impl Listener {
    fn run(&mut self) {
        debug!(listener = self.id, "listener started");
        let mut ready = Vec::new();
        loop {
            let timeout = if self.retry_reads.is_empty() {
                self.poll_timeout
            } else {
                Duration::ZERO
            };
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(listener = self.id, error = %e, "selector wait failed");
                break;
            }

            self.drain_commands();
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            if self.events.is_empty() && self.retry_reads.is_empty() {
                self.idle_all();
            }

            ready.extend(
                self.events
                    .iter()
                    .filter(|event| event.token() != WAKER_TOKEN)
                    .map(|event| Ready {
                        index: event.token().0,
                        error: event.is_error(),
                        readable: event.is_readable() || event.is_read_closed(),
                    }),
            );
            for event in ready.drain(..) {
                let Some(token) = self.table.token_at(event.index) else {
                    continue;
                };
                if event.error {
                    let err = io::Error::other("socket error reported by selector");
                    self.close(token, CloseReason::Io(err));
                    continue;
                }
                if event.readable {
                    self.read_ready(token);
                }
                self.dirty.push(token);
            }

            for token in mem::take(&mut self.retry_reads) {
                self.read_ready(token);
                self.dirty.push(token);
            }

            self.drain_local();
            self.refresh_dirty();
        }
        self.close_all();
        debug!(listener = self.id, "listener stopped");
    }

    fn drain_commands(&mut self) {
        // Bounded so a busy sender cannot starve socket events.
        for _ in 0..self.commands.len() {
            let Ok(command) = self.commands.try_recv() else {
                break;
            };
            match command {
                Command::Register(registration) => self.register(registration),
                Command::Execute { token, task } => self.execute(token, task),
                Command::Fill {
                    token,
                    slot,
                    response,
                } => self.fill(token, slot, response),
                Command::Close(token) => self.close(token, CloseReason::Cancelled),
            }
            self.drain_local();
        }
    }

    fn drain_local(&mut self) {
        while let Some(op) = pop_local() {
            match op {
                LocalOp::Request { token, request } => {
                    let Some(conn) = self.table.get_mut(token) else {
                        continue;
                    };
                    let ctx = HandlerContext {
                        shared: conn.shared().clone(),
                        mailbox: self.mailbox.clone(),
                        pool: self.pool.clone(),
                    };
                    let result = conn.dispatch(request, |slot| ResponseWriter::new(ctx, slot));
                    self.dirty.push(token);
                    if let Err(reason) = result {
                        self.close(token, reason);
                    }
                }
                LocalOp::Immediate { token, buffer } => {
                    if let Some(conn) = self.table.get_mut(token) {
                        conn.push_immediate(buffer);
                        self.dirty.push(token);
                    }
                }
                LocalOp::Fill {
                    token,
                    slot,
                    response,
                } => self.fill(token, slot, response),
                LocalOp::Close(token) => self.close(token, CloseReason::Cancelled),
            }
        }
    }

    fn register(&mut self, registration: Registration) {
        let Registration {
            stream,
            peer,
            factory,
        } = registration;
        let Some(token) = self.table.vacant() else {
            warn!(listener = self.id, %peer, "connection table full, dropping connection");
            self.active.fetch_sub(1, Ordering::AcqRel);
            return;
        };

        let shared = Arc::new(ConnShared::new(token, peer));
        let ctx = HandlerContext {
            shared: shared.clone(),
            mailbox: self.mailbox.clone(),
            pool: self.pool.clone(),
        };
        let service = match panic::catch_unwind(AssertUnwindSafe(|| factory.create(ctx))) {
            Ok(service) => service,
            Err(_) => {
                metrics::SERVICER_PANICS.increment();
                warn!(listener = self.id, %peer, "servicer factory panicked, dropping connection");
                shared.mark_closed();
                self.active.fetch_sub(1, Ordering::AcqRel);
                return;
            }
        };

        let mut conn = Connection::new(stream, shared, service);
        if let Err(e) = conn.apply_interest(self.poll.registry(), true) {
            warn!(listener = self.id, %peer, error = %e, "failed to register connection");
            conn.shared().mark_closed();
            self.active.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        self.table.insert(token, conn);
        metrics::CONNECTIONS_ACTIVE.increment();
        debug!(
            listener = self.id,
            conn = token.index(),
            %peer,
            active = self.table.active_count(),
            "connection registered"
        );
    }

    fn execute(&mut self, token: ConnToken, task: Task) {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            self.close(token, CloseReason::Panic("executed callback"));
        }
    }

    fn fill(&mut self, token: ConnToken, slot: u64, response: Response) {
        // Unknown tokens drop the response, releasing its buffers.
        let Some(conn) = self.table.get_mut(token) else {
            return;
        };
        let result = conn.fill(slot, response, self.pool.as_ref());
        self.dirty.push(token);
        if let Err(reason) = result {
            self.close(token, reason);
        }
    }

    /// Read until the socket drains, backpressure engages, or the per-event
    /// budget runs out.
    fn read_ready(&mut self, token: ConnToken) {
        for _ in 0..MAX_READS_PER_EVENT {
            let Some(conn) = self.table.get_mut(token) else {
                return;
            };
            conn.read_pending = true;
            if conn.peer_closed || conn.outstanding() > self.threshold {
                return;
            }
            match conn.read_and_service(self.pool.as_ref()) {
                Ok(ReadStep::Serviced) => {}
                Ok(ReadStep::Drained) => {
                    conn.read_pending = false;
                    return;
                }
                Ok(ReadStep::Eof) => {
                    conn.read_pending = false;
                    conn.peer_closed = true;
                    return;
                }
                Err(reason) => {
                    self.close(token, reason);
                    return;
                }
            }
            self.drain_local();
            self.flush(token);
        }
    }

    fn flush(&mut self, token: ConnToken) {
        let Some(conn) = self.table.get_mut(token) else {
            return;
        };
        if let Err(reason) = conn.flush(self.pool.as_ref()) {
            self.close(token, reason);
        }
    }

    fn refresh_dirty(&mut self) {
        while let Some(token) = self.dirty.pop() {
            self.refresh(token);
        }
    }

    /// Flush, then recompute read and write interest.
    fn refresh(&mut self, token: ConnToken) {
        let Some(conn) = self.table.get_mut(token) else {
            return;
        };
        if let Err(reason) = conn.flush(self.pool.as_ref()) {
            self.close(token, reason);
            return;
        }
        if conn.peer_closed && conn.output_idle() {
            self.close(token, CloseReason::PeerClosed);
            return;
        }

        let (want_read, engaged) = conn.update_reading(self.threshold);
        if engaged {
            metrics::BACKPRESSURE_ENGAGED.increment();
            debug!(
                listener = self.id,
                conn = token.index(),
                outstanding = conn.outstanding(),
                "backpressure engaged, reading suspended"
            );
        }
        if want_read && conn.read_pending && !self.retry_reads.contains(&token) {
            self.retry_reads.push(token);
        }
        if let Err(e) = conn.apply_interest(self.poll.registry(), want_read) {
            self.close(token, CloseReason::Io(e));
        }
    }

    fn idle_all(&mut self) {
        for token in self.table.tokens() {
            let Some(conn) = self.table.get_mut(token) else {
                continue;
            };
            if let Err(reason) = conn.idle() {
                self.close(token, reason);
                continue;
            }
            self.drain_local();
            self.dirty.push(token);
        }
        self.refresh_dirty();
    }

    fn close(&mut self, token: ConnToken, reason: CloseReason) {
        let Some(conn) = self.table.remove(token) else {
            return;
        };
        let peer = conn.shared().peer_addr();
        for handle in conn.close(self.poll.registry()) {
            if panic::catch_unwind(AssertUnwindSafe(|| handle.cancel())).is_err() {
                warn!(listener = self.id, %peer, "cancel handle panicked");
            }
        }
        self.active.fetch_sub(1, Ordering::AcqRel);
        metrics::CONNECTIONS_CLOSED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();

        match &reason {
            CloseReason::Panic(what) => {
                metrics::SERVICER_PANICS.increment();
                warn!(
                    listener = self.id,
                    conn = token.index(),
                    %peer,
                    source = *what,
                    "panic while servicing connection, closing it"
                );
            }
            CloseReason::File(e) => {
                error!(
                    listener = self.id,
                    conn = token.index(),
                    %peer,
                    error = %e,
                    "file-backed response failed after bytes were sent"
                );
            }
            _ => debug!(
                listener = self.id,
                conn = token.index(),
                %peer,
                ?reason,
                "connection closed"
            ),
        }
    }

    /// Close every connection and release whatever is still queued for them.
    fn close_all(&mut self) {
        for token in self.table.tokens() {
            self.close(token, CloseReason::Shutdown);
        }
        loop {
            let mut drained = false;
            while let Some(op) = pop_local() {
                drop(op);
                drained = true;
            }
            while let Ok(command) = self.commands.try_recv() {
                if matches!(command, Command::Register(_)) {
                    self.active.fetch_sub(1, Ordering::AcqRel);
                }
                drop(command);
                drained = true;
            }
            if !drained {
                break;
            }
        }
    }
}
