//! Messages delivered to a listener thread.
//!
//! Connection state is confined to its listener. Other threads reach it only
//! by sending a [`Command`] through the listener's [`Mailbox`], which wakes
//! the selector. Code already running on the listener thread (servicers,
//! executed callbacks) queues [`LocalOp`]s instead; the listener drains them
//! after every callback returns.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use mio::Waker;
use tracing::warn;

use crate::buffer::PooledBuffer;
use crate::connection::ConnToken;
use crate::handler::ServiceFactory;
use crate::response::Response;

/// A callback marshalled onto a listener thread.
pub(crate) type Task = Box<dyn FnOnce() + Send>;

/// An accepted socket handed from an acceptor to a listener.
pub(crate) struct Registration {
    pub stream: mio::net::TcpStream,
    pub peer: SocketAddr,
    pub factory: Arc<dyn ServiceFactory>,
}

pub(crate) enum Command {
    /// Take ownership of a newly accepted connection.
    Register(Registration),
    /// Run a callback on behalf of a connection.
    Execute { token: ConnToken, task: Task },
    /// Fill a response slot from another thread.
    Fill {
        token: ConnToken,
        slot: u64,
        response: Response,
    },
    /// Close a connection.
    Close(ConnToken),
}

/// Sending half of a listener's command queue.
#[derive(Clone)]
pub(crate) struct Mailbox {
    tx: Sender<Command>,
    waker: Arc<Waker>,
}

impl Mailbox {
    pub(crate) fn new(waker: Waker) -> (Self, Receiver<Command>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mailbox = Mailbox {
            tx,
            waker: Arc::new(waker),
        };
        (mailbox, rx)
    }

    /// Queue `command` and wake the listener.
    ///
    /// Once the listener has exited the command is dropped, releasing any
    /// buffers it carries.
    pub(crate) fn send(&self, command: Command) -> bool {
        self.try_send(command).is_ok()
    }

    /// Like [`send`](Self::send), but hands the command back when the
    /// listener has exited.
    pub(crate) fn try_send(&self, command: Command) -> Result<(), Command> {
        self.tx.send(command).map_err(|e| e.into_inner())?;
        if let Err(e) = self.wake() {
            warn!(error = %e, "failed to wake listener");
        }
        Ok(())
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

/// Work queued by code running on the listener thread itself.
pub(crate) enum LocalOp {
    Request {
        token: ConnToken,
        request: Box<dyn Any>,
    },
    Immediate {
        token: ConnToken,
        buffer: PooledBuffer,
    },
    Fill {
        token: ConnToken,
        slot: u64,
        response: Response,
    },
    Close(ConnToken),
}

thread_local! {
    static LOCAL_OPS: RefCell<VecDeque<LocalOp>> = const { RefCell::new(VecDeque::new()) };
}

/// Queue an op for the current listener thread.
pub(crate) fn push_local(op: LocalOp) {
    // During thread teardown the op is dropped with its buffers.
    let _ = LOCAL_OPS.try_with(|ops| ops.borrow_mut().push_back(op));
}

pub(crate) fn pop_local() -> Option<LocalOp> {
    LOCAL_OPS
        .try_with(|ops| ops.borrow_mut().pop_front())
        .ok()
        .flatten()
}
