use std::any::Any;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{SockRef, Socket};
use tracing::error;

use crate::buffer::{BufferPool, PooledBuffer};
use crate::connection::{ConnShared, ConnToken};
use crate::error::Error;
use crate::mailbox::{Command, LocalOp, Mailbox, push_local};
use crate::response::{CancelHandle, ResponseWriter};

/// Per-connection read callback.
///
/// Called on the connection's listener thread once per successful read.
/// The `bytes_read` new bytes are the last bytes of `buffer.data()`; earlier
/// bytes of the same buffer were passed to previous calls. When
/// `is_new_buffer` is true the buffer replaced a full one and holds only the
/// new bytes.
///
/// Decoded requests are passed to
/// [`RequestHandler::handle_request`]. Returning an error closes the
/// connection.
pub trait SocketServicer {
    fn service(
        &mut self,
        buffer: &PooledBuffer,
        bytes_read: usize,
        is_new_buffer: bool,
    ) -> io::Result<()>;

    /// Called when the listener's selector wait timed out with nothing ready.
    fn idle(&mut self) {}
}

impl<F> SocketServicer for F
where
    F: FnMut(&PooledBuffer, usize, bool) -> io::Result<()>,
{
    fn service(
        &mut self,
        buffer: &PooledBuffer,
        bytes_read: usize,
        is_new_buffer: bool,
    ) -> io::Result<()> {
        self(buffer, bytes_read, is_new_buffer)
    }
}

/// Application logic for one decoded request.
///
/// Receives the request and the writer for its response slot. Returning a
/// [`CancelHandle`] lets long-running work be cancelled if the connection
/// closes before the response is written.
pub trait RequestServicer<R> {
    fn service(&mut self, request: R, response: ResponseWriter) -> Option<CancelHandle>;
}

impl<R, F> RequestServicer<R> for F
where
    F: FnMut(R, ResponseWriter) -> Option<CancelHandle>,
{
    fn service(&mut self, request: R, response: ResponseWriter) -> Option<CancelHandle> {
        self(request, response)
    }
}

/// State shared by every handle to one connection.
#[derive(Clone)]
pub(crate) struct HandlerContext {
    pub shared: Arc<ConnShared>,
    pub mailbox: Mailbox,
    pub pool: Arc<dyn BufferPool>,
}

/// Handle through which a socket servicer talks to its connection.
///
/// `handle_request` and `send_immediate_data` touch connection state and may
/// only be called on the connection's listener thread. Other threads hand
/// work to that thread with [`execute`](Self::execute).
pub struct RequestHandler<R> {
    ctx: HandlerContext,
    _request: PhantomData<fn(R)>,
}

impl<R> Clone for RequestHandler<R> {
    fn clone(&self) -> Self {
        RequestHandler {
            ctx: self.ctx.clone(),
            _request: PhantomData,
        }
    }
}

impl<R: 'static> RequestHandler<R> {
    pub(crate) fn new(ctx: HandlerContext) -> Self {
        RequestHandler {
            ctx,
            _request: PhantomData,
        }
    }

    /// Reserve the next response slot and pass `request` to the request
    /// servicer.
    ///
    /// Returns [`Error::IllegalState`] when called off the listener thread.
    /// Ignored once the connection has closed.
    pub fn handle_request(&self, request: R) -> Result<(), Error> {
        self.check_owner("handle_request called off the connection's listener thread")?;
        if !self.ctx.shared.is_closed() {
            push_local(LocalOp::Request {
                token: self.ctx.shared.token(),
                request: Box::new(request),
            });
        }
        Ok(())
    }

    /// Queue out-of-band data, written at the next response boundary ahead
    /// of any further responses.
    ///
    /// Returns [`Error::IllegalState`] when called off the listener thread.
    pub fn send_immediate_data(&self, buffer: PooledBuffer) -> Result<(), Error> {
        self.check_owner("send_immediate_data called off the connection's listener thread")?;
        if !self.ctx.shared.is_closed() {
            push_local(LocalOp::Immediate {
                token: self.ctx.shared.token(),
                buffer,
            });
        }
        Ok(())
    }

    /// Run `task` on the connection's listener thread during its next loop
    /// iteration, before further I/O events are processed.
    ///
    /// Never blocks and never fails; after shutdown the task is dropped.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.ctx.mailbox.send(Command::Execute {
            token: self.ctx.shared.token(),
            task: Box::new(task),
        });
    }
}

impl<R> RequestHandler<R> {
    /// Whether the connection currently has read interest. False while
    /// backpressure holds reading, and after close.
    pub fn is_reading_input(&self) -> bool {
        self.ctx.shared.is_reading()
    }

    pub fn buffer_pool(&self) -> &Arc<dyn BufferPool> {
        &self.ctx.pool
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.ctx.shared.peer_addr()
    }

    /// Token identifying the connection within its listener.
    pub fn token(&self) -> ConnToken {
        self.ctx.shared.token()
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.shared.is_closed()
    }

    /// Close the connection from any thread. Pending responses are dropped
    /// and later calls on this handle become no-ops.
    pub fn cancel(&self) {
        let shared = &self.ctx.shared;
        if shared.mark_closed() {
            return;
        }
        if shared.is_owner() {
            push_local(LocalOp::Close(shared.token()));
        } else {
            self.ctx.mailbox.send(Command::Close(shared.token()));
        }
    }

    fn check_owner(&self, what: &'static str) -> Result<(), Error> {
        if self.ctx.shared.is_owner() {
            Ok(())
        } else {
            Err(Error::IllegalState(what))
        }
    }
}

impl<R> fmt::Debug for RequestHandler<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandler")
            .field("token", &self.ctx.shared.token())
            .field("peer", &self.ctx.shared.peer_addr())
            .finish()
    }
}

type SocketFactory<R> = dyn Fn(RequestHandler<R>) -> Box<dyn SocketServicer> + Send + Sync;
type RequestFactory<R> = dyn Fn(&RequestHandler<R>) -> Box<dyn RequestServicer<R>> + Send + Sync;

/// Runs on the server socket after creation, before bind and listen.
pub type ServerSocketDecorator = Box<dyn Fn(&Socket) -> io::Result<()> + Send + Sync>;

/// Runs on every accepted socket before it is handed to a listener. An
/// error drops the connection.
pub type AcceptedSocketDecorator = Arc<dyn Fn(SockRef<'_>) -> io::Result<()> + Send + Sync>;

/// Everything [`SocketManager::bind`](crate::SocketManager::bind) needs to
/// serve one port.
///
/// `R` is the decoded request type passed from the socket servicer to the
/// request servicer. Both factories run once per connection, on the
/// listener thread that owns it.
pub struct Binding<R> {
    socket_factory: Box<SocketFactory<R>>,
    request_factory: Box<RequestFactory<R>>,
    server_decorator: Option<ServerSocketDecorator>,
    accepted_decorator: Option<AcceptedSocketDecorator>,
}

impl<R: 'static> Binding<R> {
    pub fn new<FS, S, FR, Q>(socket_factory: FS, request_factory: FR) -> Self
    where
        FS: Fn(RequestHandler<R>) -> S + Send + Sync + 'static,
        S: SocketServicer + 'static,
        FR: Fn(&RequestHandler<R>) -> Q + Send + Sync + 'static,
        Q: RequestServicer<R> + 'static,
    {
        Binding {
            socket_factory: Box::new(
                move |handler: RequestHandler<R>| -> Box<dyn SocketServicer> {
                    Box::new(socket_factory(handler))
                },
            ),
            request_factory: Box::new(
                move |handler: &RequestHandler<R>| -> Box<dyn RequestServicer<R>> {
                    Box::new(request_factory(handler))
                },
            ),
            server_decorator: None,
            accepted_decorator: None,
        }
    }

    pub fn server_socket_decorator<F>(mut self, decorator: F) -> Self
    where
        F: Fn(&Socket) -> io::Result<()> + Send + Sync + 'static,
    {
        self.server_decorator = Some(Box::new(decorator));
        self
    }

    pub fn accepted_socket_decorator<F>(mut self, decorator: F) -> Self
    where
        F: Fn(SockRef<'_>) -> io::Result<()> + Send + Sync + 'static,
    {
        self.accepted_decorator = Some(Arc::new(decorator));
        self
    }

    pub(crate) fn into_parts(self) -> BindingParts {
        BindingParts {
            factory: Arc::new(BindingFactory {
                socket_factory: self.socket_factory,
                request_factory: self.request_factory,
            }),
            server_decorator: self.server_decorator,
            accepted_decorator: self.accepted_decorator,
        }
    }
}

pub(crate) struct BindingParts {
    pub factory: Arc<dyn ServiceFactory>,
    pub server_decorator: Option<ServerSocketDecorator>,
    pub accepted_decorator: Option<AcceptedSocketDecorator>,
}

/// Builds the servicers of a new connection.
pub(crate) trait ServiceFactory: Send + Sync {
    fn create(&self, ctx: HandlerContext) -> Box<dyn ConnectionService>;
}

struct BindingFactory<R> {
    socket_factory: Box<SocketFactory<R>>,
    request_factory: Box<RequestFactory<R>>,
}

impl<R: 'static> ServiceFactory for BindingFactory<R> {
    fn create(&self, ctx: HandlerContext) -> Box<dyn ConnectionService> {
        let handler = RequestHandler::<R>::new(ctx);
        let request = (self.request_factory)(&handler);
        let socket = (self.socket_factory)(handler);
        Box::new(BoundService { socket, request })
    }
}

/// The servicers of one connection, with the request type erased.
pub(crate) trait ConnectionService {
    fn on_read(&mut self, buffer: &PooledBuffer, bytes_read: usize, is_new: bool)
    -> io::Result<()>;

    fn on_idle(&mut self);

    fn on_request(&mut self, request: Box<dyn Any>, writer: ResponseWriter)
    -> Option<CancelHandle>;
}

struct BoundService<R> {
    socket: Box<dyn SocketServicer>,
    request: Box<dyn RequestServicer<R>>,
}

impl<R: 'static> ConnectionService for BoundService<R> {
    fn on_read(
        &mut self,
        buffer: &PooledBuffer,
        bytes_read: usize,
        is_new: bool,
    ) -> io::Result<()> {
        self.socket.service(buffer, bytes_read, is_new)
    }

    fn on_idle(&mut self) {
        self.socket.idle();
    }

    fn on_request(
        &mut self,
        request: Box<dyn Any>,
        writer: ResponseWriter,
    ) -> Option<CancelHandle> {
        match request.downcast::<R>() {
            Ok(request) => self.request.service(*request, writer),
            Err(_) => {
                error!("request type does not match the connection's binding");
                None
            }
        }
    }
}
