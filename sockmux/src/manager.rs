use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use mio::Waker;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{error, info, warn};

use crate::acceptor::{self, AcceptorConfig, Distributor};
use crate::buffer::{BufferPool, StreamBufferPool};
use crate::config::Config;
use crate::error::Error;
use crate::handler::{Binding, ServerSocketDecorator};
use crate::listener;

/// Signals thread exit to the manager when dropped, including on panic.
pub(crate) struct ExitNotice(Sender<()>);

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

struct Threads {
    handles: Vec<thread::JoinHandle<()>>,
    /// Spawned threads that have not yet signalled exit.
    running: usize,
    exits: Receiver<()>,
}

/// Top-level socket server: a fixed set of listener threads, one acceptor
/// thread per bound port, and the buffer pool they share.
///
/// Dropping the manager shuts it down.
pub struct SocketManager {
    config: Config,
    pool: Arc<dyn BufferPool>,
    distributor: Arc<Distributor>,
    shutdown: Arc<AtomicBool>,
    exit_tx: Sender<()>,
    threads: Mutex<Threads>,
    acceptor_wakers: Mutex<Vec<Arc<Waker>>>,
    bound: Mutex<BTreeMap<u16, SocketAddr>>,
}

impl SocketManager {
    /// Start the listener threads with a [`StreamBufferPool`] built from
    /// `config.buffer`.
    pub fn new(config: Config) -> Result<Self, Error> {
        let pool = Arc::new(StreamBufferPool::from_config(&config.buffer));
        Self::with_buffer_pool(config, pool)
    }

    /// Start the listener threads with a caller-supplied pool.
    pub fn with_buffer_pool(config: Config, pool: Arc<dyn BufferPool>) -> Result<Self, Error> {
        config.validate()?;
        let num_threads = config.resolved_threads();
        ensure_nofile_limit(config.listener.max_connections, num_threads)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let (exit_tx, exits) = crossbeam_channel::unbounded();
        let mut handles = Vec::with_capacity(num_threads);
        let mut threads = Vec::with_capacity(num_threads);

        for id in 0..num_threads {
            let spawned = listener::spawn(
                id,
                &config,
                pool.clone(),
                shutdown.clone(),
                ExitNotice(exit_tx.clone()),
            );
            match spawned {
                Ok((handle, thread)) => {
                    handles.push(handle);
                    threads.push(thread);
                }
                Err(e) => {
                    // Stop the listeners already running; they exit on their own.
                    shutdown.store(true, Ordering::Release);
                    for handle in &handles {
                        let _ = handle.mailbox.wake();
                    }
                    return Err(e);
                }
            }
        }

        info!(
            listeners = num_threads,
            max_connections = config.listener.max_connections,
            buffer_size = pool.buffer_size(),
            "socket manager started"
        );

        let running = threads.len();
        Ok(SocketManager {
            distributor: Arc::new(Distributor::new(
                handles,
                config.listener.max_connections as usize,
            )),
            config,
            pool,
            shutdown,
            exit_tx,
            threads: Mutex::new(Threads {
                handles: threads,
                running,
                exits,
            }),
            acceptor_wakers: Mutex::new(Vec::new()),
            bound: Mutex::new(BTreeMap::new()),
        })
    }

    /// Bind a server socket on `addr` and start accepting connections for
    /// `binding`. Returns the bound address; port 0 picks an ephemeral port.
    pub fn bind<R: 'static>(
        &self,
        addr: SocketAddr,
        binding: Binding<R>,
    ) -> Result<SocketAddr, Error> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShutDown);
        }
        let mut bound = self.bound.lock();
        if addr.port() != 0 && bound.contains_key(&addr.port()) {
            return Err(Error::AlreadyBound(addr.port()));
        }

        let parts = binding.into_parts();
        let listener =
            create_listener(addr, self.config.backlog, parts.server_decorator.as_ref())?;
        let local = listener.local_addr()?;

        let acceptor_config = AcceptorConfig {
            listener,
            port: local.port(),
            factory: parts.factory,
            accepted_decorator: parts.accepted_decorator,
            distributor: self.distributor.clone(),
            shutdown: self.shutdown.clone(),
            tcp_nodelay: self.config.tcp_nodelay,
            retry_interval: self.config.accept_retry_interval,
            pending: None,
        };
        let exit = ExitNotice(self.exit_tx.clone());
        let (waker, thread) = acceptor::spawn(acceptor_config, exit)?;
        {
            let mut threads = self.threads.lock();
            threads.handles.push(thread);
            threads.running += 1;
        }
        self.acceptor_wakers.lock().push(waker);
        // A shutdown that raced with this bind may have missed the new waker.
        if self.shutdown.load(Ordering::Acquire) {
            self.wake_all();
        }

        bound.insert(local.port(), local);
        info!(addr = %local, "server socket bound");
        Ok(local)
    }

    /// Stop accepting, close every connection, and wait up to
    /// `config.shutdown_timeout` for all threads to exit. Idempotent.
    pub fn shutdown(&self) -> Result<(), Error> {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            info!("socket manager shutting down");
            self.wake_all();
        }
        self.wait_for_completion(self.config.shutdown_timeout)
    }

    /// Wait up to `timeout` for every listener and acceptor thread to exit.
    ///
    /// Returns [`Error::Timeout`] if some thread is still running at the
    /// deadline; threads only exit after [`shutdown`](Self::shutdown).
    pub fn wait_for_completion(&self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        let mut threads = self.threads.lock();
        while threads.running > 0 {
            match threads.exits.recv_deadline(deadline) {
                Ok(()) => threads.running -= 1,
                Err(RecvTimeoutError::Timeout) => return Err(Error::Timeout),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        for handle in threads.handles.drain(..) {
            if handle.join().is_err() {
                error!("socket manager thread panicked");
            }
        }
        Ok(())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Ports with an acceptor, in ascending order.
    pub fn bound_ports(&self) -> Vec<u16> {
        self.bound.lock().keys().copied().collect()
    }

    pub fn buffer_pool(&self) -> &Arc<dyn BufferPool> {
        &self.pool
    }

    pub fn listener_count(&self) -> usize {
        self.distributor.listeners().len()
    }

    /// Connections held by each listener, including ones being handed over.
    pub fn connection_counts(&self) -> Vec<usize> {
        self.distributor
            .listeners()
            .iter()
            .map(|l| l.active.load(Ordering::Acquire))
            .collect()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn wake_all(&self) {
        for handle in self.distributor.listeners() {
            if let Err(e) = handle.mailbox.wake() {
                warn!(listener = handle.id, error = %e, "failed to wake listener");
            }
        }
        for waker in self.acceptor_wakers.lock().iter() {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "failed to wake acceptor");
            }
        }
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "socket manager did not shut down cleanly");
        }
    }
}

/// Create a non-blocking listening socket, running `decorator` before bind.
fn create_listener(
    addr: SocketAddr,
    backlog: i32,
    decorator: Option<&ServerSocketDecorator>,
) -> Result<mio::net::TcpListener, Error> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if let Some(decorate) = decorator {
        decorate(&socket)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(mio::net::TcpListener::from_std(socket.into()))
}

/// Ensure RLIMIT_NOFILE covers every connection the listeners may hold.
///
/// Each connection keeps its socket fd open, so the soft limit must cover
/// `max_connections` per listener plus selector and waker fds.
fn ensure_nofile_limit(max_connections: u32, num_listeners: usize) -> Result<(), Error> {
    let mut rlim: libc::rlimit = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if ret != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    // Per listener: selector and waker. Global: listen sockets, stdio, files
    // opened for file-backed responses.
    let per_listener_overhead: u64 = 4;
    let global_overhead: u64 = 64;
    let required = (max_connections as u64 + per_listener_overhead) * num_listeners as u64
        + global_overhead;

    let soft = rlim.rlim_cur;
    let hard = rlim.rlim_max;

    if soft == libc::RLIM_INFINITY || soft as u64 >= required {
        return Ok(());
    }

    if hard == libc::RLIM_INFINITY || hard as u64 >= required {
        rlim.rlim_cur = required as libc::rlim_t;
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
        if ret != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    } else {
        Err(Error::ResourceLimit(format!(
            "RLIMIT_NOFILE too low: need {required} but hard limit is {hard} (soft: {soft}). \
             Raise it with: ulimit -n {required}"
        )))
    }
}
