use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::SockRef;
use tracing::{debug, error, warn};

use crate::handler::{AcceptedSocketDecorator, ServiceFactory};
use crate::listener::ListenerHandle;
use crate::mailbox::{Command, Registration};
use crate::manager::ExitNotice;
use crate::metrics;

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Spreads accepted connections over the listeners, round-robin, skipping
/// listeners at their connection cap and listeners whose thread has exited.
pub(crate) struct Distributor {
    listeners: Vec<ListenerHandle>,
    alive: Vec<AtomicBool>,
    next: AtomicUsize,
    max_connections: usize,
}

impl Distributor {
    pub(crate) fn new(listeners: Vec<ListenerHandle>, max_connections: usize) -> Self {
        Distributor {
            alive: listeners.iter().map(|_| AtomicBool::new(true)).collect(),
            listeners,
            next: AtomicUsize::new(0),
            max_connections,
        }
    }

    pub(crate) fn listeners(&self) -> &[ListenerHandle] {
        &self.listeners
    }

    /// Claim capacity on the next listener with room. `None` when every
    /// listener is full.
    pub(crate) fn reserve(&self) -> Option<usize> {
        let n = self.listeners.len();
        if n == 0 {
            return None;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for i in 0..n {
            let idx = start.wrapping_add(i) % n;
            if !self.alive[idx].load(Ordering::Acquire) {
                continue;
            }
            let claimed = self.listeners[idx]
                .active
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                    (count < self.max_connections).then_some(count + 1)
                })
                .is_ok();
            if claimed {
                return Some(idx);
            }
        }
        None
    }

    /// Give back capacity claimed by [`reserve`](Self::reserve).
    pub(crate) fn release(&self, idx: usize) {
        self.listeners[idx].active.fetch_sub(1, Ordering::AcqRel);
    }

    /// Hand `registration` to the listener reserved at `idx`.
    ///
    /// If that listener has exited it is never chosen again, its reservation
    /// is dropped and the registration comes back for another listener.
    fn deliver(&self, idx: usize, registration: Registration) -> Result<(), Registration> {
        let Err(command) = self.listeners[idx]
            .mailbox
            .try_send(Command::Register(registration))
        else {
            return Ok(());
        };
        self.alive[idx].store(false, Ordering::Release);
        self.release(idx);
        error!(listener = idx, "listener has exited, no longer assigning connections to it");
        match command {
            Command::Register(registration) => Err(registration),
            _ => Ok(()),
        }
    }
}

/// Configuration for one port's acceptor thread.
pub(crate) struct AcceptorConfig {
    pub listener: TcpListener,
    pub port: u16,
    pub factory: Arc<dyn ServiceFactory>,
    pub accepted_decorator: Option<AcceptedSocketDecorator>,
    pub distributor: Arc<Distributor>,
    pub shutdown: Arc<AtomicBool>,
    pub tcp_nodelay: bool,
    pub retry_interval: Duration,
    /// An accepted connection whose listener exited before taking it.
    pub pending: Option<Registration>,
}

/// Start the acceptor thread for a bound port. The returned waker
/// interrupts it for shutdown.
pub(crate) fn spawn(
    mut config: AcceptorConfig,
    exit: ExitNotice,
) -> io::Result<(Arc<Waker>, thread::JoinHandle<()>)> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    poll.registry()
        .register(&mut config.listener, LISTENER_TOKEN, Interest::READABLE)?;

    let thread = thread::Builder::new()
        .name(format!("sockmux-acceptor-{}", config.port))
        .spawn(move || {
            let _exit = exit;
            run_acceptor(poll, config);
        })?;
    Ok((waker, thread))
}

enum AcceptState {
    /// The backlog is empty; wait for readiness.
    Drained,
    /// Every listener is full; retry after the interval.
    Deferred,
    /// Accepting failed; retry after the interval.
    Backoff,
}

/// Run the acceptor loop until shutdown.
///
/// Connections are only accepted once a listener has capacity for them, so
/// a deferred connection waits in the kernel backlog instead of being
/// dropped.
fn run_acceptor(mut poll: Poll, mut config: AcceptorConfig) {
    let mut events = Events::with_capacity(8);
    let mut state = AcceptState::Drained;
    debug!(port = config.port, "acceptor started");

    loop {
        let timeout = match state {
            AcceptState::Drained => None,
            AcceptState::Deferred | AcceptState::Backoff => Some(config.retry_interval),
        };
        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(port = config.port, error = %e, "acceptor wait failed");
            return;
        }
        if config.shutdown.load(Ordering::Acquire) {
            break;
        }

        let next = accept_pending(&mut config);
        if matches!(next, AcceptState::Deferred) && !matches!(state, AcceptState::Deferred) {
            metrics::ACCEPT_DEFERRED.increment();
            debug!(port = config.port, "every listener at capacity, deferring accepts");
        }
        state = next;
    }
    debug!(port = config.port, "acceptor stopped");
}

fn accept_pending(config: &mut AcceptorConfig) -> AcceptState {
    loop {
        let Some(target) = config.distributor.reserve() else {
            return AcceptState::Deferred;
        };
        let registration = match config.pending.take() {
            Some(registration) => registration,
            None => match config.listener.accept() {
                Ok((stream, peer)) => match prepare(config, stream, peer) {
                    Some(registration) => registration,
                    None => {
                        config.distributor.release(target);
                        continue;
                    }
                },
                Err(e) => {
                    config.distributor.release(target);
                    match e.kind() {
                        io::ErrorKind::WouldBlock => return AcceptState::Drained,
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted => continue,
                        _ => {
                            // EMFILE/ENFILE and friends: back off and retry.
                            warn!(port = config.port, error = %e, "accept failed");
                            return AcceptState::Backoff;
                        }
                    }
                }
            },
        };
        if let Err(registration) = config.distributor.deliver(target, registration) {
            config.pending = Some(registration);
        }
    }
}

/// Apply socket options and the accepted-socket decorator. `None` when the
/// decorator rejects the connection.
fn prepare(config: &AcceptorConfig, stream: TcpStream, peer: SocketAddr) -> Option<Registration> {
    if config.tcp_nodelay
        && let Err(e) = stream.set_nodelay(true)
    {
        debug!(%peer, error = %e, "failed to set TCP_NODELAY");
    }
    if let Some(decorate) = &config.accepted_decorator
        && let Err(e) = decorate(SockRef::from(&stream))
    {
        warn!(%peer, error = %e, "accepted-socket decorator failed, dropping connection");
        return None;
    }

    metrics::CONNECTIONS_ACCEPTED.increment();
    Some(Registration {
        stream,
        peer,
        factory: config.factory.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PooledBuffer;
    use crate::handler::Binding;
    use crate::mailbox::Mailbox;
    use crate::response::{CancelHandle, ResponseWriter};
    use crossbeam_channel::Receiver;

    struct Fixture {
        _polls: Vec<Poll>,
        inboxes: Vec<Option<Receiver<Command>>>,
        distributor: Distributor,
    }

    fn fixture(n: usize, max_connections: usize) -> Fixture {
        let mut polls = Vec::new();
        let mut inboxes = Vec::new();
        let mut handles = Vec::new();
        for id in 0..n {
            let poll = Poll::new().unwrap();
            let waker = Waker::new(poll.registry(), Token(0)).unwrap();
            let (mailbox, rx) = Mailbox::new(waker);
            handles.push(ListenerHandle {
                id,
                mailbox,
                active: Arc::new(AtomicUsize::new(0)),
            });
            polls.push(poll);
            inboxes.push(Some(rx));
        }
        Fixture {
            _polls: polls,
            inboxes,
            distributor: Distributor::new(handles, max_connections),
        }
    }

    fn registration() -> (std::net::TcpStream, Registration) {
        let server = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(server.local_addr().unwrap()).unwrap();
        let (accepted, peer) = server.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let factory = Binding::<u8>::new(
            |_handler| |_buf: &PooledBuffer, _n: usize, _new: bool| -> io::Result<()> { Ok(()) },
            |_handler| |_b: u8, _response: ResponseWriter| -> Option<CancelHandle> { None },
        )
        .into_parts()
        .factory;
        let registration = Registration {
            stream: TcpStream::from_std(accepted),
            peer,
            factory,
        };
        (client, registration)
    }

    fn active(distributor: &Distributor, idx: usize) -> &AtomicUsize {
        &distributor.listeners()[idx].active
    }

    #[test]
    fn reserve_round_robins() {
        let f = fixture(3, 10);
        let picks: Vec<_> = (0..6).map(|_| f.distributor.reserve().unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn reserve_skips_full_listeners() {
        let f = fixture(2, 2);
        active(&f.distributor, 0).store(2, Ordering::SeqCst);

        assert_eq!(f.distributor.reserve(), Some(1));
        assert_eq!(f.distributor.reserve(), Some(1));
        assert_eq!(f.distributor.reserve(), None);

        f.distributor.release(0);
        assert_eq!(f.distributor.reserve(), Some(0));
    }

    #[test]
    fn exited_listener_hands_registration_back() {
        let mut f = fixture(2, 10);
        // Listener 0 has exited: its command queue is gone.
        f.inboxes[0] = None;
        let (_client, registration) = registration();

        assert_eq!(f.distributor.reserve(), Some(0));
        let registration = f.distributor.deliver(0, registration).unwrap_err();
        assert_eq!(active(&f.distributor, 0).load(Ordering::SeqCst), 0);

        // Only the live listener is chosen from now on.
        for _ in 0..4 {
            let idx = f.distributor.reserve().unwrap();
            assert_eq!(idx, 1);
            f.distributor.release(idx);
        }
        let target = f.distributor.reserve().unwrap();
        assert!(f.distributor.deliver(target, registration).is_ok());
        let inbox = f.inboxes[1].as_ref().unwrap();
        assert!(matches!(inbox.try_recv(), Ok(Command::Register(_))));
    }
}
