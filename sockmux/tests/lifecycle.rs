//! Integration tests: binding, decorators, idle callbacks, shutdown, and
//! buffer conservation.

mod common;

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::*;
use sockmux::{
    Binding, BufferChainWriter, BufferStrategy, CancelHandle, Error, PooledBuffer, RequestHandler,
    ResponseWriter, SocketManager, SocketServicer,
};

fn shutdown_within_bound(listeners: usize, with_connections: bool) {
    let manager = SocketManager::new(test_config(listeners)).unwrap();
    let addr = bind(&manager, byte_binding(1));

    let mut streams = Vec::new();
    if with_connections {
        for i in 0..(listeners * 2) as u8 {
            let mut stream = connect(addr);
            assert_eq!(round_trip(&mut stream, &[i], 1), vec![i + 1]);
            streams.push(stream);
        }
    }

    let start = Instant::now();
    manager.shutdown().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    manager.wait_for_completion(Duration::from_secs(1)).unwrap();
    assert!(manager.is_shutdown());

    for stream in &mut streams {
        assert!(closed_by_server(stream));
    }
}

#[test]
fn shutdown_one_listener_idle() {
    shutdown_within_bound(1, false);
}

#[test]
fn shutdown_one_listener_with_connections() {
    shutdown_within_bound(1, true);
}

#[test]
fn shutdown_four_listeners_idle() {
    shutdown_within_bound(4, false);
}

#[test]
fn shutdown_four_listeners_with_connections() {
    shutdown_within_bound(4, true);
}

#[test]
fn shutdown_is_idempotent() {
    let manager = SocketManager::new(test_config(2)).unwrap();
    bind(&manager, byte_binding(1));
    manager.shutdown().unwrap();
    manager.shutdown().unwrap();
    manager.wait_for_completion(Duration::from_millis(100)).unwrap();
}

#[test]
fn calls_after_shutdown_are_harmless() {
    let manager = SocketManager::new(test_config(1)).unwrap();
    let pool = manager.buffer_pool().clone();
    let handlers: Arc<Mutex<Vec<RequestHandler<u8>>>> = Arc::default();
    let writers: Arc<Mutex<Vec<ResponseWriter>>> = Arc::default();

    let (keep_handler, keep_writer) = (handlers.clone(), writers.clone());
    let binding = Binding::<u8>::new(
        move |handler| {
            keep_handler.lock().unwrap().push(handler.clone());
            move |buf: &PooledBuffer, n: usize, _new: bool| -> io::Result<()> {
                for &b in new_bytes(buf, n) {
                    handler.handle_request(b).map_err(io::Error::other)?;
                }
                Ok(())
            }
        },
        move |_handler| {
            let keep_writer = keep_writer.clone();
            move |_b: u8, response: ResponseWriter| -> Option<CancelHandle> {
                keep_writer.lock().unwrap().push(response);
                None
            }
        },
    );
    let addr = bind(&manager, binding);

    let mut stream = connect(addr);
    stream.write_all(&[1]).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        writers.lock().unwrap().len() == 1
    }));
    manager.shutdown().unwrap();

    let handler = handlers.lock().unwrap().pop().unwrap();
    let writer = writers.lock().unwrap().pop().unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let body_pool = pool.clone();
    thread::spawn(move || {
        let mut body = body_pool.acquire();
        body.write(b"too late");
        writer.write(None, Some(body));
        handler.execute(move || flag.store(true, Ordering::SeqCst));
        handler.cancel();
        assert!(handler.is_closed());
        assert!(handler.handle_request(2).is_err());
    })
    .join()
    .unwrap();

    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(pool.stats().outstanding(), 0);
    assert!(closed_by_server(&mut stream));
}

#[test]
fn wait_without_shutdown_times_out() {
    let manager = SocketManager::new(test_config(1)).unwrap();
    let err = manager
        .wait_for_completion(Duration::from_millis(50))
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
    manager.shutdown().unwrap();
}

#[test]
fn bind_rejects_duplicates_and_late_calls() {
    let manager = SocketManager::new(test_config(1)).unwrap();
    let addr = bind(&manager, byte_binding(1));
    assert_eq!(manager.bound_ports(), vec![addr.port()]);

    let err = manager.bind(addr, byte_binding(1)).unwrap_err();
    assert!(matches!(err, Error::AlreadyBound(port) if port == addr.port()));

    manager.shutdown().unwrap();
    let err = manager
        .bind("127.0.0.1:0".parse().unwrap(), byte_binding(1))
        .unwrap_err();
    assert!(matches!(err, Error::ShutDown));
}

#[test]
fn decorators_run_for_server_and_accepted_sockets() {
    let manager = SocketManager::new(test_config(1)).unwrap();
    let server_decorated = Arc::new(AtomicBool::new(false));
    let accepted = Arc::new(AtomicUsize::new(0));

    let (flag, count) = (server_decorated.clone(), accepted.clone());
    let binding = byte_binding(1)
        .server_socket_decorator(move |socket| {
            socket.set_recv_buffer_size(64 * 1024)?;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .accepted_socket_decorator(move |socket| {
            socket.set_keepalive(true)?;
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    let addr = bind(&manager, binding);
    assert!(server_decorated.load(Ordering::SeqCst));

    for i in 0..3u8 {
        let mut stream = connect(addr);
        assert_eq!(round_trip(&mut stream, &[i], 1), vec![i + 1]);
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 3);
    manager.shutdown().unwrap();
}

#[test]
fn failing_accepted_decorator_drops_connection() {
    let manager = SocketManager::new(test_config(1)).unwrap();
    let binding = byte_binding(1)
        .accepted_socket_decorator(|_socket| Err(io::Error::other("handshake refused")));
    let addr = bind(&manager, binding);

    let mut stream = connect(addr);
    let _ = stream.write_all(&[1]);
    assert!(closed_by_server(&mut stream));
    assert!(wait_until(Duration::from_secs(5), || {
        manager.connection_counts() == vec![0]
    }));
    manager.shutdown().unwrap();
}

#[test]
fn failing_server_decorator_fails_bind() {
    let manager = SocketManager::new(test_config(1)).unwrap();
    let binding = byte_binding(1).server_socket_decorator(|_socket| {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "no"))
    });
    let err = manager
        .bind("127.0.0.1:0".parse().unwrap(), binding)
        .unwrap_err();
    assert!(matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied));
    assert!(manager.bound_ports().is_empty());
    manager.shutdown().unwrap();
}

struct Heartbeat {
    idles: Arc<AtomicUsize>,
}

impl SocketServicer for Heartbeat {
    fn service(&mut self, _buffer: &PooledBuffer, _n: usize, _new: bool) -> io::Result<()> {
        Ok(())
    }

    fn idle(&mut self) {
        self.idles.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn idle_callback_fires_on_quiet_connections() {
    let manager = SocketManager::new(test_config(1)).unwrap();
    let idles = Arc::new(AtomicUsize::new(0));
    let counter = idles.clone();
    let binding = Binding::<u8>::new(
        move |_handler| Heartbeat {
            idles: counter.clone(),
        },
        |_handler| |_b: u8, _response: ResponseWriter| -> Option<CancelHandle> { None },
    );
    let addr = bind(&manager, binding);

    let _stream = connect(addr);
    assert!(wait_until(Duration::from_secs(5), || {
        idles.load(Ordering::SeqCst) >= 3
    }));
    manager.shutdown().unwrap();
}

/// Responses built from pool segments, large enough to span several.
fn chained_binding() -> Binding<u8> {
    Binding::new(
        |handler| {
            move |buf: &PooledBuffer, n: usize, _new: bool| -> io::Result<()> {
                for &b in new_bytes(buf, n) {
                    handler.handle_request(b).map_err(io::Error::other)?;
                }
                Ok(())
            }
        },
        |_handler| {
            |b: u8, response: ResponseWriter| -> Option<CancelHandle> {
                let pool = response.buffer_pool().clone();
                let mut body = BufferChainWriter::new(pool.as_ref());
                if body.write_all(&vec![b; 3000]).is_err() {
                    return None;
                }
                response.write(
                    Some(Box::new(move |out: &mut BufferChainWriter<'_>| {
                        out.write_all(&[b'#'])
                    })),
                    body.finish(),
                );
                None
            }
        },
    )
}

fn buffers_are_conserved(strategy: BufferStrategy) {
    let mut config = test_config_with(2, strategy);
    config.buffer.size = 512;
    let manager = SocketManager::new(config).unwrap();
    let pool = manager.buffer_pool().clone();
    let addr = bind(&manager, chained_binding());

    // Completed round trips.
    for i in 0..4u8 {
        let mut stream = connect(addr);
        let out = round_trip(&mut stream, &[i, i], 2 * 3001);
        assert_eq!(out[0], b'#');
        assert_eq!(out[3001], b'#');
    }
    // Clients that leave before reading anything.
    for i in 0..4u8 {
        let mut stream = connect(addr);
        stream.write_all(&[i; 64]).unwrap();
    }
    // Clients that hang up partway through a large response.
    for _ in 0..2 {
        let mut stream = connect(addr);
        stream.write_all(&[9; 255]).unwrap();
        let mut some = [0u8; 100];
        stream.read_exact(&mut some).unwrap();
    }
    // Connections still open at shutdown.
    let mut open = Vec::new();
    for _ in 0..4 {
        let mut stream = connect(addr);
        stream.write_all(&[7; 16]).unwrap();
        open.push(stream);
    }

    manager.shutdown().unwrap();
    let stats = pool.stats();
    assert!(stats.acquired > 0);
    assert_eq!(stats.outstanding(), 0, "{strategy:?}: {stats:?}");
}

#[test]
fn buffers_conserved_pooled() {
    buffers_are_conserved(BufferStrategy::Pooled);
}

#[test]
fn buffers_conserved_thread_local() {
    buffers_are_conserved(BufferStrategy::ThreadLocal);
}

#[test]
fn buffers_conserved_unpooled() {
    buffers_are_conserved(BufferStrategy::Unpooled);
}
