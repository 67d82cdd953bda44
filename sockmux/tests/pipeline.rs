//! Integration tests: request pipelining, ordering, and cross-thread access.

mod common;

use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use common::*;
use sockmux::{
    Binding, BufferChainWriter, CancelHandle, ConfigBuilder, Error, PooledBuffer, ResponseWriter,
    SocketManager,
};

#[test]
fn responses_follow_request_order() {
    let manager = SocketManager::new(test_config(1)).unwrap();
    // Request 1 completes late on another thread; request 2 completes at once.
    let binding = Binding::<u8>::new(
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
                if b == 1 {
                    thread::spawn(move || {
                        thread::sleep(Duration::from_millis(100));
                        response.write(None, Some(PooledBuffer::from_bytes(vec![1u8])));
                    });
                } else {
                    response.write(None, Some(PooledBuffer::from_bytes(vec![b])));
                }
                None
            }
        },
    );
    let addr = bind(&manager, binding);

    let mut stream = connect(addr);
    assert_eq!(round_trip(&mut stream, &[1, 2], 2), vec![1, 2]);
    assert_eq!(round_trip(&mut stream, &[1, 2, 3], 3), vec![1, 2, 3]);
    manager.shutdown().unwrap();
}

#[test]
fn many_requests_from_one_read() {
    let manager = SocketManager::new(test_config(2)).unwrap();
    let addr = bind(&manager, byte_binding(1));

    let mut stream = connect(addr);
    let request: Vec<u8> = (0..200u8).collect();
    let expected: Vec<u8> = request.iter().map(|b| b + 1).collect();
    assert_eq!(round_trip(&mut stream, &request, request.len()), expected);
    manager.shutdown().unwrap();
}

#[test]
fn header_precedes_body() {
    let manager = SocketManager::new(test_config(1)).unwrap();
    let binding = Binding::<u8>::new(
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
                // Multi-segment body built from the pool.
                let pool = response.buffer_pool().clone();
                let mut body = BufferChainWriter::new(pool.as_ref());
                body.write_all(&vec![b; 10_000]).unwrap();
                response.write(
                    Some(Box::new(move |out: &mut BufferChainWriter<'_>| {
                        write!(out, "len={};", 10_000)
                    })),
                    body.finish(),
                );
                None
            }
        },
    );
    let addr = bind(&manager, binding);

    let mut stream = connect(addr);
    let out = round_trip(&mut stream, b"x", 10 + 10_000);
    assert_eq!(&out[..10], b"len=10000;");
    assert!(out[10..].iter().all(|&b| b == b'x'));
    manager.shutdown().unwrap();
}

#[test]
fn connections_are_independent_with_deferred_accepts() {
    let config = ConfigBuilder::new()
        .listeners(2)
        .max_connections(4)
        .poll_timeout(Duration::from_millis(20))
        .accept_retry_interval(Duration::from_millis(5))
        .build()
        .unwrap();
    let manager = SocketManager::new(config).unwrap();
    let addr = bind(&manager, byte_binding(10));

    let clients: Vec<_> = (0..20u8)
        .map(|i| {
            thread::spawn(move || {
                let mut stream = connect(addr);
                round_trip(&mut stream, &[i], 1)[0]
            })
        })
        .collect();
    for (i, client) in clients.into_iter().enumerate() {
        assert_eq!(client.join().unwrap(), 10 + i as u8);
    }

    assert!(wait_until(Duration::from_secs(5), || {
        manager.connection_counts().iter().all(|&n| n == 0)
    }));
    manager.shutdown().unwrap();
}

#[test]
fn foreign_thread_must_go_through_execute() {
    let manager = SocketManager::new(test_config(1)).unwrap();
    let serviced = Arc::new(AtomicUsize::new(0));
    let (errors_tx, errors) = mpsc::channel::<Error>();
    let errors_tx = Mutex::new(errors_tx);

    let count = serviced.clone();
    let binding = Binding::<u8>::new(
        move |handler| {
            let errors_tx = errors_tx.lock().unwrap().clone();
            move |buf: &PooledBuffer, n: usize, _new: bool| -> io::Result<()> {
                for &b in new_bytes(buf, n) {
                    let handler = handler.clone();
                    let errors_tx = errors_tx.clone();
                    thread::spawn(move || {
                        if let Err(e) = handler.handle_request(b) {
                            let _ = errors_tx.send(e);
                        }
                        let immediate = PooledBuffer::from_bytes(&b"oob"[..]);
                        if let Err(e) = handler.send_immediate_data(immediate) {
                            let _ = errors_tx.send(e);
                        }
                        let owner = handler.clone();
                        handler.execute(move || {
                            owner.handle_request(b).unwrap();
                        });
                    });
                }
                Ok(())
            }
        },
        move |_handler| {
            let count = count.clone();
            move |b: u8, response: ResponseWriter| -> Option<CancelHandle> {
                count.fetch_add(1, Ordering::SeqCst);
                response.write(None, Some(PooledBuffer::from_bytes(vec![b + 1])));
                None
            }
        },
    );
    let addr = bind(&manager, binding);

    let mut stream = connect(addr);
    assert_eq!(round_trip(&mut stream, &[5], 1), vec![6]);

    for _ in 0..2 {
        let err = errors.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(err, Error::IllegalState(_)), "{err}");
    }
    assert_eq!(serviced.load(Ordering::SeqCst), 1);
    manager.shutdown().unwrap();
}

#[test]
fn immediate_data_lands_between_responses() {
    let manager = SocketManager::new(test_config(1)).unwrap();
    let binding = Binding::<u8>::new(
        |handler| {
            move |buf: &PooledBuffer, n: usize, _new: bool| -> io::Result<()> {
                for &b in new_bytes(buf, n) {
                    if b == b'!' {
                        handler
                            .send_immediate_data(PooledBuffer::from_bytes(&b"<push>"[..]))
                            .map_err(io::Error::other)?;
                    } else {
                        handler.handle_request(b).map_err(io::Error::other)?;
                    }
                }
                Ok(())
            }
        },
        |_handler| {
            |b: u8, response: ResponseWriter| -> Option<CancelHandle> {
                response.write(None, Some(PooledBuffer::from_bytes(vec![b])));
                None
            }
        },
    );
    let addr = bind(&manager, binding);

    let mut stream = connect(addr);
    let out = round_trip(&mut stream, b"a!b", 8);
    // The push may precede responses not yet on the wire, but never splits one.
    let at = out.windows(6).position(|w| w == b"<push>").unwrap();
    let mut responses = out.clone();
    responses.drain(at..at + 6);
    assert_eq!(responses, b"ab");
    manager.shutdown().unwrap();
}

#[test]
fn cancel_runs_pending_cancel_handles() {
    let manager = SocketManager::new(test_config(1)).unwrap();
    let pool = manager.buffer_pool().clone();
    let cancelled = Arc::new(AtomicUsize::new(0));
    let parked: Arc<Mutex<Vec<ResponseWriter>>> = Arc::default();
    let (handler_tx, handler_rx) = mpsc::channel();
    let handler_tx = Mutex::new(handler_tx);

    let (seen, held) = (cancelled.clone(), parked.clone());
    let binding = Binding::<u8>::new(
        move |handler| {
            let _ = handler_tx.lock().unwrap().send(handler.clone());
            move |buf: &PooledBuffer, n: usize, _new: bool| -> io::Result<()> {
                for &b in new_bytes(buf, n) {
                    handler.handle_request(b).map_err(io::Error::other)?;
                }
                Ok(())
            }
        },
        move |_handler| {
            let (seen, held) = (seen.clone(), held.clone());
            move |_b: u8, response: ResponseWriter| -> Option<CancelHandle> {
                held.lock().unwrap().push(response);
                let seen = seen.clone();
                Some(CancelHandle::new(move || {
                    seen.fetch_add(1, Ordering::SeqCst);
                }))
            }
        },
    );
    let addr = bind(&manager, binding);

    let mut stream = connect(addr);
    stream.write_all(&[1, 2]).unwrap();
    let handler = handler_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(wait_until(Duration::from_secs(5), || parked.lock().unwrap().len() == 2));

    handler.cancel();
    assert!(handler.is_closed());
    assert!(!handler.is_reading_input());
    assert!(closed_by_server(&mut stream));
    assert!(wait_until(Duration::from_secs(5), || {
        cancelled.load(Ordering::SeqCst) == 2
    }));

    // Writing to a closed connection is a no-op that still releases the body.
    for response in parked.lock().unwrap().drain(..) {
        let mut body = pool.acquire();
        body.write(b"late");
        response.write(None, Some(body));
    }
    manager.shutdown().unwrap();
    assert_eq!(pool.stats().outstanding(), 0);
}

#[test]
fn panicking_servicer_closes_only_its_connection() {
    let manager = SocketManager::new(test_config(1)).unwrap();
    let pool = manager.buffer_pool().clone();
    let binding = Binding::<u8>::new(
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
                let mut body = response.buffer_pool().acquire();
                body.write(&[b]);
                assert_ne!(b, 0xff, "poisoned request");
                response.write(None, Some(body));
                None
            }
        },
    );
    let addr = bind(&manager, binding);

    let mut healthy = connect(addr);
    let mut poisoned = connect(addr);
    assert_eq!(round_trip(&mut healthy, &[1], 1), vec![1]);

    poisoned.write_all(&[0xff]).unwrap();
    assert!(closed_by_server(&mut poisoned));

    assert_eq!(round_trip(&mut healthy, &[2], 1), vec![2]);
    manager.shutdown().unwrap();
    let stats = pool.stats();
    assert!(stats.acquired >= 3);
    assert_eq!(stats.outstanding(), 0);
}
