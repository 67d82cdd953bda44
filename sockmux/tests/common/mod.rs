//! Helpers shared by the integration suites.

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use sockmux::{
    Binding, BufferStrategy, CancelHandle, Config, ConfigBuilder, PooledBuffer, ResponseWriter,
    SocketManager,
};

pub fn test_config(listeners: usize) -> Config {
    ConfigBuilder::new()
        .listeners(listeners)
        .max_connections(64)
        .buffer_size(4096)
        .poll_timeout(Duration::from_millis(20))
        .shutdown_timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

pub fn test_config_with(listeners: usize, strategy: BufferStrategy) -> Config {
    let mut config = test_config(listeners);
    config.buffer.strategy = strategy;
    config
}

/// Bind on an ephemeral loopback port.
pub fn bind<R: 'static>(manager: &SocketManager, binding: Binding<R>) -> SocketAddr {
    manager
        .bind("127.0.0.1:0".parse().unwrap(), binding)
        .unwrap()
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

pub fn read_exact_timeout(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).unwrap();
    buf
}

/// Whether the server closed the connection: EOF or reset, not a timeout.
pub fn closed_by_server(stream: &mut TcpStream) -> bool {
    let mut byte = [0u8; 1];
    match stream.read(&mut byte) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => !matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
    }
}

pub fn round_trip(stream: &mut TcpStream, request: &[u8], response_len: usize) -> Vec<u8> {
    stream.write_all(request).unwrap();
    read_exact_timeout(stream, response_len)
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// The bytes passed to the latest socket servicer call.
pub fn new_bytes(buffer: &PooledBuffer, bytes_read: usize) -> &[u8] {
    &buffer.data()[buffer.len() - bytes_read..]
}

/// One request per received byte; each response is the byte plus `offset`.
pub fn byte_binding(offset: u8) -> Binding<u8> {
    Binding::new(
        |handler| {
            move |buf: &PooledBuffer, n: usize, _new: bool| -> io::Result<()> {
                for &b in new_bytes(buf, n) {
                    handler.handle_request(b).map_err(io::Error::other)?;
                }
                Ok(())
            }
        },
        move |_handler| {
            move |b: u8, response: ResponseWriter| -> Option<CancelHandle> {
                let body = PooledBuffer::from_bytes(vec![b.wrapping_add(offset)]);
                response.write(None, Some(body));
                None
            }
        },
    )
}
