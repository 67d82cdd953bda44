//! Line echo server.
//!
//! Every newline-terminated line is one request; its response is the line
//! itself. Lines are echoed in the order they arrive even though odd lines
//! are answered from a helper thread after a short delay.
//!
//! Usage:
//!   cargo run --example echo_server [BIND_ADDR]
//!   # default: 127.0.0.1:7878; press Enter to shut down.
//!   RUST_LOG=sockmux=debug for connection-level logs.

use std::io::{self, BufRead};
use std::thread;
use std::time::Duration;

use sockmux::{Binding, CancelHandle, ConfigBuilder, PooledBuffer, ResponseWriter, SocketManager};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string());

    let config = ConfigBuilder::new()
        .listeners(2)
        .max_connections(1024)
        .buffer_size(4096)
        .build()?;
    let manager = SocketManager::new(config)?;

    let binding = Binding::<Vec<u8>>::new(
        |handler| {
            let mut partial = Vec::new();
            move |buf: &PooledBuffer, n: usize, _new: bool| -> io::Result<()> {
                for &b in &buf.data()[buf.len() - n..] {
                    partial.push(b);
                    if b == b'\n' {
                        let line = std::mem::take(&mut partial);
                        handler.handle_request(line).map_err(io::Error::other)?;
                    }
                }
                Ok(())
            }
        },
        |_handler| {
            let mut count = 0u64;
            move |line: Vec<u8>, response: ResponseWriter| -> Option<CancelHandle> {
                count += 1;
                if count % 2 == 1 {
                    thread::spawn(move || {
                        thread::sleep(Duration::from_millis(20));
                        response.write(None, Some(PooledBuffer::from_bytes(line)));
                    });
                } else {
                    response.write(None, Some(PooledBuffer::from_bytes(line)));
                }
                None
            }
        },
    );
    let addr = manager.bind(bind_addr.parse()?, binding)?;
    eprintln!("echoing lines on {addr}; press Enter to stop");

    let mut input = String::new();
    io::stdin().lock().read_line(&mut input)?;
    manager.shutdown()?;
    Ok(())
}
