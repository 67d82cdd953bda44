//! Non-blocking socket-server core.
//!
//! A [`SocketManager`] runs a fixed number of listener threads, each with
//! its own selector, and one acceptor thread per bound port. Accepted
//! connections are spread round-robin over listeners with spare capacity;
//! when every listener is full, accepts wait in the kernel backlog.
//!
//! Each connection belongs to exactly one listener for its lifetime. Its
//! [`SocketServicer`] decodes requests from raw reads and hands them to
//! [`RequestHandler::handle_request`]; every request reserves a response
//! slot and is passed to the [`RequestServicer`] with a [`ResponseWriter`]
//! for that slot. Responses reach the wire in request order, however they
//! are completed. A connection whose unwritten output exceeds
//! `backpressure_threshold` stops reading until the client catches up.
//!
//! Buffers come from a shared [`BufferPool`]; every [`PooledBuffer`] chain
//! returns to its pool when dropped, whichever way the connection ends.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::io::Write;
//!
//! use sockmux::{Binding, BufferChainWriter, ConfigBuilder, PooledBuffer, SocketManager};
//!
//! fn main() -> Result<(), sockmux::Error> {
//!     let config = ConfigBuilder::new().listeners(2).max_connections(256).build()?;
//!     let manager = SocketManager::new(config)?;
//!
//!     // One request per byte received; respond with the byte plus one.
//!     let binding = Binding::<u8>::new(
//!         |handler| {
//!             move |buf: &PooledBuffer, n: usize, _new: bool| -> std::io::Result<()> {
//!                 for &b in &buf.data()[buf.len() - n..] {
//!                     handler.handle_request(b).map_err(std::io::Error::other)?;
//!                 }
//!                 Ok(())
//!             }
//!         },
//!         |_handler| {
//!             |b: u8, response: sockmux::ResponseWriter| -> Option<sockmux::CancelHandle> {
//!                 response.write(
//!                     Some(Box::new(move |out: &mut BufferChainWriter<'_>| {
//!                         out.write_all(&[b.wrapping_add(1)])
//!                     })),
//!                     None,
//!                 );
//!                 None
//!             }
//!         },
//!     );
//!     let addr = manager.bind("127.0.0.1:7878".parse().unwrap(), binding)?;
//!     println!("listening on {addr}");
//!     manager.shutdown()
//! }
//! ```

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod acceptor;
pub(crate) mod connection;
pub(crate) mod counter;
pub(crate) mod listener;
pub(crate) mod mailbox;
pub(crate) mod manager;
pub(crate) mod metrics;
pub(crate) mod response;

// ── Public modules ──────────────────────────────────────────────────────
pub mod buffer;
pub mod config;
pub mod error;
pub mod handler;

// ── Re-exports: Buffers ─────────────────────────────────────────────────

/// Source of pooled buffers shared by every listener thread.
pub use buffer::BufferPool;
/// `io::Write` adapter that builds a chain of pooled buffers.
pub use buffer::BufferChainWriter;
/// Callback fired once when a file-backed buffer is released.
pub use buffer::FileCompletion;
/// Acquire and release totals of a pool.
pub use buffer::PoolStats;
/// A fixed-capacity, chainable buffer, possibly file-backed.
pub use buffer::PooledBuffer;
/// The default buffer pool.
pub use buffer::StreamBufferPool;

// ── Re-exports: Configuration and errors ────────────────────────────────

pub use config::{BufferConfig, BufferStrategy, Config, ConfigBuilder, ListenerConfig};
pub use error::Error;

// ── Re-exports: Connection API ──────────────────────────────────────────

/// Opaque connection handle.
pub use connection::ConnToken;
/// Socket decorators accepted by [`Binding`].
pub use handler::{AcceptedSocketDecorator, ServerSocketDecorator};
/// Servicer factories and options for one bound port.
pub use handler::Binding;
/// Per-connection handle used by socket servicers.
pub use handler::RequestHandler;
/// Application logic for one decoded request.
pub use handler::RequestServicer;
/// Per-connection read callback.
pub use handler::SocketServicer;
/// Cancels request work when its connection closes early.
pub use response::CancelHandle;
/// Replacement response for a failed file-backed body.
pub use response::FallbackProducer;
/// Produces header bytes for a response.
pub use response::HeaderProducer;
/// Fills one response slot.
pub use response::ResponseWriter;

// ── Re-exports: Server ──────────────────────────────────────────────────

/// Listener threads, acceptors, and shutdown.
pub use manager::SocketManager;
