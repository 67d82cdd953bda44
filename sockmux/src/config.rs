use std::time::Duration;

use crate::error::Error;

/// How the default [`StreamBufferPool`](crate::StreamBufferPool) manages its segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferStrategy {
    /// Released segments go to one shared free list.
    #[default]
    Pooled,
    /// Released segments go to a bounded per-thread cache first, then the
    /// shared free list.
    ThreadLocal,
    /// Every acquire allocates; released segments are freed.
    Unpooled,
}

/// Configuration for the socket manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener (event-loop thread) configuration.
    pub listener: ListenerConfig,
    /// Buffer pool configuration.
    pub buffer: BufferConfig,
    /// Bytes of filled-but-unwritten output a connection may hold before its
    /// read interest is suspended.
    pub backpressure_threshold: usize,
    /// Maximum time a listener blocks in its selector. An empty wait fires the
    /// idle callback for every registered connection.
    pub poll_timeout: Duration,
    /// Capacity of the per-listener readiness event batch.
    pub events_capacity: usize,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Enable TCP_NODELAY on all accepted connections.
    pub tcp_nodelay: bool,
    /// Delay before an acceptor retries when every listener is at capacity.
    pub accept_retry_interval: Duration,
    /// Bound used by [`SocketManager::shutdown`](crate::SocketManager::shutdown)
    /// when waiting for threads to exit.
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            buffer: BufferConfig::default(),
            backpressure_threshold: 1024 * 1024,
            poll_timeout: Duration::from_millis(100),
            events_capacity: 1024,
            backlog: 1024,
            tcp_nodelay: true,
            accept_retry_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.listener.max_connections == 0 || self.listener.max_connections >= (1 << 24) {
            return Err(Error::InvalidConfig(
                "listener.max_connections must be > 0 and < 2^24".into(),
            ));
        }
        if self.buffer.size == 0 {
            return Err(Error::InvalidConfig("buffer.size must be > 0".into()));
        }
        if self.backpressure_threshold == 0 {
            return Err(Error::InvalidConfig(
                "backpressure_threshold must be > 0".into(),
            ));
        }
        if self.poll_timeout.is_zero() {
            return Err(Error::InvalidConfig("poll_timeout must be > 0".into()));
        }
        if self.events_capacity == 0 {
            return Err(Error::InvalidConfig("events_capacity must be > 0".into()));
        }
        if self.accept_retry_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "accept_retry_interval must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Number of listener threads after resolving `0` to the CPU count.
    pub fn resolved_threads(&self) -> usize {
        if self.listener.threads == 0 {
            num_cpus()
        } else {
            self.listener.threads
        }
    }
}

/// Configuration for the listener thread pool.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Number of listener threads. 0 = number of CPUs.
    pub threads: usize,
    /// Maximum connections registered with a single listener.
    pub max_connections: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            max_connections: 4096,
        }
    }
}

/// Configuration for the default buffer pool.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Capacity of each pooled buffer in bytes.
    pub size: usize,
    /// Pooling strategy.
    pub strategy: BufferStrategy,
    /// Segments kept per thread when `strategy` is [`BufferStrategy::ThreadLocal`].
    pub thread_local_cache: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size: 8192,
            strategy: BufferStrategy::Pooled,
            thread_local_cache: 64,
        }
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use sockmux::{BufferStrategy, ConfigBuilder};
///
/// let config = ConfigBuilder::default()
///     .listeners(4)
///     .max_connections(1000)
///     .buffer_size(16 * 1024)
///     .buffer_strategy(BufferStrategy::ThreadLocal)
///     .backpressure_threshold(256 * 1024)
///     .build()
///     .expect("invalid config");
/// assert_eq!(config.listener.threads, 4);
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Listener settings ────────────────────────────────────────────

    /// Set the number of listener threads. 0 = number of CPUs.
    pub fn listeners(mut self, n: usize) -> Self {
        self.config.listener.threads = n;
        self
    }

    /// Set the per-listener connection cap.
    pub fn max_connections(mut self, n: u32) -> Self {
        self.config.listener.max_connections = n;
        self
    }

    /// Set the selector wait bound.
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = timeout;
        self
    }

    /// Set the readiness event batch size.
    pub fn events_capacity(mut self, n: usize) -> Self {
        self.config.events_capacity = n;
        self
    }

    // ── Buffer settings ──────────────────────────────────────────────

    /// Set the pooled buffer capacity.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer.size = size;
        self
    }

    /// Set the buffer pooling strategy.
    pub fn buffer_strategy(mut self, strategy: BufferStrategy) -> Self {
        self.config.buffer.strategy = strategy;
        self
    }

    /// Set the per-thread cache size for [`BufferStrategy::ThreadLocal`].
    pub fn thread_local_cache(mut self, n: usize) -> Self {
        self.config.buffer.thread_local_cache = n;
        self
    }

    /// Set the backpressure threshold in bytes.
    pub fn backpressure_threshold(mut self, bytes: usize) -> Self {
        self.config.backpressure_threshold = bytes;
        self
    }

    // ── Socket settings ──────────────────────────────────────────────

    /// Set the TCP listen backlog.
    pub fn backlog(mut self, n: i32) -> Self {
        self.config.backlog = n;
        self
    }

    /// Enable or disable TCP_NODELAY on accepted connections.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    /// Set the retry delay for deferred accepts.
    pub fn accept_retry_interval(mut self, interval: Duration) -> Self {
        self.config.accept_retry_interval = interval;
        self
    }

    /// Set the bound used when `shutdown()` waits for threads.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    // ── Escape hatch ─────────────────────────────────────────────────

    /// Get mutable access to the underlying config for fields not covered
    /// by builder methods.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Get the number of available CPU cores.
fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 { 1 } else { ret as usize }
}
