//! sockmux runtime metrics.
//!
//! Counters are sharded per listener thread; register them with any
//! metriken exposition endpoint to publish them.

use metriken::{Gauge, metric};

use crate::counter::Counter;

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "sockmux/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "sockmux/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "sockmux/connections/active",
    description = "Currently registered connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "sockmux/connections/accept_deferred",
    description = "Accepts postponed because every listener was at capacity"
)]
pub static ACCEPT_DEFERRED: Counter = Counter::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "sockmux/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "sockmux/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

// ── Flow control and faults ──────────────────────────────────────

#[metric(
    name = "sockmux/backpressure/engaged",
    description = "Times a connection's read interest was suspended"
)]
pub static BACKPRESSURE_ENGAGED: Counter = Counter::new();

#[metric(
    name = "sockmux/servicer/panics",
    description = "Application servicer panics caught by a listener"
)]
pub static SERVICER_PANICS: Counter = Counter::new();

#[metric(
    name = "sockmux/file/failures",
    description = "File-backed segments that failed mid-transfer"
)]
pub static FILE_FAILURES: Counter = Counter::new();
