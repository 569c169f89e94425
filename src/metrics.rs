//! Runtime metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently registered connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "bytes_received", description = "Total bytes drained from sockets")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Total bytes written to sockets")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "overflow_closes",
    description = "Connections closed because a buffer would exceed its cap"
)]
pub static OVERFLOW_CLOSES: Counter = Counter::new();

#[metric(
    name = "stalled_closes",
    description = "Connections closed because the peer stopped draining sends"
)]
pub static STALLED_CLOSES: Counter = Counter::new();
