//! Server metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active sessions"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "accept_failures",
    description = "Accept completions that reported an error"
)]
pub static ACCEPT_FAILURES: Counter = Counter::new();

#[metric(name = "bytes_received", description = "Bytes received from clients")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Bytes sent to clients")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "packets_dispatched",
    description = "Complete packets handed to the dispatcher"
)]
pub static PACKETS_DISPATCHED: Counter = Counter::new();

#[metric(
    name = "protocol_errors",
    description = "Sessions closed due to malformed frames"
)]
pub static PROTOCOL_ERRORS: Counter = Counter::new();
