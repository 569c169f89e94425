//! User-supplied per-endpoint behavior.

use crate::connection::Connection;
use std::sync::Arc;

/// Callbacks an endpoint invokes over the lifetime of each connection.
///
/// All three run on the reactor thread, with no runtime lock held. They must
/// not block on synchronous I/O; [`Connection::enqueue`] is the intended
/// outbound path and never waits on the socket.
pub trait ConnectionHandler: Send + Sync {
    /// Called once right after a new connection has been registered.
    fn on_open(&self, _conn: &Arc<Connection>) {}

    /// Called after inbound bytes were drained into the receive buffer.
    ///
    /// Typical implementations loop on [`Connection::read_delimited`] or
    /// [`Connection::read_bytes`] until no complete message remains.
    fn on_message(&self, conn: &Arc<Connection>);

    /// Called exactly once after the connection has been closed and removed
    /// from the runtime, right before it is destroyed.
    fn on_close(&self, _conn: &Arc<Connection>) {}
}
