//! tcp-reactor - readiness-driven multi-connection TCP server core.
//!
//! A [`Reactor`] multiplexes any number of listening [`Endpoint`]s and their
//! accepted [`Connection`]s over epoll, with all socket I/O non-blocking. A
//! reactor thread accepts connections, drains inbound bytes into
//! per-connection receive buffers, and invokes the endpoint's
//! [`ConnectionHandler`]; a separate sender thread drains per-connection
//! send buffers under a fair-share quota so a slow peer never starves the
//! rest.
//!
//! User code touches the runtime through the handler callbacks plus three
//! connection operations: framed reads over the receive buffer
//! ([`Connection::read_delimited`], [`Connection::read_bytes`]) and
//! [`Connection::enqueue`] for output. Framing is the caller's choice; the
//! runtime delivers raw byte streams.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tcp_reactor::{Connection, ConnectionHandler, Endpoint, Reactor};
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_message(&self, conn: &Arc<Connection>) {
//!         while let Some(line) = conn.read_delimited(b"\r\n") {
//!             conn.enqueue(line);
//!         }
//!     }
//! }
//!
//! let reactor = Reactor::new()?;
//! let endpoint = Endpoint::create(&reactor, 8080, Echo)?;
//! // ... the reactor serves traffic until the endpoint is closed ...
//! endpoint.close();
//! ```
//!
//! Handler callbacks run on the reactor thread and must not block on
//! synchronous I/O; `enqueue` is the intended outbound path and never waits
//! on the socket.

mod buffer;
mod connection;
mod endpoint;
mod error;
mod handler;
mod reactor;
mod registry;

pub mod metrics;

pub use connection::Connection;
pub use endpoint::Endpoint;
pub use error::SetupError;
pub use handler::ConnectionHandler;
pub use reactor::{Reactor, ReactorBuilder};
