//! Setup errors surfaced to the caller.
//!
//! Only failures that prevent a reactor or endpoint from being constructed
//! are surfaced. Runtime I/O failures close the affected connection and are
//! reported through the endpoint's close callback instead.

use std::io;

/// Errors that can occur while constructing a reactor or an endpoint.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("port {0} is outside the usable range")]
    InvalidPort(u16),
    #[error("failed to create socket: {0}")]
    Socket(#[source] io::Error),
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to listen on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to create readiness multiplexer: {0}")]
    Multiplexer(#[source] io::Error),
    #[error("failed to register with the readiness multiplexer: {0}")]
    Register(#[source] io::Error),
}
