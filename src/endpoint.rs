//! A bound and listening TCP endpoint.
//!
//! An endpoint is data, not a thread: it owns the listening socket, the
//! user's handler, and the set of connections accepted on it. The reactor
//! drives accepts and removals; user code only creates and closes it.

use crate::connection::Connection;
use crate::error::SetupError;
use crate::handler::ConnectionHandler;
use crate::reactor::{Reactor, Shared};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const LISTEN_BACKLOG: i32 = 16;

/// A listening endpoint plus the connections accepted on it.
pub struct Endpoint {
    port: u16,
    fd: RawFd,
    /// Taken on close so the descriptor is released eagerly; accepts hold
    /// the lock only around the accept call itself.
    listener: Mutex<Option<Socket>>,
    open: AtomicBool,
    handler: Arc<dyn ConnectionHandler>,
    connections: Mutex<HashMap<RawFd, Arc<Connection>>>,
    shared: Arc<Shared>,
}

impl Endpoint {
    /// Bind `port` on all interfaces, start listening, and hand the
    /// listener to the reactor.
    ///
    /// The endpoint stays alive for as long as any caller or the reactor
    /// holds a reference; it stops accepting when [`close`](Self::close) is
    /// called or the reactor shuts down.
    pub fn create<H>(reactor: &Reactor, port: u16, handler: H) -> Result<Arc<Self>, SetupError>
    where
        H: ConnectionHandler + 'static,
    {
        if port == 0 {
            return Err(SetupError::InvalidPort(port));
        }

        let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(SetupError::Socket)?;
        listener
            .set_reuse_address(true)
            .map_err(SetupError::Socket)?;

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        listener
            .bind(&addr.into())
            .map_err(|source| SetupError::Bind { port, source })?;
        listener
            .listen(LISTEN_BACKLOG)
            .map_err(|source| SetupError::Listen { port, source })?;
        listener
            .set_nonblocking(true)
            .map_err(SetupError::Socket)?;

        let fd = listener.as_raw_fd();
        let endpoint = Arc::new(Self {
            port,
            fd,
            listener: Mutex::new(Some(listener)),
            open: AtomicBool::new(true),
            handler: Arc::new(handler),
            connections: Mutex::new(HashMap::new()),
            shared: Arc::clone(reactor.shared()),
        });

        endpoint
            .shared
            .register_listener(&endpoint)
            .map_err(SetupError::Register)?;

        tracing::info!(port, fd, "endpoint listening");
        Ok(endpoint)
    }

    /// The port this endpoint is bound to.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the endpoint is still accepting connections.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Stop accepting and close every connection accepted here.
    ///
    /// Idempotent and safe from any thread. When this returns the listening
    /// descriptor is released and no further accepts occur; the reactor
    /// runs each connection's close callback asynchronously.
    pub fn close(&self) {
        if self
            .open
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.shared.unregister_listener(self.fd);

        {
            let connections = self.connections.lock().unwrap();
            for conn in connections.values() {
                conn.close();
            }
        }

        let listener = self.listener.lock().unwrap().take();
        drop(listener);

        tracing::info!(port = self.port, "endpoint closed");
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ConnectionHandler> {
        &self.handler
    }

    /// Accept one pending connection, if any.
    ///
    /// Returns `None` once the backlog is drained, on transient errors, or
    /// after the endpoint has been closed.
    pub(crate) fn accept(self: &Arc<Self>) -> Option<Arc<Connection>> {
        let mut connections = self.connections.lock().unwrap();

        // Checked under the map lock: a concurrent close() either finds the
        // new connection in the map or this accept observes the endpoint
        // closed. Nothing slips between the two.
        if !self.is_open() {
            return None;
        }

        let (sock, addr) = {
            let guard = self.listener.lock().unwrap();
            let listener = guard.as_ref()?;
            match listener.accept() {
                Ok(pair) => pair,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, port = self.port, "accept failed");
                    return None;
                }
            }
        };

        let conn = Connection::new(sock, self, Arc::clone(&self.shared));
        connections.insert(conn.fd(), Arc::clone(&conn));

        tracing::debug!(
            fd = conn.fd(),
            peer = ?addr.as_socket(),
            port = self.port,
            "client connected"
        );
        Some(conn)
    }

    /// Drop a connection from this endpoint's map.
    pub(crate) fn remove(&self, fd: RawFd) {
        self.connections.lock().unwrap().remove(&fd);
    }
}
