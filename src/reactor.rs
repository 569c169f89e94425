//! The shared event-dispatch core.
//!
//! One reactor serves any number of endpoints. It owns the readiness
//! multiplexer and two threads: the reactor thread accepts, drains sockets
//! into receive buffers, and dispatches handler callbacks; the sender thread
//! walks connections with pending output and drains them under a fair-share
//! quota so a slow peer never monopolizes the write path.

use crate::connection::{Connection, SendOutcome};
use crate::endpoint::Endpoint;
use crate::error::SetupError;
use crate::metrics::{CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE};
use crate::registry::{Entry, Registry};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Upper bound on readiness events handled per reactor pass.
const MAX_EVENTS: usize = 32;

/// Readiness wait bound; also the worst-case delay for reclaiming
/// locally-closed connections.
const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Sender parking bound while no connection has pending output.
const SEND_WAIT: Duration = Duration::from_millis(1);

/// Socket options applied to accepted connections.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SocketOptions {
    pub(crate) cork: bool,
    pub(crate) send_buffer_size: usize,
}

/// Builder for a [`Reactor`].
///
/// # Example
///
/// ```ignore
/// let reactor = Reactor::builder()
///     .cork(false)
///     .send_quota(4)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct ReactorBuilder {
    cork: bool,
    send_buffer_size: usize,
    send_quota: u32,
}

impl Default for ReactorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactorBuilder {
    pub fn new() -> Self {
        Self {
            cork: true,
            send_buffer_size: 8192,
            send_quota: 10,
        }
    }

    /// Whether to set TCP_CORK on accepted sockets. Corking trades a little
    /// latency for fuller segments. Default: true.
    pub fn cork(mut self, enabled: bool) -> Self {
        self.cork = enabled;
        self
    }

    /// SO_SNDBUF requested for accepted sockets. Default: 8 KiB.
    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = size;
        self
    }

    /// Maximum write attempts per connection per sender pass. Default: 10.
    pub fn send_quota(mut self, quota: u32) -> Self {
        self.send_quota = quota.max(1);
        self
    }

    /// Create the multiplexer and start the reactor and sender threads.
    pub fn build(self) -> Result<Reactor, SetupError> {
        let poll = Poll::new().map_err(SetupError::Multiplexer)?;
        let selector = poll
            .registry()
            .try_clone()
            .map_err(SetupError::Multiplexer)?;

        let shared = Arc::new(Shared {
            registry: Registry::new(),
            selector,
            open: AtomicBool::new(true),
            socket_opts: SocketOptions {
                cork: self.cork,
                send_buffer_size: self.send_buffer_size,
            },
            send_quota: self.send_quota,
        });

        let reactor_shared = Arc::clone(&shared);
        let reactor_thread = std::thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || run_reactor(reactor_shared, poll))
            .expect("failed to spawn reactor thread");

        let sender_shared = Arc::clone(&shared);
        let sender_thread = std::thread::Builder::new()
            .name("sender".to_string())
            .spawn(move || run_sender(sender_shared))
            .expect("failed to spawn sender thread");

        tracing::info!("reactor started");
        Ok(Reactor {
            shared,
            reactor_thread: Some(reactor_thread),
            sender_thread: Some(sender_thread),
        })
    }
}

/// The event-dispatch core. Create one per process (or per isolated group
/// of endpoints); endpoints attach to it at creation.
///
/// Dropping the reactor stops both threads, closes every endpoint still
/// attached, and runs each remaining connection's close callback.
pub struct Reactor {
    shared: Arc<Shared>,
    reactor_thread: Option<JoinHandle<()>>,
    sender_thread: Option<JoinHandle<()>>,
}

impl Reactor {
    /// Build a reactor with default options.
    pub fn new() -> Result<Self, SetupError> {
        ReactorBuilder::new().build()
    }

    pub fn builder() -> ReactorBuilder {
        ReactorBuilder::new()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shared.open.store(false, Ordering::Release);
        self.shared.registry.notify_sender();

        if let Some(handle) = self.reactor_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.sender_thread.take() {
            let _ = handle.join();
        }
        tracing::info!("reactor stopped");
    }
}

/// State shared between the reactor handle, both threads, and every
/// endpoint and connection attached to this reactor.
pub(crate) struct Shared {
    pub(crate) registry: Registry,
    selector: mio::Registry,
    open: AtomicBool,
    socket_opts: SocketOptions,
    send_quota: u32,
}

impl Shared {
    #[inline]
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn socket_opts(&self) -> SocketOptions {
        self.socket_opts
    }

    pub(crate) fn notify_sender(&self) {
        self.registry.notify_sender();
    }

    pub(crate) fn register_listener(&self, endpoint: &Arc<Endpoint>) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::Error::other("reactor is shut down"));
        }

        let fd = endpoint.fd();
        self.registry.insert(fd, Entry::Listener(Arc::clone(endpoint)));
        if let Err(e) =
            self.selector
                .register(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)
        {
            self.registry.remove_listener(fd);
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn unregister_listener(&self, fd: RawFd) {
        if self.registry.remove_listener(fd).is_some() {
            let _ = self.selector.deregister(&mut SourceFd(&fd));
        }
    }

    pub(crate) fn register_connection(&self, conn: &Arc<Connection>) -> io::Result<()> {
        let fd = conn.fd();
        self.registry.insert(fd, Entry::Conn(Arc::clone(conn)));
        if let Err(e) = self.selector.register(
            &mut SourceFd(&fd),
            Token(fd as usize),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            self.registry.remove_connection(fd);
            if let Some(endpoint) = conn.endpoint_ref().upgrade() {
                endpoint.remove(fd);
            }
            conn.close();
            tracing::warn!(error = %e, fd, "failed to subscribe connection");
            return Err(e);
        }

        CONNECTIONS_ACCEPTED.increment();
        CONNECTIONS_ACTIVE.increment();
        Ok(())
    }

    /// Remove a connection from the multiplexer and both maps, close it,
    /// and run its close callback. The callback runs with no lock held,
    /// after the descriptor has been shut down.
    pub(crate) fn unregister_connection(&self, fd: RawFd) {
        let Some(conn) = self.registry.remove_connection(fd) else {
            return;
        };

        let _ = self.selector.deregister(&mut SourceFd(&fd));

        if let Some(endpoint) = conn.endpoint_ref().upgrade() {
            endpoint.remove(fd);
        }

        conn.close();
        CONNECTIONS_ACTIVE.decrement();
        conn.handler().on_close(&conn);
        tracing::debug!(fd, "connection unregistered");
    }
}

/// The reactor thread: sweep locally-closed connections, wait for
/// readiness, dispatch.
fn run_reactor(shared: Arc<Shared>, mut poll: Poll) {
    let mut events = Events::with_capacity(MAX_EVENTS);

    while shared.is_open() {
        // Connections closed by user code or by the send path since the
        // last pass are still registered; reclaim them first.
        for conn in shared.registry.closed_connections() {
            shared.unregister_connection(conn.fd());
        }

        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(error = %e, "readiness wait failed");
            break;
        }

        for event in events.iter() {
            let fd = event.token().0 as RawFd;
            match shared.registry.lookup(fd) {
                Some(Entry::Listener(endpoint)) => {
                    // Edge-triggered: drain the whole backlog.
                    while let Some(conn) = endpoint.accept() {
                        if shared.register_connection(&conn).is_ok() {
                            conn.handler().on_open(&conn);
                        }
                    }
                }
                Some(Entry::Conn(conn)) => {
                    if event.is_error() || event.is_read_closed() || event.is_write_closed() {
                        shared.unregister_connection(fd);
                        continue;
                    }
                    if event.is_readable() && conn.try_recv() {
                        conn.handler().on_message(&conn);
                    }
                    if event.is_writable() {
                        conn.set_writable();
                        shared.notify_sender();
                    }
                }
                None => {}
            }
        }
    }

    drain(&shared);
    tracing::info!("reactor thread ended");
}

/// Tear down everything still registered so every close callback runs
/// exactly once before the thread exits.
fn drain(shared: &Arc<Shared>) {
    let entries = shared.registry.snapshot();

    for entry in &entries {
        if let Entry::Listener(endpoint) = entry {
            endpoint.close();
        }
    }
    for entry in &entries {
        if let Entry::Conn(conn) = entry {
            shared.unregister_connection(conn.fd());
        }
    }
}

/// The sender thread: refresh the working set from the registry, then
/// drain each member under the fair-share quota.
fn run_sender(shared: Arc<Shared>) {
    let mut working: HashMap<RawFd, Arc<Connection>> = HashMap::new();
    let mut done: Vec<RawFd> = Vec::new();

    while shared.is_open() {
        {
            let mut entries = shared.registry.lock();
            loop {
                for (fd, entry) in entries.iter() {
                    if let Entry::Conn(conn) = entry {
                        if conn.needs_send() && !working.contains_key(fd) {
                            working.insert(*fd, Arc::clone(conn));
                        }
                    }
                }
                if !working.is_empty() {
                    break;
                }

                // Park on the condition variable without giving up the lock
                // between the wake and the rescan.
                entries = shared.registry.wait_send_ready(entries, SEND_WAIT);
                if !shared.is_open() {
                    return;
                }
            }
        }

        for (fd, conn) in &working {
            let mut quota = shared.send_quota;
            while quota > 0 {
                quota -= 1;
                if !matches!(conn.try_send(), SendOutcome::Sent) {
                    done.push(*fd);
                    break;
                }
            }
            // Quota exhausted with sends still succeeding: the connection
            // stays in the working set for the next pass.
        }

        for fd in done.drain(..) {
            working.remove(&fd);
        }
    }

    tracing::info!("sender thread ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = ReactorBuilder::new();
        assert!(builder.cork);
        assert_eq!(builder.send_buffer_size, 8192);
        assert_eq!(builder.send_quota, 10);
    }

    #[test]
    fn test_builder_overrides() {
        let builder = ReactorBuilder::new()
            .cork(false)
            .send_buffer_size(16384)
            .send_quota(4);
        assert!(!builder.cork);
        assert_eq!(builder.send_buffer_size, 16384);
        assert_eq!(builder.send_quota, 4);
    }

    #[test]
    fn test_quota_floor() {
        let builder = ReactorBuilder::new().send_quota(0);
        assert_eq!(builder.send_quota, 1);
    }

    #[test]
    fn test_reactor_starts_and_stops() {
        let reactor = Reactor::new().unwrap();
        assert!(reactor.shared().is_open());
        drop(reactor);
    }
}
