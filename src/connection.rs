//! A single accepted TCP session with per-direction buffering.
//!
//! The reactor thread drains the socket into the receive buffer and the
//! sender thread drains the send buffer into the socket; user code reads
//! framed messages out of the former and enqueues bytes into the latter,
//! from any thread. The two buffers are serialized independently, and no
//! runtime thread ever blocks while holding either buffer lock.

use crate::buffer::StreamBuffer;
use crate::endpoint::Endpoint;
use crate::handler::ConnectionHandler;
use crate::metrics::{BYTES_RECEIVED, BYTES_SENT, OVERFLOW_CLOSES, STALLED_CLOSES};
use crate::reactor::Shared;
use socket2::Socket;
use std::io;
use std::mem::MaybeUninit;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Per-call I/O unit. Roughly one MTU: bounds the time a buffer lock is
/// held and makes the sender's fair-share quota count frame-sized steps.
const SEGMENT: usize = 1500;

/// A peer that has not drained anything we have pending for this long is
/// written off as stalled.
const STALL_TIMEOUT: Duration = Duration::from_secs(5);

const NONBLOCKING: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;

/// Result of one send attempt.
pub(crate) enum SendOutcome {
    /// A segment was handed to the kernel.
    Sent,
    /// The send buffer was empty.
    Idle,
    /// The kernel buffer is full; write-readiness will re-arm the sender.
    Blocked,
    /// The connection is closed (before or because of this attempt).
    Closed,
}

/// One accepted TCP session.
///
/// Handles are shared: the runtime keeps its own references, and user code
/// may clone and stash the [`Arc`] it receives in handler callbacks. All
/// methods are safe to call from any thread.
pub struct Connection {
    fd: RawFd,
    sock: Socket,
    connected: AtomicBool,
    writable: AtomicBool,
    /// Mirror of the send buffer length, readable without the buffer lock.
    send_pending: AtomicUsize,
    created: Instant,
    /// Milliseconds since `created` at the last successful send.
    last_send_ms: AtomicU64,
    recv_buf: Mutex<StreamBuffer>,
    send_buf: Mutex<StreamBuffer>,
    endpoint: Weak<Endpoint>,
    handler: Arc<dyn ConnectionHandler>,
    shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn new(sock: Socket, endpoint: &Arc<Endpoint>, shared: Arc<Shared>) -> Arc<Self> {
        let fd = sock.as_raw_fd();
        let opts = shared.socket_opts();

        // Socket options are best-effort: some environments reject options
        // on already-connected sockets (EPERM/ENOPROTOOPT) and that must not
        // take the process down.
        if let Err(e) = sock.set_nonblocking(true) {
            tracing::warn!(error = %e, fd, "failed to set nonblocking");
        }
        if let Err(e) = sock.set_send_buffer_size(opts.send_buffer_size) {
            tracing::warn!(error = %e, fd, "failed to set SO_SNDBUF");
        }
        if opts.cork {
            set_cork(&sock, fd);
        }

        Arc::new(Self {
            fd,
            sock,
            connected: AtomicBool::new(true),
            writable: AtomicBool::new(true),
            send_pending: AtomicUsize::new(0),
            created: Instant::now(),
            last_send_ms: AtomicU64::new(0),
            recv_buf: Mutex::new(StreamBuffer::new()),
            send_buf: Mutex::new(StreamBuffer::new()),
            endpoint: Arc::downgrade(endpoint),
            handler: Arc::clone(endpoint.handler()),
            shared,
        })
    }

    /// The connection's file descriptor, stable for its whole lifetime.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The peer's address, if the socket can still report it.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.sock.peer_addr().ok().and_then(|addr| addr.as_socket())
    }

    /// Whether the connection is still open. Lock-free.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Close the connection. Idempotent and safe from any thread.
    ///
    /// Exactly one caller wins the connected-flag transition and shuts the
    /// socket down; the reactor unregisters the connection and runs the
    /// close callback on its next pass.
    pub fn close(&self) {
        if self
            .connected
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.sock.shutdown(Shutdown::Both);
            tracing::debug!(fd = self.fd, "connection closed");
        }
    }

    /// Pop the next `delimiter`-terminated message off the receive buffer.
    ///
    /// Returns `Some(message)` (the delimiter itself is discarded; the
    /// message may be empty) while complete messages remain, so callers loop
    /// until `None`. Returns `None` when no complete message is buffered or
    /// the connection is closed.
    ///
    /// # Panics
    ///
    /// Panics if `delimiter` is empty.
    pub fn read_delimited(&self, delimiter: &[u8]) -> Option<Vec<u8>> {
        assert!(!delimiter.is_empty(), "delimiter must be non-empty");

        if !self.is_connected() {
            return None;
        }

        let mut buf = self.recv_buf.lock().unwrap();
        let at = buf.find(delimiter)?;
        let message = buf.as_slice()[..at].to_vec();
        buf.consume(at + delimiter.len());
        Some(message)
    }

    /// Pop exactly `n` bytes off the receive buffer.
    ///
    /// Returns `None` until at least `n` bytes are buffered; there are no
    /// partial reads. A connection that will never deliver `n` bytes is
    /// escaped by calling [`close`](Self::close) from any thread, after
    /// which this returns `None` unconditionally.
    pub fn read_bytes(&self, n: usize) -> Option<Vec<u8>> {
        if !self.is_connected() {
            return None;
        }

        let mut buf = self.recv_buf.lock().unwrap();
        if buf.len() < n {
            return None;
        }
        let bytes = buf.as_slice()[..n].to_vec();
        buf.consume(n);
        Some(bytes)
    }

    /// Queue bytes for transmission.
    ///
    /// Bytes enqueued from one thread are transmitted in enqueue order.
    /// Silently dropped once the connection is closed. If the send buffer
    /// would exceed its cap the connection is closed instead.
    pub fn enqueue(&self, bytes: impl AsRef<[u8]>) {
        let bytes = bytes.as_ref();
        if bytes.is_empty() || !self.is_connected() {
            return;
        }

        {
            let mut buf = self.send_buf.lock().unwrap();
            if buf.append(bytes).is_err() {
                drop(buf);
                OVERFLOW_CLOSES.increment();
                tracing::debug!(fd = self.fd, "send buffer overflow");
                self.close();
                return;
            }
            self.send_pending.store(buf.len(), Ordering::Release);
        }

        if self.writable.load(Ordering::Acquire) {
            self.shared.notify_sender();
        }
    }

    pub(crate) fn endpoint_ref(&self) -> &Weak<Endpoint> {
        &self.endpoint
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ConnectionHandler> {
        &self.handler
    }

    /// Drain the kernel receive buffer into the receive buffer.
    ///
    /// Returns true if the connection is still open afterwards, in which
    /// case the caller invokes the message callback.
    pub(crate) fn try_recv(&self) -> bool {
        let mut scratch = [MaybeUninit::<u8>::uninit(); SEGMENT];
        let mut dead = false;

        {
            let mut buf = self.recv_buf.lock().unwrap();
            while self.is_connected() {
                match self.sock.recv_with_flags(&mut scratch, NONBLOCKING) {
                    Ok(0) => {
                        dead = true;
                        break;
                    }
                    Ok(n) => {
                        // Safety: the kernel initialized the first n bytes.
                        let chunk = unsafe {
                            std::slice::from_raw_parts(scratch.as_ptr().cast::<u8>(), n)
                        };
                        if buf.append(chunk).is_err() {
                            OVERFLOW_CLOSES.increment();
                            tracing::debug!(fd = self.fd, "receive buffer overflow");
                            dead = true;
                            break;
                        }
                        BYTES_RECEIVED.add(n as u64);
                    }
                    Err(e) if is_transient(&e) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, fd = self.fd, "recv failed");
                        dead = true;
                        break;
                    }
                }
            }
        }

        if dead {
            self.close();
        }
        self.is_connected()
    }

    /// Note that the kernel reported write space available.
    pub(crate) fn set_writable(&self) {
        self.writable.store(true, Ordering::Release);
    }

    /// Whether the sender should visit this connection.
    ///
    /// Also enforces stalled-peer protection: a connection that has pending
    /// bytes, lost writability, and not completed a send for
    /// [`STALL_TIMEOUT`] is closed here.
    pub(crate) fn needs_send(&self) -> bool {
        let connected = self.is_connected();
        let writable = self.writable.load(Ordering::Acquire);
        let pending = self.send_pending.load(Ordering::Acquire) > 0;

        if connected && pending && !writable && self.millis_since_send() >= STALL_TIMEOUT.as_millis() as u64 {
            STALLED_CLOSES.increment();
            tracing::debug!(fd = self.fd, "peer stalled, closing");
            self.close();
            return false;
        }

        connected && writable && pending
    }

    /// Attempt one bounded write from the send buffer.
    pub(crate) fn try_send(&self) -> SendOutcome {
        if !self.is_connected() {
            return SendOutcome::Closed;
        }

        let outcome;
        {
            let mut buf = self.send_buf.lock().unwrap();
            if buf.is_empty() {
                return SendOutcome::Idle;
            }

            let len = buf.len().min(SEGMENT);
            match self.sock.send_with_flags(&buf.as_slice()[..len], NONBLOCKING) {
                Ok(0) => outcome = SendOutcome::Closed,
                Ok(n) => {
                    self.last_send_ms
                        .store(self.created.elapsed().as_millis() as u64, Ordering::Release);
                    buf.consume(n);
                    self.send_pending.store(buf.len(), Ordering::Release);
                    BYTES_SENT.add(n as u64);
                    outcome = SendOutcome::Sent;
                }
                Err(e) if is_transient(&e) => {
                    self.writable.store(false, Ordering::Release);
                    outcome = SendOutcome::Blocked;
                }
                Err(e) => {
                    tracing::debug!(error = %e, fd = self.fd, "send failed");
                    outcome = SendOutcome::Closed;
                }
            }
        }

        if matches!(outcome, SendOutcome::Closed) {
            self.close();
        }
        outcome
    }

    fn millis_since_send(&self) -> u64 {
        let now = self.created.elapsed().as_millis() as u64;
        now.saturating_sub(self.last_send_ms.load(Ordering::Acquire))
    }
}

#[inline]
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(target_os = "linux")]
fn set_cork(sock: &Socket, fd: RawFd) {
    if let Err(e) = sock.set_cork(true) {
        tracing::warn!(error = %e, fd, "failed to set TCP_CORK");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_cork(_sock: &Socket, _fd: RawFd) {}
