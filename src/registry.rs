//! Descriptor registry shared by the reactor and sender threads.
//!
//! A descriptor appears in the map if and only if it is subscribed to the
//! readiness multiplexer. The condition variable parks the sender thread
//! while no connection has pending output.

use crate::connection::Connection;
use crate::endpoint::Endpoint;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// What a registered descriptor refers to.
#[derive(Clone)]
pub(crate) enum Entry {
    Listener(Arc<Endpoint>),
    Conn(Arc<Connection>),
}

pub(crate) struct Registry {
    entries: Mutex<HashMap<RawFd, Entry>>,
    send_ready: Condvar,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            send_ready: Condvar::new(),
        }
    }

    pub(crate) fn insert(&self, fd: RawFd, entry: Entry) {
        self.entries.lock().unwrap().insert(fd, entry);
    }

    pub(crate) fn lookup(&self, fd: RawFd) -> Option<Entry> {
        self.entries.lock().unwrap().get(&fd).cloned()
    }

    /// Remove `fd` if it refers to a listener.
    pub(crate) fn remove_listener(&self, fd: RawFd) -> Option<Arc<Endpoint>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&fd) {
            Some(Entry::Listener(endpoint)) => {
                let endpoint = Arc::clone(endpoint);
                entries.remove(&fd);
                Some(endpoint)
            }
            _ => None,
        }
    }

    /// Remove `fd` if it refers to a connection.
    pub(crate) fn remove_connection(&self, fd: RawFd) -> Option<Arc<Connection>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&fd) {
            Some(Entry::Conn(conn)) => {
                let conn = Arc::clone(conn);
                entries.remove(&fd);
                Some(conn)
            }
            _ => None,
        }
    }

    /// Connections whose connected flag has been cleared but which are still
    /// registered. These were closed locally between reactor passes.
    pub(crate) fn closed_connections(&self) -> Vec<Arc<Connection>> {
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Conn(conn) if !conn.is_connected() => Some(Arc::clone(conn)),
                _ => None,
            })
            .collect()
    }

    /// Snapshot of every registered entry.
    pub(crate) fn snapshot(&self) -> Vec<Entry> {
        self.entries.lock().unwrap().values().cloned().collect()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<RawFd, Entry>> {
        self.entries.lock().unwrap()
    }

    /// Park the sender on the registry lock until woken or the timeout
    /// elapses, whichever comes first.
    pub(crate) fn wait_send_ready<'a>(
        &self,
        guard: MutexGuard<'a, HashMap<RawFd, Entry>>,
        timeout: Duration,
    ) -> MutexGuard<'a, HashMap<RawFd, Entry>> {
        self.send_ready.wait_timeout(guard, timeout).unwrap().0
    }

    /// Wake the sender thread.
    pub(crate) fn notify_sender(&self) {
        let _guard = self.entries.lock().unwrap();
        self.send_ready.notify_one();
    }
}
