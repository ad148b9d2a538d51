use std::{
    collections::HashMap,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use super::connection::{Connection, ConnectionHandle};

/// Handles below this value are reserved for the listener and waker tokens.
pub(crate) const FIRST_CONNECTION_HANDLE: usize = 2;

/// The set of open connections, keyed by handle.
///
/// A single mutex guards the map; the condvar wakes an acceptor waiting for a
/// free slot whenever a connection is removed.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionHandle, Arc<Connection>>>,
    slot_freed: Condvar,
    next_handle: AtomicUsize,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            slot_freed: Condvar::new(),
            next_handle: AtomicUsize::new(FIRST_CONNECTION_HANDLE),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionHandle, Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_handle(&self) -> ConnectionHandle {
        ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    pub fn add(&self, connection: Arc<Connection>) {
        self.lock().insert(connection.handle(), connection);
    }

    pub fn find(&self, handle: ConnectionHandle) -> Option<Arc<Connection>> {
        self.lock().get(&handle).cloned()
    }

    /// Removes the connection. Returns `Some` only for the first removal.
    pub fn remove(&self, handle: ConnectionHandle) -> Option<Arc<Connection>> {
        let removed = self.lock().remove(&handle);
        if removed.is_some() {
            self.slot_freed.notify_all();
        }
        removed
    }

    /// Applies `f` to every open connection.
    ///
    /// Runs on a snapshot taken under the lock, so `f` may close or remove
    /// connections.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for connection in self.snapshot() {
            f(&connection);
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn has_capacity(&self, max: Option<usize>) -> bool {
        match max {
            Some(max) => self.len() < max,
            None => true,
        }
    }

    /// Blocks until fewer than `max` connections are open or `cancelled`
    /// returns true. Returns whether a slot is available.
    pub fn wait_for_capacity<F>(&self, max: Option<usize>, cancelled: F) -> bool
    where
        F: Fn() -> bool,
    {
        let Some(max) = max else {
            return !cancelled();
        };

        let mut connections = self.lock();
        while connections.len() >= max && !cancelled() {
            connections = self
                .slot_freed
                .wait(connections)
                .unwrap_or_else(PoisonError::into_inner);
        }
        connections.len() < max && !cancelled()
    }

    /// Wakes every thread blocked in [`wait_for_capacity`](Self::wait_for_capacity)
    /// so it can re-check its cancellation condition.
    pub(crate) fn wake_waiters(&self) {
        let _connections = self.lock();
        self.slot_freed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicBool,
        thread,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{event::EventBus, net::tcp::connection::test_support::blocking_connection};

    #[test]
    fn test_add_find_remove() {
        let registry = ConnectionRegistry::new();
        let events = Arc::new(EventBus::new());
        let (a, _ca) = blocking_connection(registry.next_handle().0, events.clone());
        let (b, _cb) = blocking_connection(registry.next_handle().0, events);

        registry.add(a.clone());
        registry.add(b.clone());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find(a.handle()).unwrap().handle(), a.handle());

        assert!(registry.remove(a.handle()).is_some());
        assert!(registry.remove(a.handle()).is_none());
        assert!(registry.find(a.handle()).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_handles_are_never_reused() {
        let registry = ConnectionRegistry::new();
        let first = registry.next_handle();
        let second = registry.next_handle();
        assert_eq!(first.0, FIRST_CONNECTION_HANDLE);
        assert!(second > first);
    }

    #[test]
    fn test_for_each_may_remove() {
        let registry = ConnectionRegistry::new();
        let events = Arc::new(EventBus::new());
        let mut clients = Vec::new();
        for _ in 0..3 {
            let (connection, client) = blocking_connection(registry.next_handle().0, events.clone());
            registry.add(connection);
            clients.push(client);
        }

        let mut visited = 0;
        registry.for_each(|connection| {
            visited += 1;
            registry.remove(connection.handle());
        });

        assert_eq!(visited, 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_capacity() {
        let registry = ConnectionRegistry::new();
        let (connection, _client) = blocking_connection(2, Arc::new(EventBus::new()));
        registry.add(connection);

        assert!(registry.has_capacity(None));
        assert!(registry.has_capacity(Some(2)));
        assert!(!registry.has_capacity(Some(1)));
    }

    #[test]
    fn test_wait_for_capacity_wakes_on_remove() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (connection, _client) = blocking_connection(2, Arc::new(EventBus::new()));
        let handle = connection.handle();
        registry.add(connection);

        let remover = Arc::clone(&registry);
        let started = Instant::now();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remover.remove(handle);
        });

        assert!(registry.wait_for_capacity(Some(1), || false));
        assert!(started.elapsed() >= Duration::from_millis(50));
        t.join().unwrap();
    }

    #[test]
    fn test_wait_for_capacity_cancelled() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (connection, _client) = blocking_connection(2, Arc::new(EventBus::new()));
        registry.add(connection);

        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let waker = Arc::clone(&registry);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::SeqCst);
            waker.wake_waiters();
        });

        assert!(!registry.wait_for_capacity(Some(1), || cancelled.load(Ordering::SeqCst)));
        assert_eq!(registry.len(), 1);
        t.join().unwrap();
    }
}
