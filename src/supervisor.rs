use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    thread::{Builder, JoinHandle},
};

use tracing::{error, trace};

use crate::{
    error::{Result, TransportError},
    net::tcp::connection::ConnectionHandle,
};

/// Owns the acceptor thread and the dedicated reader threads of the
/// thread-per-connection mode.
///
/// Spawn failures are returned to the caller; finished threads are joined by
/// [`reap`](Self::reap) or [`join_all`](Self::join_all) so a panic is observed
/// instead of silently lost.
#[derive(Default)]
pub struct Supervisor {
    acceptor: Mutex<Option<JoinHandle<()>>>,
    readers: Mutex<HashMap<ConnectionHandle, JoinHandle<()>>>,
    panicked: Mutex<Vec<ConnectionHandle>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn readers(&self) -> MutexGuard<'_, HashMap<ConnectionHandle, JoinHandle<()>>> {
        self.readers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn spawn_acceptor<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread = Builder::new()
            .name("ua-transport-acceptor".to_string())
            .spawn(task)
            .map_err(TransportError::Spawn)?;
        *self.acceptor.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread);
        Ok(())
    }

    pub fn spawn_reader<F>(&self, handle: ConnectionHandle, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread = Builder::new()
            .name(format!("ua-transport-reader-{handle}"))
            .spawn(task)
            .map_err(TransportError::Spawn)?;
        self.readers().insert(handle, thread);
        Ok(())
    }

    pub fn readers_len(&self) -> usize {
        self.readers().len()
    }

    /// Joins every reader thread that already finished and returns the
    /// handles of those that panicked. They are reported again by
    /// [`join_all`](Self::join_all).
    pub fn reap(&self) -> Vec<ConnectionHandle> {
        let finished: Vec<(ConnectionHandle, JoinHandle<()>)> = {
            let mut readers = self.readers();
            let done: Vec<ConnectionHandle> = readers
                .iter()
                .filter(|(_, thread)| thread.is_finished())
                .map(|(handle, _)| *handle)
                .collect();
            done.into_iter()
                .filter_map(|handle| readers.remove(&handle).map(|t| (handle, t)))
                .collect()
        };

        let mut panicked = Vec::new();
        for (handle, thread) in finished {
            if thread.join().is_err() {
                error!(%handle, "reader thread panicked");
                panicked.push(handle);
            } else {
                trace!(%handle, "reader thread reaped");
            }
        }
        self.panicked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(&panicked);
        panicked
    }

    /// Joins the acceptor and every reader thread. Returns the reader handles
    /// that panicked and whether the acceptor panicked.
    pub fn join_all(&self) -> (Vec<ConnectionHandle>, bool) {
        let acceptor = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let acceptor_panicked = match acceptor {
            Some(thread) => thread.join().is_err(),
            None => false,
        };
        if acceptor_panicked {
            error!("acceptor thread panicked");
        }

        let readers: Vec<(ConnectionHandle, JoinHandle<()>)> = self.readers().drain().collect();
        let mut panicked = std::mem::take(
            &mut *self.panicked.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for (handle, thread) in readers {
            if thread.join().is_err() {
                error!(%handle, "reader thread panicked");
                panicked.push(handle);
            }
        }
        (panicked, acceptor_panicked)
    }
}
