//! Transport-side registry of open sessions

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::connection::ConnHandle;

/// Where a session records itself once fully open
pub trait SessionRegistry<S>: Send + Sync {
    fn add_session(&self, handle: ConnHandle, session: S);

    fn remove_session(&self, handle: ConnHandle);
}

/// Open sessions keyed by connection handle
#[derive(Debug)]
pub struct SessionTable<S> {
    sessions: Mutex<HashMap<ConnHandle, S>>,
}

impl<S> Default for SessionTable<S> {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl<S: Clone> SessionTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<ConnHandle, S>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, handle: ConnHandle) -> Option<S> {
        self.sessions().get(&handle).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }
}

impl<S: Clone + Send> SessionRegistry<S> for SessionTable<S> {
    fn add_session(&self, handle: ConnHandle, session: S) {
        debug!("Registering session for connection {}", handle);
        self.sessions().insert(handle, session);
    }

    fn remove_session(&self, handle: ConnHandle) {
        if self.sessions().remove(&handle).is_some() {
            debug!("Removed session for connection {}", handle);
        }
    }
}
