use std::{
    collections::HashMap,
    fmt::Display,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{0} is already connected")]
    Conflict(String),
    #[error("another connection is already active")]
    Occupied,
}

/// A live connection that can be tracked by a [`ConnectionRegistry`]
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Display + Send + Sync;

    fn key(&self) -> Self::Key;

    /// Release every resource held by the connection. Must be idempotent.
    async fn dispose(&self);
}

/// Table of live connections
pub struct ConnectionRegistry<C: Connection> {
    slots: Option<usize>,
    connections: Mutex<HashMap<C::Key, Arc<C>>>,
}

impl<C: Connection> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connection> ConnectionRegistry<C> {
    /// Registry accepting any number of connections, one per key
    pub fn new() -> Self {
        Self {
            slots: None,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Registry accepting a single connection at a time
    pub fn single() -> Self {
        Self {
            slots: Some(1),
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<C::Key, Arc<C>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self, key: &C::Key) -> bool {
        self.connections().contains_key(key)
    }

    pub fn get(&self, key: &C::Key) -> Option<Arc<C>> {
        self.connections().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<C::Key> {
        self.connections().keys().cloned().collect()
    }

    pub fn track(&self, connection: Arc<C>) -> Result<(), RegistryError> {
        let key = connection.key();
        let mut connections = self.connections();

        if connections.contains_key(&key) {
            return Err(RegistryError::Conflict(key.to_string()));
        }

        if let Some(slots) = self.slots {
            if connections.len() >= slots {
                return Err(RegistryError::Occupied);
            }
        }

        debug!(connection = %key, "tracking connection");
        connections.insert(key, connection);
        Ok(())
    }

    /// Forget the connection for `key` and dispose it, if it was tracked
    pub async fn untrack_and_dispose(&self, key: &C::Key) {
        let connection = self.connections().remove(key);

        if let Some(connection) = connection {
            debug!(connection = %key, "disposing connection");
            connection.dispose().await;
        }
    }

    pub async fn dispose_all(&self) {
        let connections: Vec<_> = self.connections().drain().collect();

        for (key, connection) in connections {
            debug!(connection = %key, "disposing connection");
            connection.dispose().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Fake {
        key: u32,
        disposed: AtomicUsize,
    }

    impl Fake {
        fn new(key: u32) -> Arc<Self> {
            Arc::new(Self {
                key,
                disposed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Connection for Fake {
        type Key = u32;

        fn key(&self) -> u32 {
            self.key
        }

        async fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn double_track_conflicts() {
        let registry = ConnectionRegistry::new();

        registry.track(Fake::new(1)).unwrap();
        assert_eq!(
            registry.track(Fake::new(1)),
            Err(RegistryError::Conflict("1".to_owned()))
        );
        registry.track(Fake::new(2)).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.is_connected(&1));
    }

    #[test]
    fn single_slot() {
        let registry = ConnectionRegistry::single();

        registry.track(Fake::new(1)).unwrap();
        assert_eq!(registry.track(Fake::new(2)), Err(RegistryError::Occupied));
        assert_eq!(
            registry.track(Fake::new(1)),
            Err(RegistryError::Conflict("1".to_owned()))
        );
    }

    #[tokio::test]
    async fn untrack_is_idempotent() {
        let registry = ConnectionRegistry::single();
        let connection = Fake::new(1);

        registry.track(connection.clone()).unwrap();
        registry.untrack_and_dispose(&1).await;
        registry.untrack_and_dispose(&1).await;

        assert!(registry.is_empty());
        assert_eq!(connection.disposed.load(Ordering::SeqCst), 1);

        // The slot is free again
        registry.track(Fake::new(2)).unwrap();
    }

    #[tokio::test]
    async fn dispose_all_connections() {
        let registry = ConnectionRegistry::new();
        let connections: Vec<_> = (0..3).map(Fake::new).collect();

        for connection in &connections {
            registry.track(connection.clone()).unwrap();
        }

        registry.dispose_all().await;

        assert!(registry.is_empty());
        assert!(connections
            .iter()
            .all(|c| c.disposed.load(Ordering::SeqCst) == 1));
    }
}
