//! Concurrency-safe mapping from session id to live session.
//!
//! Every operation takes one mutex for the duration of a map update, and the
//! lock is never held across an `.await`. After [`SessionRegistry::drain_all`]
//! the registry is closed: later inserts are handed back to the caller so a
//! session created during teardown is never silently lost.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use swazipen_core::SessionId;

/// Anything the registry can hold.
pub trait RegistryEntry: Send + Sync {
    /// Distinguishes successive occupants of the same id.
    fn generation(&self) -> u64;
}

/// Insert rejected because the registry was drained. Carries the entry back.
pub struct RegistryClosed<T>(pub Arc<T>);

impl<T> fmt::Debug for RegistryClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RegistryClosed")
    }
}

impl<T> fmt::Display for RegistryClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Session registry is closed")
    }
}

impl<T> std::error::Error for RegistryClosed<T> {}

struct Inner<T> {
    sessions: HashMap<SessionId, Arc<T>>,
    closed: bool,
}

/// Session registry owned by one connection.
pub struct SessionRegistry<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                closed: false,
            }),
        }
    }
}

impl<T: RegistryEntry> SessionRegistry<T> {
    /// Create an empty, open registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `entry` under `id`, returning the previous occupant.
    ///
    /// # Errors
    /// Returns the entry back if the registry has been drained.
    pub fn put(&self, id: SessionId, entry: Arc<T>) -> Result<Option<Arc<T>>, RegistryClosed<T>> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(RegistryClosed(entry));
        }
        Ok(inner.sessions.insert(id, entry))
    }

    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<Arc<T>> {
        self.lock().sessions.get(id).cloned()
    }

    /// Claim the session under `id`, whatever its generation.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<T>> {
        self.lock().sessions.remove(id)
    }

    /// Claim the session under `id` only if it is still `generation`.
    pub fn remove_if(&self, id: &SessionId, generation: u64) -> Option<Arc<T>> {
        let mut inner = self.lock();
        match inner.sessions.get(id) {
            Some(entry) if entry.generation() == generation => inner.sessions.remove(id),
            _ => None,
        }
    }

    /// Empty and close the registry in one step.
    pub fn drain_all(&self) -> Vec<Arc<T>> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.sessions.drain().map(|(_, entry)| entry).collect()
    }

    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.lock().sessions.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Registered ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.lock().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use super::*;

    #[derive(Debug)]
    struct Entry(u64);

    impl RegistryEntry for Entry {
        fn generation(&self) -> u64 {
            self.0
        }
    }

    fn id(s: &str) -> SessionId {
        SessionId::from(s)
    }

    #[test]
    fn test_put_get_remove() {
        let registry = SessionRegistry::new();
        assert!(registry.put(id("a"), Arc::new(Entry(1))).unwrap().is_none());
        assert_eq!(registry.get(&id("a")).unwrap().0, 1);
        assert!(registry.contains(&id("a")));
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.remove(&id("a")).unwrap().0, 1);
        assert!(registry.remove(&id("a")).is_none());
        assert!(registry.get(&id("a")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_put_returns_previous_occupant() {
        let registry = SessionRegistry::new();
        registry.put(id("r2"), Arc::new(Entry(1))).unwrap();
        let previous = registry.put(id("r2"), Arc::new(Entry(2))).unwrap();
        assert_eq!(previous.unwrap().0, 1);
        assert_eq!(registry.get(&id("r2")).unwrap().0, 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_if_checks_generation() {
        let registry = SessionRegistry::new();
        registry.put(id("x"), Arc::new(Entry(7))).unwrap();
        assert!(registry.remove_if(&id("x"), 6).is_none());
        assert!(registry.contains(&id("x")));
        assert_eq!(registry.remove_if(&id("x"), 7).unwrap().0, 7);
        assert!(registry.remove_if(&id("missing"), 7).is_none());
    }

    #[test]
    fn test_drain_closes_registry() {
        let registry = SessionRegistry::new();
        registry.put(id("a"), Arc::new(Entry(1))).unwrap();
        registry.put(id("b"), Arc::new(Entry(2))).unwrap();
        assert_eq!(registry.ids(), vec![id("a"), id("b")]);

        let drained = registry.drain_all();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.is_closed());

        let rejected = registry.put(id("c"), Arc::new(Entry(3))).unwrap_err();
        assert_eq!(rejected.0.0, 3);
        assert!(registry.is_empty());
        assert!(registry.drain_all().is_empty());
    }

    #[test]
    fn test_concurrent_puts_during_drain_are_never_lost() {
        const WRITERS: u64 = 8;
        const PER_WRITER: u64 = 200;

        let registry = Arc::new(SessionRegistry::new());
        let barrier = Arc::new(Barrier::new(WRITERS as usize + 1));

        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut rejected = 0;
                    for n in 0..PER_WRITER {
                        let generation = w * PER_WRITER + n;
                        let entry = Arc::new(Entry(generation));
                        if registry.put(id(&format!("s{generation}")), entry).is_err() {
                            rejected += 1;
                        }
                    }
                    rejected
                })
            })
            .collect();

        barrier.wait();
        let drained = registry.drain_all().len() as u64;
        let rejected: u64 = writers.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(drained + rejected, WRITERS * PER_WRITER);
        assert!(registry.is_empty());
    }
}
