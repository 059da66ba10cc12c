use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::error::{Error, ErrorKind, Result};

/// Thread-safe map from a key to a long-lived handle.
///
/// Readers share the lock; mutations take it exclusively. Use
/// [`find_or_insert_with`](HandleRegistry::find_or_insert_with) to get
/// "one handle per key" without racing another thread through the factory.
#[derive(Debug)]
pub struct HandleRegistry<K, V> {
    entries: RwLock<BTreeMap<K, V>>,
}

impl<K: Ord, V> Default for HandleRegistry<K, V> {
    fn default() -> Self {
        HandleRegistry {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<K: Ord, V> HandleRegistry<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.entries.read().contains_key(key)
    }

    /// Clone of the value stored under `key`, or a not-found error.
    pub fn lookup<Q>(&self, key: &Q) -> Result<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
        V: Clone,
    {
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotFound))
    }

    /// Visit every entry in key order under the shared lock.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        for (key, value) in self.entries.read().iter() {
            f(key, value);
        }
    }

    pub fn size(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Insert only if `key` is absent. Returns whether the value was stored.
    pub fn insert(&self, key: K, value: V) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, value);
        true
    }

    /// Insert, replacing and returning any previous value.
    pub fn insert_or_assign(&self, key: K, value: V) -> Option<V> {
        self.entries.write().insert(key, value)
    }

    pub fn erase<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.entries.write().remove(key)
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Return the value under `key`, building and storing it first if absent.
    ///
    /// The check and the insert happen under one exclusive lock, so the
    /// factory runs at most once per key even with concurrent callers. A
    /// failing factory leaves the registry untouched.
    pub fn find_or_insert_with<F, E>(&self, key: K, factory: F) -> std::result::Result<V, E>
    where
        V: Clone,
        F: FnOnce() -> std::result::Result<V, E>,
    {
        if let Some(value) = self.entries.read().get(&key) {
            return Ok(value.clone());
        }

        let mut entries = self.entries.write();
        if let Some(value) = entries.get(&key) {
            return Ok(value.clone());
        }
        let value = factory()?;
        entries.insert(key, value.clone());
        Ok(value)
    }
}

/// Registries whose values are built outside the map lock.
///
/// The slot for a key is claimed under the exclusive lock; the value itself is
/// built afterwards, so a slow or blocking constructor never holds up lookups
/// of other keys.
impl<K: Ord + Clone, V: Clone> HandleRegistry<K, Arc<OnceCell<V>>> {
    /// Value under `key`, building it with `init` if no one has yet.
    ///
    /// Concurrent callers for the same key wait for a single `init`. A failed
    /// `init` releases the slot so the next caller tries again.
    pub fn get_or_try_init<F, E>(&self, key: K, init: F) -> std::result::Result<V, E>
    where
        F: FnOnce() -> std::result::Result<V, E>,
    {
        let slot = self.find_or_insert_with(key.clone(), || Ok::<_, E>(Arc::new(OnceCell::new())))?;

        match slot.get_or_try_init(init) {
            Ok(value) => Ok(value.clone()),
            Err(e) => {
                let mut entries = self.entries.write();
                let unclaimed = entries
                    .get(&key)
                    .map_or(false, |current| Arc::ptr_eq(current, &slot) && current.get().is_none());
                if unclaimed {
                    entries.remove(&key);
                }
                Err(e)
            }
        }
    }

    /// Built value under `key`, skipping slots still under construction.
    pub fn get_ready<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.entries.read().get(key).and_then(|slot| slot.get().cloned())
    }
}

/// Registries that do not keep their handles alive.
///
/// Handles remove themselves when dropped (see [`remove_dead`](HandleRegistry::remove_dead)),
/// so an entry that no longer upgrades is treated as absent.
impl<K: Ord, T> HandleRegistry<K, Weak<T>> {
    /// Live handle under `key`, building a new one if there is none.
    pub fn upgrade_or_insert_with<F, E>(&self, key: K, factory: F) -> std::result::Result<Arc<T>, E>
    where
        F: FnOnce() -> std::result::Result<Arc<T>, E>,
    {
        if let Some(handle) = self.entries.read().get(&key).and_then(Weak::upgrade) {
            return Ok(handle);
        }

        let mut entries = self.entries.write();
        if let Some(handle) = entries.get(&key).and_then(Weak::upgrade) {
            return Ok(handle);
        }
        let handle = factory()?;
        entries.insert(key, Arc::downgrade(&handle));
        Ok(handle)
    }

    /// Live handle under `key`, if any.
    pub fn upgrade<Q>(&self, key: &Q) -> Option<Arc<T>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.entries.read().get(key).and_then(Weak::upgrade)
    }

    /// Drop the entry under `key` unless it still points at a live handle.
    ///
    /// A handle replaced by a newer one under the same key leaves the newer
    /// entry in place.
    pub fn remove_dead<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(handle) if handle.strong_count() == 0 => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }
}
