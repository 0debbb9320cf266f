//! In-memory storage engines.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use crate::error::{Result, StoreError};
use crate::store::{StorageEngine, Store};
use crate::versioning::{Occurred, Versioned, VectorClock};

/// Mutexed map engine with full sibling semantics. The whole map is one
/// critical section, which makes put/get linearizable per key.
pub struct InMemoryStorageEngine<K, V> {
    name: String,
    map: Mutex<BTreeMap<K, Vec<Versioned<V>>>>,
}

impl<K, V> InMemoryStorageEngine<K, V>
where
    K: Ord + Clone + Send,
    V: Clone + Send,
{
    pub fn new(name: impl Into<String>) -> Self {
        InMemoryStorageEngine {
            name: name.into(),
            map: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn remove_key(&self, key: &K) {
        self.lock().remove(key);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<K, Vec<Versioned<V>>>> {
        self.map.lock().expect("store mutex poisoned")
    }
}

/// Shared put logic: reject obsolete versions, replace dominated ones,
/// keep concurrent siblings.
fn put_versioned<V>(versions: &mut Vec<Versioned<V>>, value: Versioned<V>) -> Result<()> {
    for existing in versions.iter() {
        match existing.version.compare(&value.version) {
            Occurred::After | Occurred::Equal => {
                return Err(StoreError::ObsoleteVersion(format!(
                    "stored {:?} is not older than incoming {:?}",
                    existing.version, value.version
                )));
            }
            Occurred::Before | Occurred::Concurrently => {}
        }
    }
    versions.retain(|existing| existing.version.compare(&value.version) == Occurred::Concurrently);
    versions.push(value);
    Ok(())
}

fn delete_versioned<V>(versions: &mut Vec<Versioned<V>>, version: &VectorClock) -> bool {
    let before = versions.len();
    versions.retain(|existing| {
        !matches!(
            existing.version.compare(version),
            Occurred::Before | Occurred::Equal
        )
    });
    versions.len() != before
}

impl<K, V> Store<K, V> for InMemoryStorageEngine<K, V>
where
    K: Ord + Clone + Send,
    V: Clone + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &K) -> Result<Vec<Versioned<V>>> {
        Ok(self.lock().get(key).cloned().unwrap_or_default())
    }

    fn put(&self, key: K, value: Versioned<V>) -> Result<()> {
        let mut map = self.lock();
        put_versioned(map.entry(key).or_default(), value)
    }

    fn delete(&self, key: &K, version: &VectorClock) -> Result<bool> {
        let mut map = self.lock();
        let Some(versions) = map.get_mut(key) else {
            return Ok(false);
        };
        let removed = delete_versioned(versions, version);
        if versions.is_empty() {
            map.remove(key);
        }
        Ok(removed)
    }
}

impl<K, V> StorageEngine<K, V> for InMemoryStorageEngine<K, V>
where
    K: Ord + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn entries(&self) -> Result<Box<dyn Iterator<Item = (K, Versioned<V>)> + Send>> {
        let snapshot: Vec<(K, Versioned<V>)> = self
            .lock()
            .iter()
            .flat_map(|(key, versions)| {
                versions
                    .iter()
                    .map(move |versioned| (key.clone(), versioned.clone()))
            })
            .collect();
        Ok(Box::new(snapshot.into_iter()))
    }
}

/// A bounded engine that behaves like a cache: `put` always succeeds, but
/// inserting past capacity evicts the oldest keys, so `get` may return
/// empty for a key that was previously put. It never returns a wrong
/// value.
pub struct CacheStorageEngine<K, V> {
    inner: InMemoryStorageEngine<K, V>,
    order: Mutex<VecDeque<K>>,
    capacity: usize,
}

impl<K, V> CacheStorageEngine<K, V>
where
    K: Ord + Clone + Send,
    V: Clone + Send,
{
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        CacheStorageEngine {
            inner: InMemoryStorageEngine::new(name),
            order: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    fn note_insert(&self, key: &K) {
        let mut order = self.order.lock().expect("cache order mutex poisoned");
        if !order.contains(key) {
            order.push_back(key.clone());
        }
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.inner.remove_key(&oldest);
            }
        }
    }
}

impl<K, V> Store<K, V> for CacheStorageEngine<K, V>
where
    K: Ord + Clone + Send,
    V: Clone + Send,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get(&self, key: &K) -> Result<Vec<Versioned<V>>> {
        self.inner.get(key)
    }

    fn put(&self, key: K, value: Versioned<V>) -> Result<()> {
        self.inner.put(key.clone(), value)?;
        self.note_insert(&key);
        Ok(())
    }

    fn delete(&self, key: &K, version: &VectorClock) -> Result<bool> {
        self.inner.delete(key, version)
    }
}

impl<K, V> StorageEngine<K, V> for CacheStorageEngine<K, V>
where
    K: Ord + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn entries(&self) -> Result<Box<dyn Iterator<Item = (K, Versioned<V>)> + Send>> {
        self.inner.entries()
    }
}
