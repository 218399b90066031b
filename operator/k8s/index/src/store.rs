//! An object store with derived field indexes.
//!
//! Field indexes are maintained incrementally: every time an object is applied, each registered
//! extractor is run against it and the object is moved between key sets as needed. Lookups by a
//! derived key are a single hash lookup.

use crate::ResourceId;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use kube::Resource;
use std::{fmt, sync::Arc};
use thiserror::Error;

/// Computes the index keys for an object.
///
/// Extractors must be pure functions of the object: they are run whenever the object is applied.
pub type Extractor<K> = Box<dyn Fn(&K) -> Vec<String> + Send + Sync>;

/// Holds all objects of a single kind along with their field indexes.
pub struct Store<K> {
    kind: String,
    objects: HashMap<ResourceId, Arc<K>>,
    indexes: HashMap<&'static str, FieldIndex<K>>,

    /// Set once the first object is applied. Indexes may not be added afterwards.
    started: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("index {name} is already registered for {kind}")]
    Duplicate { kind: String, name: &'static str },

    #[error("index {name} cannot be registered for {kind} after objects have been cached")]
    AlreadyStarted { kind: String, name: &'static str },

    #[error("no index {name} is registered for {kind}")]
    NotFound { kind: String, name: String },
}

struct FieldIndex<K> {
    extract: Extractor<K>,

    /// Objects by derived key.
    by_key: HashMap<String, HashSet<ResourceId>>,

    /// The keys last derived from each object, so that stale entries can be removed when the
    /// object changes or is deleted.
    keys: HashMap<ResourceId, HashSet<String>>,
}

// === impl Store ===

impl<K> Store<K>
where
    K: Resource<DynamicType = ()>,
{
    pub fn new() -> Self {
        Self {
            kind: K::kind(&()).into_owned(),
            objects: HashMap::default(),
            indexes: HashMap::default(),
            started: false,
        }
    }
}

impl<K> Store<K> {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Checks whether an index named `name` could be registered.
    pub fn check_index(&self, name: &'static str) -> Result<(), IndexError> {
        if self.indexes.contains_key(name) {
            return Err(IndexError::Duplicate {
                kind: self.kind.clone(),
                name,
            });
        }
        if self.started {
            return Err(IndexError::AlreadyStarted {
                kind: self.kind.clone(),
                name,
            });
        }
        Ok(())
    }

    /// Registers a field index.
    ///
    /// Fails if an index with the same name exists or if the store has already received objects.
    pub fn index_field<F>(&mut self, name: &'static str, extract: F) -> Result<(), IndexError>
    where
        F: Fn(&K) -> Vec<String> + Send + Sync + 'static,
    {
        self.check_index(name)?;
        tracing::debug!(kind = %self.kind, index = %name, "Registered field index");
        self.indexes.insert(
            name,
            FieldIndex {
                extract: Box::new(extract),
                by_key: HashMap::default(),
                keys: HashMap::default(),
            },
        );
        Ok(())
    }

    /// Adds or replaces an object, updating all field indexes.
    pub fn apply(&mut self, id: ResourceId, obj: K) {
        self.started = true;
        for index in self.indexes.values_mut() {
            index.update(&id, &obj);
        }
        self.objects.insert(id, Arc::new(obj));
    }

    /// Removes an object and all of its index entries.
    pub fn delete(&mut self, id: &ResourceId) -> Option<Arc<K>> {
        let obj = self.objects.remove(id)?;
        for index in self.indexes.values_mut() {
            index.remove(id);
        }
        Some(obj)
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.objects
            .get(&ResourceId::new(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Lists all objects whose `index` keys include `key`, ordered by namespace and name.
    pub fn list_by(&self, index: &str, key: &str) -> Result<Vec<Arc<K>>, IndexError> {
        self.list_matching(index, key, |_| true)
    }

    /// Lists the objects in `namespace` whose `index` keys include `key`, ordered by name.
    pub fn list_by_in(
        &self,
        namespace: &str,
        index: &str,
        key: &str,
    ) -> Result<Vec<Arc<K>>, IndexError> {
        self.list_matching(index, key, |id| id.namespace == namespace)
    }

    fn list_matching(
        &self,
        index: &str,
        key: &str,
        filter: impl Fn(&ResourceId) -> bool,
    ) -> Result<Vec<Arc<K>>, IndexError> {
        let index = self.indexes.get(index).ok_or_else(|| IndexError::NotFound {
            kind: self.kind.clone(),
            name: index.to_string(),
        })?;

        let mut ids = match index.by_key.get(key) {
            Some(ids) => ids.iter().filter(|id| filter(id)).collect::<Vec<_>>(),
            None => return Ok(vec![]),
        };
        ids.sort();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.objects.get(id).cloned())
            .collect())
    }

    /// Iterates over the registered index names and the number of distinct keys in each.
    pub fn index_sizes(&self) -> impl Iterator<Item = (&'static str, usize)> + '_ {
        self.indexes.iter().map(|(name, idx)| (*name, idx.by_key.len()))
    }

    /// Counts the cached objects in each namespace.
    pub fn namespace_sizes(&self) -> HashMap<&str, usize> {
        let mut sizes = HashMap::<&str, usize>::default();
        for id in self.objects.keys() {
            *sizes.entry(id.namespace.as_str()).or_default() += 1;
        }
        sizes
    }
}

impl<K> fmt::Debug for Store<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("kind", &self.kind)
            .field("objects", &self.objects.len())
            .field("indexes", &self.indexes.keys().collect::<Vec<_>>())
            .field("started", &self.started)
            .finish()
    }
}

// === impl FieldIndex ===

impl<K> FieldIndex<K> {
    fn update(&mut self, id: &ResourceId, obj: &K) {
        let keys = (self.extract)(obj).into_iter().collect::<HashSet<_>>();

        // If the object's keys haven't changed, there's nothing to do.
        if self.keys.get(id) == Some(&keys) {
            return;
        }

        self.remove(id);
        for key in &keys {
            self.by_key
                .entry(key.clone())
                .or_default()
                .insert(id.clone());
        }
        self.keys.insert(id.clone(), keys);
    }

    fn remove(&mut self, id: &ResourceId) {
        let Some(keys) = self.keys.remove(id) else {
            return;
        };
        for key in keys {
            if let Some(ids) = self.by_key.get_mut(&key) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_key.remove(&key);
                }
            }
        }
    }
}
