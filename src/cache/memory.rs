use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

use super::{CachedSource, Fingerprint, WorkspaceCache};
use crate::core::{Payload, TypeTag, Unknown};
use crate::data::Data;
use crate::error::DataError;
use crate::meta::Meta;
use crate::name::Name;
use crate::workspace::TaskResult;

type Store = HashMap<Fingerprint, HashMap<Name, Data<Unknown>>>;

/// Keeps the data of every produced entry for the lifetime of the cache.
///
/// The first data seen for a fingerprint and name is stored as is, later
/// results for the same invocation hand out that same data, so each value is
/// computed at most once. Clones share the store.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    store: Arc<Mutex<Store>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored data for an entry of a task invocation.
    pub fn get<T: Payload + ?Sized>(
        &self,
        task: &Name,
        meta: &Meta,
        name: &Name,
    ) -> Result<Option<Data<T>>, DataError> {
        let store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(data) = store
            .get(&Fingerprint::new(task, meta))
            .and_then(|entries| entries.get(name))
        else {
            return Ok(None);
        };

        data.try_cast::<T>()
            .map(Some)
            .ok_or_else(|| DataError::CacheTypeMismatch {
                name: name.clone(),
                stored: data.type_tag(),
                requested: T::tag().unwrap_or_else(TypeTag::of::<Unknown>),
            })
    }

    /// Number of stored entries over all fingerprints.
    pub fn len(&self) -> usize {
        let store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        store.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl WorkspaceCache for InMemoryCache {
    fn cache(&self, result: TaskResult<Unknown>) -> TaskResult<Unknown> {
        let fingerprint = result.fingerprint();
        let store = self.store.clone();

        let tree = CachedSource::wrap(result.tree(), move |name, data| {
            let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
            let entries = store.entry(fingerprint).or_default();

            match entries.get(name) {
                Some(stored) if stored.type_tag() == data.type_tag() => {
                    trace!(%fingerprint, %name, "memory cache hit");
                    stored.clone()
                }
                Some(stored) => Data::failed(
                    data.type_tag(),
                    data.meta().clone(),
                    DataError::CacheTypeMismatch {
                        name: name.clone(),
                        stored: stored.type_tag(),
                        requested: data.type_tag(),
                    },
                ),
                None => {
                    entries.insert(name.clone(), data.clone());
                    data.clone()
                }
            }
        });

        result.with_tree(tree)
    }
}

impl std::fmt::Debug for InMemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCache")
            .field("entries", &self.len())
            .finish()
    }
}
