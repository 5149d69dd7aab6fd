//! Memoization of task results across `produce` calls.
//!
//! A cache wraps the tree of a [`TaskResult`] without awaiting anything, the
//! decision between a stored value and a fresh computation is taken per
//! entry. Entries are keyed by the [`Fingerprint`] of the task invocation and
//! by their name.

#[cfg(feature = "cache-file")]
mod file;
mod memory;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::BoxStream;

#[cfg(feature = "cache-file")]
pub use self::file::FileCache;
pub use self::memory::InMemoryCache;
use crate::core::{Hash32, Unknown};
use crate::data::Data;
use crate::meta::Meta;
use crate::name::Name;
use crate::tree::{DataTree, Source};
use crate::workspace::TaskResult;

/// A cache layer applied to every result a workspace produces.
pub trait WorkspaceCache: Send + Sync {
    /// Return a tree of the same shape whose entries may be backed by the
    /// cache. Must not block.
    fn cache(&self, result: TaskResult<Unknown>) -> TaskResult<Unknown>;
}

/// Identity of a task invocation: the task name and the canonical bytes of
/// its meta. Structurally equal metas give equal fingerprints regardless of
/// key order.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(Hash32);

impl Fingerprint {
    pub fn new(task: &Name, meta: &Meta) -> Self {
        let task = task.to_string();
        let meta = meta.to_bytes();
        Self(Hash32::hash_parts([task.as_bytes(), meta.as_slice()]))
    }

    /// Key of a single entry below a fingerprint.
    pub fn entry(name: &Name) -> Hash32 {
        Hash32::hash(name.to_string())
    }

    pub fn hash(&self) -> Hash32 {
        self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

type Wrap = dyn Fn(&Name, &Data<Unknown>) -> Data<Unknown> + Send + Sync;

/// A view whose entries are replaced by cache-backed data.
///
/// The wrapper is applied at most once per parent entry so that repeated
/// lookups return the same data.
pub(crate) struct CachedSource {
    parent: Arc<dyn Source>,
    wrap: Box<Wrap>,
    memo: Mutex<HashMap<Name, (Data<Unknown>, Data<Unknown>)>>,
}

impl CachedSource {
    pub(crate) fn wrap<F>(tree: &DataTree<Unknown>, wrap: F) -> DataTree<Unknown>
    where
        F: Fn(&Name, &Data<Unknown>) -> Data<Unknown> + Send + Sync + 'static,
    {
        let source = Self {
            parent: tree.source().clone(),
            wrap: Box::new(wrap),
            memo: Mutex::new(HashMap::new()),
        };
        DataTree::from_source(Arc::new(source))
    }

    fn wrapped(&self, name: &Name, data: Data<Unknown>) -> Data<Unknown> {
        let mut memo = self.memo.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some((parent, wrapped)) = memo.get(name)
            && parent.ptr_eq(&data)
        {
            return wrapped.clone();
        }

        let wrapped = (self.wrap)(name, &data);
        memo.insert(name.clone(), (data, wrapped.clone()));
        wrapped
    }
}

impl Source for CachedSource {
    fn meta(&self) -> Meta {
        self.parent.meta()
    }

    fn get(&self, name: &Name) -> Option<Data<Unknown>> {
        self.parent.get(name).map(|data| self.wrapped(name, data))
    }

    fn items(&self) -> Vec<(Name, Data<Unknown>)> {
        self.parent
            .items()
            .into_iter()
            .map(|(name, data)| {
                let wrapped = self.wrapped(&name, data);
                (name, wrapped)
            })
            .collect()
    }

    fn updates(&self) -> BoxStream<'static, Name> {
        self.parent.updates()
    }

    fn is_observable(&self) -> bool {
        self.parent.is_observable()
    }
}
