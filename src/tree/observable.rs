use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::channel::mpsc::{UnboundedSender, unbounded};
use futures::stream::{self, BoxStream, StreamExt};

use super::{DataTree, Source};
use crate::core::{Payload, Unknown};
use crate::data::Data;
use crate::meta::Meta;
use crate::name::Name;

/// Entries which can change after the tree was handed out.
pub(crate) struct MutableSource {
    meta: RwLock<Meta>,
    entries: RwLock<BTreeMap<Name, Data<Unknown>>>,
    subscribers: Mutex<Vec<UnboundedSender<Name>>>,
    closed: AtomicBool,
}

impl MutableSource {
    pub(crate) fn new(meta: Meta) -> Arc<Self> {
        Arc::new(Self {
            meta: RwLock::new(meta),
            entries: RwLock::new(BTreeMap::new()),
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn put(&self, name: Name, data: Option<Data<Unknown>>) {
        let changed = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            match data {
                Some(data) => {
                    entries.insert(name.clone(), data);
                    true
                }
                None => entries.remove(&name).is_some(),
            }
        };

        if changed {
            self.notify(name);
        }
    }

    pub(crate) fn set_meta(&self, meta: Meta) {
        *self.meta.write().unwrap_or_else(PoisonError::into_inner) = meta;
    }

    fn notify(&self, name: Name) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|sender| sender.unbounded_send(name.clone()).is_ok());
    }

    /// End all update streams, the entries stay readable.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Source for MutableSource {
    fn meta(&self) -> Meta {
        self.meta.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn get(&self, name: &Name) -> Option<Data<Unknown>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn items(&self) -> Vec<(Name, Data<Unknown>)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, data)| (name.clone(), data.clone()))
            .collect()
    }

    fn updates(&self) -> BoxStream<'static, Name> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::Acquire) {
            return stream::empty().boxed();
        }

        let (sender, receiver) = unbounded();
        subscribers.push(sender);
        receiver.boxed()
    }

    fn is_observable(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

/// A tree whose entries can be replaced while views of it are in use.
///
/// Every [`put`](MutableDataTree::put) reports the changed name to the
/// update streams of the views returned by [`tree`](MutableDataTree::tree).
/// Dropping this handle ends those streams, the views keep the last entries.
pub struct MutableDataTree<T: ?Sized> {
    source: Arc<MutableSource>,
    _phantom: PhantomData<fn() -> Arc<T>>,
}

impl<T: Payload + ?Sized> Default for MutableDataTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Payload + ?Sized> MutableDataTree<T> {
    pub fn new() -> Self {
        Self::with_meta(Meta::empty())
    }

    pub fn with_meta(meta: Meta) -> Self {
        Self {
            source: MutableSource::new(meta),
            _phantom: PhantomData,
        }
    }

    /// Put or replace an entry, `None` removes it.
    pub fn put(&self, name: impl Into<Name>, data: impl Into<Option<Data<T>>>) {
        let data = data.into().map(|data| data.erase());
        self.source.put(name.into(), data);
    }

    pub fn remove(&self, name: impl Into<Name>) {
        self.source.put(name.into(), None);
    }

    /// Copy the current entries of `tree` under `prefix`.
    pub fn node(&self, prefix: impl Into<Name>, tree: &DataTree<T>) {
        let prefix = prefix.into();
        for item in tree.items() {
            let name = prefix.join(item.name());
            self.source.put(name, Some(item.into_data().erase()));
        }
    }

    pub fn set_meta(&self, meta: Meta) {
        self.source.set_meta(meta);
    }

    /// A live view of this tree.
    pub fn tree(&self) -> DataTree<T> {
        DataTree::from_source(self.source.clone())
    }

    /// End all update streams, same as dropping the handle.
    pub fn close(self) {}
}

impl<T: Send + Sync + 'static> MutableDataTree<T> {
    pub fn value(&self, name: impl Into<Name>, value: T) {
        self.put(name, Data::constant(value));
    }
}

impl<T: ?Sized> Drop for MutableDataTree<T> {
    fn drop(&mut self) {
        self.source.close();
    }
}
