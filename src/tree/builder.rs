use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};

use super::{DataTree, Source};
use crate::core::{Payload, Unknown};
use crate::data::Data;
use crate::error::TreeError;
use crate::meta::Meta;
use crate::name::Name;

/// Entries fixed at build time, plus observable trees grafted under a prefix.
#[derive(Default)]
pub(crate) struct StaticSource {
    meta: Meta,
    entries: BTreeMap<Name, Data<Unknown>>,
    branches: Vec<(Name, Arc<dyn Source>)>,
}

impl StaticSource {
    fn lookup(&self, name: &Name) -> Option<Data<Unknown>> {
        if let Some(data) = self.entries.get(name) {
            return Some(data.clone());
        }

        self.branches.iter().find_map(|(prefix, branch)| {
            let rest = name.strip_prefix(prefix)?;
            branch.get(&rest)
        })
    }
}

impl Source for StaticSource {
    fn meta(&self) -> Meta {
        self.meta.clone()
    }

    fn get(&self, name: &Name) -> Option<Data<Unknown>> {
        self.lookup(name)
    }

    fn items(&self) -> Vec<(Name, Data<Unknown>)> {
        let mut items = self.entries.clone();

        for (prefix, branch) in &self.branches {
            for (name, data) in branch.items() {
                items.entry(prefix.join(&name)).or_insert(data);
            }
        }

        items.into_iter().collect()
    }

    fn updates(&self) -> BoxStream<'static, Name> {
        let streams: Vec<_> = self
            .branches
            .iter()
            .filter(|(_, branch)| branch.is_observable())
            .map(|(prefix, branch)| {
                let prefix = prefix.clone();
                branch.updates().map(move |name| prefix.join(&name)).boxed()
            })
            .collect();

        if streams.is_empty() {
            stream::empty().boxed()
        } else {
            stream::select_all(streams).boxed()
        }
    }

    fn is_observable(&self) -> bool {
        self.branches.iter().any(|(_, branch)| branch.is_observable())
    }
}

/// Collects entries and sub-trees into a new [`DataTree`].
///
/// ```
/// use kumiki::DataTree;
///
/// let mut builder = DataTree::<i64>::builder();
/// builder.value("a", 1).value("b.c", 2);
/// let tree = builder.build();
/// assert_eq!(tree.len(), 2);
/// ```
pub struct DataTreeBuilder<T: ?Sized> {
    source: StaticSource,
    _phantom: PhantomData<fn() -> Arc<T>>,
}

impl<T: Payload + ?Sized> Default for DataTreeBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Payload + ?Sized> DataTreeBuilder<T> {
    pub fn new() -> Self {
        Self {
            source: StaticSource::default(),
            _phantom: PhantomData,
        }
    }

    pub fn meta(&mut self, meta: Meta) -> &mut Self {
        self.source.meta = meta;
        self
    }

    /// Put or replace an entry, `None` removes it.
    pub fn put(&mut self, name: impl Into<Name>, data: impl Into<Option<Data<T>>>) -> &mut Self {
        let name = name.into();
        match data.into() {
            Some(data) => {
                self.source.entries.insert(name, data.erase());
            }
            None => {
                self.source.entries.remove(&name);
            }
        }
        self
    }

    pub fn remove(&mut self, name: impl Into<Name>) -> &mut Self {
        self.source.entries.remove(&name.into());
        self
    }

    /// Add an entry, failing if the name is already taken.
    pub fn insert(&mut self, name: impl Into<Name>, data: Data<T>) -> Result<&mut Self, TreeError> {
        let name = name.into();
        if self.contains(&name) {
            return Err(TreeError::NameConflict(name));
        }
        Ok(self.put(name, data))
    }

    /// Graft `tree` under `prefix`.
    ///
    /// A static tree is copied entry by entry, an observable one stays live
    /// and its updates are forwarded. Fails if any grafted name is taken.
    pub fn node(&mut self, prefix: impl Into<Name>, tree: &DataTree<T>) -> Result<&mut Self, TreeError> {
        let prefix = prefix.into();
        let items = tree.items();

        for item in &items {
            let name = prefix.join(item.name());
            if self.contains(&name) {
                return Err(TreeError::NameConflict(name));
            }
        }

        if tree.is_observable() {
            self.source.branches.push((prefix, tree.source().clone()));
        } else {
            for item in items {
                let name = prefix.join(item.name());
                self.source.entries.insert(name, item.into_data().erase());
            }
        }

        Ok(self)
    }

    /// Graft `tree` at the root.
    pub fn merge(&mut self, tree: &DataTree<T>) -> Result<&mut Self, TreeError> {
        self.node(Name::EMPTY, tree)
    }

    pub fn contains(&self, name: &Name) -> bool {
        self.source.lookup(name).is_some()
    }

    pub fn build(self) -> DataTree<T> {
        DataTree::from_source(Arc::new(self.source))
    }
}

impl<T: Send + Sync + 'static> DataTreeBuilder<T> {
    /// Put an already computed value.
    pub fn value(&mut self, name: impl Into<Name>, value: T) -> &mut Self {
        self.put(name, Data::constant(value))
    }
}
