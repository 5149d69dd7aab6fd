//! Named collections of lazy data.
//!
//! A [`DataTree`] maps [`Name`]s to [`Data`]. Trees are cheap views over a
//! shared source: filtering, rearranging or narrowing a tree to a value type
//! never copies the entries and never awaits them. Trees built from a
//! [`MutableDataTree`] are observable, they report the names of changed
//! entries through [`DataTree::updates`].

mod builder;
mod observable;
mod view;

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};

pub use self::builder::DataTreeBuilder;
pub(crate) use self::builder::StaticSource;
pub use self::observable::MutableDataTree;
pub(crate) use self::observable::MutableSource;
use self::view::{FilterSource, RearrangeSource};
use crate::core::{Payload, Unknown};
use crate::data::{Data, NamedData};
use crate::error::{DataError, TreeError};
use crate::meta::Meta;
use crate::name::{Name, NamePattern};
use crate::placement::Placement;

/// Erased storage behind every tree.
pub(crate) trait Source: Send + Sync + 'static {
    fn meta(&self) -> Meta;

    fn get(&self, name: &Name) -> Option<Data<Unknown>>;

    /// Snapshot of all entries, ordered by name.
    fn items(&self) -> Vec<(Name, Data<Unknown>)>;

    /// Names of entries added, replaced or removed after the call.
    fn updates(&self) -> BoxStream<'static, Name> {
        stream::empty().boxed()
    }

    fn is_observable(&self) -> bool {
        false
    }
}

/// A view over named data of type `T`.
///
/// Entries whose value type doesn't match `T` are invisible in the view,
/// `DataTree<Unknown>` shows everything.
pub struct DataTree<T: ?Sized> {
    source: Arc<dyn Source>,
    _phantom: PhantomData<fn() -> Arc<T>>,
}

impl<T: ?Sized> Clone for DataTree<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T: ?Sized> DataTree<T> {
    pub(crate) fn from_source(source: Arc<dyn Source>) -> Self {
        Self {
            source,
            _phantom: PhantomData,
        }
    }

    pub(crate) fn source(&self) -> &Arc<dyn Source> {
        &self.source
    }

    pub fn meta(&self) -> Meta {
        self.source.meta()
    }

    /// Whether the tree can still change.
    pub fn is_observable(&self) -> bool {
        self.source.is_observable()
    }

    /// Stream of changed entry names. Static trees return a stream which
    /// ends immediately.
    ///
    /// The stream is a hint: a reported name may already be gone or may hold
    /// a value of another type by the time the tree is queried.
    pub fn updates(&self) -> BoxStream<'static, Name> {
        self.source.updates()
    }

    pub fn erase(&self) -> DataTree<Unknown> {
        DataTree::from_source(self.source.clone())
    }
}

impl<T: Payload + ?Sized> DataTree<T> {
    pub fn empty() -> Self {
        Self::from_source(Arc::new(StaticSource::default()))
    }

    pub fn builder() -> DataTreeBuilder<T> {
        DataTreeBuilder::new()
    }

    /// A tree with a single entry at the root name.
    pub fn single(data: Data<T>) -> Self {
        let mut builder = Self::builder();
        builder.put(Name::EMPTY, data);
        builder.build()
    }

    pub fn get(&self, name: impl Into<Name>) -> Option<NamedData<T>> {
        let name = name.into();
        let data = self.source.get(&name)?.try_cast::<T>()?;
        Some(NamedData::new(name, data))
    }

    pub fn contains(&self, name: impl Into<Name>) -> bool {
        self.get(name).is_some()
    }

    /// Snapshot of the visible entries, ordered by name.
    pub fn items(&self) -> Vec<NamedData<T>> {
        self.source
            .items()
            .into_iter()
            .filter_map(|(name, data)| Some(NamedData::new(name, data.try_cast::<T>()?)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = NamedData<T>> + use<T> {
        self.items().into_iter()
    }

    pub fn names(&self) -> Vec<Name> {
        self.iter().map(|item| item.name().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Entries for which `predicate` holds.
    pub fn filter<F>(&self, predicate: F) -> Self
    where
        F: Fn(&Name, &Meta) -> bool + Send + Sync + 'static,
    {
        let source = FilterSource::new(self.source.clone(), move |name, data| {
            predicate(name, data.meta())
        });
        Self::from_source(Arc::new(source))
    }

    /// Entries whose textual name matches a glob pattern.
    pub fn glob(&self, pattern: &str) -> Result<Self, TreeError> {
        let pattern = glob::Pattern::new(pattern)?;
        Ok(self.filter(move |name, _| pattern.matches(&name.to_string())))
    }

    /// Entries whose name matches a [`NamePattern`].
    pub fn select(&self, pattern: NamePattern) -> Self {
        self.filter(move |name, _| pattern.matches(name))
    }

    /// The entries holding values of type `R`.
    pub fn filter_by_type<R: Payload + ?Sized>(&self) -> DataTree<R> {
        let source = FilterSource::new(self.source.clone(), |_, data| {
            R::accepts(&data.type_tag())
        });
        DataTree::from_source(Arc::new(source))
    }

    /// The entries under `prefix`, with the prefix removed from their names.
    pub fn branch(&self, prefix: impl Into<Name>) -> Self {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return self.clone();
        }
        let placement = move |name: &Name, _: &Meta, _: &crate::core::TypeTag| {
            name.strip_prefix(&prefix)
        };
        Self::from_source(Arc::new(RearrangeSource::new(
            self.source.clone(),
            Arc::new(placement),
        )))
    }

    /// Rename entries with a placement. Entries placed at `None` are dropped.
    ///
    /// Fails when two current entries land on the same name.
    pub fn rearrange(&self, placement: impl Placement + 'static) -> Result<Self, TreeError> {
        self.rearrange_shared(Arc::new(placement))
    }

    pub(crate) fn rearrange_shared(&self, placement: Arc<dyn Placement>) -> Result<Self, TreeError> {
        let source = RearrangeSource::new(self.source.clone(), placement);
        source.check_conflicts()?;
        Ok(Self::from_source(Arc::new(source)))
    }

    /// Reinterpret the tree as holding `R`, entries of other types drop out.
    pub fn cast<R: Payload + ?Sized>(&self) -> DataTree<R> {
        self.filter_by_type()
    }

    /// Static union of two trees. A name present in both fails with
    /// [`TreeError::NameConflict`] unless `overwrite` is set, then `other`
    /// wins.
    pub fn merge(&self, other: &DataTree<T>, overwrite: bool) -> Result<Self, TreeError> {
        let mut builder = DataTreeBuilder::<T>::new();
        builder.meta(self.meta());
        for item in self.items() {
            builder.put(item.name().clone(), item.into_data());
        }
        for item in other.items() {
            let name = item.name().clone();
            if overwrite {
                builder.put(name, item.into_data());
            } else {
                builder.insert(name, item.into_data())?;
            }
        }
        Ok(builder.build())
    }

    /// Await all visible entries.
    pub async fn values(&self) -> Result<BTreeMap<Name, Arc<T>>, DataError> {
        let items = self.items();
        let values = futures::future::try_join_all(items.iter().map(|item| async move {
            item.value().await.map(|value| (item.name().clone(), value))
        }))
        .await?;

        Ok(values.into_iter().collect())
    }
}

impl<T: ?Sized> fmt::Debug for DataTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.source.items().into_iter().map(|(name, _)| name).collect();
        f.debug_struct("DataTree")
            .field("meta", &self.source.meta())
            .field("names", &names)
            .field("observable", &self.source.is_observable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::PlacementRule;

    fn sample() -> DataTree<Unknown> {
        let mut builder = DataTree::<Unknown>::builder();
        builder
            .put("a.x", Data::constant(1i64).erase())
            .put("a.y", Data::constant(2i64).erase())
            .put("b.x", Data::constant(String::from("three")).erase());
        builder.build()
    }

    #[tokio::test]
    async fn test_typed_view_hides_other_types() {
        let tree = sample();
        let ints = tree.filter_by_type::<i64>();

        assert_eq!(tree.len(), 3);
        assert_eq!(ints.names(), vec![Name::from("a.x"), Name::from("a.y")]);
        assert!(ints.get("b.x").is_none());

        let values = ints.values().await.unwrap();
        assert_eq!(*values[&Name::from("a.y")], 2);
    }

    #[tokio::test]
    async fn test_merge_conflicts_unless_overwritten() {
        let mut other = DataTree::<Unknown>::builder();
        other
            .put("a.x", Data::constant(10i64).erase())
            .put("c", Data::constant(4i64).erase());
        let other = other.build();

        assert!(matches!(
            sample().merge(&other, false),
            Err(TreeError::NameConflict(name)) if name == Name::from("a.x")
        ));

        let merged = sample().merge(&other, true).unwrap().cast::<i64>();
        assert_eq!(merged.len(), 3);
        assert_eq!(*merged.get("a.x").unwrap().value().await.unwrap(), 10);
    }

    #[test]
    fn test_branch_strips_prefix() {
        let tree = sample().branch("a");
        assert_eq!(tree.names(), vec![Name::from("x"), Name::from("y")]);
        assert!(tree.get("x").is_some());
        assert!(tree.get("a.x").is_none());
    }

    #[test]
    fn test_filter_and_glob() {
        let tree = sample();
        assert_eq!(tree.filter(|name, _| name.len() == 2).len(), 3);
        assert_eq!(tree.glob("*.x").unwrap().names().len(), 2);
        assert_eq!(tree.select(NamePattern::parse("**.y").unwrap()).len(), 1);
    }

    #[test]
    fn test_rearrange_conflict_is_eager() {
        let tree = sample();
        let collapse = |name: &Name, _: &Meta, _: &crate::core::TypeTag| name.last().cloned().map(Name::from);
        assert!(matches!(
            tree.rearrange(collapse),
            Err(TreeError::NameConflict(_))
        ));

        let moved = tree.rearrange(PlacementRule::all().from("a").to("z")).unwrap();
        assert_eq!(moved.names(), vec![Name::from("z.x"), Name::from("z.y")]);
    }

    #[test]
    fn test_views_share_data() {
        let tree = sample();
        let original = tree.get("a.x").unwrap();
        let viewed = tree.branch("a").get("x").unwrap();
        assert!(original.ptr_eq(viewed.data()));
    }

    #[tokio::test]
    async fn test_static_tree_updates_end() {
        let updates: Vec<_> = sample().updates().collect().await;
        assert!(updates.is_empty());
        assert!(!sample().is_observable());
    }
}
