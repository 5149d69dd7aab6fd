//! Transformations from one [`DataTree`] into another.
//!
//! Actions never await their input: they describe the output entries and
//! attach lazy computations to them. When the input tree is observable the
//! output is observable too, and each change of the input recomputes only
//! the output entries derived from the changed name.

mod map;
mod reduce;
mod split;

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Weak;

use futures::stream::{BoxStream, StreamExt};

pub use self::map::MapAction;
pub use self::reduce::{GroupRule, ReduceAction};
pub use self::split::SplitAction;
use crate::core::Payload;
use crate::data::Data;
use crate::error::DataError;
use crate::meta::Meta;
use crate::name::Name;
use crate::tree::{DataTree, MutableSource};

/// A transformation of a tree of `T` into a tree of `R`.
pub trait Action<T: ?Sized, R: ?Sized>: Send + Sync {
    fn execute(&self, source: &DataTree<T>, meta: &Meta) -> DataTree<R>;
}

/// Run `first`, then feed its output to `second`.
pub struct Chain<A, B, M: ?Sized> {
    first: A,
    second: B,
    _phantom: PhantomData<fn() -> Box<M>>,
}

impl<T, M, R, A, B> Action<T, R> for Chain<A, B, M>
where
    T: ?Sized,
    M: ?Sized,
    R: ?Sized,
    A: Action<T, M>,
    B: Action<M, R>,
{
    fn execute(&self, source: &DataTree<T>, meta: &Meta) -> DataTree<R> {
        let middle = self.first.execute(source, meta);
        self.second.execute(&middle, meta)
    }
}

pub trait ActionExt<T: ?Sized, R: ?Sized>: Action<T, R> + Sized {
    /// Compose with a following action.
    fn then<S: ?Sized, B: Action<R, S>>(self, next: B) -> Chain<Self, B, R> {
        Chain {
            first: self,
            second: next,
            _phantom: PhantomData,
        }
    }
}

impl<T: ?Sized, R: ?Sized, A: Action<T, R>> ActionExt<T, R> for A {}

/// Per entry context handed to action bodies.
#[derive(Debug)]
pub struct ActionEnv<'a> {
    /// Name of the produced entry.
    pub name: &'a Name,
    /// Meta of the produced entry.
    pub meta: &'a Meta,
    /// Meta the action was executed with.
    pub action_meta: &'a Meta,
}

/// Meta of an action output tree: the source meta overlaid with the action
/// meta.
pub(crate) fn output_meta<T: Payload + ?Sized>(source: &DataTree<T>, meta: &Meta) -> Meta {
    source.meta().merge(meta)
}

/// Output entries of an action together with the inputs they came from.
///
/// An output name claimed by more than one input resolves to a data failing
/// with [`DataError::NameConflict`], neither input silently wins.
pub(crate) struct Claims<R: ?Sized> {
    owners: BTreeMap<Name, BTreeMap<Name, Data<R>>>,
}

impl<R: ?Sized> Claims<R> {
    pub(crate) fn new() -> Self {
        Self {
            owners: BTreeMap::new(),
        }
    }

    pub(crate) fn claim(&mut self, output: Name, input: Name, data: Data<R>) {
        self.owners.entry(output).or_default().insert(input, data);
    }

    pub(crate) fn release(&mut self, output: &Name, input: &Name) {
        if let Some(owners) = self.owners.get_mut(output) {
            owners.remove(input);
            if owners.is_empty() {
                self.owners.remove(output);
            }
        }
    }

    pub(crate) fn resolve(&self, output: &Name) -> Option<Data<R>> {
        let owners = self.owners.get(output)?;
        let mut iter = owners.values();
        let first = iter.next()?;
        if iter.next().is_none() {
            return Some(first.clone());
        }

        tracing::warn!(name = %output, "action outputs collide");
        let error = DataError::NameConflict {
            name: output.clone(),
            inputs: owners.keys().cloned().collect(),
        };
        Some(Data::failed(first.type_tag(), first.meta().clone(), error))
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &Name> {
        self.owners.keys()
    }
}

/// Keep an output tree in sync with the updates of its source.
///
/// `on_change` runs for every changed source name until the update stream
/// ends or the output is dropped. Without a running tokio runtime the output
/// is left as a snapshot.
pub(crate) fn follow_updates<F>(updates: BoxStream<'static, Name>, output: Weak<MutableSource>, mut on_change: F)
where
    F: FnMut(&MutableSource, &Name) + Send + 'static,
{
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        tracing::warn!("no async runtime, the derived tree won't follow its source");
        if let Some(output) = output.upgrade() {
            output.close();
        }
        return;
    };

    handle.spawn(async move {
        let mut updates = updates;
        while let Some(name) = updates.next().await {
            let Some(output) = output.upgrade() else {
                return;
            };
            tracing::trace!(%name, "source entry changed");
            on_change(&output, &name);
        }

        if let Some(output) = output.upgrade() {
            output.close();
        }
    });
}
