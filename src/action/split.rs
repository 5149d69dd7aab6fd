use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::{Action, ActionEnv, Claims, follow_updates, output_meta};
use crate::core::Payload;
use crate::data::{Data, NamedData};
use crate::error::DataError;
use crate::meta::Meta;
use crate::name::Name;
use crate::tree::{DataTree, MutableSource};

type Body<T, R> = dyn Fn(&T, &ActionEnv<'_>) -> anyhow::Result<R> + Send + Sync;

/// Several output entries per input entry.
///
/// Each fragment is named by appending the fragment name to the name of its
/// input, `spectrum` split into `peak` and `noise` gives `spectrum.peak` and
/// `spectrum.noise`.
pub struct SplitAction<T: ?Sized, R> {
    fragments: Vec<(Name, Arc<Body<T, R>>)>,
}

impl<T: ?Sized, R> Clone for SplitAction<T, R> {
    fn clone(&self) -> Self {
        Self {
            fragments: self.fragments.clone(),
        }
    }
}

impl<T: Payload + ?Sized, R: Send + Sync + 'static> Default for SplitAction<T, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Payload + ?Sized, R: Send + Sync + 'static> SplitAction<T, R> {
    pub fn new() -> Self {
        Self {
            fragments: Vec::new(),
        }
    }

    pub fn fragment<F>(mut self, name: impl Into<Name>, body: F) -> Self
    where
        F: Fn(&T, &ActionEnv<'_>) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.fragments.push((name.into(), Arc::new(body)));
        self
    }

    fn apply(&self, item: &NamedData<T>, action_meta: &Meta) -> Vec<(Name, Data<R>)> {
        self.fragments
            .iter()
            .map(|(fragment, body)| {
                let name = item.name().join(fragment);
                let input = item.clone();
                let body = body.clone();
                let output = name.clone();
                let meta = item.meta().clone();
                let action_meta = action_meta.clone();

                let data = Data::from_result(item.meta().clone(), vec![item.data().erase()], async move {
                    let value = input.value().await?;
                    let env = ActionEnv {
                        name: &output,
                        meta: &meta,
                        action_meta: &action_meta,
                    };
                    body(&*value, &env).map_err(DataError::computation)
                });

                (name, data)
            })
            .collect()
    }
}

impl<T: Payload + ?Sized, R: Send + Sync + 'static> Action<T, R> for SplitAction<T, R> {
    fn execute(&self, source: &DataTree<T>, meta: &Meta) -> DataTree<R> {
        let tree_meta = output_meta(source, meta);
        let updates = source.is_observable().then(|| source.updates());

        let mut claims = Claims::new();
        let mut produced: HashMap<Name, Vec<Name>> = HashMap::new();
        for item in source.iter() {
            let fragments = self.apply(&item, meta);
            let names = fragments.iter().map(|(name, _)| name.clone()).collect();
            for (name, data) in fragments {
                claims.claim(name, item.name().clone(), data);
            }
            produced.insert(item.name().clone(), names);
        }

        let Some(updates) = updates else {
            let mut builder = DataTree::<R>::builder();
            builder.meta(tree_meta);
            for name in claims.names() {
                builder.put(name.clone(), claims.resolve(name));
            }
            return builder.build();
        };

        let output = MutableSource::new(tree_meta);
        for name in claims.names() {
            output.put(name.clone(), claims.resolve(name).map(|data| data.erase()));
        }

        let action = self.clone();
        let source = source.clone();
        let meta = meta.clone();

        follow_updates(updates, Arc::downgrade(&output), move |output, changed| {
            let mut affected = BTreeSet::new();

            for old in produced.remove(changed).unwrap_or_default() {
                claims.release(&old, changed);
                affected.insert(old);
            }

            if let Some(item) = source.get(changed) {
                let fragments = action.apply(&item, &meta);
                let names = fragments.iter().map(|(name, _)| name.clone()).collect();
                for (name, data) in fragments {
                    claims.claim(name.clone(), changed.clone(), data);
                    affected.insert(name);
                }
                produced.insert(changed.clone(), names);
            }

            for name in affected {
                let data = claims.resolve(&name).map(|data| data.erase());
                output.put(name, data);
            }
        });

        DataTree::from_source(output)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;

    use super::*;
    use crate::tree::MutableDataTree;

    fn split() -> SplitAction<(i64, i64), i64> {
        SplitAction::new()
            .fragment("left", |pair: &(i64, i64), _: &ActionEnv<'_>| Ok(pair.0))
            .fragment("right", |pair: &(i64, i64), _: &ActionEnv<'_>| Ok(pair.1))
    }

    #[tokio::test]
    async fn test_split_names_fragments() {
        let mut builder = DataTree::builder();
        builder.value("p", (1i64, 2i64)).value("q", (3, 4));
        let out = split().execute(&builder.build(), &Meta::empty());

        assert_eq!(
            out.names(),
            vec![
                Name::from("p.left"),
                Name::from("p.right"),
                Name::from("q.left"),
                Name::from("q.right"),
            ]
        );
        assert_eq!(*out.get("q.right").unwrap().value().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_overlapping_fragments_conflict() {
        let mut builder = DataTree::builder();
        builder.value("p", (1i64, 2i64)).value("p.left", (3, 4));
        let action = SplitAction::new()
            .fragment("left.x", |pair: &(i64, i64), _: &ActionEnv<'_>| Ok(pair.0))
            .fragment("x", |pair: &(i64, i64), _: &ActionEnv<'_>| Ok(pair.1));
        let out = action.execute(&builder.build(), &Meta::empty());

        assert_eq!(
            out.names(),
            vec![Name::from("p.left.left.x"), Name::from("p.left.x"), Name::from("p.x")]
        );
        let err = out.get("p.left.x").unwrap().value().await.unwrap_err();
        assert!(matches!(err.innermost(), DataError::NameConflict { .. }));
        assert_eq!(*out.get("p.x").unwrap().value().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_incremental_split_only_recomputes_changed_input() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let action = SplitAction::new().fragment("sum", move |pair: &(i64, i64), _: &ActionEnv<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(pair.0 + pair.1)
        });

        let source = MutableDataTree::<(i64, i64)>::new();
        source.value("p", (1, 1));
        source.value("q", (2, 2));
        let out = action.execute(&source.tree(), &Meta::empty());
        assert_eq!(out.values().await.unwrap().len(), 2);

        let untouched = out.get("q.sum").unwrap();
        let mut updates = out.updates();
        source.value("p", (5, 5));
        assert_eq!(updates.next().await, Some(Name::from("p.sum")));

        assert_eq!(*out.get("p.sum").unwrap().value().await.unwrap(), 10);
        assert!(out.get("q.sum").unwrap().ptr_eq(untouched.data()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        source.remove("q");
        assert_eq!(updates.next().await, Some(Name::from("q.sum")));
        assert!(out.get("q.sum").is_none());
    }
}
