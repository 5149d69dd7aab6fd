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
type Rule<O> = dyn Fn(&Name, &Meta) -> O + Send + Sync;

/// One output entry per input entry.
///
/// By default the output keeps the name and the meta of its input, both can
/// be changed with [`rename`](MapAction::rename) and
/// [`meta`](MapAction::meta).
pub struct MapAction<T: ?Sized, R> {
    body: Arc<Body<T, R>>,
    rename: Option<Arc<Rule<Name>>>,
    meta: Option<Arc<Rule<Meta>>>,
}

impl<T: ?Sized, R> Clone for MapAction<T, R> {
    fn clone(&self) -> Self {
        Self {
            body: self.body.clone(),
            rename: self.rename.clone(),
            meta: self.meta.clone(),
        }
    }
}

impl<T: Payload + ?Sized, R: Send + Sync + 'static> MapAction<T, R> {
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&T, &ActionEnv<'_>) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        Self {
            body: Arc::new(body),
            rename: None,
            meta: None,
        }
    }

    pub fn rename<F>(mut self, rename: F) -> Self
    where
        F: Fn(&Name, &Meta) -> Name + Send + Sync + 'static,
    {
        self.rename = Some(Arc::new(rename));
        self
    }

    pub fn meta<F>(mut self, meta: F) -> Self
    where
        F: Fn(&Name, &Meta) -> Meta + Send + Sync + 'static,
    {
        self.meta = Some(Arc::new(meta));
        self
    }

    fn apply(&self, item: &NamedData<T>, action_meta: &Meta) -> (Name, Data<R>) {
        let name = match &self.rename {
            Some(rename) => rename(item.name(), item.meta()),
            None => item.name().clone(),
        };
        let meta = match &self.meta {
            Some(rule) => rule(item.name(), item.meta()),
            None => item.meta().clone(),
        };

        let input = item.clone();
        let body = self.body.clone();
        let output = name.clone();
        let output_meta = meta.clone();
        let action_meta = action_meta.clone();

        let data = Data::from_result(meta, vec![item.data().erase()], async move {
            let value = input.value().await?;
            let env = ActionEnv {
                name: &output,
                meta: &output_meta,
                action_meta: &action_meta,
            };
            body(&*value, &env).map_err(DataError::computation)
        });

        (name, data)
    }
}

impl<T: Payload + ?Sized, R: Send + Sync + 'static> Action<T, R> for MapAction<T, R> {
    fn execute(&self, source: &DataTree<T>, meta: &Meta) -> DataTree<R> {
        let tree_meta = output_meta(source, meta);

        // subscribe before the snapshot so no change is missed
        let updates = source.is_observable().then(|| source.updates());

        let mut claims = Claims::new();
        let mut produced = HashMap::new();
        for item in source.iter() {
            let (name, data) = self.apply(&item, meta);
            claims.claim(name.clone(), item.name().clone(), data);
            produced.insert(item.name().clone(), name);
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

            if let Some(old) = produced.remove(changed) {
                claims.release(&old, changed);
                affected.insert(old);
            }

            if let Some(item) = source.get(changed) {
                let (name, data) = action.apply(&item, &meta);
                claims.claim(name.clone(), changed.clone(), data);
                produced.insert(changed.clone(), name.clone());
                affected.insert(name);
            }

            for name in affected {
                let data = claims.resolve(&name).map(|data| data.erase());
                output.put(name, data);
            }
        });

        DataTree::from_source(output)
    }
}

impl<T: Payload + ?Sized> DataTree<T> {
    /// Shorthand for a [`MapAction`] executed with an empty meta.
    pub fn map<R, F>(&self, body: F) -> DataTree<R>
    where
        R: Send + Sync + 'static,
        F: Fn(&T, &ActionEnv<'_>) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        MapAction::new(body).execute(self, &Meta::empty())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;

    use super::*;
    use crate::data::DataState;
    use crate::tree::MutableDataTree;

    fn numbers() -> DataTree<i64> {
        let mut builder = DataTree::builder();
        builder.value("a", 1i64).value("b", 2).value("c", 3);
        builder.build()
    }

    #[tokio::test]
    async fn test_map_keeps_names_and_is_lazy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let squares = numbers().map(move |v, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(v * v)
        });

        assert_eq!(squares.names(), numbers().names());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(squares.get("b").unwrap().state(), DataState::Unrequested);

        assert_eq!(*squares.get("c").unwrap().value().await.unwrap(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rename_and_env() {
        let action = MapAction::new(|v: &i64, env: &ActionEnv<'_>| {
            Ok(format!("{}={}", env.name, v))
        })
        .rename(|name, _| Name::from("out").join(name));

        let out = action.execute(&numbers(), &Meta::empty());
        let value = out.get("out.a").unwrap().value().await.unwrap();
        assert_eq!(value.as_str(), "out.a=1");
    }

    #[tokio::test]
    async fn test_colliding_rename_fails_the_entry() {
        let out = MapAction::new(|v: &i64, _: &ActionEnv<'_>| Ok(*v))
            .rename(|name, _| if name == &Name::from("c") { name.clone() } else { Name::from("same") })
            .execute(&numbers(), &Meta::empty());

        assert_eq!(out.names(), vec![Name::from("c"), Name::from("same")]);
        let err = out.get("same").unwrap().value().await.unwrap_err();
        match err.innermost() {
            DataError::NameConflict { name, inputs } => {
                assert_eq!(name, &Name::from("same"));
                assert_eq!(inputs, &vec![Name::from("a"), Name::from("b")]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*out.get("c").unwrap().value().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_collision_resolves_when_input_moves_away() {
        let source = MutableDataTree::<i64>::new();
        source.value("a", 1);
        source.value("b", 2);

        let out = MapAction::new(|v: &i64, _: &ActionEnv<'_>| Ok(*v))
            .rename(|_, meta| Name::from(meta.get_str("to").unwrap_or("same")))
            .execute(&source.tree(), &Meta::empty());
        assert!(out.get("same").unwrap().value().await.is_err());

        let mut updates = out.updates();
        source.put("b", Data::constant_with_meta(2i64, Meta::empty().with("to", "other")));
        assert_eq!(updates.next().await, Some(Name::from("other")));

        assert_eq!(*out.get("same").unwrap().value().await.unwrap(), 1);
        assert_eq!(*out.get("other").unwrap().value().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_body_failure_stays_in_entry() {
        let out = numbers().map(|v, _| {
            anyhow::ensure!(*v != 2, "two is not allowed");
            Ok(*v)
        });

        assert!(out.get("a").unwrap().value().await.is_ok());
        let err = out.get("b").unwrap().value().await.unwrap_err();
        assert_eq!(err.root_cause(), "two is not allowed");
    }

    #[tokio::test]
    async fn test_dependencies_point_at_inputs() {
        let input = numbers();
        let out = input.map(|v, _| Ok(v + 1));
        let data = out.get("a").unwrap();
        assert!(data.dependencies()[0].ptr_eq(input.get("a").unwrap().data()));
    }

    #[tokio::test]
    async fn test_incremental_update_touches_one_entry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let source = MutableDataTree::<i64>::new();
        source.value("a", 1);
        source.value("b", 2);

        let out = source.tree().map(move |v, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(v * 10)
        });
        assert!(out.is_observable());
        assert_eq!(out.values().await.unwrap().len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let untouched = out.get("b").unwrap();
        let mut updates = out.updates();

        source.value("a", 5);
        assert_eq!(updates.next().await, Some(Name::from("a")));

        assert_eq!(*out.get("a").unwrap().value().await.unwrap(), 50);
        assert!(out.get("b").unwrap().ptr_eq(untouched.data()));
        assert_eq!(*out.get("b").unwrap().value().await.unwrap(), 20);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        source.remove("b");
        assert_eq!(updates.next().await, Some(Name::from("b")));
        assert!(out.get("b").is_none());
    }
}
