use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::try_join_all;

use super::{Action, ActionEnv, follow_updates, output_meta};
use crate::core::Payload;
use crate::data::{Data, NamedData};
use crate::error::DataError;
use crate::meta::Meta;
use crate::name::{Name, NamePattern};
use crate::tree::{DataTree, MutableSource};

/// Decides which group an entry belongs to, `None` leaves it out.
#[derive(Clone, Debug)]
pub enum GroupRule {
    /// All entries in a single group.
    Whole(Name),
    /// Entries grouped by the first `n` tokens of their names.
    Prefix(usize),
    /// Entries grouped by a text value in their meta.
    Meta { key: Name, default: Option<Name> },
    /// Entries grouped by the first matching pattern.
    Patterns(Vec<(NamePattern, Name)>),
}

impl GroupRule {
    pub fn whole(group: impl Into<Name>) -> Self {
        GroupRule::Whole(group.into())
    }

    pub fn by_prefix(depth: usize) -> Self {
        GroupRule::Prefix(depth)
    }

    /// Group by the text at `key`, entries without it go to `default` or are
    /// left out.
    pub fn by_meta(key: impl Into<Name>, default: Option<Name>) -> Self {
        GroupRule::Meta {
            key: key.into(),
            default,
        }
    }

    pub fn by_patterns(patterns: impl IntoIterator<Item = (NamePattern, Name)>) -> Self {
        GroupRule::Patterns(patterns.into_iter().collect())
    }

    pub fn group(&self, name: &Name, meta: &Meta) -> Option<Name> {
        match self {
            GroupRule::Whole(group) => Some(group.clone()),
            GroupRule::Prefix(depth) => (!name.is_empty()).then(|| name.head(*depth)),
            GroupRule::Meta { key, default } => match meta.get_str(key) {
                Some(value) => Some(Name::from(value)),
                None => default.clone(),
            },
            GroupRule::Patterns(patterns) => patterns
                .iter()
                .find(|(pattern, _)| pattern.matches(name))
                .map(|(_, group)| group.clone()),
        }
    }
}

type Body<T, R> = dyn Fn(&BTreeMap<Name, Arc<T>>, &ActionEnv<'_>) -> anyhow::Result<R> + Send + Sync;

/// One output entry per group of input entries.
///
/// The body receives the awaited values of all members of a group, keyed by
/// their names.
pub struct ReduceAction<T: ?Sized, R> {
    rule: GroupRule,
    body: Arc<Body<T, R>>,
}

impl<T: ?Sized, R> Clone for ReduceAction<T, R> {
    fn clone(&self) -> Self {
        Self {
            rule: self.rule.clone(),
            body: self.body.clone(),
        }
    }
}

impl<T: Payload + ?Sized, R: Send + Sync + 'static> ReduceAction<T, R> {
    pub fn new<F>(rule: GroupRule, body: F) -> Self
    where
        F: Fn(&BTreeMap<Name, Arc<T>>, &ActionEnv<'_>) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        Self {
            rule,
            body: Arc::new(body),
        }
    }

    fn members(&self, source: &DataTree<T>, group: &Name) -> Vec<NamedData<T>> {
        source
            .iter()
            .filter(|item| self.rule.group(item.name(), item.meta()).as_ref() == Some(group))
            .collect()
    }

    fn groups(&self, source: &DataTree<T>) -> BTreeMap<Name, Vec<NamedData<T>>> {
        let mut groups: BTreeMap<Name, Vec<NamedData<T>>> = BTreeMap::new();
        for item in source.iter() {
            if let Some(group) = self.rule.group(item.name(), item.meta()) {
                groups.entry(group).or_default().push(item);
            }
        }
        groups
    }

    fn apply(&self, group: &Name, members: Vec<NamedData<T>>, action_meta: &Meta) -> Data<R> {
        let dependencies = members.iter().map(|item| item.data().erase()).collect();
        let body = self.body.clone();
        let group = group.clone();
        let action_meta = action_meta.clone();

        Data::from_result(Meta::empty(), dependencies, async move {
            let values = try_join_all(members.iter().map(|item| async move {
                let value = item.value().await?;
                Ok::<_, DataError>((item.name().clone(), value))
            }))
            .await?;

            let values: BTreeMap<_, _> = values.into_iter().collect();
            let meta = Meta::empty();
            let env = ActionEnv {
                name: &group,
                meta: &meta,
                action_meta: &action_meta,
            };
            body(&values, &env).map_err(DataError::computation)
        })
    }
}

impl<T: Payload + ?Sized, R: Send + Sync + 'static> Action<T, R> for ReduceAction<T, R> {
    fn execute(&self, source: &DataTree<T>, meta: &Meta) -> DataTree<R> {
        let tree_meta = output_meta(source, meta);

        if !source.is_observable() {
            let mut builder = DataTree::builder();
            builder.meta(tree_meta);
            for (group, members) in self.groups(source) {
                let data = self.apply(&group, members, meta);
                builder.put(group, data);
            }
            return builder.build();
        }

        let updates = source.updates();
        let output = MutableSource::new(tree_meta);
        let mut membership = HashMap::new();

        for (group, members) in self.groups(source) {
            for item in &members {
                membership.insert(item.name().clone(), group.clone());
            }
            let data = self.apply(&group, members, meta);
            output.put(group, Some(data.erase()));
        }

        let action = self.clone();
        let source = source.clone();
        let meta = meta.clone();

        follow_updates(updates, Arc::downgrade(&output), move |output, changed| {
            let current = source
                .get(changed)
                .and_then(|item| action.rule.group(item.name(), item.meta()));
            let previous = match &current {
                Some(group) => membership.insert(changed.clone(), group.clone()),
                None => membership.remove(changed),
            };

            let affected: BTreeSet<Name> = previous.into_iter().chain(current).collect();
            for group in affected {
                let members = action.members(&source, &group);
                if members.is_empty() {
                    output.put(group, None);
                } else {
                    let data = action.apply(&group, members, &meta);
                    output.put(group, Some(data.erase()));
                }
            }
        });

        DataTree::from_source(output)
    }
}

impl<T: Payload + ?Sized> DataTree<T> {
    /// Shorthand for a [`ReduceAction`] executed with an empty meta.
    pub fn reduce<R, F>(&self, rule: GroupRule, body: F) -> DataTree<R>
    where
        R: Send + Sync + 'static,
        F: Fn(&BTreeMap<Name, Arc<T>>, &ActionEnv<'_>) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        ReduceAction::new(rule, body).execute(self, &Meta::empty())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::tree::MutableDataTree;

    fn sum(values: &BTreeMap<Name, Arc<i64>>, _: &ActionEnv<'_>) -> anyhow::Result<i64> {
        Ok(values.values().map(|v| **v).sum())
    }

    #[tokio::test]
    async fn test_whole_tree_reduce() {
        let mut builder = DataTree::builder();
        builder.value("a", 1i64).value("b", 2).value("c", 3);
        let total = builder.build().reduce(GroupRule::Whole(Name::from("total")), sum);

        assert_eq!(total.names(), vec![Name::from("total")]);
        assert_eq!(*total.get("total").unwrap().value().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_group_by_prefix() {
        let mut builder = DataTree::builder();
        builder
            .value("g1.x", 1i64)
            .value("g1.y", 2)
            .value("g2.x", 10)
            .value("g2.y", 20);
        let sums = builder.build().reduce(GroupRule::by_prefix(1), sum);

        let values = sums.values().await.unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(*values[&Name::from("g1")], 3);
        assert_eq!(*values[&Name::from("g2")], 30);
    }

    #[tokio::test]
    async fn test_group_by_meta() {
        let mut builder = DataTree::builder();
        builder
            .put("a", Data::constant_with_meta(1i64, Meta::new(json!({ "kind": "odd" }))))
            .put("b", Data::constant_with_meta(2i64, Meta::new(json!({ "kind": "even" }))))
            .put("c", Data::constant_with_meta(3i64, Meta::new(json!({ "kind": "odd" }))))
            .value("d", 100);
        let rule = GroupRule::by_meta("kind", None);
        let values = builder.build().reduce(rule, sum).values().await.unwrap();

        assert_eq!(values.len(), 2);
        assert_eq!(*values[&Name::from("odd")], 4);
        assert_eq!(*values[&Name::from("even")], 2);
    }

    #[test]
    fn test_group_by_patterns() {
        let rule = GroupRule::Patterns(vec![
            (NamePattern::parse("raw.**").unwrap(), Name::from("raw")),
            (NamePattern::parse("**").unwrap(), Name::from("rest")),
        ]);
        assert_eq!(rule.group(&"raw.a.b".into(), &Meta::empty()), Some(Name::from("raw")));
        assert_eq!(rule.group(&"x".into(), &Meta::empty()), Some(Name::from("rest")));
    }

    #[tokio::test]
    async fn test_member_failure_names_member() {
        let mut builder = DataTree::<i64>::builder();
        builder
            .value("a", 1)
            .put("b", Data::<i64>::lazy(|| async { anyhow::bail!("broken member") }));
        let total = builder.build().reduce(GroupRule::Whole(Name::from("t")), sum);

        let err = total.get("t").unwrap().value().await.unwrap_err();
        assert!(err.to_string().contains("entry 'b'"), "{err}");
        assert_eq!(err.root_cause(), "broken member");
    }

    #[tokio::test]
    async fn test_incremental_regroup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let source = MutableDataTree::<i64>::new();
        source.value("g1.a", 1);
        source.value("g2.a", 10);
        source.value("g3.a", 100);

        let sums = source.tree().reduce(GroupRule::Prefix(1), move |values, env| {
            counter.fetch_add(1, Ordering::SeqCst);
            sum(values, env)
        });
        assert_eq!(sums.values().await.unwrap().len(), 3);
        let untouched = sums.get("g3").unwrap();
        let mut updates = sums.updates();

        // moves out of g1 and into g2
        source.remove("g1.a");
        assert_eq!(updates.next().await, Some(Name::from("g1")));
        source.value("g2.b", 5);
        assert_eq!(updates.next().await, Some(Name::from("g2")));

        assert!(sums.get("g1").is_none());
        assert_eq!(*sums.get("g2").unwrap().value().await.unwrap(), 15);
        assert!(sums.get("g3").unwrap().ptr_eq(untouched.data()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
