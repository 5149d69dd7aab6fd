//! Task registry and the single entry point to produce results.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use petgraph::Graph;
use petgraph::algo::toposort;
use tracing::{Instrument, debug, info_span};

use crate::cache::{Fingerprint, WorkspaceCache};
use crate::core::{Payload, TypeTag, Unknown};
use crate::data::NamedData;
use crate::error::{DataError, WorkspaceError};
use crate::goal::{self, GoalChain};
use crate::meta::Meta;
use crate::name::Name;
use crate::task::{Task, TaskBuilder, TaskProvider, TaskRef};
use crate::tree::DataTree;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    id: u64,
    data: DataTree<Unknown>,
    targets: BTreeMap<String, Meta>,
    tasks: BTreeMap<Name, Arc<dyn Task>>,
    cache: Option<Arc<dyn WorkspaceCache>>,
}

/// Root data, named targets and tasks.
///
/// Cloning is cheap, clones refer to the same workspace.
#[derive(Clone)]
pub struct Workspace {
    inner: Arc<Inner>,
}

impl Workspace {
    pub fn builder() -> WorkspaceBuilder {
        WorkspaceBuilder::new()
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// The root data, as produced by the task with the empty name.
    pub fn data(&self) -> TaskResult<Unknown> {
        TaskResult::new(self, Name::EMPTY, Meta::empty(), self.inner.data.clone())
    }

    pub fn targets(&self) -> &BTreeMap<String, Meta> {
        &self.inner.targets
    }

    pub fn target(&self, name: &str) -> Option<&Meta> {
        self.inner.targets.get(name)
    }

    pub fn task(&self, name: &Name) -> Option<&Arc<dyn Task>> {
        self.inner.tasks.get(name)
    }

    pub fn tasks(&self) -> impl Iterator<Item = (&Name, &Arc<dyn Task>)> {
        self.inner.tasks.iter()
    }

    /// Produce the result of `task` for `meta`.
    ///
    /// Declared dependencies are produced first, nothing is computed: the
    /// entries of the result are lazy. The empty name yields the root data.
    pub async fn produce(&self, task: &Name, meta: &Meta) -> Result<TaskResult<Unknown>, WorkspaceError> {
        if task.is_empty() {
            return Ok(self.data());
        }

        goal::check_not_in_body(self.id(), task)?;

        let executor = self
            .task(task)
            .cloned()
            .ok_or_else(|| WorkspaceError::TaskNotFound(task.clone()))?;

        let fingerprint = Fingerprint::new(task, meta);
        let chain = GoalChain::current(self.id()).push(task, fingerprint)?;
        let span = info_span!("task", name = %task, depth = chain.depth());
        let start = Instant::now();

        let tree = chain
            .scope(executor.execute(self, task, meta))
            .instrument(span.clone())
            .await?;

        span.in_scope(|| debug!(elapsed = ?start.elapsed(), "result tree ready"));

        let result = TaskResult::new(self, task.clone(), meta.clone(), tree);
        Ok(match &self.inner.cache {
            Some(cache) => cache.cache(result),
            None => result,
        })
    }

    /// Typed flavour of [`Workspace::produce`].
    pub async fn produce_as<T: Payload + ?Sized>(
        &self,
        task: &TaskRef<T>,
        meta: &Meta,
    ) -> Result<TaskResult<T>, WorkspaceError> {
        if let (Some(expected), Some(registered)) = (T::tag(), self.task(task.name())) {
            let found = registered.result_type();
            if found != expected && found != TypeTag::of::<Unknown>() {
                return Err(WorkspaceError::ResultType {
                    task: task.name().clone(),
                    expected,
                    found,
                });
            }
        }

        Ok(self.produce(task.name(), meta).await?.cast())
    }

    /// Produce `task` with the meta of a named target.
    pub async fn produce_target(&self, task: &Name, target: &str) -> Result<TaskResult<Unknown>, WorkspaceError> {
        let meta = self
            .target(target)
            .cloned()
            .ok_or_else(|| WorkspaceError::TargetNotFound(target.to_owned()))?;
        self.produce(task, &meta).await
    }

    /// Produce `task` and pick a single entry of its result.
    pub async fn produce_data(
        &self,
        task: &Name,
        meta: &Meta,
        name: impl Into<Name>,
    ) -> Result<Option<NamedData<Unknown>>, WorkspaceError> {
        Ok(self.produce(task, meta).await?.get(name))
    }
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("id", &self.inner.id)
            .field("tasks", &self.inner.tasks.keys().collect::<Vec<_>>())
            .field("targets", &self.inner.targets.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Task graph as a mermaid diagram.
impl fmt::Display for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        let index: HashMap<&Name, usize> = self.inner.tasks.keys().enumerate().map(|(i, n)| (n, i)).collect();

        for name in self.inner.tasks.keys() {
            let label = name.to_string().replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index[name], label)?;
        }

        for (name, task) in &self.inner.tasks {
            let type_name = task
                .result_type()
                .name()
                .replace('<', "&lt;")
                .replace('>', "&gt;");
            for dependency in task.dependencies() {
                if let Some(source) = index.get(&dependency) {
                    writeln!(f, "    {} -- \"{}\" --> {}", source, type_name, index[name])?;
                }
            }
        }

        Ok(())
    }
}

/// Collects data, targets and tasks into a [`Workspace`].
#[derive(Default)]
pub struct WorkspaceBuilder {
    data: Option<DataTree<Unknown>>,
    targets: BTreeMap<String, Meta>,
    tasks: BTreeMap<Name, Arc<dyn Task>>,
    cache: Option<Arc<dyn WorkspaceCache>>,
}

impl WorkspaceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the root data.
    pub fn data<T: Payload + ?Sized>(&mut self, tree: &DataTree<T>) -> &mut Self {
        self.data = Some(tree.erase());
        self
    }

    /// Define a named meta preset.
    pub fn target(&mut self, name: impl Into<String>, meta: Meta) -> &mut Self {
        self.targets.insert(name.into(), meta);
        self
    }

    /// Start defining a task producing values of type `T`.
    pub fn task<T: Payload + ?Sized>(&mut self, name: impl Into<Name>) -> TaskBuilder<'_, T> {
        TaskBuilder::new(self, name.into())
    }

    /// Register a hand written task.
    pub fn register(&mut self, name: impl Into<Name>, task: Arc<dyn Task>) -> Result<&mut Self, WorkspaceError> {
        self.insert_task(name.into(), task)?;
        Ok(self)
    }

    /// Register every task of a provider.
    pub fn gather(&mut self, provider: &impl TaskProvider) -> Result<&mut Self, WorkspaceError> {
        for (name, task) in provider.tasks() {
            self.insert_task(name, task)?;
        }
        Ok(self)
    }

    pub fn cache(&mut self, cache: impl WorkspaceCache + 'static) -> &mut Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub(crate) fn insert_task(&mut self, name: Name, task: Arc<dyn Task>) -> Result<(), WorkspaceError> {
        // the empty name is taken by the root data
        if name.is_empty() || self.tasks.contains_key(&name) {
            return Err(WorkspaceError::DuplicateTask(name));
        }
        self.tasks.insert(name, task);
        Ok(())
    }

    /// Swap a registered task for the one built from it.
    #[cfg(feature = "remote")]
    pub(crate) fn replace_task<F>(&mut self, name: &Name, replace: F) -> Result<(), WorkspaceError>
    where
        F: FnOnce(&Arc<dyn Task>) -> Result<Arc<dyn Task>, WorkspaceError>,
    {
        let slot = self
            .tasks
            .get_mut(name)
            .ok_or_else(|| WorkspaceError::TaskNotFound(name.clone()))?;
        *slot = replace(slot)?;
        Ok(())
    }

    /// Validate the declared task graph and create the workspace.
    ///
    /// Fails when a task depends on an unregistered task or when the declared
    /// dependencies form a cycle.
    pub fn build(self) -> Result<Workspace, WorkspaceError> {
        let mut graph = Graph::<Name, ()>::new();
        let nodes: HashMap<Name, _> = self
            .tasks
            .keys()
            .map(|name| (name.clone(), graph.add_node(name.clone())))
            .collect();

        for (name, task) in &self.tasks {
            for dependency in task.dependencies() {
                let Some(&source) = nodes.get(&dependency) else {
                    return Err(WorkspaceError::MissingDependency {
                        task: name.clone(),
                        dependency,
                    });
                };
                graph.add_edge(source, nodes[name], ());
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            return Err(WorkspaceError::Cycle(graph[cycle.node_id()].clone()));
        }

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(id, tasks = self.tasks.len(), targets = self.targets.len(), "workspace ready");

        Ok(Workspace {
            inner: Arc::new(Inner {
                id,
                data: self.data.unwrap_or_else(DataTree::empty),
                targets: self.targets,
                tasks: self.tasks,
                cache: self.cache,
            }),
        })
    }
}

/// The tree produced by a task, together with its provenance.
pub struct TaskResult<T: ?Sized> {
    workspace: Weak<Inner>,
    task: Name,
    meta: Meta,
    tree: DataTree<T>,
}

impl<T: ?Sized> Clone for TaskResult<T> {
    fn clone(&self) -> Self {
        Self {
            workspace: self.workspace.clone(),
            task: self.task.clone(),
            meta: self.meta.clone(),
            tree: self.tree.clone(),
        }
    }
}

impl<T: ?Sized> TaskResult<T> {
    fn new(workspace: &Workspace, task: Name, meta: Meta, tree: DataTree<T>) -> Self {
        Self {
            workspace: Arc::downgrade(&workspace.inner),
            task,
            meta,
            tree,
        }
    }

    /// The workspace which produced this result, if it is still alive.
    pub fn workspace(&self) -> Option<Workspace> {
        self.workspace.upgrade().map(|inner| Workspace { inner })
    }

    /// Name of the producing task, empty for the root data.
    pub fn task_name(&self) -> &Name {
        &self.task
    }

    pub fn task_meta(&self) -> &Meta {
        &self.meta
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(&self.task, &self.meta)
    }

    pub fn tree(&self) -> &DataTree<T> {
        &self.tree
    }

    pub fn into_tree(self) -> DataTree<T> {
        self.tree
    }

    /// The same provenance with another tree.
    pub(crate) fn with_tree<R: ?Sized>(self, tree: DataTree<R>) -> TaskResult<R> {
        TaskResult {
            workspace: self.workspace,
            task: self.task,
            meta: self.meta,
            tree,
        }
    }

    fn attach(&self, item: NamedData<T>) -> NamedData<T> {
        if self.task.is_empty() {
            item
        } else {
            item.with_task(self.task.clone())
        }
    }
}

impl<T: Payload + ?Sized> TaskResult<T> {
    pub fn get(&self, name: impl Into<Name>) -> Option<NamedData<T>> {
        self.tree.get(name).map(|item| self.attach(item))
    }

    pub fn items(&self) -> Vec<NamedData<T>> {
        self.tree
            .items()
            .into_iter()
            .map(|item| self.attach(item))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = NamedData<T>> + use<T> {
        self.items().into_iter()
    }

    /// Narrow the result to entries of type `R`.
    pub fn cast<R: Payload + ?Sized>(self) -> TaskResult<R> {
        let tree = self.tree.filter_by_type::<R>();
        self.with_tree(tree)
    }

    /// Await all entries, failures name the task and the entry.
    pub async fn values(&self) -> Result<BTreeMap<Name, Arc<T>>, DataError> {
        let items = self.items();
        let values = futures::future::try_join_all(items.iter().map(|item| async move {
            item.value().await.map(|value| (item.name().clone(), value))
        }))
        .await?;

        Ok(values.into_iter().collect())
    }
}

impl<T: ?Sized> Deref for TaskResult<T> {
    type Target = DataTree<T>;

    fn deref(&self) -> &Self::Target {
        &self.tree
    }
}

impl<T: ?Sized> fmt::Debug for TaskResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskResult")
            .field("task", &self.task)
            .field("meta", &self.meta)
            .field("tree", &self.tree)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::action::GroupRule;
    use crate::placement::PlacementRule;
    use crate::task::Dependency;

    fn numbers() -> DataTree<i64> {
        let mut builder = DataTree::builder();
        builder.value("n1", 1i64).value("n2", 2).value("n3", 3).value("n4", 4);
        builder.build()
    }

    fn square_sum(builder: &mut WorkspaceBuilder) -> (TaskRef<i64>, TaskRef<i64>) {
        let square = builder
            .task::<i64>("square")
            .depends_on(Dependency::data())
            .run(|ctx| Ok(ctx.input::<i64>(0).map(|v, _| Ok(v * v))))
            .unwrap();

        let sum = builder
            .task::<i64>("sum")
            .depends_on(Dependency::task(&square))
            .run(|ctx| {
                let squares = ctx.input::<i64>(0);
                Ok(squares.reduce(GroupRule::Whole(Name::from("total")), |values, _| {
                    Ok(values.values().map(|v| **v).sum())
                }))
            })
            .unwrap();

        (square, sum)
    }

    #[tokio::test]
    async fn test_square_then_sum() {
        let mut builder = Workspace::builder();
        builder.data(&numbers());
        let (square, sum) = square_sum(&mut builder);
        let workspace = builder.build().unwrap();

        let squares = workspace.produce_as(&square, &Meta::empty()).await.unwrap();
        let values = squares.values().await.unwrap();
        assert_eq!(
            values.values().map(|v| **v).collect::<Vec<_>>(),
            vec![1, 4, 9, 16]
        );

        let result = workspace.produce_as(&sum, &Meta::empty()).await.unwrap();
        assert_eq!(result.task_name(), &Name::from("sum"));
        let total = result.get("total").unwrap();
        assert_eq!(total.task(), Some(&Name::from("sum")));
        assert_eq!(*total.value().await.unwrap(), 30);
    }

    #[tokio::test]
    async fn test_produce_is_lazy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut builder = Workspace::builder();
        builder.data(&numbers());
        builder
            .task::<i64>("count")
            .depends_on(Dependency::data())
            .run(move |ctx| {
                let counter = counter.clone();
                Ok(ctx.input::<i64>(0).map(move |v, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(*v)
                }))
            })
            .unwrap();
        let workspace = builder.build().unwrap();

        let result = workspace.produce(&Name::from("count"), &Meta::empty()).await.unwrap();
        assert_eq!(result.len(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_names_task_and_entry() {
        let mut builder = Workspace::builder();
        builder.data(&numbers());
        builder
            .task::<i64>("picky")
            .depends_on(Dependency::data())
            .run(|ctx| {
                Ok(ctx.input::<i64>(0).map(|v, _| {
                    anyhow::ensure!(*v != 3, "three is odd");
                    Ok(*v)
                }))
            })
            .unwrap();
        let workspace = builder.build().unwrap();

        let result = workspace.produce(&Name::from("picky"), &Meta::empty()).await.unwrap();
        let err = result.cast::<i64>().values().await.unwrap_err();
        assert!(err.to_string().contains("task 'picky', entry 'n3'"), "{err}");
        assert_eq!(err.root_cause(), "three is odd");
    }

    #[tokio::test]
    async fn test_root_data_is_empty_name() {
        let mut builder = Workspace::builder();
        builder.data(&numbers());
        let workspace = builder.build().unwrap();

        let data = workspace.produce(&Name::EMPTY, &Meta::empty()).await.unwrap();
        assert!(data.task_name().is_empty());
        assert_eq!(data.len(), 4);
        assert!(data.get("n1").unwrap().task().is_none());
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let workspace = Workspace::builder().build().unwrap();
        assert!(matches!(
            workspace.produce(&Name::from("nope"), &Meta::empty()).await,
            Err(WorkspaceError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_task() {
        let mut builder = Workspace::builder();
        builder.task::<i64>("a").run(|_| Ok(DataTree::empty())).unwrap();
        assert!(matches!(
            builder.task::<i64>("a").run(|_| Ok(DataTree::empty())),
            Err(WorkspaceError::DuplicateTask(_))
        ));
    }

    #[test]
    fn test_declared_cycle_fails_at_build() {
        let mut builder = Workspace::builder();
        builder
            .task::<i64>("a")
            .depends_on(Dependency::named("b"))
            .run(|_| Ok(DataTree::empty()))
            .unwrap();
        builder
            .task::<i64>("b")
            .depends_on(Dependency::named("a"))
            .run(|_| Ok(DataTree::empty()))
            .unwrap();
        assert!(matches!(builder.build(), Err(WorkspaceError::Cycle(_))));
    }

    #[test]
    fn test_missing_dependency_fails_at_build() {
        let mut builder = Workspace::builder();
        builder
            .task::<i64>("a")
            .depends_on(Dependency::named("ghost"))
            .run(|_| Ok(DataTree::empty()))
            .unwrap();
        assert!(matches!(
            builder.build(),
            Err(WorkspaceError::MissingDependency { dependency, .. }) if dependency == Name::from("ghost")
        ));
    }

    struct Recursive;

    #[async_trait]
    impl Task for Recursive {
        fn result_type(&self) -> TypeTag {
            TypeTag::of::<i64>()
        }

        async fn execute(
            &self,
            workspace: &Workspace,
            name: &Name,
            meta: &Meta,
        ) -> Result<DataTree<Unknown>, WorkspaceError> {
            let inner = workspace.produce(name, meta).await?;
            Ok(inner.into_tree())
        }
    }

    #[tokio::test]
    async fn test_runtime_cycle_is_reported() {
        let mut builder = Workspace::builder();
        builder.register("loop", Arc::new(Recursive)).unwrap();
        let workspace = builder.build().unwrap();

        assert!(matches!(
            workspace.produce(&Name::from("loop"), &Meta::empty()).await,
            Err(WorkspaceError::DependencyCycle(name)) if name == Name::from("loop")
        ));
    }

    #[tokio::test]
    async fn test_nested_produce_from_body_is_rejected() {
        let rejected = Arc::new(AtomicUsize::new(0));
        let flag = rejected.clone();

        let mut builder = Workspace::builder();
        builder.task::<i64>("other").run(|_| Ok(DataTree::empty())).unwrap();
        builder
            .task::<i64>("sneaky")
            .run(move |ctx| {
                let attempt = futures::executor::block_on(
                    ctx.workspace().produce(&Name::from("other"), &Meta::empty()),
                );
                if let Err(WorkspaceError::NestedGoal { active, .. }) = attempt {
                    assert_eq!(active, Name::from("sneaky"));
                    flag.fetch_add(1, Ordering::SeqCst);
                }
                Ok(DataTree::empty())
            })
            .unwrap();
        let workspace = builder.build().unwrap();

        workspace.produce(&Name::from("sneaky"), &Meta::empty()).await.unwrap();
        assert_eq!(rejected.load(Ordering::SeqCst), 1);

        // a separate workspace may be used from a body
        let separate = Workspace::builder().build().unwrap();
        let mut builder = Workspace::builder();
        builder
            .task::<i64>("bridge")
            .run(move |_| {
                let data = futures::executor::block_on(separate.produce(&Name::EMPTY, &Meta::empty()));
                assert!(data.is_ok());
                Ok(DataTree::empty())
            })
            .unwrap();
        let workspace = builder.build().unwrap();
        workspace.produce(&Name::from("bridge"), &Meta::empty()).await.unwrap();
    }

    #[tokio::test]
    async fn test_targets_and_dependency_meta() {
        let mut builder = Workspace::builder();
        builder.target("fast", Meta::new(json!({ "scale": { "factor": 3 } })));
        let echo = builder
            .task::<i64>("factor")
            .run(|ctx| {
                let factor = ctx.meta().get_i64("factor").unwrap_or(1);
                Ok(DataTree::single(crate::Data::constant(factor)))
            })
            .unwrap();
        builder
            .task::<i64>("scaled")
            .depends_on(Dependency::task(&echo).meta_key("scale"))
            .run(|ctx| Ok(ctx.input::<i64>(0).map(|v, _| Ok(v * 100))))
            .unwrap();
        let workspace = builder.build().unwrap();

        let result = workspace.produce_target(&Name::from("scaled"), "fast").await.unwrap();
        let value = result.cast::<i64>().get(Name::EMPTY).unwrap().value().await.unwrap();
        assert_eq!(*value, 300);

        assert!(matches!(
            workspace.produce_target(&Name::from("scaled"), "slow").await,
            Err(WorkspaceError::TargetNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dependency_placement() {
        let mut builder = Workspace::builder();
        builder.data(&numbers());
        builder
            .task::<i64>("moved")
            .depends_on(Dependency::data().placement(PlacementRule::all().to("in")))
            .run(|ctx| Ok(ctx.input::<i64>(0)))
            .unwrap();
        let workspace = builder.build().unwrap();

        let found = workspace
            .produce_data(&Name::from("moved"), &Meta::empty(), "in.n2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.task(), Some(&Name::from("moved")));
        assert_eq!(*found.value().await.unwrap().downcast_ref::<i64>().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_result_type_mismatch() {
        let mut builder = Workspace::builder();
        builder.task::<i64>("ints").run(|_| Ok(DataTree::empty())).unwrap();
        let workspace = builder.build().unwrap();

        let wrong = TaskRef::<String>::new(Name::from("ints"));
        assert!(matches!(
            workspace.produce_as(&wrong, &Meta::empty()).await,
            Err(WorkspaceError::ResultType { .. })
        ));
    }

    #[test]
    fn test_mermaid_graph() {
        let mut builder = Workspace::builder();
        square_sum(&mut builder);
        let text = builder.build().unwrap().to_string();
        assert!(text.starts_with("graph LR"));
        assert!(text.contains("[\"square\"]"));
        assert!(text.contains("-- \"i64\" -->"));
    }
}
