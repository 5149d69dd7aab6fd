//! Units of work registered in a [`Workspace`].
//!
//! A task turns a meta into a tree. Tasks built with
//! [`WorkspaceBuilder::task`] declare their inputs up front as
//! [`Dependency`] values, the workspace produces those inputs first and hands
//! them to the task body through a [`TaskContext`]. The body itself is
//! synchronous and should only wire lazy data, the actual computations run
//! when the entries are awaited.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::{CborCodec, Codec};
use crate::core::{Payload, TypeTag, Unknown};
use crate::error::{TreeError, WorkspaceError};
use crate::goal;
use crate::meta::Meta;
use crate::name::Name;
use crate::placement::Placement;
use crate::tree::DataTree;
use crate::workspace::{Workspace, WorkspaceBuilder};

/// Type-erased task, the interface the workspace executes.
#[async_trait]
pub trait Task: Send + Sync {
    /// Value type of the produced entries.
    fn result_type(&self) -> TypeTag;

    /// Static description of the task.
    fn descriptor(&self) -> Meta {
        Meta::empty()
    }

    /// Tasks which are produced before this one.
    fn dependencies(&self) -> Vec<Name> {
        Vec::new()
    }

    /// Serializer for the produced values, required to run the task remotely.
    fn codec(&self) -> Option<Arc<dyn Codec>> {
        None
    }

    /// Build the result tree for `meta`. This only wires lazy data, nothing is
    /// computed until the entries are awaited.
    async fn execute(
        &self,
        workspace: &Workspace,
        name: &Name,
        meta: &Meta,
    ) -> Result<DataTree<Unknown>, WorkspaceError>;
}

/// Typed handle to a registered task.
pub struct TaskRef<T: ?Sized> {
    name: Name,
    _phantom: PhantomData<fn() -> Arc<T>>,
}

impl<T: ?Sized> TaskRef<T> {
    pub(crate) fn new(name: Name) -> Self {
        Self {
            name,
            _phantom: PhantomData,
        }
    }

    pub fn name(&self) -> &Name {
        &self.name
    }
}

impl<T: ?Sized> Clone for TaskRef<T> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl<T: ?Sized> fmt::Debug for TaskRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskRef({})", self.name)
    }
}

#[derive(Clone)]
enum Source {
    Data,
    Task(Name),
}

#[derive(Clone)]
enum MetaRule {
    Inherit,
    Fixed(Meta),
    Key(Name),
    Map(Arc<dyn Fn(&Meta) -> Meta + Send + Sync>),
}

/// An input of a task: the workspace data or the result of another task,
/// produced with a meta derived from the meta of the dependent task.
#[derive(Clone)]
pub struct Dependency {
    source: Source,
    meta: MetaRule,
    placement: Option<Arc<dyn Placement>>,
}

impl Dependency {
    /// The root data of the workspace.
    pub fn data() -> Self {
        Self {
            source: Source::Data,
            meta: MetaRule::Inherit,
            placement: None,
        }
    }

    pub fn task<T: ?Sized>(task: &TaskRef<T>) -> Self {
        Self::named(task.name().clone())
    }

    pub fn named(task: impl Into<Name>) -> Self {
        Self {
            source: Source::Task(task.into()),
            meta: MetaRule::Inherit,
            placement: None,
        }
    }

    /// Produce the dependency with a fixed meta.
    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = MetaRule::Fixed(meta);
        self
    }

    /// Produce the dependency with an item of the dependent meta, an empty
    /// meta when the item is missing.
    pub fn meta_key(mut self, key: impl Into<Name>) -> Self {
        self.meta = MetaRule::Key(key.into());
        self
    }

    pub fn meta_with<F>(mut self, derive: F) -> Self
    where
        F: Fn(&Meta) -> Meta + Send + Sync + 'static,
    {
        self.meta = MetaRule::Map(Arc::new(derive));
        self
    }

    /// Rearrange the dependency tree before the task sees it.
    pub fn placement(mut self, placement: impl Placement + 'static) -> Self {
        self.placement = Some(Arc::new(placement));
        self
    }

    /// Name of the task this dependency refers to, `None` for the root data.
    pub fn task_name(&self) -> Option<&Name> {
        match &self.source {
            Source::Data => None,
            Source::Task(name) => Some(name),
        }
    }

    fn derive_meta(&self, meta: &Meta) -> Meta {
        match &self.meta {
            MetaRule::Inherit => meta.clone(),
            MetaRule::Fixed(fixed) => fixed.clone(),
            MetaRule::Key(key) => meta.get(key).unwrap_or_default(),
            MetaRule::Map(derive) => derive(meta),
        }
    }

    pub(crate) async fn resolve(
        &self,
        workspace: &Workspace,
        meta: &Meta,
    ) -> Result<DataTree<Unknown>, WorkspaceError> {
        let tree = match &self.source {
            Source::Data => workspace.data().into_tree(),
            Source::Task(task) => {
                let meta = self.derive_meta(meta);
                workspace.produce(task, &meta).await?.into_tree()
            }
        };

        match &self.placement {
            Some(placement) => Ok(tree.rearrange_shared(placement.clone())?),
            None => Ok(tree),
        }
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Source::Data => write!(f, "Dependency(data)"),
            Source::Task(name) => write!(f, "Dependency({name})"),
        }
    }
}

/// What a task body gets to see.
pub struct TaskContext<'a> {
    workspace: &'a Workspace,
    name: &'a Name,
    meta: &'a Meta,
    inputs: Vec<DataTree<Unknown>>,
}

impl<'a> TaskContext<'a> {
    pub fn name(&self) -> &Name {
        self.name
    }

    pub fn meta(&self) -> &Meta {
        self.meta
    }

    pub fn workspace(&self) -> &Workspace {
        self.workspace
    }

    /// The resolved tree of the `index`-th dependency, narrowed to `T`.
    /// Out of range indices give an empty tree.
    pub fn input<T: Payload + ?Sized>(&self, index: usize) -> DataTree<T> {
        match self.inputs.get(index) {
            Some(tree) => tree.filter_by_type::<T>(),
            None => DataTree::empty(),
        }
    }

    /// All dependency trees merged into one, narrowed to `T`.
    pub fn inputs<T: Payload + ?Sized>(&self) -> Result<DataTree<T>, TreeError> {
        let mut builder = DataTree::<T>::builder();
        for tree in &self.inputs {
            builder.merge(&tree.filter_by_type::<T>())?;
        }
        Ok(builder.build())
    }
}

type Body<T> = dyn Fn(&TaskContext<'_>) -> anyhow::Result<DataTree<T>> + Send + Sync;

/// A task defined in process by a body closure.
pub(crate) struct LocalTask<T: ?Sized> {
    descriptor: Meta,
    dependencies: Vec<Dependency>,
    codec: Option<Arc<dyn Codec>>,
    body: Arc<Body<T>>,
}

#[async_trait]
impl<T: Payload + ?Sized> Task for LocalTask<T> {
    fn result_type(&self) -> TypeTag {
        T::tag().unwrap_or_else(TypeTag::of::<Unknown>)
    }

    fn descriptor(&self) -> Meta {
        self.descriptor.clone()
    }

    fn dependencies(&self) -> Vec<Name> {
        self.dependencies
            .iter()
            .filter_map(|dependency| dependency.task_name().cloned())
            .collect()
    }

    fn codec(&self) -> Option<Arc<dyn Codec>> {
        self.codec.clone()
    }

    async fn execute(
        &self,
        workspace: &Workspace,
        name: &Name,
        meta: &Meta,
    ) -> Result<DataTree<Unknown>, WorkspaceError> {
        let mut inputs = Vec::with_capacity(self.dependencies.len());
        for dependency in &self.dependencies {
            inputs.push(dependency.resolve(workspace, meta).await?);
        }

        let context = TaskContext {
            workspace,
            name,
            meta,
            inputs,
        };

        let tree = goal::run_body(workspace.id(), name, || (self.body)(&context)).map_err(|source| {
            WorkspaceError::Body {
                task: name.clone(),
                source,
            }
        })?;

        Ok(tree.erase())
    }
}

/// Registers a typed task, created by [`WorkspaceBuilder::task`].
pub struct TaskBuilder<'a, T: ?Sized> {
    workspace: &'a mut WorkspaceBuilder,
    name: Name,
    descriptor: Meta,
    dependencies: Vec<Dependency>,
    codec: Option<Arc<dyn Codec>>,
    _phantom: PhantomData<fn() -> Arc<T>>,
}

impl<'a, T: Payload + ?Sized> TaskBuilder<'a, T> {
    pub(crate) fn new(workspace: &'a mut WorkspaceBuilder, name: Name) -> Self {
        Self {
            workspace,
            name,
            descriptor: Meta::empty(),
            dependencies: Vec::new(),
            codec: None,
            _phantom: PhantomData,
        }
    }

    pub fn descriptor(mut self, descriptor: Meta) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Register the task with its body.
    pub fn run<F>(self, body: F) -> Result<TaskRef<T>, WorkspaceError>
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<DataTree<T>> + Send + Sync + 'static,
    {
        let task = LocalTask {
            descriptor: self.descriptor,
            dependencies: self.dependencies,
            codec: self.codec,
            body: Arc::new(body),
        };

        self.workspace.insert_task(self.name.clone(), Arc::new(task))?;
        Ok(TaskRef::new(self.name))
    }
}

impl<T> TaskBuilder<'_, T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Use CBOR to persist and transfer the produced values.
    pub fn serialized(self) -> Self {
        self.codec(Arc::new(CborCodec::<T>::new()))
    }
}

/// A bundle of tasks registered at once with [`WorkspaceBuilder::gather`].
pub trait TaskProvider {
    fn tasks(&self) -> BTreeMap<Name, Arc<dyn Task>>;
}

impl TaskProvider for BTreeMap<Name, Arc<dyn Task>> {
    fn tasks(&self) -> BTreeMap<Name, Arc<dyn Task>> {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_dependency_meta_rules() {
        let meta = Meta::new(json!({ "a": { "b": 1 }, "c": 2 }));

        assert_eq!(Dependency::named("t").derive_meta(&meta), meta);
        assert_eq!(
            Dependency::named("t").meta_key("a").derive_meta(&meta),
            Meta::new(json!({ "b": 1 }))
        );
        assert!(Dependency::named("t").meta_key("zzz").derive_meta(&meta).is_empty());
        assert_eq!(
            Dependency::named("t")
                .meta(Meta::empty().with("x", 1))
                .derive_meta(&meta),
            Meta::empty().with("x", 1)
        );
        assert_eq!(
            Dependency::named("t")
                .meta_with(|meta| meta.merge(&Meta::empty().with("c", 3)))
                .derive_meta(&meta)
                .get_i64("c"),
            Some(3)
        );
    }

    #[test]
    fn test_dependency_task_name() {
        assert_eq!(Dependency::data().task_name(), None);
        let task = TaskRef::<i64>::new(Name::from("square"));
        assert_eq!(Dependency::task(&task).task_name(), Some(&Name::from("square")));
    }
}
