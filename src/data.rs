//! Lazy, memoized values.
//!
//! A [`Data`] pairs a value type, a meta and the list of data it was derived
//! from with a computation which runs at most once. The first await starts
//! the computation, every other await, concurrent or later, observes the same
//! outcome. Dropping a waiting future never cancels the work for the other
//! waiters.

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::core::{Dynamic, Payload, TypeTag, Unknown};
use crate::error::DataError;
use crate::meta::Meta;
use crate::name::Name;
use crate::utils::panic_message;

type Cell = Shared<BoxFuture<'static, Result<Dynamic, DataError>>>;

const UNREQUESTED: u8 = 0;
const PENDING: u8 = 1;
const RESOLVED: u8 = 2;
const FAILED: u8 = 3;

/// Observable lifecycle of a [`Data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataState {
    /// Nobody awaited the value yet.
    Unrequested,
    /// The computation is running.
    Pending,
    Resolved,
    Failed,
}

struct Inner {
    tag: TypeTag,
    meta: Meta,
    dependencies: Vec<Data<Unknown>>,
    state: Arc<AtomicU8>,
    cell: Cell,
}

/// A lazy value of type `T`.
///
/// Cloning is cheap, clones share the memoized outcome. `Data<Unknown>` is
/// the type-erased form used by trees and workspaces.
pub struct Data<T: ?Sized> {
    inner: Arc<Inner>,
    _phantom: PhantomData<fn() -> Arc<T>>,
}

impl<T: ?Sized> Clone for Data<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> Data<T> {
    /// A lazy value computed by `producer` on the first await.
    pub fn new<F, Fut>(meta: Meta, dependencies: Vec<Data<Unknown>>, producer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::from_result(meta, dependencies, async move {
            producer().await.map_err(DataError::computation)
        })
    }

    /// [`Data::new`] without meta and dependencies.
    pub fn lazy<F, Fut>(producer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::new(Meta::empty(), Vec::new(), producer)
    }

    /// An already resolved value without dependencies.
    pub fn constant(value: T) -> Self {
        Self::constant_with_meta(value, Meta::empty())
    }

    pub fn constant_with_meta(value: T, meta: Meta) -> Self {
        let value: Dynamic = Arc::new(value);
        Data::from_cell(
            TypeTag::of::<T>(),
            meta,
            Vec::new(),
            RESOLVED,
            futures::future::ready(Ok(value)).boxed().shared(),
        )
    }

    pub(crate) fn from_result<Fut>(
        meta: Meta,
        dependencies: Vec<Data<Unknown>>,
        future: Fut,
    ) -> Self
    where
        Fut: Future<Output = Result<T, DataError>> + Send + 'static,
    {
        let future = async move { future.await.map(|value| Arc::new(value) as Dynamic) };
        Data::from_dynamic(TypeTag::of::<T>(), meta, dependencies, future)
    }
}

impl<T: ?Sized> Data<T> {
    /// Build a data from an erased computation. Panics inside the computation
    /// are turned into a failed outcome.
    pub(crate) fn from_dynamic<Fut>(
        tag: TypeTag,
        meta: Meta,
        dependencies: Vec<Data<Unknown>>,
        future: Fut,
    ) -> Self
    where
        Fut: Future<Output = Result<Dynamic, DataError>> + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(UNREQUESTED));
        let flag = state.clone();

        let cell = async move {
            flag.store(PENDING, Ordering::Release);

            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(DataError::computation(anyhow::anyhow!(
                    "panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };

            let done = if outcome.is_ok() { RESOLVED } else { FAILED };
            flag.store(done, Ordering::Release);
            outcome
        }
        .boxed()
        .shared();

        Self {
            inner: Arc::new(Inner {
                tag,
                meta,
                dependencies,
                state,
                cell,
            }),
            _phantom: PhantomData,
        }
    }

    fn from_cell(
        tag: TypeTag,
        meta: Meta,
        dependencies: Vec<Data<Unknown>>,
        state: u8,
        cell: Cell,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tag,
                meta,
                dependencies,
                state: Arc::new(AtomicU8::new(state)),
                cell,
            }),
            _phantom: PhantomData,
        }
    }

    /// A resolved data holding an erased value of the given tag.
    pub(crate) fn resolved(tag: TypeTag, meta: Meta, value: Dynamic) -> Self {
        let cell = futures::future::ready(Ok(value)).boxed().shared();
        Data::from_cell(tag, meta, Vec::new(), RESOLVED, cell)
    }

    /// A data whose await always fails with `error`.
    pub(crate) fn failed(tag: TypeTag, meta: Meta, error: DataError) -> Self {
        let cell = futures::future::ready(Err(error)).boxed().shared();
        Data::from_cell(tag, meta, Vec::new(), FAILED, cell)
    }

    pub fn type_tag(&self) -> TypeTag {
        self.inner.tag
    }

    pub fn meta(&self) -> &Meta {
        &self.inner.meta
    }

    /// The data this one was derived from.
    pub fn dependencies(&self) -> &[Data<Unknown>] {
        &self.inner.dependencies
    }

    pub fn state(&self) -> DataState {
        match self.inner.state.load(Ordering::Acquire) {
            UNREQUESTED => DataState::Unrequested,
            PENDING => DataState::Pending,
            RESOLVED => DataState::Resolved,
            _ => DataState::Failed,
        }
    }

    /// Whether both handles share the same computation.
    pub fn ptr_eq(&self, other: &Data<impl ?Sized>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub fn erase(&self) -> Data<Unknown> {
        Data {
            inner: self.inner.clone(),
            _phantom: PhantomData,
        }
    }

    /// A typed view of this data, `None` when the value type doesn't match.
    pub fn try_cast<R: Payload + ?Sized>(&self) -> Option<Data<R>> {
        R::accepts(&self.inner.tag).then(|| Data {
            inner: self.inner.clone(),
            _phantom: PhantomData,
        })
    }

    /// Await the erased value.
    pub(crate) async fn dynamic(&self) -> Result<Dynamic, DataError> {
        self.inner.cell.clone().await
    }
}

impl<T: Payload + ?Sized> Data<T> {
    /// Await the value, starting the computation if nobody did yet.
    pub async fn value(&self) -> Result<Arc<T>, DataError> {
        let value = self.dynamic().await?;
        T::from_dynamic(value).ok_or(DataError::TypeMismatch {
            expected: type_name::<T>(),
            found: self.inner.tag.name(),
        })
    }

    /// Derive a new lazy data from this one.
    pub fn map<R, F>(&self, body: F) -> Data<R>
    where
        R: Send + Sync + 'static,
        F: FnOnce(&T) -> anyhow::Result<R> + Send + 'static,
    {
        let input = self.clone();
        Data::from_result(self.meta().clone(), vec![self.erase()], async move {
            let value = input.value().await?;
            body(&*value).map_err(DataError::computation)
        })
    }
}

impl<T: ?Sized> fmt::Debug for Data<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data")
            .field("type", &self.inner.tag)
            .field("meta", &self.inner.meta)
            .field("state", &self.state())
            .field("dependencies", &self.inner.dependencies.len())
            .finish()
    }
}

/// A [`Data`] together with its name in a tree and, when it came out of a
/// workspace, the task which produced it.
pub struct NamedData<T: ?Sized> {
    name: Name,
    data: Data<T>,
    task: Option<Name>,
}

impl<T: ?Sized> Clone for NamedData<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            data: self.data.clone(),
            task: self.task.clone(),
        }
    }
}

impl<T: ?Sized> NamedData<T> {
    pub fn new(name: Name, data: Data<T>) -> Self {
        Self {
            name,
            data,
            task: None,
        }
    }

    pub(crate) fn with_task(mut self, task: Name) -> Self {
        self.task = Some(task);
        self
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn data(&self) -> &Data<T> {
        &self.data
    }

    pub fn into_data(self) -> Data<T> {
        self.data
    }

    /// The task which produced this entry, if any.
    pub fn task(&self) -> Option<&Name> {
        self.task.as_ref()
    }
}

impl<T: Payload + ?Sized> NamedData<T> {
    /// Await the value, failures carry the entry name and the task.
    pub async fn value(&self) -> Result<Arc<T>, DataError> {
        self.data
            .value()
            .await
            .map_err(|err| err.located(self.task.as_ref(), &self.name))
    }
}

impl<T: ?Sized> Deref for NamedData<T> {
    type Target = Data<T>;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl<T: ?Sized> fmt::Debug for NamedData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedData")
            .field("name", &self.name)
            .field("task", &self.task)
            .field("data", &self.data)
            .finish()
    }
}
