use std::sync::Arc;

use thiserror::Error;

use crate::core::TypeTag;
use crate::name::Name;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("invalid name '{0}': {1}")]
    Syntax(Box<str>, &'static str),

    #[error("'**' may only be the first or the last token of a pattern: '{0}'")]
    Wildcard(String),
}

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("entry '{0}' already exists in the tree")]
    NameConflict(Name),

    #[error("invalid placement pattern:\n{0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Glob(#[from] glob::PatternError),

    #[error(transparent)]
    Name(#[from] NameError),
}

/// Failure observed when awaiting a single [`Data`](crate::Data).
///
/// Values are memoized together with their failures, so this error is cheap
/// to clone and every waiter observes the same one.
#[derive(Debug, Error, Clone)]
pub enum DataError {
    #[error("computation failed: {0:#}")]
    Computation(Arc<anyhow::Error>),

    #[error("value of type {found} can't be read as {expected}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("cached entry '{name}' holds {stored}, requested {requested}")]
    CacheTypeMismatch {
        name: Name,
        stored: TypeTag,
        requested: TypeTag,
    },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Several inputs of an action were placed under this output name.
    #[error("entries {inputs:?} collide on the output name '{name}'")]
    NameConflict { name: Name, inputs: Vec<Name> },

    #[error("{}: {source}", location(.task, .name))]
    Located {
        task: Name,
        name: Name,
        #[source]
        source: Box<DataError>,
    },
}

fn location(task: &Name, name: &Name) -> String {
    if task.is_empty() {
        format!("entry '{name}'")
    } else {
        format!("task '{task}', entry '{name}'")
    }
}

impl DataError {
    /// Wrap an error raised by user code. Errors which already are a
    /// [`DataError`] (for example a failed upstream await propagated with
    /// `?`) are kept as they are.
    pub fn computation(err: impl Into<anyhow::Error>) -> Self {
        match err.into().downcast::<DataError>() {
            Ok(err) => err,
            Err(err) => DataError::Computation(Arc::new(err)),
        }
    }

    pub(crate) fn located(self, task: Option<&Name>, name: &Name) -> Self {
        match self {
            // the innermost location is the one that failed
            located @ DataError::Located { .. } => located,
            other => DataError::Located {
                task: task.cloned().unwrap_or_default(),
                name: name.clone(),
                source: Box::new(other),
            },
        }
    }

    /// The error without the location decorations.
    pub fn innermost(&self) -> &DataError {
        match self {
            DataError::Located { source, .. } => source.innermost(),
            other => other,
        }
    }

    /// Message of the deepest cause, useful to tell which stage of a pipeline
    /// broke.
    pub fn root_cause(&self) -> String {
        match self.innermost() {
            DataError::Computation(err) => err.root_cause().to_string(),
            other => other.to_string(),
        }
    }
}

impl From<anyhow::Error> for DataError {
    fn from(err: anyhow::Error) -> Self {
        DataError::computation(err)
    }
}

/// Failures of the remote execution extension.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("endpoint '{0}' is unreachable: {1}")]
    Unreachable(String, String),

    #[error("task '{0}' is not available on the remote workspace")]
    TaskNotFound(Name),

    #[error("no serializer for values of task '{0}'")]
    Serializer(Name),

    #[error("remote entry failed: {0}")]
    Entry(String),

    #[error("malformed remote response: {0}")]
    Protocol(String),
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("task '{0}' is not registered")]
    TaskNotFound(Name),

    #[error("task '{0}' is already registered")]
    DuplicateTask(Name),

    #[error("target '{0}' is not defined")]
    TargetNotFound(String),

    #[error("task '{task}' depends on unregistered task '{dependency}'")]
    MissingDependency { task: Name, dependency: Name },

    #[error("task '{0}' is part of a dependency cycle")]
    Cycle(Name),

    #[error("task '{0}' was requested again while it is being produced")]
    DependencyCycle(Name),

    #[error(
        "task '{requested}' was requested from inside the body of '{active}', declare it as a dependency instead"
    )]
    NestedGoal { active: Name, requested: Name },

    #[error("task '{task}' produces {found}, requested {expected}")]
    ResultType {
        task: Name,
        expected: TypeTag,
        found: TypeTag,
    },

    #[error("task '{task}' failed to build its result:\n{source}")]
    Body {
        task: Name,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed envelope header: {0}")]
    Header(String),

    #[error("unsupported meta format '{0}'")]
    MetaFormat(String),

    #[error("malformed envelope meta:\n{0}")]
    Meta(#[from] serde_json::Error),

    #[error("envelope is truncated, expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
}

/// Internal failures of the cache layer. These never reach the caller, a
/// broken cache entry is treated as a miss.
#[derive(Debug, Error)]
pub(crate) enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("corrupted cache entry:\n{0}")]
    Corruption(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}
