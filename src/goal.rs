//! Bookkeeping of the tasks being produced on the current async task.
//!
//! Two scopes are tracked per workspace. The goal chain lists the task
//! invocations currently being produced, a repeated invocation means a
//! dependency cycle. The body marker is set while a task body runs, the
//! body must declare its inputs instead of producing other tasks directly.

use std::future::Future;

use crate::cache::Fingerprint;
use crate::error::WorkspaceError;
use crate::name::Name;

tokio::task_local! {
    static CHAIN: GoalChain;
    static BODY: BodyMarker;
}

#[derive(Clone, Debug)]
pub(crate) struct GoalChain {
    workspace: u64,
    goals: Vec<(Name, Fingerprint)>,
}

impl GoalChain {
    /// The chain of the enclosing produce call on `workspace`, or an empty one.
    pub(crate) fn current(workspace: u64) -> Self {
        CHAIN
            .try_with(|chain| chain.clone())
            .ok()
            .filter(|chain| chain.workspace == workspace)
            .unwrap_or(GoalChain {
                workspace,
                goals: Vec::new(),
            })
    }

    /// Extend the chain with a new goal, failing if the goal is already
    /// being produced.
    pub(crate) fn push(mut self, task: &Name, fingerprint: Fingerprint) -> Result<Self, WorkspaceError> {
        if self.goals.iter().any(|(_, known)| *known == fingerprint) {
            let path = self
                .goals
                .iter()
                .map(|(name, _)| name.to_string())
                .chain(std::iter::once(task.to_string()))
                .collect::<Vec<_>>()
                .join(" -> ");
            tracing::error!(%path, "dependency cycle");
            return Err(WorkspaceError::DependencyCycle(task.clone()));
        }

        self.goals.push((task.clone(), fingerprint));
        Ok(self)
    }

    pub(crate) fn depth(&self) -> usize {
        self.goals.len()
    }

    /// Run `future` with this chain as the current one.
    pub(crate) async fn scope<F: Future>(self, future: F) -> F::Output {
        CHAIN.scope(self, future).await
    }
}

#[derive(Clone, Debug)]
struct BodyMarker {
    workspace: u64,
    task: Name,
}

/// Fail if called from inside a task body running on `workspace`.
pub(crate) fn check_not_in_body(workspace: u64, requested: &Name) -> Result<(), WorkspaceError> {
    let active = BODY
        .try_with(|marker| (marker.workspace == workspace).then(|| marker.task.clone()))
        .ok()
        .flatten();

    match active {
        Some(active) => Err(WorkspaceError::NestedGoal {
            active,
            requested: requested.clone(),
        }),
        None => Ok(()),
    }
}

/// Run a task body, marking it as active for `workspace`.
pub(crate) fn run_body<R>(workspace: u64, task: &Name, body: impl FnOnce() -> R) -> R {
    let marker = BodyMarker {
        workspace,
        task: task.clone(),
    };
    BODY.sync_scope(marker, body)
}
