use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use console::style;
use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{EXECUTE_PATH, SHAPE_PATH, TASKS_PATH, decode_all, encode};
use crate::codec::Codec;
use crate::core::Unknown;
use crate::data::NamedData;
use crate::envelope::Envelope;
use crate::error::WorkspaceError;
use crate::meta::Meta;
use crate::name::Name;
use crate::workspace::{TaskResult, Workspace};

/// Serves the tasks of a workspace which declare a codec.
#[derive(Clone, Debug)]
pub struct WorkspaceServer {
    workspace: Workspace,
}

impl WorkspaceServer {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(TASKS_PATH, get(list_tasks))
            .route(SHAPE_PATH, post(shape))
            .route(EXECUTE_PATH, post(execute))
            .with_state(self.workspace.clone())
    }

    /// Bind `address` and serve in a background task. Returns the bound
    /// address, binding port 0 picks a free port.
    pub async fn serve(self, address: impl ToSocketAddrs) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(address).await?;
        let address = listener.local_addr()?;
        let router = self.router();

        info!(url = %style(format!("http://{address}/")).yellow(), "serving workspace");

        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                error!("workspace server failed: {err}");
            }
        });

        Ok((address, handle))
    }
}

async fn list_tasks(State(workspace): State<Workspace>) -> Response {
    let mut tasks = Map::new();
    for (name, task) in workspace.tasks() {
        if let Some(codec) = task.codec() {
            let mut info = Map::new();
            info.insert("type".into(), codec.tag().name().into());
            info.insert("descriptor".into(), task.descriptor().into_value());
            tasks.insert(name.to_string(), Value::Object(info));
        }
    }

    let meta = Meta::empty().with("tasks", Value::Object(tasks));
    reply(StatusCode::OK, vec![Envelope::meta_only(meta)])
}

/// Names and metas of the produced entries, nothing is awaited.
async fn shape(State(workspace): State<Workspace>, body: Bytes) -> Response {
    let (task, result, _) = match produce(&workspace, &body).await {
        Ok(produced) => produced,
        Err(response) => return response,
    };

    let entries: Vec<Value> = result
        .items()
        .iter()
        .map(|item| {
            Meta::empty()
                .with("name", item.name().to_string())
                .with("meta", item.meta().value().clone())
                .into_value()
        })
        .collect();

    let header = Meta::empty()
        .with("task", task.to_string())
        .with("entries", entries)
        .with("tree", result.meta().into_value());

    reply(StatusCode::OK, vec![Envelope::meta_only(header)])
}

async fn execute(State(workspace): State<Workspace>, body: Bytes) -> Response {
    let (task, result, codec) = match produce(&workspace, &body).await {
        Ok(produced) => produced,
        Err(response) => return response,
    };

    let items = result.items();
    let header = Meta::empty()
        .with("task", task.to_string())
        .with("entries", items.len())
        .with("tree", result.meta().into_value());

    let mut envelopes = vec![Envelope::meta_only(header)];
    envelopes.extend(join_all(items.iter().map(|item| entry(item, codec.clone()))).await);

    reply(StatusCode::OK, envelopes)
}

/// Decode a request and produce the task it names. The `context` of the
/// request is logged, it doesn't take part in the execution.
async fn produce(
    workspace: &Workspace,
    body: &[u8],
) -> Result<(Name, TaskResult<Unknown>, Arc<dyn Codec>), Response> {
    let request = match decode_all(body).map(|envelopes| envelopes.into_iter().next()) {
        Ok(Some(request)) => request.meta,
        Ok(None) => return Err(failure(StatusCode::BAD_REQUEST, "empty request")),
        Err(err) => return Err(failure(StatusCode::BAD_REQUEST, &err.to_string())),
    };

    let task = match request.get_str("task").map(Name::parse) {
        Some(Ok(task)) => task,
        Some(Err(err)) => return Err(failure(StatusCode::BAD_REQUEST, &err.to_string())),
        None => return Err(failure(StatusCode::BAD_REQUEST, "request without a task")),
    };
    let meta = request.get("meta").unwrap_or_default();
    let context = request.get("context").unwrap_or_default();

    let Some(codec) = workspace.task(&task).map(|task| task.codec()) else {
        return Err(failure(StatusCode::NOT_FOUND, &format!("task '{task}' is not registered")));
    };
    let Some(codec) = codec else {
        return Err(failure(
            StatusCode::UNPROCESSABLE_ENTITY,
            &format!("task '{task}' has no serializer"),
        ));
    };

    debug!(%task, %meta, %context, "remote request");

    match workspace.produce(&task, &meta).await {
        Ok(result) => Ok((task, result, codec)),
        Err(err @ WorkspaceError::TaskNotFound(_)) => Err(failure(StatusCode::NOT_FOUND, &err.to_string())),
        Err(err) => Err(failure(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())),
    }
}

/// Await one entry and encode it, failures become an `error` envelope.
async fn entry(item: &NamedData<Unknown>, codec: Arc<dyn Codec>) -> Envelope {
    let meta = Meta::empty()
        .with("name", item.name().to_string())
        .with("meta", item.meta().value().clone());

    let encoded = match item.value().await {
        Ok(value) => codec.encode(&value).map_err(|err| format!("{err:#}")),
        Err(err) => Err(err.to_string()),
    };

    match encoded {
        Ok(bytes) => Envelope::new(meta, bytes),
        Err(message) => {
            debug!(name = %item.name(), "entry failed: {message}");
            Envelope::meta_only(meta.with("error", message))
        }
    }
}

fn failure(status: StatusCode, message: &str) -> Response {
    let meta = Meta::empty().with("message", message);
    reply(status, vec![Envelope::meta_only(meta)])
}

fn reply(status: StatusCode, envelopes: Vec<Envelope>) -> Response {
    let mut body = Vec::new();
    for envelope in &envelopes {
        match encode(envelope) {
            Ok(bytes) => body.extend(bytes),
            Err(err) => {
                error!("failed to encode response: {err}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }
    (status, body).into_response()
}
