use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tracing::{debug, warn};

use super::{EXECUTE_PATH, SHAPE_PATH, TASKS_PATH, decode_all, encode};
use crate::codec::Codec;
use crate::core::{Dynamic, TypeTag, Unknown};
use crate::data::Data;
use crate::envelope::Envelope;
use crate::error::{DataError, RemoteError, WorkspaceError};
use crate::meta::Meta;
use crate::name::Name;
use crate::task::Task;
use crate::tree::DataTree;
use crate::workspace::Workspace;

/// Encoded entries of one remote execution, shared by all entries of the
/// produced tree.
type Snapshot = Shared<BoxFuture<'static, Result<Arc<HashMap<Name, Envelope>>, RemoteError>>>;

/// A task executed by a remote [`WorkspaceServer`](super::WorkspaceServer).
///
/// Executing it only asks the server for the names and metas of the result
/// entries. The values are fetched in one call when the first entry is
/// awaited. Every remote failure, including an unreachable endpoint or a
/// task missing on the server, fails the await of the affected entries. When
/// even the names can't be fetched the tree holds a single root entry which
/// fails with the cause.
pub struct RemoteTask {
    endpoint: String,
    codec: Arc<dyn Codec>,
    descriptor: Meta,
    context: Meta,
    client: reqwest::Client,
}

impl RemoteTask {
    pub fn new(endpoint: impl Into<String>, codec: Arc<dyn Codec>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
            codec,
            descriptor: Meta::empty(),
            context: Meta::empty(),
            client: reqwest::Client::new(),
        }
    }

    pub fn descriptor(mut self, descriptor: Meta) -> Self {
        self.descriptor = descriptor;
        self
    }

    /// Execution context sent along with every request.
    pub fn context(mut self, context: Meta) -> Self {
        self.context = context;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request(&self, name: &Name, meta: &Meta) -> Result<Vec<u8>, RemoteError> {
        let request = Meta::empty()
            .with("task", name.to_string())
            .with("meta", meta.value().clone())
            .with("context", self.context.value().clone());
        encode(&Envelope::meta_only(request))
    }

    /// The deferred value call, run once by whichever entry is awaited first.
    fn snapshot(&self, name: &Name, body: Vec<u8>) -> Snapshot {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let name = name.clone();

        async move {
            debug!(task = %name, %endpoint, "fetching remote values");
            let envelopes = post(&client, &endpoint, EXECUTE_PATH, &name, body).await?;

            let mut entries = HashMap::new();
            // the first envelope is the header
            for envelope in envelopes.into_iter().skip(1) {
                let entry = entry_name(&envelope.meta)?;
                entries.insert(entry, envelope);
            }
            Ok(Arc::new(entries))
        }
        .boxed()
        .shared()
    }
}

#[async_trait]
impl Task for RemoteTask {
    fn result_type(&self) -> TypeTag {
        self.codec.tag()
    }

    fn descriptor(&self) -> Meta {
        self.descriptor.clone()
    }

    fn codec(&self) -> Option<Arc<dyn Codec>> {
        Some(self.codec.clone())
    }

    async fn execute(
        &self,
        _workspace: &Workspace,
        name: &Name,
        meta: &Meta,
    ) -> Result<DataTree<Unknown>, WorkspaceError> {
        debug!(task = %name, endpoint = %self.endpoint, "executing remotely");
        let tag = self.codec.tag();

        let shape = match self.request(name, meta) {
            Ok(body) => post(&self.client, &self.endpoint, SHAPE_PATH, name, body.clone())
                .await
                .and_then(shape)
                .map(|shape| (shape, body)),
            Err(err) => Err(err),
        };

        let ((tree_meta, entries), body) = match shape {
            Ok(shape) => shape,
            Err(err) => {
                warn!(task = %name, endpoint = %self.endpoint, "remote task unavailable: {err}");
                return Ok(DataTree::single(Data::failed(tag, Meta::empty(), DataError::Remote(err))));
            }
        };

        let snapshot = self.snapshot(name, body);
        let mut builder = DataTree::<Unknown>::builder();
        builder.meta(tree_meta);

        for (entry, entry_meta) in entries {
            let snapshot = snapshot.clone();
            let codec = self.codec.clone();
            let key = entry.clone();
            let data = Data::<Unknown>::from_dynamic(tag, entry_meta, Vec::new(), async move {
                let entries = snapshot.await?;
                let envelope = entries
                    .get(&key)
                    .ok_or_else(|| RemoteError::Protocol(format!("entry '{key}' is missing from the response")))?;
                decode_entry(codec.as_ref(), envelope)
            });
            builder.put(entry, data);
        }

        Ok(builder.build())
    }
}

async fn post(
    client: &reqwest::Client,
    endpoint: &str,
    path: &str,
    task: &Name,
    body: Vec<u8>,
) -> Result<Vec<Envelope>, RemoteError> {
    let unreachable = |err: reqwest::Error| RemoteError::Unreachable(endpoint.to_owned(), err.to_string());

    let response = client
        .post(format!("{endpoint}{path}"))
        .body(body)
        .send()
        .await
        .map_err(unreachable)?;

    let status = response.status();
    let bytes = response.bytes().await.map_err(unreachable)?;

    match status.as_u16() {
        200 => decode_all(&bytes),
        404 => Err(RemoteError::TaskNotFound(task.clone())),
        422 => Err(RemoteError::Serializer(task.clone())),
        code => Err(RemoteError::Protocol(format!(
            "status {code}: {}",
            error_message(&bytes)
        ))),
    }
}

/// Tree meta and the `(name, meta)` of every entry, read from a shape reply.
fn shape(envelopes: Vec<Envelope>) -> Result<(Meta, Vec<(Name, Meta)>), RemoteError> {
    let header = envelopes
        .into_iter()
        .next()
        .ok_or_else(|| RemoteError::Protocol("empty response".into()))?;

    let entries = match header.meta.get_value("entries") {
        Some(Value::Array(entries)) => entries
            .iter()
            .map(|entry| {
                let entry = Meta::new(entry.clone());
                let meta = entry.get("meta").unwrap_or_default();
                Ok((entry_name(&entry)?, meta))
            })
            .collect::<Result<Vec<_>, RemoteError>>()?,
        _ => return Err(RemoteError::Protocol("shape without entries".into())),
    };

    Ok((header.meta.get("tree").unwrap_or_default(), entries))
}

fn entry_name(meta: &Meta) -> Result<Name, RemoteError> {
    let name = meta
        .get_str("name")
        .ok_or_else(|| RemoteError::Protocol("entry without a name".into()))?;
    Name::parse(name).map_err(|err| RemoteError::Protocol(err.to_string()))
}

fn decode_entry(codec: &dyn Codec, envelope: &Envelope) -> Result<Dynamic, DataError> {
    if let Some(message) = envelope.meta.get_str("error") {
        return Err(RemoteError::Entry(message.to_owned()).into());
    }

    let bytes = envelope
        .data
        .as_deref()
        .ok_or_else(|| RemoteError::Protocol("entry without a value".into()))?;

    codec
        .decode(bytes)
        .map_err(|err| RemoteError::Protocol(format!("undecodable value: {err:#}")).into())
}

/// Tasks advertised by a remote workspace, with the names of their value
/// types.
pub async fn remote_tasks(endpoint: &str) -> Result<BTreeMap<Name, String>, RemoteError> {
    let endpoint = endpoint.trim_end_matches('/');
    let unreachable = |err: reqwest::Error| RemoteError::Unreachable(endpoint.to_owned(), err.to_string());

    let response = reqwest::get(format!("{endpoint}{TASKS_PATH}")).await.map_err(unreachable)?;
    let bytes = response.bytes().await.map_err(unreachable)?;

    let listing = decode_all(&bytes)?
        .into_iter()
        .next()
        .ok_or_else(|| RemoteError::Protocol("empty response".into()))?;

    listing
        .meta
        .get("tasks")
        .unwrap_or_default()
        .items()
        .into_iter()
        .map(|(task, info)| -> Result<(Name, String), RemoteError> {
            let name = Name::parse(&task).map_err(|err| RemoteError::Protocol(err.to_string()))?;
            let type_name = info.get_str("type").unwrap_or_default().to_owned();
            Ok((name, type_name))
        })
        .collect()
}

fn error_message(bytes: &[u8]) -> String {
    decode_all(bytes)
        .ok()
        .and_then(|envelopes| envelopes.into_iter().next())
        .and_then(|envelope| envelope.meta.get_str("message").map(str::to_owned))
        .unwrap_or_else(|| String::from_utf8_lossy(bytes).into_owned())
}
