//! Running tasks of one workspace on another, over HTTP.
//!
//! A [`WorkspaceServer`] exposes the tasks of a workspace which declare a
//! codec. A [`RemoteTask`] stands in for such a task on the client side.
//! Producing it only fetches the names of the result entries. The first
//! await of an entry makes the server compute all entries and send the
//! encoded values back. All bodies are tagged envelopes.
//!
//! * `GET /tasks`, the envelope meta lists the advertised tasks with the name
//!   of their value type.
//! * `POST /shape`, the request meta carries `task`, `meta` and `context`.
//!   The response meta lists the `entries` with their `name` and `meta`.
//! * `POST /execute`, same request. The response is a header envelope
//!   followed by one envelope per entry, holding either the encoded value or
//!   an `error` message.
//!
//! The `context` is advisory: the server logs it, tasks never see it.

mod client;
mod server;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

pub use self::client::{RemoteTask, remote_tasks};
pub use self::server::WorkspaceServer;
use crate::envelope::{self, Envelope};
use crate::error::{NameError, RemoteError, WorkspaceError};
use crate::meta::Meta;
use crate::name::Name;
use crate::task::Task;
use crate::workspace::WorkspaceBuilder;

const TASKS_PATH: &str = "/tasks";
const SHAPE_PATH: &str = "/shape";
const EXECUTE_PATH: &str = "/execute";

/// Where individual tasks are executed, read from the `endpoints` item of a
/// meta:
///
/// ```json
/// { "endpoints": { "square": "http://10.0.0.7:4000", "stats": { "mean": "http://10.0.0.8:4000" } } }
/// ```
///
/// Nested objects extend the task name, the example routes `square` and
/// `stats.mean`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteEndpoints {
    endpoints: BTreeMap<Name, String>,
}

impl RemoteEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_meta(meta: &Meta) -> Result<Self, NameError> {
        let mut endpoints = Self::new();
        if let Some(node) = meta.get_value("endpoints") {
            collect(&mut endpoints.endpoints, Name::EMPTY, node)?;
        }
        Ok(endpoints)
    }

    pub fn insert(&mut self, task: impl Into<Name>, endpoint: impl Into<String>) -> &mut Self {
        self.endpoints.insert(task.into(), endpoint.into());
        self
    }

    pub fn get(&self, task: &Name) -> Option<&str> {
        self.endpoints.get(task).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Name, &str)> {
        self.endpoints.iter().map(|(name, url)| (name, url.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

fn collect(acc: &mut BTreeMap<Name, String>, prefix: Name, node: &Value) -> Result<(), NameError> {
    match node {
        Value::String(url) if !prefix.is_empty() => {
            acc.insert(prefix, url.clone());
        }
        Value::Object(map) => {
            for (key, child) in map {
                collect(acc, prefix.join(&Name::parse(key)?), child)?;
            }
        }
        _ => {}
    }
    Ok(())
}

impl WorkspaceBuilder {
    /// Replace registered tasks by proxies to the given endpoints.
    ///
    /// Every routed task must be registered and declare a codec, the proxy
    /// keeps its descriptor and value type but no local dependencies.
    pub fn route_remote(&mut self, endpoints: &RemoteEndpoints) -> Result<&mut Self, WorkspaceError> {
        for (name, url) in endpoints.iter() {
            self.replace_task(name, |local| {
                let codec = local
                    .codec()
                    .ok_or_else(|| RemoteError::Serializer(name.clone()))?;
                let remote = RemoteTask::new(url, codec).descriptor(local.descriptor());
                tracing::debug!(task = %name, %url, "routing task to remote workspace");
                Ok(Arc::new(remote) as Arc<dyn Task>)
            })?;
        }
        Ok(self)
    }
}

fn encode(envelope: &Envelope) -> Result<Vec<u8>, RemoteError> {
    envelope::serialize(envelope).map_err(|err| RemoteError::Protocol(err.to_string()))
}

/// Split a body into the envelopes it holds.
fn decode_all(mut bytes: &[u8]) -> Result<Vec<Envelope>, RemoteError> {
    let mut envelopes = Vec::new();
    while !bytes.is_empty() {
        let (envelope, used) = envelope::read_next(bytes).map_err(|err| RemoteError::Protocol(err.to_string()))?;
        envelopes.push(envelope);
        bytes = &bytes[used..];
    }
    Ok(envelopes)
}
