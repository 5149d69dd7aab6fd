#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod action;
pub mod cache;
pub mod codec;
mod core;
mod data;
pub mod envelope;
mod error;
mod goal;
mod meta;
mod name;
mod placement;
#[cfg(feature = "remote")]
pub mod remote;
mod task;
mod tree;
mod utils;
mod workspace;

pub use crate::action::{Action, ActionEnv, ActionExt, GroupRule, MapAction, ReduceAction, SplitAction};
pub use crate::cache::{Fingerprint, InMemoryCache, WorkspaceCache};
#[cfg(feature = "cache-file")]
pub use crate::cache::FileCache;
pub use crate::codec::{CborCodec, Codec, Codecs};
pub use crate::core::{Dynamic, Hash32, Payload, TypeTag, Unknown};
pub use crate::data::{Data, DataState, NamedData};
pub use crate::envelope::Envelope;
pub use crate::error::{DataError, EnvelopeError, NameError, RemoteError, TreeError, WorkspaceError};
pub use crate::meta::Meta;
pub use crate::name::{Name, NamePattern, NameToken};
pub use crate::placement::{Placement, PlacementRule};
#[cfg(feature = "remote")]
pub use crate::remote::{RemoteEndpoints, RemoteTask, WorkspaceServer};
pub use crate::task::{Dependency, Task, TaskBuilder, TaskContext, TaskProvider, TaskRef};
pub use crate::tree::{DataTree, DataTreeBuilder, MutableDataTree};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::workspace::{TaskResult, Workspace, WorkspaceBuilder};
