//! Value serializers used to persist and transfer data.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::{Dynamic, TypeTag};

/// Turns erased values of a single type into bytes and back.
pub trait Codec: Send + Sync {
    /// The type of the values this codec handles.
    fn tag(&self) -> TypeTag;

    fn encode(&self, value: &Dynamic) -> anyhow::Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Dynamic>;
}

/// CBOR encoding of any serde type.
pub struct CborCodec<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> CborCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for CborCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec for CborCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn tag(&self) -> TypeTag {
        TypeTag::of::<T>()
    }

    fn encode(&self, value: &Dynamic) -> anyhow::Result<Vec<u8>> {
        let value = value
            .downcast_ref::<T>()
            .with_context(|| format!("expected a value of type {}", std::any::type_name::<T>()))?;

        let mut buffer = Vec::new();
        ciborium::into_writer(value, &mut buffer)?;
        Ok(buffer)
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Dynamic> {
        let value: T = ciborium::from_reader(bytes)?;
        Ok(Arc::new(value))
    }
}

/// Codecs keyed by the type they handle.
#[derive(Clone, Default)]
pub struct Codecs {
    codecs: HashMap<TypeTag, Arc<dyn Codec>>,
}

impl Codecs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a codec, replacing any previous one for the same type.
    pub fn insert(&mut self, codec: Arc<dyn Codec>) -> &mut Self {
        self.codecs.insert(codec.tag(), codec);
        self
    }

    /// Register [`CborCodec`] for `T`.
    pub fn cbor<T>(&mut self) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.insert(Arc::new(CborCodec::<T>::new()))
    }

    pub fn get(&self, tag: &TypeTag) -> Option<&Arc<dyn Codec>> {
        self.codecs.get(tag)
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

impl fmt::Debug for Codecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.codecs.keys().map(TypeTag::name))
            .finish()
    }
}
