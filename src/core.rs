use std::any::{Any, TypeId, type_name};
use std::sync::Arc;

/// A type-erased, thread-safe value.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// Element type of data and trees whose value type is only known at runtime.
///
/// `Data<Unknown>` and `DataTree<Unknown>` accept entries of every type, they
/// can be narrowed back with [`Data::try_cast`](crate::Data::try_cast) and
/// [`DataTree::filter_by_type`](crate::DataTree::filter_by_type).
pub type Unknown = dyn Any + Send + Sync;

/// Runtime identity of the value type carried by a [`Data`](crate::Data).
///
/// Equality only considers the [`TypeId`], the name is kept for diagnostics.
#[derive(Clone, Copy)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

impl std::hash::Hash for TypeTag {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypeTag({})", self.name)
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// Bridge between the statically typed API and the type-erased storage.
///
/// Every `Send + Sync + 'static` type is a payload of its own tag, while
/// [`Unknown`] accepts values of any tag.
pub trait Payload: Send + Sync + 'static {
    /// The tag values of this payload must carry, `None` accepts any tag.
    fn tag() -> Option<TypeTag>;

    /// Recover the typed value from its erased form.
    fn from_dynamic(value: Dynamic) -> Option<Arc<Self>>;

    fn accepts(tag: &TypeTag) -> bool {
        match Self::tag() {
            Some(own) => own == *tag,
            None => true,
        }
    }
}

impl<T: Send + Sync + 'static> Payload for T {
    fn tag() -> Option<TypeTag> {
        Some(TypeTag::of::<T>())
    }

    fn from_dynamic(value: Dynamic) -> Option<Arc<Self>> {
        value.downcast::<T>().ok()
    }
}

impl Payload for Unknown {
    fn tag() -> Option<TypeTag> {
        None
    }

    fn from_dynamic(value: Dynamic) -> Option<Arc<Self>> {
        Some(value)
    }
}

/// A 32-byte BLAKE3 hash used for fingerprinting.
///
/// Cache keys are derived from it: the fingerprint of a task invocation, the
/// key of a single entry and the file names of persisted cache entries.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Hash several parts, each one length-prefixed so that part boundaries
    /// can't be shifted to produce the same digest.
    pub fn hash_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = blake3::Hasher::new();

        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }

        hasher.finalize().into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_equality_ignores_name() {
        assert_eq!(TypeTag::of::<i64>(), TypeTag::of::<i64>());
        assert_ne!(TypeTag::of::<i64>(), TypeTag::of::<u64>());
        assert_eq!(TypeTag::of::<String>().to_string(), "alloc::string::String");
    }

    #[test]
    fn test_payload_accepts() {
        let tag = TypeTag::of::<i64>();
        assert!(<i64 as Payload>::accepts(&tag));
        assert!(!<u8 as Payload>::accepts(&tag));
        assert!(<Unknown as Payload>::accepts(&tag));
    }

    #[test]
    fn test_downcast() {
        let value: Dynamic = Arc::new(5i64);
        assert_eq!(*<i64 as Payload>::from_dynamic(value.clone()).unwrap(), 5);
        assert!(<String as Payload>::from_dynamic(value.clone()).is_none());
        assert!(<Unknown as Payload>::from_dynamic(value).is_some());
    }

    #[test]
    fn test_hash_parts_boundaries() {
        let a = Hash32::hash_parts([b"ab".as_slice(), b"c".as_slice()]);
        let b = Hash32::hash_parts([b"a".as_slice(), b"bc".as_slice()]);
        assert_ne!(a, b);
        assert_eq!(a.to_hex().len(), 64);
    }
}
