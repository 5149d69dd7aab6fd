use std::io::{ErrorKind, Write};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use super::{CachedSource, Fingerprint, WorkspaceCache};
use crate::codec::{Codec, Codecs};
use crate::core::{Dynamic, Unknown};
use crate::data::Data;
use crate::envelope::{self, Envelope};
use crate::error::{CacheError, DataError};
use crate::meta::Meta;
use crate::name::Name;
use crate::workspace::TaskResult;

/// Persists entry values as envelope files.
///
/// Layout: `<root>/<fingerprint>/<entry>.df`, both hex encoded hashes. The
/// envelope meta is the meta of the data, a stored file whose meta differs
/// from the live data is stale and gets replaced. Only entries whose type has
/// a codec, registered here or declared by the task, are persisted, the rest
/// passes through untouched.
#[derive(Clone, Debug)]
pub struct FileCache {
    root: Utf8PathBuf,
    codecs: Codecs,
}

impl FileCache {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            codecs: Codecs::new(),
        }
    }

    /// Persist values of `T` with CBOR.
    pub fn codec<T>(mut self) -> Self
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        self.codecs.cbor::<T>();
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codecs.insert(codec);
        self
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// File holding the entry `name` of a task invocation.
    pub fn path(&self, fingerprint: &Fingerprint, name: &Name) -> Utf8PathBuf {
        entry_path(&self.root.join(fingerprint.to_hex()), name)
    }
}

fn entry_path(dir: &Utf8Path, name: &Name) -> Utf8PathBuf {
    dir.join(format!("{}.df", Fingerprint::entry(name).to_hex()))
}

impl WorkspaceCache for FileCache {
    fn cache(&self, result: TaskResult<Unknown>) -> TaskResult<Unknown> {
        let dir = self.root.join(result.fingerprint().to_hex());

        let mut codecs = self.codecs.clone();
        let declared = result
            .workspace()
            .and_then(|workspace| workspace.task(result.task_name()).and_then(|task| task.codec()));
        if let Some(codec) = declared {
            codecs.insert(codec);
        }

        let tree = CachedSource::wrap(result.tree(), move |name, data| {
            let Some(codec) = codecs.get(&data.type_tag()).cloned() else {
                return data.clone();
            };

            let path = entry_path(&dir, name);
            let source = data.clone();
            Data::from_dynamic(data.type_tag(), data.meta().clone(), vec![data.clone()], async move {
                load_or_compute(path, codec, source).await
            })
        });

        result.with_tree(tree)
    }
}

async fn load_or_compute(path: Utf8PathBuf, codec: Arc<dyn Codec>, source: Data<Unknown>) -> Result<Dynamic, DataError> {
    match load(&path, codec.as_ref(), source.meta()).await {
        Ok(Some(value)) => {
            debug!(%path, "file cache hit");
            return Ok(value);
        }
        Ok(None) => debug!(%path, "file cache miss"),
        Err(err) => {
            warn!(%path, "dropping broken cache entry: {err}");
            remove(&path).await;
        }
    }

    let value = source.dynamic().await?;

    match codec.encode(&value) {
        Ok(bytes) => {
            let envelope = Envelope::new(source.meta().clone(), bytes);
            if let Err(err) = store(path.clone(), envelope).await {
                warn!(%path, "failed to persist cache entry: {err}");
            }
        }
        Err(err) => warn!(%path, "failed to encode value for the cache: {err:#}"),
    }

    Ok(value)
}

/// `Ok(None)` on a miss or a stale entry.
async fn load(path: &Utf8Path, codec: &dyn Codec, meta: &Meta) -> Result<Option<Dynamic>, CacheError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let envelope = envelope::deserialize(&bytes)?;
    if envelope.meta.to_bytes() != meta.to_bytes() {
        debug!(%path, "stale cache entry");
        remove(path).await;
        return Ok(None);
    }

    let payload = envelope
        .data
        .ok_or_else(|| CacheError::Corruption("missing payload".into()))?;

    codec
        .decode(&payload)
        .map(Some)
        .map_err(|err| CacheError::Corruption(format!("{err:#}")))
}

async fn remove(path: &Utf8Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(%path, "failed to remove cache entry: {err}"),
    }
}

/// Write through a temporary file in the same directory and rename it into
/// place, concurrent writers never leave a partial file behind.
async fn store(path: Utf8PathBuf, envelope: Envelope) -> Result<(), CacheError> {
    tokio::task::spawn_blocking(move || -> Result<(), CacheError> {
        let dir = path
            .parent()
            .ok_or_else(|| CacheError::Corruption(format!("no parent directory for {path}")))?;
        std::fs::create_dir_all(dir)?;

        let bytes = envelope::serialize(&envelope)?;
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(&bytes)?;
        file.persist(&path).map_err(|err| err.error)?;
        Ok(())
    })
    .await
    .map_err(|err| CacheError::Io(std::io::Error::other(err)))?
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::tree::DataTree;
    use crate::workspace::Workspace;

    fn root(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap()
    }

    fn workspace(cache: FileCache, calls: &Arc<AtomicUsize>, unit: &'static str) -> Workspace {
        build_series(cache, calls, Meta::new(json!({ "unit": unit })), false)
    }

    /// A `series` task whose entry `s` carries `meta`, optionally failing.
    fn build_series(cache: FileCache, calls: &Arc<AtomicUsize>, meta: Meta, fail: bool) -> Workspace {
        let counter = calls.clone();
        let mut builder = Workspace::builder();
        builder.cache(cache);
        builder
            .task::<Vec<i64>>("series")
            .run(move |_| {
                let counter = counter.clone();
                let mut tree = DataTree::builder();
                tree.put(
                    "s",
                    Data::new(meta.clone(), Vec::new(), move || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        anyhow::ensure!(!fail, "sensor offline");
                        Ok(vec![1i64, 2, 3])
                    }),
                );
                tree.value("opaque", vec![9i64]);
                Ok(tree.build())
            })
            .unwrap();
        builder.build().unwrap()
    }

    async fn series(workspace: &Workspace) -> Vec<i64> {
        let result = workspace
            .produce(&Name::from("series"), &Meta::empty())
            .await
            .unwrap();
        let value = result.cast::<Vec<i64>>().get("s").unwrap().value().await.unwrap();
        (*value).clone()
    }

    fn entry(cache: &FileCache) -> Utf8PathBuf {
        cache.path(&Fingerprint::new(&Name::from("series"), &Meta::empty()), &Name::from("s"))
    }

    #[tokio::test]
    async fn test_value_survives_workspaces() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(root(&dir)).codec::<Vec<i64>>();
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(series(&workspace(cache.clone(), &calls, "nm")).await, vec![1, 2, 3]);
        assert!(entry(&cache).exists());
        assert_eq!(series(&workspace(cache.clone(), &calls, "nm")).await, vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_meta_recomputes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(root(&dir)).codec::<Vec<i64>>();
        let calls = Arc::new(AtomicUsize::new(0));

        series(&workspace(cache.clone(), &calls, "nm")).await;
        series(&workspace(cache.clone(), &calls, "um")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let stored = envelope::deserialize(&std::fs::read(entry(&cache)).unwrap()).unwrap();
        assert_eq!(stored.meta.get_str("unit"), Some("um"));
    }

    #[tokio::test]
    async fn test_stale_entry_removed_when_recompute_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(root(&dir)).codec::<Vec<i64>>();
        let calls = Arc::new(AtomicUsize::new(0));

        series(&workspace(cache.clone(), &calls, "nm")).await;
        assert!(entry(&cache).exists());

        let failing = build_series(cache.clone(), &calls, Meta::new(json!({ "unit": "um" })), true);
        let result = failing
            .produce(&Name::from("series"), &Meta::empty())
            .await
            .unwrap()
            .cast::<Vec<i64>>();
        assert!(result.get("s").unwrap().value().await.is_err());
        assert!(!entry(&cache).exists());
    }

    #[tokio::test]
    async fn test_empty_object_meta_hits() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(root(&dir)).codec::<Vec<i64>>();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let workspace = build_series(cache.clone(), &calls, Meta::new(json!({})), false);
            assert_eq!(series(&workspace).await, vec![1, 2, 3]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_corrupted_entry_is_recomputed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(root(&dir)).codec::<Vec<i64>>();
        let calls = Arc::new(AtomicUsize::new(0));

        series(&workspace(cache.clone(), &calls, "nm")).await;
        std::fs::write(entry(&cache), b"#~DF03JS garbage").unwrap();

        assert_eq!(series(&workspace(cache.clone(), &calls, "nm")).await, vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let repaired = envelope::deserialize(&std::fs::read(entry(&cache)).unwrap()).unwrap();
        assert!(repaired.data.is_some());
    }

    #[tokio::test]
    async fn test_declared_codec_and_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(root(&dir));
        let fingerprint = Fingerprint::new(&Name::from("plain"), &Meta::empty());

        let mut builder = Workspace::builder();
        builder.cache(cache.clone());
        builder
            .task::<String>("plain")
            .serialized()
            .run(|_| {
                let mut tree = DataTree::builder();
                tree.value("greeting", "hello".to_string());
                Ok(tree.build())
            })
            .unwrap();
        builder
            .task::<u8>("raw")
            .run(|_| Ok(DataTree::single(Data::constant(7u8))))
            .unwrap();
        let workspace = builder.build().unwrap();

        let plain = workspace.produce(&Name::from("plain"), &Meta::empty()).await.unwrap();
        let greeting = plain.cast::<String>().get("greeting").unwrap().value().await.unwrap();
        assert_eq!(greeting.as_str(), "hello");
        assert!(cache.path(&fingerprint, &Name::from("greeting")).exists());

        let raw = workspace.produce(&Name::from("raw"), &Meta::empty()).await.unwrap();
        assert_eq!(*raw.cast::<u8>().get(Name::EMPTY).unwrap().value().await.unwrap(), 7);
        let raw_dir = root(&dir).join(Fingerprint::new(&Name::from("raw"), &Meta::empty()).to_hex());
        assert!(!raw_dir.exists());
    }
}
