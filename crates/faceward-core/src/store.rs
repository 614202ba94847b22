//! Known-identity encodings: dataset loading, cache validation and persistence.
//!
//! The dataset is a directory of images, one identity per file, named after
//! the identity (`alice.jpg` → "alice"). Encoding every image is expensive, so
//! the resulting store is persisted as two blobs:
//!
//! - **embeddings**: names, source keys and embedding vectors, index-aligned.
//! - **metadata**: file name → content hash for every image that was considered.
//!
//! On load the metadata is recomputed from disk. Any difference at all (a file
//! added, removed, or modified) throws the whole cache away and rebuilds it;
//! there is no incremental update. Both blobs carry the same generation id so
//! a pair torn by an interrupted write is detected and rebuilt as well.

use crate::cache::{CacheError, ContentHasher, PersistentCache};
use crate::provider::EmbeddingProvider;
use crate::types::{Embedding, FaceProfile};
use faceward_hw::Frame;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use uuid::Uuid;

/// Dataset image extensions, compared case-insensitively.
pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Source file name → content hash.
pub type CacheMetadata = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("dataset directory not found: {0}")]
    DatasetNotFound(PathBuf),
    #[error("no faces could be encoded from dataset {0}")]
    NoFacesEncoded(PathBuf),
    #[error("failed to read dataset {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache: {0}")]
    Cache(#[from] CacheError),
    #[error("cache serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Index-aligned names and embeddings of the known identities.
///
/// Index `i` refers to the same profile in every accessor for the lifetime of
/// the value; the store is immutable once built and replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodingStore {
    names: Vec<String>,
    embeddings: Vec<Embedding>,
    source_hashes: Vec<String>,
}

impl EncodingStore {
    pub fn from_profiles(profiles: Vec<FaceProfile>) -> Self {
        let mut store = Self::default();
        for p in profiles {
            store.names.push(p.name);
            store.embeddings.push(p.embedding);
            store.source_hashes.push(p.source_hash);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Embeddings in store order.
    pub fn embeddings(&self) -> std::slice::Iter<'_, Embedding> {
        self.embeddings.iter()
    }

    pub fn profile(&self, index: usize) -> Option<FaceProfile> {
        Some(FaceProfile {
            name: self.names.get(index)?.clone(),
            embedding: self.embeddings.get(index)?.clone(),
            source_hash: self.source_hashes.get(index)?.clone(),
        })
    }
}

/// Current store shared between verification and the recognition loop.
///
/// Readers take a cheap snapshot; a reload swaps the whole store at once.
#[derive(Debug, Default)]
pub struct Gallery {
    current: RwLock<Arc<EncodingStore>>,
}

impl Gallery {
    pub fn new(store: EncodingStore) -> Self {
        Self {
            current: RwLock::new(Arc::new(store)),
        }
    }

    pub fn snapshot(&self) -> Arc<EncodingStore> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, store: EncodingStore) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(store);
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EmbeddingBlob {
    generation: Uuid,
    names: Vec<String>,
    sources: Vec<String>,
    embeddings: Vec<Embedding>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataBlob {
    generation: Uuid,
    dataset: String,
    hashes: CacheMetadata,
}

/// Why a persisted cache could not be reused. Logged, never surfaced.
#[derive(Debug)]
enum CacheMismatch {
    Absent,
    Unreadable(String),
    GenerationSkew,
    Changed {
        added: usize,
        removed: usize,
        modified: usize,
    },
}

impl std::fmt::Display for CacheMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "no cache"),
            Self::Unreadable(why) => write!(f, "unreadable cache: {why}"),
            Self::GenerationSkew => write!(f, "embeddings and metadata are from different writes"),
            Self::Changed {
                added,
                removed,
                modified,
            } => write!(
                f,
                "dataset changed ({added} added, {removed} removed, {modified} modified)"
            ),
        }
    }
}

fn diff_metadata(cached: &CacheMetadata, fresh: &CacheMetadata) -> Option<CacheMismatch> {
    if cached == fresh {
        return None;
    }
    let added = fresh.keys().filter(|k| !cached.contains_key(*k)).count();
    let removed = cached.keys().filter(|k| !fresh.contains_key(*k)).count();
    let modified = fresh
        .iter()
        .filter(|(k, v)| cached.get(*k).is_some_and(|old| old != *v))
        .count();
    Some(CacheMismatch::Changed {
        added,
        removed,
        modified,
    })
}

struct SourceImage {
    key: String,
    name: String,
    path: PathBuf,
    bytes: Vec<u8>,
}

/// Builds [`EncodingStore`]s from a dataset directory, reusing the persisted
/// cache when the dataset is unchanged.
///
/// Loads are serialized: at most one rebuild-and-persist sequence runs at a time.
pub struct DatasetLoader {
    provider: Arc<dyn EmbeddingProvider>,
    hasher: Arc<dyn ContentHasher>,
    cache: Arc<dyn PersistentCache>,
    rebuild_lock: Mutex<()>,
}

impl DatasetLoader {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        hasher: Arc<dyn ContentHasher>,
        cache: Arc<dyn PersistentCache>,
    ) -> Self {
        Self {
            provider,
            hasher,
            cache,
            rebuild_lock: Mutex::new(()),
        }
    }

    pub fn load(&self, dataset: &Path) -> Result<EncodingStore, StoreError> {
        let _guard = self
            .rebuild_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if !dataset.is_dir() {
            return Err(StoreError::DatasetNotFound(dataset.to_path_buf()));
        }

        let sources = read_sources(dataset)?;
        let metadata: CacheMetadata = sources
            .iter()
            .map(|s| (s.key.clone(), self.hasher.hash(&s.bytes)))
            .collect();

        let (embeddings_key, metadata_key) = self.blob_keys(dataset);
        match self.read_cached(&embeddings_key, &metadata_key, &metadata) {
            Ok(store) => {
                tracing::info!(
                    dataset = %dataset.display(),
                    profiles = store.len(),
                    "encoding cache hit"
                );
                return Ok(store);
            }
            Err(reason) => {
                tracing::info!(
                    dataset = %dataset.display(),
                    %reason,
                    "encoding cache invalid; rebuilding"
                );
            }
        }

        let (store, source_keys) = self.encode_all(&sources, &metadata);
        if store.is_empty() {
            return Err(StoreError::NoFacesEncoded(dataset.to_path_buf()));
        }

        if let Err(e) = self.persist(
            dataset,
            &store,
            source_keys,
            metadata,
            &embeddings_key,
            &metadata_key,
        ) {
            // The store itself is good; only the next load pays for the rebuild.
            tracing::warn!(dataset = %dataset.display(), error = %e, "failed to persist encoding cache");
        }

        tracing::info!(
            dataset = %dataset.display(),
            profiles = store.len(),
            images = sources.len(),
            "encoding store rebuilt"
        );
        Ok(store)
    }

    fn blob_keys(&self, dataset: &Path) -> (String, String) {
        let canonical = dataset
            .canonicalize()
            .unwrap_or_else(|_| dataset.to_path_buf());
        let digest = self.hasher.hash(canonical.to_string_lossy().as_bytes());
        let id: String = digest.chars().take(16).collect();
        (format!("{id}.embeddings.json"), format!("{id}.metadata.json"))
    }

    fn read_cached(
        &self,
        embeddings_key: &str,
        metadata_key: &str,
        fresh: &CacheMetadata,
    ) -> Result<EncodingStore, CacheMismatch> {
        let unreadable = |e: &dyn std::fmt::Display| CacheMismatch::Unreadable(e.to_string());

        let meta_bytes = self
            .cache
            .read_blob(metadata_key)
            .map_err(|e| unreadable(&e))?
            .ok_or(CacheMismatch::Absent)?;
        let meta: MetadataBlob = serde_json::from_slice(&meta_bytes).map_err(|e| unreadable(&e))?;

        if let Some(changed) = diff_metadata(&meta.hashes, fresh) {
            return Err(changed);
        }

        let blob_bytes = self
            .cache
            .read_blob(embeddings_key)
            .map_err(|e| unreadable(&e))?
            .ok_or(CacheMismatch::Absent)?;
        let blob: EmbeddingBlob = serde_json::from_slice(&blob_bytes).map_err(|e| unreadable(&e))?;

        if blob.generation != meta.generation {
            return Err(CacheMismatch::GenerationSkew);
        }
        if blob.names.len() != blob.embeddings.len() || blob.names.len() != blob.sources.len() {
            return Err(CacheMismatch::Unreadable(format!(
                "misaligned blob: {} names, {} embeddings, {} sources",
                blob.names.len(),
                blob.embeddings.len(),
                blob.sources.len()
            )));
        }

        let mut profiles = Vec::with_capacity(blob.names.len());
        for ((name, embedding), source) in blob
            .names
            .into_iter()
            .zip(blob.embeddings)
            .zip(blob.sources)
        {
            let source_hash = fresh.get(&source).cloned().ok_or_else(|| {
                CacheMismatch::Unreadable(format!("profile source {source} not in metadata"))
            })?;
            profiles.push(FaceProfile {
                name,
                embedding,
                source_hash,
            });
        }
        if profiles.is_empty() {
            return Err(CacheMismatch::Unreadable("cached store is empty".into()));
        }
        Ok(EncodingStore::from_profiles(profiles))
    }

    /// Encode every source, returning the store and the file each profile came from.
    fn encode_all(
        &self,
        sources: &[SourceImage],
        metadata: &CacheMetadata,
    ) -> (EncodingStore, Vec<String>) {
        let mut profiles = Vec::new();
        let mut keys = Vec::new();
        for source in sources {
            let Some(embedding) = self.encode_one(source) else {
                continue;
            };
            profiles.push(FaceProfile {
                name: source.name.clone(),
                embedding,
                source_hash: metadata.get(&source.key).cloned().unwrap_or_default(),
            });
            keys.push(source.key.clone());
        }
        (EncodingStore::from_profiles(profiles), keys)
    }

    /// Encode the first face in one dataset image. Failures skip the image.
    fn encode_one(&self, source: &SourceImage) -> Option<Embedding> {
        let frame = match Frame::decode(&source.bytes) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(path = %source.path.display(), error = %e, "skipping undecodable image");
                return None;
            }
        };

        let boxes = match self.provider.locate_faces(&frame) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(path = %source.path.display(), error = %e, "face localization failed");
                return None;
            }
        };
        let Some(first) = boxes.first() else {
            tracing::warn!(path = %source.path.display(), "no face found");
            return None;
        };
        if boxes.len() > 1 {
            tracing::debug!(
                path = %source.path.display(),
                faces = boxes.len(),
                "multiple faces; keeping the first"
            );
        }

        match self.provider.encode_faces(&frame, std::slice::from_ref(first)) {
            Ok(embeddings) => {
                let embedding = embeddings.into_iter().next();
                if embedding.is_none() {
                    tracing::warn!(path = %source.path.display(), "provider returned no embedding");
                }
                embedding
            }
            Err(e) => {
                tracing::warn!(path = %source.path.display(), error = %e, "face encoding failed");
                None
            }
        }
    }

    /// Write both blobs under a fresh generation id.
    ///
    /// Embeddings go first: if the metadata write never happens, the old
    /// metadata no longer matches the new generation and the next load rebuilds.
    fn persist(
        &self,
        dataset: &Path,
        store: &EncodingStore,
        source_keys: Vec<String>,
        hashes: CacheMetadata,
        embeddings_key: &str,
        metadata_key: &str,
    ) -> Result<(), StoreError> {
        let generation = Uuid::new_v4();
        let blob = EmbeddingBlob {
            generation,
            names: store.names().to_vec(),
            sources: source_keys,
            embeddings: store.embeddings().cloned().collect(),
        };
        let meta = MetadataBlob {
            generation,
            dataset: dataset.to_string_lossy().into_owned(),
            hashes,
        };

        self.cache
            .write_blob(embeddings_key, &serde_json::to_vec(&blob)?)?;
        self.cache
            .write_blob(metadata_key, &serde_json::to_vec_pretty(&meta)?)?;
        Ok(())
    }
}

/// Supported images directly inside `dataset`, sorted by file name.
fn read_sources(dataset: &Path) -> Result<Vec<SourceImage>, StoreError> {
    let io_err = |source| StoreError::Io {
        path: dataset.to_path_buf(),
        source,
    };

    let mut sources = Vec::new();
    for entry in std::fs::read_dir(dataset).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        if !path.is_file() || !is_supported_image(&path) {
            continue;
        }
        let (Some(key), Some(name)) = (
            path.file_name().and_then(|n| n.to_str()).map(str::to_string),
            path.file_stem().and_then(|n| n.to_str()).map(str::to_string),
        ) else {
            tracing::warn!(path = %path.display(), "skipping non-UTF-8 file name");
            continue;
        };
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable image");
                continue;
            }
        };
        sources.push(SourceImage {
            key,
            name,
            path,
            bytes,
        });
    }
    sources.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(sources)
}

fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|s| s.eq_ignore_ascii_case(ext))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FsBlobCache, Sha256Hasher};
    use crate::provider::ProviderError;
    use crate::types::BoundingBox;
    use image::{GrayImage, Luma};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Finds one face in any frame that is not pure black; the embedding is
    /// derived from the mean brightness so different images encode differently.
    #[derive(Default)]
    struct BrightnessProvider {
        encode_calls: AtomicUsize,
    }

    impl EmbeddingProvider for BrightnessProvider {
        fn locate_faces(&self, frame: &Frame) -> Result<Vec<BoundingBox>, ProviderError> {
            if frame.data.iter().all(|&p| p == 0) {
                return Ok(vec![]);
            }
            let face = BoundingBox {
                x: 0.0,
                y: 0.0,
                width: frame.width as f32,
                height: frame.height as f32,
                confidence: 1.0,
            };
            Ok(vec![face.clone(), face])
        }

        fn encode_faces(
            &self,
            frame: &Frame,
            boxes: &[BoundingBox],
        ) -> Result<Vec<Embedding>, ProviderError> {
            self.encode_calls.fetch_add(1, Ordering::SeqCst);
            let mean = frame.data.iter().map(|&p| p as f32).sum::<f32>() / frame.data.len() as f32;
            Ok(boxes
                .iter()
                .map(|_| Embedding::new(vec![mean / 255.0, 0.5, 0.25]))
                .collect())
        }
    }

    #[derive(Default)]
    struct MemoryCache {
        blobs: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl PersistentCache for MemoryCache {
        fn read_blob(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            Ok(self.blobs.lock().unwrap().get(key).cloned())
        }

        fn write_blob(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
            self.blobs.lock().unwrap().insert(key.to_string(), bytes.to_vec());
            Ok(())
        }
    }

    fn write_face(dir: &Path, file: &str, value: u8) {
        GrayImage::from_pixel(8, 8, Luma([value]))
            .save(dir.join(file))
            .unwrap();
    }

    fn loader_with(
        provider: Arc<BrightnessProvider>,
        cache: Arc<dyn PersistentCache>,
    ) -> DatasetLoader {
        DatasetLoader::new(provider, Arc::new(Sha256Hasher), cache)
    }

    fn calls(p: &BrightnessProvider) -> usize {
        p.encode_calls.load(Ordering::SeqCst)
    }

    #[test]
    fn test_second_load_hits_cache() {
        let dataset = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        write_face(dataset.path(), "bob.png", 200);
        write_face(dataset.path(), "alice.png", 100);

        let provider = Arc::new(BrightnessProvider::default());
        let loader = loader_with(provider.clone(), Arc::new(FsBlobCache::new(cache_dir.path())));

        let first = loader.load(dataset.path()).unwrap();
        assert_eq!(calls(&provider), 2);
        assert_eq!(first.names(), &["alice".to_string(), "bob".to_string()]);

        let second = loader.load(dataset.path()).unwrap();
        assert_eq!(calls(&provider), 2, "cache hit must not call the provider");
        assert_eq!(first, second);
    }

    #[test]
    fn test_cache_survives_new_loader_instance() {
        let dataset = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        write_face(dataset.path(), "carol.jpg", 150);

        let first = loader_with(
            Arc::new(BrightnessProvider::default()),
            Arc::new(FsBlobCache::new(cache_dir.path())),
        )
        .load(dataset.path())
        .unwrap();

        let provider = Arc::new(BrightnessProvider::default());
        let second = loader_with(provider.clone(), Arc::new(FsBlobCache::new(cache_dir.path())))
            .load(dataset.path())
            .unwrap();
        assert_eq!(calls(&provider), 0);
        assert_eq!(first, second);
        assert_eq!(second.profile(0).unwrap().source_hash.len(), 64);
    }

    #[test]
    fn test_modified_image_forces_full_rebuild() {
        let dataset = tempfile::tempdir().unwrap();
        write_face(dataset.path(), "alice.png", 100);
        write_face(dataset.path(), "bob.png", 200);

        let provider = Arc::new(BrightnessProvider::default());
        let loader = loader_with(provider.clone(), Arc::new(MemoryCache::default()));
        let before = loader.load(dataset.path()).unwrap();

        write_face(dataset.path(), "bob.png", 201);
        let after = loader.load(dataset.path()).unwrap();

        // Both images re-encoded, not just the changed one.
        assert_eq!(calls(&provider), 4);
        assert_ne!(before.profile(1), after.profile(1));
        assert_eq!(before.profile(0).map(|p| p.embedding), after.profile(0).map(|p| p.embedding));
    }

    #[test]
    fn test_added_and_removed_files_invalidate() {
        let dataset = tempfile::tempdir().unwrap();
        write_face(dataset.path(), "alice.png", 100);

        let provider = Arc::new(BrightnessProvider::default());
        let loader = loader_with(provider.clone(), Arc::new(MemoryCache::default()));
        loader.load(dataset.path()).unwrap();

        write_face(dataset.path(), "dave.jpeg", 90);
        let grown = loader.load(dataset.path()).unwrap();
        assert_eq!(grown.len(), 2);
        assert_eq!(calls(&provider), 3);

        std::fs::remove_file(dataset.path().join("alice.png")).unwrap();
        let shrunk = loader.load(dataset.path()).unwrap();
        assert_eq!(shrunk.names(), &["dave".to_string()]);
        assert_eq!(calls(&provider), 4);
    }

    #[test]
    fn test_generation_skew_rebuilds() {
        let dataset = tempfile::tempdir().unwrap();
        write_face(dataset.path(), "alice.png", 100);

        let provider = Arc::new(BrightnessProvider::default());
        let cache = Arc::new(MemoryCache::default());
        let loader = loader_with(provider.clone(), cache.clone());
        loader.load(dataset.path()).unwrap();

        // Simulate a torn write: embeddings blob from a different generation.
        {
            let mut blobs = cache.blobs.lock().unwrap();
            let key = blobs
                .keys()
                .find(|k| k.ends_with(".embeddings.json"))
                .cloned()
                .unwrap();
            let mut value: serde_json::Value = serde_json::from_slice(&blobs[&key]).unwrap();
            value["generation"] = serde_json::json!(Uuid::new_v4());
            blobs.insert(key, serde_json::to_vec(&value).unwrap());
        }

        loader.load(dataset.path()).unwrap();
        assert_eq!(calls(&provider), 2);
        // And the rebuilt pair is consistent again.
        loader.load(dataset.path()).unwrap();
        assert_eq!(calls(&provider), 2);
    }

    #[test]
    fn test_faceless_and_broken_images_are_skipped() {
        let dataset = tempfile::tempdir().unwrap();
        write_face(dataset.path(), "alice.png", 100);
        write_face(dataset.path(), "empty.png", 0);
        std::fs::write(dataset.path().join("broken.jpg"), b"not a jpeg").unwrap();
        std::fs::write(dataset.path().join("notes.txt"), b"ignored").unwrap();

        let loader = loader_with(
            Arc::new(BrightnessProvider::default()),
            Arc::new(MemoryCache::default()),
        );
        let store = loader.load(dataset.path()).unwrap();
        assert_eq!(store.names(), &["alice".to_string()]);
    }

    #[test]
    fn test_no_usable_faces_fails_loudly() {
        let dataset = tempfile::tempdir().unwrap();
        write_face(dataset.path(), "empty.png", 0);

        let loader = loader_with(
            Arc::new(BrightnessProvider::default()),
            Arc::new(MemoryCache::default()),
        );
        assert!(matches!(
            loader.load(dataset.path()),
            Err(StoreError::NoFacesEncoded(_))
        ));
    }

    #[test]
    fn test_missing_dataset() {
        let loader = loader_with(
            Arc::new(BrightnessProvider::default()),
            Arc::new(MemoryCache::default()),
        );
        assert!(matches!(
            loader.load(Path::new("/nonexistent/faceward/dataset")),
            Err(StoreError::DatasetNotFound(_))
        ));
    }

    #[test]
    fn test_uppercase_extension_is_supported() {
        assert!(is_supported_image(Path::new("x/ALICE.JPG")));
        assert!(is_supported_image(Path::new("x/bob.Png")));
        assert!(!is_supported_image(Path::new("x/carol.gif")));
        assert!(!is_supported_image(Path::new("x/noext")));
    }

    #[test]
    fn test_gallery_replace_keeps_old_snapshot_alive() {
        let gallery = Gallery::new(EncodingStore::default());
        let old = gallery.snapshot();
        gallery.replace(EncodingStore::from_profiles(vec![FaceProfile {
            name: "alice".into(),
            embedding: Embedding::new(vec![0.0]),
            source_hash: "h".into(),
        }]));
        assert!(old.is_empty());
        assert_eq!(gallery.snapshot().len(), 1);
    }
}
