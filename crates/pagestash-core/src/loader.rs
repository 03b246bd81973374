//! Archive loading, indexing and projection.
//!
//! [`ArchiveLoader::load`] opens an archive, reads its manifest and builds a
//! resource index keyed by [`ResourceKey`]. Concurrent loads of the same path
//! share a single unpack; a failed unpack is reported to every waiter and
//! nothing is cached, so the next load tries again.
//!
//! Loaded archives are kept for reuse up to a configured count, after which
//! the least recently loaded one is dropped.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::archive::{ArchiveManifest, ArchiveReader, EntryLocation};
use crate::resource::{ResourceKey, ResourceKind, ResourceRequest};
use crate::surface::RenderSurface;
use crate::{Error, Result};

type LoadOutcome = std::result::Result<Arc<LoadedArchive>, String>;
type SharedLoad = Shared<BoxFuture<'static, LoadOutcome>>;

/// Where one resource lives and how to serve it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Normalized request identity.
    pub key: ResourceKey,
    /// URL the payload came from.
    pub url: String,
    /// Response content type.
    pub content_type: Option<String>,
    /// HTTP status recorded at capture time.
    pub status: u16,
    /// Resource classification.
    pub kind: ResourceKind,
    /// Location of the compressed payload.
    pub location: EntryLocation,
}

/// An unpacked, indexed archive.
pub struct LoadedArchive {
    source_path: PathBuf,
    manifest: ArchiveManifest,
    resource_index: BTreeMap<ResourceKey, IndexEntry>,
    reader: Mutex<ArchiveReader>,
}

impl std::fmt::Debug for LoadedArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedArchive")
            .field("source_path", &self.source_path)
            .field("resources", &self.resource_index.len())
            .finish_non_exhaustive()
    }
}

impl LoadedArchive {
    fn unpack(path: &Path) -> Result<Self> {
        let mut reader = ArchiveReader::open(path)?;
        let manifest = reader.manifest().clone();

        let mut resource_index = BTreeMap::new();
        for entry in &manifest.resources {
            let location = reader.locate(&entry.entry)?;
            resource_index.insert(
                entry.key.clone(),
                IndexEntry {
                    key: entry.key.clone(),
                    url: entry.url.clone(),
                    content_type: entry.content_type.clone(),
                    status: entry.status,
                    kind: entry.kind,
                    location,
                },
            );
        }

        Ok(Self {
            source_path: path.to_path_buf(),
            manifest,
            resource_index,
            reader: Mutex::new(reader),
        })
    }

    /// Path the archive was loaded from.
    #[must_use]
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Archive manifest.
    #[must_use]
    pub const fn manifest(&self) -> &ArchiveManifest {
        &self.manifest
    }

    /// Logical path → location index.
    #[must_use]
    pub const fn resource_index(&self) -> &BTreeMap<ResourceKey, IndexEntry> {
        &self.resource_index
    }

    /// Handle for projecting this archive onto a surface.
    #[must_use]
    pub fn handle(self: &Arc<Self>) -> ArchiveHandle {
        ArchiveHandle {
            archive: Arc::clone(self),
        }
    }
}

/// Cheap, cloneable reference to a loaded archive.
#[derive(Clone)]
pub struct ArchiveHandle {
    archive: Arc<LoadedArchive>,
}

impl std::fmt::Debug for ArchiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ArchiveHandle")
            .field(&self.archive.source_path)
            .finish()
    }
}

impl ArchiveHandle {
    /// The loaded archive.
    #[must_use]
    pub const fn archive(&self) -> &Arc<LoadedArchive> {
        &self.archive
    }

    /// URL relative references resolve against: the captured document's URL.
    pub fn base_url(&self) -> Result<Url> {
        Url::parse(&self.archive.manifest.final_url).map_err(|e| Error::ArchiveCorrupt {
            path: self.archive.source_path.clone(),
            reason: format!("invalid document URL: {e}"),
        })
    }

    /// Index entry of the main document.
    #[must_use]
    pub fn document(&self) -> Option<&IndexEntry> {
        self.archive.resource_index.get(&self.archive.manifest.document)
    }

    /// Resolve an absolute or document-relative reference to a `GET` entry.
    ///
    /// Returns `None` when the page never loaded that resource.
    #[must_use]
    pub fn resolve(&self, reference: &str) -> Option<&IndexEntry> {
        let base = self.base_url().ok()?;
        let url = base.join(reference.trim()).ok()?;
        let key = ResourceRequest::for_url(url).key();
        self.archive.resource_index.get(&key)
    }

    /// Decompress an entry's payload.
    pub async fn read(&self, entry: &IndexEntry) -> Result<Vec<u8>> {
        let archive = Arc::clone(&self.archive);
        let name = entry.location.entry.clone();
        tokio::task::spawn_blocking(move || archive.reader.lock().read_entry(&name))
            .await
            .map_err(|e| Error::ArchiveCorrupt {
                path: self.archive.source_path.clone(),
                reason: format!("reader task failed: {e}"),
            })?
    }
}

#[derive(Default)]
struct LoaderState {
    loaded: HashMap<PathBuf, Arc<LoadedArchive>>,
    order: VecDeque<PathBuf>,
    in_flight: HashMap<PathBuf, SharedLoad>,
}

impl LoaderState {
    fn touch(&mut self, path: &Path) {
        self.order.retain(|p| p != path);
        self.order.push_back(path.to_path_buf());
    }
}

/// Loads archives, sharing concurrent loads of the same path.
pub struct ArchiveLoader {
    state: Arc<Mutex<LoaderState>>,
    max_loaded: usize,
    unpacks: Arc<AtomicU64>,
}

impl ArchiveLoader {
    /// Create a loader retaining up to `max_loaded` archives.
    #[must_use]
    pub fn new(max_loaded: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(LoaderState::default())),
            max_loaded: max_loaded.max(1),
            unpacks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Load an archive, or return the already loaded one.
    ///
    /// Fails with [`Error::ArchiveCorrupt`] when the file is missing or cannot
    /// be unpacked.
    pub async fn load(&self, path: &Path) -> Result<Arc<LoadedArchive>> {
        let path = tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf());

        let shared = {
            let mut state = self.state.lock();
            if let Some(loaded) = state.loaded.get(&path).cloned() {
                debug!("Archive {} already loaded", path.display());
                state.touch(&path);
                return Ok(loaded);
            }
            if let Some(pending) = state.in_flight.get(&path) {
                debug!("Joining in-flight load of {}", path.display());
                pending.clone()
            } else {
                let pending = self.start_load(path.clone());
                state.in_flight.insert(path.clone(), pending.clone());
                pending
            }
        };

        shared.await.map_err(|reason| Error::ArchiveCorrupt { path, reason })
    }

    fn start_load(&self, path: PathBuf) -> SharedLoad {
        let state = Arc::clone(&self.state);
        let unpacks = Arc::clone(&self.unpacks);
        let max_loaded = self.max_loaded;

        async move {
            unpacks.fetch_add(1, Ordering::Relaxed);
            let unpack_path = path.clone();
            let outcome = tokio::task::spawn_blocking(move || LoadedArchive::unpack(&unpack_path))
                .await
                .map_err(|e| format!("unpack task failed: {e}"))
                .and_then(|unpacked| unpacked.map_err(|e| root_reason(&e)));

            let mut state = state.lock();
            state.in_flight.remove(&path);
            let archive = Arc::new(outcome?);

            state.loaded.insert(path.clone(), Arc::clone(&archive));
            state.touch(&path);
            while state.loaded.len() > max_loaded {
                let Some(oldest) = state.order.pop_front() else {
                    break;
                };
                debug!("Evicting loaded archive {}", oldest.display());
                state.loaded.remove(&oldest);
            }

            info!(
                "Loaded archive {} ({} resources)",
                path.display(),
                archive.resource_index.len()
            );
            Ok(archive)
        }
        .boxed()
        .shared()
    }

    /// Number of unpack operations performed.
    #[must_use]
    pub fn unpack_count(&self) -> u64 {
        self.unpacks.load(Ordering::Relaxed)
    }

    /// Number of archives currently retained.
    #[must_use]
    pub fn loaded_count(&self) -> usize {
        self.state.lock().loaded.len()
    }

    /// Forget a loaded archive.
    ///
    /// `path` is resolved the same way [`ArchiveLoader::load`] resolves it,
    /// so any spelling of a loaded archive's path evicts it.
    pub fn evict(&self, path: &Path) -> bool {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let mut state = self.state.lock();
        state.order.retain(|p| *p != path);
        state.loaded.remove(&path).is_some()
    }
}

fn root_reason(err: &Error) -> String {
    match err.root() {
        Error::ArchiveCorrupt { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

/// Bind a loaded archive to a surface so its resources resolve from the archive.
pub fn project(archive: &Arc<LoadedArchive>, surface: &dyn RenderSurface) {
    debug!(
        "Projecting {} onto surface {}",
        archive.source_path.display(),
        surface.id()
    );
    surface.bind_archive(archive.handle());
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::archive::ArchiveWriter;
    use crate::archive::tests::{manifest_for, resource};
    use crate::surface::HeadlessSurface;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn write_sample(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let resources = vec![
            resource(
                "https://example.com/news/story.html",
                br#"<link rel="stylesheet" href="../css/site.css">"#,
                "text/html",
            ),
            resource("https://example.com/css/site.css", b"body{}", "text/css"),
            resource("https://example.com/img/a.png?w=100", b"\x89PNG", "image/png"),
        ];
        ArchiveWriter::new(&path)
            .write(&manifest_for(&resources), &resources)
            .unwrap();
        path
    }

    #[tokio::test]
    async fn test_concurrent_loads_unpack_once() {
        let temp = TempDir::new().unwrap();
        let path = write_sample(temp.path(), "page.pgz");
        let loader = Arc::new(ArchiveLoader::new(4));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let loader = Arc::clone(&loader);
            let path = path.clone();
            handles.push(tokio::spawn(async move { loader.load(&path).await.unwrap() }));
        }
        let mut loaded = Vec::new();
        for handle in handles {
            loaded.push(handle.await.unwrap());
        }

        assert_eq!(loader.unpack_count(), 1);
        assert!(loaded.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_not_cached() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("broken.pgz");
        std::fs::write(&path, b"not a zip").unwrap();
        let loader = ArchiveLoader::new(4);

        for _ in 0..2 {
            let err = loader.load(&path).await.unwrap_err();
            assert!(matches!(err, Error::ArchiveCorrupt { .. }));
        }
        assert_eq!(loader.unpack_count(), 2, "failed load retried");
        assert_eq!(loader.loaded_count(), 0);
    }

    #[tokio::test]
    async fn test_index_keys_match_written_resources() {
        let temp = TempDir::new().unwrap();
        let path = write_sample(temp.path(), "page.pgz");
        let loader = ArchiveLoader::new(4);

        let archive = loader.load(&path).await.unwrap();
        let keys: BTreeSet<&ResourceKey> = archive.resource_index().keys().collect();
        let expected: BTreeSet<&ResourceKey> =
            archive.manifest().resources.iter().map(|r| &r.key).collect();
        assert_eq!(keys, expected);
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test]
    async fn test_handle_resolves_relative_references() {
        let temp = TempDir::new().unwrap();
        let path = write_sample(temp.path(), "page.pgz");
        let loader = ArchiveLoader::new(4);
        let handle = loader.load(&path).await.unwrap().handle();

        let css = handle.resolve("../css/site.css").unwrap();
        assert_eq!(handle.read(css).await.unwrap(), b"body{}");
        assert!(handle.resolve("/img/a.png?w=100#frag").is_some());
        assert!(handle.resolve("/img/a.png?w=200").is_none());
        assert_eq!(
            handle.document().unwrap().url,
            "https://example.com/news/story.html"
        );
    }

    #[tokio::test]
    async fn test_least_recently_loaded_is_evicted() {
        let temp = TempDir::new().unwrap();
        let first = write_sample(temp.path(), "one.pgz");
        let second = write_sample(temp.path(), "two.pgz");
        let loader = ArchiveLoader::new(1);

        loader.load(&first).await.unwrap();
        loader.load(&second).await.unwrap();
        assert_eq!(loader.loaded_count(), 1);

        loader.load(&first).await.unwrap();
        assert_eq!(loader.unpack_count(), 3);
    }

    #[tokio::test]
    async fn test_evict_accepts_any_spelling_of_the_path() {
        let temp = TempDir::new().unwrap();
        let path = write_sample(temp.path(), "page.pgz");
        let loader = ArchiveLoader::new(4);
        loader.load(&path).await.unwrap();

        let detour = temp.path().join(".").join("sub").join("..").join("page.pgz");
        std::fs::create_dir(temp.path().join("sub")).unwrap();
        assert!(loader.evict(&detour));
        assert_eq!(loader.loaded_count(), 0);
        assert!(!loader.evict(&path));

        loader.load(&path).await.unwrap();
        assert_eq!(loader.unpack_count(), 2);
    }

    #[tokio::test]
    async fn test_project_binds_archive_to_surface() {
        let temp = TempDir::new().unwrap();
        let path = write_sample(temp.path(), "page.pgz");
        let archive = ArchiveLoader::new(4).load(&path).await.unwrap();
        let surface = HeadlessSurface::new("main");

        project(&archive, &surface);

        let bound = surface.bound_archive().unwrap();
        assert!(Arc::ptr_eq(bound.archive(), &archive));
    }
}
