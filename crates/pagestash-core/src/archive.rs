//! Single-file archive format.
//!
//! An archive is a zip container with the `.pgz` extension:
//!
//! ```text
//! manifest.json            capture metadata and the resource table
//! resources/rs_<sha256>   one deflated entry per captured resource
//! ```
//!
//! The manifest maps every [`ResourceKey`] to its entry name, so a reader
//! only needs the zip central directory and the manifest to build an index.
//! Resource bodies are decompressed on demand.
//!
//! Writes go to a temporary file in the destination directory which is
//! renamed into place once complete, so a failed write never leaves a
//! partial archive behind. The rename never replaces an existing file.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::browser::ResourceFailure;
use crate::resource::{CachedResource, ResourceKey, ResourceKind};
use crate::storage::Directories;
use crate::{Error, Result};

/// File extension of archives, without the dot.
pub const ARCHIVE_EXTENSION: &str = "pgz";

/// Name of the manifest entry.
pub const MANIFEST_ENTRY: &str = "manifest.json";

/// Directory prefix of resource entries.
pub const RESOURCE_PREFIX: &str = "resources/";

/// Current manifest format version.
pub const FORMAT_VERSION: u32 = 1;

/// Archive table of contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveManifest {
    /// Format version the archive was written with.
    pub version: u32,
    /// URL the capture was requested for.
    pub source_url: String,
    /// URL of the captured document (after redirects or AMP).
    pub final_url: String,
    /// Document title.
    pub title: Option<String>,
    /// When the capture started.
    pub captured_at: DateTime<Utc>,
    /// Capture duration up to packaging.
    pub duration_ms: u64,
    /// Key of the main document.
    pub document: ResourceKey,
    /// Browser profile the capture ran under.
    pub profile: String,
    /// Captured resources in the order they were stored.
    pub resources: Vec<ManifestEntry>,
    /// Resources that could not be captured.
    #[serde(default)]
    pub failures: Vec<ResourceFailure>,
}

/// One captured resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Normalized request identity; the logical path of the resource.
    pub key: ResourceKey,
    /// URL the payload came from.
    pub url: String,
    /// Request method.
    pub method: String,
    /// Zip entry holding the payload.
    pub entry: String,
    /// Response content type.
    pub content_type: Option<String>,
    /// Payload size in bytes.
    pub size: u64,
    /// HTTP status.
    pub status: u16,
    /// Resource classification.
    pub kind: ResourceKind,
    /// When it was fetched.
    pub fetched_at: DateTime<Utc>,
}

impl ManifestEntry {
    fn from_resource(resource: &CachedResource) -> Self {
        Self {
            key: resource.key.clone(),
            url: resource.url.to_string(),
            method: resource.method.clone(),
            entry: format!("{RESOURCE_PREFIX}{}", resource.key.entry_id()),
            content_type: resource.content_type.clone(),
            size: resource.size() as u64,
            status: resource.status,
            kind: resource.kind,
            fetched_at: resource.fetched_at,
        }
    }
}

/// Capture details recorded in the manifest next to the resource table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureMetadata {
    /// Requested URL.
    pub source_url: String,
    /// Captured document URL.
    pub final_url: String,
    /// Document title.
    pub title: Option<String>,
    /// Key of the main document.
    pub document: ResourceKey,
    /// Browser profile name.
    pub profile: String,
    /// When the capture started.
    pub captured_at: DateTime<Utc>,
    /// Duration up to packaging.
    pub duration_ms: u64,
    /// Resources that could not be captured.
    pub failures: Vec<ResourceFailure>,
}

impl ArchiveManifest {
    /// Build the manifest for a set of resources.
    #[must_use]
    pub fn build(metadata: CaptureMetadata, resources: &[Arc<CachedResource>]) -> Self {
        Self {
            version: FORMAT_VERSION,
            source_url: metadata.source_url,
            final_url: metadata.final_url,
            title: metadata.title,
            captured_at: metadata.captured_at,
            duration_ms: metadata.duration_ms,
            document: metadata.document,
            profile: metadata.profile,
            resources: resources
                .iter()
                .map(|resource| ManifestEntry::from_resource(resource))
                .collect(),
            failures: metadata.failures,
        }
    }

    /// Entry for a key.
    #[must_use]
    pub fn entry(&self, key: &ResourceKey) -> Option<&ManifestEntry> {
        self.resources.iter().find(|entry| &entry.key == key)
    }

    /// Total payload bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.resources.iter().map(|entry| entry.size).sum()
    }
}

/// Upper bound on `-N` name suffixes tried for one archive.
const MAX_NAME_ATTEMPTS: u32 = 10_000;

#[derive(Debug, Clone)]
enum Destination {
    /// Exactly this path; fails if it exists.
    Exact(PathBuf),
    /// First free `<stem>[-N].pgz` in a directory.
    Unique { dir: PathBuf, stem: String },
}

/// An archive that was moved into place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenArchive {
    /// Final location.
    pub path: PathBuf,
    /// Size on disk.
    pub size: u64,
}

#[derive(Debug, Default)]
enum GateState {
    #[default]
    Open,
    Committed(PathBuf),
    Aborted,
}

/// Coordinates an archive write with a caller that may give up on it.
///
/// The writer moves its archive into place only while the gate is open and
/// records where it went. [`CommitGate::abort`] closes the gate and deletes
/// anything already committed, so once it returns no archive from this write
/// exists or will appear.
#[derive(Debug, Clone, Default)]
pub struct CommitGate {
    state: Arc<Mutex<GateState>>,
}

impl CommitGate {
    /// A fresh, open gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the gate, removing a committed archive. Returns its path.
    pub fn abort(&self) -> Option<PathBuf> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, GateState::Aborted) {
            GateState::Committed(path) => {
                match std::fs::remove_file(&path) {
                    Ok(()) => info!("Removed abandoned archive {}", path.display()),
                    Err(err) => {
                        warn!("Failed to remove abandoned archive {}: {}", path.display(), err);
                    },
                }
                Some(path)
            },
            GateState::Open | GateState::Aborted => None,
        }
    }

    /// Guard that aborts this gate when dropped, unless disarmed.
    #[must_use]
    pub fn abort_on_drop(&self) -> AbortOnDrop {
        AbortOnDrop {
            gate: Some(self.clone()),
        }
    }

    fn is_aborted(&self) -> bool {
        matches!(*self.state.lock(), GateState::Aborted)
    }

    fn commit(&self, persist: impl FnOnce() -> Result<PathBuf>) -> Result<PathBuf> {
        let mut state = self.state.lock();
        if matches!(*state, GateState::Aborted) {
            return Err(Error::Cancelled("archive write abandoned".to_string()));
        }
        let path = persist()?;
        *state = GateState::Committed(path.clone());
        Ok(path)
    }
}

/// Aborts a [`CommitGate`] on drop unless [`AbortOnDrop::disarm`] was called.
#[derive(Debug)]
pub struct AbortOnDrop {
    gate: Option<CommitGate>,
}

impl AbortOnDrop {
    /// Keep whatever was committed.
    pub fn disarm(mut self) {
        self.gate = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.abort();
        }
    }
}

/// Writes archives atomically.
#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    destination: Destination,
    compression: CompressionMethod,
    gate: CommitGate,
}

impl ArchiveWriter {
    /// Writer for an archive at exactly `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_destination(Destination::Exact(path.into()))
    }

    /// Writer for the first free `<stem>.pgz`, `<stem>-1.pgz`, ... in `dir`.
    ///
    /// A name is claimed by the final no-clobber rename, so concurrent
    /// writers with the same stem each end up with their own file.
    #[must_use]
    pub fn unique_in(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self::with_destination(Destination::Unique {
            dir: dir.into(),
            stem: stem.into(),
        })
    }

    fn with_destination(destination: Destination) -> Self {
        Self {
            destination,
            compression: CompressionMethod::Deflated,
            gate: CommitGate::new(),
        }
    }

    /// Store entries without compression.
    #[must_use]
    pub const fn stored(mut self) -> Self {
        self.compression = CompressionMethod::Stored;
        self
    }

    /// Commit through `gate` so the caller can abandon the write.
    #[must_use]
    pub fn with_gate(mut self, gate: CommitGate) -> Self {
        self.gate = gate;
        self
    }

    fn directory(&self) -> &Path {
        match &self.destination {
            Destination::Exact(path) => path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new(".")),
            Destination::Unique { dir, .. } => dir,
        }
    }

    /// Write the manifest and every resource payload.
    ///
    /// Fails with [`Error::Packaging`] on any I/O or encoding error, and
    /// with [`Error::Cancelled`] when the gate was aborted; the destination
    /// is then left untouched. An existing file is never overwritten.
    pub fn write(
        &self,
        manifest: &ArchiveManifest,
        resources: &[Arc<CachedResource>],
    ) -> Result<WrittenArchive> {
        self.write_entries(manifest, resources, |r| r.key.entry_id())
            .map_err(|e| match e {
                Error::Packaging(_) | Error::Cancelled(_) => e,
                other => Error::Packaging(format!("{}: {other}", self.directory().display())),
            })
    }

    fn write_entries(
        &self,
        manifest: &ArchiveManifest,
        resources: &[Arc<CachedResource>],
        entry_id: impl Fn(&CachedResource) -> String,
    ) -> Result<WrittenArchive> {
        let mut temp = NamedTempFile::new_in(self.directory())?;

        {
            let mut zip = ZipWriter::new(temp.as_file_mut());
            let options = FileOptions::default().compression_method(self.compression);

            zip.start_file(MANIFEST_ENTRY, options).map_err(zip_error)?;
            zip.write_all(&serde_json::to_vec_pretty(manifest)?)?;

            let mut written: HashMap<String, &ResourceKey> = HashMap::new();
            for resource in resources {
                if self.gate.is_aborted() {
                    return Err(Error::Cancelled("archive write abandoned".to_string()));
                }
                let entry = format!("{RESOURCE_PREFIX}{}", entry_id(resource));
                match written.get(&entry) {
                    Some(key) if **key == resource.key => continue,
                    Some(key) => {
                        return Err(Error::Packaging(format!(
                            "entry {entry} claimed by both {key} and {}",
                            resource.key
                        )));
                    },
                    None => {},
                }
                zip.start_file(entry.as_str(), options).map_err(zip_error)?;
                zip.write_all(&resource.payload)?;
                written.insert(entry, &resource.key);
            }

            zip.finish().map_err(zip_error)?;
        }

        temp.as_file().sync_all()?;
        let size = temp.as_file().metadata()?.len();
        let path = self.gate.commit(|| self.persist(temp))?;

        info!(
            "Wrote archive {} ({} resources, {} bytes)",
            path.display(),
            manifest.resources.len(),
            size
        );
        Ok(WrittenArchive { path, size })
    }

    fn persist(&self, temp: NamedTempFile) -> Result<PathBuf> {
        match &self.destination {
            Destination::Exact(path) => {
                temp.persist_noclobber(path)
                    .map_err(|e| Error::Packaging(format!("{}: {}", path.display(), e.error)))?;
                Ok(path.clone())
            },
            Destination::Unique { dir, stem } => {
                let mut temp = temp;
                for attempt in 0..MAX_NAME_ATTEMPTS {
                    let candidate =
                        Directories::archive_candidate(dir, stem, ARCHIVE_EXTENSION, attempt);
                    match temp.persist_noclobber(&candidate) {
                        Ok(_) => return Ok(candidate),
                        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                            debug!("Archive name {} taken", candidate.display());
                            temp = e.file;
                        },
                        Err(e) => {
                            return Err(Error::Packaging(format!(
                                "{}: {}",
                                candidate.display(),
                                e.error
                            )));
                        },
                    }
                }
                Err(Error::Packaging(format!(
                    "no free archive name for {stem} in {}",
                    dir.display()
                )))
            },
        }
    }
}

fn zip_error(err: zip::result::ZipError) -> Error {
    Error::Packaging(err.to_string())
}

/// Location of a resource payload inside the archive file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryLocation {
    /// Zip entry name.
    pub entry: String,
    /// Offset of the compressed data from the start of the file.
    pub data_offset: u64,
    /// Compressed size.
    pub compressed_size: u64,
    /// Uncompressed size.
    pub size: u64,
}

/// Random-access reader over an archive file.
pub struct ArchiveReader {
    path: PathBuf,
    zip: ZipArchive<File>,
    manifest: ArchiveManifest,
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("path", &self.path)
            .field("resources", &self.manifest.resources.len())
            .finish_non_exhaustive()
    }
}

impl ArchiveReader {
    /// Open an archive and read its manifest.
    ///
    /// Only the central directory and the manifest are read. Fails with
    /// [`Error::ArchiveCorrupt`] when the file is missing, not a zip, has no
    /// readable manifest, or lists entries that are absent.
    pub fn open(path: &Path) -> Result<Self> {
        let corrupt = |reason: String| Error::ArchiveCorrupt {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path).map_err(|e| corrupt(e.to_string()))?;
        let mut zip = ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;

        let manifest: ArchiveManifest = {
            let mut entry = zip
                .by_name(MANIFEST_ENTRY)
                .map_err(|e| corrupt(format!("{MANIFEST_ENTRY}: {e}")))?;
            let mut buf = Vec::new();
            entry
                .read_to_end(&mut buf)
                .map_err(|e| corrupt(format!("{MANIFEST_ENTRY}: {e}")))?;
            serde_json::from_slice(&buf).map_err(|e| corrupt(format!("{MANIFEST_ENTRY}: {e}")))?
        };

        if manifest.version > FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported archive version {} (max supported: {FORMAT_VERSION})",
                manifest.version
            )));
        }

        let names: HashSet<&str> = zip.file_names().collect();
        if let Some(missing) = manifest
            .resources
            .iter()
            .find(|entry| !names.contains(entry.entry.as_str()))
        {
            return Err(corrupt(format!("missing entry {}", missing.entry)));
        }

        debug!(
            "Opened archive {} with {} resources",
            path.display(),
            manifest.resources.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            zip,
            manifest,
        })
    }

    /// Archive path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parsed manifest.
    #[must_use]
    pub const fn manifest(&self) -> &ArchiveManifest {
        &self.manifest
    }

    /// Where an entry's data lives in the file.
    pub fn locate(&mut self, entry: &str) -> Result<EntryLocation> {
        let path = self.path.clone();
        let file = self.zip.by_name(entry).map_err(|e| Error::ArchiveCorrupt {
            path,
            reason: format!("{entry}: {e}"),
        })?;
        Ok(EntryLocation {
            entry: entry.to_string(),
            data_offset: file.data_start(),
            compressed_size: file.compressed_size(),
            size: file.size(),
        })
    }

    /// Decompress one entry.
    pub fn read_entry(&mut self, entry: &str) -> Result<Vec<u8>> {
        let corrupt = |reason: String| Error::ArchiveCorrupt {
            path: self.path.clone(),
            reason: format!("{entry}: {reason}"),
        };
        let mut file = self.zip.by_name(entry).map_err(|e| corrupt(e.to_string()))?;
        let mut buf = Vec::with_capacity(usize::try_from(file.size()).unwrap_or(0));
        file.read_to_end(&mut buf).map_err(|e| corrupt(e.to_string()))?;
        Ok(buf)
    }

    /// Payload of a resource by key.
    pub fn read_resource(&mut self, key: &ResourceKey) -> Result<Vec<u8>> {
        let entry = self
            .manifest
            .entry(key)
            .map(|entry| entry.entry.clone())
            .ok_or_else(|| Error::ArchiveCorrupt {
                path: self.path.clone(),
                reason: format!("no resource for key {key}"),
            })?;
        self.read_entry(&entry)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use crate::resource::ResourceRequest;
    use tempfile::TempDir;

    pub(crate) fn resource(url: &str, body: &[u8], content_type: &str) -> Arc<CachedResource> {
        let request = ResourceRequest::get(url).unwrap();
        Arc::new(CachedResource {
            key: request.key(),
            url: request.url.clone(),
            method: "GET".to_string(),
            status: 200,
            content_type: Some(content_type.to_string()),
            payload: body.to_vec(),
            kind: request.kind,
            fetched_at: Utc::now(),
        })
    }

    pub(crate) fn manifest_for(resources: &[Arc<CachedResource>]) -> ArchiveManifest {
        ArchiveManifest::build(
            CaptureMetadata {
                source_url: resources[0].url.to_string(),
                final_url: resources[0].url.to_string(),
                title: Some("Example".to_string()),
                document: resources[0].key.clone(),
                profile: "default".to_string(),
                captured_at: Utc::now(),
                duration_ms: 42,
                failures: Vec::new(),
            },
            resources,
        )
    }

    #[test]
    fn test_write_then_read_resources() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("page.pgz");
        let resources = vec![
            resource("https://example.com/", b"<html></html>", "text/html"),
            resource("https://example.com/a.css", b"body{}", "text/css"),
        ];
        let manifest = manifest_for(&resources);

        let written = ArchiveWriter::new(&path).write(&manifest, &resources).unwrap();
        assert_eq!(written.path, path);
        assert_eq!(written.size, std::fs::metadata(&path).unwrap().len());

        let mut reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(reader.manifest(), &manifest);
        assert_eq!(reader.read_resource(&resources[1].key).unwrap(), b"body{}");

        let location = reader.locate(&manifest.resources[0].entry).unwrap();
        assert_eq!(location.size, 13);
        assert!(location.data_offset > 0);
    }

    #[test]
    fn test_write_does_not_overwrite_existing_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("page.pgz");
        std::fs::write(&path, b"keep me").unwrap();
        let resources = vec![resource("https://example.com/", b"x", "text/html")];

        let err = ArchiveWriter::new(&path)
            .write(&manifest_for(&resources), &resources)
            .unwrap_err();

        assert!(matches!(err, Error::Packaging(_)));
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1, "no temp file left");
    }

    #[test]
    fn test_write_into_missing_directory_fails_cleanly() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("absent").join("page.pgz");
        let resources = vec![resource("https://example.com/", b"x", "text/html")];

        let err = ArchiveWriter::new(&path)
            .write(&manifest_for(&resources), &resources)
            .unwrap_err();

        assert!(matches!(err, Error::Packaging(_)));
        assert!(!path.exists());
    }

    #[test]
    fn test_open_rejects_non_archives() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("junk.pgz");
        std::fs::write(&path, b"definitely not a zip").unwrap();

        assert!(matches!(
            ArchiveReader::open(&path),
            Err(Error::ArchiveCorrupt { .. })
        ));
        assert!(matches!(
            ArchiveReader::open(&temp.path().join("missing.pgz")),
            Err(Error::ArchiveCorrupt { .. })
        ));
    }

    #[test]
    fn test_open_rejects_manifest_with_missing_entries() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("page.pgz");
        let resources = vec![resource("https://example.com/", b"x", "text/html")];
        let mut manifest = manifest_for(&resources);
        manifest.resources.push(ManifestEntry {
            entry: "resources/rs_0000000000000000".to_string(),
            ..manifest.resources[0].clone()
        });

        ArchiveWriter::new(&path).write(&manifest, &resources).unwrap();
        let err = ArchiveReader::open(&path).unwrap_err();
        assert!(err.to_string().contains("missing entry"));
    }

    #[test]
    fn test_unique_writer_skips_taken_names() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("Example.pgz"), b"older").unwrap();
        let resources = vec![resource("https://example.com/", b"x", "text/html")];
        let manifest = manifest_for(&resources);
        let writer = ArchiveWriter::unique_in(temp.path(), "Example");

        let first = writer.write(&manifest, &resources).unwrap();
        let second = writer.write(&manifest, &resources).unwrap();

        assert_eq!(first.path, temp.path().join("Example-1.pgz"));
        assert_eq!(second.path, temp.path().join("Example-2.pgz"));
        assert_eq!(std::fs::read(temp.path().join("Example.pgz")).unwrap(), b"older");
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 3);
    }

    #[test]
    fn test_concurrent_unique_writers_never_share_a_name() {
        let temp = TempDir::new().unwrap();
        let resources = vec![resource("https://example.com/", b"x", "text/html")];
        let manifest = manifest_for(&resources);

        let paths: HashSet<PathBuf> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let (manifest, resources) = (&manifest, &resources);
                    let dir = temp.path();
                    scope.spawn(move || {
                        ArchiveWriter::unique_in(dir, "Same")
                            .write(manifest, resources)
                            .unwrap()
                            .path
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(paths.len(), 8);
        assert!(paths.contains(&temp.path().join("Same.pgz")));
        for path in &paths {
            ArchiveReader::open(path).unwrap();
        }
    }

    #[test]
    fn test_duplicate_resource_is_stored_once() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("page.pgz");
        let doc = resource("https://example.com/", b"x", "text/html");
        let resources = vec![doc.clone(), doc];

        ArchiveWriter::new(&path)
            .write(&manifest_for(&resources), &resources)
            .unwrap();

        let file = File::open(&path).unwrap();
        assert_eq!(ZipArchive::new(file).unwrap().len(), 2);
    }

    #[test]
    fn test_distinct_keys_sharing_an_entry_are_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("page.pgz");
        let doc = resource("https://example.com/", b"x", "text/html");
        let mut impostor = (*resource("https://example.com/other", b"y", "text/html")).clone();
        impostor.key = ResourceKey::from_raw("GET https://example.com/other#shadow");
        let impostor = Arc::new(impostor);
        let resources = vec![doc, impostor.clone()];
        let manifest = manifest_for(&resources);

        // Force both keys onto one entry name.
        let clash = ArchiveWriter::new(&path).write_entries(&manifest, &resources, |r| {
            if r.key == impostor.key {
                resources[0].key.entry_id()
            } else {
                r.key.entry_id()
            }
        });

        assert!(matches!(clash, Err(Error::Packaging(ref m)) if m.contains("claimed by both")));
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_aborted_gate_blocks_commit() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("page.pgz");
        let resources = vec![resource("https://example.com/", b"x", "text/html")];
        let gate = CommitGate::new();
        assert_eq!(gate.abort(), None);

        let err = ArchiveWriter::new(&path)
            .with_gate(gate)
            .write(&manifest_for(&resources), &resources)
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled(_)));
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_abort_after_commit_removes_archive() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("page.pgz");
        let resources = vec![resource("https://example.com/", b"x", "text/html")];
        let gate = CommitGate::new();

        ArchiveWriter::new(&path)
            .with_gate(gate.clone())
            .write(&manifest_for(&resources), &resources)
            .unwrap();
        assert!(path.exists());

        assert_eq!(gate.abort(), Some(path.clone()));
        assert!(!path.exists());
        assert_eq!(gate.abort(), None);
    }

    #[test]
    fn test_dropped_guard_aborts_unless_disarmed() {
        let temp = TempDir::new().unwrap();
        let resources = vec![resource("https://example.com/", b"x", "text/html")];
        let manifest = manifest_for(&resources);

        let kept = CommitGate::new();
        let guard = kept.abort_on_drop();
        let written = ArchiveWriter::new(temp.path().join("kept.pgz"))
            .with_gate(kept)
            .write(&manifest, &resources)
            .unwrap();
        guard.disarm();
        assert!(written.path.exists());

        let dropped = CommitGate::new();
        let guard = dropped.abort_on_drop();
        let written = ArchiveWriter::new(temp.path().join("dropped.pgz"))
            .with_gate(dropped)
            .write(&manifest, &resources)
            .unwrap();
        drop(guard);
        assert!(!written.path.exists());
    }
}
