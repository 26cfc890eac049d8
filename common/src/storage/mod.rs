//! Storage backend contract shared by every adapter
//!
//! The replication engine never talks to a protocol directly. It holds [`Storage`] sessions
//! produced by a [`Registry`], which maps a backend name (`local`, `memory`, ...) to a session
//! factory. Every session owns its own connection state and a [`HandleCache`], so sessions are
//! never shared between concurrent workers.

use anyhow::{Context, Result, anyhow};
use async_recursion::async_recursion;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub mod local;
pub mod memory;

pub type Reader = Box<dyn AsyncRead + Send + Unpin>;
pub type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Backend options given as `key=value` pairs
pub type Options = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown storage backend '{0}', use --list-fs to see the available backends")]
    UnknownBackend(String),
    #[error("backend '{backend}' does not accept option '{option}'")]
    UnknownOption { backend: String, option: String },
    #[error("{operation} is not supported by the '{backend}' backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },
    #[error("no such object: {0:?}")]
    NotFound(PathBuf),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ObjType {
    File,
    Dir,
}

/// One object as seen by the backend session that resolved it
#[derive(Debug)]
pub struct FileHandle {
    path: PathBuf,
    obj_type: ObjType,
    size: u64,
    modified: DateTime<Utc>,
    accessible: bool,
    checksum: tokio::sync::OnceCell<String>,
}

impl FileHandle {
    pub fn new(
        path: PathBuf,
        obj_type: ObjType,
        size: u64,
        modified: DateTime<Utc>,
        accessible: bool,
    ) -> Self {
        Self {
            path,
            obj_type,
            size,
            modified,
            accessible,
            checksum: tokio::sync::OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last path component
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    pub fn is_dir(&self) -> bool {
        self.obj_type == ObjType::Dir
    }

    pub fn is_file(&self) -> bool {
        self.obj_type == ObjType::File
    }

    pub fn is_accessible(&self) -> bool {
        self.accessible
    }

    /// Seed the checksum with a known value so it is never computed.
    /// Returns false if a checksum was already present.
    pub fn preset_checksum(&self, checksum: String) -> bool {
        self.checksum.set(checksum).is_ok()
    }

    /// Content checksum, computed through `storage` at most once per handle
    pub async fn checksum(&self, storage: &dyn Storage) -> Result<String> {
        self.checksum
            .get_or_try_init(|| storage.compute_checksum(&self.path))
            .await
            .cloned()
    }
}

/// Per-session cache of resolved handles, keyed by path
#[derive(Debug, Default)]
pub struct HandleCache {
    handles: std::sync::Mutex<HashMap<PathBuf, Arc<FileHandle>>>,
}

impl HandleCache {
    pub fn get(&self, path: &Path) -> Option<Arc<FileHandle>> {
        self.handles.lock().unwrap().get(path).cloned()
    }

    pub fn insert(&self, handle: FileHandle) -> Arc<FileHandle> {
        let handle = Arc::new(handle);
        self.handles
            .lock()
            .unwrap()
            .insert(handle.path().to_owned(), handle.clone());
        handle
    }

    pub fn invalidate(&self, path: &Path) {
        self.handles.lock().unwrap().remove(path);
    }

    pub fn clear(&self) {
        self.handles.lock().unwrap().clear();
    }
}

/// Capabilities every storage backend provides to the replication engine
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Registry name of this backend
    fn backend(&self) -> &'static str;

    /// Children of a directory
    async fn list(&self, path: &Path) -> Result<Vec<Arc<FileHandle>>>;

    /// Resolve the handle of one object
    async fn stat(&self, path: &Path) -> Result<Arc<FileHandle>>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    async fn is_dir(&self, path: &Path) -> Result<bool>;

    async fn open(&self, path: &Path) -> Result<Reader>;

    /// Create (or truncate) an object for writing. The object is complete once the writer has
    /// been shut down.
    async fn create(&self, path: &Path) -> Result<Writer>;

    async fn delete(&self, path: &Path) -> Result<()>;

    async fn modified(&self, path: &Path) -> Result<DateTime<Utc>> {
        Ok(self.stat(path).await?.modified())
    }

    async fn set_modified(&self, path: &Path, modified: DateTime<Utc>) -> Result<()>;

    /// Hex SHA-256 of the object content. Backends with a native checksum override this.
    async fn compute_checksum(&self, path: &Path) -> Result<String> {
        let reader = self.open(path).await?;
        crate::checksum::sha256_reader(reader)
            .await
            .with_context(|| format!("failed computing checksum of {:?}", path))
    }

    async fn make_dir(&self, path: &Path, recursive: bool) -> Result<()>;

    /// First value of a metadata attribute on a folder, `None` if the attribute is absent
    async fn metadata(&self, _path: &Path, _name: &str) -> Result<Option<String>> {
        Err(Error::Unsupported {
            backend: self.backend(),
            operation: "reading metadata",
        }
        .into())
    }

    /// Add a value to a metadata attribute
    async fn set_metadata(&self, _path: &Path, _name: &str, _value: &str) -> Result<()> {
        Err(Error::Unsupported {
            backend: self.backend(),
            operation: "writing metadata",
        }
        .into())
    }

    /// Drop every value of a metadata attribute
    async fn remove_metadata(&self, _path: &Path, _name: &str) -> Result<()> {
        Err(Error::Unsupported {
            backend: self.backend(),
            operation: "removing metadata",
        }
        .into())
    }

    /// Re-establish the session, dropping any cached state
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    /// Release the session
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

type Factory = Arc<dyn Fn(&Options) -> Result<Box<dyn Storage>> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    options_help: &'static str,
    factory: Factory,
}

/// Backend name to session factory mapping
#[derive(Clone, Default)]
pub struct Registry {
    backends: BTreeMap<String, Registration>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_list().entries(self.backends.keys()).finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in backend
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("local", "", |options| {
            reject_options("local", options)?;
            Ok(Box::new(local::LocalStorage::new()))
        });
        let store = memory::MemoryStore::new();
        registry.register("memory", "", move |options| {
            reject_options("memory", options)?;
            Ok(Box::new(store.session()))
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, options_help: &'static str, factory: F)
    where
        F: Fn(&Options) -> Result<Box<dyn Storage>> + Send + Sync + 'static,
    {
        self.backends.insert(
            name.to_string(),
            Registration {
                options_help,
                factory: Arc::new(factory),
            },
        );
    }

    /// Open a new session on the named backend
    pub fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Storage>> {
        let registration = self
            .backends
            .get(&endpoint.backend)
            .ok_or_else(|| Error::UnknownBackend(endpoint.backend.clone()))?;
        (registration.factory)(&endpoint.options)
            .with_context(|| format!("failed connecting to '{}' backend", endpoint.backend))
    }

    /// Backend names with their option help text
    pub fn describe(&self) -> impl Iterator<Item = (&str, &'static str)> {
        self.backends
            .iter()
            .map(|(name, registration)| (name.as_str(), registration.options_help))
    }
}

fn reject_options(backend: &str, options: &Options) -> Result<()> {
    if let Some(option) = options.keys().next() {
        return Err(Error::UnknownOption {
            backend: backend.to_string(),
            option: option.clone(),
        }
        .into());
    }
    Ok(())
}

/// Backend name plus its connection options
#[derive(Clone, Debug, Default)]
pub struct Endpoint {
    pub backend: String,
    pub options: Options,
}

impl Endpoint {
    pub fn new(backend: &str, options: Options) -> Self {
        Self {
            backend: backend.to_string(),
            options,
        }
    }
}

/// Everything needed to open fresh sessions on one endpoint
#[derive(Clone, Debug)]
pub struct Connector {
    registry: Registry,
    endpoint: Endpoint,
}

impl Connector {
    pub fn new(registry: Registry, endpoint: Endpoint) -> Self {
        Self { registry, endpoint }
    }

    pub fn connect(&self) -> Result<Box<dyn Storage>> {
        self.registry.connect(&self.endpoint)
    }
}

/// Stream one object from `src` to `dst`, returning the number of bytes written
pub async fn transfer(
    src: &dyn Storage,
    src_path: &Path,
    dst: &dyn Storage,
    dst_path: &Path,
) -> Result<u64> {
    let mut reader = src
        .open(src_path)
        .await
        .with_context(|| format!("cannot open {:?} for reading", src_path))?;
    let mut writer = dst
        .create(dst_path)
        .await
        .with_context(|| format!("cannot create {:?}", dst_path))?;
    let bytes = tokio::io::copy(&mut reader, &mut writer)
        .await
        .with_context(|| format!("failed copying {:?} to {:?}", src_path, dst_path))?;
    writer
        .shutdown()
        .await
        .with_context(|| format!("failed finalizing {:?}", dst_path))?;
    Ok(bytes)
}

/// Files directly under `dir` whose name matches a glob.
/// The pattern may carry a leading directory part, e.g. `reports/*.json`.
pub async fn glob(
    storage: &dyn Storage,
    dir: &Path,
    pattern: &str,
) -> Result<Vec<Arc<FileHandle>>> {
    let (subdir, name_pattern) = match pattern.rsplit_once('/') {
        Some((subdir, name)) => (dir.join(subdir), name),
        None => (dir.to_owned(), pattern),
    };
    let matcher = globset::Glob::new(name_pattern)
        .with_context(|| format!("invalid glob pattern: {}", pattern))?
        .compile_matcher();
    if !storage.is_dir(&subdir).await? {
        return Ok(vec![]);
    }
    let mut matches: Vec<Arc<FileHandle>> = storage
        .list(&subdir)
        .await?
        .into_iter()
        .filter(|entry| entry.is_file() && matcher.is_match(entry.name()))
        .collect();
    matches.sort_by(|a, b| a.path().cmp(b.path()));
    Ok(matches)
}

/// Most recent modification time of any file in the subtree, `None` for an empty subtree
#[async_recursion]
pub async fn newest_mtime(storage: &dyn Storage, path: &Path) -> Result<Option<DateTime<Utc>>> {
    let mut newest = None;
    for entry in storage.list(path).await? {
        let mtime = if entry.is_dir() {
            newest_mtime(storage, entry.path()).await?
        } else {
            Some(entry.modified())
        };
        newest = newest.max(mtime);
    }
    Ok(newest)
}

/// Subdirectories of `path`, optionally dropping the ones that cannot be entered
pub async fn list_dirs(
    storage: &dyn Storage,
    path: &Path,
    skip_inaccessible: bool,
) -> Result<Vec<Arc<FileHandle>>> {
    let mut dirs: Vec<Arc<FileHandle>> = storage
        .list(path)
        .await?
        .into_iter()
        .filter(|entry| entry.is_dir() && (!skip_inaccessible || entry.is_accessible()))
        .collect();
    dirs.sort_by(|a, b| a.path().cmp(b.path()));
    Ok(dirs)
}

/// Time elapsed since `modified`, zero for timestamps in the future
pub fn age(modified: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    (now - modified).to_std().unwrap_or_default()
}

/// Parse `key=value,key=value` backend options
pub fn parse_options(options: &str) -> Result<Options> {
    let mut parsed = Options::new();
    for option in options.split(',').filter(|option| !option.is_empty()) {
        let (key, value) = option
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid option '{}', expected key=value", option))?;
        parsed.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options() {
        let options = parse_options("host=example.org,port=22").unwrap();
        assert_eq!(options.get("host").unwrap(), "example.org");
        assert_eq!(options.get("port").unwrap(), "22");
        assert!(parse_options("").unwrap().is_empty());
        assert!(parse_options("novalue").is_err());
    }

    #[test]
    fn test_registry_rejects_unknown_backend_and_options() {
        let registry = Registry::with_builtin();
        let names: Vec<&str> = registry.describe().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["local", "memory"]);
        let err = registry.connect(&Endpoint::new("ftp", Options::new())).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::UnknownBackend(_))));
        let options = parse_options("host=x").unwrap();
        assert!(registry.connect(&Endpoint::new("local", options)).is_err());
    }

    #[tokio::test]
    async fn test_memory_sessions_share_objects() -> Result<()> {
        let registry = Registry::with_builtin();
        let endpoint = Endpoint::new("memory", Options::new());
        let first = registry.connect(&endpoint)?;
        let second = registry.connect(&endpoint)?;
        first.make_dir(Path::new("/a"), false).await?;
        assert!(second.is_dir(Path::new("/a")).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_preset_checksum_skips_computation() -> Result<()> {
        let store = memory::MemoryStore::new();
        store.put_file("/f", b"data", Utc::now());
        let session = store.session();
        let handle = session.stat(Path::new("/f")).await?;
        assert!(handle.preset_checksum("abc".to_string()));
        assert_eq!(handle.checksum(&session).await?, "abc");
        assert!(!handle.preset_checksum("def".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_glob_and_newest_mtime() -> Result<()> {
        let store = memory::MemoryStore::new();
        let old = DateTime::from_timestamp(1_000, 0).unwrap();
        let new = DateTime::from_timestamp(2_000, 0).unwrap();
        store.put_file("/run/manifest.json", b"{}", old);
        store.put_file("/run/other.txt", b"", old);
        store.put_file("/run/deep/er/data.bin", b"x", new);
        let session = store.session();
        let found = glob(&session, Path::new("/run"), "*.json").await?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path(), Path::new("/run/manifest.json"));
        assert!(glob(&session, Path::new("/run"), "missing/*.json").await?.is_empty());
        let found = glob(&session, Path::new("/run"), "deep/er/*.BIN").await?;
        assert!(found.is_empty());
        let found = glob(&session, Path::new("/run"), "deep/er/*.bin").await?;
        assert_eq!(found.len(), 1);
        assert_eq!(newest_mtime(&session, Path::new("/run")).await?, Some(new));
        session.make_dir(Path::new("/empty"), false).await?;
        assert_eq!(newest_mtime(&session, Path::new("/empty")).await?, None);
        Ok(())
    }
}
