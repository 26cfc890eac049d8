//! In-memory catalog store
//!
//! Behaves like a catalog backend: objects carry a checksum registered when they are written,
//! folders carry multi-valued metadata attributes. All sessions created from one
//! [`MemoryStore`] see the same objects.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use super::{Error, FileHandle, HandleCache, ObjType, Reader, Storage, Writer};

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File { data: Arc<Vec<u8>>, checksum: String },
}

#[derive(Debug, Clone)]
struct Entry {
    node: Node,
    modified: DateTime<Utc>,
    metadata: BTreeMap<String, Vec<String>>,
}

impl Entry {
    fn dir(modified: DateTime<Utc>) -> Self {
        Self {
            node: Node::Dir,
            modified,
            metadata: BTreeMap::new(),
        }
    }

    fn file(data: Vec<u8>, modified: DateTime<Utc>) -> Self {
        let checksum = hex::encode(Sha256::digest(&data));
        Self {
            node: Node::File {
                data: Arc::new(data),
                checksum,
            },
            modified,
            metadata: BTreeMap::new(),
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self.node, Node::Dir)
    }
}

type Objects = Arc<Mutex<HashMap<PathBuf, Entry>>>;

/// Shared object space behind every memory session
#[derive(Debug, Clone)]
pub struct MemoryStore {
    objects: Objects,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn key(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::from("/");
    normalized.extend(path.components().filter_map(|component| match component {
        std::path::Component::Normal(part) => Some(part),
        _ => None,
    }));
    normalized
}

fn insert_parents(objects: &mut HashMap<PathBuf, Entry>, path: &Path, modified: DateTime<Utc>) {
    for ancestor in path.ancestors().skip(1) {
        objects
            .entry(ancestor.to_owned())
            .or_insert_with(|| Entry::dir(modified));
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut objects = HashMap::new();
        objects.insert(PathBuf::from("/"), Entry::dir(Utc::now()));
        Self {
            objects: Arc::new(Mutex::new(objects)),
        }
    }

    /// Open a new session with its own handle cache
    pub fn session(&self) -> MemoryStorage {
        MemoryStorage {
            objects: self.objects.clone(),
            cache: HandleCache::default(),
        }
    }

    /// Store a file, creating missing parent folders
    pub fn put_file(&self, path: &str, data: &[u8], modified: DateTime<Utc>) {
        let path = key(Path::new(path));
        let mut objects = self.objects.lock().unwrap();
        insert_parents(&mut objects, &path, modified);
        objects.insert(path, Entry::file(data.to_vec(), modified));
    }

    /// Store a file whose registered checksum differs from its content
    pub fn put_corrupt_file(
        &self,
        path: &str,
        data: &[u8],
        checksum: &str,
        modified: DateTime<Utc>,
    ) {
        self.put_file(path, data, modified);
        let mut objects = self.objects.lock().unwrap();
        if let Some(Entry {
            node: Node::File { checksum: stored, .. },
            ..
        }) = objects.get_mut(&key(Path::new(path)))
        {
            *stored = checksum.to_string();
        }
    }

    pub fn put_dir(&self, path: &str) {
        let path = key(Path::new(path));
        let now = Utc::now();
        let mut objects = self.objects.lock().unwrap();
        insert_parents(&mut objects, &path, now);
        objects.entry(path).or_insert_with(|| Entry::dir(now));
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        match &self.objects.lock().unwrap().get(&key(Path::new(path)))?.node {
            Node::File { data, .. } => Some(data.as_ref().clone()),
            Node::Dir => None,
        }
    }

    pub fn modified(&self, path: &str) -> Option<DateTime<Utc>> {
        self.objects
            .lock()
            .unwrap()
            .get(&key(Path::new(path)))
            .map(|entry| entry.modified)
    }

    /// Every value of a metadata attribute
    pub fn metadata(&self, path: &str, name: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .get(&key(Path::new(path)))
            .and_then(|entry| entry.metadata.get(name).cloned())
            .unwrap_or_default()
    }

    pub fn set_metadata(&self, path: &str, name: &str, value: &str) {
        if let Some(entry) = self.objects.lock().unwrap().get_mut(&key(Path::new(path))) {
            entry
                .metadata
                .insert(name.to_string(), vec![value.to_string()]);
        }
    }
}

/// One session on a [`MemoryStore`]
#[derive(Debug)]
pub struct MemoryStorage {
    objects: Objects,
    cache: HandleCache,
}

impl MemoryStorage {
    fn with_entry<T>(&self, path: &Path, f: impl FnOnce(&Entry) -> T) -> Result<T> {
        let objects = self.objects.lock().unwrap();
        let entry = objects
            .get(&key(path))
            .ok_or_else(|| Error::NotFound(path.to_owned()))?;
        Ok(f(entry))
    }

    fn with_entry_mut<T>(&self, path: &Path, f: impl FnOnce(&mut Entry) -> T) -> Result<T> {
        let mut objects = self.objects.lock().unwrap();
        let entry = objects
            .get_mut(&key(path))
            .ok_or_else(|| Error::NotFound(path.to_owned()))?;
        Ok(f(entry))
    }

    fn handle(path: &Path, entry: &Entry) -> FileHandle {
        let (obj_type, size) = match &entry.node {
            Node::Dir => (ObjType::Dir, 0),
            Node::File { data, .. } => (ObjType::File, data.len() as u64),
        };
        FileHandle::new(path.to_owned(), obj_type, size, entry.modified, true)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn list(&self, path: &Path) -> Result<Vec<Arc<FileHandle>>> {
        let dir = key(path);
        let children: Vec<(PathBuf, Entry)> = {
            let objects = self.objects.lock().unwrap();
            match objects.get(&dir) {
                Some(entry) if entry.is_dir() => {}
                Some(_) => return Err(anyhow!("{:?} is not a folder", path)),
                None => return Err(Error::NotFound(path.to_owned()).into()),
            }
            objects
                .iter()
                .filter(|(child, _)| child.parent() == Some(dir.as_path()))
                .map(|(child, entry)| (child.clone(), entry.clone()))
                .collect()
        };
        Ok(children
            .into_iter()
            .map(|(child, entry)| {
                self.cache
                    .get(&child)
                    .unwrap_or_else(|| self.cache.insert(Self::handle(&child, &entry)))
            })
            .collect())
    }

    async fn stat(&self, path: &Path) -> Result<Arc<FileHandle>> {
        let path = key(path);
        if let Some(handle) = self.cache.get(&path) {
            return Ok(handle);
        }
        let handle = self.with_entry(&path, |entry| Self::handle(&path, entry))?;
        Ok(self.cache.insert(handle))
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(&key(path)))
    }

    async fn is_dir(&self, path: &Path) -> Result<bool> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&key(path))
            .is_some_and(Entry::is_dir))
    }

    async fn open(&self, path: &Path) -> Result<Reader> {
        let data = self.with_entry(path, |entry| match &entry.node {
            Node::File { data, .. } => Ok(data.clone()),
            Node::Dir => Err(anyhow!("{:?} is a folder", path)),
        })??;
        Ok(Box::new(std::io::Cursor::new(data.as_ref().clone())))
    }

    async fn create(&self, path: &Path) -> Result<Writer> {
        let path = key(path);
        self.cache.invalidate(&path);
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("cannot create the root object"))?;
        if !self.is_dir(parent).await? {
            return Err(Error::NotFound(parent.to_owned()).into());
        }
        Ok(Box::new(MemoryWriter {
            objects: self.objects.clone(),
            path,
            buffer: Vec::new(),
        }))
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let path = key(path);
        self.cache.invalidate(&path);
        let mut objects = self.objects.lock().unwrap();
        if objects
            .keys()
            .any(|other| other.parent() == Some(path.as_path()))
        {
            return Err(anyhow!("{:?} is not empty", path));
        }
        objects
            .remove(&path)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(path.clone()).into())
    }

    async fn set_modified(&self, path: &Path, modified: DateTime<Utc>) -> Result<()> {
        self.cache.invalidate(&key(path));
        self.with_entry_mut(path, |entry| entry.modified = modified)
    }

    async fn compute_checksum(&self, path: &Path) -> Result<String> {
        self.with_entry(path, |entry| match &entry.node {
            Node::File { checksum, .. } => Ok(checksum.clone()),
            Node::Dir => Err(anyhow!("{:?} is a folder", path)),
        })?
    }

    async fn make_dir(&self, path: &Path, recursive: bool) -> Result<()> {
        let path = key(path);
        let mut objects = self.objects.lock().unwrap();
        if let Some(entry) = objects.get(&path) {
            if entry.is_dir() {
                return Ok(());
            }
            return Err(anyhow!("{:?} exists and is not a folder", path));
        }
        let now = Utc::now();
        if recursive {
            insert_parents(&mut objects, &path, now);
        } else if let Some(parent) = path.parent() {
            if !objects.get(parent).is_some_and(Entry::is_dir) {
                return Err(Error::NotFound(parent.to_owned()).into());
            }
        }
        objects.insert(path, Entry::dir(now));
        Ok(())
    }

    async fn metadata(&self, path: &Path, name: &str) -> Result<Option<String>> {
        self.with_entry(path, |entry| {
            entry
                .metadata
                .get(name)
                .and_then(|values| values.first().cloned())
        })
    }

    async fn set_metadata(&self, path: &Path, name: &str, value: &str) -> Result<()> {
        self.with_entry_mut(path, |entry| {
            let values = entry.metadata.entry(name.to_string()).or_default();
            if !values.iter().any(|existing| existing == value) {
                values.push(value.to_string());
            }
        })
    }

    async fn remove_metadata(&self, path: &Path, name: &str) -> Result<()> {
        self.with_entry_mut(path, |entry| {
            entry.metadata.remove(name);
        })
    }

    async fn refresh(&self) -> Result<()> {
        self.cache.clear();
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.cache.clear();
        Ok(())
    }
}

/// Buffers written data and registers the object on shutdown
struct MemoryWriter {
    objects: Objects,
    path: PathBuf,
    buffer: Vec<u8>,
}

impl tokio::io::AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.get_mut().buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let data = std::mem::take(&mut this.buffer);
        this.objects
            .lock()
            .unwrap()
            .insert(this.path.clone(), Entry::file(data, Utc::now()));
        Poll::Ready(Ok(()))
    }
}
