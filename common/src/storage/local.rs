use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

use super::{FileHandle, HandleCache, ObjType, Reader, Storage, Writer};

/// Local filesystem backend
#[derive(Debug, Default)]
pub struct LocalStorage {
    cache: HandleCache,
}

impl LocalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    async fn resolve(&self, path: &Path) -> Result<Arc<FileHandle>> {
        if let Some(handle) = self.cache.get(path) {
            return Ok(handle);
        }
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed reading metadata from {:?}", path))?;
        let modified: DateTime<Utc> = metadata
            .modified()
            .with_context(|| format!("no modification time for {:?}", path))?
            .into();
        let (obj_type, accessible) = if metadata.is_dir() {
            (ObjType::Dir, tokio::fs::read_dir(path).await.is_ok())
        } else {
            (ObjType::File, tokio::fs::File::open(path).await.is_ok())
        };
        Ok(self.cache.insert(FileHandle::new(
            path.to_owned(),
            obj_type,
            metadata.len(),
            modified,
            accessible,
        )))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn list(&self, path: &Path) -> Result<Vec<Arc<FileHandle>>> {
        let mut entries = tokio::fs::read_dir(path)
            .await
            .with_context(|| format!("cannot open directory {:?} for reading", path))?;
        let mut handles = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {:?}", path))?
        {
            handles.push(self.resolve(&entry.path()).await?);
        }
        Ok(handles)
    }

    async fn stat(&self, path: &Path) -> Result<Arc<FileHandle>> {
        self.resolve(path).await
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        tokio::fs::try_exists(path)
            .await
            .with_context(|| format!("cannot check existence of {:?}", path))
    }

    async fn is_dir(&self, path: &Path) -> Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("failed reading metadata from {:?}", path))
            }
        }
    }

    async fn open(&self, path: &Path) -> Result<Reader> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("cannot open {:?} for reading", path))?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &Path) -> Result<Writer> {
        self.cache.invalidate(path);
        let file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("cannot open {:?} for writing", path))?;
        Ok(Box::new(file))
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        self.cache.invalidate(path);
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("failed removing {:?}", path))
    }

    async fn set_modified(&self, path: &Path, modified: DateTime<Utc>) -> Result<()> {
        self.cache.invalidate(path);
        let mtime = filetime::FileTime::from_unix_time(
            modified.timestamp(),
            modified.timestamp_subsec_nanos(),
        );
        let owned = path.to_owned();
        tokio::task::spawn_blocking(move || filetime::set_file_times(&owned, mtime, mtime))
            .await?
            .with_context(|| format!("failed setting modification time of {:?}", path))
    }

    async fn make_dir(&self, path: &Path, recursive: bool) -> Result<()> {
        let result = if recursive {
            tokio::fs::create_dir_all(path).await
        } else {
            tokio::fs::create_dir(path).await
        };
        result.with_context(|| format!("cannot create directory {:?}", path))
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
