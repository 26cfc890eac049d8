//! Content hashing and checksum manifest generation
//!
//! Produces the manifests that the replicator consumes: either the text format
//! (`<hex>  <path>` per line) or the generic JSON format.

use anyhow::{Context, Result, anyhow};
use async_recursion::async_recursion;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::instrument;

const BUFFER_SIZE: usize = 1 << 20;

/// Hex SHA-256 of everything readable from `reader`
pub async fn sha256_reader<R: AsyncRead + Unpin>(mut reader: R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub async fn sha256_file(path: &Path) -> Result<String> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {:?} for reading", path))?;
    sha256_reader(file)
        .await
        .with_context(|| format!("failed hashing {:?}", path))
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Summary {
    pub files_hashed: usize,
    pub bytes_hashed: u64,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            files_hashed: self.files_hashed + other.files_hashed,
            bytes_hashed: self.bytes_hashed + other.bytes_hashed,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "files hashed: {}\nbytes hashed: {}",
            self.files_hashed,
            bytesize::ByteSize(self.bytes_hashed)
        )
    }
}

/// Relative path (always '/' separated) to hex checksum
pub type TreeHashes = BTreeMap<String, String>;

#[async_recursion]
async fn collect_files(root: &Path, dir: &Path, files: &mut Vec<(String, PathBuf)>) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", dir))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", dir))?
    {
        let path = entry.path();
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("failed reading file type of {:?}", path))?;
        if file_type.is_dir() {
            collect_files(root, &path, files).await?;
        } else if file_type.is_file() {
            let relative = path.strip_prefix(root)?.to_string_lossy().replace('\\', "/");
            files.push((relative, path));
        } else {
            tracing::debug!("skipping {:?}, not a regular file", path);
        }
    }
    Ok(())
}

/// Hash every regular file under `root` with at most `max_workers` files in flight. The file at
/// relative path `skip` is neither hashed nor listed.
#[instrument]
pub async fn hash_tree(
    root: &Path,
    skip: Option<&str>,
    max_workers: usize,
) -> Result<(TreeHashes, Summary)> {
    let mut files = vec![];
    collect_files(root, root, &mut files).await?;
    if let Some(skip) = skip {
        files.retain(|(relative, _)| {
            let keep = relative != skip;
            if !keep {
                tracing::info!("leaving {} out", relative);
            }
            keep
        });
    }
    tracing::info!("hashing {} files", files.len());
    let permits = Arc::new(tokio::sync::Semaphore::new(max_workers.max(1)));
    let mut join_set = tokio::task::JoinSet::new();
    for (relative, path) in files {
        let permits = permits.clone();
        join_set.spawn(async move {
            let _permit = permits.acquire_owned().await?;
            let size = tokio::fs::metadata(&path).await?.len();
            let checksum = sha256_file(&path).await?;
            tracing::debug!("{}  {}", checksum, relative);
            Ok::<_, anyhow::Error>((relative, checksum, size))
        });
    }
    let mut hashes = TreeHashes::new();
    let mut summary = Summary::default();
    let mut failed = false;
    while let Some(res) = join_set.join_next().await {
        match res? {
            Ok((relative, checksum, size)) => {
                hashes.insert(relative, checksum);
                summary.files_hashed += 1;
                summary.bytes_hashed += size;
            }
            Err(error) => {
                tracing::error!("hashing failed: {:#}", &error);
                failed = true;
            }
        }
    }
    if failed {
        return Err(anyhow!("failed hashing some files under {:?}", root));
    }
    Ok((hashes, summary))
}

/// Text manifest, one `<hex>  <path>` line per file
pub fn to_text(hashes: &TreeHashes) -> String {
    hashes
        .iter()
        .map(|(path, checksum)| format!("{}  {}\n", checksum, path))
        .collect()
}

#[derive(Serialize)]
struct GenericObject<'a> {
    path: &'a str,
    checksum: &'a str,
    #[serde(rename = "type")]
    object_type: &'static str,
}

#[derive(Serialize)]
struct GenericManifest<'a> {
    collection: &'a str,
    checksum_format: &'static str,
    version: u32,
    checksum_encoding: &'static str,
    objects: Vec<GenericObject<'a>>,
}

/// Generic JSON manifest describing `collection`
pub fn to_generic_json(hashes: &TreeHashes, collection: &str) -> Result<String> {
    let manifest = GenericManifest {
        collection,
        checksum_format: "sha256",
        version: 1,
        checksum_encoding: "hex",
        objects: hashes
            .iter()
            .map(|(path, checksum)| GenericObject {
                path,
                checksum,
                object_type: "dataobject",
            })
            .collect(),
    };
    Ok(serde_json::to_string_pretty(&manifest)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ManifestFormat, ManifestSchema, parse};
    use tracing_test::traced_test;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[tokio::test]
    async fn test_sha256_reader() -> Result<()> {
        assert_eq!(sha256_reader(&b"hello"[..]).await?, HELLO_SHA256);
        assert_eq!(sha256_reader(&b""[..]).await?, EMPTY_SHA256);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_hash_tree_and_writers() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        tokio::fs::create_dir_all(tmp.path().join("a/b")).await?;
        tokio::fs::write(tmp.path().join("top.txt"), "hello").await?;
        tokio::fs::write(tmp.path().join("a/b/empty"), "").await?;
        let (hashes, summary) = hash_tree(tmp.path(), None, 2).await?;
        assert_eq!(summary.files_hashed, 2);
        assert_eq!(summary.bytes_hashed, 5);
        assert_eq!(hashes.get("top.txt").unwrap(), HELLO_SHA256);
        assert_eq!(hashes.get("a/b/empty").unwrap(), EMPTY_SHA256);
        assert_eq!(
            to_text(&hashes),
            format!("{}  a/b/empty\n{}  top.txt\n", EMPTY_SHA256, HELLO_SHA256)
        );
        // generated manifests are accepted by the parser
        let manifest = parse(&to_text(&hashes), "sums.txt", ManifestFormat::Text, None)?;
        assert_eq!(manifest.checksum("top.txt"), Some(HELLO_SHA256));
        let json = to_generic_json(&hashes, "/zone/run1")?;
        let schema = ManifestSchema::generic()?;
        let manifest = parse(&json, "sums.json", ManifestFormat::Generic, Some(&schema))?;
        assert_eq!(manifest.checksum("a/b/empty"), Some(EMPTY_SHA256));
        assert!(manifest.contains("sums.json"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_hash_tree_skips_own_output() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        tokio::fs::create_dir_all(tmp.path().join("meta")).await?;
        tokio::fs::write(tmp.path().join("top.txt"), "hello").await?;
        tokio::fs::write(tmp.path().join("meta/sums.txt"), "a stale manifest").await?;
        let (hashes, summary) = hash_tree(tmp.path(), Some("meta/sums.txt"), 2).await?;
        assert_eq!(hashes.len(), 1);
        assert!(!hashes.contains_key("meta/sums.txt"));
        assert_eq!(summary.files_hashed, 1);
        assert_eq!(summary.bytes_hashed, 5);
        Ok(())
    }
}
