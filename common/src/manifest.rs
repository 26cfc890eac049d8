//! Checksum manifest parsing
//!
//! A manifest lists the files of one delivery with their expected SHA-256 checksums. Three
//! document formats are understood:
//!
//! - `text`: one `<hex checksum>  <relative path>` line per file (two spaces)
//! - `generic`: JSON with an `objects` list of `{path, checksum, type}` entries
//! - `baseclear`: JSON with `samples`, each carrying a `flowcellid` and a list of read `pairs`
//!
//! The JSON formats are validated against a JSON schema before they are interpreted.

use anyhow::{Context, anyhow};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::storage::{self, Storage};

/// Folder holding the reads of one flow cell when a pair has no explicit path
const SEQUENCE_DIR: &str = "raw_sequences";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ManifestFormat {
    #[default]
    Text,
    Generic,
    Baseclear,
}

impl std::fmt::Display for ManifestFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ManifestFormat::Text => "text",
            ManifestFormat::Generic => "generic",
            ManifestFormat::Baseclear => "baseclear",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("line {line}: expected '<checksum>  <path>'")]
    MalformedLine { line: usize },
    #[error("invalid JSON document")]
    Json(#[from] serde_json::Error),
    #[error("document does not match the schema: {0}")]
    Schema(String),
    #[error("'{0}' is referenced multiple times")]
    DuplicatePath(String),
    #[error("the {0} format requires a schema")]
    MissingSchema(ManifestFormat),
    #[error("'{0}' does not name a file inside the folder")]
    OutsideFolder(String),
}

/// Compiled JSON schema for the structured formats
pub struct ManifestSchema {
    validator: jsonschema::Validator,
}

impl std::fmt::Debug for ManifestSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestSchema").finish_non_exhaustive()
    }
}

impl ManifestSchema {
    pub fn from_value(schema: &serde_json::Value) -> anyhow::Result<Self> {
        let validator =
            jsonschema::validator_for(schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
        Ok(Self { validator })
    }

    pub fn from_json(schema: &str) -> anyhow::Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(schema).context("schema is not valid JSON")?;
        Self::from_value(&value)
    }

    /// Read and compile a schema file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read schema file: {:?}", path))?;
        Self::from_json(&content).with_context(|| format!("invalid schema file: {:?}", path))
    }

    /// Bundled schema for the generic format
    pub fn generic() -> anyhow::Result<Self> {
        Self::from_json(include_str!("../schemas/generic.json"))
    }

    /// Bundled schema for the baseclear format
    pub fn baseclear() -> anyhow::Result<Self> {
        Self::from_json(include_str!("../schemas/baseclear.json"))
    }

    /// Bundled schema for `format`, `None` for formats that are not schema-governed
    pub fn builtin(format: ManifestFormat) -> anyhow::Result<Option<Self>> {
        match format {
            ManifestFormat::Text => Ok(None),
            ManifestFormat::Generic => Self::generic().map(Some),
            ManifestFormat::Baseclear => Self::baseclear().map(Some),
        }
    }

    fn validate(&self, document: &serde_json::Value) -> Result<(), ParseError> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(document)
            .map(|err| err.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ParseError::Schema(errors.join("; ")))
        }
    }
}

/// Relative path to expected checksum, `None` when the file carries no checksum
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumManifest {
    entries: BTreeMap<String, Option<String>>,
}

impl ChecksumManifest {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn checksum(&self, path: &str) -> Option<&str> {
        self.entries.get(path).and_then(|checksum| checksum.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries
            .iter()
            .map(|(path, checksum)| (path.as_str(), checksum.as_deref()))
    }

    fn insert_unique(&mut self, path: String, checksum: String) -> Result<(), ParseError> {
        if self.entries.contains_key(&path) {
            return Err(ParseError::DuplicatePath(path));
        }
        self.entries.insert(path, Some(checksum));
        Ok(())
    }
}

fn to_unix(path: &str) -> String {
    path.replace('\\', "/")
}

/// Entry path with unix separators, rejecting paths that resolve outside the folder
fn entry_path(path: &str) -> Result<String, ParseError> {
    let path = to_unix(path);
    let normalized = crate::filter::normalize(&path);
    if normalized.starts_with('/')
        || normalized == "."
        || normalized == ".."
        || normalized.starts_with("../")
    {
        return Err(ParseError::OutsideFolder(path));
    }
    Ok(path)
}

#[derive(Deserialize)]
struct GenericDocument {
    objects: Vec<GenericObject>,
}

#[derive(Deserialize)]
struct GenericObject {
    path: String,
    checksum: String,
    #[serde(rename = "type")]
    object_type: String,
}

#[derive(Deserialize)]
struct BaseclearDocument {
    samples: Vec<Sample>,
}

#[derive(Deserialize)]
struct Sample {
    flowcellid: String,
    pairs: Vec<ReadPair>,
}

#[derive(Deserialize)]
struct ReadPair {
    filename: String,
    checksum: String,
    path: Option<String>,
}

fn structured(
    document: &str,
    format: ManifestFormat,
    schema: Option<&ManifestSchema>,
) -> Result<serde_json::Value, ParseError> {
    let schema = schema.ok_or(ParseError::MissingSchema(format))?;
    let value: serde_json::Value = serde_json::from_str(document)?;
    schema.validate(&value)?;
    Ok(value)
}

/// Parse one manifest document. `file_name` is the manifest's own path relative to the folder
/// it describes and is always part of the result.
pub fn parse(
    document: &str,
    file_name: &str,
    format: ManifestFormat,
    schema: Option<&ManifestSchema>,
) -> Result<ChecksumManifest, ParseError> {
    let mut manifest = ChecksumManifest::default();
    manifest.entries.insert(to_unix(file_name), None);
    match format {
        ManifestFormat::Text => {
            for (idx, line) in document.lines().enumerate() {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                let (checksum, path) = line
                    .split_once("  ")
                    .ok_or(ParseError::MalformedLine { line: idx + 1 })?;
                manifest
                    .entries
                    .insert(entry_path(path)?, Some(checksum.to_string()));
            }
        }
        ManifestFormat::Generic => {
            let value = structured(document, format, schema)?;
            let document: GenericDocument = serde_json::from_value(value)?;
            for object in document.objects {
                if object.object_type != "dataobject" {
                    tracing::debug!("ignoring '{}' of type '{}'", object.path, object.object_type);
                    continue;
                }
                manifest.insert_unique(entry_path(&object.path)?, object.checksum)?;
            }
        }
        ManifestFormat::Baseclear => {
            let value = structured(document, format, schema)?;
            let document: BaseclearDocument = serde_json::from_value(value)?;
            for sample in document.samples {
                for pair in sample.pairs {
                    let dir = pair
                        .path
                        .unwrap_or_else(|| format!("{}/{}", SEQUENCE_DIR, sample.flowcellid));
                    let path = if dir.is_empty() {
                        pair.filename
                    } else {
                        format!("{}/{}", dir.trim_end_matches(['/', '\\']), pair.filename)
                    };
                    manifest.insert_unique(entry_path(&path)?, pair.checksum)?;
                }
            }
        }
    }
    Ok(manifest)
}

/// Find the single manifest matching `pattern` inside `folder` and parse it.
/// Zero or several matches yield `Ok(None)`: the folder is not ready.
#[tracing::instrument(skip(storage, schema))]
pub async fn locate_and_parse(
    storage: &dyn Storage,
    folder: &Path,
    pattern: &str,
    format: ManifestFormat,
    schema: Option<&ManifestSchema>,
) -> anyhow::Result<Option<ChecksumManifest>> {
    let matches = storage::glob(storage, folder, pattern).await?;
    if matches.len() != 1 {
        tracing::debug!(
            "no definitive manifest match for '{}' in {:?}, matches: {}",
            pattern,
            folder,
            matches.len()
        );
        return Ok(None);
    }
    let handle = &matches[0];
    if !handle.is_accessible() {
        tracing::error!("manifest {:?} is not accessible", handle.path());
        return Ok(None);
    }
    let mut content = String::new();
    storage
        .open(handle.path())
        .await?
        .read_to_string(&mut content)
        .await
        .with_context(|| format!("failed reading manifest {:?}", handle.path()))?;
    let relative = handle
        .path()
        .strip_prefix(folder)
        .with_context(|| format!("manifest {:?} outside of {:?}", handle.path(), folder))?
        .to_string_lossy()
        .into_owned();
    let manifest = parse(&content, &relative, format, schema)
        .with_context(|| format!("failed parsing manifest {:?}", handle.path()))?;
    tracing::debug!("loaded {} manifest entries from {:?}", manifest.len(), handle.path());
    Ok(Some(manifest))
}
