//! Folder discovery, readiness gates and provenance metadata around the sync engine
//!
//! A replication run walks the candidate folders below a source root one at a time. Each folder
//! passes through the gates below, in order, and is skipped at the first one it fails:
//!
//! 1. pattern: the folder name matches the configured regex
//! 2. flag file: a file matching the flag glob exists and its youngest match is old enough
//! 3. age: the newest modification anywhere in the folder lies within `[min_age, max_age]`
//! 4. manifest: exactly one manifest matches and parses
//! 5. timestamp: every configured attribute on the destination folder is old enough
//! 6. completion: the destination folder does not carry the completion marker yet
//!
//! Eligible folders are synced into `<dest root>/<folder name>`. Provenance metadata is written to
//! the destination folder only when every object of the folder made it across.

use anyhow::{Context, Result, anyhow};
use async_recursion::async_recursion;
use chrono::{DateTime, Utc};
use enum_map::{Enum, EnumMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::manifest::{self, ChecksumManifest, ManifestFormat, ManifestSchema};
use crate::storage::{self, Connector, FileHandle, Storage};
use crate::sync;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum FolderState {
    Discovered,
    Gated,
    ManifestLoaded,
    Synced,
    MetadataApplied,
    Skipped,
    Failed,
}

#[derive(Clone, Debug)]
pub struct ManifestSettings {
    /// Glob, relative to the folder, that must match exactly one manifest file
    pub pattern: String,
    pub format: ManifestFormat,
    pub schema: Option<Arc<ManifestSchema>>,
}

#[derive(Clone, Debug, Default)]
pub struct Settings {
    /// Levels of directories to descend below the source root before enumerating candidates
    pub skip_subdirs: usize,
    pub folder_pattern: Option<regex::Regex>,
    pub flag_file: Option<String>,
    pub flag_age: Duration,
    pub min_age: Duration,
    pub max_age: Option<Duration>,
    pub manifest: Option<ManifestSettings>,
    /// Walk the source folder for objects to sync
    pub scan: bool,
    /// `(attribute, age)` pairs that must be satisfied on the destination folder
    pub timestamp_gates: Vec<(String, Duration)>,
    /// `(attribute, value)` marking a destination folder as already complete
    pub completion: Option<(String, String)>,
    /// `(attribute, template)` pairs written to the destination folder after a successful sync
    pub metadata: Vec<(String, String)>,
    pub sync: sync::Settings,
}

/// Compile a folder name pattern, anchored at both ends and case-insensitive
pub fn folder_pattern(pattern: &str) -> Result<regex::Regex> {
    regex::RegexBuilder::new(&format!("^(?:{})$", pattern))
        .case_insensitive(true)
        .build()
        .with_context(|| format!("invalid folder pattern '{}'", pattern))
}

/// Expand the `%sf %sp %df %dp %t` tokens of a metadata template
pub fn resolve_template(template: &str, source: &Path, dest: &Path, now: DateTime<Utc>) -> String {
    let basename = |path: &Path| {
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    template
        .replace("%sf", &basename(source))
        .replace("%sp", &source.to_string_lossy())
        .replace("%df", &basename(dest))
        .replace("%dp", &dest.to_string_lossy())
        .replace("%t", &now.timestamp().to_string())
}

#[derive(Clone, Debug, Default)]
pub struct Summary {
    pub folders: EnumMap<FolderState, usize>,
    pub sync: sync::Summary,
}

impl Summary {
    pub fn success(&self) -> bool {
        self.folders[FolderState::Failed] == 0
    }
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        let mut folders = self.folders;
        for (state, &count) in &other.folders {
            folders[state] += count;
        }
        Self {
            folders,
            sync: self.sync + other.sync,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(
            f,
            "folders replicated: {}",
            self.folders[FolderState::MetadataApplied]
        )?;
        writeln!(f, "folders skipped: {}", self.folders[FolderState::Skipped])?;
        writeln!(f, "folders failed: {}", self.folders[FolderState::Failed])?;
        write!(f, "{}", &self.sync)
    }
}

struct Endpoints<'a> {
    source: &'a Connector,
    source_fs: &'a dyn Storage,
    dest: &'a Connector,
    dest_fs: &'a dyn Storage,
}

#[derive(Debug)]
struct ReplicationTarget {
    source: PathBuf,
    dest: PathBuf,
    state: FolderState,
    manifest: Option<ChecksumManifest>,
}

impl ReplicationTarget {
    fn new(source: PathBuf, dest: PathBuf) -> Self {
        tracing::debug!("{:?}: discovered", &source);
        Self {
            source,
            dest,
            state: FolderState::Discovered,
            manifest: None,
        }
    }

    fn advance(&mut self, state: FolderState) {
        tracing::debug!("{:?}: {:?} -> {:?}", &self.source, self.state, state);
        self.state = state;
    }
}

#[async_recursion]
async fn discover(
    storage: &dyn Storage,
    dir: &Path,
    levels: usize,
    top: bool,
) -> Result<Vec<Arc<FileHandle>>> {
    let dirs = match storage::list_dirs(storage, dir, true).await {
        Ok(dirs) => dirs,
        Err(error) if !top => {
            tracing::error!("cannot read directory {:?}: {:#}", dir, &error);
            return Ok(vec![]);
        }
        Err(error) => {
            return Err(error).with_context(|| format!("cannot read source root {:?}", dir));
        }
    };
    if levels == 0 {
        return Ok(dirs);
    }
    let mut found = vec![];
    for sub in dirs {
        found.extend(discover(storage, sub.path(), levels - 1, false).await?);
    }
    Ok(found)
}

async fn flag_gate(
    storage: &dyn Storage,
    folder: &Path,
    settings: &Settings,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(pattern) = &settings.flag_file else {
        return Ok(true);
    };
    let flags = storage::glob(storage, folder, pattern).await?;
    let Some(youngest) = flags.iter().map(|flag| flag.modified()).max() else {
        tracing::debug!("no flag file matching '{}' in {:?}", pattern, folder);
        return Ok(false);
    };
    let flag_age = storage::age(youngest, now);
    if flag_age < settings.flag_age {
        tracing::info!(
            "flag file(s) in {:?} too new, age {}, required {}",
            folder,
            humantime::format_duration(Duration::from_secs(flag_age.as_secs())),
            humantime::format_duration(settings.flag_age)
        );
        return Ok(false);
    }
    Ok(true)
}

async fn age_gate(
    storage: &dyn Storage,
    folder: &Path,
    settings: &Settings,
    now: DateTime<Utc>,
) -> Result<bool> {
    if settings.min_age.is_zero() && settings.max_age.is_none() {
        return Ok(true);
    }
    // an empty folder counts as infinitely old
    let newest = storage::newest_mtime(storage, folder)
        .await?
        .unwrap_or(DateTime::UNIX_EPOCH);
    let folder_age = storage::age(newest, now);
    tracing::debug!("folder {:?} age is {}s", folder, folder_age.as_secs());
    if folder_age < settings.min_age {
        tracing::info!("recent changes in {:?}, skipping", folder);
        return Ok(false);
    }
    if let Some(max_age) = settings.max_age {
        if folder_age > max_age {
            tracing::info!(
                "folder {:?} too old ({}), skipping",
                folder,
                humantime::format_duration(Duration::from_secs(folder_age.as_secs()))
            );
            return Ok(false);
        }
    }
    Ok(true)
}

/// A missing manifest or a parse failure skips the folder
async fn manifest_gate(
    storage: &dyn Storage,
    target: &mut ReplicationTarget,
    settings: &Settings,
) -> bool {
    let Some(manifest_settings) = &settings.manifest else {
        return true;
    };
    match manifest::locate_and_parse(
        storage,
        &target.source,
        &manifest_settings.pattern,
        manifest_settings.format,
        manifest_settings.schema.as_deref(),
    )
    .await
    {
        Ok(Some(parsed)) => {
            target.manifest = Some(parsed);
            true
        }
        Ok(None) => false,
        Err(error) => {
            tracing::error!("skipping {:?}: {:#}", &target.source, error);
            false
        }
    }
}

async fn timestamp_gate(
    storage: &dyn Storage,
    folder: &Path,
    settings: &Settings,
    now: DateTime<Utc>,
) -> Result<bool> {
    if settings.timestamp_gates.is_empty() {
        return Ok(true);
    }
    if !storage.is_dir(folder).await? {
        tracing::info!("destination {:?} does not exist yet, timestamps not ready", folder);
        return Ok(false);
    }
    let now_secs = now.timestamp() as f64;
    for (attribute, min_age) in &settings.timestamp_gates {
        let Some(raw) = storage.metadata(folder, attribute).await? else {
            tracing::error!("timestamp attribute {} missing on {:?}", attribute, folder);
            return Ok(false);
        };
        let Some(stamp) = raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|stamp| stamp.is_finite())
        else {
            tracing::error!(
                "timestamp attribute {} on {:?} has invalid value '{}'",
                attribute,
                folder,
                raw
            );
            return Ok(false);
        };
        let ready_at = stamp + min_age.as_secs_f64();
        if now_secs < ready_at {
            tracing::info!(
                "timestamp attribute {} on {:?} too new, wait {}s",
                attribute,
                folder,
                (ready_at - now_secs).ceil()
            );
            return Ok(false);
        }
    }
    Ok(true)
}

/// True if the destination folder already carries the completion marker
async fn is_complete(storage: &dyn Storage, folder: &Path, settings: &Settings) -> Result<bool> {
    let Some((attribute, value)) = &settings.completion else {
        return Ok(false);
    };
    if !storage.is_dir(folder).await? {
        return Ok(false);
    }
    let complete = storage.metadata(folder, attribute).await?.as_deref() == Some(value.as_str());
    if complete {
        tracing::debug!("{:?} already marked complete", folder);
    }
    Ok(complete)
}

async fn apply_metadata(
    storage: &dyn Storage,
    target: &ReplicationTarget,
    metadata: &[(String, String)],
    now: DateTime<Utc>,
) -> Result<()> {
    for (attribute, template) in metadata {
        let value = resolve_template(template, &target.source, &target.dest, now);
        let replace = async {
            storage.remove_metadata(&target.dest, attribute).await?;
            storage.set_metadata(&target.dest, attribute, &value).await
        };
        replace.await.with_context(|| {
            format!("failed setting {}={} on {:?}", attribute, value, &target.dest)
        })?;
    }
    Ok(())
}

/// Sync an eligible folder and stamp it on success
async fn transfer(
    endpoints: &Endpoints<'_>,
    target: &mut ReplicationTarget,
    settings: &Settings,
    now: DateTime<Utc>,
) -> Result<sync::Summary> {
    if !endpoints.dest_fs.is_dir(&target.dest).await? {
        endpoints
            .dest_fs
            .make_dir(&target.dest, true)
            .await
            .with_context(|| format!("failed creating destination folder {:?}", &target.dest))?;
    }
    let jobs = sync::JobSource {
        manifest: target.manifest.as_ref(),
        scan: settings.scan,
    };
    let summary = sync::sync(
        &sync::Location {
            connector: endpoints.source,
            storage: endpoints.source_fs,
            root: &target.source,
        },
        &sync::Location {
            connector: endpoints.dest,
            storage: endpoints.dest_fs,
            root: &target.dest,
        },
        jobs,
        &settings.sync,
    )
    .await?;
    if !summary.success() {
        tracing::error!("sync failed for folder {:?}", &target.source);
        target.advance(FolderState::Failed);
        return Ok(summary);
    }
    target.advance(FolderState::Synced);
    apply_metadata(endpoints.dest_fs, target, &settings.metadata, now).await?;
    target.advance(FolderState::MetadataApplied);
    Ok(summary)
}

async fn replicate_folder(
    endpoints: &Endpoints<'_>,
    target: &mut ReplicationTarget,
    settings: &Settings,
) -> Result<sync::Summary> {
    let now = Utc::now();
    let name = target
        .source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Some(pattern) = &settings.folder_pattern {
        if !pattern.is_match(&name) {
            tracing::debug!("folder {} does not match pattern {}", name, pattern.as_str());
            target.advance(FolderState::Skipped);
            return Ok(sync::Summary::default());
        }
    }
    let ready = flag_gate(endpoints.source_fs, &target.source, settings, now).await?
        && age_gate(endpoints.source_fs, &target.source, settings, now).await?;
    if !ready {
        target.advance(FolderState::Skipped);
        return Ok(sync::Summary::default());
    }
    target.advance(FolderState::Gated);
    if !manifest_gate(endpoints.source_fs, target, settings).await {
        target.advance(FolderState::Skipped);
        return Ok(sync::Summary::default());
    }
    target.advance(FolderState::ManifestLoaded);
    if !timestamp_gate(endpoints.dest_fs, &target.dest, settings, now).await?
        || is_complete(endpoints.dest_fs, &target.dest, settings).await?
    {
        target.advance(FolderState::Skipped);
        return Ok(sync::Summary::default());
    }
    tracing::info!("replicating {:?} to {:?}", &target.source, &target.dest);
    transfer(endpoints, target, settings, now).await
}

async fn refresh(storage: &dyn Storage) {
    if let Err(error) = storage.refresh().await {
        tracing::warn!("failed refreshing {} session: {:#}", storage.backend(), error);
    }
}

async fn cleanup(storage: &dyn Storage) {
    if let Err(error) = storage.cleanup().await {
        tracing::warn!("failed closing {} session: {:#}", storage.backend(), error);
    }
}

/// Replicate every eligible folder found below `source_root` into `dest_root`
#[instrument(skip(source, dest, settings))]
pub async fn replicate(
    source: &Connector,
    source_root: &Path,
    dest: &Connector,
    dest_root: &Path,
    settings: &Settings,
) -> Result<Summary> {
    let source_fs = source.connect().context("failed connecting to source")?;
    let dest_fs = dest.connect().context("failed connecting to destination")?;
    let endpoints = Endpoints {
        source,
        source_fs: source_fs.as_ref(),
        dest,
        dest_fs: dest_fs.as_ref(),
    };
    let folders = discover(endpoints.source_fs, source_root, settings.skip_subdirs, true).await?;
    tracing::info!("{} candidate folders below {:?}", folders.len(), source_root);
    let mut summary = Summary::default();
    for folder in folders {
        let Some(name) = folder.path().file_name() else {
            continue;
        };
        let mut target = ReplicationTarget::new(folder.path().to_path_buf(), dest_root.join(name));
        match replicate_folder(&endpoints, &mut target, settings).await {
            Ok(sync_summary) => summary.sync = summary.sync + sync_summary,
            Err(error) => {
                tracing::error!("replication of {:?} failed: {:#}", &target.source, error);
                target.advance(FolderState::Failed);
            }
        }
        summary.folders[target.state] += 1;
        // long syncs may outlive a backend session
        refresh(endpoints.source_fs).await;
        refresh(endpoints.dest_fs).await;
    }
    cleanup(endpoints.source_fs).await;
    cleanup(endpoints.dest_fs).await;
    Ok(summary)
}

/// Replicate one explicit folder. Only the completion gate applies; a configured manifest must be
/// present.
#[instrument(skip(source, dest, settings))]
pub async fn replicate_single_folder(
    source: &Connector,
    source_folder: &Path,
    dest: &Connector,
    dest_folder: &Path,
    settings: &Settings,
) -> Result<Summary> {
    let source_fs = source.connect().context("failed connecting to source")?;
    let dest_fs = dest.connect().context("failed connecting to destination")?;
    let endpoints = Endpoints {
        source,
        source_fs: source_fs.as_ref(),
        dest,
        dest_fs: dest_fs.as_ref(),
    };
    if !endpoints.source_fs.is_dir(source_folder).await? {
        return Err(anyhow!("source folder {:?} does not exist", source_folder));
    }
    let mut target = ReplicationTarget::new(source_folder.to_path_buf(), dest_folder.to_path_buf());
    let mut summary = Summary::default();
    if is_complete(endpoints.dest_fs, &target.dest, settings).await? {
        target.advance(FolderState::Skipped);
        summary.folders[target.state] += 1;
        return Ok(summary);
    }
    target.advance(FolderState::Gated);
    if let Some(manifest_settings) = &settings.manifest {
        let parsed = manifest::locate_and_parse(
            endpoints.source_fs,
            source_folder,
            &manifest_settings.pattern,
            manifest_settings.format,
            manifest_settings.schema.as_deref(),
        )
        .await?
        .ok_or_else(|| {
            anyhow!(
                "no single manifest matching '{}' in {:?}",
                &manifest_settings.pattern,
                source_folder
            )
        })?;
        target.manifest = Some(parsed);
        target.advance(FolderState::ManifestLoaded);
    }
    let outcome = transfer(&endpoints, &mut target, settings, Utc::now()).await;
    cleanup(endpoints.source_fs).await;
    cleanup(endpoints.dest_fs).await;
    summary.sync = outcome?;
    summary.folders[target.state] += 1;
    Ok(summary)
}
