//! Sync engine
//!
//! One run copies a set of objects from a source root to a destination root:
//!
//! 1. Build a job map keyed by source path from a manifest, a recursive source scan, or both.
//! 2. Create every destination directory the jobs need.
//! 3. Feed the jobs through a pool of worker tasks. Each worker owns its own backend sessions,
//!    compares what is already at the destination and copies what differs.
//! 4. Jobs that fail their per-job retry budget are collected and re-driven through the pool a
//!    limited number of times.
//!
//! The coordinating task keeps draining the error and stats channels while it waits, so a worker
//! is never blocked on a full channel for long.

use anyhow::{Context, Result};
use async_recursion::async_recursion;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::filter::PathFilter;
use crate::manifest::ChecksumManifest;
use crate::progress;
use crate::storage::{self, Connector, FileHandle, Storage};

/// One object to bring to the destination
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncJob {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub verify_checksum: bool,
    pub checksum: Option<String>,
}

/// Pool and retry tunables
#[derive(Copy, Clone, Debug)]
pub struct Tuning {
    /// Copy attempts per job within one pass; every copy is verified before the job counts
    pub max_retries: usize,
    /// Extra passes re-driving jobs that exhausted their attempts
    pub error_retry_passes: usize,
    /// Jobs one worker handles before it exits and gets replaced
    pub max_objects_per_worker: usize,
    pub stats_interval: Duration,
    /// How long an idle worker waits for a job before exiting
    pub queue_timeout: Duration,
    /// Wait between progress logs while joining the workers
    pub join_timeout: Duration,
    pub channel_capacity: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            max_retries: 2,
            error_retry_passes: 2,
            max_objects_per_worker: 2000,
            stats_interval: Duration::from_secs(5),
            queue_timeout: Duration::from_secs(2),
            join_timeout: Duration::from_secs(100),
            channel_capacity: 1024,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub concurrency: usize,
    /// Compare objects already at the destination, otherwise their presence is enough
    pub compare: bool,
    /// Compare by checksum instead of size and modification time
    pub verify_checksums: bool,
    pub excludes: Vec<regex::Regex>,
    /// Objects modified more recently than this are left for a later run
    pub minimum_age: Option<Duration>,
    pub manifest_filter: PathFilter,
    pub scan_filter: PathFilter,
    pub tuning: Tuning,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            compare: true,
            verify_checksums: false,
            excludes: vec![],
            minimum_age: None,
            manifest_filter: PathFilter::default(),
            scan_filter: PathFilter::default(),
            tuning: Tuning::default(),
        }
    }
}

/// Compile exclude patterns, case-insensitive and anchored at the start of the relative path
pub fn compile_excludes<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<regex::Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            regex::RegexBuilder::new(&format!("^(?:{})", pattern.as_ref()))
                .case_insensitive(true)
                .build()
                .with_context(|| format!("invalid exclude pattern: {}", pattern.as_ref()))
        })
        .collect()
}

fn is_excluded(excludes: &[regex::Regex], relative: &str) -> bool {
    excludes.iter().any(|regex| regex.is_match(relative))
}

/// Where the jobs of one run come from
#[derive(Copy, Clone, Debug, Default)]
pub struct JobSource<'a> {
    pub manifest: Option<&'a ChecksumManifest>,
    pub scan: bool,
}

/// One side of a run: a session for the coordinator, the means to open more for the workers
pub struct Location<'a> {
    pub connector: &'a Connector,
    pub storage: &'a dyn Storage,
    pub root: &'a Path,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Summary {
    pub jobs: usize,
    pub files_copied: usize,
    pub files_unchanged: usize,
    pub bytes_synced: u64,
    pub skipped: usize,
    pub failed: usize,
}

impl Summary {
    pub fn synced(&self) -> usize {
        self.files_copied + self.files_unchanged
    }

    /// Every job ended with its object correctly in place
    pub fn success(&self) -> bool {
        self.failed == 0 && self.synced() == self.jobs
    }
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            jobs: self.jobs + other.jobs,
            files_copied: self.files_copied + other.files_copied,
            files_unchanged: self.files_unchanged + other.files_unchanged,
            bytes_synced: self.bytes_synced + other.bytes_synced,
            skipped: self.skipped + other.skipped,
            failed: self.failed + other.failed,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "objects requested: {}\n\
            files copied: {}\n\
            files unchanged: {}\n\
            bytes synced: {}\n\
            skipped (too recent): {}\n\
            failed: {}",
            self.jobs,
            self.files_copied,
            self.files_unchanged,
            bytesize::ByteSize(self.bytes_synced),
            self.skipped,
            self.failed,
        )
    }
}

/// Slash separated form of a relative path, used for filtering and logging only
fn relative_label(relative: &Path) -> String {
    relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_recursion]
async fn scan(
    storage: &dyn Storage,
    root: &Path,
    relative: &Path,
    settings: &Settings,
    found: &mut Vec<PathBuf>,
) -> Result<()> {
    let dir = if relative.as_os_str().is_empty() {
        root.to_owned()
    } else {
        root.join(relative)
    };
    let (mut dirs, mut files): (Vec<Arc<FileHandle>>, Vec<Arc<FileHandle>>) = storage
        .list(&dir)
        .await
        .with_context(|| format!("failed scanning {:?}", dir))?
        .into_iter()
        .partition(|entry| entry.is_dir());
    dirs.sort_by(|a, b| a.path().cmp(b.path()));
    files.sort_by(|a, b| a.path().cmp(b.path()));
    for entry in dirs {
        let Some(name) = entry.path().file_name() else {
            continue;
        };
        let child = relative.join(name);
        let label = relative_label(&child);
        if !settings.scan_filter.could_contain_included(&label) {
            tracing::debug!("skipping directory '{}'", label);
            continue;
        }
        scan(storage, root, &child, settings, found).await?;
    }
    for entry in files {
        let Some(name) = entry.path().file_name() else {
            continue;
        };
        let child = relative.join(name);
        let label = relative_label(&child);
        if !settings.scan_filter.is_file_included(&label) {
            tracing::trace!("'{}' filtered out", label);
            continue;
        }
        if is_excluded(&settings.excludes, &label) {
            tracing::debug!("'{}' excluded", label);
            continue;
        }
        found.push(child);
    }
    Ok(())
}

/// Build the deduplicated job map. Scanned entries are added first so that manifest entries,
/// which carry checksums, replace them.
#[instrument(skip(source, jobs, settings))]
pub async fn build_jobs(
    source: &dyn Storage,
    source_root: &Path,
    dest_root: &Path,
    jobs: JobSource<'_>,
    settings: &Settings,
) -> Result<BTreeMap<PathBuf, SyncJob>> {
    let mut job_map = BTreeMap::new();
    let mut add = |relative: &Path, checksum: Option<String>| {
        let job = SyncJob {
            source: source_root.join(relative),
            dest: dest_root.join(relative),
            verify_checksum: settings.verify_checksums,
            checksum,
        };
        job_map.insert(job.source.clone(), job);
    };
    if jobs.scan {
        let mut found = vec![];
        scan(source, source_root, Path::new(""), settings, &mut found).await?;
        tracing::debug!("scan found {} objects", found.len());
        for relative in found {
            add(&relative, None);
        }
    }
    if let Some(manifest) = jobs.manifest {
        for (relative, checksum) in manifest.iter() {
            if !settings.manifest_filter.is_file_included(relative) {
                tracing::trace!("'{}' filtered out", relative);
                continue;
            }
            if is_excluded(&settings.excludes, relative) {
                tracing::debug!("'{}' excluded", relative);
                continue;
            }
            add(Path::new(relative), checksum.map(str::to_string));
        }
    }
    Ok(job_map)
}

/// Create the destination root and every parent directory the jobs need, each once
async fn prepare_destination<'a, I>(dest: &dyn Storage, dest_root: &Path, jobs: I) -> Result<()>
where
    I: Iterator<Item = &'a SyncJob>,
{
    let mut dirs = BTreeSet::new();
    dirs.insert(dest_root.to_owned());
    for job in jobs {
        if let Some(parent) = job.dest.parent() {
            dirs.insert(parent.to_owned());
        }
    }
    for dir in dirs {
        if !dest.is_dir(&dir).await? {
            tracing::debug!("creating directory {:?}", dir);
            dest.make_dir(&dir, true).await?;
        }
    }
    Ok(())
}

#[derive(Debug)]
enum StatsEvent {
    Synced { bytes: u64, copied: bool },
    Skipped,
}

enum JobOutcome {
    Synced { bytes: u64, copied: bool },
    Skipped,
    Failed,
}

struct Shared {
    source: Connector,
    dest: Connector,
    compare: bool,
    minimum_age: Option<Duration>,
    tuning: Tuning,
}

#[derive(Clone)]
struct Channels {
    jobs: async_channel::Receiver<SyncJob>,
    errors: async_channel::Sender<SyncJob>,
    stats: async_channel::Sender<StatsEvent>,
}

async fn same_content(
    src: &dyn Storage,
    entry: &FileHandle,
    dst: &dyn Storage,
    job: &SyncJob,
) -> Result<bool> {
    let target = dst.stat(&job.dest).await?;
    if entry.size() != target.size() {
        return Ok(false);
    }
    if job.verify_checksum {
        let expected = entry.checksum(src).await?;
        let actual = target.checksum(dst).await?;
        return Ok(expected.eq_ignore_ascii_case(&actual));
    }
    // some backends only keep whole seconds
    Ok(entry.modified().timestamp() == target.modified().timestamp())
}

async fn copy_object(
    src: &dyn Storage,
    entry: &FileHandle,
    dst: &dyn Storage,
    dest: &Path,
) -> Result<u64> {
    let bytes = storage::transfer(src, entry.path(), dst, dest).await?;
    dst.set_modified(dest, entry.modified()).await?;
    Ok(bytes)
}

async fn process(
    src: &dyn Storage,
    dst: &dyn Storage,
    job: &SyncJob,
    shared: &Shared,
) -> JobOutcome {
    let entry = match src.stat(&job.source).await {
        Ok(entry) => entry,
        Err(error) => {
            tracing::error!("cannot access {:?}: {:#}", job.source, &error);
            return JobOutcome::Failed;
        }
    };
    if let Some(minimum_age) = shared.minimum_age {
        let age = storage::age(entry.modified(), Utc::now());
        if age < minimum_age {
            tracing::info!(
                "{:?} was modified {} ago, leaving it for a later run",
                job.source,
                humantime::format_duration(Duration::from_secs(age.as_secs()))
            );
            return JobOutcome::Skipped;
        }
    }
    if let Some(checksum) = &job.checksum {
        entry.preset_checksum(checksum.clone());
    }
    let mut copied = false;
    // the last pass only verifies the previous copy
    for attempt in 0..=shared.tuning.max_retries {
        let exists = match dst.exists(&job.dest).await {
            Ok(exists) => exists,
            Err(error) => {
                tracing::error!("cannot query {:?}: {:#}", job.dest, &error);
                break;
            }
        };
        if exists {
            if !shared.compare {
                return JobOutcome::Synced {
                    bytes: entry.size(),
                    copied,
                };
            }
            match same_content(src, &entry, dst, job).await {
                Ok(true) => {
                    return JobOutcome::Synced {
                        bytes: entry.size(),
                        copied,
                    };
                }
                Ok(false) => tracing::debug!("{:?} differs from {:?}", job.dest, job.source),
                Err(error) => {
                    tracing::warn!(
                        "failed comparing {:?} with {:?}: {:#}",
                        job.source,
                        job.dest,
                        &error
                    )
                }
            }
            if attempt == shared.tuning.max_retries {
                break;
            }
            if let Err(error) = dst.delete(&job.dest).await {
                tracing::error!("cannot remove {:?}: {:#}", job.dest, &error);
            }
        }
        if attempt == shared.tuning.max_retries {
            break;
        }
        match copy_object(src, &entry, dst, &job.dest).await {
            Ok(bytes) => {
                tracing::debug!("copied {:?} to {:?}, {} bytes", job.source, job.dest, bytes);
                copied = true;
            }
            Err(error) => tracing::error!(
                "copying {:?} to {:?} failed (attempt {}): {:#}",
                job.source,
                job.dest,
                attempt + 1,
                &error
            ),
        }
    }
    tracing::error!("failed to sync {:?} to {:?}", job.source, job.dest);
    JobOutcome::Failed
}

#[instrument(skip(shared, channels))]
async fn worker(id: usize, shared: Arc<Shared>, channels: Channels) {
    let sessions = shared
        .source
        .connect()
        .and_then(|src| shared.dest.connect().map(|dst| (src, dst)));
    if let Err(error) = &sessions {
        // jobs still get pulled so they surface as failures
        tracing::error!("cannot open backend sessions: {:#}", error);
    }
    let mut handled = 0;
    while handled < shared.tuning.max_objects_per_worker {
        let next = tokio::time::timeout(shared.tuning.queue_timeout, channels.jobs.recv());
        let job = match next.await {
            Ok(Ok(job)) => job,
            Ok(Err(_)) => {
                tracing::debug!("job queue closed");
                break;
            }
            Err(_) => {
                tracing::debug!("job queue idle");
                break;
            }
        };
        handled += 1;
        let outcome = match &sessions {
            Ok((src, dst)) => process(src.as_ref(), dst.as_ref(), &job, &shared).await,
            Err(_) => JobOutcome::Failed,
        };
        let sent = match outcome {
            JobOutcome::Synced { bytes, copied } => channels
                .stats
                .send(StatsEvent::Synced { bytes, copied })
                .await
                .is_ok(),
            JobOutcome::Skipped => channels.stats.send(StatsEvent::Skipped).await.is_ok(),
            JobOutcome::Failed => channels.errors.send(job).await.is_ok(),
        };
        if !sent {
            tracing::error!("coordinator is gone, exiting");
            break;
        }
    }
    tracing::debug!("exiting after {} objects", handled);
    if let Ok((src, dst)) = sessions {
        for session in [src, dst] {
            if let Err(error) = session.cleanup().await {
                tracing::warn!("failed closing {} session: {:#}", session.backend(), &error);
            }
        }
    }
}

/// Coordinator side bookkeeping
struct Accounting {
    progress: progress::Progress,
    printer: progress::ProgressPrinter,
    summary: Summary,
    pending: Vec<SyncJob>,
    last_report: std::time::Instant,
}

impl Accounting {
    fn new(jobs: usize) -> Self {
        let progress = progress::Progress::new(jobs);
        let printer = progress::ProgressPrinter::new(&progress);
        Self {
            progress,
            printer,
            summary: Summary {
                jobs,
                ..Default::default()
            },
            pending: vec![],
            last_report: std::time::Instant::now(),
        }
    }

    fn record(&mut self, event: StatsEvent) {
        match event {
            StatsEvent::Synced { bytes, copied } => {
                self.progress.jobs_synced += 1;
                self.progress.bytes_synced += bytes;
                self.summary.bytes_synced += bytes;
                if copied {
                    self.summary.files_copied += 1;
                } else {
                    self.summary.files_unchanged += 1;
                }
            }
            StatsEvent::Skipped => {
                self.progress.jobs_skipped += 1;
                self.summary.skipped += 1;
            }
        }
    }

    fn fail(&mut self, job: SyncJob) {
        self.pending.push(job);
    }

    /// Take everything the workers reported so far, returns the number of jobs accounted for
    fn drain(
        &mut self,
        stats: &async_channel::Receiver<StatsEvent>,
        errors: &async_channel::Receiver<SyncJob>,
    ) -> usize {
        let mut accounted = 0;
        while let Ok(event) = stats.try_recv() {
            self.record(event);
            accounted += 1;
        }
        while let Ok(job) = errors.try_recv() {
            self.fail(job);
            accounted += 1;
        }
        accounted
    }

    fn report(&mut self, interval: Duration, queued: usize) {
        if self.last_report.elapsed() >= interval {
            tracing::info!(
                "{}",
                self.printer.print(&self.progress, queued, self.pending.len())
            );
            self.last_report = std::time::Instant::now();
        }
    }
}

/// Sleep between coordinator ticks, longer while the queue is deep
fn tick(queued: usize, interval: Duration) -> Duration {
    let base = Duration::from_millis(100);
    (base * (queued / 10).max(1) as u32).min(interval.max(base))
}

#[instrument(skip_all, fields(jobs = jobs.len()))]
async fn run_pool(
    source: &Connector,
    dest: &Connector,
    jobs: Vec<SyncJob>,
    settings: &Settings,
) -> Result<Summary> {
    let tuning = settings.tuning;
    let total = jobs.len();
    let mut accounting = Accounting::new(total);
    if total == 0 {
        return Ok(accounting.summary);
    }
    let (job_tx, job_rx) = async_channel::bounded::<SyncJob>(total);
    let (error_tx, error_rx) = async_channel::bounded::<SyncJob>(tuning.channel_capacity.max(1));
    let (stats_tx, stats_rx) =
        async_channel::bounded::<StatsEvent>(tuning.channel_capacity.max(1));
    let channels = Channels {
        jobs: job_rx.clone(),
        errors: error_tx.clone(),
        stats: stats_tx.clone(),
    };
    let shared = Arc::new(Shared {
        source: source.clone(),
        dest: dest.clone(),
        compare: settings.compare,
        minimum_age: settings.minimum_age,
        tuning,
    });
    let concurrency = settings.concurrency.max(1);
    let mut workers: Vec<tokio::task::JoinHandle<()>> = vec![];
    let mut next_worker = 0;
    let mut lost = 0;
    let mut queue = jobs;
    for pass in 0..=tuning.error_retry_passes {
        if pass > 0 {
            if accounting.pending.is_empty() {
                break;
            }
            tracing::info!("retrying {} failed objects, pass {}", accounting.pending.len(), pass);
            queue = std::mem::take(&mut accounting.pending);
        }
        let mut outstanding = queue.len();
        for job in queue.drain(..) {
            job_tx.send(job).await.context("job queue closed")?;
        }
        while outstanding > 0 {
            workers.retain(|worker| !worker.is_finished());
            outstanding =
                outstanding.saturating_sub(accounting.drain(&stats_rx, &error_rx));
            if outstanding == 0 {
                break;
            }
            let queued = job_rx.len();
            if workers.is_empty() && queued == 0 {
                tracing::error!(
                    "{} objects were taken by workers that never reported",
                    outstanding
                );
                lost += outstanding;
                break;
            }
            while workers.len() < queued.min(concurrency) {
                workers.push(tokio::spawn(worker(
                    next_worker,
                    shared.clone(),
                    channels.clone(),
                )));
                next_worker += 1;
            }
            accounting.report(tuning.stats_interval, queued);
            tokio::select! {
                Ok(event) = stats_rx.recv() => {
                    accounting.record(event);
                    outstanding = outstanding.saturating_sub(1);
                }
                Ok(job) = error_rx.recv() => {
                    accounting.fail(job);
                    outstanding = outstanding.saturating_sub(1);
                }
                _ = tokio::time::sleep(tick(queued, tuning.stats_interval)) => {}
            }
        }
    }
    job_tx.close();
    drop(channels);
    for mut worker in workers {
        loop {
            tokio::select! {
                res = &mut worker => {
                    if let Err(error) = res {
                        tracing::error!("sync worker failed: {}", error);
                    }
                    break;
                }
                Ok(event) = stats_rx.recv() => accounting.record(event),
                Ok(job) = error_rx.recv() => accounting.fail(job),
                _ = tokio::time::sleep(tuning.join_timeout) => {
                    tracing::info!("still waiting for sync workers to exit");
                }
            }
        }
    }
    accounting.drain(&stats_rx, &error_rx);
    for job in &accounting.pending {
        tracing::error!("giving up on {:?}", job.source);
    }
    let mut summary = accounting.summary;
    summary.failed = accounting.pending.len() + lost;
    tracing::info!(
        "{}",
        accounting
            .printer
            .print(&accounting.progress, 0, summary.failed)
    );
    Ok(summary)
}

/// Run one sync between `source` and `dest`
#[instrument(skip_all, fields(source = ?source.root, dest = ?dest.root))]
pub async fn sync(
    source: &Location<'_>,
    dest: &Location<'_>,
    jobs: JobSource<'_>,
    settings: &Settings,
) -> Result<Summary> {
    let job_map = build_jobs(source.storage, source.root, dest.root, jobs, settings).await?;
    prepare_destination(dest.storage, dest.root, job_map.values()).await?;
    tracing::info!(
        "syncing {} objects from {:?} to {:?}",
        job_map.len(),
        source.root,
        dest.root
    );
    let summary = run_pool(
        source.connector,
        dest.connector,
        job_map.into_values().collect(),
        settings,
    )
    .await?;
    if summary.success() {
        tracing::info!("sync of {:?} complete", source.root);
    } else {
        tracing::error!(
            "sync of {:?} incomplete: {} of {} objects in place, {} skipped, {} failed",
            source.root,
            summary.synced(),
            summary.jobs,
            summary.skipped,
            summary.failed
        );
    }
    Ok(summary)
}
