use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::filter::PathFilter;
use common::manifest::{ManifestFormat, ManifestSchema};
use common::replicate::{self, ManifestSettings};
use common::storage::{Connector, Endpoint, Registry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "arcsync",
    version,
    about = "Replicate instrument output folders into an archive with checksum verification",
    long_about = "`arcsync` copies folders from a source backend to a destination backend, verifies what is already in place and tags finished folders with provenance metadata.

By default SOURCE is a single folder. With --search, SOURCE is a base path whose subfolders are the candidates; each of them is checked against the folder selection gates and synced into DEST/<folder name>.

EXAMPLES:
    # Sync one folder, DEST ending with '/' means DEST/<basename of SOURCE>
    arcsync /data/run42 /archive/ --summary

    # Replicate every settled run below /data that ships a checksum manifest
    arcsync --search --folder-pattern 'run[0-9]+' --min-age 1h --manifest '*.sha256' /data /archive"
)]
struct Args {
    // Backends
    /// Source storage backend (see --list-fs)
    #[arg(short = 's', long, default_value = "local", value_name = "BACKEND", help_heading = "Backends")]
    source_fs: String,

    /// Source backend options as key=value,key=value
    #[arg(short = 'o', long, value_name = "OPTIONS", help_heading = "Backends")]
    source_options: Option<String>,

    /// Destination storage backend (see --list-fs)
    #[arg(long, default_value = "local", value_name = "BACKEND", help_heading = "Backends")]
    dest_fs: String,

    /// Destination backend options as key=value,key=value
    #[arg(short = 'd', long, value_name = "OPTIONS", help_heading = "Backends")]
    dest_options: Option<String>,

    /// List the available storage backends and exit
    #[arg(long, help_heading = "Backends")]
    list_fs: bool,

    // Folder selection
    /// Treat SOURCE as a base path and replicate each of its subfolders
    #[arg(long, help_heading = "Folder selection")]
    search: bool,

    /// Descend this many levels of directories below SOURCE before looking for candidates
    #[arg(short = 'n', long, default_value = "0", value_name = "N", help_heading = "Folder selection")]
    skip_subdirs: usize,

    /// Regex the folder name must match (whole name, case-insensitive)
    #[arg(short = 'P', long, value_name = "REGEX", help_heading = "Folder selection")]
    folder_pattern: Option<String>,

    /// Glob for a flag file that must exist in the folder, e.g. "RTAComplete*.txt"
    #[arg(short = 'f', long, value_name = "GLOB", help_heading = "Folder selection")]
    flag_file: Option<String>,

    /// Minimum age of the youngest flag file
    ///
    /// Ages accept plain seconds or a human readable duration, e.g. "3600", "90s", "1h 30m".
    #[arg(short = 'g', long, default_value = "0", value_name = "AGE", value_parser = common::config::parse_age, help_heading = "Folder selection")]
    flag_age: Duration,

    /// Skip folders with changes more recent than this
    #[arg(short = 'a', long, value_name = "AGE", value_parser = common::config::parse_age, help_heading = "Folder selection")]
    min_age: Option<Duration>,

    /// Skip folders whose newest change is older than this
    #[arg(short = 'A', long, value_name = "AGE", value_parser = common::config::parse_age, help_heading = "Folder selection")]
    max_age: Option<Duration>,

    /// Require the destination attribute to hold a Unix time at least AGE ago (repeatable)
    #[arg(short = 'T', long, value_name = "ATTR=AGE", value_parser = parse_timestamp_age, help_heading = "Folder selection")]
    timestamp_age: Vec<(String, Duration)>,

    /// Skip folders whose destination already carries this attribute value
    #[arg(short = 'O', long, value_name = "ATTR=VALUE", value_parser = common::config::parse_pair, help_heading = "Folder selection")]
    completion_attr: Option<(String, String)>,

    // Objects to sync
    /// Glob, relative to the folder, matching exactly one checksum manifest
    #[arg(short = 'c', long, alias = "checksum-file", value_name = "GLOB", help_heading = "Objects to sync")]
    manifest: Option<String>,

    /// Format of the checksum manifest
    #[arg(long, default_value_t, value_enum, value_name = "FORMAT", help_heading = "Objects to sync")]
    manifest_format: ManifestFormat,

    /// JSON schema for structured manifests, defaults to the built-in schema of the format
    #[arg(long, value_name = "PATH", help_heading = "Objects to sync")]
    manifest_schema: Option<PathBuf>,

    /// YAML filter rules applied to the paths listed in the manifest
    #[arg(long, alias = "filter-file", value_name = "PATH", help_heading = "Objects to sync")]
    manifest_filter_file: Option<PathBuf>,

    /// Walk the source folder for objects to sync, implied when no --manifest is given
    #[arg(long, help_heading = "Objects to sync")]
    scan: bool,

    /// YAML filter rules applied to the paths found by scanning
    #[arg(long, value_name = "PATH", help_heading = "Objects to sync")]
    scan_filter_file: Option<PathBuf>,

    /// Regex for relative paths to leave out, anchored at the start (repeatable)
    #[arg(short = 'X', long, value_name = "REGEX", help_heading = "Objects to sync")]
    exclude: Vec<String>,

    /// Defer files modified more recently than this
    #[arg(short = 'w', long, value_name = "AGE", value_parser = common::config::parse_age, help_heading = "Objects to sync")]
    last_write: Option<Duration>,

    // Copy options
    /// Compare checksums of existing objects and verify every copy
    #[arg(short = 'x', long, help_heading = "Copy options")]
    verify_checksums: bool,

    /// Copy every object without comparing it to the destination first
    #[arg(short = 'z', long, help_heading = "Copy options")]
    no_compare: bool,

    /// Number of concurrent copy workers
    #[arg(short = 't', long, default_value = "1", value_name = "N", help_heading = "Copy options")]
    copy_procs: usize,

    // Metadata
    /// Attribute set on the destination folder after a successful sync (repeatable)
    ///
    /// Values may use %sf (source folder name), %sp (source path), %df (destination folder
    /// name), %dp (destination path) and %t (current Unix time).
    #[arg(short = 'm', long, value_name = "ATTR=VALUE", value_parser = common::config::parse_pair, help_heading = "Metadata")]
    metadata: Vec<(String, String)>,

    // Progress & output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(long, default_value = "0", value_name = "N", help_heading = "Advanced settings")]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(long, default_value = "0", value_name = "N", help_heading = "Advanced settings")]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source folder, or the base path to search with --search
    #[arg(required_unless_present = "list_fs")]
    source: Option<String>,

    /// Destination folder, or the destination root with --search
    #[arg(required_unless_present = "list_fs")]
    dest: Option<String>,
}

fn parse_timestamp_age(value: &str) -> Result<(String, Duration)> {
    let (attribute, age) = common::config::parse_pair(value)?;
    Ok((attribute, common::config::parse_age(&age)?))
}

fn connector(registry: &Registry, backend: &str, options: Option<&str>) -> Result<Connector> {
    let options = options
        .map(common::storage::parse_options)
        .transpose()?
        .unwrap_or_default();
    let endpoint = Endpoint::new(backend, options);
    // fail on unknown backends or options before touching any folder
    registry
        .connect(&endpoint)
        .with_context(|| format!("invalid backend configuration for '{}'", backend))?;
    Ok(Connector::new(registry.clone(), endpoint))
}

fn load_filter(path: Option<&Path>) -> Result<PathFilter> {
    Ok(path.map(PathFilter::from_file).transpose()?.unwrap_or_default())
}

fn build_settings(args: &Args) -> Result<replicate::Settings> {
    let manifest = match &args.manifest {
        Some(pattern) => {
            let schema = match &args.manifest_schema {
                Some(path) => Some(ManifestSchema::load(path)?),
                None => ManifestSchema::builtin(args.manifest_format)?,
            };
            Some(ManifestSettings {
                pattern: pattern.clone(),
                format: args.manifest_format,
                schema: schema.map(Arc::new),
            })
        }
        None => None,
    };
    let sync = common::sync::Settings {
        concurrency: args.copy_procs.max(1),
        compare: !args.no_compare,
        verify_checksums: args.verify_checksums,
        excludes: common::sync::compile_excludes(&args.exclude)?,
        minimum_age: args.last_write,
        manifest_filter: load_filter(args.manifest_filter_file.as_deref())?,
        scan_filter: load_filter(args.scan_filter_file.as_deref())?,
        tuning: Default::default(),
    };
    Ok(replicate::Settings {
        skip_subdirs: args.skip_subdirs,
        folder_pattern: args
            .folder_pattern
            .as_deref()
            .map(replicate::folder_pattern)
            .transpose()?,
        flag_file: args.flag_file.clone(),
        flag_age: args.flag_age,
        min_age: args.min_age.unwrap_or_default(),
        max_age: args.max_age,
        scan: args.scan || manifest.is_none(),
        manifest,
        timestamp_gates: args.timestamp_age.clone(),
        completion: args.completion_attr.clone(),
        metadata: args.metadata.clone(),
        sync,
    })
}

/// In single-folder mode a destination ending with '/' names the parent of the new folder
fn single_destination(source: &str, dest: &str) -> Result<PathBuf> {
    if !dest.ends_with('/') {
        return Ok(PathBuf::from(dest));
    }
    let name = Path::new(source)
        .file_name()
        .ok_or_else(|| anyhow!("cannot derive a folder name from source {:?}", source))?;
    Ok(Path::new(dest).join(name))
}

#[instrument]
async fn async_main(args: Args) -> Result<replicate::Summary> {
    let (Some(source), Some(dest)) = (args.source.as_deref(), args.dest.as_deref()) else {
        return Err(anyhow!("SOURCE and DEST are required"));
    };
    let settings = build_settings(&args)?;
    let registry = Registry::with_builtin();
    let source_connector = connector(&registry, &args.source_fs, args.source_options.as_deref())?;
    let dest_connector = connector(&registry, &args.dest_fs, args.dest_options.as_deref())?;
    let summary = if args.search {
        replicate::replicate(
            &source_connector,
            Path::new(source),
            &dest_connector,
            Path::new(dest),
            &settings,
        )
        .await?
    } else {
        let dest = single_destination(source, dest)?;
        replicate::replicate_single_folder(
            &source_connector,
            Path::new(source),
            &dest_connector,
            &dest,
            &settings,
        )
        .await?
    };
    if !summary.success() {
        if args.summary {
            return Err(anyhow!("arcsync encountered errors\n\n{}", &summary));
        }
        return Err(anyhow!("arcsync encountered errors"));
    }
    Ok(summary)
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.list_fs {
        for (name, options_help) in Registry::with_builtin().describe() {
            if options_help.is_empty() {
                println!("{}", name);
            } else {
                println!("{}: {}", name, options_help);
            }
        }
        return Ok(());
    }
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
        summary_to_stderr: false,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
