use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::instrument;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    /// `<sha256>  <relative path>` lines
    #[default]
    Text,
    /// JSON document with a `collection` name and a list of `objects`
    Generic,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "archash",
    version,
    about = "Write a SHA-256 checksum manifest for a folder",
    long_about = "`archash` hashes every regular file below a folder and writes a manifest that `arcsync --manifest` accepts.

EXAMPLE:
    # Ship a manifest inside the run folder
    archash /data/run42 -o /data/run42/run42.sha256

When the output file lies inside the hashed folder it is left out of the manifest."
)]
struct Args {
    // Manifest
    /// Write the manifest here instead of stdout
    #[arg(short = 'o', long, value_name = "PATH", help_heading = "Manifest")]
    output: Option<PathBuf>,

    /// Manifest format
    #[arg(long, default_value = "text", value_enum, value_name = "FORMAT", help_heading = "Manifest")]
    format: OutputFormat,

    /// Collection name of a generic manifest, defaults to the folder name
    #[arg(long, value_name = "NAME", help_heading = "Manifest")]
    collection: Option<String>,

    // Performance
    /// Number of files hashed concurrently
    #[arg(long, default_value = "8", value_name = "N", help_heading = "Performance")]
    workers: usize,

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

    // ARGUMENTS
    /// Folder to hash
    source: PathBuf,
}

/// Path of `output` relative to `root`, if the manifest is written inside the hashed tree
fn relative_output(root: &Path, output: &Path) -> Option<String> {
    let root = std::fs::canonicalize(root).ok()?;
    let parent = std::fs::canonicalize(output.parent()?).ok()?;
    let relative = parent.strip_prefix(&root).ok()?.join(output.file_name()?);
    Some(relative.to_string_lossy().replace('\\', "/"))
}

#[instrument]
async fn async_main(args: Args) -> Result<common::checksum::Summary> {
    if !tokio::fs::metadata(&args.source)
        .await
        .with_context(|| format!("cannot access {:?}", &args.source))?
        .is_dir()
    {
        return Err(anyhow!("{:?} is not a folder", &args.source));
    }
    let skip = args
        .output
        .as_deref()
        .and_then(|output| relative_output(&args.source, output));
    let (hashes, summary) =
        common::checksum::hash_tree(&args.source, skip.as_deref(), args.workers).await?;
    let document = match args.format {
        OutputFormat::Text => common::checksum::to_text(&hashes),
        OutputFormat::Generic => {
            let collection = match &args.collection {
                Some(name) => name.clone(),
                None => args
                    .source
                    .canonicalize()?
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            };
            common::checksum::to_generic_json(&hashes, &collection)?
        }
    };
    match &args.output {
        Some(path) => tokio::fs::write(path, document)
            .await
            .with_context(|| format!("failed writing manifest {:?}", path))?,
        None => print!("{}", document),
    }
    Ok(summary)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
        summary_to_stderr: args.output.is_none(),
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: 0,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
