//! Common building blocks of the arcsync tools
//!
//! The crate is organized around a replication pipeline:
//!
//! - [`storage`] abstracts the backends folders are read from and written to
//! - [`filter`] decides which relative paths take part in a sync
//! - [`manifest`] parses checksum manifests shipped inside source folders
//! - [`sync`] mirrors one folder with a bounded pool of workers
//! - [`replicate`] discovers folders, applies the readiness gates and stamps metadata
//!
//! [`checksum`] hosts the hashing helpers shared by the sync engine and the `archash` tool.
//!
//! # Bootstrap
//!
//! Every binary hands its async entry point to [`run`] together with an [`OutputConfig`] and a
//! [`RuntimeConfig`]. `run` builds the tokio runtime, installs the tracing subscriber and prints
//! the summary. A `None` return means the tool failed and should exit with a non-zero status.

pub mod checksum;
pub mod config;
pub mod filter;
pub mod manifest;
pub mod progress;
pub mod replicate;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig};

fn init_tracing(output: &OutputConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.level()));
    // a second initialization (e.g. from a test harness) is harmless
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn build_runtime(runtime: &RuntimeConfig) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder.build()
}

/// Run `func` on a fresh tokio runtime and report its outcome
pub fn run<Fut, Summary>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    init_tracing(&output);
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to start the async runtime: {:#}", error);
            }
            return None;
        }
    };
    let res = runtime.block_on(func());
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                if output.summary_to_stderr {
                    eprintln!("{}", &summary);
                } else {
                    println!("{}", &summary);
                }
            }
            Some(summary)
        }
        Err(err) => {
            if !output.quiet {
                tracing::error!("{:#}", err);
                eprintln!("{:#}", err);
            }
            None
        }
    }
}
