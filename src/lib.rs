//! Control-plane dispatcher that splits a bulk workload across a fleet of
//! remote workers reachable via a shell transport.
//!
//! The workload arrives either as a stream of records, sliced into
//! fixed-size line blocks, or as a set of whole files. Each block is
//! uploaded to a worker, executed there under a user-supplied task fragment,
//! polled for liveness through a heartbeat file, fetched on completion, and
//! written back locally. Blocks are load-balanced using measured per-worker
//! performance, retried on transient failure, and chronically failing
//! workers are quarantined.

use clap::Parser;
use color_eyre::eyre::{bail, eyre};
use tracing::info;

pub mod block;
pub mod cli;
pub mod dispatch;
pub mod error;
pub mod machines;
pub mod observability;
pub mod remote;
pub mod source;
pub mod transaction;
pub mod worker;
pub mod workspace;

pub use error::{Error, Result};

use crate::cli::{Cli, InputSpec};
use crate::dispatch::{DispatchOptions, Dispatcher};
use crate::observability::{LOCAL_HOST, LOG_TARGET};
use crate::source::BlockSource;
use crate::worker::Worker;
use crate::workspace::Workspace;

/// Binary entry point: installs error reporting and tracing, parses the
/// command line, and drives a full dispatch run.
pub fn run() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    observability::init_tracing();
    execute(Cli::parse())
}

/// Runs one dispatch described by an already-parsed command line.
pub fn execute(cli: Cli) -> color_eyre::eyre::Result<()> {
    if cli.blocksize == 0 {
        bail!("--blocksize must be at least 1");
    }
    let key = remote::generate_key();
    info!(target: LOG_TARGET, host = LOCAL_HOST, key = %key, "starting run");

    let machines = machines::load(&cli.machines)?;
    if machines.is_empty() {
        bail!("no machines configured in {}", cli.machines);
    }
    let mut workers = Vec::with_capacity(machines.len());
    for machine in machines {
        workers.push(Worker::new(machine, &key)?);
    }

    let task = cli::load_task(&cli.task)?;
    let (workspace, source) = match cli::resolve_inputs(&cli.input, cli.shuffle)? {
        InputSpec::StdinLines => {
            let mut workspace =
                Workspace::lines(cli.temp_directory.clone(), &key, cli.output.clone())?;
            let source = if cli.shuffle {
                BlockSource::lines_shuffled_from_stdin(cli.blocksize, workspace.temps())?
            } else {
                BlockSource::lines_from_stdin(cli.blocksize)
            };
            (workspace, source)
        }
        InputSpec::FileLines(path) => {
            let mut workspace =
                Workspace::lines(cli.temp_directory.clone(), &key, cli.output.clone())?;
            let source = if cli.shuffle {
                BlockSource::lines_shuffled_from_path(&path, cli.blocksize, workspace.temps())?
            } else {
                BlockSource::lines_from_path(path, cli.blocksize)?
            };
            (workspace, source)
        }
        InputSpec::Files(paths) => {
            let output = cli
                .output
                .clone()
                .ok_or_else(|| eyre!("files mode requires --output DIRECTORY"))?;
            let workspace = Workspace::files(cli.temp_directory.clone(), output)?;
            (workspace, BlockSource::files(paths))
        }
    };

    let options = DispatchOptions {
        mode: cli.distribution_mode,
        concurrency: cli.concurrency.max(1),
        task,
        task_success_code: cli.task_success_code,
    };
    let mut dispatcher = Dispatcher::new(workers, source, workspace, options)?;
    dispatcher.initialize(cli.init_file.as_deref(), cli.init_script.as_deref())?;
    dispatcher.run()?;
    if cli.cleanup_remote {
        dispatcher.cleanup_remote();
    }
    dispatcher.finish();
    Ok(())
}
