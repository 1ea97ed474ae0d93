//! Command-line surface and input resolution.
//!
//! Inputs decide the dispatch mode: a single stream or file is sliced into
//! line blocks, anything else is dispatched as whole files. Directory inputs
//! expand to their immediate children and non-path strings are treated as
//! glob patterns.

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use color_eyre::eyre::{Context, eyre};
use rand::seq::SliceRandom;

use crate::dispatch::DistributionMode;
use crate::error::ConfigResult;

/// Splits a bulk workload into blocks and dispatches them across remote
/// workers over a shell transport.
#[derive(Debug, Parser)]
#[command(name = "kssh", version, about)]
pub struct Cli {
    /// Input paths or glob patterns; standard input when omitted.
    #[arg(long = "input", value_name = "PATH", num_args = 1..)]
    pub input: Vec<String>,

    /// Lines per block in lines mode; ignored in files mode.
    #[arg(long, value_name = "N", default_value_t = 100)]
    pub blocksize: usize,

    /// Shuffle the input ordering before dispatch.
    #[arg(long)]
    pub shuffle: bool,

    /// Path to the machines configuration.
    #[arg(long, value_name = "PATH", default_value = ".machines")]
    pub machines: Utf8PathBuf,

    /// Shell fragment to run on each worker, or a path to a file holding one.
    #[arg(long, value_name = "CMD|PATH", default_value = "cat -")]
    pub task: String,

    /// Remote exit code counted as task success.
    #[arg(long = "task-success-code", value_name = "N", default_value_t = 0)]
    pub task_success_code: i32,

    /// How fresh blocks are spread over idle workers.
    #[arg(long = "distribution-mode", value_enum, default_value = "performance")]
    pub distribution_mode: DistributionMode,

    /// Directory for local scratch files.
    #[arg(long = "temp-directory", value_name = "PATH", default_value = ".")]
    pub temp_directory: Utf8PathBuf,

    /// Output file or directory; standard output by default (lines mode
    /// only).
    #[arg(long, value_name = "PATH")]
    pub output: Option<Utf8PathBuf>,

    /// Maximum transactions in flight at once.
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub concurrency: usize,

    /// File broadcast to every worker's working directory before dispatch.
    #[arg(long = "init-file", value_name = "PATH")]
    pub init_file: Option<Utf8PathBuf>,

    /// Script broadcast to and run on every worker before dispatch.
    #[arg(long = "init-script", value_name = "PATH")]
    pub init_script: Option<Utf8PathBuf>,

    /// After dispatch, remove the run's files from each worker.
    #[arg(long = "cleanup-remote")]
    pub cleanup_remote: bool,
}

/// The resolved input shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSpec {
    /// Slice standard input into line blocks.
    StdinLines,
    /// Slice one local file into line blocks.
    FileLines(Utf8PathBuf),
    /// Dispatch each file as one block.
    Files(Vec<Utf8PathBuf>),
}

/// Resolves the `--input` arguments into an [`InputSpec`].
///
/// `shuffle` reorders the file list here; line-mode shuffling happens when
/// the source is built, because it has to spill through the temp registry.
pub fn resolve_inputs(patterns: &[String], shuffle: bool) -> ConfigResult<InputSpec> {
    if patterns.is_empty() || (patterns.len() == 1 && patterns[0] == "-") {
        return Ok(InputSpec::StdinLines);
    }

    let mut files = Vec::new();
    for pattern in patterns {
        files.extend(expand_pattern(pattern)?);
    }
    if files.is_empty() {
        return Err(eyre!("inputs matched no files").into());
    }

    if patterns.len() == 1 && files.len() == 1 && !Utf8Path::new(&patterns[0]).is_dir() {
        return Ok(InputSpec::FileLines(files.remove(0)));
    }
    if shuffle {
        files.shuffle(&mut rand::rng());
    }
    Ok(InputSpec::Files(files))
}

/// Expands one input argument: an existing directory lists its immediate
/// children, an existing file stands for itself, anything else globs.
fn expand_pattern(pattern: &str) -> ConfigResult<Vec<Utf8PathBuf>> {
    let path = Utf8Path::new(pattern);
    if path.is_dir() {
        let mut children = Vec::new();
        let entries = path
            .read_dir_utf8()
            .with_context(|| format!("list input directory {path}"))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("list input directory {path}"))?;
            if entry.path().is_file() {
                children.push(entry.into_path());
            }
        }
        children.sort();
        return Ok(children);
    }
    if path.is_file() {
        return Ok(vec![path.to_owned()]);
    }

    let mut matches = Vec::new();
    let paths =
        glob::glob(pattern).map_err(|err| eyre!("bad input pattern {pattern:?}: {err}"))?;
    for hit in paths {
        let hit = hit.map_err(|err| eyre!("unreadable glob match under {pattern:?}: {err}"))?;
        if hit.is_file() {
            let hit = Utf8PathBuf::from_path_buf(hit)
                .map_err(|p| eyre!("input path {} is not UTF-8", p.display()))?;
            matches.push(hit);
        }
    }
    matches.sort();
    Ok(matches)
}

/// Loads the task fragment: the contents of `task` when it names a file,
/// the string itself otherwise.
pub fn load_task(task: &str) -> ConfigResult<String> {
    let path = Utf8Path::new(task);
    if path.is_file() {
        let body = std::fs::read_to_string(path.as_std_path())
            .with_context(|| format!("read task file {path}"))?;
        return Ok(body.trim_end().to_owned());
    }
    Ok(task.to_owned())
}
