//! Local filesystem surface: temp-file registry and result output.
//!
//! The registry issues uniquely named scratch files under the configured temp
//! directory and remembers what it handed out so normal shutdown can sweep
//! stragglers. Output has two modes chosen at construction: lines mode
//! appends every fetched block to a single destination, files mode renames
//! each fetched block next to its input file's basename.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, ErrorKind, Write};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::block::Block;
use crate::error::OutputResult;
use crate::observability::{LOCAL_HOST, LOG_TARGET};

/// Issues and tracks local scratch files.
#[derive(Debug)]
pub struct TempRegistry {
    dir: Utf8PathBuf,
    issued: HashSet<Utf8PathBuf>,
}

impl TempRegistry {
    /// Creates a registry rooted at `dir`, creating the directory if needed.
    pub fn new(dir: Utf8PathBuf) -> OutputResult<Self> {
        fs::create_dir_all(dir.as_std_path())
            .with_context(|| format!("create temp directory {dir}"))?;
        Ok(Self {
            dir,
            issued: HashSet::new(),
        })
    }

    /// Returns a never-before-issued path under the temp directory.
    ///
    /// The file itself is not created; callers redirect into the path or
    /// write it themselves.
    pub fn create_temp(&mut self) -> Utf8PathBuf {
        loop {
            let path = self
                .dir
                .join(format!("kssh_{}_temp", Uuid::new_v4().simple()));
            if self.issued.insert(path.clone()) {
                return path;
            }
        }
    }

    /// Removes `path` from disk and from the registry, tolerating absence.
    pub fn remove_temp(&mut self, path: &Utf8Path) {
        self.issued.remove(path);
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(target: LOG_TARGET, host = LOCAL_HOST, %path, "temp file already gone");
            }
            Err(err) => {
                warn!(target: LOG_TARGET, host = LOCAL_HOST, %path, error = %err, "failed to remove temp file");
            }
        }
    }

    /// Drops `path` from the registry without touching the file.
    ///
    /// Used when the file has been renamed to its final destination.
    pub fn forget(&mut self, path: &Utf8Path) {
        self.issued.remove(path);
    }

    /// Removes every outstanding temp file. Used on normal shutdown.
    pub fn cleanup(&mut self) {
        let outstanding: Vec<Utf8PathBuf> = self.issued.drain().collect();
        for path in outstanding {
            match fs::remove_file(path.as_std_path()) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(target: LOG_TARGET, host = LOCAL_HOST, %path, error = %err, "failed to sweep temp file");
                }
            }
        }
    }
}

/// Destination for fetched block output in lines mode.
#[derive(Debug)]
enum LinesDest {
    Stdout,
    File { path: Utf8PathBuf, file: File },
}

#[derive(Debug)]
enum Sink {
    Lines(LinesDest),
    Files { dir: Utf8PathBuf },
}

/// Owns the temp registry and the configured output sink.
#[derive(Debug)]
pub struct Workspace {
    temps: TempRegistry,
    sink: Sink,
}

impl Workspace {
    /// Builds a lines-mode workspace.
    ///
    /// With no `output`, fetched blocks append to standard out. A directory
    /// `output` synthesises a `<KEY>_result` file inside it; a file path is
    /// truncated if it already exists.
    pub fn lines(temp_dir: Utf8PathBuf, key: &str, output: Option<Utf8PathBuf>) -> OutputResult<Self> {
        let temps = TempRegistry::new(temp_dir)?;
        let dest = match output {
            None => LinesDest::Stdout,
            Some(path) => {
                let path = if path.as_std_path().is_dir() {
                    path.join(format!("{key}_result"))
                } else {
                    path
                };
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path.as_std_path())
                    .with_context(|| format!("open output file {path}"))?;
                LinesDest::File { path, file }
            }
        };
        Ok(Self {
            temps,
            sink: Sink::Lines(dest),
        })
    }

    /// Builds a files-mode workspace writing one output file per input file
    /// into `output_dir`.
    pub fn files(temp_dir: Utf8PathBuf, output_dir: Utf8PathBuf) -> OutputResult<Self> {
        let temps = TempRegistry::new(temp_dir)?;
        fs::create_dir_all(output_dir.as_std_path())
            .with_context(|| format!("create output directory {output_dir}"))?;
        Ok(Self {
            temps,
            sink: Sink::Files { dir: output_dir },
        })
    }

    /// The temp-file registry.
    pub fn temps(&mut self) -> &mut TempRegistry {
        &mut self.temps
    }

    /// Materialises a fetched block.
    ///
    /// Lines mode appends the whole stdout temp to the destination and
    /// re-logs the stderr temp line by line under the worker's hostname.
    /// Files mode renames the stdout temp to `<basename>.out` beside the
    /// other outputs, suffixing a counter on collision.
    pub fn write(
        &mut self,
        hostname: &str,
        block: &Block,
        out_tmp: &Utf8Path,
        err_tmp: &Utf8Path,
    ) -> OutputResult<()> {
        match &mut self.sink {
            Sink::Lines(dest) => {
                append_output(dest, out_tmp)?;
                log_stderr_lines(hostname, err_tmp);
                self.temps.remove_temp(out_tmp);
                self.temps.remove_temp(err_tmp);
            }
            Sink::Files { dir } => {
                let basename = block.input().file_name().unwrap_or("block");
                let dest = unclaimed_output_path(dir, basename);
                move_file(out_tmp, &dest)?;
                info!(
                    target: LOG_TARGET,
                    host = hostname,
                    block = block.description(),
                    output = %dest,
                    "wrote block output"
                );
                log_stderr_lines(hostname, err_tmp);
                self.temps.forget(out_tmp);
                self.temps.remove_temp(err_tmp);
            }
        }
        Ok(())
    }

    /// Sweeps all outstanding temp files.
    pub fn cleanup(&mut self) {
        self.temps.cleanup();
    }
}

fn append_output(dest: &mut LinesDest, out_tmp: &Utf8Path) -> OutputResult<()> {
    let mut src = File::open(out_tmp.as_std_path())
        .with_context(|| format!("open fetched output {out_tmp}"))?;
    match dest {
        LinesDest::Stdout => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            io::copy(&mut src, &mut lock).context("append block output to stdout")?;
            lock.flush().context("flush stdout")?;
        }
        LinesDest::File { path, file } => {
            io::copy(&mut src, file).with_context(|| format!("append block output to {path}"))?;
        }
    }
    Ok(())
}

/// Streams a fetched stderr temp into the log, one event per line, tagged
/// with the originating worker.
fn log_stderr_lines(hostname: &str, err_tmp: &Utf8Path) {
    let file = match File::open(err_tmp.as_std_path()) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return,
        Err(err) => {
            warn!(target: LOG_TARGET, host = hostname, path = %err_tmp, error = %err, "failed to open fetched stderr");
            return;
        }
    };
    for line in BufReader::new(file).lines() {
        match line {
            Ok(line) => warn!(target: LOG_TARGET, host = hostname, "{line}"),
            Err(err) => {
                warn!(target: LOG_TARGET, host = hostname, error = %err, "failed to read fetched stderr");
                return;
            }
        }
    }
}

/// First `<basename>.out` path in `dir` that does not exist yet, counting up
/// through `.out1`, `.out2`, ... on collision.
fn unclaimed_output_path(dir: &Utf8Path, basename: &str) -> Utf8PathBuf {
    let mut candidate = dir.join(format!("{basename}.out"));
    let mut counter = 0u32;
    while candidate.as_std_path().exists() {
        counter += 1;
        candidate = dir.join(format!("{basename}.out{counter}"));
    }
    candidate
}

/// Renames `src` to `dest`, falling back to copy-and-remove when the temp
/// directory and the output directory sit on different filesystems.
fn move_file(src: &Utf8Path, dest: &Utf8Path) -> OutputResult<()> {
    if fs::rename(src.as_std_path(), dest.as_std_path()).is_ok() {
        return Ok(());
    }
    fs::copy(src.as_std_path(), dest.as_std_path())
        .with_context(|| format!("copy {src} to {dest}"))?;
    fs::remove_file(src.as_std_path()).with_context(|| format!("remove {src} after copy"))?;
    Ok(())
}
