//! Lazy producers of work blocks.
//!
//! The two variants share one operation set: a FIFO retry queue consulted
//! before fresh production, an optional exact length oracle, and a `done`
//! hook releasing per-block resources. The file variant yields one block per
//! input path; the line variant slices a text stream into `blocksize`-line
//! blocks, each materialised into a registry temp file.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, eyre};
use rand::seq::SliceRandom;

use crate::block::Block;
use crate::error::SourceResult;
use crate::workspace::TempRegistry;

/// Where a line source reads from.
#[derive(Debug)]
enum LineOrigin {
    Stdin,
    Path(Utf8PathBuf),
}

/// Yields one block per input file, in order.
pub struct FileSource {
    pending: VecDeque<Utf8PathBuf>,
    retries: VecDeque<Block>,
    total: usize,
}

/// Slices a text stream into blocks of up to `blocksize` lines.
pub struct LineSource {
    reader: Option<Box<dyn BufRead>>,
    origin: LineOrigin,
    blocksize: usize,
    next_line: usize,
    retries: VecDeque<Block>,
}

/// A lazy producer of [`Block`]s with a retry queue.
pub enum BlockSource {
    /// Whole-file blocks.
    Files(FileSource),
    /// Line-sliced blocks.
    Lines(LineSource),
}

impl BlockSource {
    /// Builds a file source over `paths`, one block per path.
    #[must_use]
    pub fn files(paths: Vec<Utf8PathBuf>) -> Self {
        let total = paths.len();
        Self::Files(FileSource {
            pending: paths.into(),
            retries: VecDeque::new(),
            total,
        })
    }

    /// Builds a line source reading from `path`.
    pub fn lines_from_path(path: Utf8PathBuf, blocksize: usize) -> SourceResult<Self> {
        let file =
            File::open(path.as_std_path()).with_context(|| format!("open input {path}"))?;
        Ok(Self::Lines(LineSource {
            reader: Some(Box::new(BufReader::new(file))),
            origin: LineOrigin::Path(path),
            blocksize,
            next_line: 0,
            retries: VecDeque::new(),
        }))
    }

    /// Builds a line source over a shuffled copy of `path`.
    ///
    /// All lines are read into memory, shuffled, and spilt to a registry
    /// temp file that backs the returned source.
    pub fn lines_shuffled_from_path(
        path: &Utf8Path,
        blocksize: usize,
        temps: &mut TempRegistry,
    ) -> SourceResult<Self> {
        let file =
            File::open(path.as_std_path()).with_context(|| format!("open input {path}"))?;
        let spilt = spill_shuffled(BufReader::new(file), temps)?;
        Self::lines_from_path(spilt, blocksize)
    }

    /// Builds a line source over a shuffled copy of standard input.
    ///
    /// The spilt copy is a regular file, so unlike the unshuffled stdin
    /// source the result supports [`BlockSource::total_blocks`].
    pub fn lines_shuffled_from_stdin(
        blocksize: usize,
        temps: &mut TempRegistry,
    ) -> SourceResult<Self> {
        let spilt = spill_shuffled(io::stdin().lock(), temps)?;
        Self::lines_from_path(spilt, blocksize)
    }

    /// Builds a line source reading from standard input.
    ///
    /// Stdin-backed sources cannot answer [`BlockSource::total_blocks`].
    #[must_use]
    pub fn lines_from_stdin(blocksize: usize) -> Self {
        Self::Lines(LineSource {
            reader: Some(Box::new(BufReader::new(io::stdin()))),
            origin: LineOrigin::Stdin,
            blocksize,
            next_line: 0,
            retries: VecDeque::new(),
        })
    }

    /// True while the retry queue is non-empty or the stream can still
    /// produce a fresh block.
    pub fn has_more(&mut self) -> bool {
        match self {
            Self::Files(src) => !src.retries.is_empty() || !src.pending.is_empty(),
            Self::Lines(src) => !src.retries.is_empty() || src.stream_has_bytes(),
        }
    }

    /// Returns the next block, preferring queued retries, or `None` once the
    /// source is exhausted.
    pub fn next_block(&mut self, temps: &mut TempRegistry) -> SourceResult<Option<Block>> {
        match self {
            Self::Files(src) => {
                if let Some(block) = src.retries.pop_front() {
                    return Ok(Some(block));
                }
                Ok(src
                    .pending
                    .pop_front()
                    .map(|path| Block::new(path.clone(), format!("file {path}"))))
            }
            Self::Lines(src) => {
                if let Some(block) = src.retries.pop_front() {
                    return Ok(Some(block));
                }
                src.produce(temps)
            }
        }
    }

    /// Pushes a failed block onto the retry queue.
    pub fn retry(&mut self, block: Block) {
        match self {
            Self::Files(src) => src.retries.push_back(block),
            Self::Lines(src) => src.retries.push_back(block),
        }
    }

    /// Signals that `block` was fetched successfully.
    ///
    /// The line variant releases the block's temp file; the file variant's
    /// inputs are the caller's files and are left alone.
    pub fn done(&mut self, block: &Block, temps: &mut TempRegistry) {
        if let Self::Lines(_) = self {
            temps.remove_temp(block.input());
        }
    }

    /// Releases the underlying stream.
    pub fn close(&mut self) {
        if let Self::Lines(src) = self {
            src.reader = None;
        }
    }

    /// Exact number of blocks this source will produce.
    ///
    /// Required by the failover policy. Errors for stdin-backed line sources,
    /// whose length is unknowable up front.
    pub fn total_blocks(&self) -> SourceResult<usize> {
        match self {
            Self::Files(src) => Ok(src.total),
            Self::Lines(src) => match &src.origin {
                LineOrigin::Stdin => {
                    Err(eyre!("cannot count blocks of a stdin-backed source").into())
                }
                LineOrigin::Path(path) => {
                    let file = File::open(path.as_std_path())
                        .with_context(|| format!("open input {path} to count lines"))?;
                    let lines = BufReader::new(file).lines().count();
                    Ok(lines.div_ceil(src.blocksize))
                }
            },
        }
    }
}

/// Reads every line from `reader`, shuffles them, and writes the result to a
/// fresh registry temp file.
fn spill_shuffled(reader: impl BufRead, temps: &mut TempRegistry) -> SourceResult<Utf8PathBuf> {
    let mut lines: Vec<String> = reader
        .lines()
        .collect::<io::Result<_>>()
        .context("read input for shuffling")?;
    lines.shuffle(&mut rand::rng());

    let path = temps.create_temp();
    let mut file = File::create(path.as_std_path())
        .with_context(|| format!("create shuffled input {path}"))?;
    for line in &lines {
        writeln!(file, "{line}").with_context(|| format!("write shuffled input {path}"))?;
    }
    Ok(path)
}

impl LineSource {
    fn stream_has_bytes(&mut self) -> bool {
        self.reader
            .as_mut()
            .is_some_and(|reader| reader.fill_buf().map(|buf| !buf.is_empty()).unwrap_or(false))
    }

    /// Reads up to `blocksize` lines into a fresh temp file. The final block
    /// may be short; a drained stream yields `None`.
    fn produce(&mut self, temps: &mut TempRegistry) -> SourceResult<Option<Block>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let mut lines = String::new();
        let mut count = 0;
        while count < self.blocksize {
            let read = reader
                .read_line(&mut lines)
                .context("read line from input stream")?;
            if read == 0 {
                break;
            }
            count += 1;
        }
        if count == 0 {
            self.reader = None;
            return Ok(None);
        }

        let path = temps.create_temp();
        let mut file = File::create(path.as_std_path())
            .with_context(|| format!("create block temp {path}"))?;
        file.write_all(lines.as_bytes())
            .with_context(|| format!("write block temp {path}"))?;

        let first = self.next_line;
        self.next_line += count;
        Ok(Some(Block::new(
            path,
            format!("lines [{},{}]", first, self.next_line - 1),
        )))
    }
}
