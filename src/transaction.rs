//! Non-blocking transaction executor for remote shell commands.
//!
//! A transaction is one attempt at one remote command: a local child process
//! running the worker's transport with the remote script as its final
//! argument, polled at one-second granularity against a deadline and killed
//! on expiry. All failures resolve into the transaction's status; the
//! executor itself never errors. `sync` drains a batch through a bounded pool
//! of scoped threads and returns only once every member is resolved.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::block::Block;
use crate::observability::LOG_TARGET;

/// Granularity of the child-exit poll.
const POLL: Duration = Duration::from_secs(1);

/// Character cap applied to captured streams before they reach the log.
const OUTPUT_CHAR_LIMIT: usize = 2_048;
const TRUNCATION_SUFFIX: &str = "... [truncated]";

/// Resolution state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Not yet executed.
    Incomplete,
    /// Child exited with the success code.
    Success,
    /// Deadline expired and the child was killed (after exhausting retries).
    Timeout,
    /// Child exited with any other code, or could not be run at all.
    Error,
}

/// What the dispatcher intends a transaction for; travels with it through
/// `sync` so the post-handlers can act on the resolved outcome.
#[derive(Debug)]
pub enum Purpose {
    /// Initialization broadcast (file upload or script run).
    Init,
    /// Upload a block and start the task on the worker.
    Start(Block),
    /// Poll the worker's pid file for liveness and completion.
    Check,
    /// Download the finished task's stdout and stderr streams.
    Fetch {
        /// Local temp file receiving the remote stdout stream.
        out: Utf8PathBuf,
        /// Local temp file receiving the remote stderr stream.
        err: Utf8PathBuf,
    },
    /// Remove the run's files from the worker's working directory.
    Cleanup,
}

/// One attempt at one remote shell command.
#[derive(Debug)]
pub struct Transaction {
    worker: usize,
    /// Transport argv: the split `connect_cmd` followed by the address.
    argv: Vec<String>,
    /// Remote script, passed as the single final transport argument.
    command: String,
    timeout: Duration,
    retries: u32,
    attempt: u32,
    success_code: i32,
    stdin: Option<Utf8PathBuf>,
    stdout_path: Option<Utf8PathBuf>,
    stderr_path: Option<Utf8PathBuf>,
    status: TxStatus,
    output: String,
    captured_stderr: String,
    elapsed: Duration,
    purpose: Purpose,
}

impl Transaction {
    /// Creates a transaction against the transport `argv` running `command`.
    #[must_use]
    pub fn new(worker: usize, argv: Vec<String>, command: String, timeout: Duration) -> Self {
        Self {
            worker,
            argv,
            command,
            timeout,
            retries: 0,
            attempt: 0,
            success_code: 0,
            stdin: None,
            stdout_path: None,
            stderr_path: None,
            status: TxStatus::Incomplete,
            output: String::new(),
            captured_stderr: String::new(),
            elapsed: Duration::ZERO,
            purpose: Purpose::Check,
        }
    }

    /// Feeds the child's stdin from `path` instead of `/dev/null`.
    #[must_use]
    pub fn with_stdin(mut self, path: Utf8PathBuf) -> Self {
        self.stdin = Some(path);
        self
    }

    /// Redirects the child's stdout into `path` instead of capturing it.
    #[must_use]
    pub fn with_stdout(mut self, path: Utf8PathBuf) -> Self {
        self.stdout_path = Some(path);
        self
    }

    /// Redirects the child's stderr into `path` instead of capturing it.
    #[must_use]
    pub fn with_stderr(mut self, path: Utf8PathBuf) -> Self {
        self.stderr_path = Some(path);
        self
    }

    /// Grants `retries` extra attempts after a timeout. Timeouts only; an
    /// `Error` resolution is terminal for the transaction.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Counts `code` as the transport's successful exit instead of 0.
    #[must_use]
    pub fn with_success_code(mut self, code: i32) -> Self {
        self.success_code = code;
        self
    }

    /// Tags the transaction with the dispatcher's intent.
    #[must_use]
    pub fn with_purpose(mut self, purpose: Purpose) -> Self {
        self.purpose = purpose;
        self
    }

    /// Index of the target worker in the dispatcher's worker list.
    #[must_use]
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Resolved status.
    #[must_use]
    pub fn status(&self) -> TxStatus {
        self.status
    }

    /// Captured stdout of a successful run (empty when redirected to a file).
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Wall time of the final attempt.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Attempts consumed beyond the first.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Captured stderr, truncated for logging.
    #[must_use]
    pub fn stderr_excerpt(&self) -> String {
        truncate_output(&self.captured_stderr)
    }

    /// Decomposes the resolved transaction for the dispatcher's
    /// post-handlers: worker index, status, captured stdout, wall time, and
    /// purpose.
    #[must_use]
    pub(crate) fn into_parts(self) -> (usize, TxStatus, String, Duration, Purpose) {
        (
            self.worker,
            self.status,
            self.output,
            self.elapsed,
            self.purpose,
        )
    }

    /// Runs the transaction to resolution, retrying timed-out attempts up to
    /// the retry budget.
    pub fn run(&mut self) {
        loop {
            let started = Instant::now();
            self.attempt_once();
            self.elapsed = started.elapsed();
            if self.status == TxStatus::Timeout && self.attempt < self.retries {
                self.attempt += 1;
                debug!(
                    target: LOG_TARGET,
                    host = self.argv.last().map(String::as_str).unwrap_or("?"),
                    attempt = self.attempt,
                    "transaction timed out, retrying"
                );
                continue;
            }
            break;
        }
    }

    fn attempt_once(&mut self) {
        self.output.clear();
        self.captured_stderr.clear();

        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    command = %self.argv.join(" "),
                    error = %err,
                    "failed to spawn transport"
                );
                self.status = TxStatus::Error;
                return;
            }
        };

        let deadline = Instant::now() + self.timeout;
        let exit = loop {
            match child.wait_timeout(POLL) {
                Ok(Some(status)) => break Some(status),
                Ok(None) if Instant::now() >= deadline => break None,
                Ok(None) => {}
                Err(err) => {
                    warn!(target: LOG_TARGET, error = %err, "failed to wait for transport");
                    kill_child(&mut child);
                    let _ = child.wait();
                    self.status = TxStatus::Error;
                    return;
                }
            }
        };

        let Some(exit) = exit else {
            kill_child(&mut child);
            let _ = child.wait();
            self.status = TxStatus::Timeout;
            return;
        };

        self.drain_pipes(&mut child);
        self.status = if exit.code() == Some(self.success_code) {
            TxStatus::Success
        } else {
            TxStatus::Error
        };
    }

    fn spawn(&self) -> io::Result<Child> {
        let (program, rest) = self
            .argv
            .split_first()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "empty transport argv"))?;
        let mut command = Command::new(program);
        command.args(rest).arg(&self.command);

        command.stdin(match &self.stdin {
            Some(path) => Stdio::from(File::open(path.as_std_path())?),
            None => Stdio::null(),
        });
        command.stdout(match &self.stdout_path {
            Some(path) => Stdio::from(File::create(path.as_std_path())?),
            None => Stdio::piped(),
        });
        command.stderr(match &self.stderr_path {
            Some(path) => Stdio::from(File::create(path.as_std_path())?),
            None => Stdio::piped(),
        });
        command.spawn()
    }

    fn drain_pipes(&mut self, child: &mut Child) {
        if let Some(mut pipe) = child.stdout.take() {
            let _ = pipe.read_to_string(&mut self.output);
        }
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut self.captured_stderr);
        }
    }
}

/// Kills a child, tolerating one that already exited.
fn kill_child(child: &mut Child) {
    match child.kill() {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::InvalidInput => {}
        Err(err) => {
            warn!(target: LOG_TARGET, error = %err, "failed to kill timed-out transport");
        }
    }
}

/// Runs `batch` with at most `concurrency` transactions in flight and
/// returns once every member is resolved. No ordering guarantee holds
/// between batch members.
#[must_use]
pub fn sync(batch: Vec<Transaction>, concurrency: usize) -> Vec<Transaction> {
    if batch.is_empty() {
        return batch;
    }
    let slots = concurrency.max(1).min(batch.len());
    let queue = Mutex::new(VecDeque::from(batch));
    let finished = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for _ in 0..slots {
            scope.spawn(|| {
                loop {
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some(mut transaction) = next else { break };
                    transaction.run();
                    finished
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(transaction);
                }
            });
        }
    });

    finished.into_inner().unwrap_or_else(PoisonError::into_inner)
}

/// Builds one transaction per target running the same remote command and
/// resolves the whole batch through [`sync`].
#[must_use]
pub fn many(
    targets: impl IntoIterator<Item = (usize, Vec<String>)>,
    command: &str,
    timeout: Duration,
    concurrency: usize,
) -> Vec<Transaction> {
    let batch = targets
        .into_iter()
        .map(|(worker, argv)| Transaction::new(worker, argv, command.to_owned(), timeout))
        .collect();
    sync(batch, concurrency)
}

fn truncate_output(text: &str) -> String {
    let mut out = String::with_capacity(OUTPUT_CHAR_LIMIT + TRUNCATION_SUFFIX.len());
    let mut chars = text.chars();
    for _ in 0..OUTPUT_CHAR_LIMIT {
        match chars.next() {
            Some(ch) => out.push(ch),
            None => return text.to_owned(),
        }
    }
    if chars.next().is_none() {
        return text.to_owned();
    }
    out.push_str(TRUNCATION_SUFFIX);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into()]
    }

    #[test]
    fn success_captures_stdout() {
        let mut tx = Transaction::new(0, shell(), "echo hello".into(), Duration::from_secs(5));
        tx.run();
        assert_eq!(tx.status(), TxStatus::Success);
        assert_eq!(tx.output(), "hello\n");
    }

    #[test]
    fn nonzero_exit_resolves_error() {
        let mut tx = Transaction::new(0, shell(), "exit 3".into(), Duration::from_secs(5));
        tx.run();
        assert_eq!(tx.status(), TxStatus::Error);
    }

    #[test]
    fn expired_deadline_kills_the_child_and_resolves_timeout() {
        let mut tx = Transaction::new(0, shell(), "sleep 30".into(), Duration::from_secs(1));
        let started = Instant::now();
        tx.run();
        assert_eq!(tx.status(), TxStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10), "child was not killed");
    }

    #[test]
    fn timeouts_consume_the_retry_budget() {
        let mut tx = Transaction::new(0, shell(), "sleep 30".into(), Duration::from_secs(1))
            .with_retries(1);
        tx.run();
        assert_eq!(tx.status(), TxStatus::Timeout);
        assert_eq!(tx.attempts(), 1);
    }

    #[test]
    fn a_custom_success_code_inverts_the_verdict() {
        let mut tx = Transaction::new(0, shell(), "exit 3".into(), Duration::from_secs(5))
            .with_success_code(3);
        tx.run();
        assert_eq!(tx.status(), TxStatus::Success);
        let mut tx = Transaction::new(0, shell(), "true".into(), Duration::from_secs(5))
            .with_success_code(3);
        tx.run();
        assert_eq!(tx.status(), TxStatus::Error);
    }

    #[test]
    fn unspawnable_transport_resolves_error() {
        let argv = vec!["/nonexistent/transport".to_string()];
        let mut tx = Transaction::new(0, argv, "true".into(), Duration::from_secs(5));
        tx.run();
        assert_eq!(tx.status(), TxStatus::Error);
    }

    #[test]
    fn stdout_redirection_writes_the_file_instead_of_capturing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("out")).expect("utf-8 path");
        let mut tx = Transaction::new(0, shell(), "echo routed".into(), Duration::from_secs(5))
            .with_stdout(path.clone());
        tx.run();
        assert_eq!(tx.status(), TxStatus::Success);
        assert!(tx.output().is_empty());
        assert_eq!(
            std::fs::read_to_string(path.as_std_path()).expect("read redirected stdout"),
            "routed\n"
        );
    }

    #[test]
    fn sync_bounds_in_flight_transactions() {
        let batch: Vec<Transaction> = (0..4)
            .map(|i| Transaction::new(i, shell(), "sleep 1".into(), Duration::from_secs(10)))
            .collect();
        let started = Instant::now();
        let finished = sync(batch, 2);
        let elapsed = started.elapsed();
        assert_eq!(finished.len(), 4);
        assert!(finished.iter().all(|tx| tx.status() == TxStatus::Success));
        // Two admission slots over four one-second sleeps needs two rounds.
        assert!(elapsed >= Duration::from_secs(2), "ran more than 2 in flight");
    }

    #[test]
    fn many_resolves_one_transaction_per_target() {
        let finished = many(
            (0..3).map(|i| (i, shell())),
            "echo fanout",
            Duration::from_secs(5),
            3,
        );
        assert_eq!(finished.len(), 3);
        let mut workers: Vec<usize> = finished.iter().map(Transaction::worker).collect();
        workers.sort_unstable();
        assert_eq!(workers, vec![0, 1, 2]);
        assert!(finished.iter().all(|tx| tx.output() == "fanout\n"));
    }

    #[test]
    fn truncation_caps_logged_streams() {
        let short = "a".repeat(10);
        assert_eq!(truncate_output(&short), short);
        let long = "b".repeat(OUTPUT_CHAR_LIMIT + 10);
        let truncated = truncate_output(&long);
        assert!(truncated.ends_with(TRUNCATION_SUFFIX));
        assert_eq!(
            truncated.chars().count(),
            OUTPUT_CHAR_LIMIT + TRUNCATION_SUFFIX.chars().count()
        );
    }
}
