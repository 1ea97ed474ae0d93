//! The dispatcher: per-worker state machine, scan loop, post-handlers, and
//! the two distribution policies.
//!
//! Each scan decides at most one action per worker, runs the resulting batch
//! through the transaction executor, then applies the outcomes to the worker
//! records and the block source. Worker, source, and temp-registry state are
//! mutated only here, after `sync` returns; transaction threads share nothing
//! but the logging pipeline.

use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use clap::ValueEnum;
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::error::Result;
use crate::observability::{LOCAL_HOST, LOG_TARGET};
use crate::source::BlockSource;
use crate::transaction::{self, Purpose, Transaction, TxStatus};
use crate::worker::{Worker, WorkerState};
use crate::workspace::Workspace;

/// Upper bound on the inter-scan sleep.
const MAX_SCAN_SLEEP: Duration = Duration::from_secs(60);

/// How fresh blocks are spread over idle workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum DistributionMode {
    /// Any non-excluded idle worker may accept the next block; faster
    /// workers naturally pick up more.
    #[default]
    Performance,
    /// Each worker's share is bounded by `ceil(total / good workers)`,
    /// rebalancing as workers are excluded. Requires a countable source.
    Failover,
}

/// Dispatch-wide knobs collected off the command line.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Distribution policy for fresh blocks.
    pub mode: DistributionMode,
    /// Maximum transactions in flight at once.
    pub concurrency: usize,
    /// The user task: an opaque shell fragment run on each worker.
    pub task: String,
    /// Remote exit code counted as task success.
    pub task_success_code: i32,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            mode: DistributionMode::Performance,
            concurrency: 10,
            task: "cat -".into(),
            task_success_code: 0,
        }
    }
}

/// The single action a scan may take against one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Start,
    Check,
    Fetch,
    Wait,
}

/// Pure decision function: state plus poll clock plus policy admission.
fn decide(state: WorkerState, poll_due: bool, may_accept: bool) -> Action {
    match state {
        WorkerState::Excluded => Action::Wait,
        WorkerState::Done => Action::Fetch,
        WorkerState::Running => {
            if poll_due {
                Action::Check
            } else {
                Action::Wait
            }
        }
        WorkerState::Idle => {
            if may_accept {
                Action::Start
            } else {
                Action::Wait
            }
        }
    }
}

/// Per-worker share bound under the failover policy.
fn failover_target(total_blocks: usize, good_workers: usize) -> usize {
    total_blocks.div_ceil(good_workers.max(1))
}

/// Fields parsed from a CHECK transaction's one-line CSV output.
#[derive(Debug, PartialEq, Eq)]
struct CheckReport {
    heartbeat: u64,
    pid: String,
    exit_code: Option<i32>,
    size: Option<u64>,
}

/// Parses `mtime,pid[,exit_code[,size]]`, tolerating the optional fields'
/// absence. Returns `None` for anything else.
fn parse_check(output: &str) -> Option<CheckReport> {
    let line = output.lines().next()?.trim();
    let mut fields = line.split(',');
    let heartbeat = fields.next()?.trim().parse().ok()?;
    let pid = fields.next()?.trim();
    if pid.is_empty() {
        return None;
    }
    let exit_code = match fields.next() {
        Some(field) => Some(field.trim().parse().ok()?),
        None => None,
    };
    let size = match fields.next() {
        Some(field) => Some(field.trim().parse().ok()?),
        None => None,
    };
    Some(CheckReport {
        heartbeat,
        pid: pid.to_owned(),
        exit_code,
        size,
    })
}

/// Drives blocks from the source across the worker fleet until the source is
/// drained and every assignment has resolved.
pub struct Dispatcher {
    workers: Vec<Worker>,
    source: BlockSource,
    workspace: Workspace,
    options: DispatchOptions,
    total_blocks: Option<usize>,
}

impl Dispatcher {
    /// Builds a dispatcher over `workers`.
    ///
    /// The failover policy needs the source's exact block count up front and
    /// therefore fails here for sources that cannot provide one.
    pub fn new(
        workers: Vec<Worker>,
        source: BlockSource,
        workspace: Workspace,
        options: DispatchOptions,
    ) -> Result<Self> {
        let total_blocks = match options.mode {
            DistributionMode::Performance => None,
            DistributionMode::Failover => Some(source.total_blocks()?),
        };
        Ok(Self {
            workers,
            source,
            workspace,
            options,
            total_blocks,
        })
    }

    /// The worker fleet, for inspection after a run.
    #[must_use]
    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Broadcasts the optional init payloads to every worker, dropping any
    /// worker whose initialization does not succeed.
    pub fn initialize(
        &mut self,
        init_file: Option<&Utf8Path>,
        init_script: Option<&Utf8Path>,
    ) -> Result<()> {
        if let Some(path) = init_file {
            self.broadcast_init(path, false)?;
        }
        if let Some(path) = init_script {
            self.broadcast_init(path, true)?;
        }
        Ok(())
    }

    fn broadcast_init(&mut self, payload: &Utf8Path, executable: bool) -> Result<()> {
        let basename = payload.file_name().unwrap_or("init");
        let mut batch = Vec::new();
        for (index, worker) in self.workers.iter().enumerate() {
            if worker.excluded() {
                continue;
            }
            let command = if executable {
                worker.scripts().run_script(basename)?
            } else {
                worker.scripts().push_file(basename)?
            };
            batch.push(
                Transaction::new(
                    index,
                    worker.transport_argv(),
                    command,
                    worker.init_timeout(),
                )
                .with_stdin(payload.to_owned())
                .with_purpose(Purpose::Init),
            );
        }

        for tx in transaction::sync(batch, self.options.concurrency) {
            let worker = &mut self.workers[tx.worker()];
            if tx.status() == TxStatus::Success {
                debug!(
                    target: LOG_TARGET,
                    host = worker.hostname(),
                    payload = %payload,
                    "initialized worker"
                );
            } else {
                warn!(
                    target: LOG_TARGET,
                    host = worker.hostname(),
                    payload = %payload,
                    status = ?tx.status(),
                    stderr = %tx.stderr_excerpt(),
                    "initialization failed, dropping worker"
                );
                worker.exclude();
            }
        }
        Ok(())
    }

    /// Repeats scans until the source is drained and no worker holds a
    /// block, or until every worker has been excluded.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let any_assigned = self.workers.iter().any(|w| w.block().is_some());
            if !any_assigned && !self.source.has_more() {
                break;
            }
            if self.workers.iter().all(Worker::excluded) {
                warn!(
                    target: LOG_TARGET,
                    host = LOCAL_HOST,
                    "all workers excluded; abandoning the remaining blocks"
                );
                break;
            }

            let batch = self.plan_scan()?;
            if batch.is_empty() {
                self.sleep_until_wake();
                continue;
            }
            for tx in transaction::sync(batch, self.options.concurrency) {
                self.apply(tx)?;
            }
        }

        for worker in &self.workers {
            info!(
                target: LOG_TARGET,
                host = worker.hostname(),
                completed = worker.completed(),
                excluded = worker.excluded(),
                "worker summary"
            );
        }
        Ok(())
    }

    /// Issues the opt-in destructive CLEANUP wrapper on every surviving
    /// worker.
    pub fn cleanup_remote(&mut self) {
        let batch: Vec<Transaction> = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, worker)| !worker.excluded())
            .map(|(index, worker)| {
                Transaction::new(
                    index,
                    worker.transport_argv(),
                    worker.scripts().cleanup(),
                    worker.init_timeout(),
                )
                .with_purpose(Purpose::Cleanup)
            })
            .collect();
        for tx in transaction::sync(batch, self.options.concurrency) {
            if tx.status() != TxStatus::Success {
                warn!(
                    target: LOG_TARGET,
                    host = self.workers[tx.worker()].hostname(),
                    status = ?tx.status(),
                    "remote cleanup failed"
                );
            }
        }
    }

    /// Closes the source and sweeps outstanding temp files.
    pub fn finish(&mut self) {
        self.source.close();
        self.workspace.cleanup();
    }

    /// Computes this scan's batch: at most one transaction per worker.
    fn plan_scan(&mut self) -> Result<Vec<Transaction>> {
        let now = Instant::now();
        let mut batch = Vec::new();
        for index in 0..self.workers.len() {
            let worker = &self.workers[index];
            let action = decide(
                worker.state(),
                worker.poll_due(now),
                self.may_accept(index),
            );
            match action {
                Action::Wait => {}
                Action::Check => {
                    let worker = &self.workers[index];
                    batch.push(
                        Transaction::new(
                            index,
                            worker.transport_argv(),
                            worker.scripts().check(),
                            worker.poll_timeout(),
                        )
                        .with_purpose(Purpose::Check),
                    );
                }
                Action::Fetch => {
                    let out = self.workspace.temps().create_temp();
                    let err = self.workspace.temps().create_temp();
                    let worker = &self.workers[index];
                    batch.push(
                        Transaction::new(
                            index,
                            worker.transport_argv(),
                            worker.scripts().fetch(),
                            worker.download_timeout_for(),
                        )
                        .with_stdout(out.clone())
                        .with_stderr(err.clone())
                        .with_purpose(Purpose::Fetch { out, err }),
                    );
                }
                Action::Start => {
                    let Some(block) = self.source.next_block(self.workspace.temps())? else {
                        continue;
                    };
                    let size = block.size().unwrap_or(0);
                    let worker = &self.workers[index];
                    info!(
                        target: LOG_TARGET,
                        host = worker.hostname(),
                        block = block.description(),
                        "dispatching block"
                    );
                    batch.push(
                        Transaction::new(
                            index,
                            worker.transport_argv(),
                            worker.scripts().start(&self.options.task),
                            worker.upload_timeout_for(size),
                        )
                        .with_stdin(block.input().to_owned())
                        .with_purpose(Purpose::Start(block)),
                    );
                }
            }
        }
        Ok(batch)
    }

    /// Applies one resolved transaction to the worker and source state.
    fn apply(&mut self, tx: Transaction) -> Result<()> {
        let (index, status, output, elapsed, purpose) = tx.into_parts();
        match purpose {
            Purpose::Start(block) => self.start_post(index, status, &output, elapsed, block),
            Purpose::Check => self.check_post(index, status, &output, elapsed),
            Purpose::Fetch { out, err } => self.fetch_post(index, status, elapsed, &out, &err)?,
            Purpose::Init | Purpose::Cleanup => {}
        }
        Ok(())
    }

    fn start_post(
        &mut self,
        index: usize,
        status: TxStatus,
        output: &str,
        elapsed: Duration,
        block: Block,
    ) {
        let now = Instant::now();
        let worker = &mut self.workers[index];
        if status == TxStatus::Success {
            // A successful START must have printed the pid file's mtime;
            // anything else is treated as a failed upload.
            if let Some(start) = output.lines().next().and_then(|l| l.trim().parse::<u64>().ok()) {
                let size = block.size().unwrap_or(0);
                worker.note_upload(elapsed.as_secs(), size);
                worker.assign(block, start, now);
                return;
            }
            warn!(
                target: LOG_TARGET,
                host = worker.hostname(),
                output = %output.trim(),
                "START succeeded without a readable start stamp"
            );
        } else {
            warn!(
                target: LOG_TARGET,
                host = worker.hostname(),
                block = block.description(),
                status = ?status,
                "failed to start block"
            );
        }

        if status == TxStatus::Timeout {
            worker.back_off_upload();
        }
        let excluded = worker.record_error();
        if excluded {
            warn!(target: LOG_TARGET, host = worker.hostname(), "worker excluded");
        }
        self.source.retry(block);
    }

    fn check_post(&mut self, index: usize, status: TxStatus, output: &str, elapsed: Duration) {
        let now = Instant::now();
        if status == TxStatus::Success {
            let poll_sample = (elapsed.as_secs_f64() * 1.5).floor() as u64;
            let report = parse_check(output);
            let worker = &mut self.workers[index];
            worker.note_poll_elapsed(poll_sample);
            match report {
                Some(report) if report.pid == "Done" => {
                    if report.exit_code == Some(self.options.task_success_code) {
                        let task_secs = report.heartbeat.saturating_sub(worker.start_mtime());
                        // Aim the next poll cycle just past the expected
                        // completion of a similar block.
                        let sample = (task_secs as f64 * 1.1 / 4.0).floor() as u64;
                        worker.update_poll_interval(sample);
                        worker.mark_done(report.size);
                        debug!(
                            target: LOG_TARGET,
                            host = worker.hostname(),
                            exit_code = self.options.task_success_code,
                            "task finished; fetch pending"
                        );
                        return;
                    }
                    warn!(
                        target: LOG_TARGET,
                        host = worker.hostname(),
                        exit_code = ?report.exit_code,
                        "task finished with the wrong exit code"
                    );
                    let excluded = worker.record_error();
                    if let Some(block) = worker.take_block() {
                        self.source.retry(block);
                    }
                    if excluded {
                        warn!(target: LOG_TARGET, host = self.workers[index].hostname(), "worker excluded");
                    }
                    return;
                }
                Some(report) if report.heartbeat != worker.heartbeat() => {
                    worker.set_heartbeat(report.heartbeat);
                    worker.note_polled(now);
                    return;
                }
                Some(_) => {
                    warn!(
                        target: LOG_TARGET,
                        host = worker.hostname(),
                        "heartbeat unchanged; remote monitor looks dead"
                    );
                }
                None => {
                    warn!(
                        target: LOG_TARGET,
                        host = worker.hostname(),
                        output = %output.trim(),
                        "malformed CHECK output"
                    );
                }
            }
        } else {
            if status == TxStatus::Timeout {
                self.workers[index].back_off_poll();
            }
            warn!(
                target: LOG_TARGET,
                host = self.workers[index].hostname(),
                status = ?status,
                "CHECK failed"
            );
        }

        let worker = &mut self.workers[index];
        let excluded = worker.record_error();
        if excluded {
            warn!(target: LOG_TARGET, host = worker.hostname(), "worker excluded");
            if let Some(block) = worker.take_block() {
                self.source.retry(block);
            }
        } else {
            // The block stays assigned; try again after the next interval.
            worker.note_polled(now);
        }
    }

    fn fetch_post(
        &mut self,
        index: usize,
        status: TxStatus,
        elapsed: Duration,
        out: &Utf8Path,
        err: &Utf8Path,
    ) -> Result<()> {
        if status == TxStatus::Success {
            let worker = &mut self.workers[index];
            let hostname = worker.hostname().to_owned();
            let Some(block) = worker.take_block() else {
                // Nothing was assigned; nothing to write.
                self.workspace.temps().remove_temp(out);
                self.workspace.temps().remove_temp(err);
                return Ok(());
            };
            worker.note_download(elapsed.as_secs());
            worker.note_fetched();
            info!(
                target: LOG_TARGET,
                host = %hostname,
                block = block.description(),
                "block completed"
            );
            self.workspace.write(&hostname, &block, out, err)?;
            self.source.done(&block, self.workspace.temps());
            return Ok(());
        }

        let worker = &mut self.workers[index];
        if status == TxStatus::Timeout {
            worker.back_off_download();
        }
        warn!(
            target: LOG_TARGET,
            host = worker.hostname(),
            status = ?status,
            "fetch failed"
        );
        let excluded = worker.record_error();
        if excluded {
            warn!(target: LOG_TARGET, host = worker.hostname(), "worker excluded");
        }
        if let Some(block) = self.workers[index].take_block() {
            self.source.retry(block);
        }
        self.workspace.temps().remove_temp(out);
        self.workspace.temps().remove_temp(err);
        Ok(())
    }

    /// Whether the policy lets `index` accept a fresh block.
    fn may_accept(&self, index: usize) -> bool {
        match self.options.mode {
            DistributionMode::Performance => true,
            DistributionMode::Failover => {
                let good = self.workers.iter().filter(|w| !w.excluded()).count();
                let total = self.total_blocks.unwrap_or(0);
                self.workers[index].completed() < failover_target(total, good)
            }
        }
    }

    /// Sleeps until the earliest non-excluded worker wants attention,
    /// clamped to `[1s, 60s]`. Only reached when a scan issued nothing.
    fn sleep_until_wake(&self) {
        let now = Instant::now();
        let Some(wake) = self
            .workers
            .iter()
            .filter(|w| !w.excluded())
            .map(|w| w.wake_at(now))
            .min()
        else {
            return;
        };
        let sleep = wake
            .saturating_duration_since(now)
            .clamp(Duration::from_secs(1), MAX_SCAN_SLEEP);
        thread::sleep(sleep);
    }
}
