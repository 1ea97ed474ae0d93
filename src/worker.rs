//! Per-machine state: identity, adaptive estimators, assignment, and the
//! error accounting that drives exclusion.

use std::time::{Duration, Instant};

use crate::block::Block;
use crate::error::ConfigResult;
use crate::machines::MachineConfig;
use crate::remote::RemoteScripts;

/// Lower clamp for every adaptive estimator, in seconds.
pub const MIN_ESTIMATE: u64 = 1;
/// Upper clamp for every adaptive estimator, in seconds.
pub const MAX_ESTIMATE: u64 = 300;

/// Weight of the newest sample in the moving average.
const ALPHA: f64 = 0.75;

/// Errors tolerated before a worker is excluded.
const ERROR_LIMIT: u32 = 5;

/// The four states a worker can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No assignment; may accept a block.
    Idle,
    /// A block is uploaded and its task is running.
    Running,
    /// The task finished; the fetch is pending.
    Done,
    /// Permanently quarantined after repeated errors.
    Excluded,
}

/// Exclusive state for one remote machine.
#[derive(Debug)]
pub struct Worker {
    hostname: String,
    username: Option<String>,
    connect_argv: Vec<String>,
    scripts: RemoteScripts,

    init_timeout: u64,
    upload_timeout: u64,
    download_timeout: u64,
    poll_timeout: u64,
    poll_interval: u64,
    upload_size: u64,
    download_size: u64,
    pending_download: Option<u64>,

    block: Option<Block>,
    start: u64,
    done: bool,
    polled: Option<Instant>,
    heartbeat: u64,
    completed: usize,
    errors: u32,
    excluded: bool,
}

impl Worker {
    /// Builds a worker from a resolved machines entry and the run key.
    pub fn new(config: MachineConfig, key: &str) -> ConfigResult<Self> {
        let scripts = RemoteScripts::new(&config.wd, key)?;
        let connect_argv = config.connect_argv()?;
        Ok(Self {
            hostname: config.hostname,
            username: config.username,
            connect_argv,
            scripts,
            init_timeout: clamp_estimate(config.init_timeout),
            upload_timeout: clamp_estimate(config.upload_timeout),
            download_timeout: clamp_estimate(config.download_timeout),
            poll_timeout: clamp_estimate(config.poll_timeout),
            poll_interval: clamp_estimate(config.poll_interval),
            upload_size: 0,
            download_size: 0,
            pending_download: None,
            block: None,
            start: 0,
            done: false,
            polled: None,
            heartbeat: 0,
            completed: 0,
            errors: 0,
            excluded: false,
        })
    }

    /// The worker's hostname as configured.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Blocks successfully completed and fetched from this worker.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Whether the worker has been permanently excluded.
    #[must_use]
    pub fn excluded(&self) -> bool {
        self.excluded
    }

    /// Error count since the last successful fetch.
    #[must_use]
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Current state derived from the record.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        if self.excluded {
            WorkerState::Excluded
        } else if self.block.is_none() {
            WorkerState::Idle
        } else if self.done {
            WorkerState::Done
        } else {
            WorkerState::Running
        }
    }

    /// Records an error and returns whether the worker is now excluded.
    ///
    /// Exclusion is sticky: past the error limit no further transactions are
    /// issued against this worker.
    pub(crate) fn record_error(&mut self) -> bool {
        self.errors += 1;
        if self.errors > ERROR_LIMIT {
            self.excluded = true;
        }
        self.excluded
    }

    /// Drops the worker from the fleet before or during dispatch.
    ///
    /// Used when the initialization phase fails; exclusion is as sticky as
    /// the error-driven kind.
    pub(crate) fn exclude(&mut self) {
        self.excluded = true;
    }

    /// Transport argv: the split `connect_cmd` followed by `user@host`.
    #[must_use]
    pub(crate) fn transport_argv(&self) -> Vec<String> {
        let mut argv = self.connect_argv.clone();
        argv.push(self.address());
        argv
    }

    fn address(&self) -> String {
        match &self.username {
            Some(user) => format!("{user}@{}", self.hostname),
            None => self.hostname.clone(),
        }
    }

    /// The wrapper-script builder for this worker's working directory.
    pub(crate) fn scripts(&self) -> &RemoteScripts {
        &self.scripts
    }

    pub(crate) fn block(&self) -> Option<&Block> {
        self.block.as_ref()
    }

    /// Releases the assignment, clearing the fetch-pending flag with it.
    pub(crate) fn take_block(&mut self) -> Option<Block> {
        self.done = false;
        self.block.take()
    }

    /// Records a successful START: the block is now running remotely.
    pub(crate) fn assign(&mut self, block: Block, start: u64, now: Instant) {
        self.block = Some(block);
        self.start = start;
        self.done = false;
        self.heartbeat = 0;
        self.polled = Some(now);
    }

    pub(crate) fn start_mtime(&self) -> u64 {
        self.start
    }

    pub(crate) fn heartbeat(&self) -> u64 {
        self.heartbeat
    }

    pub(crate) fn set_heartbeat(&mut self, heartbeat: u64) {
        self.heartbeat = heartbeat;
    }

    /// Marks the remote task finished; the next scan fetches immediately.
    /// The reported output size, when present, scales the fetch timeout.
    pub(crate) fn mark_done(&mut self, remote_size: Option<u64>) {
        self.done = true;
        self.pending_download = remote_size;
        self.polled = None;
    }

    /// Records a successful fetch: the round trip is complete and the error
    /// streak, if any, is forgiven.
    pub(crate) fn note_fetched(&mut self) {
        self.completed += 1;
        self.errors = 0;
        self.done = false;
        self.polled = None;
    }

    /// Whether the poll interval has elapsed since the last poll.
    pub(crate) fn poll_due(&self, now: Instant) -> bool {
        match self.polled {
            None => true,
            Some(polled) => polled + Duration::from_secs(self.poll_interval) <= now,
        }
    }

    pub(crate) fn note_polled(&mut self, now: Instant) {
        self.polled = Some(now);
    }

    /// Instant this worker next wants attention, for the inter-scan sleep.
    pub(crate) fn wake_at(&self, now: Instant) -> Instant {
        match self.polled {
            None => now,
            Some(polled) => polled + Duration::from_secs(self.poll_interval),
        }
    }

    /// Upload timeout scaled by the block's size relative to the last one.
    pub(crate) fn upload_timeout_for(&self, block_size: u64) -> Duration {
        Duration::from_secs(scale_estimate(
            self.upload_timeout,
            block_size,
            self.upload_size,
        ))
    }

    /// Download timeout scaled by the reported remote output size relative
    /// to the last fetched one.
    pub(crate) fn download_timeout_for(&self) -> Duration {
        let secs = match self.pending_download {
            Some(size) => scale_estimate(self.download_timeout, size, self.download_size),
            None => self.download_timeout,
        };
        Duration::from_secs(secs)
    }

    pub(crate) fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout)
    }

    pub(crate) fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout)
    }

    /// Folds a measured upload into the estimator and remembers the size.
    /// The size feeds the ratio that scales the next upload's timeout.
    pub(crate) fn note_upload(&mut self, elapsed_secs: u64, size: u64) {
        self.upload_timeout = wma(elapsed_secs, Some(self.upload_timeout));
        self.upload_size = size;
    }

    /// Folds a measured download into the estimator and remembers the size.
    pub(crate) fn note_download(&mut self, elapsed_secs: u64) {
        self.download_timeout = wma(elapsed_secs, Some(self.download_timeout));
        if let Some(size) = self.pending_download.take() {
            self.download_size = size;
        }
    }

    /// Folds a measured poll round trip into the estimator.
    pub(crate) fn note_poll_elapsed(&mut self, sample_secs: u64) {
        self.poll_timeout = wma(sample_secs, Some(self.poll_timeout));
    }

    /// Moves the poll interval toward the observed task duration.
    pub(crate) fn update_poll_interval(&mut self, sample_secs: u64) {
        self.poll_interval = wma(sample_secs, Some(self.poll_interval));
    }

    /// Exponential backoff after an upload timeout.
    pub(crate) fn back_off_upload(&mut self) {
        self.upload_timeout = clamp_estimate(self.upload_timeout.saturating_mul(2));
    }

    /// Exponential backoff after a download timeout.
    pub(crate) fn back_off_download(&mut self) {
        self.download_timeout = clamp_estimate(self.download_timeout.saturating_mul(2));
    }

    /// Exponential backoff after a poll timeout.
    pub(crate) fn back_off_poll(&mut self) {
        self.poll_timeout = clamp_estimate(self.poll_timeout.saturating_mul(2));
    }
}

/// Weighted moving average with weight `ALPHA` on the newest sample, floored
/// and clamped to `[MIN_ESTIMATE, MAX_ESTIMATE]`. Without a previous value
/// the clamped sample stands alone.
#[must_use]
pub fn wma(sample: u64, previous: Option<u64>) -> u64 {
    let Some(previous) = previous else {
        return clamp_estimate(sample);
    };
    let blended = ALPHA * sample as f64 + (1.0 - ALPHA) * previous as f64;
    clamp_estimate(blended.floor() as u64)
}

fn clamp_estimate(value: u64) -> u64 {
    value.clamp(MIN_ESTIMATE, MAX_ESTIMATE)
}

/// Scales a stored estimate by `size / previous_size`, clamped like every
/// estimator. An unknown previous size leaves the estimate untouched.
fn scale_estimate(estimate: u64, size: u64, previous_size: u64) -> u64 {
    if previous_size == 0 || size == 0 {
        return estimate;
    }
    let scaled = estimate as f64 * size as f64 / previous_size as f64;
    (scaled.floor() as u64).clamp(MIN_ESTIMATE, MAX_ESTIMATE)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::machines::MachineConfig;

    fn worker() -> Worker {
        let config = MachineConfig {
            hostname: "node1".into(),
            ..MachineConfig::default()
        };
        Worker::new(config, "deadbeef").expect("worker")
    }

    #[rstest]
    #[case(10, None, 10)]
    #[case(0, None, 1)]
    #[case(1000, None, 300)]
    #[case(10, Some(20), 12)] // floor(7.5 + 5)
    #[case(0, Some(20), 5)] // floor(0.25 * 20)
    #[case(0, Some(2), 1)] // clamped to the minimum
    #[case(400, Some(400), 300)] // clamped to the maximum
    fn wma_blends_floors_and_clamps(
        #[case] sample: u64,
        #[case] previous: Option<u64>,
        #[case] expected: u64,
    ) {
        assert_eq!(wma(sample, previous), expected);
    }

    #[test]
    fn sixth_error_excludes_and_exclusion_is_sticky() {
        let mut w = worker();
        for _ in 0..5 {
            assert!(!w.record_error(), "excluded before the sixth error");
        }
        assert!(w.record_error());
        assert!(w.excluded());
        assert_eq!(w.state(), WorkerState::Excluded);
        assert!(w.record_error(), "exclusion must be sticky");
    }

    #[test]
    fn successful_fetch_resets_the_error_counter() {
        let mut w = worker();
        for _ in 0..3 {
            w.record_error();
        }
        w.note_fetched();
        assert_eq!(w.errors(), 0);
        assert_eq!(w.completed(), 1);
    }

    #[test]
    fn state_follows_the_assignment_lifecycle() {
        let mut w = worker();
        assert_eq!(w.state(), WorkerState::Idle);
        let block = Block::new("in".into(), "file in".into());
        w.assign(block, 1_700_000_000, std::time::Instant::now());
        assert_eq!(w.state(), WorkerState::Running);
        w.mark_done(None);
        assert_eq!(w.state(), WorkerState::Done);
        let _ = w.take_block();
        assert_eq!(w.state(), WorkerState::Idle);
    }

    #[test]
    fn upload_timeout_scales_with_block_size() {
        let mut w = worker();
        w.note_upload(10, 1_000);
        let doubled = w.upload_timeout_for(2_000);
        let halved = w.upload_timeout_for(500);
        assert!(doubled > halved);
        assert!(doubled <= Duration::from_secs(MAX_ESTIMATE));
        assert!(halved >= Duration::from_secs(MIN_ESTIMATE));
    }

    #[test]
    fn backoff_doubles_and_saturates_at_the_clamp() {
        let mut w = worker();
        let before = w.poll_timeout().as_secs();
        w.back_off_poll();
        assert_eq!(w.poll_timeout().as_secs(), (before * 2).min(MAX_ESTIMATE));
        for _ in 0..16 {
            w.back_off_poll();
        }
        assert_eq!(w.poll_timeout().as_secs(), MAX_ESTIMATE);
    }

    #[test]
    fn address_includes_the_username_when_configured() {
        let config = MachineConfig {
            hostname: "node1".into(),
            username: Some("ops".into()),
            ..MachineConfig::default()
        };
        let w = Worker::new(config, "deadbeef").expect("worker");
        assert_eq!(
            w.transport_argv().last().map(String::as_str),
            Some("ops@node1")
        );
    }
}
