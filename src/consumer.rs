//! Polling consumer
//!
//! One `poll` runs the cycle
//! `IDLE → SCANNING → CANDIDATE_LOCKING → DOWNLOADING → PROCESSING →
//! COMMITTING | ROLLING_BACK → IDLE` over the candidates of a single scan.
//! The remote session belongs to the consumer and is only touched from the
//! polling thread; with `threads > 1` only the PROCESSING stage fans out to a
//! rayon pool, each worker owning its downloaded payload.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Deserialize;
use std::any::Any;
use std::fmt;
use std::io::{self, Read};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::entry::{join_path, parent_of, ReadLockState, RemoteEntry};
use crate::error::{ConsumerError, ProcessingError, RemoteError};
use crate::exchange::{
    Body, DownloadedFile, ErrorChannel, FailureReport, FailureStage, FileHeaders, FileProcessor,
    LoggingErrorChannel, Payload,
};
use crate::expression::Expression;
use crate::idempotent::{
    IdempotentRepository, InProgressRepository, MemoryIdempotentRepository, DEFAULT_CACHE_SIZE,
};
use crate::logging::{debug_with_tag, log_with_tag};
use crate::protocols::RemoteFileOperations;
use crate::read_lock::{self, LockOutcome, NoneReadLock, ReadLockStrategy, ReadLockTiming};
use crate::scanner::{DirectoryScanner, ScanOptions};
use crate::scheduler::sleep_unless_shutdown;
use crate::shutdown::ShutdownFlag;

/// Upper bound on the buffer reserved from a listed size
const MAX_CAPACITY_HINT: u64 = 1 << 20;

/// Called with `(from, to)` on every state change
pub type TransitionListener = Arc<dyn Fn(ConsumerState, ConsumerState) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Scanning,
    CandidateLocking,
    Downloading,
    Processing,
    Committing,
    RollingBack,
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Idle => "IDLE",
            ConsumerState::Scanning => "SCANNING",
            ConsumerState::CandidateLocking => "CANDIDATE_LOCKING",
            ConsumerState::Downloading => "DOWNLOADING",
            ConsumerState::Processing => "PROCESSING",
            ConsumerState::Committing => "COMMITTING",
            ConsumerState::RollingBack => "ROLLING_BACK",
            ConsumerState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// What happens to a file after successful processing
#[derive(Debug, Clone)]
pub enum PostAction {
    Delete,
    /// Rename to the evaluated target (relative targets are under the
    /// starting directory)
    Move(Expression),
    Noop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadMode {
    /// Deliver an empty body
    Skip,
    /// Read the whole file into memory
    Buffered,
    /// Hand the open remote stream to the processor
    Streaming,
    /// Download into a temporary file in this directory
    LocalWorkDirectory(PathBuf),
}

/// Draining policy once shutdown is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownRunningTask {
    #[default]
    CompleteCurrentTaskOnly,
    CompleteAllTasks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Retries after the first failed attempt; 0 retries forever unless
    /// `throw_exception_on_connect_failed` is set
    pub maximum_attempts: u32,
    pub delay: Duration,
    pub throw_exception_on_connect_failed: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            maximum_attempts: 3,
            delay: Duration::from_millis(1000),
            throw_exception_on_connect_failed: false,
        }
    }
}

#[derive(Clone)]
pub struct ConsumerOptions {
    /// Endpoint name used as log tag
    pub name: String,
    pub scan: ScanOptions,
    pub read_lock: Arc<dyn ReadLockStrategy>,
    pub read_lock_timing: ReadLockTiming,
    pub post_action: PostAction,
    pub pre_move: Option<Expression>,
    pub move_failed: Option<Expression>,
    pub idempotent: bool,
    /// Defaults to the absolute path
    pub idempotent_key: Option<Expression>,
    pub idempotent_repository: Arc<dyn IdempotentRepository>,
    /// Shared between consumers polling the same files
    pub in_progress: Arc<InProgressRepository>,
    pub download: DownloadMode,
    pub charset: Option<String>,
    pub threads: usize,
    pub reconnect: ReconnectPolicy,
    /// Check the session with NOOP before every poll
    pub send_noop: bool,
    /// Create the starting directory after connecting
    pub auto_create: bool,
    pub disconnect: bool,
    pub disconnect_on_batch_complete: bool,
    pub send_empty_message_when_idle: bool,
    pub ignore_file_not_found_or_permission_error: bool,
    pub shutdown_running_task: ShutdownRunningTask,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            name: crate::PROGRAM_NAME.to_string(),
            scan: ScanOptions::default(),
            read_lock: Arc::new(NoneReadLock),
            read_lock_timing: ReadLockTiming::default(),
            post_action: PostAction::Delete,
            pre_move: None,
            move_failed: None,
            idempotent: false,
            idempotent_key: None,
            idempotent_repository: Arc::new(MemoryIdempotentRepository::new(DEFAULT_CACHE_SIZE)),
            in_progress: Arc::new(InProgressRepository::new()),
            download: DownloadMode::Buffered,
            charset: None,
            threads: 1,
            reconnect: ReconnectPolicy::default(),
            send_noop: true,
            auto_create: true,
            disconnect: false,
            disconnect_on_batch_complete: false,
            send_empty_message_when_idle: false,
            ignore_file_not_found_or_permission_error: false,
            shutdown_running_task: ShutdownRunningTask::default(),
        }
    }
}

impl fmt::Debug for ConsumerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerOptions")
            .field("name", &self.name)
            .field("scan", &self.scan)
            .field("read_lock", &self.read_lock.name())
            .field("read_lock_timing", &self.read_lock_timing)
            .field("post_action", &self.post_action)
            .field("idempotent", &self.idempotent)
            .field("download", &self.download)
            .field("threads", &self.threads)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

/// Outcome counters of one poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Candidates produced by the scan
    pub listed: usize,
    pub delivered: usize,
    pub failed: usize,
    pub duplicates: usize,
    /// Read lock answered not ready (vanished, claimed elsewhere)
    pub not_ready: usize,
    pub lock_timeouts: usize,
    /// Read locks whose release failed; a marker may be left behind
    pub unreleased_locks: usize,
    /// Missing or unreadable files skipped by
    /// `ignore_file_not_found_or_permission_error`
    pub skipped_missing: usize,
    /// Candidates left unprocessed because of shutdown or a lost connection
    pub abandoned: usize,
    pub limit_hit: bool,
    /// False when the poll was skipped because no session could be opened
    pub connected: bool,
}

impl PollReport {
    pub fn is_idle(&self) -> bool {
        self.listed == 0
    }

    /// Files that reached the processor
    pub fn processed(&self) -> usize {
        self.delivered + self.failed
    }
}

/// A candidate that holds its read lock
struct Claim {
    /// As listed (after lock refresh)
    original: RemoteEntry,
    /// Where the file is now, after an optional pre-move
    entry: RemoteEntry,
    lock: ReadLockState,
    key: Option<String>,
    headers: FileHeaders,
}

pub struct PollingConsumer<O: RemoteFileOperations> {
    ops: O,
    options: ConsumerOptions,
    scanner: DirectoryScanner,
    processor: Arc<dyn FileProcessor>,
    errors: Arc<dyn ErrorChannel>,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownFlag,
    pool: Option<rayon::ThreadPool>,
    state: ConsumerState,
    listener: Option<TransitionListener>,
}

impl<O: RemoteFileOperations> PollingConsumer<O> {
    pub fn new(
        ops: O,
        options: ConsumerOptions,
        processor: Arc<dyn FileProcessor>,
    ) -> Result<Self, ConsumerError> {
        let pool = if options.threads > 1 {
            let name = options.name.clone();
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(options.threads)
                    .thread_name(move |i| format!("{}-worker-{}", name, i))
                    .build()?,
            )
        } else {
            None
        };
        let errors: Arc<dyn ErrorChannel> = Arc::new(LoggingErrorChannel::new(&options.name));
        Ok(PollingConsumer {
            ops,
            scanner: DirectoryScanner::new(options.scan.clone()),
            options,
            processor,
            errors,
            clock: Arc::new(SystemClock),
            shutdown: ShutdownFlag::new(),
            pool,
            state: ConsumerState::Idle,
            listener: None,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_error_channel(mut self, errors: Arc<dyn ErrorChannel>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownFlag) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_transition_listener(mut self, listener: TransitionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.shutdown
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn operations(&self) -> &O {
        &self.ops
    }

    pub fn operations_mut(&mut self) -> &mut O {
        &mut self.ops
    }

    /// Closes the session and enters STOPPED
    pub fn stop(&mut self) {
        self.ops.disconnect();
        self.transition(ConsumerState::Stopped);
    }

    /// Runs one poll cycle
    ///
    /// Failures of single files are reported to the error channel and
    /// counted; the returned error is reserved for lost connections and
    /// fatal connect failures.
    pub fn poll(&mut self) -> Result<PollReport, ConsumerError> {
        let mut report = PollReport::default();
        if self.state == ConsumerState::Stopped {
            return Ok(report);
        }

        if !self.ensure_connected()? {
            return Ok(report);
        }
        report.connected = true;

        let result = self.poll_connected(&mut report);
        self.transition(ConsumerState::Idle);

        match result {
            Ok(()) => {
                if self.options.disconnect {
                    self.ops.disconnect();
                }
                self.log(&format!(
                    "Polled {} file(s): {} delivered, {} failed",
                    report.listed, report.delivered, report.failed
                ));
                Ok(report)
            }
            Err(e) => {
                if e.is_connection_error() {
                    self.log(&format!("Connection lost during poll: {}", e));
                    self.ops.disconnect();
                }
                Err(ConsumerError::Remote(e))
            }
        }
    }

    /// Opens the session if needed, following the reconnect policy
    ///
    /// `Ok(false)` skips this poll; `Err` is fatal.
    fn ensure_connected(&mut self) -> Result<bool, ConsumerError> {
        if self.ops.is_connected() {
            if !self.options.send_noop {
                return Ok(true);
            }
            match self.ops.send_noop() {
                Ok(true) => return Ok(true),
                Ok(false) => self.debug("Stale session, reconnecting"),
                Err(e) => self.debug(&format!("NOOP failed ({}), reconnecting", e)),
            }
            self.ops.disconnect();
        }

        let policy = self.options.reconnect;
        let mut retries: u32 = 0;
        loop {
            if self.shutdown.is_requested() {
                return Ok(false);
            }
            match self.ops.connect() {
                Ok(()) => {
                    if retries > 0 {
                        self.log(&format!("Reconnected to {} after {} retry(ies)", self.ops.endpoint(), retries));
                    }
                    if self.options.auto_create {
                        self.create_starting_directory()?;
                    }
                    return Ok(true);
                }
                Err(e) => {
                    self.ops.disconnect();
                    self.log(&format!(
                        "Cannot connect to {} (attempt {}): {}",
                        self.ops.endpoint(),
                        retries + 1,
                        e
                    ));
                    let exhausted = if policy.maximum_attempts == 0 {
                        policy.throw_exception_on_connect_failed
                    } else {
                        retries >= policy.maximum_attempts
                    };
                    if exhausted {
                        if policy.throw_exception_on_connect_failed {
                            return Err(ConsumerError::ConnectFailed {
                                endpoint: self.ops.endpoint(),
                                attempts: retries + 1,
                                source: e,
                            });
                        }
                        return Ok(false);
                    }
                    retries += 1;
                    if !sleep_unless_shutdown(&*self.clock, policy.delay, &self.shutdown) {
                        return Ok(false);
                    }
                }
            }
        }
    }

    fn create_starting_directory(&mut self) -> Result<(), ConsumerError> {
        let directory = self.options.scan.directory.clone();
        if directory == "/" || directory.is_empty() {
            return Ok(());
        }
        match self.ops.build_directory(&directory, true) {
            Ok(()) => Ok(()),
            Err(e) if e.is_connection_error() => {
                self.ops.disconnect();
                Err(ConsumerError::Remote(e))
            }
            Err(e) => {
                self.debug(&format!("Cannot create {}: {}", directory, e));
                Ok(())
            }
        }
    }

    fn poll_connected(&mut self, report: &mut PollReport) -> Result<(), RemoteError> {
        self.transition(ConsumerState::Scanning);
        let now = self.clock.now();

        let in_progress = Arc::clone(&self.options.in_progress);
        let mut claimed = scopeguard::guard(Vec::<String>::new(), move |keys| {
            for key in keys {
                in_progress.remove(&key);
            }
        });

        let scan = {
            let options = &self.options;
            let tag = options.name.as_str();
            self.scanner.scan(&mut self.ops, now, &mut |entry| {
                if options.idempotent
                    && options
                        .idempotent_repository
                        .contains(&idempotent_key(options, entry, now))
                {
                    debug_with_tag(&format!("{} already consumed, skipping", entry.absolute_path()), Some(tag));
                    return false;
                }
                let path = entry.absolute_path();
                if !options.in_progress.add(&path) {
                    debug_with_tag(&format!("{} is in progress, skipping", path), Some(tag));
                    return false;
                }
                claimed.push(path);
                true
            })?
        };
        report.listed = scan.candidates.len();
        report.limit_hit = scan.limit_hit;

        if scan.candidates.is_empty() {
            if self.options.send_empty_message_when_idle {
                let mut headers = FileHeaders::default();
                headers.endpoint = self.ops.endpoint();
                headers.consumed_at = Some(now);
                if let Err(e) = self.processor.on_idle(&headers) {
                    self.log(&format!("Idle notification failed: {}", e));
                }
            }
            return Ok(());
        }

        let result = if self.pool.is_some() && self.options.download != DownloadMode::Streaming {
            self.process_parallel(scan.candidates, report)
        } else {
            self.process_sequential(scan.candidates, report)
        };

        if self.options.disconnect_on_batch_complete {
            self.ops.disconnect();
        }
        drop(claimed);
        result
    }

    fn stop_requested(&self) -> bool {
        self.options.shutdown_running_task == ShutdownRunningTask::CompleteCurrentTaskOnly
            && self.shutdown.is_requested()
    }

    /// Read-lock waits stop on shutdown only when queued files may be dropped
    fn lock_shutdown(&self) -> ShutdownFlag {
        match self.options.shutdown_running_task {
            ShutdownRunningTask::CompleteCurrentTaskOnly => self.shutdown.clone(),
            ShutdownRunningTask::CompleteAllTasks => ShutdownFlag::new(),
        }
    }

    fn process_sequential(&mut self, candidates: Vec<RemoteEntry>, report: &mut PollReport) -> Result<(), RemoteError> {
        let total = candidates.len();
        for (index, entry) in candidates.into_iter().enumerate() {
            if self.stop_requested() {
                report.abandoned += total - index;
                self.log(&format!("Shutdown requested, leaving {} file(s) for later", total - index));
                break;
            }
            if let Err(e) = self.process_one(entry, index, total, report) {
                report.abandoned += total - index - 1;
                return Err(e);
            }
        }
        Ok(())
    }

    fn process_one(
        &mut self,
        entry: RemoteEntry,
        index: usize,
        total: usize,
        report: &mut PollReport,
    ) -> Result<(), RemoteError> {
        let claim = match self.claim(entry, index, total, report)? {
            Some(claim) => claim,
            None => return Ok(()),
        };

        self.transition(ConsumerState::Downloading);
        if self.options.download == DownloadMode::Streaming {
            let processor = Arc::clone(&self.processor);
            let charset = self.options.charset.clone();
            let entry = claim.entry.clone();
            let headers = claim.headers.clone();
            let mut outcome = None;
            let path = claim.entry.absolute_path();
            let state = &mut self.state;
            let tag = self.options.name.as_str();
            let listener = self.listener.as_ref();
            let retrieved = self.ops.retrieve_file(&path, &mut |reader: &mut dyn Read| -> io::Result<()> {
                advance(state, ConsumerState::Processing, tag, listener);
                let mut file = DownloadedFile::new(entry.clone(), headers.clone(), Body::Stream(reader));
                file.charset = charset.clone();
                outcome = Some(run_processor(&*processor, &mut file));
                Ok(())
            });
            return match (retrieved, outcome) {
                (Err(e), _) => self.download_failed(claim, e, report),
                (Ok(()), Some(result)) => self.finish(claim, result, report),
                (Ok(()), None) => self.finish(claim, Err(ProcessingError::new("no content delivered")), report),
            };
        }

        let payload = match self.download(&claim) {
            Ok(payload) => payload,
            Err(e) => return self.download_failed(claim, e, report),
        };
        self.transition(ConsumerState::Processing);
        let mut file = DownloadedFile::new(claim.entry.clone(), claim.headers.clone(), payload.into_body());
        file.charset = self.options.charset.clone();
        let result = run_processor(&*self.processor, &mut file);
        // releases a local work file before the remote commit
        drop(file);
        self.finish(claim, result, report)
    }

    fn process_parallel(&mut self, candidates: Vec<RemoteEntry>, report: &mut PollReport) -> Result<(), RemoteError> {
        let total = candidates.len();
        let chunk = self.options.threads.max(1);
        let mut pending = candidates.into_iter().enumerate().peekable();

        while pending.peek().is_some() {
            let mut batch: Vec<(Claim, Payload)> = Vec::new();
            let mut lost: Option<RemoteError> = None;

            for (index, entry) in pending.by_ref().take(chunk) {
                if self.stop_requested() || lost.is_some() {
                    report.abandoned += 1;
                    continue;
                }
                let claim = match self.claim(entry, index, total, report) {
                    Ok(Some(claim)) => claim,
                    Ok(None) => continue,
                    Err(e) => {
                        lost = Some(e);
                        continue;
                    }
                };
                self.transition(ConsumerState::Downloading);
                match self.download(&claim) {
                    Ok(payload) => batch.push((claim, payload)),
                    Err(e) => {
                        if let Err(e) = self.download_failed(claim, e, report) {
                            lost = Some(e);
                        }
                    }
                }
            }

            self.transition(ConsumerState::Processing);
            let processor = Arc::clone(&self.processor);
            let charset = self.options.charset.clone();
            let results: Vec<(Claim, Result<(), ProcessingError>)> = match &self.pool {
                Some(pool) => pool.install(|| {
                    batch
                        .into_par_iter()
                        .map(|(claim, payload)| {
                            let mut file =
                                DownloadedFile::new(claim.entry.clone(), claim.headers.clone(), payload.into_body());
                            file.charset = charset.clone();
                            let result = run_processor(&*processor, &mut file);
                            drop(file);
                            (claim, result)
                        })
                        .collect()
                }),
                None => Vec::new(),
            };

            for (claim, result) in results {
                if let Err(e) = self.finish(claim, result, report) {
                    lost.get_or_insert(e);
                }
            }
            if let Some(e) = lost {
                report.abandoned += pending.count();
                return Err(e);
            }
            if self.stop_requested() {
                let left = pending.count();
                if left > 0 {
                    report.abandoned += left;
                    self.log(&format!("Shutdown requested, leaving {} file(s) for later", left));
                }
                break;
            }
        }
        Ok(())
    }

    /// Lock, idempotent claim and pre-move; `None` skips the candidate
    fn claim(
        &mut self,
        entry: RemoteEntry,
        index: usize,
        total: usize,
        report: &mut PollReport,
    ) -> Result<Option<Claim>, RemoteError> {
        self.transition(ConsumerState::CandidateLocking);
        let lock_shutdown = self.lock_shutdown();
        let outcome = read_lock::acquire(
            &*self.options.read_lock,
            &mut self.ops,
            &*self.clock,
            &self.options.read_lock_timing,
            &lock_shutdown,
            &entry,
        );
        let lock = match outcome {
            Err(e) if e.is_connection_error() => return Err(e),
            Err(e) => {
                // the strategy already gave back whatever it held
                report.failed += 1;
                let mut headers = FileHeaders::for_entry(&entry, &self.ops.endpoint()).with_batch(index, total);
                headers.consumed_at = Some(self.clock.now());
                self.report_failure(headers, FailureStage::Lock, e.to_string());
                return Ok(None);
            }
            Ok(LockOutcome::Acquired(lock)) => lock,
            Ok(LockOutcome::NotReady) => {
                report.not_ready += 1;
                self.debug(&format!("{} not ready, skipping", entry.absolute_path()));
                return Ok(None);
            }
            Ok(LockOutcome::TimedOut) => {
                report.lock_timeouts += 1;
                self.log(&format!(
                    "Cannot acquire read lock on {} within {:?}, will retry on next poll",
                    entry.absolute_path(),
                    self.options.read_lock_timing.timeout
                ));
                return Ok(None);
            }
        };

        let now = self.clock.now();
        let current = lock.candidate.clone();
        let key = if self.options.idempotent {
            let key = idempotent_key(&self.options, &current, now);
            if !self.options.idempotent_repository.add(&key) {
                report.duplicates += 1;
                self.debug(&format!("Duplicate {} (key {}), skipping", current.absolute_path(), key));
                self.options.read_lock.abandon(&mut self.ops, &lock);
                return Ok(None);
            }
            Some(key)
        } else {
            None
        };

        let headers = |entry: &RemoteEntry, endpoint: &str| {
            let mut headers = FileHeaders::for_entry(entry, endpoint).with_batch(index, total);
            headers.consumed_at = Some(now);
            headers
        };
        let endpoint = self.ops.endpoint();
        let mut claim = Claim {
            original: current.clone(),
            entry: current.clone(),
            headers: headers(&current, &endpoint),
            lock,
            key,
        };

        if let Some(pre_move) = self.options.pre_move.clone() {
            let target = pre_move.evaluate_path(&current, now);
            if let Err(e) = self.move_file(&current.absolute_path(), &target) {
                self.rollback(claim, FailureStage::PreMove, e.to_string(), report)?;
                return if e.is_connection_error() { Err(e) } else { Ok(None) };
            }
            claim.entry = current.moved_to(&target);
            claim.headers = headers(&claim.entry, &endpoint);
        }
        Ok(Some(claim))
    }

    fn download(&mut self, claim: &Claim) -> Result<Payload, RemoteError> {
        let path = claim.entry.absolute_path();
        match &self.options.download {
            DownloadMode::Skip => Ok(Payload::Empty),
            DownloadMode::LocalWorkDirectory(directory) => {
                std::fs::create_dir_all(directory)?;
                let mut temp = tempfile::Builder::new()
                    .prefix(".ftpoll-")
                    .suffix(".inprogress")
                    .tempfile_in(directory)?;
                let file = temp.as_file_mut();
                self.ops
                    .retrieve_file(&path, &mut |reader: &mut dyn Read| io::copy(reader, &mut *file).map(|_| ()))?;
                Ok(Payload::File(temp))
            }
            DownloadMode::Buffered | DownloadMode::Streaming => {
                let mut buffer = Vec::with_capacity(capacity_hint(claim.entry.size()));
                self.ops
                    .retrieve_file(&path, &mut |reader: &mut dyn Read| reader.read_to_end(&mut buffer).map(|_| ()))?;
                Ok(Payload::Bytes(buffer))
            }
        }
    }

    fn download_failed(&mut self, claim: Claim, error: RemoteError, report: &mut PollReport) -> Result<(), RemoteError> {
        if self.options.ignore_file_not_found_or_permission_error
            && (error.is_not_found() || error.is_permission_denied())
        {
            report.skipped_missing += 1;
            self.debug(&format!("Cannot retrieve {} ({}), skipping", claim.entry.absolute_path(), error));
            self.release_unprocessed(claim, report);
            return Ok(());
        }
        let connection_lost = error.is_connection_error();
        let message = error.to_string();
        let rolled_back = if connection_lost {
            self.release_unprocessed_reported(claim, FailureStage::Download, message, report);
            Ok(())
        } else {
            self.rollback(claim, FailureStage::Download, message, report)
        };
        if connection_lost {
            return Err(error);
        }
        rolled_back
    }

    fn finish(
        &mut self,
        claim: Claim,
        result: Result<(), ProcessingError>,
        report: &mut PollReport,
    ) -> Result<(), RemoteError> {
        match result {
            Ok(()) => self.commit(claim, report),
            Err(e) => self.rollback(claim, FailureStage::Processing, e.to_string(), report),
        }
    }

    fn commit(&mut self, claim: Claim, report: &mut PollReport) -> Result<(), RemoteError> {
        self.transition(ConsumerState::Committing);
        if let Err(e) = self.apply_post_action(&claim) {
            self.release_lock(&claim, false, report);
            if let Some(key) = &claim.key {
                self.options.idempotent_repository.remove(key);
            }
            report.failed += 1;
            self.report_failure(claim.headers.clone(), FailureStage::Commit, e.to_string());
            return if e.is_connection_error() { Err(e) } else { Ok(()) };
        }

        // the post-action has happened; from here on the delivery stands
        if let Some(key) = &claim.key {
            self.options.idempotent_repository.confirm(key);
        }
        report.delivered += 1;
        self.log(&format!("Consumed {}", claim.original.absolute_path()));

        let mut lost = None;
        let done_file = match self.options.post_action {
            PostAction::Noop => Ok(()),
            _ => self.delete_done_file(&claim.original),
        };
        if let Err(e) = done_file {
            self.log(&format!(
                "Warning: cannot delete done file of {}: {}",
                claim.original.absolute_path(),
                e
            ));
            if e.is_connection_error() {
                lost = Some(e);
            }
        }
        if let Some(e) = self.release_lock(&claim, true, report) {
            lost.get_or_insert(e);
        }
        match lost {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Releases the read lock, logging and counting a failed release; returns
    /// the error only when the connection is gone
    fn release_lock(&mut self, claim: &Claim, committed: bool, report: &mut PollReport) -> Option<RemoteError> {
        let released = if committed {
            self.options.read_lock.release_on_commit(&mut self.ops, &claim.lock)
        } else {
            self.options.read_lock.release_on_rollback(&mut self.ops, &claim.lock)
        };
        match released {
            Ok(()) => None,
            Err(e) => {
                report.unreleased_locks += 1;
                self.log(&format!("Cannot release read lock on {}: {}", claim.original.absolute_path(), e));
                if e.is_connection_error() {
                    Some(e)
                } else {
                    None
                }
            }
        }
    }

    fn apply_post_action(&mut self, claim: &Claim) -> Result<(), RemoteError> {
        let path = claim.entry.absolute_path();
        match self.options.post_action.clone() {
            PostAction::Noop => return Ok(()),
            PostAction::Delete => {
                self.debug(&format!("Deleting {}", path));
                self.ops.delete_file(&path)?;
            }
            PostAction::Move(target) => {
                let target = target.evaluate_path(&claim.entry, self.clock.now());
                self.debug(&format!("Moving {} to {}", path, target));
                self.move_file(&path, &target)?;
            }
        }
        Ok(())
    }

    fn delete_done_file(&mut self, original: &RemoteEntry) -> Result<(), RemoteError> {
        let done_file = match &self.options.scan.done_file {
            Some(done_file) => done_file.done_file_for(original.file_name_only()),
            None => return Ok(()),
        };
        let path = join_path(&original.parent(), &done_file);
        match self.ops.delete_file(&path) {
            Ok(()) => {
                self.debug(&format!("Deleted done file {}", path));
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Renames `from` to `to`, creating the target directory and replacing an
    /// existing target
    fn move_file(&mut self, from: &str, to: &str) -> Result<(), RemoteError> {
        if from == to {
            return Ok(());
        }
        let parent = parent_of(to);
        if !parent.is_empty() && parent != "/" {
            self.ops.build_directory(parent, true)?;
        }
        match self.ops.delete_file(to) {
            Ok(()) => self.debug(&format!("Replaced existing {}", to)),
            Err(e) if e.is_connection_error() => return Err(e),
            Err(_) => {}
        }
        self.ops.rename_file(from, to)
    }

    /// ROLLING_BACK: file stays (or goes to `move_failed`), lock and key are
    /// released, the failure is reported once
    fn rollback(
        &mut self,
        claim: Claim,
        stage: FailureStage,
        message: String,
        report: &mut PollReport,
    ) -> Result<(), RemoteError> {
        self.transition(ConsumerState::RollingBack);
        let mut lost = None;

        if let Some(move_failed) = self.options.move_failed.clone() {
            let path = claim.entry.absolute_path();
            let target = move_failed.evaluate_path(&claim.entry, self.clock.now());
            if let Err(e) = self.move_file(&path, &target) {
                self.log(&format!("Cannot move failed file {} to {}: {}", path, target, e));
                if e.is_connection_error() {
                    lost = Some(e);
                }
            }
        }
        if let Some(e) = self.release_lock(&claim, false, report) {
            lost.get_or_insert(e);
        }
        if let Some(key) = &claim.key {
            self.options.idempotent_repository.remove(key);
        }
        report.failed += 1;
        self.report_failure(claim.headers.clone(), stage, message);

        match lost {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Gives the claim back without touching the remote file
    fn release_unprocessed(&mut self, claim: Claim, report: &mut PollReport) {
        self.release_lock(&claim, false, report);
        if let Some(key) = &claim.key {
            self.options.idempotent_repository.remove(key);
        }
    }

    fn release_unprocessed_reported(
        &mut self,
        claim: Claim,
        stage: FailureStage,
        message: String,
        report: &mut PollReport,
    ) {
        self.transition(ConsumerState::RollingBack);
        report.failed += 1;
        self.report_failure(claim.headers.clone(), stage, message);
        self.release_unprocessed(claim, report);
    }

    fn report_failure(&self, headers: FileHeaders, stage: FailureStage, message: String) {
        self.errors.report(&FailureReport {
            endpoint: self.ops.endpoint(),
            headers,
            stage,
            message,
        });
    }

    fn transition(&mut self, next: ConsumerState) {
        advance(&mut self.state, next, &self.options.name, self.listener.as_ref());
    }

    fn log(&self, message: &str) {
        let _ = log_with_tag(message, Some(&self.options.name));
    }

    fn debug(&self, message: &str) {
        debug_with_tag(message, Some(&self.options.name));
    }
}

impl<O: RemoteFileOperations> Drop for PollingConsumer<O> {
    fn drop(&mut self) {
        self.ops.disconnect();
    }
}

fn advance(state: &mut ConsumerState, next: ConsumerState, tag: &str, listener: Option<&TransitionListener>) {
    if *state != next {
        debug_with_tag(&format!("{} → {}", state, next), Some(tag));
        if let Some(listener) = listener {
            listener(*state, next);
        }
        *state = next;
    }
}

/// Preallocation for a buffered download; listed sizes are not trusted
fn capacity_hint(size: u64) -> usize {
    usize::try_from(size.min(MAX_CAPACITY_HINT)).unwrap_or(0)
}

fn idempotent_key(options: &ConsumerOptions, entry: &RemoteEntry, now: DateTime<Utc>) -> String {
    match &options.idempotent_key {
        Some(expression) => expression.evaluate(entry, now),
        None => entry.absolute_path(),
    }
}

/// Calls the processor; a panic becomes a processing failure
fn run_processor(processor: &dyn FileProcessor, file: &mut DownloadedFile<'_>) -> Result<(), ProcessingError> {
    match panic::catch_unwind(AssertUnwindSafe(|| processor.on_file_ready(file))) {
        Ok(result) => result,
        Err(payload) => Err(ProcessingError::new(format!(
            "processor panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
