//! Read-lock strategies
//!
//! A read lock decides when a listed file is safe to download without racing
//! a writer. `acquire` drives a strategy: it re-checks every
//! `check_interval` until the strategy answers, the timeout expires or
//! shutdown is requested. Timeouts are not errors; the candidate is skipped
//! for this poll and offered again on the next one.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{elapsed, Clock};
use crate::entry::{file_name_of, parent_of, ReadLockState, RemoteEntry};
use crate::error::{ConfigError, RemoteError};
use crate::filter::{EXCLUSIVE_RENAME_POSTFIX, LOCK_FILE_POSTFIX};
use crate::idempotent::IdempotentRepository;
use crate::logging::debug;
use crate::protocols::RemoteFileOperations;
use crate::shutdown::ShutdownFlag;

/// Attempts to rename a file back after the `rename` strategy moved it away
const RESTORE_ATTEMPTS: u32 = 3;

/// Default time between checks
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(1000);
/// Default overall wait per candidate
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10000);

/// Answer of one strategy check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCheck {
    Ready,
    /// Give up on this candidate for the current poll
    NotReady,
    /// Check again after the given wait
    RetryLater(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLockTiming {
    pub check_interval: Duration,
    /// Zero waits forever
    pub timeout: Duration,
    /// Smallest size accepted by the changed strategy
    pub min_length: u64,
    /// Minimum time since last modification
    pub min_age: Duration,
}

impl Default for ReadLockTiming {
    fn default() -> Self {
        ReadLockTiming {
            check_interval: DEFAULT_CHECK_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            min_length: 1,
            min_age: Duration::ZERO,
        }
    }
}

pub struct LockContext<'a> {
    pub ops: &'a mut dyn RemoteFileOperations,
    pub clock: &'a dyn Clock,
    pub timing: &'a ReadLockTiming,
}

pub trait ReadLockStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, ctx: &mut LockContext<'_>, state: &mut ReadLockState) -> Result<LockCheck, RemoteError>;

    /// Called after the file was committed (post-action done)
    fn release_on_commit(
        &self,
        _ops: &mut dyn RemoteFileOperations,
        _state: &ReadLockState,
    ) -> Result<(), RemoteError> {
        Ok(())
    }

    /// Called after a failed delivery was rolled back
    fn release_on_rollback(
        &self,
        _ops: &mut dyn RemoteFileOperations,
        _state: &ReadLockState,
    ) -> Result<(), RemoteError> {
        Ok(())
    }

    /// Called when the lock was never acquired (timeout, not ready, shutdown)
    fn abandon(&self, _ops: &mut dyn RemoteFileOperations, _state: &ReadLockState) {}
}

#[derive(Debug)]
pub enum LockOutcome {
    Acquired(ReadLockState),
    NotReady,
    TimedOut,
}

/// Runs `strategy` against `candidate` until it settles
pub fn acquire(
    strategy: &dyn ReadLockStrategy,
    ops: &mut dyn RemoteFileOperations,
    clock: &dyn Clock,
    timing: &ReadLockTiming,
    shutdown: &ShutdownFlag,
    candidate: &RemoteEntry,
) -> Result<LockOutcome, RemoteError> {
    let started = clock.now();
    let mut state = ReadLockState::new(candidate.clone(), started);

    loop {
        if shutdown.is_requested() {
            strategy.abandon(ops, &state);
            return Ok(LockOutcome::NotReady);
        }
        if !timing.timeout.is_zero() && elapsed(clock.now(), started) > timing.timeout {
            debug(&format!(
                "Read lock '{}' timed out after {:?} on {}",
                strategy.name(),
                timing.timeout,
                candidate.absolute_path()
            ));
            strategy.abandon(ops, &state);
            return Ok(LockOutcome::TimedOut);
        }

        let answer = {
            let mut ctx = LockContext {
                ops: &mut *ops,
                clock,
                timing,
            };
            strategy.check(&mut ctx, &mut state)
        };
        match answer {
            Ok(LockCheck::Ready) => return Ok(LockOutcome::Acquired(state)),
            Ok(LockCheck::NotReady) => {
                strategy.abandon(ops, &state);
                return Ok(LockOutcome::NotReady);
            }
            Ok(LockCheck::RetryLater(wait)) => clock.sleep(wait),
            Err(e) => {
                if !e.is_connection_error() {
                    strategy.abandon(ops, &state);
                }
                return Err(e);
            }
        }
    }
}

/// No protection: every candidate is ready at once
#[derive(Debug, Default)]
pub struct NoneReadLock;

impl ReadLockStrategy for NoneReadLock {
    fn name(&self) -> &str {
        "none"
    }

    fn check(&self, _ctx: &mut LockContext<'_>, _state: &mut ReadLockState) -> Result<LockCheck, RemoteError> {
        Ok(LockCheck::Ready)
    }
}

/// Tests exclusivity by renaming the file away and back
#[derive(Debug, Default)]
pub struct RenameReadLock;

impl ReadLockStrategy for RenameReadLock {
    fn name(&self) -> &str {
        "rename"
    }

    fn check(&self, ctx: &mut LockContext<'_>, state: &mut ReadLockState) -> Result<LockCheck, RemoteError> {
        let path = state.candidate.absolute_path();
        let renamed = format!("{}{}", path, EXCLUSIVE_RENAME_POSTFIX);
        state.check_count += 1;

        match ctx.ops.rename_file(&path, &renamed) {
            Ok(()) => {}
            Err(e) if e.is_connection_error() => return Err(e),
            Err(e) => {
                debug(&format!("Cannot rename {} for exclusive read: {}", path, e));
                return Ok(LockCheck::NotReady);
            }
        }
        restore(&mut *ctx.ops, &renamed, &path)?;
        Ok(LockCheck::Ready)
    }
}

/// Renames `renamed` back to `path`, retrying operation failures
fn restore(ops: &mut dyn RemoteFileOperations, renamed: &str, path: &str) -> Result<(), RemoteError> {
    let mut attempt = 1;
    loop {
        match ops.rename_file(renamed, path) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_connection_error() || attempt >= RESTORE_ATTEMPTS => return Err(e),
            Err(e) => {
                debug(&format!("Cannot rename {} back (attempt {}): {}", renamed, attempt, e));
                attempt += 1;
            }
        }
    }
}

/// Waits until size and modification time stop changing
#[derive(Debug, Default)]
pub struct ChangedReadLock;

impl ReadLockStrategy for ChangedReadLock {
    fn name(&self) -> &str {
        "changed"
    }

    fn check(&self, ctx: &mut LockContext<'_>, state: &mut ReadLockState) -> Result<LockCheck, RemoteError> {
        let path = state.candidate.absolute_path();
        let name = file_name_of(&path).to_string();
        let listing = match ctx.ops.list_files(parent_of(&path)) {
            Ok(listing) => listing,
            Err(e) if e.is_not_found() => return Ok(LockCheck::NotReady),
            Err(e) => return Err(e),
        };
        let current = match listing
            .into_iter()
            .find(|e| !e.is_directory() && e.file_name_only() == name)
        {
            Some(current) => current,
            None => {
                debug(&format!("{} vanished while waiting for read lock", path));
                return Ok(LockCheck::NotReady);
            }
        };

        let now = ctx.clock.now();
        let timing = ctx.timing;
        let stable_for = state.observe(current.size(), current.last_modified(), now);
        state.candidate = state
            .candidate
            .clone()
            .with_stat(current.size(), current.last_modified());

        if current.size() < timing.min_length {
            return Ok(LockCheck::RetryLater(timing.check_interval));
        }

        let stable = stable_for.map_or(false, |d| d >= timing.check_interval);
        let ready = match current.age(now) {
            Some(age) if !timing.min_age.is_zero() => {
                age >= timing.min_age && (stable || age >= timing.check_interval)
            }
            _ => stable,
        };
        if ready {
            Ok(LockCheck::Ready)
        } else {
            Ok(LockCheck::RetryLater(timing.check_interval))
        }
    }
}

/// Claims the file through an idempotent repository (cluster-wide in-flight
/// lock), optionally combined with another strategy
pub struct IdempotentReadLock {
    name: String,
    repository: Arc<dyn IdempotentRepository>,
    inner: Option<Box<dyn ReadLockStrategy>>,
    remove_on_commit: bool,
    remove_on_rollback: bool,
}

impl IdempotentReadLock {
    pub fn new(
        repository: Arc<dyn IdempotentRepository>,
        inner: Option<Box<dyn ReadLockStrategy>>,
    ) -> Self {
        let name = match &inner {
            Some(inner) => format!("idempotent-{}", inner.name()),
            None => "idempotent".to_string(),
        };
        IdempotentReadLock {
            name,
            repository,
            inner,
            remove_on_commit: false,
            remove_on_rollback: true,
        }
    }

    pub fn remove_on_commit(mut self, remove: bool) -> Self {
        self.remove_on_commit = remove;
        self
    }

    pub fn remove_on_rollback(mut self, remove: bool) -> Self {
        self.remove_on_rollback = remove;
        self
    }

    pub fn key(entry: &RemoteEntry) -> String {
        format!("readLock:{}", entry.absolute_path())
    }

    fn settle(&self, key: &str, remove: bool) {
        if remove {
            self.repository.remove(key);
        } else {
            self.repository.confirm(key);
        }
    }
}

impl ReadLockStrategy for IdempotentReadLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, ctx: &mut LockContext<'_>, state: &mut ReadLockState) -> Result<LockCheck, RemoteError> {
        if !state.claimed {
            if !self.repository.add(&Self::key(&state.candidate)) {
                debug(&format!(
                    "{} is already claimed by another consumer",
                    state.candidate.absolute_path()
                ));
                return Ok(LockCheck::NotReady);
            }
            state.claimed = true;
        }
        match &self.inner {
            Some(inner) => inner.check(ctx, state),
            None => Ok(LockCheck::Ready),
        }
    }

    fn release_on_commit(&self, ops: &mut dyn RemoteFileOperations, state: &ReadLockState) -> Result<(), RemoteError> {
        let result = match &self.inner {
            Some(inner) => inner.release_on_commit(ops, state),
            None => Ok(()),
        };
        self.settle(&Self::key(&state.candidate), self.remove_on_commit);
        result
    }

    fn release_on_rollback(&self, ops: &mut dyn RemoteFileOperations, state: &ReadLockState) -> Result<(), RemoteError> {
        let result = match &self.inner {
            Some(inner) => inner.release_on_rollback(ops, state),
            None => Ok(()),
        };
        self.settle(&Self::key(&state.candidate), self.remove_on_rollback);
        result
    }

    fn abandon(&self, ops: &mut dyn RemoteFileOperations, state: &ReadLockState) {
        if let Some(inner) = &self.inner {
            inner.abandon(ops, state);
        }
        if state.claimed {
            self.repository.remove(&Self::key(&state.candidate));
        }
    }
}

/// Writes a `<name>.ftpollLock` marker next to the file while it is handled
pub struct ExclusiveReadLock {
    name: String,
    inner: Option<Box<dyn ReadLockStrategy>>,
}

impl ExclusiveReadLock {
    pub fn new(inner: Option<Box<dyn ReadLockStrategy>>) -> Self {
        let name = match &inner {
            Some(inner) => format!("exclusive-{}", inner.name()),
            None => "exclusive".to_string(),
        };
        ExclusiveReadLock { name, inner }
    }

    pub fn marker(entry: &RemoteEntry) -> String {
        format!("{}{}", entry.absolute_path(), LOCK_FILE_POSTFIX)
    }

    fn delete_marker(&self, ops: &mut dyn RemoteFileOperations, state: &ReadLockState) -> Result<(), RemoteError> {
        if !state.claimed {
            return Ok(());
        }
        match ops.delete_file(&Self::marker(&state.candidate)) {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

impl ReadLockStrategy for ExclusiveReadLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, ctx: &mut LockContext<'_>, state: &mut ReadLockState) -> Result<LockCheck, RemoteError> {
        if !state.claimed {
            let marker = Self::marker(&state.candidate);
            if ctx.ops.exists_file(&marker)? {
                debug(&format!("{} is locked by marker {}", state.candidate.absolute_path(), marker));
                return Ok(LockCheck::NotReady);
            }
            ctx.ops.store_file(&marker, &mut std::io::empty())?;
            state.claimed = true;
        }
        match &self.inner {
            Some(inner) => inner.check(ctx, state),
            None => Ok(LockCheck::Ready),
        }
    }

    fn release_on_commit(&self, ops: &mut dyn RemoteFileOperations, state: &ReadLockState) -> Result<(), RemoteError> {
        if let Some(inner) = &self.inner {
            inner.release_on_commit(ops, state)?;
        }
        self.delete_marker(ops, state)
    }

    fn release_on_rollback(&self, ops: &mut dyn RemoteFileOperations, state: &ReadLockState) -> Result<(), RemoteError> {
        if let Some(inner) = &self.inner {
            inner.release_on_rollback(ops, state)?;
        }
        self.delete_marker(ops, state)
    }

    fn abandon(&self, ops: &mut dyn RemoteFileOperations, state: &ReadLockState) {
        if let Some(inner) = &self.inner {
            inner.abandon(ops, state);
        }
        let _ = self.delete_marker(ops, state);
    }
}

/// Strategy selected by the `read_lock` option
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadLockKind {
    None,
    Rename,
    Changed,
    Idempotent,
    IdempotentChanged,
    IdempotentRename,
    Exclusive,
    ExclusiveChanged,
    ExclusiveRename,
    /// Strategy registered under this name in a `ReadLockRegistry`
    Named(String),
}

impl Default for ReadLockKind {
    fn default() -> Self {
        ReadLockKind::None
    }
}

impl FromStr for ReadLockKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim() {
            "" => return Err(ConfigError::invalid("empty read lock name")),
            "none" => ReadLockKind::None,
            "rename" => ReadLockKind::Rename,
            "changed" => ReadLockKind::Changed,
            "idempotent" => ReadLockKind::Idempotent,
            "idempotent-changed" => ReadLockKind::IdempotentChanged,
            "idempotent-rename" => ReadLockKind::IdempotentRename,
            "exclusive" => ReadLockKind::Exclusive,
            "exclusive-changed" => ReadLockKind::ExclusiveChanged,
            "exclusive-rename" => ReadLockKind::ExclusiveRename,
            other => ReadLockKind::Named(other.to_string()),
        };
        Ok(kind)
    }
}

impl fmt::Display for ReadLockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadLockKind::None => "none",
            ReadLockKind::Rename => "rename",
            ReadLockKind::Changed => "changed",
            ReadLockKind::Idempotent => "idempotent",
            ReadLockKind::IdempotentChanged => "idempotent-changed",
            ReadLockKind::IdempotentRename => "idempotent-rename",
            ReadLockKind::Exclusive => "exclusive",
            ReadLockKind::ExclusiveChanged => "exclusive-changed",
            ReadLockKind::ExclusiveRename => "exclusive-rename",
            ReadLockKind::Named(name) => name,
        };
        f.write_str(name)
    }
}

/// Options only the idempotent variants read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotentLockOptions {
    pub remove_on_commit: bool,
    pub remove_on_rollback: bool,
}

impl Default for IdempotentLockOptions {
    fn default() -> Self {
        IdempotentLockOptions {
            remove_on_commit: false,
            remove_on_rollback: true,
        }
    }
}

impl ReadLockKind {
    /// Instantiates the strategy
    ///
    /// `repository` backs the idempotent variants; named strategies come from
    /// `registry`.
    pub fn build(
        &self,
        repository: Arc<dyn IdempotentRepository>,
        options: IdempotentLockOptions,
        registry: &ReadLockRegistry,
    ) -> Result<Arc<dyn ReadLockStrategy>, ConfigError> {
        let idempotent = |inner: Option<Box<dyn ReadLockStrategy>>| {
            IdempotentReadLock::new(Arc::clone(&repository), inner)
                .remove_on_commit(options.remove_on_commit)
                .remove_on_rollback(options.remove_on_rollback)
        };
        let strategy: Arc<dyn ReadLockStrategy> = match self {
            ReadLockKind::None => Arc::new(NoneReadLock),
            ReadLockKind::Rename => Arc::new(RenameReadLock),
            ReadLockKind::Changed => Arc::new(ChangedReadLock),
            ReadLockKind::Idempotent => Arc::new(idempotent(None)),
            ReadLockKind::IdempotentChanged => Arc::new(idempotent(Some(Box::new(ChangedReadLock)))),
            ReadLockKind::IdempotentRename => Arc::new(idempotent(Some(Box::new(RenameReadLock)))),
            ReadLockKind::Exclusive => Arc::new(ExclusiveReadLock::new(None)),
            ReadLockKind::ExclusiveChanged => {
                Arc::new(ExclusiveReadLock::new(Some(Box::new(ChangedReadLock))))
            }
            ReadLockKind::ExclusiveRename => {
                Arc::new(ExclusiveReadLock::new(Some(Box::new(RenameReadLock))))
            }
            ReadLockKind::Named(name) => registry
                .get(name)
                .ok_or_else(|| ConfigError::invalid(format!("unknown read lock '{}'", name)))?,
        };
        Ok(strategy)
    }
}

/// Named custom strategies, resolvable from configuration
#[derive(Default, Clone)]
pub struct ReadLockRegistry {
    strategies: HashMap<String, Arc<dyn ReadLockStrategy>>,
}

impl ReadLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, strategy: Arc<dyn ReadLockStrategy>) {
        self.strategies.insert(name.to_string(), strategy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ReadLockStrategy>> {
        self.strategies.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::idempotent::MemoryIdempotentRepository;
    use crate::protocols::{MemoryClient, MemoryServer};
    use chrono::{TimeZone, Utc};

    fn setup() -> (ManualClock, MemoryServer, MemoryClient) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap());
        let server = MemoryServer::with_clock("locks", Arc::new(clock.clone()));
        let mut client = server.client();
        client.connect().unwrap();
        (clock, server, client)
    }

    fn candidate(client: &mut MemoryClient, name: &str) -> RemoteEntry {
        client
            .list_files("/inbox")
            .unwrap()
            .into_iter()
            .find(|e| e.file_name_only() == name)
            .unwrap()
    }

    fn timing() -> ReadLockTiming {
        ReadLockTiming {
            check_interval: Duration::from_millis(1000),
            timeout: Duration::from_millis(10000),
            min_length: 1,
            min_age: Duration::ZERO,
        }
    }

    #[test]
    fn test_none_is_immediately_ready() {
        let (clock, server, mut client) = setup();
        server.put("/inbox/a.txt", "a");
        let entry = candidate(&mut client, "a.txt");
        let outcome = acquire(&NoneReadLock, &mut client, &clock, &timing(), &ShutdownFlag::new(), &entry).unwrap();
        assert!(matches!(outcome, LockOutcome::Acquired(_)));
    }

    #[test]
    fn test_changed_needs_one_stable_interval() {
        let (clock, server, mut client) = setup();
        server.put("/inbox/a.txt", "hello");
        let entry = candidate(&mut client, "a.txt");
        let start = clock.now();

        let outcome = acquire(&ChangedReadLock, &mut client, &clock, &timing(), &ShutdownFlag::new(), &entry).unwrap();
        match outcome {
            LockOutcome::Acquired(state) => assert_eq!(state.check_count, 2),
            other => panic!("expected lock, got {:?}", other),
        }
        assert_eq!(clock.now() - start, chrono::Duration::milliseconds(1000));
    }

    /// Writer appending every check interval
    struct GrowingFile {
        server: MemoryServer,
        writes_left: std::sync::Mutex<u32>,
    }

    impl ReadLockStrategy for GrowingFile {
        fn name(&self) -> &str {
            "growing"
        }

        fn check(&self, ctx: &mut LockContext<'_>, state: &mut ReadLockState) -> Result<LockCheck, RemoteError> {
            let answer = ChangedReadLock.check(ctx, state)?;
            let mut left = self.writes_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                self.server.append("/inbox/a.txt", "more");
            }
            Ok(answer)
        }
    }

    #[test]
    fn test_changed_waits_while_file_grows() {
        let (clock, server, mut client) = setup();
        server.put("/inbox/a.txt", "start");
        let entry = candidate(&mut client, "a.txt");
        let start = clock.now();
        let growing = GrowingFile {
            server: server.clone(),
            writes_left: std::sync::Mutex::new(4),
        };

        let outcome = acquire(&growing, &mut client, &clock, &timing(), &ShutdownFlag::new(), &entry).unwrap();
        let state = match outcome {
            LockOutcome::Acquired(state) => state,
            other => panic!("expected lock, got {:?}", other),
        };
        // four writes one interval apart, then one quiet interval
        assert_eq!(clock.now() - start, chrono::Duration::milliseconds(5000));
        assert_eq!(state.candidate.size(), 5 + 4 * 4);
    }

    #[test]
    fn test_changed_times_out_on_endless_writer() {
        let (clock, server, mut client) = setup();
        server.put("/inbox/a.txt", "start");
        let entry = candidate(&mut client, "a.txt");
        let growing = GrowingFile {
            server: server.clone(),
            writes_left: std::sync::Mutex::new(u32::MAX),
        };
        let outcome = acquire(&growing, &mut client, &clock, &timing(), &ShutdownFlag::new(), &entry).unwrap();
        assert!(matches!(outcome, LockOutcome::TimedOut));
    }

    #[test]
    fn test_changed_min_age() {
        let (clock, server, mut client) = setup();
        let modified = clock.now() - chrono::Duration::seconds(30);
        server.put_with_mtime("/inbox/old.txt", "x", modified);
        server.put("/inbox/new.txt", "x");
        let timing = ReadLockTiming {
            min_age: Duration::from_secs(5),
            ..timing()
        };

        let start = clock.now();
        let old = candidate(&mut client, "old.txt");
        let outcome = acquire(&ChangedReadLock, &mut client, &clock, &timing, &ShutdownFlag::new(), &old).unwrap();
        assert!(matches!(outcome, LockOutcome::Acquired(_)));
        assert_eq!(clock.now(), start);

        let new = candidate(&mut client, "new.txt");
        let outcome = acquire(&ChangedReadLock, &mut client, &clock, &timing, &ShutdownFlag::new(), &new).unwrap();
        assert!(matches!(outcome, LockOutcome::Acquired(_)));
        assert!(clock.now() - start >= chrono::Duration::seconds(5));
    }

    #[test]
    fn test_changed_min_length_and_vanished_file() {
        let (clock, server, mut client) = setup();
        server.put("/inbox/empty.txt", "");
        let entry = candidate(&mut client, "empty.txt");
        let outcome = acquire(&ChangedReadLock, &mut client, &clock, &timing(), &ShutdownFlag::new(), &entry).unwrap();
        assert!(matches!(outcome, LockOutcome::TimedOut));

        let zero_ok = ReadLockTiming {
            min_length: 0,
            ..timing()
        };
        let outcome = acquire(&ChangedReadLock, &mut client, &clock, &zero_ok, &ShutdownFlag::new(), &entry).unwrap();
        assert!(matches!(outcome, LockOutcome::Acquired(_)));

        server.remove("/inbox/empty.txt");
        let outcome = acquire(&ChangedReadLock, &mut client, &clock, &zero_ok, &ShutdownFlag::new(), &entry).unwrap();
        assert!(matches!(outcome, LockOutcome::NotReady));
    }

    #[test]
    fn test_rename_lock_leaves_file_in_place() {
        let (clock, server, mut client) = setup();
        server.put("/inbox/a.txt", "a");
        let entry = candidate(&mut client, "a.txt");
        let outcome = acquire(&RenameReadLock, &mut client, &clock, &timing(), &ShutdownFlag::new(), &entry).unwrap();
        assert!(matches!(outcome, LockOutcome::Acquired(_)));
        assert_eq!(server.files(), vec!["/inbox/a.txt".to_string()]);

        server.remove("/inbox/a.txt");
        let outcome = acquire(&RenameReadLock, &mut client, &clock, &timing(), &ShutdownFlag::new(), &entry).unwrap();
        assert!(matches!(outcome, LockOutcome::NotReady));
    }

    #[test]
    fn test_rename_lock_retries_renaming_back() {
        let (clock, server, mut client) = setup();
        server.put("/inbox/a.txt", "a");
        let entry = candidate(&mut client, "a.txt");

        server.fail_rename("/inbox/a.txt.ftpollExclusiveReadLock", 2);
        let outcome = acquire(&RenameReadLock, &mut client, &clock, &timing(), &ShutdownFlag::new(), &entry).unwrap();
        assert!(matches!(outcome, LockOutcome::Acquired(_)));
        assert_eq!(server.files(), vec!["/inbox/a.txt".to_string()]);

        server.fail_rename("/inbox/a.txt.ftpollExclusiveReadLock", RESTORE_ATTEMPTS);
        let err = acquire(&RenameReadLock, &mut client, &clock, &timing(), &ShutdownFlag::new(), &entry).unwrap_err();
        assert!(!err.is_connection_error());
        assert_eq!(server.files(), vec!["/inbox/a.txt.ftpollExclusiveReadLock".to_string()]);
    }

    #[test]
    fn test_idempotent_lock_claims_once() {
        let (clock, server, mut client) = setup();
        server.put("/inbox/a.txt", "a");
        let entry = candidate(&mut client, "a.txt");
        let repo: Arc<dyn IdempotentRepository> = Arc::new(MemoryIdempotentRepository::new(100));
        let lock = IdempotentReadLock::new(Arc::clone(&repo), None);

        let state = match acquire(&lock, &mut client, &clock, &timing(), &ShutdownFlag::new(), &entry).unwrap() {
            LockOutcome::Acquired(state) => state,
            other => panic!("expected lock, got {:?}", other),
        };
        let second = acquire(&lock, &mut client, &clock, &timing(), &ShutdownFlag::new(), &entry).unwrap();
        assert!(matches!(second, LockOutcome::NotReady));
        // losing the race must not release the winner's claim
        assert!(repo.contains("readLock:/inbox/a.txt"));

        lock.release_on_rollback(&mut client, &state).unwrap();
        assert!(!repo.contains("readLock:/inbox/a.txt"));
    }

    #[test]
    fn test_exclusive_marker_lifecycle() {
        let (clock, server, mut client) = setup();
        server.put("/inbox/a.txt", "a");
        let entry = candidate(&mut client, "a.txt");
        let lock = ExclusiveReadLock::new(None);

        let state = match acquire(&lock, &mut client, &clock, &timing(), &ShutdownFlag::new(), &entry).unwrap() {
            LockOutcome::Acquired(state) => state,
            other => panic!("expected lock, got {:?}", other),
        };
        assert!(server.exists("/inbox/a.txt.ftpollLock"));

        let other = acquire(&lock, &mut client, &clock, &timing(), &ShutdownFlag::new(), &entry).unwrap();
        assert!(matches!(other, LockOutcome::NotReady));
        assert!(server.exists("/inbox/a.txt.ftpollLock"));

        lock.release_on_commit(&mut client, &state).unwrap();
        assert!(!server.exists("/inbox/a.txt.ftpollLock"));
    }

    #[test]
    fn test_shutdown_abandons_wait() {
        let (clock, server, mut client) = setup();
        server.put("/inbox/a.txt", "a");
        let entry = candidate(&mut client, "a.txt");
        let shutdown = ShutdownFlag::new();
        shutdown.request();
        let outcome = acquire(&ChangedReadLock, &mut client, &clock, &timing(), &shutdown, &entry).unwrap();
        assert!(matches!(outcome, LockOutcome::NotReady));
    }

    #[test]
    fn test_kind_parsing_and_registry() {
        assert_eq!("changed".parse::<ReadLockKind>().unwrap(), ReadLockKind::Changed);
        assert_eq!(
            "idempotent-rename".parse::<ReadLockKind>().unwrap(),
            ReadLockKind::IdempotentRename
        );
        let custom: ReadLockKind = "my-lock".parse().unwrap();
        assert_eq!(custom.to_string(), "my-lock");

        let repo: Arc<dyn IdempotentRepository> = Arc::new(MemoryIdempotentRepository::default());
        let mut registry = ReadLockRegistry::new();
        assert!(custom.build(Arc::clone(&repo), IdempotentLockOptions::default(), &registry).is_err());
        registry.register("my-lock", Arc::new(NoneReadLock));
        let built = custom.build(Arc::clone(&repo), IdempotentLockOptions::default(), &registry).unwrap();
        assert_eq!(built.name(), "none");

        let built = ReadLockKind::ExclusiveChanged
            .build(repo, IdempotentLockOptions::default(), &registry)
            .unwrap();
        assert_eq!(built.name(), "exclusive-changed");
    }
}
