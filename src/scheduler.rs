//! Timer loop driving one consumer
//!
//! Polls never overlap: the next tick is only scheduled after the previous
//! poll returned. Backoff skips a number of ticks after too many idle or
//! failed polls in a row.

use std::time::Duration;

use crate::clock::Clock;
use crate::consumer::PollReport;
use crate::error::{ConfigError, ConsumerError};
use crate::logging::{debug_with_tag, log_with_tag};
use crate::shutdown::ShutdownFlag;

/// Longest uninterrupted sleep while waiting for the next tick
const SLEEP_SLICE: Duration = Duration::from_millis(100);

pub const DEFAULT_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub initial_delay: Duration,
    pub delay: Duration,
    /// Poll again at once when the previous poll processed files
    pub greedy: bool,
    /// Stop after this many polls; zero runs until shutdown
    pub repeat_count: u64,
    /// Ticks skipped once a threshold is reached; zero disables backoff
    pub backoff_multiplier: u32,
    pub backoff_idle_threshold: u32,
    pub backoff_error_threshold: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            initial_delay: DEFAULT_INITIAL_DELAY,
            delay: DEFAULT_DELAY,
            greedy: false,
            repeat_count: 0,
            backoff_multiplier: 0,
            backoff_idle_threshold: 0,
            backoff_error_threshold: 0,
        }
    }
}

impl SchedulerOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_multiplier > 0
            && self.backoff_idle_threshold == 0
            && self.backoff_error_threshold == 0
        {
            return Err(ConfigError::invalid(
                "backoff_multiplier requires backoff_idle_threshold or backoff_error_threshold",
            ));
        }
        Ok(())
    }
}

/// Totals over the lifetime of one scheduler run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub polls: u64,
    /// Ticks skipped by backoff
    pub skipped: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Polls that returned an error
    pub errors: u64,
}

pub struct Scheduler<'a> {
    name: String,
    options: SchedulerOptions,
    clock: &'a dyn Clock,
    shutdown: ShutdownFlag,
}

impl<'a> Scheduler<'a> {
    pub fn new(name: &str, options: SchedulerOptions, clock: &'a dyn Clock, shutdown: ShutdownFlag) -> Self {
        Scheduler {
            name: name.to_string(),
            options,
            clock,
            shutdown,
        }
    }

    /// Calls `poll` on every tick until shutdown, `repeat_count` or a fatal
    /// error
    pub fn run<F>(&self, mut poll: F) -> Result<SchedulerStats, ConsumerError>
    where
        F: FnMut() -> Result<PollReport, ConsumerError>,
    {
        let mut stats = SchedulerStats::default();
        let mut idle_polls: u32 = 0;
        let mut error_polls: u32 = 0;
        let mut backoff_left: u32 = 0;

        if !sleep_unless_shutdown(self.clock, self.options.initial_delay, &self.shutdown) {
            return Ok(stats);
        }

        loop {
            if self.shutdown.is_requested() {
                break;
            }

            if backoff_left > 0 {
                backoff_left -= 1;
                stats.skipped += 1;
                debug_with_tag(
                    &format!("Backoff: skipping poll ({} more to skip)", backoff_left),
                    Some(&self.name),
                );
                if !sleep_unless_shutdown(self.clock, self.options.delay, &self.shutdown) {
                    break;
                }
                continue;
            }

            let mut busy = false;
            match poll() {
                Ok(report) => {
                    stats.delivered += report.delivered as u64;
                    stats.failed += report.failed as u64;
                    error_polls = 0;
                    if report.processed() == 0 {
                        idle_polls += 1;
                    } else {
                        idle_polls = 0;
                        busy = true;
                    }
                }
                Err(e) if e.is_fatal() => {
                    let _ = log_with_tag(&format!("Stopping: {}", e), Some(&self.name));
                    return Err(e);
                }
                Err(e) => {
                    let _ = log_with_tag(&format!("Poll failed: {}", e), Some(&self.name));
                    stats.errors += 1;
                    error_polls += 1;
                    idle_polls = 0;
                }
            }
            stats.polls += 1;

            if self.options.repeat_count > 0 && stats.polls >= self.options.repeat_count {
                debug_with_tag(
                    &format!("Repeat count {} reached", self.options.repeat_count),
                    Some(&self.name),
                );
                break;
            }

            if self.options.backoff_multiplier > 0 {
                let idle_hit = self.options.backoff_idle_threshold > 0
                    && idle_polls >= self.options.backoff_idle_threshold;
                let error_hit = self.options.backoff_error_threshold > 0
                    && error_polls >= self.options.backoff_error_threshold;
                if idle_hit || error_hit {
                    backoff_left = self.options.backoff_multiplier;
                    idle_polls = 0;
                    error_polls = 0;
                    debug_with_tag(
                        &format!("Backing off for {} poll(s)", backoff_left),
                        Some(&self.name),
                    );
                }
            }

            if self.options.greedy && busy {
                continue;
            }
            if !sleep_unless_shutdown(self.clock, self.options.delay, &self.shutdown) {
                break;
            }
        }
        Ok(stats)
    }
}

/// Sleeps in short slices; `false` when shutdown interrupted the wait
pub fn sleep_unless_shutdown(clock: &dyn Clock, duration: Duration, shutdown: &ShutdownFlag) -> bool {
    let mut left = duration;
    while !left.is_zero() {
        if shutdown.is_requested() {
            return false;
        }
        let step = left.min(SLEEP_SLICE);
        clock.sleep(step);
        left -= step;
    }
    !shutdown.is_requested()
}
