use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Global shutdown flag (atomic bool)
///
/// Set to true when shutdown is requested via signal.
/// Consumers check this flag between files and stop cleanly.
pub static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global flag to track which signal triggered shutdown
///
/// Values: 0 = none, 1 = SIGINT, 2 = SIGTERM
pub static SIGNAL_TYPE: AtomicU8 = AtomicU8::new(0);

/// Checks if graceful shutdown has been requested
pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Signals all threads to shutdown gracefully
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Request shutdown with signal type for later logging
///
/// This is async-signal-safe and only sets atomic flags.
/// Logging should be done in the main thread.
///
/// # Arguments
/// * `signal_type` - 1 for SIGINT, 2 for SIGTERM
pub fn request_shutdown_with_signal(signal_type: u8) {
    SIGNAL_TYPE.store(signal_type, Ordering::SeqCst);
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Get the signal type that triggered shutdown
///
/// # Returns
/// * `None` if no signal received
/// * `Some(1)` for SIGINT (Ctrl+C)
/// * `Some(2)` for SIGTERM
pub fn get_signal_type() -> Option<u8> {
    let signal_type = SIGNAL_TYPE.load(Ordering::SeqCst);
    if signal_type == 0 {
        None
    } else {
        Some(signal_type)
    }
}

/// Per-consumer stop request
///
/// A flag built with `process()` also honours the process-wide signal flag;
/// `new()` gives an isolated flag that only `request()` sets.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
    follow_process: bool,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process() -> Self {
        ShutdownFlag {
            requested: Arc::new(AtomicBool::new(false)),
            follow_process: true,
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst) || (self.follow_process && is_shutdown_requested())
    }
}

/// Reset the shutdown flag (for testing purposes only)
#[cfg(test)]
pub fn reset_shutdown_for_tests() {
    SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
    SIGNAL_TYPE.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_signal_type_recorded() {
        reset_shutdown_for_tests();
        assert_eq!(get_signal_type(), None);
        request_shutdown_with_signal(2);
        assert!(is_shutdown_requested());
        assert_eq!(get_signal_type(), Some(2));
        reset_shutdown_for_tests();
    }

    #[test]
    #[serial]
    fn test_flag_follows_process_only_when_asked() {
        reset_shutdown_for_tests();
        let isolated = ShutdownFlag::new();
        let process = ShutdownFlag::process();
        let clone = isolated.clone();

        request_shutdown();
        assert!(!isolated.is_requested());
        assert!(process.is_requested());

        clone.request();
        assert!(isolated.is_requested());
        reset_shutdown_for_tests();
    }
}
