use chrono::Local;
use once_cell::sync::Lazy;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Global log file path protected by Mutex
///
/// Thread-safe storage for optional log file path.
/// When None, logs go to stdout.
pub static LOG_FILE: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));

/// Enables `debug` output (`-d` on the command line)
pub static DEBUG: AtomicBool = AtomicBool::new(false);

/// Logs a message with timestamp to configured output
///
/// # Arguments
/// * `message` - The message to log
///
/// # Returns
/// * `io::Result<()>` - Ok on success, Err if writing fails
pub fn log(message: &str) -> io::Result<()> {
    log_with_tag(message, None)
}

/// Logs a message with timestamp and optional endpoint tag
///
/// Every endpoint runs its own consumer thread; the tag (the endpoint
/// name) keeps their lines apart in a shared log.
///
/// # Example
/// ```text
/// 2024-03-01 08:00:00 [inbox] Polled 3 file(s)
/// ```
pub fn log_with_tag(message: &str, tag: Option<&str>) -> io::Result<()> {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let log_message = match tag {
        Some(tag) => format!("{} [{}] {}\n", timestamp, tag, message),
        None => format!("{} {}\n", timestamp, message),
    };

    let log_file = LOG_FILE.lock().unwrap_or_else(|e| e.into_inner());
    match &*log_file {
        Some(path) => {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(log_message.as_bytes())?;
        }
        None => {
            print!("{}", log_message);
        }
    }

    Ok(())
}

/// Logs only when debug output is enabled
pub fn debug(message: &str) {
    debug_with_tag(message, None);
}

pub fn debug_with_tag(message: &str, tag: Option<&str>) {
    if is_debug() {
        let _ = log_with_tag(message, tag);
    }
}

pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::SeqCst);
}

pub fn is_debug() -> bool {
    DEBUG.load(Ordering::SeqCst)
}

/// Sets the path for the log file
///
/// Subsequent calls to the log functions append to this file. A path that
/// is not valid UTF-8 is stored lossily.
pub fn set_log_file<P: AsRef<Path>>(path: P) {
    let path_str = path.as_ref().to_string_lossy().into_owned();
    *LOG_FILE.lock().unwrap_or_else(|e| e.into_inner()) = Some(path_str);
}

#[cfg(test)]
pub(crate) fn reset_log_file_for_tests() {
    *LOG_FILE.lock().unwrap_or_else(|e| e.into_inner()) = None;
}
