use crate::logging::log;
use crate::shutdown::{request_shutdown, request_shutdown_with_signal};

use fs2::FileExt;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use signal_hook::{consts::SIGINT, consts::SIGTERM, iterator::Signals};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Message a new instance sends to ask the running one to stop
const SHUTDOWN_COMMAND: &[u8; 8] = b"SHUTDOWN";

/// Socket and PID file of the per-user instance lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPaths {
    pub socket: PathBuf,
    pub pid: PathBuf,
}

impl LockPaths {
    /// `$XDG_RUNTIME_DIR/ftpoll.{sock,pid}`, or `/tmp/ftpoll_<uid>.{sock,pid}`
    /// when the runtime directory is not set
    pub fn for_current_user() -> Self {
        let program_name = crate::PROGRAM_NAME;
        match std::env::var("XDG_RUNTIME_DIR") {
            Ok(dir) if !dir.is_empty() && dir != "/tmp" => Self::in_dir(Path::new(&dir), program_name),
            _ => {
                let uid = nix::unistd::getuid();
                Self::in_dir(Path::new("/tmp"), &format!("{}_{}", program_name, uid))
            }
        }
    }

    pub fn in_dir(dir: &Path, stem: &str) -> Self {
        LockPaths {
            socket: dir.join(format!("{}.sock", stem)),
            pid: dir.join(format!("{}.pid", stem)),
        }
    }
}

/// Held for the lifetime of the daemon; dropping it removes the lock files
#[derive(Debug)]
pub struct InstanceLock {
    paths: LockPaths,
    file: Option<File>,
}

impl InstanceLock {
    /// Acquires the per-user lock, asking a running instance to stop first
    pub fn acquire(grace: Duration) -> io::Result<Self> {
        Self::acquire_at(LockPaths::for_current_user(), grace)
    }

    /// Ensures only one instance runs at a time using atomic file locking
    ///
    /// # Behavior
    /// - `flock()` on the PID file decides who owns the lock
    /// - A holder is asked to stop through its socket, then SIGTERM, then
    ///   SIGKILL once `grace` has passed
    /// - The owner listens on the socket for shutdown requests
    ///
    /// # Errors
    /// - Another instance is still running after the takeover attempt
    /// - The lock file or socket cannot be created
    pub fn acquire_at(paths: LockPaths, grace: Duration) -> io::Result<Self> {
        // opened without truncate; emptied only once the lock is held
        let mut lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&paths.pid)
            .map_err(|e| io::Error::new(e.kind(), format!("Failed to open lock file {}: {}", paths.pid.display(), e)))?;

        if lock_file.try_lock_exclusive().is_err() {
            let _ = log(&format!(
                "Another instance is already running (PID file {} is locked)",
                paths.pid.display()
            ));
            if UnixStream::connect(&paths.socket).is_ok() {
                let _ = log(&format!(
                    "New instance PID {} requesting graceful termination of old instance.",
                    std::process::id()
                ));
                if let Err(e) = terminate_previous(&paths, grace) {
                    let _ = log(&format!("Failed to signal old process: {}", e));
                }
            } else {
                let _ = std::fs::remove_file(&paths.socket);
            }
            lock_file.try_lock_exclusive().map_err(|_| {
                io::Error::new(io::ErrorKind::AddrInUse, "Another instance is still running. Exiting.")
            })?;
            let _ = log("Acquired lock after previous instance stopped");
        }

        lock_file.set_len(0)?;
        lock_file.write_all(std::process::id().to_string().as_bytes())?;
        lock_file.flush()?;
        let _ = log(&format!(
            "Acquired exclusive lock on {}, PID {}",
            paths.pid.display(),
            std::process::id()
        ));

        let _ = std::fs::remove_file(&paths.socket);
        let listener = UnixListener::bind(&paths.socket)?;
        thread::Builder::new()
            .name("instance-socket".to_string())
            .spawn(move || listen_for_shutdown(listener))?;

        Ok(InstanceLock {
            paths,
            file: Some(lock_file),
        })
    }

    pub fn paths(&self) -> &LockPaths {
        &self.paths
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = log(&format!(
            "Cleaning up lock files: {} and {}",
            self.paths.socket.display(),
            self.paths.pid.display()
        ));
        for path in [&self.paths.socket, &self.paths.pid] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    let _ = log(&format!("Failed to remove {}: {}", path.display(), e));
                }
            }
        }
        // closing the handle releases the flock
        self.file.take();
    }
}

/// Routes SIGINT and SIGTERM to the shutdown flag
///
/// The handler only sets atomics; the main thread logs which signal arrived.
pub fn install_signal_handlers() -> io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::Builder::new().name("signals".to_string()).spawn(move || {
        if let Some(sig) = signals.forever().next() {
            let signal_type = if sig == SIGTERM { 2 } else { 1 };
            request_shutdown_with_signal(signal_type);
        }
    })?;
    Ok(())
}

/// Accepts `SHUTDOWN` requests until one arrives
///
/// The thread stays blocked in `incoming()` otherwise and ends with the
/// process.
fn listen_for_shutdown(listener: UnixListener) {
    for stream in listener.incoming() {
        match stream {
            Ok(mut stream) => {
                let mut buffer = [0u8; 8];
                if stream.read_exact(&mut buffer).is_ok() && &buffer == SHUTDOWN_COMMAND {
                    let _ = log(&format!(
                        "Received 'SHUTDOWN' command on socket. PID {} initiating self-shutdown.",
                        std::process::id()
                    ));
                    request_shutdown();
                    break;
                }
            }
            Err(e) => {
                let _ = log(&format!("Error accepting incoming connection on socket: {}", e));
            }
        }
    }
}

fn read_pid(path: &Path) -> io::Result<i32> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| io::Error::new(io::ErrorKind::NotFound, format!("Failed to read PID from {}: {}", path.display(), e)))?;
    let content = content.trim();
    if content.is_empty() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "PID file is empty"));
    }
    content
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("Invalid PID in file: {}", e)))
}

/// Stops the instance holding the lock: socket request and SIGTERM, then
/// SIGKILL after `grace`
fn terminate_previous(paths: &LockPaths, grace: Duration) -> io::Result<()> {
    let pid = read_pid(&paths.pid)?;
    if pid as u32 == std::process::id() {
        request_shutdown();
        return Ok(());
    }
    let _ = log(&format!("Found old instance with PID {}, sending termination signal", pid));

    if let Ok(mut stream) = UnixStream::connect(&paths.socket) {
        let _ = stream.write_all(SHUTDOWN_COMMAND);
    }
    let nix_pid = Pid::from_raw(pid);
    signal::kill(nix_pid, Signal::SIGTERM).map_err(|e| {
        io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("Failed to send SIGTERM to process {}: {}", pid, e),
        )
    })?;

    let step = Duration::from_millis(500);
    let mut waited = Duration::ZERO;
    while waited < grace {
        thread::sleep(step);
        waited += step;
        match signal::kill(nix_pid, None) {
            Ok(()) => {}
            Err(nix::errno::Errno::ESRCH) => {
                let _ = log(&format!("Old instance with PID {} has terminated gracefully", pid));
                return Ok(());
            }
            Err(e) => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("Error checking process {}: {}", pid, e),
                ))
            }
        }
        if waited.as_millis() % 1000 == 0 {
            let _ = log(&format!(
                "Waiting for old instance with PID {} to terminate ({} of {} seconds)...",
                pid,
                waited.as_secs(),
                grace.as_secs()
            ));
        }
    }

    let _ = log(&format!(
        "Old instance with PID {} did not terminate gracefully, forcing termination",
        pid
    ));
    signal::kill(nix_pid, Signal::SIGKILL).map_err(|e| {
        io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("Failed to send SIGKILL to process {}: {}", pid, e),
        )
    })?;
    thread::sleep(step);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    #[serial]
    fn test_lock_paths_with_xdg_runtime_dir() {
        temp_env::with_var("XDG_RUNTIME_DIR", Some("/run/user/1000"), || {
            let paths = LockPaths::for_current_user();
            assert_eq!(paths.socket, PathBuf::from("/run/user/1000/ftpoll.sock"));
            assert_eq!(paths.pid, PathBuf::from("/run/user/1000/ftpoll.pid"));
        });
    }

    #[test]
    #[serial]
    fn test_lock_paths_without_xdg_runtime_dir() {
        temp_env::with_var_unset("XDG_RUNTIME_DIR", || {
            let paths = LockPaths::for_current_user();
            let uid = nix::unistd::getuid();
            assert_eq!(paths.socket, PathBuf::from(format!("/tmp/ftpoll_{}.sock", uid)));
            assert_eq!(paths.pid, PathBuf::from(format!("/tmp/ftpoll_{}.pid", uid)));
        });
    }

    #[test]
    #[serial]
    fn test_acquire_writes_pid_and_drop_cleans_up() {
        let dir = tempdir().unwrap();
        let paths = LockPaths::in_dir(dir.path(), "test");

        let lock = InstanceLock::acquire_at(paths.clone(), Duration::from_secs(1)).unwrap();
        assert_eq!(fs::read_to_string(&paths.pid).unwrap(), std::process::id().to_string());
        assert!(paths.socket.exists());
        drop(lock);
        assert!(!paths.pid.exists());
        assert!(!paths.socket.exists());

        // free again after release
        let again = InstanceLock::acquire_at(paths.clone(), Duration::from_secs(1)).unwrap();
        assert_eq!(again.paths(), &paths);
    }

    #[test]
    fn test_read_pid_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.pid");
        fs::write(&path, "").unwrap();
        assert!(read_pid(&path).is_err());
        fs::write(&path, "not-a-pid").unwrap();
        assert_eq!(read_pid(&path).unwrap_err().kind(), io::ErrorKind::InvalidData);
        fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid(&path).unwrap(), 4242);
    }
}
