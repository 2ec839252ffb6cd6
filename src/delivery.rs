//! Processors used by the daemon to hand consumed files on
//!
//! `LocalDirectoryDelivery` writes into a local directory, `RemoteDelivery`
//! uploads to a second server through `RemoteFileWriter`.

use std::fs::{self, File};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use chrono::Utc;
use tempfile::NamedTempFile;

use crate::error::ProcessingError;
use crate::exchange::{DownloadedFile, FileProcessor};
use crate::logging::debug;
use crate::producer::{RemoteFileWriter, WriteOutcome};
use crate::protocols::RemoteFileOperations;

/// Copies every file below `directory`, keeping its relative path
#[derive(Debug, Clone)]
pub struct LocalDirectoryDelivery {
    directory: PathBuf,
    keep_last_modified: bool,
}

impl LocalDirectoryDelivery {
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        LocalDirectoryDelivery {
            directory: directory.as_ref().to_path_buf(),
            keep_last_modified: false,
        }
    }

    pub fn keep_last_modified(mut self, keep: bool) -> Self {
        self.keep_last_modified = keep;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn target_for(&self, relative: &str) -> Result<PathBuf, ProcessingError> {
        let mut target = self.directory.clone();
        for segment in relative.split('/').filter(|s| !s.is_empty() && *s != ".") {
            if segment == ".." {
                return Err(ProcessingError::new(format!("refusing to write outside target: {}", relative)));
            }
            target.push(segment);
        }
        Ok(target)
    }
}

impl FileProcessor for LocalDirectoryDelivery {
    fn on_file_ready(&self, file: &mut DownloadedFile<'_>) -> Result<(), ProcessingError> {
        let target = self.target_for(&file.headers.file_name)?;
        let parent = target.parent().unwrap_or(&self.directory).to_path_buf();
        fs::create_dir_all(&parent)?;

        // written next to the target so the final rename stays on one filesystem
        let mut temp = NamedTempFile::new_in(&parent)?;
        file.copy_to(temp.as_file_mut())?;
        temp.as_file().sync_all()?;
        temp.persist(&target)
            .map_err(|e| ProcessingError::with_source(format!("cannot write {}", target.display()), e.error))?;

        if self.keep_last_modified {
            if let Some(modified) = file.headers.last_modified {
                let modified: SystemTime = modified.into();
                File::options().write(true).open(&target)?.set_modified(modified)?;
            }
        }
        debug(&format!("Delivered {} to {}", file.headers.absolute_path, target.display()));
        Ok(())
    }
}

/// Uploads every file to another server
///
/// The target session is opened lazily and reused; a stale session is
/// detected with NOOP and reopened.
pub struct RemoteDelivery<O: RemoteFileOperations> {
    target: Mutex<O>,
    writer: RemoteFileWriter,
}

impl<O: RemoteFileOperations> RemoteDelivery<O> {
    pub fn new(target: O, writer: RemoteFileWriter) -> Self {
        RemoteDelivery {
            target: Mutex::new(target),
            writer,
        }
    }

    pub fn writer(&self) -> &RemoteFileWriter {
        &self.writer
    }
}

impl<O: RemoteFileOperations> FileProcessor for RemoteDelivery<O> {
    fn on_file_ready(&self, file: &mut DownloadedFile<'_>) -> Result<(), ProcessingError> {
        let mut target = self.target.lock().unwrap_or_else(|e| e.into_inner());
        let alive = target.is_connected() && target.send_noop().unwrap_or(false);
        if !alive {
            target.disconnect();
            target
                .connect()
                .map_err(|e| ProcessingError::with_source("cannot connect to delivery target", e))?;
        }

        let body = file.read_bytes()?;
        let outcome = self
            .writer
            .write(&mut *target, &file.headers.file_name, &mut Cursor::new(body), Utc::now())
            .map_err(|e| {
                if e.is_connection_error() {
                    target.disconnect();
                }
                ProcessingError::with_source(format!("cannot upload {}", file.headers.file_name), e)
            })?;
        match outcome {
            WriteOutcome::Written { path, bytes } | WriteOutcome::Appended { path, bytes } => {
                debug(&format!("Uploaded {} bytes to {}{}", bytes, target.endpoint(), path));
            }
            WriteOutcome::Ignored { path } => {
                debug(&format!("{}{} exists, upload skipped", target.endpoint(), path));
            }
        }
        Ok(())
    }
}
