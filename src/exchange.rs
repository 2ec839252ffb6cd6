//! What the consumer hands to user code for every delivered file

use chrono::{DateTime, Utc};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;

use crate::entry::RemoteEntry;
use crate::error::ProcessingError;
use crate::logging::log_with_tag;

/// Content of a downloaded file
pub enum Body<'a> {
    /// `download` disabled, or idle notification
    Empty,
    Bytes(Vec<u8>),
    /// Downloaded into the local work directory; removed on drop
    File(NamedTempFile),
    /// Remote stream, readable only while the callback runs
    Stream(&'a mut dyn Read),
}

impl fmt::Debug for Body<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Body::File(file) => write!(f, "File({})", file.path().display()),
            Body::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Owned body that can move to a worker thread
#[derive(Debug)]
pub enum Payload {
    Empty,
    Bytes(Vec<u8>),
    File(NamedTempFile),
}

impl Payload {
    pub fn into_body<'a>(self) -> Body<'a> {
        match self {
            Payload::Empty => Body::Empty,
            Payload::Bytes(bytes) => Body::Bytes(bytes),
            Payload::File(file) => Body::File(file),
        }
    }
}

/// Typed metadata of one delivery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileHeaders {
    /// Path relative to the consumer's starting directory
    pub file_name: String,
    pub file_name_only: String,
    pub absolute_path: String,
    pub parent: String,
    pub length: u64,
    pub last_modified: Option<DateTime<Utc>>,
    /// `ftp://host:port` of the source server
    pub endpoint: String,
    pub consumed_at: Option<DateTime<Utc>>,
    /// Position of this file in its poll, from 0
    pub batch_index: usize,
    pub batch_size: usize,
    pub batch_complete: bool,
}

impl FileHeaders {
    pub fn for_entry(entry: &RemoteEntry, endpoint: &str) -> Self {
        FileHeaders {
            file_name: entry.relative_path().to_string(),
            file_name_only: entry.file_name_only().to_string(),
            absolute_path: entry.absolute_path(),
            parent: entry.parent(),
            length: entry.size(),
            last_modified: entry.last_modified(),
            endpoint: endpoint.to_string(),
            ..FileHeaders::default()
        }
    }

    pub fn with_batch(mut self, index: usize, size: usize) -> Self {
        self.batch_index = index;
        self.batch_size = size;
        self.batch_complete = index + 1 == size;
        self
    }
}

/// One retrieved remote file
#[derive(Debug)]
pub struct DownloadedFile<'a> {
    pub entry: RemoteEntry,
    pub headers: FileHeaders,
    pub body: Body<'a>,
    pub charset: Option<String>,
}

impl<'a> DownloadedFile<'a> {
    pub fn new(entry: RemoteEntry, headers: FileHeaders, body: Body<'a>) -> Self {
        DownloadedFile {
            entry,
            headers,
            body,
            charset: None,
        }
    }

    pub fn relative_file_path(&self) -> &str {
        self.entry.relative_path()
    }

    pub fn absolute_file_path(&self) -> String {
        self.entry.absolute_path()
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.entry.last_modified()
    }

    /// Local file backing the body, when downloaded to a work directory
    pub fn local_path(&self) -> Option<&Path> {
        match &self.body {
            Body::File(file) => Some(file.path()),
            _ => None,
        }
    }

    /// Copies the body into `writer`; a stream body can be read only once
    pub fn copy_to(&mut self, writer: &mut dyn Write) -> io::Result<u64> {
        match &mut self.body {
            Body::Empty => Ok(0),
            Body::Bytes(bytes) => {
                writer.write_all(bytes)?;
                Ok(bytes.len() as u64)
            }
            Body::File(file) => {
                let mut reader = File::open(file.path())?;
                io::copy(&mut reader, writer)
            }
            Body::Stream(reader) => io::copy(reader, writer),
        }
    }

    pub fn read_bytes(&mut self) -> io::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.copy_to(&mut buffer)?;
        Ok(buffer)
    }

    /// Body decoded as UTF-8
    pub fn read_string(&mut self) -> io::Result<String> {
        String::from_utf8(self.read_bytes()?)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// User callback invoked for every delivered file
pub trait FileProcessor: Send + Sync {
    fn on_file_ready(&self, file: &mut DownloadedFile<'_>) -> Result<(), ProcessingError>;

    /// Called for an empty poll when `send_empty_message_when_idle` is set
    fn on_idle(&self, _headers: &FileHeaders) -> Result<(), ProcessingError> {
        Ok(())
    }
}

/// Adapts a closure into a `FileProcessor`
pub struct FnProcessor<F>(F);

pub fn processor_fn<F>(f: F) -> FnProcessor<F>
where
    F: Fn(&mut DownloadedFile<'_>) -> Result<(), ProcessingError> + Send + Sync,
{
    FnProcessor(f)
}

impl<F> FileProcessor for FnProcessor<F>
where
    F: Fn(&mut DownloadedFile<'_>) -> Result<(), ProcessingError> + Send + Sync,
{
    fn on_file_ready(&self, file: &mut DownloadedFile<'_>) -> Result<(), ProcessingError> {
        (self.0)(file)
    }
}

/// Where a delivery failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// Read lock could not be taken or checked
    Lock,
    PreMove,
    Download,
    Processing,
    Commit,
    Rollback,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            FailureStage::Lock => "lock",
            FailureStage::PreMove => "pre-move",
            FailureStage::Download => "download",
            FailureStage::Processing => "processing",
            FailureStage::Commit => "commit",
            FailureStage::Rollback => "rollback",
        };
        f.write_str(stage)
    }
}

#[derive(Debug, Clone)]
pub struct FailureReport {
    pub endpoint: String,
    pub headers: FileHeaders,
    pub stage: FailureStage,
    pub message: String,
}

/// Receives every failed delivery exactly once
pub trait ErrorChannel: Send + Sync {
    fn report(&self, report: &FailureReport);
}

impl<F> ErrorChannel for F
where
    F: Fn(&FailureReport) + Send + Sync,
{
    fn report(&self, report: &FailureReport) {
        self(report)
    }
}

/// Default channel: one log line per failure, tagged with the consumer name
#[derive(Debug, Clone)]
pub struct LoggingErrorChannel {
    tag: String,
}

impl LoggingErrorChannel {
    pub fn new(tag: &str) -> Self {
        LoggingErrorChannel {
            tag: tag.to_string(),
        }
    }
}

impl ErrorChannel for LoggingErrorChannel {
    fn report(&self, report: &FailureReport) {
        let _ = log_with_tag(
            &format!(
                "Error during {} of {}: {}",
                report.stage, report.headers.absolute_path, report.message
            ),
            Some(&self.tag),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn entry() -> RemoteEntry {
        RemoteEntry::file("/in", "sub/hello.txt", 11, None)
    }

    #[test]
    fn test_headers_from_entry() {
        let headers = FileHeaders::for_entry(&entry(), "ftp://localhost:21").with_batch(2, 3);
        assert_eq!(headers.file_name, "sub/hello.txt");
        assert_eq!(headers.file_name_only, "hello.txt");
        assert_eq!(headers.absolute_path, "/in/sub/hello.txt");
        assert_eq!(headers.parent, "/in/sub");
        assert_eq!(headers.length, 11);
        assert!(headers.batch_complete);
        assert!(!FileHeaders::default().with_batch(0, 3).batch_complete);
    }

    #[test]
    fn test_bodies_read_the_same() {
        let mut bytes = DownloadedFile::new(entry(), FileHeaders::default(), Body::Bytes(b"Hello World".to_vec()));
        assert_eq!(bytes.read_string().unwrap(), "Hello World");

        let mut cursor = Cursor::new(b"Hello World".to_vec());
        let mut stream = DownloadedFile::new(entry(), FileHeaders::default(), Body::Stream(&mut cursor));
        assert_eq!(stream.read_string().unwrap(), "Hello World");
        // consumed
        assert_eq!(stream.read_bytes().unwrap(), Vec::<u8>::new());

        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"Hello World").unwrap();
        let path = temp.path().to_path_buf();
        let mut file = DownloadedFile::new(entry(), FileHeaders::default(), Payload::File(temp).into_body());
        assert_eq!(file.local_path(), Some(path.as_path()));
        assert_eq!(file.read_string().unwrap(), "Hello World");
        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn test_processor_fn() {
        let processor = processor_fn(|file: &mut DownloadedFile<'_>| {
            if file.read_bytes()?.is_empty() {
                Err(ProcessingError::new("empty"))
            } else {
                Ok(())
            }
        });
        let mut empty = DownloadedFile::new(entry(), FileHeaders::default(), Body::Empty);
        assert_eq!(processor.on_file_ready(&mut empty).unwrap_err().message(), "empty");
        assert!(processor.on_idle(&FileHeaders::default()).is_ok());
    }
}
