//! Error taxonomy for the polling consumer
//!
//! Transport failures carry the protocol reply code (e.g. 550, 530) so the
//! consumer can tell a missing file from a dead session. Read-lock timeouts
//! are not errors; they show up as skip reasons in the poll report.

use std::io;
use thiserror::Error;

/// FTP reply codes the consumer reacts to
pub mod codes {
    /// Service not available, closing control connection
    pub const SERVICE_NOT_AVAILABLE: u32 = 421;
    /// Can't open data connection
    pub const CANNOT_OPEN_DATA_CONNECTION: u32 = 425;
    /// Connection closed, transfer aborted
    pub const TRANSFER_ABORTED: u32 = 426;
    /// File busy, action not taken
    pub const FILE_ACTION_NOT_TAKEN: u32 = 450;
    /// Not logged in
    pub const NOT_LOGGED_IN: u32 = 530;
    /// File unavailable (not found, no access)
    pub const FILE_UNAVAILABLE: u32 = 550;
    /// File name not allowed
    pub const FILE_NAME_NOT_ALLOWED: u32 = 553;
}

fn fmt_code(code: &Option<u32>) -> String {
    match code {
        Some(code) => format!(" ({})", code),
        None => String::new(),
    }
}

/// Failure reported by a `RemoteFileOperations` implementation
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network, TLS or login failure; the session is unusable
    #[error("connection failed{}: {message}", fmt_code(.code))]
    ConnectionFailed { code: Option<u32>, message: String },
    /// A single command (list, retrieve, store, delete, rename) was refused
    #[error("operation failed{}: {message}", fmt_code(.code))]
    OperationFailed { code: Option<u32>, message: String },
    /// Local or socket I/O failure while moving bytes
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RemoteError {
    pub fn connection(code: Option<u32>, message: impl Into<String>) -> Self {
        RemoteError::ConnectionFailed {
            code,
            message: message.into(),
        }
    }

    pub fn operation(code: Option<u32>, message: impl Into<String>) -> Self {
        RemoteError::OperationFailed {
            code,
            message: message.into(),
        }
    }

    /// Classifies a server reply: session-level codes become `ConnectionFailed`
    pub fn from_reply(code: u32, message: impl Into<String>) -> Self {
        match code {
            codes::SERVICE_NOT_AVAILABLE
            | codes::CANNOT_OPEN_DATA_CONNECTION
            | codes::TRANSFER_ABORTED
            | codes::NOT_LOGGED_IN => RemoteError::connection(Some(code), message),
            _ => RemoteError::operation(Some(code), message),
        }
    }

    /// Protocol reply code, when the server sent one
    pub fn code(&self) -> Option<u32> {
        match self {
            RemoteError::ConnectionFailed { code, .. } | RemoteError::OperationFailed { code, .. } => *code,
            RemoteError::Io(_) => None,
        }
    }

    /// True when the session must be torn down and re-established
    pub fn is_connection_error(&self) -> bool {
        match self {
            RemoteError::ConnectionFailed { .. } => true,
            RemoteError::OperationFailed { .. } => false,
            RemoteError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::UnexpectedEof
            ),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            RemoteError::OperationFailed { code, .. } => *code == Some(codes::FILE_UNAVAILABLE),
            RemoteError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            RemoteError::ConnectionFailed { .. } => false,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        match self {
            RemoteError::OperationFailed { code, .. } => {
                matches!(*code, Some(codes::FILE_UNAVAILABLE) | Some(codes::FILE_NAME_NOT_ALLOWED))
            }
            RemoteError::Io(e) => e.kind() == io::ErrorKind::PermissionDenied,
            RemoteError::ConnectionFailed { .. } => false,
        }
    }
}

impl From<suppaftp::FtpError> for RemoteError {
    fn from(e: suppaftp::FtpError) -> Self {
        use suppaftp::FtpError;
        #[allow(unreachable_patterns)]
        match e {
            FtpError::ConnectionError(io) => RemoteError::connection(None, io.to_string()),
            FtpError::SecureError(msg) => RemoteError::connection(None, msg),
            FtpError::InvalidAddress(addr) => RemoteError::connection(None, addr.to_string()),
            FtpError::UnexpectedResponse(response) => {
                let message = String::from_utf8_lossy(&response.body).trim().to_string();
                RemoteError::from_reply(response.status.code(), message)
            }
            FtpError::BadResponse => RemoteError::operation(None, "bad response from server"),
            other => RemoteError::operation(None, other.to_string()),
        }
    }
}

impl From<ssh2::Error> for RemoteError {
    fn from(e: ssh2::Error) -> Self {
        // LIBSSH2_FX_NO_SUCH_FILE = 2, LIBSSH2_FX_PERMISSION_DENIED = 3
        match e.code() {
            ssh2::ErrorCode::SFTP(2) | ssh2::ErrorCode::SFTP(3) => {
                RemoteError::operation(Some(codes::FILE_UNAVAILABLE), e.message().to_string())
            }
            ssh2::ErrorCode::SFTP(_) => RemoteError::operation(None, e.message().to_string()),
            ssh2::ErrorCode::Session(_) => RemoteError::connection(None, e.message().to_string()),
        }
    }
}

/// Error raised by the user callback; triggers rollback, never a reconnect
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProcessingError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        ProcessingError {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        ProcessingError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<io::Error> for ProcessingError {
    fn from(e: io::Error) -> Self {
        ProcessingError::with_source(e.to_string(), e)
    }
}

/// Malformed file-language expression
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid expression '{expression}': {reason}")]
pub struct ExpressionError {
    pub expression: String,
    pub reason: String,
}

impl ExpressionError {
    pub fn new(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        ExpressionError {
            expression: expression.into(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by a poll cycle
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// Reconnect attempts exhausted with `throw_exception_on_connect_failed`
    #[error("cannot connect to {endpoint} after {attempts} attempt(s): {source}")]
    ConnectFailed {
        endpoint: String,
        attempts: u32,
        #[source]
        source: RemoteError,
    },
    #[error("processing failed: {0}")]
    Processing(#[from] ProcessingError),
    #[error(transparent)]
    Expression(#[from] ExpressionError),
    #[error("cannot start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl ConsumerError {
    /// Fatal errors stop the scheduler instead of waiting for the next tick
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsumerError::ConnectFailed { .. } | ConsumerError::WorkerPool(_))
    }

    pub fn is_connection_error(&self) -> bool {
        match self {
            ConsumerError::Remote(e) => e.is_connection_error(),
            ConsumerError::ConnectFailed { .. } => true,
            _ => false,
        }
    }
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid regex '{pattern}': {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid glob '{pattern}': {source}")]
    Glob {
        pattern: String,
        #[source]
        source: globset::Error,
    },
    #[error(transparent)]
    Expression(#[from] ExpressionError),
    #[error("{0}")]
    Invalid(String),
    #[error("line {line}: {source}")]
    Line {
        line: usize,
        #[source]
        source: Box<ConfigError>,
    },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid(message.into())
    }

    pub fn at_line(self, line: usize) -> Self {
        ConfigError::Line {
            line,
            source: Box::new(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_classification() {
        assert!(RemoteError::from_reply(530, "Login incorrect").is_connection_error());
        assert!(RemoteError::from_reply(421, "Timeout").is_connection_error());

        let not_found = RemoteError::from_reply(550, "No such file");
        assert!(!not_found.is_connection_error());
        assert!(not_found.is_not_found());
        assert_eq!(not_found.code(), Some(550));
    }

    #[test]
    fn test_io_error_classification() {
        let reset = RemoteError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(reset.is_connection_error());

        let missing = RemoteError::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(!missing.is_connection_error());
        assert!(missing.is_not_found());
    }

    #[test]
    fn test_display_includes_code() {
        let e = RemoteError::operation(Some(550), "hello.txt: No such file");
        assert_eq!(e.to_string(), "operation failed (550): hello.txt: No such file");

        let e = RemoteError::connection(None, "refused");
        assert_eq!(e.to_string(), "connection failed: refused");
    }

    #[test]
    fn test_consumer_error_fatality() {
        let fatal = ConsumerError::ConnectFailed {
            endpoint: "ftp://localhost:21".to_string(),
            attempts: 3,
            source: RemoteError::from_reply(530, "Login incorrect"),
        };
        assert!(fatal.is_fatal());

        let transient = ConsumerError::Remote(RemoteError::from_reply(550, "gone"));
        assert!(!transient.is_fatal());
    }
}
