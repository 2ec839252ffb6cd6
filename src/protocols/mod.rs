//! Remote file system backends
//!
//! Every transport implements `RemoteFileOperations`, the only surface the
//! scanner, read locks, consumer and producer talk to. `Client` wraps the
//! network backends in an enum so the daemon can pick one per endpoint from
//! configuration; tests use `memory::MemoryClient` directly.

pub mod ftp;
pub mod ftps;
pub mod memory;
pub mod sftp;

pub use ftp::FtpClient;
pub use ftps::FtpsClient;
pub use memory::{MemoryClient, MemoryServer};
pub use sftp::SftpClient;

use secrecy::SecretString;
use serde::Deserialize;
use std::fmt;
use std::io::{self, Read};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::entry::{file_name_of, parent_of, RemoteEntry};
use crate::error::RemoteError;

/// Receives the content stream of a retrieved file
pub type RetrieveSink<'a> = dyn FnMut(&mut dyn Read) -> io::Result<()> + 'a;

/// Operations the consumer needs from a remote server
///
/// Paths are absolute, `/`-separated. Implementations own one session and are
/// used from one thread at a time.
pub trait RemoteFileOperations: Send {
    /// Opens and authenticates a session; a no-op when already connected
    fn connect(&mut self) -> Result<(), RemoteError>;

    fn is_connected(&self) -> bool;

    /// Closes the session; errors while quitting are swallowed
    fn disconnect(&mut self);

    /// Lists one directory; entries are relative to `path`
    fn list_files(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    /// Streams a file into `sink`
    ///
    /// The session is busy until `sink` returns. An error from `sink` is
    /// returned as `RemoteError::Io` with the same kind.
    fn retrieve_file(&mut self, path: &str, sink: &mut RetrieveSink<'_>) -> Result<(), RemoteError>;

    fn store_file(&mut self, path: &str, reader: &mut dyn Read) -> Result<u64, RemoteError>;

    fn append_file(&mut self, path: &str, _reader: &mut dyn Read) -> Result<u64, RemoteError> {
        Err(RemoteError::operation(
            None,
            format!("append is not supported for {}", path),
        ))
    }

    fn delete_file(&mut self, path: &str) -> Result<(), RemoteError>;

    fn rename_file(&mut self, from: &str, to: &str) -> Result<(), RemoteError>;

    /// Creates `path`; with `recursive` every missing ancestor is created too
    fn build_directory(&mut self, path: &str, recursive: bool) -> Result<(), RemoteError>;

    fn exists_file(&mut self, path: &str) -> Result<bool, RemoteError> {
        let name = file_name_of(path);
        match self.list_files(parent_of(path)) {
            Ok(entries) => Ok(entries.iter().any(|e| e.file_name_only() == name)),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Liveness check; `Ok(false)` means the session is stale
    fn send_noop(&mut self) -> Result<bool, RemoteError>;

    /// `scheme://host:port` label for logs
    fn endpoint(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ftp,
    Ftps,
    Sftp,
}

impl Protocol {
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Ftp | Protocol::Ftps => 21,
            Protocol::Sftp => 22,
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Ftp => "ftp",
            Protocol::Ftps => "ftps",
            Protocol::Sftp => "sftp",
        }
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Ftp
    }
}

/// Everything needed to open a session
#[derive(Clone)]
pub struct ConnectionSettings {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: Option<SecretString>,
    /// SSH private key (SFTP only)
    pub keyfile: Option<String>,
    pub keyfile_passphrase: Option<SecretString>,
    /// Also used as socket read/write timeout so a stuck transfer fails
    pub timeout: Duration,
    /// Skip TLS certificate verification (FTPS with self-signed certs)
    pub insecure_skip_verify: bool,
    pub passive: bool,
}

impl ConnectionSettings {
    pub fn endpoint(&self) -> String {
        format!("{}://{}:{}", self.protocol.scheme(), self.host, self.port)
    }
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("endpoint", &self.endpoint())
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("keyfile", &self.keyfile)
            .field("timeout", &self.timeout)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("passive", &self.passive)
            .finish()
    }
}

/// Resolves `host:port` to every candidate address
pub(crate) fn resolve_addrs(host: &str, port: u16) -> Result<Vec<SocketAddr>, RemoteError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| RemoteError::connection(None, format!("cannot resolve {}: {}", host, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(RemoteError::connection(
            None,
            format!("no addresses found for {}", host),
        ));
    }
    Ok(addrs)
}

/// Runs `sink` inside a transport callback and keeps its original error
///
/// Transport libraries wrap callback errors in their own type; this keeps the
/// sink's `io::Error` so it is not mistaken for a broken connection.
pub(crate) fn run_sink<E>(
    sink: &mut RetrieveSink<'_>,
    reader: &mut dyn Read,
    slot: &mut Option<io::Error>,
    wrap: impl FnOnce(io::Error) -> E,
) -> Result<(), E> {
    sink(reader).map_err(|e| {
        let copy = io::Error::new(e.kind(), e.to_string());
        *slot = Some(e);
        wrap(copy)
    })
}

/// Network client selected from configuration
pub enum Client {
    Ftp(FtpClient),
    Ftps(FtpsClient),
    Sftp(SftpClient),
}

impl Client {
    /// Builds a disconnected client; the session opens on `connect`
    pub fn new(settings: ConnectionSettings) -> Self {
        match settings.protocol {
            Protocol::Ftp => Client::Ftp(FtpClient::new(settings)),
            Protocol::Ftps => Client::Ftps(FtpsClient::new(settings)),
            Protocol::Sftp => Client::Sftp(SftpClient::new(settings)),
        }
    }
}

impl RemoteFileOperations for Client {
    fn connect(&mut self) -> Result<(), RemoteError> {
        match self {
            Client::Ftp(client) => client.connect(),
            Client::Ftps(client) => client.connect(),
            Client::Sftp(client) => client.connect(),
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Client::Ftp(client) => client.is_connected(),
            Client::Ftps(client) => client.is_connected(),
            Client::Sftp(client) => client.is_connected(),
        }
    }

    fn disconnect(&mut self) {
        match self {
            Client::Ftp(client) => client.disconnect(),
            Client::Ftps(client) => client.disconnect(),
            Client::Sftp(client) => client.disconnect(),
        }
    }

    fn list_files(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        match self {
            Client::Ftp(client) => client.list_files(path),
            Client::Ftps(client) => client.list_files(path),
            Client::Sftp(client) => client.list_files(path),
        }
    }

    fn retrieve_file(&mut self, path: &str, sink: &mut RetrieveSink<'_>) -> Result<(), RemoteError> {
        match self {
            Client::Ftp(client) => client.retrieve_file(path, sink),
            Client::Ftps(client) => client.retrieve_file(path, sink),
            Client::Sftp(client) => client.retrieve_file(path, sink),
        }
    }

    fn store_file(&mut self, path: &str, reader: &mut dyn Read) -> Result<u64, RemoteError> {
        match self {
            Client::Ftp(client) => client.store_file(path, reader),
            Client::Ftps(client) => client.store_file(path, reader),
            Client::Sftp(client) => client.store_file(path, reader),
        }
    }

    fn append_file(&mut self, path: &str, reader: &mut dyn Read) -> Result<u64, RemoteError> {
        match self {
            Client::Ftp(client) => client.append_file(path, reader),
            Client::Ftps(client) => client.append_file(path, reader),
            Client::Sftp(client) => client.append_file(path, reader),
        }
    }

    fn delete_file(&mut self, path: &str) -> Result<(), RemoteError> {
        match self {
            Client::Ftp(client) => client.delete_file(path),
            Client::Ftps(client) => client.delete_file(path),
            Client::Sftp(client) => client.delete_file(path),
        }
    }

    fn rename_file(&mut self, from: &str, to: &str) -> Result<(), RemoteError> {
        match self {
            Client::Ftp(client) => client.rename_file(from, to),
            Client::Ftps(client) => client.rename_file(from, to),
            Client::Sftp(client) => client.rename_file(from, to),
        }
    }

    fn build_directory(&mut self, path: &str, recursive: bool) -> Result<(), RemoteError> {
        match self {
            Client::Ftp(client) => client.build_directory(path, recursive),
            Client::Ftps(client) => client.build_directory(path, recursive),
            Client::Sftp(client) => client.build_directory(path, recursive),
        }
    }

    fn send_noop(&mut self) -> Result<bool, RemoteError> {
        match self {
            Client::Ftp(client) => client.send_noop(),
            Client::Ftps(client) => client.send_noop(),
            Client::Sftp(client) => client.send_noop(),
        }
    }

    fn endpoint(&self) -> String {
        match self {
            Client::Ftp(client) => client.endpoint(),
            Client::Ftps(client) => client.endpoint(),
            Client::Sftp(client) => client.endpoint(),
        }
    }
}

/// Directories from the root down to `path`, e.g. `/a`, `/a/b`
pub(crate) fn ancestor_chain(path: &str) -> Vec<String> {
    let absolute = path.starts_with('/');
    let mut current = String::new();
    let mut chain = Vec::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if absolute || !current.is_empty() {
            current.push('/');
        }
        current.push_str(segment);
        chain.push(current.clone());
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestor_chain() {
        assert_eq!(ancestor_chain("/a/b/c"), vec!["/a", "/a/b", "/a/b/c"]);
        assert_eq!(ancestor_chain("a/b"), vec!["a", "a/b"]);
        assert!(ancestor_chain("/").is_empty());
    }

    #[test]
    fn test_protocol_defaults() {
        assert_eq!(Protocol::Ftp.default_port(), 21);
        assert_eq!(Protocol::Sftp.default_port(), 22);
        let p: Protocol = serde_json::from_str("\"ftps\"").unwrap();
        assert_eq!(p, Protocol::Ftps);
    }

    #[test]
    fn test_settings_debug_hides_password() {
        let settings = ConnectionSettings {
            protocol: Protocol::Ftp,
            host: "localhost".into(),
            port: 2121,
            login: "admin".into(),
            password: Some(SecretString::new("s3cret".into())),
            keyfile: None,
            keyfile_passphrase: None,
            timeout: Duration::from_secs(30),
            insecure_skip_verify: false,
            passive: true,
        };
        let debug = format!("{:?}", settings);
        assert!(debug.contains("ftp://localhost:2121"));
        assert!(!debug.contains("s3cret"));
    }
}
