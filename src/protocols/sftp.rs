//! SFTP (SSH File Transfer Protocol) backend using the ssh2 crate

use secrecy::{ExposeSecret, SecretString};
use ssh2::{OpenFlags, OpenType, Session, Sftp};
use std::io::{self, Read};
use std::net::TcpStream;
use std::path::Path;
use zeroize::Zeroize;

use crate::entry::RemoteEntry;
use crate::error::RemoteError;
use crate::protocols::{
    ancestor_chain, resolve_addrs, run_sink, ConnectionSettings, RemoteFileOperations,
    RetrieveSink,
};

/// Authentication method for SFTP connections
enum AuthMethod {
    Password(String),
    Keyfile {
        path: String,
        passphrase: Option<String>,
    },
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        match self {
            AuthMethod::Password(password) => password.zeroize(),
            AuthMethod::Keyfile { passphrase, .. } => {
                if let Some(p) = passphrase.as_mut() {
                    p.zeroize();
                }
            }
        }
    }
}

struct SftpSession {
    // keeps the SSH transport alive for the channel
    _session: Session,
    sftp: Sftp,
}

/// SFTP client for SSH File Transfer Protocol connections
pub struct SftpClient {
    settings: ConnectionSettings,
    session: Option<SftpSession>,
}

impl SftpClient {
    pub fn new(settings: ConnectionSettings) -> Self {
        SftpClient {
            settings,
            session: None,
        }
    }

    fn auth_method(&self) -> Result<AuthMethod, RemoteError> {
        let expose = |s: &Option<SecretString>| s.as_ref().map(|v| v.expose_secret().clone());
        match (&self.settings.password, &self.settings.keyfile) {
            (Some(_), _) => Ok(AuthMethod::Password(
                expose(&self.settings.password).unwrap_or_default(),
            )),
            (None, Some(keyfile)) => Ok(AuthMethod::Keyfile {
                path: keyfile.clone(),
                passphrase: expose(&self.settings.keyfile_passphrase),
            }),
            (None, None) => Err(RemoteError::connection(
                None,
                "SFTP requires either password or keyfile",
            )),
        }
    }

    fn open(&self) -> Result<SftpSession, RemoteError> {
        let auth = self.auth_method()?;
        let timeout = self.settings.timeout;
        let addrs = resolve_addrs(&self.settings.host, self.settings.port)?;

        let mut last_error = None;
        for addr in addrs {
            let stream = match TcpStream::connect_timeout(&addr, timeout) {
                Ok(s) => s,
                Err(e) => {
                    last_error = Some(RemoteError::connection(None, e.to_string()));
                    continue;
                }
            };
            stream.set_read_timeout(Some(timeout))?;
            stream.set_write_timeout(Some(timeout))?;

            let mut session = Session::new().map_err(|e| {
                RemoteError::connection(None, format!("failed to create SSH session: {}", e))
            })?;
            session.set_tcp_stream(stream);
            session.handshake().map_err(|e| {
                RemoteError::connection(None, format!("SSH handshake failed: {}", e))
            })?;
            session.set_timeout(timeout.as_millis() as u32);

            let login = &self.settings.login;
            let auth_result = match &auth {
                AuthMethod::Password(password) => session.userauth_password(login, password),
                AuthMethod::Keyfile { path, passphrase } => {
                    session.userauth_pubkey_file(login, None, Path::new(path), passphrase.as_deref())
                }
            };
            auth_result.map_err(|e| {
                RemoteError::from_reply(
                    crate::error::codes::NOT_LOGGED_IN,
                    format!("SFTP authentication failed for user '{}': {}", login, e),
                )
            })?;

            let sftp = session.sftp().map_err(|e| {
                RemoteError::connection(None, format!("failed to open SFTP channel: {}", e))
            })?;
            return Ok(SftpSession {
                _session: session,
                sftp,
            });
        }

        Err(last_error.unwrap_or_else(|| RemoteError::connection(None, "no addresses available")))
    }

    fn sftp(&mut self) -> Result<&Sftp, RemoteError> {
        self.session
            .as_ref()
            .map(|s| &s.sftp)
            .ok_or_else(|| RemoteError::connection(None, "not connected"))
    }
}

impl RemoteFileOperations for SftpClient {
    fn connect(&mut self) -> Result<(), RemoteError> {
        if self.session.is_none() {
            self.session = Some(self.open()?);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn disconnect(&mut self) {
        // Session and SFTP channel are closed on drop
        self.session = None;
    }

    fn list_files(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let entries = self.sftp()?.readdir(Path::new(path))?;
        Ok(entries
            .into_iter()
            .filter_map(|(entry_path, stat)| {
                let name = entry_path.file_name()?.to_str()?.to_string();
                if name == "." || name == ".." {
                    return None;
                }
                let modified = stat
                    .mtime
                    .and_then(|secs| chrono::DateTime::from_timestamp(secs as i64, 0));
                Some(if stat.is_dir() {
                    RemoteEntry::directory(path, &name, modified)
                } else {
                    RemoteEntry::file(path, &name, stat.size.unwrap_or(0), modified)
                })
            })
            .collect())
    }

    fn retrieve_file(&mut self, path: &str, sink: &mut RetrieveSink<'_>) -> Result<(), RemoteError> {
        let mut file = self.sftp()?.open(Path::new(path))?;
        let mut sink_error = None;
        let result = run_sink(sink, &mut file, &mut sink_error, |e| e);
        match (sink_error, result) {
            (Some(e), _) => Err(RemoteError::Io(e)),
            (None, Err(e)) => Err(RemoteError::Io(e)),
            (None, Ok(())) => Ok(()),
        }
    }

    fn store_file(&mut self, path: &str, reader: &mut dyn Read) -> Result<u64, RemoteError> {
        let mut file = self.sftp()?.create(Path::new(path))?;
        Ok(io::copy(reader, &mut file)?)
    }

    fn append_file(&mut self, path: &str, reader: &mut dyn Read) -> Result<u64, RemoteError> {
        let mut file = self.sftp()?.open_mode(
            Path::new(path),
            OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::CREATE,
            0o644,
            OpenType::File,
        )?;
        Ok(io::copy(reader, &mut file)?)
    }

    fn delete_file(&mut self, path: &str) -> Result<(), RemoteError> {
        Ok(self.sftp()?.unlink(Path::new(path))?)
    }

    fn rename_file(&mut self, from: &str, to: &str) -> Result<(), RemoteError> {
        Ok(self.sftp()?.rename(Path::new(from), Path::new(to), None)?)
    }

    fn build_directory(&mut self, path: &str, recursive: bool) -> Result<(), RemoteError> {
        let sftp = self.sftp()?;
        if !recursive {
            return Ok(sftp.mkdir(Path::new(path), 0o755)?);
        }
        for directory in ancestor_chain(path) {
            if sftp.stat(Path::new(&directory)).is_err() {
                sftp.mkdir(Path::new(&directory), 0o755)?;
            }
        }
        Ok(())
    }

    fn send_noop(&mut self) -> Result<bool, RemoteError> {
        match self.session.as_ref() {
            None => Ok(false),
            Some(session) => Ok(session.sftp.stat(Path::new(".")).is_ok()),
        }
    }

    fn endpoint(&self) -> String {
        self.settings.endpoint()
    }
}
