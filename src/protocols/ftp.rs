//! Plain FTP backend
//!
//! `FtpClient` implements `RemoteFileOperations` over an unencrypted
//! `suppaftp::FtpStream`.

use secrecy::ExposeSecret;
use std::io::Read;
use std::str::FromStr;
use suppaftp::types::{FileType, Mode};
use suppaftp::FtpStream;

use crate::entry::RemoteEntry;
use crate::error::RemoteError;
use crate::protocols::{
    ancestor_chain, resolve_addrs, run_sink, ConnectionSettings, RemoteFileOperations,
    RetrieveSink,
};

/// FTP client for plain (unencrypted) FTP connections
pub struct FtpClient {
    settings: ConnectionSettings,
    stream: Option<FtpStream>,
}

impl FtpClient {
    pub fn new(settings: ConnectionSettings) -> Self {
        FtpClient {
            settings,
            stream: None,
        }
    }

    fn open(&self) -> Result<FtpStream, RemoteError> {
        let addrs = resolve_addrs(&self.settings.host, self.settings.port)?;

        // Try each address until one succeeds
        let mut last_error = None;
        for addr in addrs {
            match FtpStream::connect_timeout(addr, self.settings.timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .map(RemoteError::from)
            .unwrap_or_else(|| RemoteError::connection(None, "no addresses available")))
    }

    fn stream(&mut self) -> Result<&mut FtpStream, RemoteError> {
        self.stream
            .as_mut()
            .ok_or_else(|| RemoteError::connection(None, "not connected"))
    }
}

impl RemoteFileOperations for FtpClient {
    fn connect(&mut self) -> Result<(), RemoteError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let mut stream = self.open()?;
        let password = self
            .settings
            .password
            .as_ref()
            .map(|p| p.expose_secret().as_str())
            .unwrap_or("");
        stream.login(self.settings.login.as_str(), password)?;
        stream.transfer_type(FileType::Binary)?;
        stream.set_mode(if self.settings.passive {
            Mode::Passive
        } else {
            Mode::Active
        });
        stream
            .get_ref()
            .set_read_timeout(Some(self.settings.timeout))
            .map_err(|e| RemoteError::connection(None, e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.quit();
        }
    }

    fn list_files(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let lines = self.stream()?.list(Some(path))?;
        Ok(parse_listing(path, &lines))
    }

    fn retrieve_file(&mut self, path: &str, sink: &mut RetrieveSink<'_>) -> Result<(), RemoteError> {
        let mut sink_error = None;
        let result = self.stream()?.retr(path, |reader| {
            run_sink(sink, reader, &mut sink_error, suppaftp::FtpError::ConnectionError)
        });
        if let Some(e) = sink_error {
            return Err(RemoteError::Io(e));
        }
        result.map_err(RemoteError::from)
    }

    fn store_file(&mut self, path: &str, mut reader: &mut dyn Read) -> Result<u64, RemoteError> {
        Ok(self.stream()?.put_file(path, &mut reader)?)
    }

    fn append_file(&mut self, path: &str, mut reader: &mut dyn Read) -> Result<u64, RemoteError> {
        Ok(self.stream()?.append_file(path, &mut reader)?)
    }

    fn delete_file(&mut self, path: &str) -> Result<(), RemoteError> {
        Ok(self.stream()?.rm(path)?)
    }

    fn rename_file(&mut self, from: &str, to: &str) -> Result<(), RemoteError> {
        Ok(self.stream()?.rename(from, to)?)
    }

    fn build_directory(&mut self, path: &str, recursive: bool) -> Result<(), RemoteError> {
        let stream = self.stream()?;
        if !recursive {
            return Ok(stream.mkdir(path)?);
        }
        for directory in ancestor_chain(path) {
            // existing directories answer 550
            if let Err(e) = stream.mkdir(&directory) {
                let e = RemoteError::from(e);
                if e.is_connection_error() {
                    return Err(e);
                }
            }
        }
        Ok(stream.cwd(path)?)
    }

    fn send_noop(&mut self) -> Result<bool, RemoteError> {
        match self.stream.as_mut() {
            None => Ok(false),
            Some(stream) => match stream.noop() {
                Ok(()) => Ok(true),
                Err(e) => {
                    let e = RemoteError::from(e);
                    if e.is_connection_error() {
                        Ok(false)
                    } else {
                        Err(e)
                    }
                }
            },
        }
    }

    fn endpoint(&self) -> String {
        self.settings.endpoint()
    }
}

/// Converts `LIST` lines into entries relative to `directory`
///
/// Unparseable lines and the `.`/`..` entries are dropped.
pub(crate) fn parse_listing(directory: &str, lines: &[String]) -> Vec<RemoteEntry> {
    lines
        .iter()
        .filter_map(|line| suppaftp::list::File::from_str(line).ok())
        .filter(|file| file.name() != "." && file.name() != "..")
        .map(|file| {
            let modified = Some(chrono::DateTime::<chrono::Utc>::from(file.modified()));
            if file.is_directory() {
                RemoteEntry::directory(directory, file.name(), modified)
            } else {
                RemoteEntry::file(directory, file.name(), file.size() as u64, modified)
            }
        })
        .collect()
}

impl Drop for FtpClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ftp_client_send() {
        fn assert_send<T: Send>() {}
        assert_send::<FtpClient>();
    }

    #[test]
    fn test_parse_unix_listing() {
        let lines = vec![
            "drwxr-xr-x    2 ftp      ftp          4096 Jan 02  2023 archive".to_string(),
            "-rw-r--r--    1 ftp      ftp            11 Jan 02  2023 hello.txt".to_string(),
            "drwxr-xr-x    2 ftp      ftp          4096 Jan 02  2023 .".to_string(),
            "total 8".to_string(),
        ];
        let entries = parse_listing("/inbox", &lines);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_directory());
        assert_eq!(entries[0].absolute_path(), "/inbox/archive");
        assert_eq!(entries[1].file_name_only(), "hello.txt");
        assert_eq!(entries[1].size(), 11);
        assert!(entries[1].last_modified().is_some());
    }
}
