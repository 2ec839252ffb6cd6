//! In-process remote file system
//!
//! `MemoryServer` holds a directory tree shared by any number of
//! `MemoryClient` sessions. It answers with FTP reply codes (550 for missing
//! files, 553 for refused names) and can inject connect, listing, retrieve
//! and delete failures, or drop every open session at once.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::{Clock, SystemClock};
use crate::entry::{file_name_of, normalize_path, parent_of, RemoteEntry};
use crate::error::{codes, RemoteError};
use crate::protocols::{ancestor_chain, RemoteFileOperations, RetrieveSink};

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ServerState {
    files: BTreeMap<String, MemoryFile>,
    directories: BTreeSet<String>,
    epoch: u64,
    connect_count: u32,
    connect_failures: Vec<Option<u32>>,
    list_failures: HashMap<String, u32>,
    retrieve_failures: HashMap<String, u32>,
    delete_failures: HashMap<String, u32>,
    rename_failures: HashMap<String, u32>,
}

#[derive(Clone)]
pub struct MemoryServer {
    name: String,
    state: Arc<Mutex<ServerState>>,
    clock: Arc<dyn Clock>,
}

impl MemoryServer {
    pub fn new(name: &str) -> Self {
        Self::with_clock(name, Arc::new(SystemClock))
    }

    /// Server stamping modification times from `clock`
    pub fn with_clock(name: &str, clock: Arc<dyn Clock>) -> Self {
        let mut state = ServerState::default();
        state.directories.insert("/".to_string());
        MemoryServer {
            name: name.to_string(),
            state: Arc::new(Mutex::new(state)),
            clock,
        }
    }

    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            server: self.clone(),
            connected_epoch: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Writes a file, creating missing parent directories
    pub fn put(&self, path: &str, data: impl AsRef<[u8]>) {
        let modified = self.clock.now();
        self.put_with_mtime(path, data, modified);
    }

    pub fn put_with_mtime(&self, path: &str, data: impl AsRef<[u8]>, modified: DateTime<Utc>) {
        let path = normalize_path(path);
        let mut state = self.lock();
        for directory in ancestor_chain(parent_of(&path)) {
            state.directories.insert(directory);
        }
        state.files.insert(
            path,
            MemoryFile {
                data: data.as_ref().to_vec(),
                modified,
            },
        );
    }

    /// Appends to a file (creating it), bumping its modification time
    pub fn append(&self, path: &str, data: impl AsRef<[u8]>) {
        let path = normalize_path(path);
        let now = self.clock.now();
        let mut state = self.lock();
        if let Some(file) = state.files.get_mut(&path) {
            file.data.extend_from_slice(data.as_ref());
            file.modified = now;
            return;
        }
        drop(state);
        self.put_with_mtime(&path, data, now);
    }

    pub fn mkdir(&self, path: &str) {
        let mut state = self.lock();
        for directory in ancestor_chain(&normalize_path(path)) {
            state.directories.insert(directory);
        }
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .files
            .get(&normalize_path(path))
            .map(|f| f.data.clone())
    }

    pub fn get_string(&self, path: &str) -> Option<String> {
        self.get(path).map(|d| String::from_utf8_lossy(&d).into_owned())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().files.contains_key(&normalize_path(path))
    }

    pub fn remove(&self, path: &str) {
        self.lock().files.remove(&normalize_path(path));
    }

    /// Absolute paths of every stored file, sorted
    pub fn files(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    pub fn set_modified(&self, path: &str, modified: DateTime<Utc>) {
        if let Some(file) = self.lock().files.get_mut(&normalize_path(path)) {
            file.modified = modified;
        }
    }

    /// Next connect attempts fail, one per entry, with the given reply code
    pub fn fail_connect(&self, attempts: u32, code: Option<u32>) {
        let mut state = self.lock();
        for _ in 0..attempts {
            state.connect_failures.push(code);
        }
    }

    /// Listing `path` fails `times` times with 550
    pub fn fail_list(&self, path: &str, times: u32) {
        self.lock().list_failures.insert(normalize_path(path), times);
    }

    pub fn fail_retrieve(&self, path: &str, times: u32) {
        self.lock()
            .retrieve_failures
            .insert(normalize_path(path), times);
    }

    /// Deleting `path` fails `times` times with 450
    pub fn fail_delete(&self, path: &str, times: u32) {
        self.lock().delete_failures.insert(normalize_path(path), times);
    }

    /// Renaming away from `path` fails `times` times with 450
    pub fn fail_rename(&self, path: &str, times: u32) {
        self.lock().rename_failures.insert(normalize_path(path), times);
    }

    /// Invalidates every open session, as a server restart would
    pub fn drop_connections(&self) {
        self.lock().epoch += 1;
    }

    pub fn connect_count(&self) -> u32 {
        self.lock().connect_count
    }
}

fn take_failure(failures: &mut HashMap<String, u32>, path: &str) -> bool {
    match failures.get_mut(path) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

fn not_found(path: &str) -> RemoteError {
    RemoteError::operation(
        Some(codes::FILE_UNAVAILABLE),
        format!("{}: No such file or directory", path),
    )
}

fn busy(path: &str) -> RemoteError {
    RemoteError::operation(
        Some(codes::FILE_ACTION_NOT_TAKEN),
        format!("{}: File busy", path),
    )
}

fn not_allowed(path: &str, reason: &str) -> RemoteError {
    RemoteError::operation(
        Some(codes::FILE_NAME_NOT_ALLOWED),
        format!("{}: {}", path, reason),
    )
}

/// One session against a `MemoryServer`
pub struct MemoryClient {
    server: MemoryServer,
    connected_epoch: Option<u64>,
}

impl MemoryClient {
    pub fn server(&self) -> &MemoryServer {
        &self.server
    }

    /// Locks server state after checking this session is still valid
    fn session(&mut self) -> Result<MutexGuard<'_, ServerState>, RemoteError> {
        let epoch = self
            .connected_epoch
            .ok_or_else(|| RemoteError::connection(None, "not connected"))?;
        let state = self.server.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.epoch != epoch {
            drop(state);
            self.connected_epoch = None;
            return Err(RemoteError::from_reply(
                codes::SERVICE_NOT_AVAILABLE,
                "Service not available, closing control connection",
            ));
        }
        Ok(state)
    }

    fn write(&mut self, path: &str, reader: &mut dyn Read, append: bool) -> Result<u64, RemoteError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        let written = data.len() as u64;
        let path = normalize_path(path);
        let now = self.server.clock.now();
        let mut state = self.session()?;
        if !state.directories.contains(parent_of(&path)) {
            return Err(not_allowed(&path, "parent directory does not exist"));
        }
        if state.directories.contains(&path) {
            return Err(not_allowed(&path, "is a directory"));
        }
        match state.files.get_mut(&path) {
            Some(file) if append => {
                file.data.extend_from_slice(&data);
                file.modified = now;
            }
            _ => {
                state.files.insert(path, MemoryFile { data, modified: now });
            }
        }
        Ok(written)
    }
}

impl RemoteFileOperations for MemoryClient {
    fn connect(&mut self) -> Result<(), RemoteError> {
        if self.connected_epoch.is_some() && self.session().is_ok() {
            return Ok(());
        }
        let mut state = self.server.lock();
        state.connect_count += 1;
        if !state.connect_failures.is_empty() {
            let code = state.connect_failures.remove(0);
            return Err(match code {
                Some(code) => RemoteError::connection(Some(code), "Login incorrect"),
                None => RemoteError::connection(None, "Connection refused"),
            });
        }
        self.connected_epoch = Some(state.epoch);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected_epoch.is_some()
    }

    fn disconnect(&mut self) {
        self.connected_epoch = None;
    }

    fn list_files(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let directory = normalize_path(path);
        let mut state = self.session()?;
        if take_failure(&mut state.list_failures, &directory) {
            return Err(RemoteError::operation(
                Some(codes::FILE_UNAVAILABLE),
                format!("{}: Permission denied", directory),
            ));
        }
        if !state.directories.contains(&directory) {
            return Err(not_found(&directory));
        }

        let mut entries = Vec::new();
        for sub in state.directories.iter() {
            if sub != "/" && parent_of(sub) == directory {
                entries.push(RemoteEntry::directory(&directory, file_name_of(sub), None));
            }
        }
        for (file_path, file) in state.files.iter() {
            if parent_of(file_path) == directory {
                entries.push(RemoteEntry::file(
                    &directory,
                    file_name_of(file_path),
                    file.data.len() as u64,
                    Some(file.modified),
                ));
            }
        }
        Ok(entries)
    }

    fn retrieve_file(&mut self, path: &str, sink: &mut RetrieveSink<'_>) -> Result<(), RemoteError> {
        let path = normalize_path(path);
        let data = {
            let mut state = self.session()?;
            if take_failure(&mut state.retrieve_failures, &path) {
                return Err(RemoteError::from_reply(
                    codes::TRANSFER_ABORTED,
                    "Connection closed; transfer aborted",
                ));
            }
            state
                .files
                .get(&path)
                .map(|f| f.data.clone())
                .ok_or_else(|| not_found(&path))?
        };
        sink(&mut Cursor::new(data))?;
        Ok(())
    }

    fn store_file(&mut self, path: &str, reader: &mut dyn Read) -> Result<u64, RemoteError> {
        self.write(path, reader, false)
    }

    fn append_file(&mut self, path: &str, reader: &mut dyn Read) -> Result<u64, RemoteError> {
        self.write(path, reader, true)
    }

    fn delete_file(&mut self, path: &str) -> Result<(), RemoteError> {
        let path = normalize_path(path);
        let mut state = self.session()?;
        if take_failure(&mut state.delete_failures, &path) {
            return Err(busy(&path));
        }
        state.files.remove(&path).map(|_| ()).ok_or_else(|| not_found(&path))
    }

    fn rename_file(&mut self, from: &str, to: &str) -> Result<(), RemoteError> {
        let from = normalize_path(from);
        let to = normalize_path(to);
        let mut state = self.session()?;
        if take_failure(&mut state.rename_failures, &from) {
            return Err(busy(&from));
        }
        if !state.files.contains_key(&from) {
            return Err(not_found(&from));
        }
        if state.files.contains_key(&to) || state.directories.contains(&to) {
            return Err(not_allowed(&to, "target exists"));
        }
        if !state.directories.contains(parent_of(&to)) {
            return Err(not_allowed(&to, "parent directory does not exist"));
        }
        if let Some(file) = state.files.remove(&from) {
            state.files.insert(to, file);
        }
        Ok(())
    }

    fn build_directory(&mut self, path: &str, recursive: bool) -> Result<(), RemoteError> {
        let path = normalize_path(path);
        let mut state = self.session()?;
        if recursive {
            for directory in ancestor_chain(&path) {
                if state.files.contains_key(&directory) {
                    return Err(not_allowed(&directory, "is a file"));
                }
                state.directories.insert(directory);
            }
            return Ok(());
        }
        if state.directories.contains(&path) {
            return Err(RemoteError::operation(
                Some(codes::FILE_UNAVAILABLE),
                format!("{}: File exists", path),
            ));
        }
        if !state.directories.contains(parent_of(&path)) {
            return Err(not_found(parent_of(&path)));
        }
        state.directories.insert(path);
        Ok(())
    }

    fn exists_file(&mut self, path: &str) -> Result<bool, RemoteError> {
        let path = normalize_path(path);
        Ok(self.session()?.files.contains_key(&path))
    }

    fn send_noop(&mut self) -> Result<bool, RemoteError> {
        if self.connected_epoch.is_none() {
            return Ok(false);
        }
        match self.session() {
            Ok(_) => Ok(true),
            Err(e) if e.is_connection_error() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn endpoint(&self) -> String {
        format!("memory://{}", self.server.name)
    }
}
