//! Idempotent (already-processed) key repositories
//!
//! `add` is the test-and-set used to gate delivery: it returns `true` for
//! exactly one caller per key. Keys start out pending; `confirm` makes them
//! permanent once the file has been committed, `remove` forgets them on
//! rollback. Only confirmed keys count against capacity and are evicted.

use fs2::FileExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::logging::log;

/// Default number of confirmed keys kept in memory
pub const DEFAULT_CACHE_SIZE: usize = 1000;

pub trait IdempotentRepository: Send + Sync {
    /// Registers `key`; `false` if it is already known (pending or confirmed)
    fn add(&self, key: &str) -> bool;

    fn contains(&self, key: &str) -> bool;

    fn remove(&self, key: &str) -> bool;

    /// Makes a pending key permanent
    fn confirm(&self, _key: &str) -> bool {
        true
    }

    fn clear(&self);
}

/// Confirmed keys in least-recently-used order plus unevictable pending keys
#[derive(Debug, Default)]
struct LruKeys {
    capacity: usize,
    tick: u64,
    confirmed: HashMap<String, u64>,
    order: BTreeMap<u64, String>,
    pending: HashSet<String>,
}

impl LruKeys {
    fn new(capacity: usize) -> Self {
        LruKeys {
            capacity,
            ..Default::default()
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(stamp) = self.confirmed.get_mut(key) {
            self.order.remove(stamp);
            self.tick += 1;
            *stamp = self.tick;
            self.order.insert(self.tick, key.to_string());
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.pending.contains(key) || self.confirmed.contains_key(key)
    }

    fn add_pending(&mut self, key: &str) -> bool {
        if self.confirmed.contains_key(key) {
            self.touch(key);
            return false;
        }
        self.pending.insert(key.to_string())
    }

    /// Inserts as confirmed; returns evicted keys
    fn insert_confirmed(&mut self, key: &str) -> Vec<String> {
        self.pending.remove(key);
        if self.confirmed.contains_key(key) {
            self.touch(key);
            return Vec::new();
        }
        self.tick += 1;
        self.confirmed.insert(key.to_string(), self.tick);
        self.order.insert(self.tick, key.to_string());

        let mut evicted = Vec::new();
        while self.capacity > 0 && self.confirmed.len() > self.capacity {
            let oldest = match self.order.keys().next() {
                Some(stamp) => *stamp,
                None => break,
            };
            if let Some(old_key) = self.order.remove(&oldest) {
                self.confirmed.remove(&old_key);
                evicted.push(old_key);
            }
        }
        evicted
    }

    /// Removes the key; returns whether it was confirmed
    fn remove(&mut self, key: &str) -> Option<bool> {
        if self.pending.remove(key) {
            return Some(false);
        }
        let stamp = self.confirmed.remove(key)?;
        self.order.remove(&stamp);
        Some(true)
    }

    fn clear(&mut self) {
        self.confirmed.clear();
        self.order.clear();
        self.pending.clear();
    }

    fn confirmed_in_order(&self) -> impl Iterator<Item = &String> {
        self.order.values()
    }
}

/// Bounded in-memory repository
#[derive(Debug)]
pub struct MemoryIdempotentRepository {
    keys: Mutex<LruKeys>,
}

impl MemoryIdempotentRepository {
    /// `capacity` 0 means unbounded
    pub fn new(capacity: usize) -> Self {
        MemoryIdempotentRepository {
            keys: Mutex::new(LruKeys::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruKeys> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        let keys = self.lock();
        keys.confirmed.len() + keys.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryIdempotentRepository {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

impl IdempotentRepository for MemoryIdempotentRepository {
    fn add(&self, key: &str) -> bool {
        self.lock().add_pending(key)
    }

    fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    fn confirm(&self, key: &str) -> bool {
        self.lock().insert_confirmed(key);
        true
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

/// Repository persisted to a text file, one confirmed key per line
///
/// The whole file is loaded on open. Confirmations append a line; removals
/// and evictions rewrite the file. Every write holds an exclusive `flock` so
/// several processes can share one file.
#[derive(Debug)]
pub struct FileIdempotentRepository {
    path: PathBuf,
    keys: Mutex<LruKeys>,
}

impl FileIdempotentRepository {
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut keys = LruKeys::new(capacity);
        let mut trimmed = false;

        match File::open(&path) {
            Ok(file) => {
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    let key = line.trim();
                    if !key.is_empty() {
                        trimmed |= !keys.insert_confirmed(key).is_empty();
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
            }
            Err(e) => return Err(e),
        }

        let repository = FileIdempotentRepository {
            path,
            keys: Mutex::new(keys),
        };
        if trimmed {
            let keys = repository.lock();
            repository.rewrite(&keys)?;
        }
        Ok(repository)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, LruKeys> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn append_line(&self, key: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let result = writeln!(file, "{}", key);
        let _ = file.unlock();
        result
    }

    fn rewrite(&self, keys: &LruKeys) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let result = (|| {
            file.set_len(0)?;
            let mut content = String::new();
            for key in keys.confirmed_in_order() {
                content.push_str(key);
                content.push('\n');
            }
            file.write_all(content.as_bytes())?;
            file.sync_data()
        })();
        let _ = file.unlock();
        result
    }

    fn persist_failed(&self, action: &str, e: io::Error) {
        let _ = log(&format!(
            "Error: cannot {} idempotent repository {}: {}",
            action,
            self.path.display(),
            e
        ));
    }
}

impl IdempotentRepository for FileIdempotentRepository {
    fn add(&self, key: &str) -> bool {
        self.lock().add_pending(key)
    }

    fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    fn remove(&self, key: &str) -> bool {
        let mut keys = self.lock();
        match keys.remove(key) {
            None => false,
            Some(false) => true,
            Some(true) => {
                if let Err(e) = self.rewrite(&keys) {
                    self.persist_failed("rewrite", e);
                }
                true
            }
        }
    }

    fn confirm(&self, key: &str) -> bool {
        let mut keys = self.lock();
        let already = keys.confirmed.contains_key(key);
        let evicted = keys.insert_confirmed(key);
        let result = if !evicted.is_empty() {
            self.rewrite(&keys)
        } else if !already {
            self.append_line(key)
        } else {
            Ok(())
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                self.persist_failed("update", e);
                false
            }
        }
    }

    fn clear(&self) {
        let mut keys = self.lock();
        keys.clear();
        if let Err(e) = self.rewrite(&keys) {
            self.persist_failed("clear", e);
        }
    }
}

/// Keys of files currently being handled within one poll
#[derive(Debug, Default)]
pub struct InProgressRepository {
    keys: Mutex<HashSet<String>>,
}

impl InProgressRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, key: &str) -> bool {
        self.lock().insert(key.to_string())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_add_is_test_and_set() {
        let repo = MemoryIdempotentRepository::new(10);
        assert!(repo.add("a"));
        assert!(!repo.add("a"));
        assert!(repo.contains("a"));
        assert!(repo.remove("a"));
        assert!(!repo.contains("a"));
        assert!(repo.add("a"));
    }

    #[test]
    fn test_eviction_spares_pending_keys() {
        let repo = MemoryIdempotentRepository::new(2);
        assert!(repo.add("in-flight"));
        for key in ["a", "b", "c"] {
            assert!(repo.add(key));
            repo.confirm(key);
        }
        // "a" was the least recently confirmed key
        assert!(!repo.contains("a"));
        assert!(repo.contains("b"));
        assert!(repo.contains("c"));
        assert!(repo.contains("in-flight"));
    }

    #[test]
    fn test_duplicate_add_refreshes_lru_position() {
        let repo = MemoryIdempotentRepository::new(2);
        repo.add("a");
        repo.confirm("a");
        repo.add("b");
        repo.confirm("b");
        assert!(!repo.add("a"));
        repo.add("c");
        repo.confirm("c");
        assert!(repo.contains("a"));
        assert!(!repo.contains("b"));
    }

    #[test]
    fn test_concurrent_add_single_winner() {
        let repo = Arc::new(MemoryIdempotentRepository::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let repo = Arc::clone(&repo);
                thread::spawn(move || repo.add("same-key"))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_file_repository_persists_confirmed_keys_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("idempotent.txt");
        {
            let repo = FileIdempotentRepository::open(&path, 100).unwrap();
            assert!(repo.add("/inbox/a.txt"));
            assert!(repo.confirm("/inbox/a.txt"));
            assert!(repo.add("/inbox/pending.txt"));
        }
        let repo = FileIdempotentRepository::open(&path, 100).unwrap();
        assert!(repo.contains("/inbox/a.txt"));
        assert!(!repo.contains("/inbox/pending.txt"));
        assert!(!repo.add("/inbox/a.txt"));

        assert!(repo.remove("/inbox/a.txt"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.is_empty());
    }

    #[test]
    fn test_file_repository_trims_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.txt");
        std::fs::write(&path, "a\nb\nc\n").unwrap();
        let repo = FileIdempotentRepository::open(&path, 2).unwrap();
        assert!(!repo.contains("a"));
        assert!(repo.contains("c"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "b\nc\n");
    }

    #[test]
    fn test_in_progress_repository() {
        let repo = InProgressRepository::new();
        assert!(repo.add("k"));
        assert!(!repo.add("k"));
        assert!(repo.remove("k"));
        assert!(repo.is_empty());
    }
}
