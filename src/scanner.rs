//! Directory scanning
//!
//! One scan lists the starting directory (and sub-directories when
//! recursive), keeps the files that pass the filter, the done-file gate and
//! the caller's own check, then sorts and limits them. Depth 0 is the starting
//! directory; a file directly inside it has depth 1.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::done_file::DoneFileName;
use crate::entry::{join_path, RemoteEntry};
use crate::error::RemoteError;
use crate::filter::FileFilter;
use crate::logging::debug;
use crate::protocols::RemoteFileOperations;
use crate::sorting::{shuffle, Sorter};

/// Decides whether a failed directory listing is skipped (`true`) or aborts
/// the scan (`false`). Connection errors always abort.
pub type ListFailureHandler = Arc<dyn Fn(&str, &RemoteError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ScanOptions {
    pub directory: String,
    pub recursive: bool,
    pub min_depth: usize,
    pub max_depth: usize,
    pub filter: FileFilter,
    pub done_file: Option<DoneFileName>,
    pub sorter: Sorter,
    pub shuffle: bool,
    /// When false, `filter.fixed_file_name()` is used without listing
    pub use_list: bool,
    pub ignore_file_not_found_or_permission_error: bool,
    pub on_list_failure: Option<ListFailureHandler>,
    /// Zero means no limit
    pub max_messages_per_poll: usize,
    /// Stop listing as soon as the limit is reached instead of sorting the
    /// whole set first
    pub eager_max_messages_per_poll: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            directory: "/".to_string(),
            recursive: false,
            min_depth: 0,
            max_depth: usize::MAX,
            filter: FileFilter::default(),
            done_file: None,
            sorter: Sorter::default(),
            shuffle: false,
            use_list: true,
            ignore_file_not_found_or_permission_error: false,
            on_list_failure: None,
            max_messages_per_poll: 0,
            eager_max_messages_per_poll: true,
        }
    }
}

impl fmt::Debug for ScanOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanOptions")
            .field("directory", &self.directory)
            .field("recursive", &self.recursive)
            .field("min_depth", &self.min_depth)
            .field("max_depth", &self.max_depth)
            .field("filter", &self.filter)
            .field("done_file", &self.done_file)
            .field("sorter", &self.sorter)
            .field("use_list", &self.use_list)
            .field("max_messages_per_poll", &self.max_messages_per_poll)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ScanResult {
    /// Files to process, in processing order
    pub candidates: Vec<RemoteEntry>,
    /// More files were available than `max_messages_per_poll` allowed
    pub limit_hit: bool,
    /// Directories whose listing failed and was skipped
    pub skipped_directories: Vec<String>,
}

pub struct DirectoryScanner {
    options: ScanOptions,
}

impl DirectoryScanner {
    pub fn new(options: ScanOptions) -> Self {
        DirectoryScanner { options }
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Produces the ordered candidates of one poll
    ///
    /// `accept` is consulted last for every file that passed the filters;
    /// the consumer uses it to drop in-progress and already consumed files.
    pub fn scan(
        &self,
        ops: &mut dyn RemoteFileOperations,
        now: DateTime<Utc>,
        accept: &mut dyn FnMut(&RemoteEntry) -> bool,
    ) -> Result<ScanResult, RemoteError> {
        let mut result = ScanResult::default();
        let mut seen = HashSet::new();

        match (self.options.use_list, self.options.filter.fixed_file_name()) {
            (false, Some(name)) => {
                let entry = RemoteEntry::file(&self.options.directory, name, 0, None);
                if accept(&entry) {
                    result.candidates.push(entry);
                }
            }
            _ => {
                self.poll_directory(ops, "", accept, &mut seen, &mut result)?;
            }
        }

        self.options.sorter.sort(&mut result.candidates, now);
        if self.options.shuffle {
            shuffle(&mut result.candidates);
        }
        let limit = self.options.max_messages_per_poll;
        if limit > 0 && result.candidates.len() > limit {
            debug(&format!(
                "Limiting poll to {} of {} file(s)",
                limit,
                result.candidates.len()
            ));
            result.candidates.truncate(limit);
            result.limit_hit = true;
        }
        Ok(result)
    }

    /// Returns false once the eager limit stops the scan
    fn poll_directory(
        &self,
        ops: &mut dyn RemoteFileOperations,
        relative_dir: &str,
        accept: &mut dyn FnMut(&RemoteEntry) -> bool,
        seen: &mut HashSet<String>,
        result: &mut ScanResult,
    ) -> Result<bool, RemoteError> {
        let absolute_dir = join_path(&self.options.directory, relative_dir);
        let listing = match ops.list_files(&absolute_dir) {
            Ok(listing) => listing,
            Err(e) => {
                if !e.is_connection_error() && self.continue_after_failure(&absolute_dir, &e) {
                    debug(&format!("Skipping directory {}: {}", absolute_dir, e));
                    result.skipped_directories.push(absolute_dir);
                    return Ok(true);
                }
                return Err(e);
            }
        };

        let entries: Vec<RemoteEntry> = listing
            .iter()
            .filter(|e| e.file_name_only() != "." && e.file_name_only() != "..")
            .map(|e| e.rebased(&self.options.directory, relative_dir))
            .collect();
        let names: HashSet<&str> = entries
            .iter()
            .filter(|e| !e.is_directory())
            .map(|e| e.file_name_only())
            .collect();

        for entry in &entries {
            if self.eager_limit_reached(result) {
                result.limit_hit = true;
                return Ok(false);
            }
            let depth = entry.depth();

            if entry.is_directory() {
                if self.options.recursive
                    && depth < self.options.max_depth
                    && self.options.filter.accept_directory(entry)
                {
                    let sub = entry.relative_path().to_string();
                    if !self.poll_directory(ops, &sub, accept, seen, result)? {
                        return Ok(false);
                    }
                }
                continue;
            }

            if depth < self.options.min_depth || depth > self.options.max_depth {
                continue;
            }
            if !self.options.filter.accept_file(entry) {
                continue;
            }
            if let Some(done_file) = &self.options.done_file {
                if done_file.is_done_file(entry.file_name_only()) {
                    continue;
                }
                let marker = done_file.done_file_for(entry.file_name_only());
                if !names.contains(marker.as_str()) {
                    debug(&format!(
                        "Done file {} not present, skipping {}",
                        marker,
                        entry.absolute_path()
                    ));
                    continue;
                }
            }
            if !seen.insert(entry.absolute_path()) {
                continue;
            }
            if accept(entry) {
                result.candidates.push(entry.clone());
            }
        }
        Ok(true)
    }

    fn eager_limit_reached(&self, result: &ScanResult) -> bool {
        let limit = self.options.max_messages_per_poll;
        self.options.eager_max_messages_per_poll && limit > 0 && result.candidates.len() >= limit
    }

    fn continue_after_failure(&self, directory: &str, error: &RemoteError) -> bool {
        match &self.options.on_list_failure {
            Some(handler) => handler(directory, error),
            None => {
                self.options.ignore_file_not_found_or_permission_error
                    && (error.is_not_found() || error.is_permission_denied())
            }
        }
    }
}
