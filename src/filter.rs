//! Candidate filtering
//!
//! Checks run in a fixed order: hidden and read-lock files, custom predicates,
//! ant globs, exclusions, then inclusions. Exclusions always win.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use regex::Regex;
use std::fmt;
use std::sync::Arc;

use crate::entry::RemoteEntry;
use crate::error::ConfigError;

/// Postfix of the marker files written by the `exclusive` read lock
pub const LOCK_FILE_POSTFIX: &str = ".ftpollLock";
/// Postfix a file carries while the `rename` read lock holds it renamed away
pub const EXCLUSIVE_RENAME_POSTFIX: &str = ".ftpollExclusiveReadLock";

/// Custom predicate over listing entries
pub trait EntryFilter: Send + Sync {
    fn accept(&self, entry: &RemoteEntry) -> bool;
}

impl<F> EntryFilter for F
where
    F: Fn(&RemoteEntry) -> bool + Send + Sync,
{
    fn accept(&self, entry: &RemoteEntry) -> bool {
        self(entry)
    }
}

#[derive(Default, Clone)]
pub struct FileFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
    include_ext: Vec<String>,
    exclude_ext: Vec<String>,
    ant_include: Option<(String, GlobSet)>,
    ant_exclude: Option<(String, GlobSet)>,
    custom: Vec<Arc<dyn EntryFilter>>,
    directory_filter: Option<Arc<dyn EntryFilter>>,
    file_name: Option<String>,
}

impl FileFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Regex the whole file name must match
    pub fn include(mut self, pattern: &str) -> Result<Self, ConfigError> {
        self.include = Some(compile_anchored(pattern)?);
        Ok(self)
    }

    pub fn exclude(mut self, pattern: &str) -> Result<Self, ConfigError> {
        self.exclude = Some(compile_anchored(pattern)?);
        Ok(self)
    }

    /// Comma separated extensions, e.g. `txt,csv`; compared case-insensitively
    pub fn include_ext(mut self, extensions: &str) -> Self {
        self.include_ext = split_extensions(extensions);
        self
    }

    pub fn exclude_ext(mut self, extensions: &str) -> Self {
        self.exclude_ext = split_extensions(extensions);
        self
    }

    /// Comma separated ant-style globs matched on the relative path
    pub fn ant_include(mut self, patterns: &str) -> Result<Self, ConfigError> {
        self.ant_include = Some((patterns.to_string(), build_glob_set(patterns)?));
        Ok(self)
    }

    pub fn ant_exclude(mut self, patterns: &str) -> Result<Self, ConfigError> {
        self.ant_exclude = Some((patterns.to_string(), build_glob_set(patterns)?));
        Ok(self)
    }

    pub fn custom(mut self, filter: Arc<dyn EntryFilter>) -> Self {
        self.custom.push(filter);
        self
    }

    /// Predicate applied to directories before descending into them
    pub fn directory_filter(mut self, filter: Arc<dyn EntryFilter>) -> Self {
        self.directory_filter = Some(filter);
        self
    }

    /// Only this exact file name (relative path or bare name) is accepted
    pub fn file_name(mut self, name: &str) -> Self {
        self.file_name = Some(name.to_string());
        self
    }

    pub fn fixed_file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// Decides whether a listed directory is traversed
    pub fn accept_directory(&self, entry: &RemoteEntry) -> bool {
        if is_hidden(entry.file_name_only()) {
            return false;
        }
        match &self.directory_filter {
            Some(filter) => filter.accept(entry),
            None => true,
        }
    }

    /// Decides whether a listed file may become a candidate
    pub fn accept_file(&self, entry: &RemoteEntry) -> bool {
        let name = entry.file_name_only();
        if is_hidden(name) || name.ends_with(LOCK_FILE_POSTFIX) || name.ends_with(EXCLUSIVE_RENAME_POSTFIX) {
            return false;
        }
        if !self.custom.iter().all(|f| f.accept(entry)) {
            return false;
        }

        if let Some((_, globs)) = &self.ant_exclude {
            if globs.is_match(entry.relative_path()) {
                return false;
            }
        }
        if let Some((_, globs)) = &self.ant_include {
            if !globs.is_match(entry.relative_path()) {
                return false;
            }
        }

        if let Some(exclude) = &self.exclude {
            if exclude.is_match(name) {
                return false;
            }
        }
        if !self.exclude_ext.is_empty() && has_extension(name, &self.exclude_ext) {
            return false;
        }
        if let Some(include) = &self.include {
            if !include.is_match(name) {
                return false;
            }
        }
        if !self.include_ext.is_empty() && !has_extension(name, &self.include_ext) {
            return false;
        }

        match &self.file_name {
            Some(fixed) => fixed == entry.relative_path() || fixed == name,
            None => true,
        }
    }
}

impl fmt::Debug for FileFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileFilter")
            .field("include", &self.include.as_ref().map(|r| r.as_str()))
            .field("exclude", &self.exclude.as_ref().map(|r| r.as_str()))
            .field("include_ext", &self.include_ext)
            .field("exclude_ext", &self.exclude_ext)
            .field("ant_include", &self.ant_include.as_ref().map(|(p, _)| p))
            .field("ant_exclude", &self.ant_exclude.as_ref().map(|(p, _)| p))
            .field("custom", &self.custom.len())
            .field("directory_filter", &self.directory_filter.is_some())
            .field("file_name", &self.file_name)
            .finish()
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn compile_anchored(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| ConfigError::Regex {
        pattern: pattern.to_string(),
        source,
    })
}

fn split_extensions(extensions: &str) -> Vec<String> {
    extensions
        .split(',')
        .map(|e| e.trim().trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

fn has_extension(name: &str, extensions: &[String]) -> bool {
    let lower = name.to_lowercase();
    extensions
        .iter()
        .any(|ext| lower.ends_with(&format!(".{}", ext)))
}

fn build_glob_set(patterns: &str) -> Result<GlobSet, ConfigError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|source| ConfigError::Glob {
                pattern: pattern.to_string(),
                source,
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| ConfigError::Glob {
        pattern: patterns.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(relative: &str) -> RemoteEntry {
        RemoteEntry::file("/inbox", relative, 1, None)
    }

    #[test]
    fn test_hidden_and_lock_files_skipped() {
        let filter = FileFilter::new();
        assert!(filter.accept_file(&file("a.txt")));
        assert!(!filter.accept_file(&file(".hidden")));
        assert!(!filter.accept_file(&file("a.txt.ftpollLock")));
        assert!(!filter.accept_file(&file("a.txt.ftpollExclusiveReadLock")));
        assert!(!filter.accept_directory(&RemoteEntry::directory("/inbox", ".done", None)));
    }

    #[test]
    fn test_regex_is_anchored() {
        let filter = FileFilter::new().include(r".*\.txt").unwrap();
        assert!(filter.accept_file(&file("a.txt")));
        assert!(!filter.accept_file(&file("a.txt.bak")));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let filter = FileFilter::new()
            .include(r"report.*")
            .unwrap()
            .exclude(r".*\.tmp")
            .unwrap();
        assert!(filter.accept_file(&file("report-1.csv")));
        assert!(!filter.accept_file(&file("report-1.tmp")));
        assert!(!filter.accept_file(&file("other.csv")));
    }

    #[test]
    fn test_extensions_case_insensitive() {
        let filter = FileFilter::new().include_ext("txt, .CSV").exclude_ext("bak");
        assert!(filter.accept_file(&file("a.TXT")));
        assert!(filter.accept_file(&file("b.csv")));
        assert!(!filter.accept_file(&file("c.xml")));
        assert!(!filter.accept_file(&file("d.txt.bak")));
    }

    #[test]
    fn test_ant_globs_on_relative_path() {
        let filter = FileFilter::new()
            .ant_include("**/*.txt")
            .unwrap()
            .ant_exclude("tmp/**")
            .unwrap();
        assert!(filter.accept_file(&file("a/b/c.txt")));
        assert!(!filter.accept_file(&file("tmp/c.txt")));
        assert!(!filter.accept_file(&file("a/c.csv")));
    }

    #[test]
    fn test_custom_and_directory_filters() {
        let filter = FileFilter::new()
            .custom(Arc::new(|e: &RemoteEntry| e.size() > 0))
            .directory_filter(Arc::new(|e: &RemoteEntry| e.file_name_only() != "skip"));
        assert!(filter.accept_file(&file("a.txt")));
        assert!(!filter.accept_file(&RemoteEntry::file("/inbox", "empty.txt", 0, None)));
        assert!(!filter.accept_directory(&RemoteEntry::directory("/inbox", "skip", None)));
        assert!(filter.accept_directory(&RemoteEntry::directory("/inbox", "keep", None)));
    }

    #[test]
    fn test_fixed_file_name() {
        let filter = FileFilter::new().file_name("hello.txt");
        assert!(filter.accept_file(&file("hello.txt")));
        assert!(!filter.accept_file(&file("bye.txt")));
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        assert!(matches!(FileFilter::new().include("(oops"), Err(ConfigError::Regex { .. })));
        assert!(matches!(FileFilter::new().ant_include("a/{b"), Err(ConfigError::Glob { .. })));
    }
}
