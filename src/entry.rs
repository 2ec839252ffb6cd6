//! Remote directory entries and per-candidate read-lock bookkeeping

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::clock::elapsed;

/// Separator used in every path the consumer produces, whatever the server OS
pub const SEPARATOR: char = '/';

/// One server-reported directory entry
///
/// `file_name_only` is always the final segment of `relative_path`, and both
/// use `/` as separator. Entries are rebuilt on every listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    starting_directory: String,
    relative_path: String,
    file_name_only: String,
    is_directory: bool,
    size: u64,
    last_modified: Option<DateTime<Utc>>,
}

impl RemoteEntry {
    pub fn file(
        starting_directory: &str,
        relative_path: &str,
        size: u64,
        last_modified: Option<DateTime<Utc>>,
    ) -> Self {
        Self::build(starting_directory, relative_path, false, size, last_modified)
    }

    pub fn directory(
        starting_directory: &str,
        relative_path: &str,
        last_modified: Option<DateTime<Utc>>,
    ) -> Self {
        Self::build(starting_directory, relative_path, true, 0, last_modified)
    }

    fn build(
        starting_directory: &str,
        relative_path: &str,
        is_directory: bool,
        size: u64,
        last_modified: Option<DateTime<Utc>>,
    ) -> Self {
        let relative_path = normalize_path(relative_path)
            .trim_start_matches(SEPARATOR)
            .to_string();
        let file_name_only = file_name_of(&relative_path).to_string();
        RemoteEntry {
            starting_directory: normalize_path(starting_directory),
            relative_path,
            file_name_only,
            is_directory,
            size,
            last_modified,
        }
    }

    /// Re-anchors a raw listing entry under the scan's starting directory
    ///
    /// Listings report names relative to the listed directory; the scanner
    /// needs them relative to where the scan started.
    pub fn rebased(&self, starting_directory: &str, relative_dir: &str) -> Self {
        let relative = join_path(relative_dir, &self.file_name_only);
        Self::build(
            starting_directory,
            &relative,
            self.is_directory,
            self.size,
            self.last_modified,
        )
    }

    /// Same file after a rename to `absolute_target`
    pub fn moved_to(&self, absolute_target: &str) -> Self {
        let target = normalize_path(absolute_target);
        let relative = match strip_directory(&target, &self.starting_directory) {
            Some(rest) => rest.to_string(),
            None => target.clone(),
        };
        let starting = if strip_directory(&target, &self.starting_directory).is_some() {
            self.starting_directory.clone()
        } else {
            String::new()
        };
        Self::build(&starting, &relative, self.is_directory, self.size, self.last_modified)
    }

    pub fn with_stat(mut self, size: u64, last_modified: Option<DateTime<Utc>>) -> Self {
        self.size = size;
        self.last_modified = last_modified;
        self
    }

    pub fn starting_directory(&self) -> &str {
        &self.starting_directory
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn file_name_only(&self) -> &str {
        &self.file_name_only
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    pub fn absolute_path(&self) -> String {
        join_path(&self.starting_directory, &self.relative_path)
    }

    /// Absolute directory holding this entry
    pub fn parent(&self) -> String {
        parent_of(&self.absolute_path()).to_string()
    }

    /// Directory of this entry relative to the starting directory ("" at top level)
    pub fn relative_parent(&self) -> &str {
        parent_of(&self.relative_path)
    }

    /// Depth below the starting directory; a top-level file has depth 1
    pub fn depth(&self) -> usize {
        self.relative_path.split(SEPARATOR).filter(|s| !s.is_empty()).count()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_modified.map(|modified| elapsed(now, modified))
    }
}

/// Mutable record a read-lock strategy keeps across repeated checks of one candidate
#[derive(Debug, Clone)]
pub struct ReadLockState {
    pub candidate: RemoteEntry,
    /// Size of the current (not yet proven stable) sample
    pub first_observed_size: Option<u64>,
    /// Modification time of the current sample
    pub first_observed_mod_time: Option<DateTime<Utc>>,
    /// When the current size/mtime pair was first seen
    pub first_observed_at: Option<DateTime<Utc>>,
    pub checks_started_at: DateTime<Utc>,
    pub check_count: u32,
    /// Set by strategies that take an external claim (marker file, repository key)
    pub claimed: bool,
}

impl ReadLockState {
    pub fn new(candidate: RemoteEntry, now: DateTime<Utc>) -> Self {
        ReadLockState {
            candidate,
            first_observed_size: None,
            first_observed_mod_time: None,
            first_observed_at: None,
            checks_started_at: now,
            check_count: 0,
            claimed: false,
        }
    }

    /// Records a sample; returns how long the pair has been unchanged
    pub fn observe(
        &mut self,
        size: u64,
        modified: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        self.check_count += 1;
        let unchanged = self.first_observed_size == Some(size)
            && self.first_observed_mod_time == modified
            && self.first_observed_at.is_some();
        if unchanged {
            self.first_observed_at.map(|since| elapsed(now, since))
        } else {
            self.first_observed_size = Some(size);
            self.first_observed_mod_time = modified;
            self.first_observed_at = Some(now);
            None
        }
    }
}

/// Normalises separators: `\` becomes `/`, duplicate and `.` segments vanish,
/// `..` pops a segment when one is available. A leading `/` is kept.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with(SEPARATOR);
    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split(SEPARATOR) {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(segments.last(), Some(last) if *last != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }
    let joined = segments.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Joins a directory and a relative name; an absolute `name` wins
pub fn join_path(directory: &str, name: &str) -> String {
    if name.starts_with(SEPARATOR) || directory.is_empty() {
        return normalize_path(name);
    }
    if name.is_empty() {
        return normalize_path(directory);
    }
    normalize_path(&format!("{}/{}", directory, name))
}

pub fn parent_of(path: &str) -> &str {
    match path.rfind(SEPARATOR) {
        Some(0) => "/",
        Some(index) => &path[..index],
        None => "",
    }
}

pub fn file_name_of(path: &str) -> &str {
    match path.rfind(SEPARATOR) {
        Some(index) => &path[index + 1..],
        None => path,
    }
}

fn strip_directory<'a>(path: &'a str, directory: &str) -> Option<&'a str> {
    if directory.is_empty() {
        return Some(path.trim_start_matches(SEPARATOR));
    }
    if directory == "/" {
        return path.strip_prefix('/');
    }
    path.strip_prefix(directory)
        .and_then(|rest| rest.strip_prefix(SEPARATOR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("inbox\\sub\\a.txt"), "inbox/sub/a.txt");
        assert_eq!(normalize_path("/inbox//sub/./a.txt"), "/inbox/sub/a.txt");
        assert_eq!(normalize_path("/inbox/sub/../a.txt"), "/inbox/a.txt");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("../up"), "../up");
    }

    #[test]
    fn test_join_and_parent() {
        assert_eq!(join_path("/inbox", "a.txt"), "/inbox/a.txt");
        assert_eq!(join_path("/", "a.txt"), "/a.txt");
        assert_eq!(join_path("", "a.txt"), "a.txt");
        assert_eq!(join_path("/inbox", "/archive/a.txt"), "/archive/a.txt");
        assert_eq!(parent_of("/inbox/a.txt"), "/inbox");
        assert_eq!(parent_of("/a.txt"), "/");
        assert_eq!(parent_of("a.txt"), "");
    }

    #[test]
    fn test_entry_invariants() {
        let entry = RemoteEntry::file("/inbox", "sub\\deeper\\report.csv", 10, None);
        assert_eq!(entry.relative_path(), "sub/deeper/report.csv");
        assert_eq!(entry.file_name_only(), "report.csv");
        assert_eq!(entry.absolute_path(), "/inbox/sub/deeper/report.csv");
        assert_eq!(entry.parent(), "/inbox/sub/deeper");
        assert_eq!(entry.relative_parent(), "sub/deeper");
        assert_eq!(entry.depth(), 3);
    }

    #[test]
    fn test_rebased_listing_entry() {
        let raw = RemoteEntry::file("/inbox/sub", "a.txt", 3, None);
        let entry = raw.rebased("/inbox", "sub");
        assert_eq!(entry.relative_path(), "sub/a.txt");
        assert_eq!(entry.absolute_path(), "/inbox/sub/a.txt");
        assert_eq!(entry.depth(), 2);
    }

    #[test]
    fn test_moved_to_keeps_relative_form() {
        let entry = RemoteEntry::file("/inbox", "a.txt", 3, None);
        let moved = entry.moved_to("/inbox/.done/a.txt");
        assert_eq!(moved.relative_path(), ".done/a.txt");
        assert_eq!(moved.absolute_path(), "/inbox/.done/a.txt");

        let outside = entry.moved_to("/archive/a.txt");
        assert_eq!(outside.absolute_path(), "/archive/a.txt");
        assert_eq!(outside.file_name_only(), "a.txt");
    }

    #[test]
    fn test_read_lock_state_observe() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let entry = RemoteEntry::file("/", "a.txt", 1, Some(t0));
        let mut state = ReadLockState::new(entry, t0);

        assert_eq!(state.observe(5, Some(t0), t0), None);
        let t1 = t0 + chrono::Duration::milliseconds(1500);
        assert_eq!(state.observe(5, Some(t0), t1), Some(Duration::from_millis(1500)));
        // growth resets the stability window
        assert_eq!(state.observe(9, Some(t0), t1), None);
        assert_eq!(state.check_count, 3);
    }
}
