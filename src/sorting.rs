//! Candidate ordering
//!
//! `sortBy` groups are separated by `;` and compared in order, each optionally
//! prefixed by `reverse:` and/or `ignoreCase:`:
//!
//! ```text
//! reverse:file:modified;ignoreCase:file:name
//! date:file:yyyyMMdd;${file:length}
//! ```

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::entry::RemoteEntry;
use crate::error::ExpressionError;
use crate::expression::Expression;

/// Custom comparator, applied after every `sortBy` group ties
pub type EntryComparator = Arc<dyn Fn(&RemoteEntry, &RemoteEntry) -> Ordering + Send + Sync>;

#[derive(Debug, Clone)]
struct SortGroup {
    expression: Expression,
    reverse: bool,
    ignore_case: bool,
}

#[derive(Clone, Default)]
pub struct Sorter {
    groups: Vec<SortGroup>,
    comparator: Option<EntryComparator>,
}

impl Sorter {
    pub fn parse(sort_by: &str) -> Result<Self, ExpressionError> {
        let mut groups = Vec::new();
        for raw in sort_by.split(';').map(str::trim).filter(|g| !g.is_empty()) {
            let mut rest = raw;
            let mut reverse = false;
            let mut ignore_case = false;
            loop {
                if let Some(r) = rest.strip_prefix("reverse:") {
                    reverse = true;
                    rest = r;
                } else if let Some(r) = rest.strip_prefix("ignoreCase:") {
                    ignore_case = true;
                    rest = r;
                } else {
                    break;
                }
            }
            let expression = if rest.starts_with("${") || rest.starts_with("$simple{") {
                Expression::parse(rest)?
            } else {
                Expression::parse(&format!("${{{}}}", rest))?
            };
            groups.push(SortGroup {
                expression,
                reverse,
                ignore_case,
            });
        }
        if groups.is_empty() {
            return Err(ExpressionError::new(sort_by, "empty sortBy"));
        }
        Ok(Sorter {
            groups,
            comparator: None,
        })
    }

    pub fn with_comparator(mut self, comparator: EntryComparator) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.comparator.is_none()
    }

    pub fn compare(&self, a: &RemoteEntry, b: &RemoteEntry, now: DateTime<Utc>) -> Ordering {
        for group in &self.groups {
            let left = group.expression.sort_value(a, now);
            let right = group.expression.sort_value(b, now);
            let mut ordering = left.compare(&right, group.ignore_case);
            if group.reverse {
                ordering = ordering.reverse();
            }
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        match &self.comparator {
            Some(comparator) => comparator(a, b),
            None => Ordering::Equal,
        }
    }

    /// Stable sort; entries that compare equal keep listing order
    pub fn sort(&self, entries: &mut [RemoteEntry], now: DateTime<Utc>) {
        if self.is_empty() {
            return;
        }
        entries.sort_by(|a, b| self.compare(a, b, now));
    }
}

impl fmt::Debug for Sorter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sorter")
            .field("groups", &self.groups)
            .field("comparator", &self.comparator.is_some())
            .finish()
    }
}

pub fn shuffle(entries: &mut [RemoteEntry]) {
    entries.shuffle(&mut rand::thread_rng());
}
