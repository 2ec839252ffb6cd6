//! File-language templates
//!
//! A small expression language evaluated against a `RemoteEntry`, used for
//! move targets, idempotent keys, done-file names and sort keys. Supported
//! placeholders (both `${..}` and `$simple{..}` forms):
//!
//! | placeholder | value |
//! |---|---|
//! | `file:name` | path relative to the starting directory |
//! | `file:name.noext` | same, extension stripped |
//! | `file:name.ext`, `file:ext` | extension (after the first dot) |
//! | `file:onlyname` | last path segment |
//! | `file:onlyname.noext` | last segment, extension stripped |
//! | `file:parent` | absolute parent directory |
//! | `file:path`, `file:absolute.path` | absolute path |
//! | `file:length`, `file:size` | size in bytes |
//! | `file:modified` | modification time, epoch millis |
//! | `date:now:PATTERN` | current time formatted with a Java-style pattern |
//! | `date:file:PATTERN` | modification time formatted likewise |
//!
//! Dates are rendered in UTC.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::fmt;

use crate::entry::{file_name_of, join_path, parent_of, RemoteEntry};
use crate::error::ExpressionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Name,
    NameNoExt,
    NameExt,
    OnlyName,
    OnlyNameNoExt,
    Parent,
    AbsolutePath,
    Length,
    Modified,
    /// chrono format string, converted from the Java pattern at parse time
    DateNow(String),
    DateFile(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Token(Token),
}

/// Value a single-token expression yields for sorting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortValue {
    Number(i64),
    Text(String),
}

impl SortValue {
    pub fn compare(&self, other: &SortValue, ignore_case: bool) -> Ordering {
        match (self, other) {
            (SortValue::Number(a), SortValue::Number(b)) => a.cmp(b),
            (SortValue::Text(a), SortValue::Text(b)) if ignore_case => {
                a.to_lowercase().cmp(&b.to_lowercase())
            }
            (SortValue::Text(a), SortValue::Text(b)) => a.cmp(b),
            (SortValue::Number(_), SortValue::Text(_)) => Ordering::Less,
            (SortValue::Text(_), SortValue::Number(_)) => Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    source: String,
    parts: Vec<Part>,
}

impl Expression {
    /// Parses a template such as `backup/${date:now:yyyyMMdd}/${file:name}`
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while !rest.is_empty() {
            let (open_len, found) = if rest.starts_with("${") {
                (2, true)
            } else if rest.starts_with("$simple{") {
                (8, true)
            } else {
                (0, false)
            };
            if !found {
                let mut chars = rest.chars();
                if let Some(c) = chars.next() {
                    literal.push(c);
                }
                rest = chars.as_str();
                continue;
            }

            let body = &rest[open_len..];
            let close = body
                .find('}')
                .ok_or_else(|| ExpressionError::new(source, "unterminated placeholder"))?;
            if !literal.is_empty() {
                parts.push(Part::Literal(std::mem::take(&mut literal)));
            }
            parts.push(Part::Token(parse_token(source, body[..close].trim())?));
            rest = &body[close + 1..];
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        Ok(Expression {
            source: source.to_string(),
            parts,
        })
    }

    /// Parses a move/preMove/moveFailed value
    ///
    /// A value without placeholders names a directory; the file keeps its
    /// relative name inside it (`.done` becomes `.done/${file:name}`).
    pub fn parse_move_target(source: &str) -> Result<Self, ExpressionError> {
        if source.contains("${") || source.contains("$simple{") {
            Expression::parse(source)
        } else {
            let directory = source.trim_end_matches('/');
            Expression::parse(&format!("{}/${{file:name}}", directory))
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_literal(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Literal(_)))
    }

    pub fn tokens(&self) -> impl Iterator<Item = &Token> {
        self.parts.iter().filter_map(|p| match p {
            Part::Token(t) => Some(t),
            Part::Literal(_) => None,
        })
    }

    pub fn evaluate(&self, entry: &RemoteEntry, now: DateTime<Utc>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Token(token) => out.push_str(&token.evaluate(entry, now)),
            }
        }
        out
    }

    /// Evaluates to an absolute path; relative results resolve against the
    /// entry's starting directory
    pub fn evaluate_path(&self, entry: &RemoteEntry, now: DateTime<Utc>) -> String {
        join_path(entry.starting_directory(), &self.evaluate(entry, now))
    }

    pub fn sort_value(&self, entry: &RemoteEntry, now: DateTime<Utc>) -> SortValue {
        match self.parts.as_slice() {
            [Part::Token(Token::Length)] => SortValue::Number(entry.size() as i64),
            [Part::Token(Token::Modified)] => {
                SortValue::Number(entry.last_modified().map(|t| t.timestamp_millis()).unwrap_or(0))
            }
            _ => SortValue::Text(self.evaluate(entry, now)),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Token {
    fn evaluate(&self, entry: &RemoteEntry, now: DateTime<Utc>) -> String {
        match self {
            Token::Name => entry.relative_path().to_string(),
            Token::NameNoExt => strip_ext(entry.relative_path()),
            Token::NameExt => only_ext(entry.file_name_only()).to_string(),
            Token::OnlyName => entry.file_name_only().to_string(),
            Token::OnlyNameNoExt => strip_ext(entry.file_name_only()),
            Token::Parent => entry.parent(),
            Token::AbsolutePath => entry.absolute_path(),
            Token::Length => entry.size().to_string(),
            Token::Modified => entry
                .last_modified()
                .map(|t| t.timestamp_millis().to_string())
                .unwrap_or_default(),
            Token::DateNow(format) => now.format(format).to_string(),
            Token::DateFile(format) => entry.last_modified().unwrap_or(now).format(format).to_string(),
        }
    }
}

fn parse_token(source: &str, body: &str) -> Result<Token, ExpressionError> {
    if let Some(rest) = body.strip_prefix("date:") {
        let (which, pattern) = rest
            .split_once(':')
            .ok_or_else(|| ExpressionError::new(source, "date placeholder needs a pattern"))?;
        if pattern.is_empty() {
            return Err(ExpressionError::new(source, "empty date pattern"));
        }
        let format = java_to_chrono(pattern);
        return match which {
            "now" => Ok(Token::DateNow(format)),
            "file" => Ok(Token::DateFile(format)),
            other => Err(ExpressionError::new(
                source,
                format!("unknown date source '{}'", other),
            )),
        };
    }

    match body {
        "file:name" => Ok(Token::Name),
        "file:name.noext" => Ok(Token::NameNoExt),
        "file:name.ext" | "file:ext" => Ok(Token::NameExt),
        "file:onlyname" => Ok(Token::OnlyName),
        "file:onlyname.noext" => Ok(Token::OnlyNameNoExt),
        "file:parent" => Ok(Token::Parent),
        "file:path" | "file:absolute.path" => Ok(Token::AbsolutePath),
        "file:length" | "file:size" => Ok(Token::Length),
        "file:modified" => Ok(Token::Modified),
        other => Err(ExpressionError::new(
            source,
            format!("unknown placeholder '{}'", other),
        )),
    }
}

/// Strips the extension from the last segment, starting at its first dot
fn strip_ext(path: &str) -> String {
    let name = file_name_of(path);
    let stem = match name.find('.') {
        Some(0) | None => name,
        Some(index) => &name[..index],
    };
    let parent = parent_of(path);
    if parent.is_empty() {
        stem.to_string()
    } else {
        join_path(parent, stem)
    }
}

fn only_ext(name: &str) -> &str {
    match name.find('.') {
        Some(0) | None => "",
        Some(index) => &name[index + 1..],
    }
}

/// Converts a `SimpleDateFormat`-style pattern into a chrono format string
fn java_to_chrono(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            if chars.get(i + 1) == Some(&'\'') {
                out.push('\'');
                i += 2;
                continue;
            }
            i += 1;
            while i < chars.len() && chars[i] != '\'' {
                push_literal(&mut out, chars[i]);
                i += 1;
            }
            i += 1;
            continue;
        }
        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }
        let converted = match (c, run) {
            ('y', 2) => Some("%y"),
            ('y', _) => Some("%Y"),
            ('M', _) => Some("%m"),
            ('d', _) => Some("%d"),
            ('H', _) => Some("%H"),
            ('h', _) => Some("%I"),
            ('m', _) => Some("%M"),
            ('s', _) => Some("%S"),
            ('S', _) => Some("%3f"),
            ('a', _) => Some("%p"),
            _ => None,
        };
        match converted {
            Some(directive) => out.push_str(directive),
            None => {
                for _ in 0..run {
                    push_literal(&mut out, c);
                }
            }
        }
        i += run;
    }
    out
}

fn push_literal(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry() -> RemoteEntry {
        let modified = Utc.with_ymd_and_hms(2023, 12, 24, 18, 30, 5).unwrap();
        RemoteEntry::file("/inbox", "sub/report.tar.gz", 42, Some(modified))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap()
    }

    #[test]
    fn test_file_tokens() {
        let e = entry();
        let eval = |s: &str| Expression::parse(s).unwrap().evaluate(&e, now());
        assert_eq!(eval("${file:name}"), "sub/report.tar.gz");
        assert_eq!(eval("${file:name.noext}"), "sub/report");
        assert_eq!(eval("${file:ext}"), "tar.gz");
        assert_eq!(eval("${file:onlyname}"), "report.tar.gz");
        assert_eq!(eval("${file:onlyname.noext}.done"), "report.done");
        assert_eq!(eval("${file:parent}"), "/inbox/sub");
        assert_eq!(eval("$simple{file:absolute.path}"), "/inbox/sub/report.tar.gz");
        assert_eq!(eval("${file:size}"), "42");
        assert_eq!(eval("${file:modified}"), "1703442605000");
    }

    #[test]
    fn test_date_tokens() {
        let e = entry();
        let eval = |s: &str| Expression::parse(s).unwrap().evaluate(&e, now());
        assert_eq!(eval("backup/${date:now:yyyyMMdd}/x"), "backup/20240203/x");
        assert_eq!(eval("${date:file:yyyy-MM-dd'T'HH:mm:ss}"), "2023-12-24T18:30:05");
        assert_eq!(eval("${date:now:yy}%"), "24%");
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expression::parse("${file:nam}").is_err());
        assert!(Expression::parse("${file:name").is_err());
        assert!(Expression::parse("${date:yesterday:yyyy}").is_err());
        assert!(Expression::parse("${date:now:}").is_err());
    }

    #[test]
    fn test_move_target_directory_shorthand() {
        let e = entry();
        let target = Expression::parse_move_target(".done").unwrap();
        assert_eq!(target.source(), ".done/${file:name}");
        assert_eq!(target.evaluate_path(&e, now()), "/inbox/.done/sub/report.tar.gz");

        let absolute = Expression::parse_move_target("/archive/${file:onlyname}.bak").unwrap();
        assert_eq!(absolute.evaluate_path(&e, now()), "/archive/report.tar.gz.bak");
    }

    #[test]
    fn test_sort_values() {
        let e = entry();
        let length = Expression::parse("${file:length}").unwrap();
        assert_eq!(length.sort_value(&e, now()), SortValue::Number(42));
        let name = Expression::parse("${file:onlyname}").unwrap();
        assert_eq!(name.sort_value(&e, now()), SortValue::Text("report.tar.gz".into()));
        assert_eq!(
            SortValue::Text("B".into()).compare(&SortValue::Text("a".into()), true),
            Ordering::Greater
        );
    }
}
