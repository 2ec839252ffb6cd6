//! Done-file (companion marker) naming
//!
//! The pattern may be a fixed name (`fin.dat`) or contain `${file:name}` /
//! `${file:name.noext}`, which expand to the target's bare file name. A done
//! file always lives next to its target.

use crate::error::ExpressionError;

const NAME: &str = "${file:name}";
const NAME_NOEXT: &str = "${file:name.noext}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoneFileName {
    pattern: String,
}

impl DoneFileName {
    pub fn new(pattern: &str) -> Result<Self, ExpressionError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(ExpressionError::new(pattern, "empty done file name"));
        }
        let stripped = pattern.replace(NAME_NOEXT, "").replace(NAME, "");
        if stripped.contains("${") || stripped.contains("$simple{") {
            return Err(ExpressionError::new(
                pattern,
                "done file name only supports ${file:name} and ${file:name.noext}",
            ));
        }
        if stripped.contains('/') || stripped.contains('\\') {
            return Err(ExpressionError::new(pattern, "done file name cannot contain a path"));
        }
        Ok(DoneFileName {
            pattern: pattern.to_string(),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Name of the done file that releases `file_name` (a bare name)
    pub fn done_file_for(&self, file_name: &str) -> String {
        let noext = match file_name.find('.') {
            Some(0) | None => file_name,
            Some(index) => &file_name[..index],
        };
        self.pattern
            .replace(NAME_NOEXT, noext)
            .replace(NAME, file_name)
    }

    /// Whether `file_name` has the shape of a done file for some target
    pub fn is_done_file(&self, file_name: &str) -> bool {
        let dynamic = self.pattern.find("${");
        match dynamic {
            None => file_name == self.pattern,
            Some(start) => {
                let prefix = &self.pattern[..start];
                let suffix = match self.pattern.rfind('}') {
                    Some(end) => &self.pattern[end + 1..],
                    None => "",
                };
                file_name.len() > prefix.len() + suffix.len()
                    && file_name.starts_with(prefix)
                    && file_name.ends_with(suffix)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_done_file() {
        let done = DoneFileName::new("fin.dat").unwrap();
        assert_eq!(done.done_file_for("hello.txt"), "fin.dat");
        assert!(done.is_done_file("fin.dat"));
        assert!(!done.is_done_file("hello.txt"));
    }

    #[test]
    fn test_dynamic_done_file() {
        let done = DoneFileName::new("${file:name}.done").unwrap();
        assert_eq!(done.done_file_for("hello.txt"), "hello.txt.done");
        assert!(done.is_done_file("hello.txt.done"));
        assert!(!done.is_done_file("hello.txt"));
        assert!(!done.is_done_file(".done"));

        let done = DoneFileName::new("ready-${file:name.noext}.ok").unwrap();
        assert_eq!(done.done_file_for("data.csv"), "ready-data.ok");
        assert!(done.is_done_file("ready-data.ok"));
    }

    #[test]
    fn test_unsupported_tokens_rejected() {
        assert!(DoneFileName::new("${date:now:yyyy}.done").is_err());
        assert!(DoneFileName::new("sub/${file:name}.done").is_err());
        assert!(DoneFileName::new("  ").is_err());
    }
}
