//! Writing files to a remote server
//!
//! The write path honours a `FileExist` policy for an already present target.
//! With a temp prefix the content is stored under a temporary name in the
//! target directory first and renamed into place once complete.

use chrono::{DateTime, Utc};
use std::fmt;
use std::io::Read;
use std::str::FromStr;

use crate::entry::{file_name_of, join_path, parent_of, RemoteEntry};
use crate::error::{codes, ConfigError, RemoteError};
use crate::expression::Expression;
use crate::logging::debug;
use crate::protocols::RemoteFileOperations;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileExist {
    #[default]
    Override,
    Append,
    Fail,
    Ignore,
    /// Relocate the existing target with `move_existing` first
    Move,
    /// Rename the temp file without checking for an existing target
    TryRename,
}

impl FromStr for FileExist {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "override" => Ok(FileExist::Override),
            "append" => Ok(FileExist::Append),
            "fail" => Ok(FileExist::Fail),
            "ignore" => Ok(FileExist::Ignore),
            "move" => Ok(FileExist::Move),
            "tryrename" | "try_rename" => Ok(FileExist::TryRename),
            other => Err(ConfigError::invalid(format!("unknown file_exist '{}'", other))),
        }
    }
}

impl fmt::Display for FileExist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileExist::Override => "override",
            FileExist::Append => "append",
            FileExist::Fail => "fail",
            FileExist::Ignore => "ignore",
            FileExist::Move => "move",
            FileExist::TryRename => "tryrename",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Target directory; relative names are written below it
    pub directory: String,
    pub file_exist: FileExist,
    /// Where an existing target goes under `FileExist::Move`
    pub move_existing: Option<Expression>,
    pub temp_prefix: Option<String>,
    /// Delete an existing target before writing (Override with temp prefix)
    /// or an occupied `move_existing` destination (Move)
    pub eager_delete_target_file: bool,
    pub auto_create: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            directory: "/".to_string(),
            file_exist: FileExist::Override,
            move_existing: None,
            temp_prefix: None,
            eager_delete_target_file: true,
            auto_create: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { path: String, bytes: u64 },
    Appended { path: String, bytes: u64 },
    /// Target existed and `FileExist::Ignore` kept it
    Ignored { path: String },
}

#[derive(Debug, Clone)]
pub struct RemoteFileWriter {
    options: WriterOptions,
}

impl RemoteFileWriter {
    pub fn new(options: WriterOptions) -> Result<Self, ConfigError> {
        if options.file_exist == FileExist::Move && options.move_existing.is_none() {
            return Err(ConfigError::invalid("file_exist=move requires move_existing"));
        }
        if options.file_exist == FileExist::TryRename && options.temp_prefix.is_none() {
            return Err(ConfigError::invalid("file_exist=tryrename requires temp_prefix"));
        }
        Ok(RemoteFileWriter { options })
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    /// Stores `reader` as `name` (relative to the target directory)
    pub fn write(
        &self,
        ops: &mut dyn RemoteFileOperations,
        name: &str,
        reader: &mut dyn Read,
        now: DateTime<Utc>,
    ) -> Result<WriteOutcome, RemoteError> {
        let target = join_path(&self.options.directory, name);
        let directory = parent_of(&target).to_string();
        if self.options.auto_create && !directory.is_empty() && directory != "/" {
            ops.build_directory(&directory, true)?;
        }

        let exists = match self.options.file_exist {
            FileExist::TryRename => false,
            _ => ops.exists_file(&target)?,
        };
        if exists {
            match self.options.file_exist {
                FileExist::Ignore => {
                    debug(&format!("{} exists, ignoring write", target));
                    return Ok(WriteOutcome::Ignored { path: target });
                }
                FileExist::Fail => {
                    return Err(RemoteError::operation(
                        Some(codes::FILE_NAME_NOT_ALLOWED),
                        format!("{}: file already exists", target),
                    ));
                }
                FileExist::Append => {
                    let bytes = ops.append_file(&target, reader)?;
                    return Ok(WriteOutcome::Appended { path: target, bytes });
                }
                FileExist::Move => self.move_existing(ops, &target, now)?,
                FileExist::Override => {
                    if self.options.temp_prefix.is_some() && self.options.eager_delete_target_file {
                        debug(&format!("Deleting existing {}", target));
                        ops.delete_file(&target)?;
                    }
                }
                FileExist::TryRename => {}
            }
        }

        let bytes = match &self.options.temp_prefix {
            Some(prefix) => {
                let temp = join_path(&directory, &format!("{}{}", prefix, file_name_of(&target)));
                match ops.delete_file(&temp) {
                    Err(e) if e.is_connection_error() => return Err(e),
                    _ => {}
                }
                let bytes = ops.store_file(&temp, reader)?;
                if exists && self.options.file_exist == FileExist::Override && !self.options.eager_delete_target_file {
                    ops.delete_file(&target)?;
                }
                debug(&format!("Renaming {} to {}", temp, target));
                ops.rename_file(&temp, &target)?;
                bytes
            }
            None => ops.store_file(&target, reader)?,
        };
        Ok(WriteOutcome::Written { path: target, bytes })
    }

    /// Moves the current target away; an occupied destination is deleted
    /// only with `eager_delete_target_file`
    fn move_existing(
        &self,
        ops: &mut dyn RemoteFileOperations,
        target: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RemoteError> {
        let expression = match &self.options.move_existing {
            Some(expression) => expression,
            None => return Ok(()),
        };
        let relative = target
            .strip_prefix(self.options.directory.trim_end_matches('/'))
            .map(|r| r.trim_start_matches('/'))
            .unwrap_or(target);
        let entry = RemoteEntry::file(&self.options.directory, relative, 0, None);
        let destination = expression.evaluate_path(&entry, now);
        if destination == target {
            return Ok(());
        }

        let parent = parent_of(&destination);
        if !parent.is_empty() && parent != "/" {
            ops.build_directory(parent, true)?;
        }
        if ops.exists_file(&destination)? {
            if !self.options.eager_delete_target_file {
                return Err(RemoteError::operation(
                    Some(codes::FILE_NAME_NOT_ALLOWED),
                    format!("cannot move existing {} to {}: target exists", target, destination),
                ));
            }
            ops.delete_file(&destination)?;
        }
        debug(&format!("Moving existing {} to {}", target, destination));
        ops.rename_file(target, &destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::{MemoryClient, MemoryServer};
    use chrono::TimeZone;
    use std::io::Cursor;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 29, 10, 30, 0).unwrap()
    }

    fn client(server: &MemoryServer) -> MemoryClient {
        let mut client = server.client();
        client.connect().unwrap();
        client
    }

    fn write(writer: &RemoteFileWriter, client: &mut MemoryClient, name: &str, body: &str) -> Result<WriteOutcome, RemoteError> {
        writer.write(client, name, &mut Cursor::new(body.as_bytes().to_vec()), now())
    }

    #[test]
    fn test_move_existing_keeps_both_versions() {
        let server = MemoryServer::new("move");
        let mut client = client(&server);
        let writer = RemoteFileWriter::new(WriterOptions {
            directory: "/out".to_string(),
            file_exist: FileExist::Move,
            move_existing: Some(Expression::parse("${file:name}.old").unwrap()),
            ..WriterOptions::default()
        })
        .unwrap();

        write(&writer, &mut client, "hello.txt", "Hello World").unwrap();
        write(&writer, &mut client, "hello.txt", "Bye World").unwrap();

        assert_eq!(server.files(), vec!["/out/hello.txt".to_string(), "/out/hello.txt.old".to_string()]);
        assert_eq!(server.get_string("/out/hello.txt").unwrap(), "Bye World");
        assert_eq!(server.get_string("/out/hello.txt.old").unwrap(), "Hello World");
    }

    #[test]
    fn test_move_existing_refuses_occupied_target_without_eager_delete() {
        let server = MemoryServer::new("occupied");
        server.put("/out/a.txt", "current");
        server.put("/out/a.txt.old", "older");
        let mut client = client(&server);
        let writer = RemoteFileWriter::new(WriterOptions {
            directory: "/out".to_string(),
            file_exist: FileExist::Move,
            move_existing: Some(Expression::parse("${file:name}.old").unwrap()),
            eager_delete_target_file: false,
            ..WriterOptions::default()
        })
        .unwrap();

        assert!(write(&writer, &mut client, "a.txt", "new").is_err());
        assert_eq!(server.get_string("/out/a.txt").unwrap(), "current");
        assert_eq!(server.get_string("/out/a.txt.old").unwrap(), "older");
    }

    #[test]
    fn test_policies_for_existing_target() {
        let server = MemoryServer::new("policies");
        server.put("/out/a.txt", "one");
        let mut client = client(&server);
        let with = |file_exist| {
            RemoteFileWriter::new(WriterOptions {
                directory: "/out".to_string(),
                file_exist,
                ..WriterOptions::default()
            })
            .unwrap()
        };

        assert!(matches!(
            write(&with(FileExist::Ignore), &mut client, "a.txt", "x").unwrap(),
            WriteOutcome::Ignored { .. }
        ));
        assert!(write(&with(FileExist::Fail), &mut client, "a.txt", "x").is_err());
        write(&with(FileExist::Append), &mut client, "a.txt", "two").unwrap();
        assert_eq!(server.get_string("/out/a.txt").unwrap(), "onetwo");
        write(&with(FileExist::Override), &mut client, "a.txt", "three").unwrap();
        assert_eq!(server.get_string("/out/a.txt").unwrap(), "three");
    }

    #[test]
    fn test_temp_prefix_renames_into_place() {
        let server = MemoryServer::new("temp");
        server.put("/out/sub/a.txt", "old");
        let mut client = client(&server);
        for eager in [true, false] {
            let writer = RemoteFileWriter::new(WriterOptions {
                directory: "/out".to_string(),
                temp_prefix: Some(".tmp-".to_string()),
                eager_delete_target_file: eager,
                ..WriterOptions::default()
            })
            .unwrap();
            let outcome = write(&writer, &mut client, "sub/a.txt", "new").unwrap();
            assert_eq!(
                outcome,
                WriteOutcome::Written {
                    path: "/out/sub/a.txt".to_string(),
                    bytes: 3
                }
            );
        }
        assert_eq!(server.files(), vec!["/out/sub/a.txt".to_string()]);
        assert_eq!(server.get_string("/out/sub/a.txt").unwrap(), "new");
    }

    #[test]
    fn test_option_validation() {
        assert!(RemoteFileWriter::new(WriterOptions {
            file_exist: FileExist::Move,
            ..WriterOptions::default()
        })
        .is_err());
        assert!(RemoteFileWriter::new(WriterOptions {
            file_exist: FileExist::TryRename,
            ..WriterOptions::default()
        })
        .is_err());
        assert_eq!("TryRename".parse::<FileExist>().unwrap(), FileExist::TryRename);
        assert!("sometimes".parse::<FileExist>().is_err());
    }
}
