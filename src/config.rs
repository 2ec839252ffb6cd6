use secrecy::SecretString;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::consumer::{ConsumerOptions, DownloadMode, PostAction, ReconnectPolicy, ShutdownRunningTask};
use crate::done_file::DoneFileName;
use crate::error::ConfigError;
use crate::expression::Expression;
use crate::filter::FileFilter;
use crate::idempotent::{
    FileIdempotentRepository, IdempotentRepository, InProgressRepository, MemoryIdempotentRepository,
};
use crate::producer::{FileExist, RemoteFileWriter, WriterOptions};
use crate::protocols::{ConnectionSettings, Protocol};
use crate::read_lock::{IdempotentLockOptions, ReadLockKind, ReadLockRegistry, ReadLockTiming};
use crate::scanner::ScanOptions;
use crate::scheduler::SchedulerOptions;
use crate::sorting::Sorter;

/// Directory files are moved to after processing when neither `delete`,
/// `noop` nor `move` is configured
pub const DEFAULT_MOVE_DIRECTORY: &str = ".ftpoll";

/// Connection timeout when neither the config nor `-t` sets one
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

fn default_true() -> bool {
    true
}
fn default_login() -> String {
    "anonymous".to_string()
}
fn default_directory() -> String {
    "/".to_string()
}
fn default_read_lock() -> String {
    "none".to_string()
}
fn default_check_interval_ms() -> u64 {
    1000
}
fn default_read_lock_timeout_ms() -> u64 {
    10000
}
fn default_min_length() -> u64 {
    1
}
fn default_cache_size() -> usize {
    crate::idempotent::DEFAULT_CACHE_SIZE
}
fn default_threads() -> usize {
    1
}
fn default_reconnect_attempts() -> u32 {
    3
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_delay_ms() -> u64 {
    500
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_file_exist() -> String {
    "override".to_string()
}

/// One polled endpoint (one line of the JSONL config file)
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Log tag; defaults to `host/directory`
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    pub host: String,
    /// Defaults to the protocol's port
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_login")]
    pub login: String,
    #[serde(default)]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub keyfile: Option<String>,
    #[serde(default)]
    pub keyfile_passphrase: Option<SecretString>,
    #[serde(default = "default_directory")]
    pub directory: String,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default = "default_true")]
    pub passive: bool,

    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub min_depth: usize,
    #[serde(default)]
    pub max_depth: Option<usize>,
    /// Regex over the bare file name
    #[serde(default)]
    pub include: Option<String>,
    #[serde(default)]
    pub exclude: Option<String>,
    #[serde(default)]
    pub include_ext: Option<String>,
    #[serde(default)]
    pub exclude_ext: Option<String>,
    #[serde(default)]
    pub ant_include: Option<String>,
    #[serde(default)]
    pub ant_exclude: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default = "default_true")]
    pub use_list: bool,
    #[serde(default)]
    pub done_file_name: Option<String>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub max_messages_per_poll: usize,
    #[serde(default = "default_true")]
    pub eager_max_messages_per_poll: bool,
    #[serde(default)]
    pub ignore_file_not_found_or_permission_error: bool,

    #[serde(default = "default_read_lock")]
    pub read_lock: String,
    #[serde(default = "default_check_interval_ms")]
    pub read_lock_check_interval_ms: u64,
    /// Zero waits forever
    #[serde(default = "default_read_lock_timeout_ms")]
    pub read_lock_timeout_ms: u64,
    #[serde(default = "default_min_length")]
    pub read_lock_min_length: u64,
    #[serde(default)]
    pub read_lock_min_age_ms: u64,
    #[serde(default = "default_true")]
    pub read_lock_remove_on_rollback: bool,
    #[serde(default)]
    pub read_lock_remove_on_commit: bool,

    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub noop: bool,
    #[serde(default, rename = "move")]
    pub move_to: Option<String>,
    #[serde(default)]
    pub pre_move: Option<String>,
    #[serde(default)]
    pub move_failed: Option<String>,

    /// Unset means "on when noop"
    #[serde(default)]
    pub idempotent: Option<bool>,
    #[serde(default)]
    pub idempotent_key: Option<String>,
    /// Persist consumed keys in this file instead of memory
    #[serde(default)]
    pub idempotent_file: Option<PathBuf>,
    #[serde(default = "default_cache_size")]
    pub idempotent_cache_size: usize,

    #[serde(default = "default_true")]
    pub download: bool,
    #[serde(default)]
    pub stream_download: bool,
    #[serde(default)]
    pub local_work_directory: Option<PathBuf>,
    #[serde(default)]
    pub charset: Option<String>,
    #[serde(default = "default_threads")]
    pub threads: usize,

    #[serde(default = "default_reconnect_attempts")]
    pub maximum_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default)]
    pub throw_exception_on_connect_failed: bool,
    #[serde(default = "default_true")]
    pub send_noop: bool,
    #[serde(default = "default_true")]
    pub auto_create: bool,
    #[serde(default)]
    pub disconnect: bool,
    #[serde(default)]
    pub disconnect_on_batch_complete: bool,
    #[serde(default)]
    pub send_empty_message_when_idle: bool,
    #[serde(default)]
    pub shutdown_running_task: ShutdownRunningTask,

    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default)]
    pub greedy: bool,
    #[serde(default)]
    pub repeat_count: u64,
    #[serde(default)]
    pub backoff_multiplier: u32,
    #[serde(default)]
    pub backoff_idle_threshold: u32,
    #[serde(default)]
    pub backoff_error_threshold: u32,

    /// Where consumed files go; without it files are only logged
    #[serde(default)]
    pub deliver_to: Option<DeliverTo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeliverTo {
    Local {
        directory: PathBuf,
        #[serde(default)]
        keep_last_modified: bool,
    },
    Remote(TargetConfig),
}

/// Upload target for `deliver_to: {"type": "remote", ...}`
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub protocol: Protocol,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_login")]
    pub login: String,
    #[serde(default)]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub keyfile: Option<String>,
    #[serde(default = "default_directory")]
    pub directory: String,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default = "default_file_exist")]
    pub file_exist: String,
    #[serde(default)]
    pub move_existing: Option<String>,
    #[serde(default)]
    pub temp_prefix: Option<String>,
    #[serde(default = "default_true")]
    pub eager_delete_target_file: bool,
}

impl TargetConfig {
    pub fn connection_settings(&self, timeout: Duration, insecure_skip_verify: bool) -> ConnectionSettings {
        ConnectionSettings {
            protocol: self.protocol,
            host: self.host.clone(),
            port: self.port.unwrap_or_else(|| self.protocol.default_port()),
            login: self.login.clone(),
            password: self.password.clone(),
            keyfile: self.keyfile.clone(),
            keyfile_passphrase: None,
            timeout,
            insecure_skip_verify: insecure_skip_verify || self.insecure_skip_verify,
            passive: true,
        }
    }

    pub fn writer(&self) -> Result<RemoteFileWriter, ConfigError> {
        let move_existing = match &self.move_existing {
            Some(source) => Some(Expression::parse_move_target(source)?),
            None => None,
        };
        RemoteFileWriter::new(WriterOptions {
            directory: self.directory.clone(),
            file_exist: self.file_exist.parse::<FileExist>()?,
            move_existing,
            temp_prefix: self.temp_prefix.clone(),
            eager_delete_target_file: self.eager_delete_target_file,
            auto_create: true,
        })
    }
}

impl EndpointConfig {
    pub fn name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}{}", self.host, self.directory),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS))
    }

    /// Session settings; `insecure_skip_verify` from the command line wins
    pub fn connection_settings(&self, insecure_skip_verify: bool) -> ConnectionSettings {
        ConnectionSettings {
            protocol: self.protocol,
            host: self.host.clone(),
            port: self.port(),
            login: self.login.clone(),
            password: self.password.clone(),
            keyfile: self.keyfile.clone(),
            keyfile_passphrase: self.keyfile_passphrase.clone(),
            timeout: self.connect_timeout(),
            insecure_skip_verify: insecure_skip_verify || self.insecure_skip_verify,
            passive: self.passive,
        }
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            delay: Duration::from_millis(self.delay_ms),
            greedy: self.greedy,
            repeat_count: self.repeat_count,
            backoff_multiplier: self.backoff_multiplier,
            backoff_idle_threshold: self.backoff_idle_threshold,
            backoff_error_threshold: self.backoff_error_threshold,
        }
    }

    pub fn read_lock_timing(&self) -> ReadLockTiming {
        ReadLockTiming {
            check_interval: Duration::from_millis(self.read_lock_check_interval_ms),
            timeout: Duration::from_millis(self.read_lock_timeout_ms),
            min_length: self.read_lock_min_length,
            min_age: Duration::from_millis(self.read_lock_min_age_ms),
        }
    }

    /// `noop` turns idempotency on unless it is configured explicitly
    pub fn is_idempotent(&self) -> bool {
        self.idempotent.unwrap_or(self.noop)
    }

    /// Checks everything that can be checked without touching the network or
    /// the file system
    pub fn validate(&self, registry: &ReadLockRegistry) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid("host must not be empty"));
        }
        self.scan_options()?;
        self.post_action()?;
        self.optional_expressions()?;

        let kind: ReadLockKind = self.read_lock.parse()?;
        if let ReadLockKind::Named(name) = &kind {
            if !registry.contains(name) {
                return Err(ConfigError::invalid(format!("unknown read lock '{}'", name)));
            }
        }
        if self.read_lock_timeout_ms > 0 && self.read_lock_timeout_ms <= self.read_lock_check_interval_ms {
            return Err(ConfigError::invalid(format!(
                "read_lock_timeout_ms ({}) must be higher than read_lock_check_interval_ms ({})",
                self.read_lock_timeout_ms, self.read_lock_check_interval_ms
            )));
        }
        if self.threads == 0 {
            return Err(ConfigError::invalid("threads must be at least 1"));
        }
        if self.stream_download && self.local_work_directory.is_some() {
            return Err(ConfigError::invalid(
                "stream_download and local_work_directory cannot be combined",
            ));
        }
        self.scheduler_options().validate()?;
        if let Some(DeliverTo::Remote(target)) = &self.deliver_to {
            target.writer()?;
        }
        Ok(())
    }

    fn scan_options(&self) -> Result<ScanOptions, ConfigError> {
        let max_depth = self.max_depth.unwrap_or(if self.recursive { usize::MAX } else { 1 });
        if self.min_depth > max_depth {
            return Err(ConfigError::invalid(format!(
                "min_depth ({}) must not exceed max_depth ({})",
                self.min_depth, max_depth
            )));
        }

        let mut filter = FileFilter::new();
        if let Some(pattern) = &self.include {
            filter = filter.include(pattern)?;
        }
        if let Some(pattern) = &self.exclude {
            filter = filter.exclude(pattern)?;
        }
        if let Some(extensions) = &self.include_ext {
            filter = filter.include_ext(extensions);
        }
        if let Some(extensions) = &self.exclude_ext {
            filter = filter.exclude_ext(extensions);
        }
        if let Some(patterns) = &self.ant_include {
            filter = filter.ant_include(patterns)?;
        }
        if let Some(patterns) = &self.ant_exclude {
            filter = filter.ant_exclude(patterns)?;
        }
        if let Some(name) = &self.file_name {
            filter = filter.file_name(name);
        } else if !self.use_list {
            return Err(ConfigError::invalid("use_list=false requires file_name"));
        }

        let done_file = match &self.done_file_name {
            Some(pattern) => Some(DoneFileName::new(pattern)?),
            None => None,
        };
        let sorter = match &self.sort_by {
            Some(sort_by) => Sorter::parse(sort_by)?,
            None => Sorter::default(),
        };

        Ok(ScanOptions {
            directory: self.directory.clone(),
            recursive: self.recursive,
            min_depth: self.min_depth,
            max_depth,
            filter,
            done_file,
            sorter,
            shuffle: self.shuffle,
            use_list: self.use_list,
            ignore_file_not_found_or_permission_error: self.ignore_file_not_found_or_permission_error,
            on_list_failure: None,
            max_messages_per_poll: self.max_messages_per_poll,
            eager_max_messages_per_poll: self.eager_max_messages_per_poll,
        })
    }

    fn post_action(&self) -> Result<PostAction, ConfigError> {
        match (self.delete, self.noop, &self.move_to) {
            (true, true, _) => Err(ConfigError::invalid("delete and noop cannot both be set")),
            (true, _, Some(_)) => Err(ConfigError::invalid("delete and move cannot both be set")),
            (_, true, Some(_)) => Err(ConfigError::invalid("noop and move cannot both be set")),
            (true, false, None) => Ok(PostAction::Delete),
            (false, true, None) => Ok(PostAction::Noop),
            (false, false, Some(target)) => Ok(PostAction::Move(Expression::parse_move_target(target)?)),
            (false, false, None) => Ok(PostAction::Move(Expression::parse_move_target(DEFAULT_MOVE_DIRECTORY)?)),
        }
    }

    /// pre_move, move_failed, idempotent_key
    fn optional_expressions(&self) -> Result<(Option<Expression>, Option<Expression>, Option<Expression>), ConfigError> {
        let move_target = |source: &Option<String>| -> Result<Option<Expression>, ConfigError> {
            match source {
                Some(source) => Ok(Some(Expression::parse_move_target(source)?)),
                None => Ok(None),
            }
        };
        let key = match &self.idempotent_key {
            Some(source) => Some(Expression::parse(source)?),
            None => None,
        };
        Ok((move_target(&self.pre_move)?, move_target(&self.move_failed)?, key))
    }

    fn download_mode(&self) -> DownloadMode {
        if !self.download {
            DownloadMode::Skip
        } else if self.stream_download {
            DownloadMode::Streaming
        } else if let Some(directory) = &self.local_work_directory {
            DownloadMode::LocalWorkDirectory(directory.clone())
        } else {
            DownloadMode::Buffered
        }
    }

    /// Builds the consumer options; opens the idempotent file when one is
    /// configured
    pub fn consumer_options(&self, registry: &ReadLockRegistry) -> Result<ConsumerOptions, ConfigError> {
        self.validate(registry)?;

        let repository: Arc<dyn IdempotentRepository> = match &self.idempotent_file {
            Some(path) => Arc::new(FileIdempotentRepository::open(path, self.idempotent_cache_size)?),
            None => Arc::new(MemoryIdempotentRepository::new(self.idempotent_cache_size)),
        };
        let kind: ReadLockKind = self.read_lock.parse()?;
        let read_lock = kind.build(
            Arc::clone(&repository),
            IdempotentLockOptions {
                remove_on_commit: self.read_lock_remove_on_commit,
                remove_on_rollback: self.read_lock_remove_on_rollback,
            },
            registry,
        )?;
        let (pre_move, move_failed, idempotent_key) = self.optional_expressions()?;

        Ok(ConsumerOptions {
            name: self.name(),
            scan: self.scan_options()?,
            read_lock,
            read_lock_timing: self.read_lock_timing(),
            post_action: self.post_action()?,
            pre_move,
            move_failed,
            idempotent: self.is_idempotent(),
            idempotent_key,
            idempotent_repository: repository,
            in_progress: Arc::new(InProgressRepository::new()),
            download: self.download_mode(),
            charset: self.charset.clone(),
            threads: self.threads,
            reconnect: ReconnectPolicy {
                maximum_attempts: self.maximum_reconnect_attempts,
                delay: Duration::from_millis(self.reconnect_delay_ms),
                throw_exception_on_connect_failed: self.throw_exception_on_connect_failed,
            },
            send_noop: self.send_noop,
            auto_create: self.auto_create,
            disconnect: self.disconnect,
            disconnect_on_batch_complete: self.disconnect_on_batch_complete,
            send_empty_message_when_idle: self.send_empty_message_when_idle,
            ignore_file_not_found_or_permission_error: self.ignore_file_not_found_or_permission_error,
            shutdown_running_task: self.shutdown_running_task,
        })
    }
}

/// Parses configuration file into a vector of endpoint configs
///
/// # Arguments
/// * `filename` - Path to configuration file
///
/// # Errors
/// - File not found or unreadable
/// - Invalid JSON or missing `host` (reported with the line number)
/// - Any option rejected by `EndpointConfig::validate`
///
/// # File Format
/// JSONL, one endpoint per line. Blank lines and lines starting with `#`
/// are skipped.
///
/// # Example
/// ```text
/// // let endpoints = parse_config("endpoints.jsonl")?;
/// ```
pub fn parse_config(filename: &str) -> Result<Vec<EndpointConfig>, ConfigError> {
    parse_config_with(filename, &ReadLockRegistry::new())
}

/// Same as `parse_config`, resolving custom read locks from `registry`
pub fn parse_config_with(filename: &str, registry: &ReadLockRegistry) -> Result<Vec<EndpointConfig>, ConfigError> {
    let file = File::open(filename)?;
    let reader = BufReader::new(file);

    let mut configs = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let config: EndpointConfig =
            serde_json::from_str(line).map_err(|e| ConfigError::from(e).at_line(line_num + 1))?;
        config.validate(registry).map_err(|e| e.at_line(line_num + 1))?;
        configs.push(config);
    }

    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_config(content: &str) -> (tempfile::TempDir, String) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("endpoints.jsonl");
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        let path = path.to_str().unwrap().to_string();
        (dir, path)
    }

    fn endpoint(json: &str) -> EndpointConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_config_with_comments_and_defaults() {
        let (_dir, path) = write_config(
            r#"# inbound orders
{"name":"orders","host":"ftp.example.com","login":"bob","password":"s3cret","directory":"/orders","delete":true}

# partner drop, sftp with key
{"protocol":"sftp","host":"10.0.0.5","keyfile":"/home/bob/.ssh/id_ed25519","directory":"/drop","read_lock":"changed","recursive":true}
"#,
        );
        let configs = parse_config(&path).unwrap();
        assert_eq!(configs.len(), 2);

        let orders = &configs[0];
        assert_eq!(orders.name(), "orders");
        assert_eq!(orders.port(), 21);
        assert_eq!(orders.password.as_ref().unwrap().expose_secret(), "s3cret");
        assert_eq!(orders.read_lock_timing(), ReadLockTiming::default());
        assert_eq!(orders.scheduler_options(), SchedulerOptions::default());

        let partner = &configs[1];
        assert_eq!(partner.name(), "10.0.0.5/drop");
        assert_eq!(partner.port(), 22);
        assert_eq!(partner.login, "anonymous");
        assert_eq!(partner.connection_settings(false).endpoint(), "sftp://10.0.0.5:22");
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let (_dir, path) = write_config(
            "{\"host\":\"a\"}\n{\"host\":\"b\",\"include\":\"(unclosed\"}\n",
        );
        let err = parse_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Line { line: 2, .. }));

        let (_dir, path) = write_config("{\"login\":\"nohost\"}\n");
        assert!(matches!(parse_config(&path).unwrap_err(), ConfigError::Line { line: 1, .. }));
    }

    #[test]
    fn test_conflicting_options_rejected() {
        let registry = ReadLockRegistry::new();
        for json in [
            r#"{"host":"h","delete":true,"noop":true}"#,
            r#"{"host":"h","delete":true,"move":"done"}"#,
            r#"{"host":"h","recursive":true,"min_depth":3,"max_depth":2}"#,
            r#"{"host":"h","read_lock":"changed","read_lock_timeout_ms":500}"#,
            r#"{"host":"h","read_lock":"my-lock"}"#,
            r#"{"host":"h","backoff_multiplier":2}"#,
            r#"{"host":"h","use_list":false}"#,
            r#"{"host":"h","sort_by":"reverse:"}"#,
            r#"{"host":"h","deliver_to":{"type":"remote","host":"t","file_exist":"move"}}"#,
        ] {
            assert!(endpoint(json).validate(&registry).is_err(), "accepted {}", json);
        }
    }

    #[test]
    fn test_consumer_options_conversion() {
        let registry = ReadLockRegistry::new();
        let config = endpoint(
            r#"{"host":"h","directory":"/in","noop":true,"idempotent_key":"${file:name}-${file:size}","stream_download":true,"threads":4,"maximum_reconnect_attempts":0,"throw_exception_on_connect_failed":true,"shutdown_running_task":"complete_all_tasks"}"#,
        );
        let options = config.consumer_options(&registry).unwrap();
        assert!(matches!(options.post_action, PostAction::Noop));
        assert!(options.idempotent);
        assert_eq!(options.download, DownloadMode::Streaming);
        assert_eq!(options.threads, 4);
        assert_eq!(options.scan.max_depth, 1);
        assert!(options.reconnect.throw_exception_on_connect_failed);
        assert_eq!(options.shutdown_running_task, ShutdownRunningTask::CompleteAllTasks);

        let defaults = endpoint(r#"{"host":"h"}"#).consumer_options(&registry).unwrap();
        match defaults.post_action {
            PostAction::Move(target) => assert_eq!(target.source(), ".ftpoll/${file:name}"),
            other => panic!("unexpected post action {:?}", other),
        }
        assert!(!defaults.idempotent);
        assert_eq!(defaults.read_lock.name(), "none");
    }

    #[test]
    fn test_idempotent_file_and_delivery_target() {
        let dir = tempdir().unwrap();
        let keys = dir.path().join("state").join("keys.txt");
        let json = format!(
            r#"{{"host":"h","idempotent":true,"idempotent_file":{:?},"read_lock":"idempotent-changed","deliver_to":{{"type":"remote","host":"t","directory":"/out","file_exist":"move","move_existing":"archive","temp_prefix":".part-"}}}}"#,
            keys.to_str().unwrap()
        );
        let config = endpoint(&json);
        let options = config.consumer_options(&ReadLockRegistry::new()).unwrap();
        assert_eq!(options.read_lock.name(), "idempotent-changed");
        assert!(options.idempotent_repository.add("k"));
        assert!(keys.parent().unwrap().exists());

        match &config.deliver_to {
            Some(DeliverTo::Remote(target)) => {
                let writer = target.writer().unwrap();
                assert_eq!(writer.options().file_exist, FileExist::Move);
                assert_eq!(writer.options().temp_prefix.as_deref(), Some(".part-"));
                assert_eq!(target.connection_settings(Duration::from_secs(5), false).port, 21);
            }
            other => panic!("unexpected target {:?}", other),
        }

        let local = endpoint(r#"{"host":"h","deliver_to":{"type":"local","directory":"/srv/in","keep_last_modified":true}}"#);
        assert!(matches!(
            local.deliver_to,
            Some(DeliverTo::Local { keep_last_modified: true, .. })
        ));
    }
}
