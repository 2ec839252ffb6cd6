//! Remote file polling consumer
//!
//! This library contains the core logic of the ftpoll daemon: periodic
//! scanning of FTP, FTPS and SFTP directories, read locks that keep half
//! written files out of processing, idempotent delivery to a processor and
//! the commit or rollback step that moves, deletes or keeps the source file.
//! The binary wires it up with the JSONL endpoint configuration, logging,
//! the command line and single-instance management.

pub mod cli;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod delivery;
pub mod done_file;
pub mod entry;
pub mod error;
pub mod exchange;
pub mod expression;
pub mod filter;
pub mod idempotent;
pub mod instance;
pub mod logging;
pub mod producer;
pub mod protocols;
pub mod read_lock;
pub mod scanner;
pub mod scheduler;
pub mod shutdown;
pub mod sorting;

// Re-export key items for easy use by the binary (main.rs)
pub use cli::{parse_args, CliOptions};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{parse_config, DeliverTo, EndpointConfig};
pub use consumer::{ConsumerOptions, ConsumerState, PollReport, PollingConsumer, PostAction};
pub use delivery::{LocalDirectoryDelivery, RemoteDelivery};
pub use entry::RemoteEntry;
pub use error::{ConfigError, ConsumerError, ProcessingError, RemoteError};
pub use exchange::{processor_fn, DownloadedFile, FileHeaders, FileProcessor};
pub use expression::Expression;
pub use instance::{install_signal_handlers, InstanceLock};
pub use logging::{debug, log, log_with_tag, set_debug, set_log_file};
pub use protocols::{Client, ConnectionSettings, MemoryServer, Protocol, RemoteFileOperations};
pub use scheduler::{Scheduler, SchedulerOptions};
pub use shutdown::{is_shutdown_requested, request_shutdown, ShutdownFlag};

/// Name of the program used for:
/// - Log lines
/// - Lock files ($XDG_RUNTIME_DIR/{PROGRAM_NAME}.pid)
/// - Unix domain socket ($XDG_RUNTIME_DIR/{PROGRAM_NAME}.sock)
/// - Default idempotent key namespace in headers
pub const PROGRAM_NAME: &str = "ftpoll";

/// Current version of the program (from Cargo.toml)
pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");
