use ftpoll::cli::CliOptions;
use ftpoll::config::{DeliverTo, EndpointConfig};
use ftpoll::delivery::{LocalDirectoryDelivery, RemoteDelivery};
use ftpoll::error::ConfigError;
use ftpoll::exchange::{processor_fn, FileProcessor};
use ftpoll::logging::{log, log_with_tag, set_debug, set_log_file};
use ftpoll::protocols::Client;
use ftpoll::read_lock::ReadLockRegistry;
use ftpoll::scheduler::{Scheduler, SchedulerOptions, SchedulerStats};
use ftpoll::shutdown::{get_signal_type, ShutdownFlag};
use ftpoll::{install_signal_handlers, parse_args, parse_config, InstanceLock, PollingConsumer};
use ftpoll::{PROGRAM_NAME, PROGRAM_VERSION};

use std::error::Error;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type BoxError = Box<dyn Error + Send + Sync>;

fn main() {
    let options = parse_args();
    if let Some(path) = &options.log_file {
        set_log_file(path);
    }
    set_debug(options.debug);

    let _ = log(&format!("{} version {} started", PROGRAM_NAME, PROGRAM_VERSION));

    if let Err(e) = install_signal_handlers() {
        let _ = log(&format!("Error installing signal handlers: {}", e));
        process::exit(1);
    }
    let instance = match InstanceLock::acquire(Duration::from_secs(options.grace_seconds)) {
        Ok(instance) => instance,
        Err(e) => {
            let _ = log(&format!("Error: {}", e));
            process::exit(1);
        }
    };

    let mut endpoints = match parse_config(&options.config_file) {
        Ok(endpoints) => endpoints,
        Err(e) => {
            let _ = log(&format!("Error parsing config file {}: {}", options.config_file, e));
            drop(instance);
            process::exit(1);
        }
    };
    if let Some(timeout) = options.connect_timeout {
        for endpoint in endpoints.iter_mut() {
            endpoint.connect_timeout_secs = Some(timeout);
        }
    }
    let _ = log(&format!(
        "Loaded {} endpoint(s) from {}",
        endpoints.len(),
        options.config_file
    ));

    let registry = ReadLockRegistry::new();
    let failures = AtomicUsize::new(0);
    thread::scope(|scope| {
        for endpoint in &endpoints {
            let options = &options;
            let registry = &registry;
            let failures = &failures;
            let spawned = thread::Builder::new()
                .name(endpoint.name())
                .spawn_scoped(scope, move || {
                    let tag = endpoint.name();
                    match run_endpoint(endpoint, options, registry) {
                        Ok(stats) => {
                            let _ = log_with_tag(
                                &format!(
                                    "Stopped after {} poll(s): {} delivered, {} failed, {} poll error(s)",
                                    stats.polls, stats.delivered, stats.failed, stats.errors
                                ),
                                Some(&tag),
                            );
                        }
                        Err(e) => {
                            let _ = log_with_tag(&format!("Error: {}", e), Some(&tag));
                            failures.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            if let Err(e) = spawned {
                let _ = log(&format!("Cannot start consumer thread: {}", e));
                failures.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    match get_signal_type() {
        Some(1) => {
            let _ = log("Received SIGINT, shut down gracefully");
        }
        Some(2) => {
            let _ = log("Received SIGTERM, shut down gracefully");
        }
        _ => {}
    }
    let failed = failures.load(Ordering::SeqCst);
    let _ = log(&format!(
        "{} finished, {} of {} endpoint(s) failed",
        PROGRAM_NAME,
        failed,
        endpoints.len()
    ));
    drop(instance);
    if failed > 0 {
        process::exit(1);
    }
}

/// Polls one endpoint until shutdown (or once with `-1`)
fn run_endpoint(
    endpoint: &EndpointConfig,
    cli: &CliOptions,
    registry: &ReadLockRegistry,
) -> Result<SchedulerStats, BoxError> {
    let consumer_options = endpoint.consumer_options(registry)?;
    let processor = build_processor(endpoint, cli)?;
    let client = Client::new(endpoint.connection_settings(cli.insecure_skip_verify));
    let mut consumer =
        PollingConsumer::new(client, consumer_options, processor)?.with_shutdown(ShutdownFlag::process());

    let scheduler_options = if cli.once {
        SchedulerOptions {
            initial_delay: Duration::ZERO,
            repeat_count: 1,
            ..endpoint.scheduler_options()
        }
    } else {
        endpoint.scheduler_options()
    };
    let clock = Arc::clone(consumer.clock());
    let shutdown = consumer.shutdown_flag().clone();
    let name = endpoint.name();
    let stats = Scheduler::new(&name, scheduler_options, clock.as_ref(), shutdown).run(|| consumer.poll());
    consumer.stop();
    Ok(stats?)
}

/// Where consumed files go; without `deliver_to` they are only logged
fn build_processor(endpoint: &EndpointConfig, cli: &CliOptions) -> Result<Arc<dyn FileProcessor>, ConfigError> {
    let processor: Arc<dyn FileProcessor> = match &endpoint.deliver_to {
        Some(DeliverTo::Local {
            directory,
            keep_last_modified,
        }) => Arc::new(LocalDirectoryDelivery::new(directory).keep_last_modified(*keep_last_modified)),
        Some(DeliverTo::Remote(target)) => {
            let settings = target.connection_settings(endpoint.connect_timeout(), cli.insecure_skip_verify);
            Arc::new(RemoteDelivery::new(Client::new(settings), target.writer()?))
        }
        None => {
            let tag = endpoint.name();
            Arc::new(processor_fn(move |file| {
                let _ = log_with_tag(
                    &format!("Consumed {} ({} bytes)", file.headers.absolute_path, file.headers.length),
                    Some(&tag),
                );
                Ok(())
            }))
        }
    };
    Ok(processor)
}
