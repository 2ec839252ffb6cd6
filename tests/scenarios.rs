//! End-to-end polling scenarios against the in-memory server, with consumers
//! built from JSON endpoint lines the way the daemon builds them.

use chrono::{TimeZone, Utc};
use ftpoll::config::{parse_config, DeliverTo, EndpointConfig};
use ftpoll::exchange::{processor_fn, DownloadedFile, ErrorChannel, FailureReport, FileProcessor};
use ftpoll::protocols::{MemoryClient, MemoryServer};
use ftpoll::read_lock::ReadLockRegistry;
use ftpoll::{LocalDirectoryDelivery, ManualClock, PollingConsumer, ProcessingError, RemoteDelivery};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Delivered = Arc<Mutex<Vec<(String, String)>>>;

fn clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap())
}

fn endpoint(json: &str) -> EndpointConfig {
    serde_json::from_str(json).unwrap()
}

fn recording() -> (Delivered, Arc<dyn FileProcessor>) {
    let delivered: Delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&delivered);
    let processor = processor_fn(move |file: &mut DownloadedFile<'_>| {
        let body = file.read_string()?;
        sink.lock().unwrap().push((file.headers.file_name.clone(), body));
        Ok(())
    });
    (delivered, Arc::new(processor))
}

fn consumer(
    server: &MemoryServer,
    config: &EndpointConfig,
    processor: Arc<dyn FileProcessor>,
    clock: &ManualClock,
) -> PollingConsumer<MemoryClient> {
    let options = config.consumer_options(&ReadLockRegistry::new()).unwrap();
    PollingConsumer::new(server.client(), options, processor)
        .unwrap()
        .with_clock(Arc::new(clock.clone()))
}

#[test]
fn delete_after_successful_delivery() {
    let server = MemoryServer::new("hello");
    server.put("/in/hello.txt", "Hello World");
    let (delivered, processor) = recording();
    let config = endpoint(r#"{"host": "memory", "directory": "/in", "delete": true}"#);
    let mut consumer = consumer(&server, &config, processor, &clock());

    let report = consumer.poll().unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(
        *delivered.lock().unwrap(),
        vec![("hello.txt".to_string(), "Hello World".to_string())]
    );
    assert!(server.files().is_empty());
}

#[test]
fn default_post_action_archives_to_hidden_directory() {
    let server = MemoryServer::new("archive");
    server.put("/in/report.csv", "1,2,3");
    let (_, processor) = recording();
    let config = endpoint(r#"{"host": "memory", "directory": "/in"}"#);
    let mut consumer = consumer(&server, &config, processor, &clock());

    assert_eq!(consumer.poll().unwrap().delivered, 1);
    assert_eq!(server.files(), vec!["/in/.ftpoll/report.csv".to_string()]);
    assert_eq!(consumer.poll().unwrap().listed, 0);
}

#[test]
fn done_file_gates_and_is_removed() {
    let server = MemoryServer::new("done");
    server.put("/in/hello.txt", "Hello World");
    let (delivered, processor) = recording();
    let config = endpoint(r#"{"host": "memory", "directory": "/in", "delete": true, "done_file_name": "fin.dat"}"#);
    let mut consumer = consumer(&server, &config, processor, &clock());

    assert_eq!(consumer.poll().unwrap().delivered, 0);
    assert!(server.exists("/in/hello.txt"));

    server.put("/in/fin.dat", "");
    assert_eq!(consumer.poll().unwrap().delivered, 1);
    assert_eq!(delivered.lock().unwrap().len(), 1);
    assert!(server.files().is_empty());
}

#[test]
fn third_poll_succeeds_after_two_failures() {
    let server = MemoryServer::new("retry");
    server.put("/in/hello.txt", "Hello World");
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let successes = Arc::new(AtomicUsize::new(0));
    let succeeded = Arc::clone(&successes);
    let processor = processor_fn(move |_file: &mut DownloadedFile<'_>| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(ProcessingError::new("downstream unavailable"))
        } else {
            succeeded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let reports: Arc<Mutex<Vec<FailureReport>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let channel: Arc<dyn ErrorChannel> = Arc::new(move |report: &FailureReport| sink.lock().unwrap().push(report.clone()));
    let config = endpoint(r#"{"host": "memory", "directory": "/in", "delete": true}"#);
    let mut consumer = consumer(&server, &config, Arc::new(processor), &clock()).with_error_channel(channel);

    assert_eq!(consumer.poll().unwrap().failed, 1);
    assert_eq!(consumer.poll().unwrap().failed, 1);
    assert!(server.exists("/in/hello.txt"));
    assert_eq!(consumer.poll().unwrap().delivered, 1);

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(reports.lock().unwrap().len(), 2);
    assert!(server.files().is_empty());
}

#[test]
fn depth_bounds_limit_recursive_scan() {
    let server = MemoryServer::new("depth");
    server.put("/in/a.txt", "1");
    server.put("/in/x/b.txt", "2");
    server.put("/in/x/y/c.txt", "3");
    server.put("/in/x/y/z/d.txt", "4");
    let (delivered, processor) = recording();
    let config = endpoint(
        r#"{"host": "memory", "directory": "/in", "delete": true, "recursive": true,
            "min_depth": 2, "max_depth": 3, "sort_by": "file:name"}"#,
    );
    let mut consumer = consumer(&server, &config, processor, &clock());

    assert_eq!(consumer.poll().unwrap().delivered, 2);
    let names: Vec<String> = delivered.lock().unwrap().iter().map(|(name, _)| name.clone()).collect();
    assert_eq!(names, vec!["x/b.txt".to_string(), "x/y/c.txt".to_string()]);
    assert!(server.exists("/in/a.txt"));
    assert!(server.exists("/in/x/y/z/d.txt"));
}

#[test]
fn noop_consumes_each_file_once_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("consumed.keys");
    let server = MemoryServer::new("noop");
    server.put("/in/a.txt", "a");
    let config = endpoint(&format!(
        r#"{{"host": "memory", "directory": "/in", "noop": true, "idempotent_file": "{}"}}"#,
        store.display()
    ));

    let (delivered, processor) = recording();
    let mut first = consumer(&server, &config, Arc::clone(&processor), &clock());
    assert_eq!(first.poll().unwrap().delivered, 1);
    assert_eq!(first.poll().unwrap().delivered, 0);
    drop(first);

    server.put("/in/b.txt", "b");
    let mut restarted = consumer(&server, &config, processor, &clock());
    assert_eq!(restarted.poll().unwrap().delivered, 1);

    let names: Vec<String> = delivered.lock().unwrap().iter().map(|(name, _)| name.clone()).collect();
    assert_eq!(names, vec!["a.txt".to_string(), "b.txt".to_string()]);
    assert!(server.exists("/in/a.txt"));
    assert!(server.exists("/in/b.txt"));
}

#[test]
fn changed_lock_waits_for_minimum_age() {
    let clock = clock();
    let server = MemoryServer::with_clock("changed", Arc::new(clock.clone()));
    server.put("/in/upload.bin", "payload");
    let (delivered, processor) = recording();
    let config = endpoint(
        r#"{"host": "memory", "directory": "/in", "delete": true, "read_lock": "changed",
            "read_lock_check_interval_ms": 1000, "read_lock_timeout_ms": 3000,
            "read_lock_min_age_ms": 10000}"#,
    );
    let mut consumer = consumer(&server, &config, processor, &clock);

    let report = consumer.poll().unwrap();
    assert_eq!(report.lock_timeouts, 1);
    assert!(delivered.lock().unwrap().is_empty());

    clock.advance(Duration::from_secs(10));
    assert_eq!(consumer.poll().unwrap().delivered, 1);
    assert!(!server.exists("/in/upload.bin"));
}

#[test]
fn reconnects_before_polling() {
    let server = MemoryServer::new("flaky");
    server.put("/in/a.txt", "a");
    server.fail_connect(2, Some(421));
    let (delivered, processor) = recording();
    let config = endpoint(r#"{"host": "memory", "directory": "/in", "delete": true, "reconnect_delay_ms": 10}"#);
    let mut consumer = consumer(&server, &config, processor, &clock());

    let report = consumer.poll().unwrap();
    assert!(report.connected);
    assert_eq!(report.delivered, 1);
    assert_eq!(server.connect_count(), 3);
    assert_eq!(delivered.lock().unwrap().len(), 1);
}

#[test]
fn remote_delivery_moves_existing_target_aside() {
    let source = MemoryServer::new("source");
    let target = MemoryServer::new("target");
    let config = endpoint(
        r#"{"host": "memory", "directory": "/in", "delete": true,
            "deliver_to": {"type": "remote", "host": "target", "directory": "/drop",
                           "file_exist": "move", "move_existing": ".old"}}"#,
    );
    let writer = match &config.deliver_to {
        Some(DeliverTo::Remote(remote)) => remote.writer().unwrap(),
        other => panic!("unexpected deliver_to {:?}", other),
    };
    let processor: Arc<dyn FileProcessor> = Arc::new(RemoteDelivery::new(target.client(), writer));
    let mut consumer = consumer(&source, &config, processor, &clock());

    source.put("/in/hello.txt", "Hello World");
    assert_eq!(consumer.poll().unwrap().delivered, 1);
    source.put("/in/hello.txt", "Bye World");
    assert_eq!(consumer.poll().unwrap().delivered, 1);

    assert_eq!(
        target.files(),
        vec!["/drop/.old/hello.txt".to_string(), "/drop/hello.txt".to_string()]
    );
    assert_eq!(target.get_string("/drop/hello.txt").unwrap(), "Bye World");
    assert_eq!(target.get_string("/drop/.old/hello.txt").unwrap(), "Hello World");
    assert!(source.files().is_empty());
}

#[test]
fn local_delivery_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out");
    let config_path = dir.path().join("endpoints.jsonl");
    let mut file = std::fs::File::create(&config_path).unwrap();
    writeln!(file, "# inbound reports").unwrap();
    writeln!(
        file,
        r#"{{"name": "reports", "host": "memory", "directory": "/in", "delete": true, "recursive": true, "deliver_to": {{"type": "local", "directory": "{}"}}}}"#,
        output.display()
    )
    .unwrap();
    drop(file);

    let endpoints = parse_config(config_path.to_str().unwrap()).unwrap();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].name(), "reports");
    let delivery = match &endpoints[0].deliver_to {
        Some(DeliverTo::Local { directory, .. }) => LocalDirectoryDelivery::new(directory),
        other => panic!("unexpected deliver_to {:?}", other),
    };

    let server = MemoryServer::new("local");
    server.put("/in/2024/05/summary.txt", "ok");
    let mut consumer = consumer(&server, &endpoints[0], Arc::new(delivery), &clock());
    assert_eq!(consumer.poll().unwrap().delivered, 1);
    assert_eq!(
        std::fs::read_to_string(output.join("2024").join("05").join("summary.txt")).unwrap(),
        "ok"
    );
}
