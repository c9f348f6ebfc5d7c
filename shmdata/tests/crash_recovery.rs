//! A reader that never releases its commitment must not stall the writer
//! for longer than the crash-recovery timeout.

use parking_lot::Mutex;
use shmdata::protocol::HANDSHAKE_LEN;
use shmdata::{Logger, Reader, TransportConfig, Writer};
use std::fmt;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Default)]
struct CountingLogger {
    errors: AtomicUsize,
}

impl Logger for CountingLogger {
    fn error(&self, args: fmt::Arguments<'_>) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        tracing::error!("{}", args);
    }

    fn warning(&self, args: fmt::Arguments<'_>) {
        tracing::warn!("{}", args);
    }

    fn debug(&self, args: fmt::Arguments<'_>) {
        tracing::debug!("{}", args);
    }
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Completes the handshake, then never reads a notification
fn stuck_client(path: &std::path::Path) -> UnixStream {
    let mut stream = UnixStream::connect(path).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut handshake = vec![0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut handshake).unwrap();
    stream.write_all(&handshake).unwrap();
    stream
}

#[test]
fn test_stale_commitment_is_recovered_within_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TransportConfig {
        segment_dir: dir.path().to_path_buf(),
        ..TransportConfig::default()
    };
    let path = dir.path().join("crashy");
    let logger = Arc::new(CountingLogger::default());
    let mut writer =
        Writer::create_with_config(&path, 32, "bytes", &cfg, logger.clone()).unwrap();

    let stuck = stuck_client(&path);
    wait_for("stuck client", || writer.num_readers() == 1);

    assert!(writer.copy_to_shm(b"first"));
    assert_eq!(logger.errors.load(Ordering::SeqCst), 0);

    // the stuck client still owes a release for "first"
    let started = Instant::now();
    assert!(writer.copy_to_shm(b"second"));
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(900), "waited only {waited:?}");
    assert!(waited < Duration::from_millis(1500), "waited {waited:?}");
    assert_eq!(logger.errors.load(Ordering::SeqCst), 1);

    drop(stuck);
    wait_for("stuck client to go", || writer.num_readers() == 0);

    let frames = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
    let sink = Arc::clone(&frames);
    let reader = Reader::new_with_config(
        &path,
        Arc::new(move |data: &[u8]| sink.lock().push(data.to_vec())),
        &cfg,
        logger.clone(),
    );
    assert!(reader.is_valid());
    wait_for("reader", || writer.num_readers() == 1);

    // "second" was committed to the stuck client too: one more recovery
    assert!(writer.copy_to_shm(b"third"));
    wait_for("third", || frames.lock().len() == 1);

    let started = Instant::now();
    assert!(writer.copy_to_shm(b"fourth"));
    assert!(started.elapsed() < Duration::from_millis(500));
    wait_for("fourth", || frames.lock().len() == 2);

    assert_eq!(frames.lock()[0], b"third");
    assert_eq!(frames.lock()[1], b"fourth");
    assert_eq!(logger.errors.load(Ordering::SeqCst), 2);
}
