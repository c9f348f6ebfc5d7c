//! Basic functionality tests for the shmdata transport

use parking_lot::Mutex;
use proptest::prelude::*;
use proptest::test_runner::{Config as ProptestConfig, TestRunner};
use shmdata::{Callbacks, Reader, ShmError, ShmResult, TransportConfig, Writer, default_logger};
use std::cell::RefCell;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn config(dir: &Path) -> TransportConfig {
    TransportConfig {
        segment_dir: dir.to_path_buf(),
        ..TransportConfig::default()
    }
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Reader recording every frame it is handed
fn recording_reader(path: &Path, cfg: &TransportConfig) -> (Reader, Arc<Mutex<Vec<Vec<u8>>>>) {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&frames);
    let reader = Reader::new_with_config(
        path,
        Arc::new(move |data: &[u8]| sink.lock().push(data.to_vec())),
        cfg,
        default_logger(),
    );
    (reader, frames)
}

#[test]
fn test_scenario_64_byte_frame() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let cfg = config(dir.path());
    let path = dir.path().join("t1");
    let mut writer = Writer::create_with_config(&path, 64, "app/x-test", &cfg, default_logger())?;

    let (reader, frames) = recording_reader(&path, &cfg);
    assert!(reader.is_valid());
    wait_for("reader to connect", || writer.num_readers() == 1);

    let payload: Vec<u8> = (0u8..64).collect();
    assert!(writer.copy_to_shm(&payload));

    wait_for("frame", || frames.lock().len() == 1);
    let received = frames.lock()[0].clone();
    assert_eq!(received.len(), 64);
    assert_eq!(received, payload);
    Ok(())
}

#[test]
fn test_reader_before_writer_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let (reader, frames) = recording_reader(&dir.path().join("t2"), &cfg);
    assert!(!reader.is_valid());
    drop(reader);
    assert!(frames.lock().is_empty());
}

#[test]
fn test_oversize_copy_returns_false() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let cfg = config(dir.path());
    let mut writer =
        Writer::create_with_config(dir.path().join("small"), 16, "bytes", &cfg, default_logger())?;
    assert!(!writer.copy_to_shm(&[1u8; 17]));
    assert!(writer.copy_to_shm(&[1u8; 16]));
    Ok(())
}

#[test]
fn test_every_reader_receives_every_frame() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let cfg = config(dir.path());
    let path = dir.path().join("fanout");
    let mut writer = Writer::create_with_config(&path, 128, "bytes", &cfg, default_logger())?;

    let readers: Vec<_> = (0..3).map(|_| recording_reader(&path, &cfg)).collect();
    assert!(readers.iter().all(|(reader, _)| reader.is_valid()));
    wait_for("three readers", || writer.num_readers() == 3);

    for i in 0..10u8 {
        let frame = vec![i; usize::from(i) + 1];
        assert!(writer.copy_to_shm(&frame));
    }

    for (_, frames) in &readers {
        wait_for("ten frames", || frames.lock().len() == 10);
        for (i, frame) in frames.lock().iter().enumerate() {
            assert_eq!(frame, &vec![i as u8; i + 1]);
        }
    }
    Ok(())
}

#[test]
fn test_second_writer_is_already_owned() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let cfg = config(dir.path());
    let path = dir.path().join("owned");
    let _first = Writer::create_with_config(&path, 32, "bytes", &cfg, default_logger())?;

    let second = Writer::create_with_config(&path, 32, "bytes", &cfg, default_logger());
    assert!(matches!(second, Err(ShmError::AlreadyOwned { .. })));
    Ok(())
}

#[test]
fn test_writer_drop_disconnects_reader_once() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let cfg = config(dir.path());
    let path = dir.path().join("bye");
    let writer = Writer::create_with_config(&path, 32, "bytes", &cfg, default_logger())?;

    let disconnects = Arc::new(AtomicUsize::new(0));
    let handler = {
        let disconnects = Arc::clone(&disconnects);
        Callbacks::new(|_| {}).on_disconnect(move || {
            disconnects.fetch_add(1, Ordering::SeqCst);
        })
    };
    let reader = Reader::new_with_config(&path, Arc::new(handler), &cfg, default_logger());
    assert!(reader.is_valid());

    drop(writer);
    wait_for("disconnect", || disconnects.load(Ordering::SeqCst) == 1);
    assert!(!reader.is_valid());

    drop(reader);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_resized_frames_are_delivered() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let cfg = config(dir.path());
    let path = dir.path().join("grow");
    let mut writer = Writer::create_with_config(&path, 8, "bytes", &cfg, default_logger())?;
    let (_reader, frames) = recording_reader(&path, &cfg);
    wait_for("reader", || writer.num_readers() == 1);

    let big = vec![0x42u8; 10_000];
    {
        let mut access = writer.get_one_write_access_resize(big.len())?;
        access.data_mut()[..big.len()].copy_from_slice(&big);
        access.notify_clients(big.len());
    }
    assert_eq!(writer.alloc_size(), big.len());

    wait_for("resized frame", || frames.lock().len() == 1);
    assert_eq!(frames.lock()[0], big);
    Ok(())
}

#[test]
fn test_delivery_is_byte_identical_for_any_size() {
    const CAPACITY: usize = 256;

    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let path = dir.path().join("prop");
    let writer =
        Writer::create_with_config(&path, CAPACITY, "bytes", &cfg, default_logger()).unwrap();
    let (_reader, frames) = recording_reader(&path, &cfg);
    wait_for("reader", || writer.num_readers() == 1);

    let writer = RefCell::new(writer);
    let mut runner = TestRunner::new(ProptestConfig::with_cases(48));
    runner
        .run(
            &proptest::collection::vec(any::<u8>(), 0..=CAPACITY),
            |buf| {
                let before = frames.lock().len();
                prop_assert!(writer.borrow_mut().copy_to_shm(&buf));
                wait_for("frame", || frames.lock().len() > before);
                let last = frames.lock().last().cloned().unwrap_or_default();
                prop_assert_eq!(last, buf);
                Ok(())
            },
        )
        .unwrap();
}
