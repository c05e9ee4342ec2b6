//! End-to-end resource checks against the running test process.
//!
//! Native thread counts are excluded here: the test harness starts threads
//! for other tests of this file at any time.

#![cfg(target_os = "linux")]

use std::fs::File;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use leakprobe::tracking::{subprocess, tempfiles};
use leakprobe::{Checkers, LeakError, LeakTest, Resource, Tolerance, threads};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn harness() -> LeakTest {
    LeakTest::new()
        .checkers(Checkers::exclude(&["memory", "c_threads"]).unwrap())
        .times(10)
        .warmup_times(2)
        .retries(3)
}

#[test]
fn test_unclosed_file_descriptor() {
    let _guard = serial();
    let mut kept = Vec::new();
    let err = harness()
        .execute_named("open_devnull", || {
            kept.push(File::open("/dev/null").unwrap());
        })
        .unwrap_err();

    assert_eq!(err.resource(), Some(Resource::FileDescriptor));
    let evidence = err.evidence().unwrap();
    assert_eq!(evidence.count, 1);
    assert_eq!(evidence.extras.len(), evidence.count, "{:?}", evidence.extras);
    let fd = {
        use std::os::fd::AsRawFd;
        kept[0].as_raw_fd()
    };
    assert_eq!(evidence.extras, vec![format!("fd {fd} -> /dev/null")]);
    assert_eq!(
        err.to_string(),
        "detected 1 unclosed file descriptor after calling 'open_devnull' 1 time"
    );
}

#[test]
fn test_closed_file_descriptor_passes() {
    let _guard = serial();
    harness()
        .execute(|| {
            let f = File::open("/dev/null").unwrap();
            drop(f);
        })
        .unwrap();
}

#[test]
fn test_undeleted_temp_file() {
    let _guard = serial();
    let mut paths = Vec::new();
    let err = harness()
        .execute_fallible(|| -> std::io::Result<()> {
            let (_file, path) = tempfiles::mkstemp()?;
            paths.push(path);
            Ok(())
        })
        .unwrap_err();

    assert_eq!(err.resource(), Some(Resource::TempFile));
    let evidence = err.evidence().unwrap();
    assert_eq!(evidence.extras, vec![paths[0].display().to_string()]);
    assert!(paths[0].exists());

    for path in paths {
        std::fs::remove_file(path).unwrap();
    }
}

#[test]
fn test_undeleted_temp_dir() {
    let _guard = serial();
    let mut dirs = Vec::new();
    let err = harness()
        .execute_fallible(|| -> std::io::Result<()> {
            dirs.push(tempfiles::mkdtemp()?);
            Ok(())
        })
        .unwrap_err();

    assert_eq!(err.resource(), Some(Resource::TempDir));
    assert!(err.to_string().contains("undeleted temporary directory"));

    for dir in dirs {
        std::fs::remove_dir(dir).unwrap();
    }
}

#[test]
fn test_removed_temp_files_pass() {
    let _guard = serial();
    harness()
        .execute_fallible(|| -> std::io::Result<()> {
            let file = tempfiles::named_tempfile()?;
            let dir = tempfiles::tempdir()?;
            drop(file);
            dir.close()
        })
        .unwrap();
}

#[test]
fn test_subprocess_not_waited() {
    let _guard = serial();
    let mut children = Vec::new();
    let err = harness()
        .execute_fallible(|| {
            let child = subprocess::spawn(
                Command::new("sleep")
                    .arg("1")
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null()),
            )?;
            children.push(child);
            Ok::<(), std::io::Error>(())
        })
        .unwrap_err();

    assert_eq!(err.resource(), Some(Resource::Subprocess));
    let evidence = err.evidence().unwrap();
    assert!(evidence.extras[0].contains("(sleep)"), "{:?}", evidence.extras);

    for mut child in children {
        child.kill().ok();
        child.wait().unwrap();
    }
}

#[test]
fn test_waited_subprocess_passes() {
    let _guard = serial();
    harness()
        .execute_fallible(|| {
            let output = subprocess::spawn(
                Command::new("sh")
                    .args(["-c", "echo hello"])
                    .stdout(Stdio::piped()),
            )?
            .wait_with_output()?;
            assert_eq!(output.stdout, b"hello\n");
            Ok::<(), std::io::Error>(())
        })
        .unwrap();
}

#[test]
fn test_managed_thread_left_running() {
    let _guard = serial();
    let mut handles = Vec::new();
    let err = harness()
        .execute_fallible(|| {
            let handle = threads::Builder::new()
                .name("sleeper")
                .spawn(|| std::thread::sleep(Duration::from_millis(300)))?;
            handles.push(handle);
            Ok::<(), std::io::Error>(())
        })
        .unwrap_err();

    assert_eq!(err.resource(), Some(Resource::ManagedThread));
    let evidence = err.evidence().unwrap();
    assert!(evidence.extras[0].starts_with("<Thread(sleeper"), "{:?}", evidence.extras);

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_joined_managed_thread_passes() {
    let _guard = serial();
    harness()
        .execute_fallible(|| {
            threads::spawn(|| 1 + 1)?.join().unwrap();
            Ok::<(), std::io::Error>(())
        })
        .unwrap();
}

#[test]
fn test_trim_callback_and_memory_stage() {
    let _guard = serial();
    let trims = Arc::new(AtomicUsize::new(0));
    let counter = trims.clone();
    harness()
        .checkers(Checkers::exclude(&["c_threads"]).unwrap())
        .tolerance(Tolerance::Uniform(1 << 30))
        .trim_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .execute(|| {})
        .unwrap();
    assert!(trims.load(Ordering::SeqCst) >= 2);
}

#[test]
fn test_expected_error_is_absorbed() {
    let _guard = serial();
    harness()
        .execute_expect_err(
            || File::open("/nonexistent/leakprobe"),
            |e: &std::io::Error| e.kind() == std::io::ErrorKind::NotFound,
        )
        .unwrap();

    let err = harness()
        .call()
        .name("open_devnull")
        .execute_expect_err(|| File::open("/dev/null"), |_: &std::io::Error| true)
        .unwrap_err();
    assert!(matches!(err, LeakError::DidNotFail { .. }));
}

#[test]
fn test_invalid_parameters() {
    let _guard = serial();
    let calls = AtomicUsize::new(0);
    let cases: [(LeakTest, &str); 3] = [
        (harness().times(0), "times must be >= 1 (got 0)"),
        (
            harness().tolerance(Tolerance::per_metric([("nonexistent", 1)])),
            "invalid tolerance key 'nonexistent'",
        ),
        (
            harness().tolerance(Tolerance::per_metric([("Heap", 1)])),
            "invalid tolerance key 'Heap'",
        ),
    ];
    for (test, message) in cases {
        let err = test
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap_err();
        assert!(matches!(err, LeakError::Config(_)));
        assert_eq!(err.to_string(), message);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert!(Checkers::only(&["nonexistent"]).is_err());
    assert!("-1".parse::<Tolerance>().is_err());
}
