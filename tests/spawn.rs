//! End-to-end spawn scenarios
//!
//! Each test drives a real shell through the public API: spawn, read the
//! terminal output, resize, kill, and observe exit.

#![cfg(unix)]

use std::io::Read;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use pty_host::{spawn, Error, ExitStatus, PtyReader, SpawnOptions, WindowSize};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn shell_options(args: &[&str]) -> SpawnOptions {
    let mut options = SpawnOptions::new("/bin/sh", "/");
    options.command_line = args.iter().map(|a| a.to_string()).collect();
    options.cols = 120;
    options.rows = 25;
    options
}

/// Read from the PTY on a helper thread until `pred` matches the collected
/// output or the deadline passes; returns everything read.
fn read_until(mut reader: PtyReader, pred: impl Fn(&str) -> bool, timeout: Duration) -> String {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut collected = String::new();
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    collected.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if tx.send(collected.clone()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = tx.send(collected);
    });

    let deadline = std::time::Instant::now() + timeout;
    let mut last = String::new();
    while std::time::Instant::now() < deadline {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(output) => {
                if pred(&output) {
                    return output;
                }
                last = output;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    last
}

#[test]
fn test_echo_output_reaches_reader() {
    init_logging();
    let conn = spawn(&shell_options(&["-c", "echo test"])).unwrap();
    let reader = conn.try_clone_reader().unwrap();
    let output = read_until(reader, |s| s.contains("test"), Duration::from_secs(10));
    assert!(output.contains("test"), "got {output:?}");
}

#[test]
fn test_exit_event_carries_zero_code() {
    init_logging();
    let conn = spawn(&shell_options(&["-c", "echo test"])).unwrap();
    assert!(conn.pid() > 0);

    let exited = conn.subscribe_exit();
    let status = exited.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(status, ExitStatus::Exited(0));
    assert_eq!(conn.exit_status(), Some(ExitStatus::Exited(0)));
}

#[test]
fn test_environment_reaches_child() {
    init_logging();
    let mut options = shell_options(&["-c", "echo $MY_TEST_VAR"]);
    options
        .environment
        .insert("MY_TEST_VAR".to_string(), "custom_value_12345".to_string());
    let conn = spawn(&options).unwrap();
    let reader = conn.try_clone_reader().unwrap();
    let output = read_until(
        reader,
        |s| s.contains("custom_value_12345"),
        Duration::from_secs(10),
    );
    assert!(output.contains("custom_value_12345"), "got {output:?}");
}

#[test]
fn test_empty_value_unsets_variable() {
    init_logging();
    // HOME is inherited; an empty override must remove it in the child
    let mut options = shell_options(&["-c", "echo HOME=[$HOME]"]);
    options.environment.insert("HOME".to_string(), String::new());
    let conn = spawn(&options).unwrap();
    let reader = conn.try_clone_reader().unwrap();
    let output = read_until(reader, |s| s.contains("HOME=[]"), Duration::from_secs(10));
    assert!(output.contains("HOME=[]"), "got {output:?}");
}

#[test]
fn test_resize_interactive_shell() {
    init_logging();
    let mut conn = spawn(&shell_options(&[])).unwrap();
    conn.resize(WindowSize::new(120, 40)).unwrap();
    conn.resize(WindowSize::new(40, 10)).unwrap();
    let size = conn.window_size().unwrap();
    assert_eq!((size.cols, size.rows), (40, 10));

    conn.kill().unwrap();
    assert!(conn
        .wait_for_exit(Some(Duration::from_secs(5)))
        .unwrap());
    conn.dispose().unwrap();
}

#[test]
fn test_kill_then_wait_reaps() {
    init_logging();
    let mut conn = spawn(&shell_options(&[])).unwrap();
    thread::sleep(Duration::from_millis(500));
    conn.kill().unwrap();
    assert!(conn
        .wait_for_exit(Some(Duration::from_secs(5)))
        .unwrap());
    assert!(conn.exit_status().is_some());
    conn.dispose().unwrap();
}

#[test]
fn test_wait_times_out_while_running() {
    init_logging();
    let mut conn = spawn(&shell_options(&[])).unwrap();
    assert!(!conn
        .wait_for_exit(Some(Duration::from_millis(100)))
        .unwrap());
    assert!(conn.is_running());
    assert_eq!(conn.exit_status(), None);

    conn.kill().unwrap();
    assert!(conn
        .wait_for_exit(Some(Duration::from_secs(5)))
        .unwrap());
    conn.dispose().unwrap();
}

#[test]
fn test_empty_app_rejected_synchronously() {
    init_logging();
    let options = SpawnOptions::new("", "/");
    assert!(matches!(
        spawn(&options),
        Err(Error::InvalidArguments(_))
    ));
}

#[test]
fn test_compound_command_output_ordered() {
    init_logging();
    let conn = spawn(&shell_options(&["-c", "echo first && echo second"])).unwrap();
    let reader = conn.try_clone_reader().unwrap();
    let output = read_until(
        reader,
        |s| s.contains("first") && s.contains("second"),
        Duration::from_secs(10),
    );
    let first = output.find("first").expect("missing 'first'");
    let second = output.find("second").expect("missing 'second'");
    assert!(first < second, "out of order: {output:?}");
}

#[test]
fn test_write_reaches_interactive_shell() {
    init_logging();
    let mut conn = spawn(&shell_options(&[])).unwrap();
    let reader = conn.try_clone_reader().unwrap();
    conn.write_all(b"echo MARKER_roundtrip_MARKER\n").unwrap();
    let output = read_until(
        reader,
        |s| s.contains("MARKER_roundtrip_MARKER"),
        Duration::from_secs(10),
    );
    assert!(output.contains("MARKER_roundtrip_MARKER"), "got {output:?}");

    conn.kill().unwrap();
    assert!(conn
        .wait_for_exit(Some(Duration::from_secs(5)))
        .unwrap());
    conn.dispose().unwrap();
}

#[test]
fn test_spawn_shell_convenience() {
    init_logging();
    let mut conn = pty_host::spawn_shell(WindowSize::new(100, 30)).unwrap();
    assert!(conn.pid() > 0);
    let size = conn.window_size().unwrap();
    assert_eq!((size.cols, size.rows), (100, 30));
    conn.kill().unwrap();
    assert!(conn
        .wait_for_exit(Some(Duration::from_secs(5)))
        .unwrap());
    conn.dispose().unwrap();
}

#[test]
fn test_exec_failure_surfaces_as_nonzero_exit() {
    init_logging();
    let options = SpawnOptions::new("/nonexistent/binary/path", "/");
    // forkpty succeeds; execvp fails in the child, which exits with errno
    let conn = spawn(&options).unwrap();
    assert!(conn
        .wait_for_exit(Some(Duration::from_secs(5)))
        .unwrap());
    match conn.exit_status() {
        Some(ExitStatus::Exited(code)) => assert_ne!(code, 0),
        other => panic!("unexpected status {other:?}"),
    }
}
