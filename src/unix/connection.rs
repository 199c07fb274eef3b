//! Unix PTY connection
//!
//! Wraps the controller fd and child pid produced by the fork path, exposes
//! the byte streams, and owns the teardown order: exit watcher first, then
//! the dup'd streams, the controller fd last.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::debug;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use super::fork::SpawnedChild;
use crate::error::{Error, Result};
use crate::exit::{lock, ExitNotifier, ExitStatus};
use crate::size::WindowSize;

/// Grace period between SIGHUP and SIGKILL in [`UnixPtyConnection::kill`]
const KILL_GRACE: Duration = Duration::from_millis(50);

/// Read half of a PTY connection.
///
/// Linux reports `EIO` on the controller once the follower side is gone;
/// that is the PTY's end-of-stream and reads as EOF here.
pub struct PtyReader {
    file: File,
}

impl Read for PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.file.read(buf) {
            Err(e) if e.raw_os_error() == Some(libc::EIO) => Ok(0),
            other => other,
        }
    }
}

/// Write half of a PTY connection
pub struct PtyWriter {
    file: File,
}

impl Write for PtyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// A child process attached to a PTY
pub struct UnixPtyConnection {
    pid: libc::pid_t,
    label: Option<String>,
    /// Controller (master) fd; `None` once disposed
    controller: Mutex<Option<OwnedFd>>,
    reader: Option<PtyReader>,
    writer: Option<PtyWriter>,
    notifier: Arc<ExitNotifier>,
}

impl UnixPtyConnection {
    pub(crate) fn new(spawned: SpawnedChild, label: Option<String>) -> Result<Self> {
        let reader = PtyReader {
            file: File::from(spawned.controller.try_clone()?),
        };
        let writer = PtyWriter {
            file: File::from(spawned.controller.try_clone()?),
        };

        let notifier = Arc::new(ExitNotifier::new());
        let watcher_notifier = Arc::clone(&notifier);
        let pid = spawned.pid;
        thread::Builder::new()
            .name(format!("pty-exit-{pid}"))
            .spawn(move || watch_exit(pid, watcher_notifier))
            .map_err(Error::Io)?;

        Ok(Self {
            pid,
            label,
            controller: Mutex::new(Some(spawned.controller)),
            reader: Some(reader),
            writer: Some(writer),
            notifier,
        })
    }

    /// The child process id; always positive
    pub fn pid(&self) -> u32 {
        self.pid as u32
    }

    /// Read output the child wrote to its terminal. Blocks until bytes
    /// arrive, EOF, or error.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reader.as_mut() {
            Some(reader) => reader.read(buf),
            None => Err(disposed_io()),
        }
    }

    /// Write bytes that reach the child as terminal input
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(disposed_io()),
        }
    }

    /// Write all bytes to the child's input
    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write_all(buf),
            None => Err(disposed_io()),
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Err(disposed_io()),
        }
    }

    /// An independent read stream over the same PTY, for dedicated reader
    /// threads
    pub fn try_clone_reader(&self) -> Result<PtyReader> {
        let guard = lock(&self.controller);
        let fd = guard.as_ref().ok_or(Error::AlreadyDisposed)?;
        Ok(PtyReader {
            file: File::from(fd.try_clone()?),
        })
    }

    /// An independent write stream over the same PTY
    pub fn try_clone_writer(&self) -> Result<PtyWriter> {
        let guard = lock(&self.controller);
        let fd = guard.as_ref().ok_or(Error::AlreadyDisposed)?;
        Ok(PtyWriter {
            file: File::from(fd.try_clone()?),
        })
    }

    /// Change the terminal dimensions. The kernel delivers SIGWINCH to the
    /// foreground process group as part of the ioctl.
    pub fn resize(&self, size: WindowSize) -> Result<()> {
        let guard = lock(&self.controller);
        let fd = guard.as_ref().ok_or(Error::AlreadyDisposed)?;
        let winsize = size.to_winsize();
        let rc = unsafe {
            libc::ioctl(
                fd.as_raw_fd(),
                libc::TIOCSWINSZ as libc::c_ulong,
                &winsize,
            )
        };
        if rc == -1 {
            Err(Error::ResizeFailed {
                os_error: last_errno(),
            })
        } else {
            Ok(())
        }
    }

    /// Current terminal dimensions
    pub fn window_size(&self) -> Result<WindowSize> {
        let guard = lock(&self.controller);
        let fd = guard.as_ref().ok_or(Error::AlreadyDisposed)?;
        // SAFETY: TIOCGWINSZ fills the winsize struct
        let mut winsize: libc::winsize = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::ioctl(
                fd.as_raw_fd(),
                libc::TIOCGWINSZ as libc::c_ulong,
                &mut winsize,
            )
        };
        if rc == -1 {
            Err(Error::ResizeFailed {
                os_error: last_errno(),
            })
        } else {
            Ok(WindowSize::from(winsize))
        }
    }

    /// Terminate the child and everything it started.
    ///
    /// Sends SIGHUP to the foreground process group so hangup handlers get a
    /// chance to run, then SIGKILL to the group and the leader. Targeting
    /// `-pid` is what reaches children the shell spawned; signalling the
    /// leader alone leaks them.
    pub fn kill(&self) -> Result<()> {
        {
            let guard = lock(&self.controller);
            if guard.is_none() {
                return Err(Error::AlreadyDisposed);
            }
        }
        let group = Pid::from_raw(-self.pid);
        let leader = Pid::from_raw(self.pid);

        if let Err(e) = kill(group, Signal::SIGHUP) {
            debug!("SIGHUP to group {} failed: {e}", self.pid);
        }
        thread::sleep(KILL_GRACE);
        let _ = kill(group, Signal::SIGKILL);
        let _ = kill(leader, Signal::SIGKILL);
        Ok(())
    }

    /// Wait until the child has been reaped. `None` waits indefinitely.
    /// Returns `false` on timeout, and when the child was already reaped
    /// elsewhere (`ECHILD` in the watcher).
    pub fn wait_for_exit(&self, timeout: Option<Duration>) -> Result<bool> {
        if self.notifier.is_disposed() {
            return Err(Error::AlreadyDisposed);
        }
        Ok(self.notifier.wait(timeout))
    }

    /// The exit status; `Some` once the exited event has fired
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.notifier.status()
    }

    /// Subscribe to the one-shot exited event. The receiver observes the
    /// status exactly once, even when subscribing after the child exited.
    pub fn subscribe_exit(&self) -> Receiver<ExitStatus> {
        self.notifier.subscribe()
    }

    /// Best-effort liveness probe based on the watcher's state
    pub fn is_running(&self) -> bool {
        self.notifier.status().is_none() && !self.notifier.has_ended()
    }

    /// Release all owned resources: watcher first, then the byte streams,
    /// the controller fd last. Idempotent; never blocks on a live child.
    pub fn dispose(&mut self) -> Result<()> {
        let mut guard = lock(&self.controller);
        if guard.is_none() {
            return Ok(());
        }
        debug!(
            "disposing pty connection {} (pid {})",
            self.label.as_deref().unwrap_or(""),
            self.pid
        );
        self.notifier.mark_disposed();
        self.reader = None;
        self.writer = None;
        *guard = None;
        Ok(())
    }
}

impl Drop for UnixPtyConnection {
    fn drop(&mut self) {
        let _ = self.dispose();
    }
}

fn disposed_io() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "PTY connection disposed")
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

fn terminal_status(status: WaitStatus) -> Option<ExitStatus> {
    match status {
        WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(ExitStatus::Signaled(signal as i32)),
        _ => None,
    }
}

/// Background exit watcher: reaps the child and completes the notifier.
///
/// Linux blocks in `waitpid`. On macOS a blocking `waitpid` can hang in
/// some PTY/signal configurations (seen on ARM64), so the watcher polls
/// with `WNOHANG` at 100 ms and lets disposal cancel the loop.
#[cfg(not(target_os = "macos"))]
fn watch_exit(pid: libc::pid_t, notifier: Arc<ExitNotifier>) {
    let child = Pid::from_raw(pid);
    loop {
        match waitpid(child, None) {
            Ok(status) => {
                if let Some(status) = terminal_status(status) {
                    notifier.notify_exit(status);
                    return;
                }
            }
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => {
                debug!("exit watcher for pid {pid} stopping: {e}");
                notifier.notify_ended();
                return;
            }
        }
    }
}

#[cfg(target_os = "macos")]
fn watch_exit(pid: libc::pid_t, notifier: Arc<ExitNotifier>) {
    use nix::sys::wait::WaitPidFlag;

    let child = Pid::from_raw(pid);
    loop {
        if notifier.is_disposed() {
            return;
        }
        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => thread::sleep(Duration::from_millis(100)),
            Ok(status) => {
                if let Some(status) = terminal_status(status) {
                    notifier.notify_exit(status);
                    return;
                }
                thread::sleep(Duration::from_millis(100));
            }
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => {
                debug!("exit watcher for pid {pid} stopping: {e}");
                notifier.notify_ended();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SpawnOptions;

    fn spawn_sh(args: &[&str]) -> UnixPtyConnection {
        let mut options = SpawnOptions::new("/bin/sh", "/");
        options.command_line = args.iter().map(|a| a.to_string()).collect();
        crate::unix::spawn(&options).unwrap()
    }

    #[test]
    fn test_pid_positive() {
        let mut conn = spawn_sh(&["-c", "true"]);
        assert!(conn.pid() > 0);
        assert!(conn.wait_for_exit(Some(Duration::from_secs(5))).unwrap());
        conn.dispose().unwrap();
    }

    #[test]
    fn test_exit_status_after_wait() {
        let conn = spawn_sh(&["-c", "exit 3"]);
        assert!(conn.wait_for_exit(Some(Duration::from_secs(5))).unwrap());
        assert_eq!(conn.exit_status(), Some(ExitStatus::Exited(3)));
    }

    #[test]
    fn test_resize_succeeds_before_dispose() {
        let mut conn = spawn_sh(&[]);
        conn.resize(WindowSize::new(120, 40)).unwrap();
        let size = conn.window_size().unwrap();
        assert_eq!(size.cols, 120);
        assert_eq!(size.rows, 40);
        conn.kill().unwrap();
        assert!(conn.wait_for_exit(Some(Duration::from_secs(5))).unwrap());
        conn.dispose().unwrap();
    }

    #[test]
    fn test_operations_fail_after_dispose() {
        let mut conn = spawn_sh(&["-c", "true"]);
        conn.wait_for_exit(Some(Duration::from_secs(5))).unwrap();
        conn.dispose().unwrap();
        assert!(matches!(
            conn.resize(WindowSize::default()),
            Err(Error::AlreadyDisposed)
        ));
        assert!(matches!(conn.kill(), Err(Error::AlreadyDisposed)));
        assert!(matches!(
            conn.try_clone_reader(),
            Err(Error::AlreadyDisposed)
        ));
        assert!(conn.read(&mut [0u8; 8]).is_err());
        // second dispose is a no-op
        conn.dispose().unwrap();
    }

    #[test]
    fn test_kill_reaps_process_group() {
        // the sleep is a grandchild; group-targeted signals must take it down
        let mut conn = spawn_sh(&["-c", "sleep 600"]);
        thread::sleep(Duration::from_millis(200));
        conn.kill().unwrap();
        assert!(conn.wait_for_exit(Some(Duration::from_secs(5))).unwrap());
        conn.dispose().unwrap();
    }
}
