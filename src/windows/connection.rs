//! Windows PTY connection
//!
//! Wraps the handle set the provider assembled and enforces the teardown
//! order that keeps conhost shutdown clean: exit watcher, pseudoconsole,
//! pipe ends, thread handle, process handle, and the job object last so
//! `KILL_ON_JOB_CLOSE` reaps anything still running.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::windows::io::{AsRawHandle, OwnedHandle};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::debug;
use windows::Win32::Foundation::{ERROR_BROKEN_PIPE, HANDLE, WAIT_OBJECT_0};
use windows::Win32::System::Threading::{
    GetExitCodeProcess, TerminateProcess, WaitForSingleObject, INFINITE,
};

use super::conpty::{JobObject, PseudoConsole};
use crate::error::{Error, Result};
use crate::exit::{lock, ExitNotifier, ExitStatus};
use crate::size::WindowSize;

/// Read half of a ConPTY connection.
///
/// Once conhost closes its end the pipe breaks; that is the stream's end
/// and reads as EOF here. Reads are unbuffered — buffering at this layer
/// adds latency to interactive sessions.
pub struct PtyReader {
    file: File,
}

impl Read for PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.file.read(buf) {
            Err(e) if e.raw_os_error() == Some(ERROR_BROKEN_PIPE.0 as i32) => Ok(0),
            other => other,
        }
    }
}

/// Write half of a ConPTY connection; unbuffered
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

/// Every OS resource the connection owns, in teardown order
struct HandleSet {
    pseudocon: PseudoConsole,
    input_write: OwnedHandle,
    output_read: OwnedHandle,
    thread: OwnedHandle,
    process: OwnedHandle,
    job: JobObject,
}

/// A child process attached to a pseudoconsole
pub struct WindowsPtyConnection {
    pid: u32,
    label: Option<String>,
    /// `None` once disposed
    handles: Mutex<Option<HandleSet>>,
    reader: Option<PtyReader>,
    writer: Option<PtyWriter>,
    notifier: Arc<ExitNotifier>,
}

impl WindowsPtyConnection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pid: u32,
        pseudocon: PseudoConsole,
        input_write: OwnedHandle,
        output_read: OwnedHandle,
        thread: OwnedHandle,
        process: OwnedHandle,
        job: JobObject,
        label: Option<String>,
    ) -> Result<Self> {
        let reader = PtyReader {
            file: File::from(output_read.try_clone()?),
        };
        let writer = PtyWriter {
            file: File::from(input_write.try_clone()?),
        };

        let notifier = Arc::new(ExitNotifier::new());
        let watcher_notifier = Arc::clone(&notifier);
        let watch_handle = process.try_clone()?;
        thread::Builder::new()
            .name(format!("pty-exit-{pid}"))
            .spawn(move || watch_exit(watch_handle, watcher_notifier))
            .map_err(Error::Io)?;

        Ok(Self {
            pid,
            label,
            handles: Mutex::new(Some(HandleSet {
                pseudocon,
                input_write,
                output_read,
                thread,
                process,
                job,
            })),
            reader: Some(reader),
            writer: Some(writer),
            notifier,
        })
    }

    /// The child process id; always positive
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Read output the child wrote to its console. Blocks until bytes
    /// arrive, EOF, or error.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reader.as_mut() {
            Some(reader) => reader.read(buf),
            None => Err(disposed_io()),
        }
    }

    /// Write bytes that reach the child as console input
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

    /// An independent read stream over the out-pipe, for dedicated reader
    /// threads
    pub fn try_clone_reader(&self) -> Result<PtyReader> {
        let guard = lock(&self.handles);
        let set = guard.as_ref().ok_or(Error::AlreadyDisposed)?;
        Ok(PtyReader {
            file: File::from(set.output_read.try_clone()?),
        })
    }

    /// An independent write stream over the in-pipe
    pub fn try_clone_writer(&self) -> Result<PtyWriter> {
        let guard = lock(&self.handles);
        let set = guard.as_ref().ok_or(Error::AlreadyDisposed)?;
        Ok(PtyWriter {
            file: File::from(set.input_write.try_clone()?),
        })
    }

    /// Change the console dimensions
    pub fn resize(&self, size: WindowSize) -> Result<()> {
        let guard = lock(&self.handles);
        let set = guard.as_ref().ok_or(Error::AlreadyDisposed)?;
        set.pseudocon.resize(size.cols, size.rows)
    }

    /// Terminate the child process. Grandchildren it spawned fall to the
    /// job object when the connection is disposed.
    pub fn kill(&self) -> Result<()> {
        let guard = lock(&self.handles);
        let set = guard.as_ref().ok_or(Error::AlreadyDisposed)?;
        let result = unsafe { TerminateProcess(HANDLE(set.process.as_raw_handle()), 1) };
        if let Err(e) = result {
            // already-exited children refuse termination; not an error here
            debug!("TerminateProcess for pid {}: {e}", self.pid);
        }
        Ok(())
    }

    /// Wait until the child's process handle signals. `None` waits
    /// indefinitely. Returns `false` on timeout.
    pub fn wait_for_exit(&self, timeout: Option<Duration>) -> Result<bool> {
        if self.notifier.is_disposed() {
            return Err(Error::AlreadyDisposed);
        }
        Ok(self.notifier.wait(timeout))
    }

    /// The exit code; `Some` once the exited event has fired
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.notifier.status()
    }

    /// Subscribe to the one-shot exited event
    pub fn subscribe_exit(&self) -> Receiver<ExitStatus> {
        self.notifier.subscribe()
    }

    /// Best-effort liveness probe based on the watcher's state
    pub fn is_running(&self) -> bool {
        self.notifier.status().is_none() && !self.notifier.has_ended()
    }

    /// Release all owned resources in the only order that lets conhost
    /// flush, lets pending pipe I/O finish with EOF, and reaps stray
    /// grandchildren. Idempotent.
    pub fn dispose(&mut self) -> Result<()> {
        let mut guard = lock(&self.handles);
        let Some(set) = guard.take() else {
            return Ok(());
        };
        debug!(
            "disposing pty connection {} (pid {})",
            self.label.as_deref().unwrap_or(""),
            self.pid
        );

        let HandleSet {
            pseudocon,
            input_write,
            output_read,
            thread,
            process,
            job,
        } = set;

        // 1. watcher stops observing
        self.notifier.mark_disposed();
        // 2. pseudoconsole first: conhost shuts down gracefully and flushes
        drop(pseudocon);
        // 3. pipe ends: pending reads and writes complete with EOF
        self.reader = None;
        self.writer = None;
        drop(input_write);
        drop(output_read);
        // 4. thread handle, then process handle
        drop(thread);
        drop(process);
        // 5. job last: KILL_ON_JOB_CLOSE terminates lingering grandchildren
        drop(job);
        Ok(())
    }
}

impl Drop for WindowsPtyConnection {
    fn drop(&mut self) {
        let _ = self.dispose();
    }
}

fn disposed_io() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "PTY connection disposed")
}

/// Background exit watcher: waits on a duplicated process handle and
/// completes the notifier with the process exit code.
fn watch_exit(process: OwnedHandle, notifier: Arc<ExitNotifier>) {
    let handle = HANDLE(process.as_raw_handle());
    let wait = unsafe { WaitForSingleObject(handle, INFINITE) };
    if wait != WAIT_OBJECT_0 {
        debug!("exit watcher wait returned {wait:?}");
        notifier.notify_ended();
        return;
    }
    let mut code = 0u32;
    match unsafe { GetExitCodeProcess(handle, &mut code) } {
        Ok(()) => notifier.notify_exit(ExitStatus::Exited(code as i32)),
        Err(e) => {
            debug!("exit watcher could not read exit code: {e}");
            notifier.notify_ended();
        }
    }
}
