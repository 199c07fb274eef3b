//! pty-host - cross-platform pseudo-terminal hosting
//!
//! Spawns a child program attached to a freshly created PTY and hands back
//! a connection exposing the byte streams, window resizing, kill, and exit
//! notification, with a teardown order that leaves no zombies, orphaned
//! conhost sessions, or leaked handles behind.
//!
//! Key pieces:
//! - Unix: `forkpty` + `execvp` with all allocation done before the fork
//! - Windows: ConPTY bound to anonymous pipes, with a `KILL_ON_JOB_CLOSE`
//!   job object catching grandchildren
//! - One background watcher per connection surfacing a one-shot exited
//!   event
//!
//! ```no_run
//! use pty_host::{spawn, SpawnOptions};
//! use std::io::Read;
//!
//! let mut options = SpawnOptions::new("/bin/sh", "/");
//! options.command_line = vec!["-c".into(), "echo hello".into()];
//! let mut conn = spawn(&options)?;
//!
//! let mut buf = [0u8; 1024];
//! let n = conn.read(&mut buf)?;
//! println!("{}", String::from_utf8_lossy(&buf[..n]));
//!
//! conn.wait_for_exit(Some(std::time::Duration::from_secs(5)))?;
//! # Ok::<(), pty_host::Error>(())
//! ```

#[cfg_attr(not(windows), allow(dead_code))]
mod cmdline;
mod error;
mod exit;
mod options;
mod size;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

pub use error::{Error, Result};
pub use exit::ExitStatus;
pub use options::SpawnOptions;
pub use size::WindowSize;

#[cfg(unix)]
pub use unix::{PtyReader, PtyWriter, UnixPtyConnection};
#[cfg(windows)]
pub use windows::{PtyReader, PtyWriter, WindowsPtyConnection};

/// The connection type for the host platform
#[cfg(unix)]
pub type PtyConnection = UnixPtyConnection;
/// The connection type for the host platform
#[cfg(windows)]
pub type PtyConnection = WindowsPtyConnection;

/// Spawn `options.app` attached to a new PTY.
///
/// Options are validated before any OS resource is touched; a returned
/// connection always carries a positive pid and a child that is already
/// running inside the PTY (and, on Windows, assigned to the job object).
pub fn spawn(options: &SpawnOptions) -> Result<PtyConnection> {
    options.validate()?;
    #[cfg(unix)]
    {
        unix::spawn(options)
    }
    #[cfg(windows)]
    {
        windows::spawn(options)
    }
}

/// Spawn the user's shell with the given window size.
///
/// Uses `$SHELL` (falling back to `/bin/sh`) on Unix and `cmd.exe` on
/// Windows, starting in the user's home directory.
pub fn spawn_shell(size: WindowSize) -> Result<PtyConnection> {
    #[cfg(unix)]
    let (app, cwd) = (
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
        std::env::var("HOME").unwrap_or_else(|_| "/".to_string()),
    );
    #[cfg(windows)]
    let (app, cwd) = (
        "cmd.exe".to_string(),
        std::env::var("USERPROFILE").unwrap_or_else(|_| "C:\\".to_string()),
    );

    let mut options = SpawnOptions::new(app, cwd);
    options.cols = size.cols;
    options.rows = size.rows;
    spawn(&options)
}
