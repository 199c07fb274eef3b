//! The fork+exec path
//!
//! `spawn_in_pty` wraps `forkpty` + `execvp`. Everything the child touches
//! (argv/env CStrings, the pointer tables, termios and winsize structs) is
//! allocated before the fork; between `forkpty` returning 0 and `execvp`
//! the child performs only `chdir`, `getenv`, `setenv`/`unsetenv` and
//! `_exit`. Keeping that window free of allocator and runtime machinery is
//! what makes forking from a threaded host safe in practice.

use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::ptr;

use libc::c_char;

use crate::error::{Error, Result};
use crate::size::WindowSize;

const TERM_NAME: &CStr = c"TERM";
const TERM_DEFAULT: &CStr = c"xterm-256color";

/// Terminal settings handed to `forkpty`, kept as plain integers plus a
/// fixed 32-slot control-character table and translated into the platform
/// `struct termios` just before the fork.
#[derive(Debug, Clone)]
pub(crate) struct TermiosSettings {
    pub iflag: u32,
    pub oflag: u32,
    pub cflag: u32,
    pub lflag: u32,
    pub cc: [u8; 32],
    pub ispeed: u32,
    pub ospeed: u32,
}

impl TermiosSettings {
    /// A standard cooked terminal: canonical input with echo and signals,
    /// CRNL translation both ways, 8-bit characters, 38400 baud.
    pub fn cooked() -> Self {
        let mut cc = [0u8; 32];
        cc[libc::VEOF] = 4; // ^D
        cc[libc::VERASE] = 0x7f;
        cc[libc::VWERASE] = 23; // ^W
        cc[libc::VKILL] = 21; // ^U
        cc[libc::VREPRINT] = 18; // ^R
        cc[libc::VINTR] = 3; // ^C
        cc[libc::VQUIT] = 0x1c; // ^\
        cc[libc::VSUSP] = 26; // ^Z
        cc[libc::VSTART] = 17; // ^Q
        cc[libc::VSTOP] = 19; // ^S
        cc[libc::VLNEXT] = 22; // ^V
        cc[libc::VDISCARD] = 15; // ^O
        cc[libc::VMIN] = 1;
        cc[libc::VTIME] = 0;

        Self {
            iflag: (libc::ICRNL
                | libc::IXON
                | libc::IXANY
                | libc::IMAXBEL
                | libc::BRKINT
                | libc::IUTF8) as u32,
            oflag: (libc::OPOST | libc::ONLCR) as u32,
            cflag: (libc::CREAD | libc::CS8 | libc::HUPCL) as u32,
            lflag: (libc::ICANON
                | libc::ISIG
                | libc::IEXTEN
                | libc::ECHO
                | libc::ECHOE
                | libc::ECHOK
                | libc::ECHOKE
                | libc::ECHOCTL) as u32,
            cc,
            ispeed: libc::B38400 as u32,
            ospeed: libc::B38400 as u32,
        }
    }

    fn to_native(&self) -> libc::termios {
        // SAFETY: termios is a plain C struct; zero is a valid initial state
        let mut term: libc::termios = unsafe { std::mem::zeroed() };
        term.c_iflag = self.iflag as libc::tcflag_t;
        term.c_oflag = self.oflag as libc::tcflag_t;
        term.c_cflag = self.cflag as libc::tcflag_t;
        term.c_lflag = self.lflag as libc::tcflag_t;

        // the platform may define fewer control-character slots than we carry
        let cc_len = term.c_cc.len().min(self.cc.len());
        for i in 0..cc_len {
            term.c_cc[i] = self.cc[i] as libc::cc_t;
        }

        unsafe {
            libc::cfsetispeed(&mut term, self.ispeed as libc::speed_t);
            libc::cfsetospeed(&mut term, self.ospeed as libc::speed_t);
        }
        term
    }
}

/// Result of a successful `spawn_in_pty`: the controller (master) side of
/// the PTY and the child pid.
pub(crate) struct SpawnedChild {
    pub controller: OwnedFd,
    pub pid: libc::pid_t,
}

fn nul_free(s: &str, what: &'static str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::InvalidArguments(what))
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// Fork a child attached to a fresh PTY and exec `file` in it.
///
/// `argv` includes the program name at index 0. `env` entries are applied
/// on top of the inherited environment in the child; an empty value unsets
/// the variable. `TERM` defaults to `xterm-256color` unless the caller or
/// the inherited environment already set it.
pub(crate) fn spawn_in_pty(
    file: &str,
    argv: &[String],
    env: &[(String, String)],
    working_dir: &str,
    modes: &TermiosSettings,
    size: WindowSize,
) -> Result<SpawnedChild> {
    // Marshal everything the child will need before forking.
    let file_c = nul_free(file, "app contains an interior NUL byte")?;

    let mut argv_c = Vec::with_capacity(argv.len());
    for arg in argv {
        argv_c.push(nul_free(arg, "argument contains an interior NUL byte")?);
    }
    let mut argv_ptrs: Vec<*const c_char> = argv_c.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(ptr::null());

    let mut env_c: Vec<(CString, Option<CString>)> = Vec::with_capacity(env.len());
    for (key, value) in env {
        let key_c = nul_free(key, "environment name contains an interior NUL byte")?;
        let value_c = if value.is_empty() {
            None
        } else {
            Some(nul_free(value, "environment value contains an interior NUL byte")?)
        };
        env_c.push((key_c, value_c));
    }

    let cwd_c = if working_dir.is_empty() {
        None
    } else {
        Some(nul_free(working_dir, "cwd contains an interior NUL byte")?)
    };

    let mut term = modes.to_native();
    let mut winsize = size.to_winsize();

    let mut controller: libc::c_int = -1;
    // SAFETY: forkpty allocates the PTY pair and forks; the child branch
    // below stays within the calls permitted after a fork.
    let pid = unsafe { libc::forkpty(&mut controller, ptr::null_mut(), &mut term, &mut winsize) };

    if pid < 0 {
        let os_error = last_errno();
        return Err(Error::SpawnFailed {
            os_error,
            message: format!(
                "forkpty failed: {}",
                io::Error::from_raw_os_error(os_error)
            ),
        });
    }

    if pid == 0 {
        // Child. No allocation, no locks, no logging from here on.
        unsafe {
            if let Some(dir) = &cwd_c {
                if libc::chdir(dir.as_ptr()) != 0 {
                    libc::_exit(last_errno());
                }
            }

            // default TERM without overriding a caller or inherited value
            if libc::getenv(TERM_NAME.as_ptr()).is_null() {
                libc::setenv(TERM_NAME.as_ptr(), TERM_DEFAULT.as_ptr(), 0);
            }

            for (key, value) in &env_c {
                match value {
                    Some(value) => {
                        libc::setenv(key.as_ptr(), value.as_ptr(), 1);
                    }
                    None => {
                        libc::unsetenv(key.as_ptr());
                    }
                }
            }

            libc::execvp(file_c.as_ptr(), argv_ptrs.as_ptr());
            // only reached when execvp failed
            libc::_exit(last_errno());
        }
    }

    // Parent.
    // SAFETY: forkpty returned a fresh controller fd we now own.
    let controller = unsafe { OwnedFd::from_raw_fd(controller) };
    Ok(SpawnedChild { controller, pid })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Read;

    #[test]
    fn test_cooked_defaults() {
        let modes = TermiosSettings::cooked();
        assert_ne!(modes.iflag & libc::ICRNL as u32, 0);
        assert_ne!(modes.iflag & libc::IUTF8 as u32, 0);
        assert_ne!(modes.oflag & libc::ONLCR as u32, 0);
        assert_ne!(modes.cflag & libc::CS8 as u32, 0);
        assert_ne!(modes.lflag & libc::ICANON as u32, 0);
        assert_ne!(modes.lflag & libc::ECHO as u32, 0);
        assert_eq!(modes.cc[libc::VINTR], 3);
        assert_eq!(modes.cc[libc::VERASE], 0x7f);
        assert_eq!(modes.cc[libc::VMIN], 1);
        assert_eq!(modes.cc[libc::VTIME], 0);
    }

    #[test]
    fn test_to_native_carries_flags_and_speed() {
        let modes = TermiosSettings::cooked();
        let term = modes.to_native();
        assert_eq!(term.c_iflag, modes.iflag as libc::tcflag_t);
        assert_eq!(term.c_lflag, modes.lflag as libc::tcflag_t);
        assert_eq!(term.c_cc[libc::VEOF], 4);
        let speed = unsafe { libc::cfgetospeed(&term) };
        assert_eq!(speed, libc::B38400);
    }

    #[test]
    fn test_nul_rejected() {
        let result = spawn_in_pty(
            "echo\0bad",
            &["echo".to_string()],
            &[],
            "",
            &TermiosSettings::cooked(),
            WindowSize::default(),
        );
        assert!(matches!(result, Err(Error::InvalidArguments(_))));
    }

    #[test]
    fn test_spawn_echo_produces_output() {
        let spawned = spawn_in_pty(
            "/bin/echo",
            &["echo".to_string(), "fork_path_marker".to_string()],
            &[],
            "/",
            &TermiosSettings::cooked(),
            WindowSize::default(),
        )
        .unwrap();
        assert!(spawned.pid > 0);

        let mut output = String::new();
        let mut file = File::from(spawned.controller);
        let mut buf = [0u8; 512];
        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => output.push_str(&String::from_utf8_lossy(&buf[..n])),
                // EIO means the child side is gone
                Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert!(output.contains("fork_path_marker"), "got {output:?}");

        let mut status = 0;
        unsafe { libc::waitpid(spawned.pid, &mut status, 0) };
    }
}
