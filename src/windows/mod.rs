//! Windows PTY provider (ConPTY)
//!
//! Builds the full handle set in dependency order: job object, pipes,
//! pseudoconsole, attribute list, then the child process, which is assigned
//! to the job before the connection is handed out. Every intermediate is an
//! RAII wrapper so a failure at any step unwinds what exists so far.

mod connection;
mod conpty;

pub use connection::{PtyReader, PtyWriter, WindowsPtyConnection};

use std::collections::HashMap;
use std::env;
use std::ffi::c_void;
use std::mem::size_of;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::path::Path;

use log::{debug, info};
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{FALSE, HANDLE};
use windows::Win32::System::Threading::{
    CreateProcessW, TerminateProcess, CREATE_UNICODE_ENVIRONMENT, EXTENDED_STARTUPINFO_PRESENT,
    PROCESS_INFORMATION, STARTUPINFOEXW,
};

use crate::cmdline::{
    build_command_line, build_environment_block, remap_system32_to_sysnative,
    remap_sysnative_to_system32, search_directories,
};
use crate::error::{Error, Result};
use crate::options::SpawnOptions;

pub(crate) fn spawn(options: &SpawnOptions) -> Result<WindowsPtyConnection> {
    if !conpty::available() {
        return Err(Error::PlatformNotSupported(
            "ConPTY requires Windows 10 1809 or newer",
        ));
    }

    // the job exists before the child so nothing can escape it on unwind
    let job = conpty::JobObject::kill_on_close()?;

    // in-pipe: we write, the console reads; out-pipe: the console writes,
    // we read
    let (console_input, input_write) = conpty::create_pipe()?;
    let (output_read, console_output) = conpty::create_pipe()?;

    let pseudocon =
        conpty::PseudoConsole::new(options.cols, options.rows, &console_input, &console_output)?;
    // conhost duplicated its pipe ends; keeping ours causes buffering
    // anomalies and defeats EOF detection
    drop(console_input);
    drop(console_output);

    let mut attrs = conpty::PseudoConsoleAttrs::new(&pseudocon)?;

    let app = resolve_app(options);
    let line = build_command_line(&app, &options.command_line, options.verbatim_command_line);
    debug!(
        "spawning {line:?} via conpty ({}x{}, cwd {:?})",
        options.cols, options.rows, options.cwd
    );
    let mut line_w: Vec<u16> = line.encode_utf16().chain(std::iter::once(0)).collect();

    let merged = merged_environment(&options.environment);
    // the block must stay alive (pinned) across CreateProcessW
    let env_block =
        build_environment_block(merged.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let cwd_w: Vec<u16> = options.cwd.encode_utf16().chain(std::iter::once(0)).collect();

    let mut startup = STARTUPINFOEXW::default();
    startup.StartupInfo.cb = size_of::<STARTUPINFOEXW>() as u32;
    startup.lpAttributeList = attrs.as_list();

    let mut proc_info = PROCESS_INFORMATION::default();
    unsafe {
        CreateProcessW(
            PCWSTR::null(),
            PWSTR(line_w.as_mut_ptr()),
            None,
            None,
            FALSE,
            EXTENDED_STARTUPINFO_PRESENT | CREATE_UNICODE_ENVIRONMENT,
            Some(env_block.as_ptr() as *const c_void),
            PCWSTR(cwd_w.as_ptr()),
            &startup.StartupInfo,
            &mut proc_info,
        )
    }
    .map_err(|e| Error::SpawnFailed {
        os_error: e.code().0,
        message: format!("CreateProcessW failed for {line:?}: {e}"),
    })?;

    // SAFETY: CreateProcessW succeeded; both handles are fresh and ours
    let process = unsafe { OwnedHandle::from_raw_handle(proc_info.hProcess.0) };
    let thread = unsafe { OwnedHandle::from_raw_handle(proc_info.hThread.0) };
    let pid = proc_info.dwProcessId;

    if let Err(e) = job.assign(&process) {
        // the child would outlive the job; stop it before unwinding
        let _ = unsafe { TerminateProcess(HANDLE(process.as_raw_handle()), 1) };
        return Err(Error::SpawnFailed {
            os_error: e.code().0,
            message: format!("AssignProcessToJobObject failed: {e}"),
        });
    }

    drop(attrs);

    info!(
        "conpty child {} started (pid {pid})",
        options.name.as_deref().unwrap_or(&options.app)
    );
    WindowsPtyConnection::new(
        pid,
        pseudocon,
        input_write,
        output_read,
        thread,
        process,
        job,
        options.name.clone(),
    )
}

/// Resolve `options.app` to the path handed to `CreateProcessW`.
///
/// Absolute paths get the WoW64 Sysnative/System32 remapping. Relative
/// paths with a directory component resolve against `cwd`. Bare names
/// search `PATH` (the options' environment wins over the process one),
/// probing the literal name, then `.com`, then `.exe`. When nothing
/// matches, `cwd\app` is the fallback and `CreateProcessW` reports the
/// failure.
fn resolve_app(options: &SpawnOptions) -> String {
    let windir = env::var("WINDIR").unwrap_or_else(|_| "C:\\Windows".to_string());
    let wow64 = env::var_os("PROCESSOR_ARCHITEW6432").is_some();
    let app = options.app.as_str();

    if Path::new(app).is_absolute() {
        if wow64 {
            if let Some(remapped) = remap_system32_to_sysnative(app, &windir) {
                if Path::new(&remapped).exists() {
                    return remapped;
                }
            }
        } else if let Some(remapped) = remap_sysnative_to_system32(app, &windir) {
            return remapped;
        }
        return app.to_string();
    }

    let has_dir_component = Path::new(app)
        .parent()
        .is_some_and(|p| !p.as_os_str().is_empty());
    if has_dir_component {
        return join_cwd(&options.cwd, app);
    }

    let path_var = options
        .environment
        .get("PATH")
        .cloned()
        .or_else(|| env::var("PATH").ok())
        .unwrap_or_default();
    for dir in search_directories(&path_var, &windir, wow64) {
        for candidate in [app.to_string(), format!("{app}.com"), format!("{app}.exe")] {
            let full = Path::new(&dir).join(&candidate);
            if full.is_file() {
                return full.to_string_lossy().into_owned();
            }
        }
    }

    join_cwd(&options.cwd, app)
}

fn join_cwd(cwd: &str, app: &str) -> String {
    Path::new(cwd).join(app).to_string_lossy().into_owned()
}

/// The child's environment: the parent process environment with the
/// options' entries layered on top. Empty values pass through as `NAME=`
/// entries; Windows has no unset semantics at this layer.
fn merged_environment(overrides: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut merged: HashMap<String, String> = env::vars().collect();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged.into_iter().collect()
}
