//! ConPTY resource wrappers
//!
//! RAII types for the Windows handle set: anonymous pipes, the
//! pseudoconsole, the process-thread attribute list that binds a child to
//! it, and the job object that reaps stragglers. Each wrapper releases its
//! resource exactly once, so an early `?` in the provider unwinds cleanly.

use std::ffi::c_void;
use std::mem::size_of;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::ptr;

use windows::core::{s, w, PCWSTR};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Console::{
    ClosePseudoConsole, CreatePseudoConsole, ResizePseudoConsole, COORD, HPCON,
};
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
    SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::Threading::{
    DeleteProcThreadAttributeList, InitializeProcThreadAttributeList, UpdateProcThreadAttribute,
    LPPROC_THREAD_ATTRIBUTE_LIST, PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
};

use crate::error::{Error, Result};

/// Whether this Windows build exposes ConPTY (10 1809 / Server 2019+)
pub(crate) fn available() -> bool {
    unsafe {
        GetModuleHandleW(w!("kernel32.dll"))
            .ok()
            .and_then(|module| GetProcAddress(module, s!("CreatePseudoConsole")))
            .is_some()
    }
}

fn spawn_err(what: &str, e: windows::core::Error) -> Error {
    Error::SpawnFailed {
        os_error: e.code().0,
        message: format!("{what}: {e}"),
    }
}

/// Anonymous pipe as `(read end, write end)`
pub(crate) fn create_pipe() -> Result<(OwnedHandle, OwnedHandle)> {
    let mut read = HANDLE::default();
    let mut write = HANDLE::default();
    unsafe { CreatePipe(&mut read, &mut write, None, 0) }
        .map_err(|e| spawn_err("CreatePipe", e))?;
    // SAFETY: CreatePipe succeeded, both handles are fresh and ours
    Ok(unsafe {
        (
            OwnedHandle::from_raw_handle(read.0),
            OwnedHandle::from_raw_handle(write.0),
        )
    })
}

/// The pseudoconsole itself. Dropping it signals conhost to shut down and
/// flush; the teardown order in the connection relies on this running
/// before any other handle closes.
pub(crate) struct PseudoConsole {
    hpcon: HPCON,
}

// HPCON is a process-local kernel handle; the watcher and dispose paths may
// touch it from different threads but never concurrently.
unsafe impl Send for PseudoConsole {}

impl PseudoConsole {
    /// Create a pseudoconsole reading input from `input` and writing output
    /// to `output`. The caller keeps ownership of both handles and must
    /// close them once the console exists (conhost duplicates its ends).
    pub fn new(cols: u16, rows: u16, input: &OwnedHandle, output: &OwnedHandle) -> Result<Self> {
        let size = COORD {
            X: cols as i16,
            Y: rows as i16,
        };
        let hpcon = unsafe {
            CreatePseudoConsole(
                size,
                HANDLE(input.as_raw_handle()),
                HANDLE(output.as_raw_handle()),
                0,
            )
        }
        .map_err(|e| Error::PseudoConsoleFailed { hresult: e.code().0 })?;
        Ok(Self { hpcon })
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let size = COORD {
            X: cols as i16,
            Y: rows as i16,
        };
        unsafe { ResizePseudoConsole(self.hpcon, size) }
            .map_err(|e| Error::PseudoConsoleFailed { hresult: e.code().0 })
    }

    pub fn raw(&self) -> HPCON {
        self.hpcon
    }
}

impl Drop for PseudoConsole {
    fn drop(&mut self) {
        unsafe { ClosePseudoConsole(self.hpcon) };
    }
}

/// Process-thread attribute list carrying `PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE`
pub(crate) struct PseudoConsoleAttrs {
    buffer: Vec<u8>,
    /// The list stores a pointer to this value; boxing keeps the address
    /// stable while the struct moves
    hpcon: Box<HPCON>,
    initialized: bool,
}

impl PseudoConsoleAttrs {
    pub fn new(console: &PseudoConsole) -> Result<Self> {
        let mut required = 0usize;
        // sizing call; fails with ERROR_INSUFFICIENT_BUFFER by contract
        let _ = unsafe {
            InitializeProcThreadAttributeList(
                LPPROC_THREAD_ATTRIBUTE_LIST(ptr::null_mut()),
                1,
                0,
                &mut required,
            )
        };

        let mut attrs = Self {
            buffer: vec![0u8; required],
            hpcon: Box::new(console.raw()),
            initialized: false,
        };

        unsafe { InitializeProcThreadAttributeList(attrs.as_list(), 1, 0, &mut required) }
            .map_err(|e| spawn_err("InitializeProcThreadAttributeList", e))?;
        attrs.initialized = true;

        unsafe {
            UpdateProcThreadAttribute(
                attrs.as_list(),
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE as usize,
                Some(attrs.hpcon.as_ref() as *const HPCON as *const c_void),
                size_of::<HPCON>(),
                None,
                None,
            )
        }
        .map_err(|e| spawn_err("UpdateProcThreadAttribute", e))?;

        Ok(attrs)
    }

    pub fn as_list(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        LPPROC_THREAD_ATTRIBUTE_LIST(self.buffer.as_mut_ptr() as *mut c_void)
    }
}

impl Drop for PseudoConsoleAttrs {
    fn drop(&mut self) {
        if self.initialized {
            unsafe { DeleteProcThreadAttributeList(self.as_list()) };
        }
    }
}

/// Job object with `KILL_ON_JOB_CLOSE`: closing the handle terminates every
/// process assigned to it, which is what reaps grandchildren the child left
/// behind. The connection closes it last.
pub(crate) struct JobObject {
    handle: OwnedHandle,
}

impl JobObject {
    pub fn kill_on_close() -> Result<Self> {
        let raw = unsafe { CreateJobObjectW(None, PCWSTR::null()) }
            .map_err(|e| spawn_err("CreateJobObjectW", e))?;
        // SAFETY: fresh handle from CreateJobObjectW
        let handle = unsafe { OwnedHandle::from_raw_handle(raw.0) };

        let mut info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
        info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
        unsafe {
            SetInformationJobObject(
                HANDLE(handle.as_raw_handle()),
                JobObjectExtendedLimitInformation,
                &info as *const _ as *const c_void,
                size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )
        }
        .map_err(|e| spawn_err("SetInformationJobObject", e))?;

        Ok(Self { handle })
    }

    pub fn assign(&self, process: &OwnedHandle) -> windows::core::Result<()> {
        unsafe {
            AssignProcessToJobObject(
                HANDLE(self.handle.as_raw_handle()),
                HANDLE(process.as_raw_handle()),
            )
        }
    }
}
