//! Spawn options
//!
//! The one input struct consumed by both platform providers. Validation
//! happens before any OS call so option mistakes never leak resources.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Options for spawning a child process attached to a new PTY
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Executable to run. Absolute, or resolvable via `PATH` (on Windows the
    /// Sysnative/System32 remapping and `.com`/`.exe` probing apply).
    pub app: String,
    /// Working directory for the child. Must be non-empty and absolute.
    pub cwd: String,
    /// Initial terminal width in character cells
    pub cols: u16,
    /// Initial terminal height in character cells
    pub rows: u16,
    /// Arguments to pass to the program, not including the program name
    pub command_line: Vec<String>,
    /// Environment overrides applied on top of the inherited environment.
    /// On Unix an empty value unsets the variable in the child; on Windows
    /// empty values are passed through as `NAME=` entries.
    pub environment: HashMap<String, String>,
    /// On Windows, join arguments with single spaces instead of applying
    /// the quoting rules. Ignored on Unix.
    pub verbatim_command_line: bool,
    /// Optional label used in log output
    pub name: Option<String>,
}

impl SpawnOptions {
    /// Create options for `app` running in `cwd` with an 80x24 terminal
    pub fn new(app: impl Into<String>, cwd: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            cwd: cwd.into(),
            cols: 80,
            rows: 24,
            command_line: Vec::new(),
            environment: HashMap::new(),
            verbatim_command_line: false,
            name: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.app.is_empty() {
            return Err(Error::InvalidArguments("app must not be empty"));
        }
        if self.cwd.is_empty() {
            return Err(Error::InvalidArguments("cwd must not be empty"));
        }
        if self.cols == 0 || self.rows == 0 {
            return Err(Error::InvalidArguments("cols and rows must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_options() {
        let options = SpawnOptions::new("/bin/sh", "/");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_empty_app_rejected() {
        let options = SpawnOptions::new("", "/");
        assert!(matches!(
            options.validate(),
            Err(Error::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_empty_cwd_rejected() {
        let options = SpawnOptions::new("/bin/sh", "");
        assert!(matches!(
            options.validate(),
            Err(Error::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut options = SpawnOptions::new("/bin/sh", "/");
        options.cols = 0;
        assert!(options.validate().is_err());

        let mut options = SpawnOptions::new("/bin/sh", "/");
        options.rows = 0;
        assert!(options.validate().is_err());
    }
}
