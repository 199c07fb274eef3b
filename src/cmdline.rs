//! Command-line and environment formatting for Windows process creation
//!
//! `CreateProcessW` takes one flat command-line string and one UTF-16
//! environment block, so arguments must be quoted the way the Windows
//! C runtime un-quotes them and the block must be sorted and
//! double-NUL-terminated. Everything here is pure string manipulation;
//! the Windows provider is the only production caller.

/// Quote one argument so `CommandLineToArgvW` parses it back verbatim.
///
/// Arguments without whitespace or quotes pass through untouched. Otherwise
/// the argument is wrapped in double quotes; embedded quotes become `\"`,
/// and any run of backslashes immediately preceding a quote (or the closing
/// quote) is doubled.
pub(crate) fn quote_argument(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    let mut backslashes = 0usize;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                // 2n+1 backslashes before an escaped quote
                quoted.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
            }
            _ => {
                quoted.extend(std::iter::repeat('\\').take(backslashes));
                quoted.push(c);
                backslashes = 0;
            }
        }
    }
    // trailing backslashes double so the closing quote survives
    quoted.extend(std::iter::repeat('\\').take(backslashes * 2));
    quoted.push('"');
    quoted
}

/// Build the full command line: quoted executable followed by the arguments.
///
/// The executable is quoted iff it contains a space and is not already
/// quoted. With `verbatim` set the arguments are joined raw with single
/// spaces, matching callers that pre-format their own command line.
pub(crate) fn build_command_line(app: &str, args: &[String], verbatim: bool) -> String {
    let mut line = if app.contains(' ') && !app.starts_with('"') {
        format!("\"{app}\"")
    } else {
        app.to_string()
    };
    for arg in args {
        line.push(' ');
        if verbatim {
            line.push_str(arg);
        } else {
            line.push_str(&quote_argument(arg));
        }
    }
    line
}

/// Assemble a `CreateProcessW` environment block: `NAME=VALUE\0` entries
/// sorted case-insensitively by name, with a final extra NUL, as UTF-16LE
/// code units. Windows requires the sorted order; empty values are emitted
/// as `NAME=` entries.
pub(crate) fn build_environment_block<'a, I>(vars: I) -> Vec<u16>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut entries: Vec<(&str, &str)> = vars.into_iter().collect();
    entries.sort_by(|a, b| {
        a.0.to_uppercase()
            .cmp(&b.0.to_uppercase())
            .then_with(|| a.0.cmp(b.0))
    });

    if entries.is_empty() {
        return vec![0, 0];
    }

    let mut block = Vec::new();
    for (name, value) in entries {
        block.extend(name.encode_utf16());
        block.push(u16::from(b'='));
        block.extend(value.encode_utf16());
        block.push(0);
    }
    block.push(0);
    block
}

/// Remap a `<windir>\System32\...` path to `<windir>\Sysnative\...`.
///
/// Under WoW64 the file-system redirector silently maps System32 to the
/// 32-bit SysWOW64; Sysnative is the escape hatch that reaches the real
/// 64-bit binaries. Returns `None` when the path is not under System32.
pub(crate) fn remap_system32_to_sysnative(path: &str, windir: &str) -> Option<String> {
    remap_prefix(path, windir, "System32", "Sysnative")
}

/// The reverse mapping for processes not under WoW64, where `Sysnative`
/// does not exist as a directory.
pub(crate) fn remap_sysnative_to_system32(path: &str, windir: &str) -> Option<String> {
    remap_prefix(path, windir, "Sysnative", "System32")
}

fn remap_prefix(path: &str, windir: &str, from: &str, to: &str) -> Option<String> {
    let windir = windir.trim_end_matches('\\');
    let prefix = format!("{windir}\\{from}\\");
    let head = path.get(..prefix.len())?;
    let tail = path.get(prefix.len()..).filter(|t| !t.is_empty())?;
    if head.eq_ignore_ascii_case(&prefix) {
        Some(format!("{windir}\\{to}\\{tail}"))
    } else {
        None
    }
}

/// Split a `PATH` value into search directories; under WoW64, insert
/// `<windir>\Sysnative` immediately before every `<windir>\System32` entry
/// so 64-bit system binaries win the search.
pub(crate) fn search_directories(path_var: &str, windir: &str, wow64: bool) -> Vec<String> {
    let windir_trimmed = windir.trim_end_matches('\\');
    let system32 = format!("{windir_trimmed}\\System32");
    let mut dirs = Vec::new();
    for entry in path_var.split(';').filter(|e| !e.is_empty()) {
        if wow64 && entry.trim_end_matches('\\').eq_ignore_ascii_case(&system32) {
            dirs.push(format!("{windir_trimmed}\\Sysnative"));
        }
        dirs.push(entry.to_string());
    }
    dirs
}
