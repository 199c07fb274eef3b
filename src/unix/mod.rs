//! Unix PTY provider
//!
//! The provider does all pre-fork setup (argv and environment marshalling,
//! default terminal modes, window size) and hands the fork+exec dance to
//! the `fork` module. The returned connection owns the controller fd and
//! the child.

mod connection;
mod fork;

pub use connection::{PtyReader, PtyWriter, UnixPtyConnection};

use log::{debug, info};

use crate::error::Result;
use crate::options::SpawnOptions;
use crate::size::WindowSize;

pub(crate) fn spawn(options: &SpawnOptions) -> Result<UnixPtyConnection> {
    let mut argv = Vec::with_capacity(options.command_line.len() + 1);
    argv.push(options.app.clone());
    argv.extend(options.command_line.iter().cloned());

    // deterministic application order for the child-side setenv loop
    let mut env: Vec<(String, String)> = options
        .environment
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.sort_by(|a, b| a.0.cmp(&b.0));

    let size = WindowSize::new(options.cols, options.rows);
    debug!(
        "spawning {:?} in a new pty ({}x{}, cwd {:?})",
        options.app, options.cols, options.rows, options.cwd
    );

    let spawned = fork::spawn_in_pty(
        &options.app,
        &argv,
        &env,
        &options.cwd,
        &fork::TermiosSettings::cooked(),
        size,
    )?;

    info!(
        "pty child {} started (pid {})",
        options.name.as_deref().unwrap_or(&options.app),
        spawned.pid
    );
    UnixPtyConnection::new(spawned, options.name.clone())
}
