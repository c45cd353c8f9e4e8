//! Child processes attached to a pseudo-terminal
//!
//! Services run behind a terminal so that they keep line-buffered, colored
//! output. The host implementation is chosen at compile time: an `openpty`
//! pair on unix, a merged console pipe in a new process group on windows.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod console;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

/// Blocking read half of a terminal, handed to a reader thread
pub type PtyReader = Box<dyn Read + Send>;

/// Everything needed to launch a service process
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    /// Program followed by its arguments
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    /// Overlaid on the inherited environment
    pub env: BTreeMap<String, String>,
}

#[async_trait]
pub trait PtyProcess: Send {
    /// OS process id, `None` once the process has been reaped
    fn pid(&self) -> Option<u32>;

    /// Non-blocking liveness poll
    fn is_running(&mut self) -> bool;

    /// Take the output reader. `read` blocks until data arrives and returns
    /// 0 once the child side of the terminal is closed.
    fn take_reader(&mut self) -> Option<PtyReader>;

    /// Write raw bytes to the terminal input
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Interrupt, wait up to `grace`, then kill and wait unconditionally
    async fn stop(&mut self, grace: Duration) -> io::Result<ExitStatus>;
}

/// Spawn `spec` on the host's terminal implementation
pub fn spawn(spec: &SpawnSpec) -> io::Result<Box<dyn PtyProcess>> {
    if spec.argv.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
    }

    #[cfg(unix)]
    let process = unix::UnixPty::spawn(spec)?;
    #[cfg(windows)]
    let process = console::ConsoleProcess::spawn(spec)?;

    Ok(Box::new(process))
}
