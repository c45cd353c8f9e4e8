use super::{PtyProcess, PtyReader, SpawnSpec};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{killpg, Signal};
use nix::sys::termios::Termios;
use nix::unistd::Pid;
use std::fs::File;
use std::io::{self, Read, Write};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

const DEFAULT_SIZE: Winsize = Winsize {
    ws_row: 24,
    ws_col: 120,
    ws_xpixel: 0,
    ws_ypixel: 0,
};

pub struct UnixPty {
    child: Child,
    /// Process group led by the child; `None` once it is known to be empty
    group: Option<Pid>,
    master: File,
    reader: Option<MasterReader>,
}

impl UnixPty {
    pub fn spawn(spec: &SpawnSpec) -> io::Result<Self> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        let pty = openpty(Some(&DEFAULT_SIZE), None::<&Termios>).map_err(io::Error::from)?;

        // The parent's copies of the slave are closed when `cmd` drops, so the
        // master sees end-of-stream once the child (and its children) exit.
        // The child leads a new process group so stop() reaches everything it
        // spawned.
        let child = {
            let mut cmd = Command::new(program);
            cmd.args(args)
                .process_group(0)
                .current_dir(&spec.cwd)
                .envs(&spec.env)
                .stdin(Stdio::null())
                .stdout(Stdio::from(pty.slave.try_clone()?))
                .stderr(Stdio::from(pty.slave))
                .kill_on_drop(true);
            cmd.spawn()?
        };

        let master = File::from(pty.master);
        let reader = MasterReader(master.try_clone()?);

        let group = child.id().map(|pid| Pid::from_raw(pid as i32));

        Ok(Self {
            child,
            group,
            master,
            reader: Some(reader),
        })
    }
}

#[async_trait]
impl PtyProcess for UnixPty {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn take_reader(&mut self) -> Option<PtyReader> {
        self.reader
            .take()
            .map(|reader| Box::new(reader) as PtyReader)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.master.write(data)
    }

    async fn stop(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        let deadline = Instant::now() + grace;
        let group = self.group;

        if let Some(group) = group {
            debug!(pgid = %group, "Sending SIGINT to process group");
            if let Err(e) = killpg(group, Signal::SIGINT) {
                warn!(pgid = %group, error = %e, "Failed to send SIGINT");
            }
        }

        let status = match tokio::time::timeout_at(deadline, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    pid = ?self.child.id(),
                    grace_ms = grace.as_millis() as u64,
                    "Process did not exit within grace period, sending SIGKILL"
                );
                if let Some(group) = group {
                    let _ = killpg(group, Signal::SIGKILL);
                }
                self.child.kill().await?;
                self.child.wait().await?
            }
        };

        // Descendants get the rest of the grace period, then SIGKILL
        if let Some(group) = group {
            while group_alive(group) && Instant::now() < deadline {
                tokio::time::sleep(GROUP_POLL_INTERVAL).await;
            }
            if group_alive(group) {
                warn!(pgid = %group, "Descendants outlived the grace period, sending SIGKILL");
                let _ = killpg(group, Signal::SIGKILL);
            }
        }
        self.group = None;

        Ok(status)
    }
}

impl Drop for UnixPty {
    fn drop(&mut self) {
        // kill_on_drop only reaches the leader
        if let Some(group) = self.group {
            let _ = killpg(group, Signal::SIGKILL);
        }
    }
}

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Whether any process is left in `group`
fn group_alive(group: Pid) -> bool {
    match killpg(group, None::<Signal>) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM: members exist but belong to someone else
        Err(_) => true,
    }
}

/// Reading the master after the slave side closes fails with EIO on Linux;
/// that is reported as end-of-stream here.
struct MasterReader(File);

impl Read for MasterReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf) {
            Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => Ok(0),
            other => other,
        }
    }
}
