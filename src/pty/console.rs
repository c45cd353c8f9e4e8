use super::{PtyProcess, PtyReader, SpawnSpec};
use async_trait::async_trait;
use os_pipe::PipeReader;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use windows::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};

const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Console child with stdout and stderr merged into one pipe
pub struct ConsoleProcess {
    child: Child,
    reader: Option<PipeReader>,
}

impl ConsoleProcess {
    pub fn spawn(spec: &SpawnSpec) -> io::Result<Self> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        let (reader, writer) = os_pipe::pipe()?;

        // Write ends must be dropped with `cmd` so the reader sees EOF
        let child = {
            let mut cmd = Command::new(program);
            cmd.args(args)
                .current_dir(&spec.cwd)
                .envs(&spec.env)
                .stdin(std::process::Stdio::null())
                .stdout(writer.try_clone()?)
                .stderr(writer)
                .creation_flags(CREATE_NEW_PROCESS_GROUP)
                .kill_on_drop(true);
            cmd.spawn()?
        };

        Ok(Self {
            child,
            reader: Some(reader),
        })
    }
}

#[async_trait]
impl PtyProcess for ConsoleProcess {
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

    fn write(&mut self, _data: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "console process has no input stream",
        ))
    }

    async fn stop(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        if let Some(pid) = self.child.id() {
            debug!(pid = pid, "Sending CTRL_BREAK");
            // SAFETY: plain FFI call; the process group id is the child's pid
            // because it was created with CREATE_NEW_PROCESS_GROUP.
            if let Err(e) = unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) } {
                warn!(pid = pid, error = %e, "Failed to send CTRL_BREAK");
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    pid = ?self.child.id(),
                    grace_ms = grace.as_millis() as u64,
                    "Process did not exit within grace period, terminating"
                );
                self.child.kill().await?;
                self.child.wait().await
            }
        }
    }
}
