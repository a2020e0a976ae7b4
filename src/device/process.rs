//! Adapter child process supervision.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::{CortexError, Result};

/// Owns one spawned adapter process.
///
/// Reaping is explicit: call [`join`](ProcessHandle::join) or
/// [`kill`](ProcessHandle::kill). Dropping an unreaped handle kills the child as a
/// last resort so it never outlives the harness.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Option<Child>,
    path: PathBuf,
    status: Option<ExitStatus>,
}

impl ProcessHandle {
    /// Launch `path` with `args`, its stdin/stdout wired to `stdin`/`stdout`.
    ///
    /// stderr is inherited so adapter logs reach the harness terminal.
    pub fn spawn<I, S>(path: &Path, args: I, stdin: Stdio, stdout: Stdio) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let child = Command::new(path)
            .args(args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| CortexError::Spawn { path: path.to_path_buf(), source })?;
        info!(pid = child.id(), path = %path.display(), "Spawned adapter");
        Ok(Self { child: Some(child), path: path.to_path_buf(), status: None })
    }

    /// Launch `path` with both standard streams on one end of a socket pair.
    #[cfg(unix)]
    pub fn spawn_with_socket<I, S>(
        path: &Path,
        args: I,
        socket: std::os::unix::net::UnixStream,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        use std::os::fd::OwnedFd;

        let stdin = socket.try_clone().map_err(|e| CortexError::from_io("dup socket", e))?;
        Self::spawn(path, args, Stdio::from(OwnedFd::from(stdin)), Stdio::from(OwnedFd::from(socket)))
    }

    /// OS process id, while the child has not been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Exit status once reaped.
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Whether the child is still running.
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                self.reaped(status);
                false
            }
            Some(Err(_)) | None => false,
        }
    }

    /// Wait up to `timeout` for the child to exit and reap it.
    ///
    /// Returns `Ok(None)` if it is still running when the timeout expires.
    pub fn join(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            let Some(child) = self.child.as_mut() else {
                return Ok(self.status);
            };
            match child.try_wait().map_err(|e| CortexError::from_io("wait for adapter", e))? {
                Some(status) => {
                    self.reaped(status);
                    return Ok(Some(status));
                }
                None if Instant::now() >= deadline => return Ok(None),
                None => std::thread::sleep(Duration::from_millis(5)),
            }
        }
    }

    /// Kill the child and reap it. A child that already exited is just reaped.
    pub fn kill(&mut self) -> Result<Option<ExitStatus>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(self.status);
        };
        if let Err(e) = child.kill() {
            // InvalidInput means it already exited.
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(CortexError::from_io("kill adapter", e));
            }
        }
        let status = child.wait().map_err(|e| CortexError::from_io("wait for adapter", e))?;
        warn!(path = %self.path.display(), %status, "Adapter killed");
        self.reaped(status);
        Ok(Some(status))
    }

    fn reaped(&mut self, status: ExitStatus) {
        debug!(path = %self.path.display(), %status, "Adapter exited");
        self.child = None;
        self.status = Some(status);
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
