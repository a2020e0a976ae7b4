//! Adapter-side transport over the process's own stdin/stdout.

use std::fs::File;
use std::io::Write;
use std::os::fd::AsFd;
use std::time::Duration;

use super::{Transport, closed_error, poll};
use crate::{CortexError, Result};

/// Reads stdin and writes stdout without any user-space buffering.
///
/// The descriptors are duplicated so that readiness polling always reflects every
/// unread byte; `std::io::Stdin` would hide bytes in its internal buffer.
#[derive(Debug)]
pub struct StdioTransport {
    input: Option<File>,
    output: Option<File>,
}

impl StdioTransport {
    /// Attach to the current process's standard streams.
    pub fn new() -> Result<Self> {
        let input = std::io::stdin()
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| CortexError::from_io("dup stdin", e))?;
        let output = std::io::stdout()
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| CortexError::from_io("dup stdout", e))?;
        Ok(Self { input: Some(File::from(input)), output: Some(File::from(output)) })
    }
}

impl Transport for StdioTransport {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        let output = self.output.as_mut().ok_or_else(|| closed_error("stdio"))?;
        output.write_all(data).map_err(|e| CortexError::from_io("stdout write", e))?;
        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let input = self.input.as_mut().ok_or_else(|| closed_error("stdio"))?;
        poll::read_with_timeout(input, buf, timeout, "stdin")
    }

    fn close(&mut self) {
        self.input.take();
        if let Some(mut output) = self.output.take() {
            let _ = output.flush();
        }
    }

    fn kind(&self) -> &'static str {
        "stdio"
    }
}
