//! Continuous capture of a child process' standard output and error.

use core::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio::process::Child;
use tokio::task::JoinHandle;

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// Transcript of everything a server process wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

impl fmt::Display for CapturedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- stdout ---")?;
        writeln!(f, "{}", self.stdout.trim_end())?;
        writeln!(f, "--- stderr ---")?;
        write!(f, "{}", self.stderr.trim_end())
    }
}

pub(crate) struct OutputCapture {
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    readers: Vec<JoinHandle<()>>,
}

impl OutputCapture {
    /// Takes the piped stdout/stderr of `child` and starts draining them in the background.
    pub(crate) fn attach(child: &mut Child) -> Self {
        let stdout = SharedBuffer::default();
        let stderr = SharedBuffer::default();
        let mut readers = Vec::with_capacity(2);

        if let Some(pipe) = child.stdout.take() {
            readers.push(tokio::spawn(drain(pipe, Arc::clone(&stdout), "stdout")));
        }

        if let Some(pipe) = child.stderr.take() {
            readers.push(tokio::spawn(drain(pipe, Arc::clone(&stderr), "stderr")));
        }

        Self {
            stdout,
            stderr,
            readers,
        }
    }

    /// Output captured so far.
    pub(crate) fn snapshot(&self) -> CapturedOutput {
        CapturedOutput {
            stdout: String::from_utf8_lossy(&self.stdout.lock()).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr.lock()).into_owned(),
        }
    }

    /// Waits for the readers to reach end of stream, then returns the full transcript.
    ///
    /// Descendants may keep the pipes open after the process itself exited, so readers still
    /// running after `grace` are aborted.
    pub(crate) async fn finish(&mut self, grace: Duration) -> CapturedOutput {
        let deadline = tokio::time::Instant::now() + grace;

        for reader in &mut self.readers {
            if tokio::time::timeout_at(deadline, &mut *reader).await.is_err() {
                debug!("Output reader still running after the grace period");
                reader.abort();
            }
        }

        self.readers.clear();

        self.snapshot()
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

async fn drain<R>(mut pipe: R, buffer: SharedBuffer, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];

    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buffer.lock().extend_from_slice(&chunk[..n]),
            Err(error) => {
                debug!(%error, stream, "Failed to read from server output");
                break;
            }
        }
    }

    trace!(stream, "Reached end of server output");
}
