use std::process::ExitStatus;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::executable::{Arch, Platform};
use crate::output::CapturedOutput;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to spawn server executable `{path}`")]
    SpawnFailed {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("server on port {port} did not become ready within {timeout:?}")]
    ServerStartupTimeout {
        port: u16,
        /// Process that was torn down after the timeout.
        pid: Option<u32>,
        timeout: Duration,
        output: CapturedOutput,
    },
    #[error("server on port {port} exited before becoming ready ({status})")]
    ServerExitedEarly {
        port: u16,
        status: ExitStatus,
        output: CapturedOutput,
    },
    #[error("health check against {url} failed")]
    HealthCheckFailed {
        url: String,
        #[source]
        source: ProbeFailure,
    },
    #[error("chat completion against {url} failed")]
    ChatCompletionFailed {
        url: String,
        #[source]
        source: ProbeFailure,
    },
    #[error("completion against {url} failed")]
    CompletionFailed {
        url: String,
        #[source]
        source: ProbeFailure,
    },
    #[error("server process {pid} did not terminate within the grace period")]
    TeardownFailed { pid: u32 },
    #[error("no server executable found for {platform}/{arch}")]
    ArtifactNotFound { platform: Platform, arch: Arch },
    #[error("model file not found at `{path}`")]
    ModelNotFound { path: Utf8PathBuf },
    #[error("failed to build HTTP client")]
    HttpClient(#[source] reqwest::Error),
}

/// How far an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The whole run stops.
    AbortRun,
    /// The current test case is recorded as failed; the run continues.
    FailTestCase,
    /// The current test case cannot run and is recorded as skipped.
    SkipTestCase,
}

impl HarnessError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::SpawnFailed { .. } | Self::HttpClient(_) | Self::TeardownFailed { .. } => Severity::AbortRun,
            Self::ServerStartupTimeout { .. }
            | Self::ServerExitedEarly { .. }
            | Self::HealthCheckFailed { .. }
            | Self::ChatCompletionFailed { .. }
            | Self::CompletionFailed { .. } => Severity::FailTestCase,
            Self::ArtifactNotFound { .. } | Self::ModelNotFound { .. } => Severity::SkipTestCase,
        }
    }

    /// Process transcript attached to startup failures.
    pub fn captured_output(&self) -> Option<&CapturedOutput> {
        match self {
            Self::ServerStartupTimeout { output, .. } | Self::ServerExitedEarly { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Why a single probe did not pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("unexpected HTTP status {status}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Error message followed by all its causes.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();

    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    message
}

impl ProbeFailure {
    /// Transport-level failures, as opposed to a server that answered with something wrong.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_chain_includes_causes() {
        let error = HarnessError::SpawnFailed {
            path: Utf8PathBuf::from("/bin/llama-server-linux-x86_64"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };

        assert_eq!(
            error_chain(&error),
            "failed to spawn server executable `/bin/llama-server-linux-x86_64`: no such file"
        );
    }
}
