//! Lifecycle management of llama.cpp-compatible server processes under test.
//!
//! A test case owns exactly one [`ServerProcessHandle`]: the server is spawned, polled until its
//! health endpoint answers, probed with a few fixed HTTP requests, and always torn down before
//! the next executable is attempted.

// Used by tests
#[cfg(test)]
use {rstest as _, tempfile as _};

#[macro_use]
extern crate tracing;

pub mod executable;
pub mod output;
pub mod probe;
pub mod process;

mod error;
mod tree;

pub use error::{HarnessError, ProbeFailure, Severity, error_chain};
pub use executable::{Arch, Platform, ServerExecutable};
pub use output::CapturedOutput;
pub use probe::{ProbeClient, ProbeKind, ProbeResult};
pub use process::{
    LaunchConfig, ScopedRun, ServerEndpoint, ServerProcessHandle, ServerProcessManager, ServerState, StopOutcome,
    find_unused_port,
};
