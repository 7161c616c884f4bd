#![allow(
    clippy::print_stderr,
    reason = "test infrastructure can intentionally use eprintln for debug output"
)]
#![allow(clippy::unwrap_used, reason = "test infrastructure can panic on errors")]

pub mod cli;
pub mod mock_http;
