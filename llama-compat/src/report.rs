//! Plain-text report written once at the end of a run.

use core::fmt::{self, Write as _};
use std::time::Duration;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use server_harness::error_chain;
use time::OffsetDateTime;
use time::macros::format_description;

use crate::orchestrator::{SuiteOutcome, TestCaseRecord, Timing};
use crate::system_info::SystemInfo;

pub const REPORT_FILE_PREFIX: &str = "pytest_";
pub const REPORT_FILE_EXTENSION: &str = "txt";

const WIDE_RULE_WIDTH: usize = 80;

/// `pytest_<YYMMDDHHMMSS>.txt`
pub fn report_file_name(at: OffsetDateTime) -> String {
    let format = format_description!("[year repr:last_two][month][day][hour][minute][second]");
    let stamp = at
        .format(&format)
        .unwrap_or_else(|_| at.unix_timestamp().to_string());

    format!("{REPORT_FILE_PREFIX}{stamp}.{REPORT_FILE_EXTENSION}")
}

pub struct TestReport<'a> {
    pub system: &'a SystemInfo,
    pub outcome: &'a SuiteOutcome,
}

impl TestReport<'_> {
    /// Writes the report into `reports_dir`, creating the folder if needed.
    ///
    /// Existing reports are left untouched.
    pub fn write(&self, reports_dir: &Utf8Path) -> anyhow::Result<Utf8PathBuf> {
        std::fs::create_dir_all(reports_dir).with_context(|| format!("failed to create {reports_dir}"))?;

        let path = unused_path(reports_dir, &report_file_name(self.outcome.started));

        std::fs::write(&path, self.to_string()).with_context(|| format!("failed to write report at {path}"))?;

        info!(%path, "Report written");

        Ok(path)
    }
}

impl fmt::Display for TestReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = self.outcome;

        banner(f, "SYSTEM INFORMATION")?;
        writeln!(f, "{}", self.system)?;

        banner(f, "TEST SUITE")?;
        writeln!(f, "Started:  {}", Timestamp(outcome.started))?;
        if let Some(timing) = &outcome.timing {
            writeln!(f, "Finished: {}", Timestamp(timing.finished))?;
            writeln!(f, "Duration: {}", Seconds(timing.duration))?;
        }
        if let Some(release_dir) = &outcome.release_dir {
            writeln!(f, "Release:  {release_dir}")?;
        }
        if let Some(model_path) = &outcome.model_path {
            writeln!(f, "Model:    {model_path}")?;
        }

        for case in &outcome.cases {
            writeln!(f)?;
            write_case(f, case)?;
        }

        if let Some(fatal) = &outcome.fatal {
            writeln!(f)?;
            writeln!(f, "FATAL: {fatal}")?;
        }

        writeln!(f)?;
        writeln!(f, "{}", "=".repeat(WIDE_RULE_WIDTH))?;
        write!(
            f,
            "SUMMARY: {} passed, {} failed, {} skipped",
            outcome.passed(),
            outcome.failed(),
            outcome.skipped()
        )?;
        if let Some(timing) = &outcome.timing {
            write!(f, " in {}", Seconds(timing.duration))?;
        }
        writeln!(f)
    }
}

fn write_case(f: &mut fmt::Formatter<'_>, case: &TestCaseRecord) -> fmt::Result {
    writeln!(f, "{}", "-".repeat(WIDE_RULE_WIDTH))?;
    writeln!(f, "[{}] {}", case.verdict, case.executable)?;
    writeln!(f, "{}", "-".repeat(WIDE_RULE_WIDTH))?;

    writeln!(f, "Executable: {}", case.executable.path())?;
    if let Some(port) = case.port {
        writeln!(f, "Port:       {port}")?;
    }
    write_timing(f, &case.timing)?;

    if !case.probes.is_empty() {
        writeln!(f, "Probes:")?;
        for probe in &case.probes {
            let mut line = format!("  {:<16} {:<4}", probe.kind.to_string(), if probe.is_success() { "PASS" } else { "FAIL" });

            match probe.status {
                Some(status) => write!(line, " {status:>3}")?,
                None => line.push_str("   -"),
            }

            write!(line, " {:>10}", Seconds(probe.latency))?;

            if let Some(failure) = &probe.failure {
                write!(line, "  {failure}")?;
            }

            writeln!(f, "{line}")?;
        }
    }

    if let Some(error) = &case.error {
        writeln!(f, "Failure:    {}", error_chain(error))?;
    }

    if let Some(status) = case.exit_status {
        writeln!(
            f,
            "Exit:       {status}{}",
            if case.forced_stop { " (killed after grace period)" } else { "" }
        )?;
    }

    if !case.output.is_empty() {
        writeln!(f, "Captured output:")?;
        writeln!(f, "{}", case.output)?;
    }

    Ok(())
}

fn write_timing(f: &mut fmt::Formatter<'_>, timing: &Timing) -> fmt::Result {
    writeln!(f, "Started:    {}", Timestamp(timing.started))?;
    writeln!(f, "Finished:   {}", Timestamp(timing.finished))?;
    writeln!(f, "Duration:   {}", Seconds(timing.duration))
}

fn banner(f: &mut fmt::Formatter<'_>, title: &str) -> fmt::Result {
    let rule = "=".repeat(WIDE_RULE_WIDTH);
    writeln!(f, "{rule}")?;
    writeln!(f, "{title}")?;
    writeln!(f, "{rule}")
}

fn unused_path(dir: &Utf8Path, file_name: &str) -> Utf8PathBuf {
    let candidate = dir.join(file_name);

    if !candidate.exists() {
        return candidate;
    }

    let stem = file_name.trim_end_matches(&format!(".{REPORT_FILE_EXTENSION}")).to_owned();

    (1..)
        .map(|idx| dir.join(format!("{stem}_{idx}.{REPORT_FILE_EXTENSION}")))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

struct Timestamp(OffsetDateTime);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
        match self.0.format(&format) {
            Ok(formatted) => f.write_str(&formatted),
            Err(_) => write!(f, "{}", self.0),
        }
    }
}

struct Seconds(Duration);

impl fmt::Display for Seconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatted = format!("{:.3}s", self.0.as_secs_f64());
        f.pad(&formatted)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use server_harness::{CapturedOutput, HarnessError, ProbeFailure, ProbeKind, ProbeResult, ServerExecutable};
    use time::macros::datetime;

    use super::*;
    use crate::orchestrator::Verdict;

    fn timing() -> Timing {
        Timing {
            started: datetime!(2025-02-03 04:05:06 UTC),
            finished: datetime!(2025-02-03 04:05:08 UTC),
            duration: Duration::from_millis(2250),
        }
    }

    fn probe(kind: ProbeKind, failure: Option<ProbeFailure>) -> ProbeResult {
        ProbeResult {
            kind,
            url: "http://127.0.0.1:8080".to_owned(),
            status: Some(if failure.is_some() { 500 } else { 200 }),
            latency: Duration::from_millis(12),
            body: None,
            completion: None,
            failure,
        }
    }

    fn outcome() -> SuiteOutcome {
        let failure = ProbeFailure::Status {
            status: 500,
            body: String::new(),
        };

        SuiteOutcome {
            started: datetime!(2025-02-03 04:05:06 UTC),
            timing: Some(timing()),
            release_dir: Some(Utf8PathBuf::from("artifacts/b4567")),
            model_path: None,
            cases: vec![
                TestCaseRecord {
                    executable: ServerExecutable::from_path(Utf8Path::new("llama-server-haswell.exe")).unwrap(),
                    port: Some(8080),
                    verdict: Verdict::Passed,
                    probes: vec![probe(ProbeKind::Health, None), probe(ProbeKind::ChatCompletion, None)],
                    error: None,
                    exit_status: None,
                    forced_stop: false,
                    output: CapturedOutput {
                        stdout: "main: server is listening\n".to_owned(),
                        stderr: String::new(),
                    },
                    timing: timing(),
                },
                TestCaseRecord {
                    executable: ServerExecutable::from_path(Utf8Path::new("llama-server-windows-x64.exe")).unwrap(),
                    port: Some(8081),
                    verdict: Verdict::Failed,
                    probes: vec![
                        probe(ProbeKind::Health, None),
                        probe(ProbeKind::ChatCompletion, Some(failure.clone())),
                    ],
                    error: Some(HarnessError::ChatCompletionFailed {
                        url: "http://127.0.0.1:8081/v1/chat/completions".to_owned(),
                        source: failure,
                    }),
                    exit_status: None,
                    forced_stop: false,
                    output: CapturedOutput::default(),
                    timing: timing(),
                },
            ],
            fatal: None,
        }
    }

    #[test]
    fn file_name_uses_two_digit_year() {
        assert_eq!(
            report_file_name(datetime!(2025-02-03 04:05:06 UTC)),
            "pytest_250203040506.txt"
        );
    }

    #[test]
    fn rendering_lists_every_case() {
        let system = SystemInfo::default();
        let outcome = outcome();
        let rendered = TestReport {
            system: &system,
            outcome: &outcome,
        }
        .to_string();

        assert!(rendered.starts_with(&"=".repeat(80)));
        assert!(rendered.contains("Started:  2025-02-03 04:05:06"));
        assert!(rendered.contains("Release:  artifacts/b4567"));
        assert!(rendered.contains("[PASSED] llama-server-haswell.exe (Windows/x86_64)"));
        assert!(rendered.contains("[FAILED] llama-server-windows-x64.exe (Windows/x86_64)"));
        assert!(rendered.contains("main: server is listening"));
        assert!(rendered.contains(
            "Failure:    chat completion against http://127.0.0.1:8081/v1/chat/completions failed: unexpected HTTP status 500"
        ));
        assert!(rendered.trim_end().ends_with("SUMMARY: 1 passed, 1 failed, 0 skipped in 2.250s"));
    }

    #[test]
    fn existing_reports_are_kept() {
        let tempdir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tempdir.path()).unwrap().join("reports");

        let system = SystemInfo::default();
        let outcome = outcome();
        let report = TestReport {
            system: &system,
            outcome: &outcome,
        };

        let first = report.write(&dir).unwrap();
        let second = report.write(&dir).unwrap();

        assert_eq!(first.file_name(), Some("pytest_250203040506.txt"));
        assert_eq!(second.file_name(), Some("pytest_250203040506_1.txt"));
        assert!(std::fs::read_to_string(first).unwrap().contains("SUMMARY"));
    }
}
