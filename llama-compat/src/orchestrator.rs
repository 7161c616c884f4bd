//! Runs one test case per selected server executable, strictly one after the other.

use core::fmt;
use std::process::ExitStatus;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use server_harness::{
    Arch, CapturedOutput, HarnessError, Platform, ProbeClient, ProbeResult, ScopedRun, ServerExecutable,
    ServerProcessManager, Severity, error_chain, find_unused_port,
};
use time::OffsetDateTime;

use crate::artifacts::ArtifactStore;
use crate::clock::Clock;
use crate::config::Conf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub started: OffsetDateTime,
    pub finished: OffsetDateTime,
    pub duration: Duration,
}

impl Timing {
    fn since(started: OffsetDateTime, clock: Clock) -> Self {
        let finished = clock.now();
        let duration = Duration::try_from(finished - started).unwrap_or_default();

        Self {
            started,
            finished,
            duration,
        }
    }
}

/// Everything observed while testing one executable.
#[derive(Debug)]
pub struct TestCaseRecord {
    pub executable: ServerExecutable,
    pub port: Option<u16>,
    pub verdict: Verdict,
    pub probes: Vec<ProbeResult>,
    /// First error of the test case, if any.
    pub error: Option<HarnessError>,
    pub exit_status: Option<ExitStatus>,
    /// Whether the server had to be killed after ignoring the termination signal.
    pub forced_stop: bool,
    pub output: CapturedOutput,
    pub timing: Timing,
}

impl TestCaseRecord {
    fn aborts_run(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(|error| error.severity() == Severity::AbortRun)
    }
}

/// Result of the whole run, filled in as test cases complete.
#[derive(Debug)]
pub struct SuiteOutcome {
    pub started: OffsetDateTime,
    pub timing: Option<Timing>,
    pub release_dir: Option<Utf8PathBuf>,
    pub model_path: Option<Utf8PathBuf>,
    pub cases: Vec<TestCaseRecord>,
    /// Error that prevented the run from completing.
    pub fatal: Option<String>,
}

impl SuiteOutcome {
    pub fn start(clock: Clock) -> Self {
        Self {
            started: clock.now(),
            timing: None,
            release_dir: None,
            model_path: None,
            cases: Vec::new(),
            fatal: None,
        }
    }

    pub fn finish(&mut self, clock: Clock) {
        self.timing = Some(Timing::since(self.started, clock));
    }

    pub fn passed(&self) -> usize {
        self.count(Verdict::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(Verdict::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(Verdict::Skipped)
    }

    /// True when at least one test case ran, none failed, and nothing aborted the run.
    pub fn is_success(&self) -> bool {
        self.fatal.is_none() && self.failed() == 0 && self.passed() > 0
    }

    fn count(&self, verdict: Verdict) -> usize {
        self.cases.iter().filter(|case| case.verdict == verdict).count()
    }
}

/// Picks the executables to test: those built for the host, narrowed by the configured
/// allow-list and name filter.
///
/// # Errors
///
/// `ArtifactNotFound` when no executable targets the host at all.
pub fn select_executables<'a>(
    conf: &Conf,
    store: &'a ArtifactStore,
    platform: Platform,
    arch: Arch,
) -> Result<Vec<&'a ServerExecutable>, HarnessError> {
    let selected = store
        .executables_for(platform, arch)?
        .into_iter()
        .filter(|executable| conf.executables.is_empty() || conf.executables.iter().any(|name| name == executable.name()))
        .filter(|executable| {
            conf.filter
                .as_deref()
                .is_none_or(|filter| executable.name().contains(filter))
        })
        .collect();

    Ok(selected)
}

pub struct Orchestrator<'a> {
    conf: &'a Conf,
    clock: Clock,
    manager: ServerProcessManager,
    probes: ProbeClient,
}

impl<'a> Orchestrator<'a> {
    pub fn new(conf: &'a Conf, clock: Clock) -> Result<Self, HarnessError> {
        Ok(Self {
            conf,
            clock,
            manager: ServerProcessManager::new(conf.server.launch_config())?,
            probes: ProbeClient::with_timeouts(conf.probes.health_timeout, conf.probes.chat_timeout)?,
        })
    }

    /// Tests every executable built for the host and records the results into `outcome`.
    pub async fn run(&self, store: &ArtifactStore, model_path: &Utf8Path, outcome: &mut SuiteOutcome) {
        let (Some(platform), Some(arch)) = (Platform::current(), Arch::current()) else {
            outcome.fatal = Some(format!(
                "unsupported host {}/{}",
                std::env::consts::OS,
                std::env::consts::ARCH
            ));
            return;
        };

        let selected = match select_executables(self.conf, store, platform, arch) {
            Ok(selected) => selected,
            Err(error) => {
                error!(%error, release_dir = %store.release_dir(), "Nothing to test");
                outcome.fatal = Some(error.to_string());
                return;
            }
        };

        if selected.is_empty() {
            outcome.fatal = Some(format!(
                "no server executable for {platform}/{arch} left after filtering"
            ));
            return;
        }

        info!(count = selected.len(), %platform, %arch, "Starting test cases");

        for executable in selected {
            let record = self.run_case(executable, model_path).await;

            info!(executable = %record.executable, verdict = %record.verdict, duration = ?record.timing.duration, "Test case finished");

            let abort = record.aborts_run();

            if abort {
                if let Some(error) = &record.error {
                    outcome.fatal = Some(error_chain(error));
                }
            }

            outcome.cases.push(record);

            if abort {
                error!("Aborting the run");
                break;
            }
        }
    }

    #[instrument(skip_all, fields(executable = %executable.name()))]
    async fn run_case(&self, executable: &ServerExecutable, model_path: &Utf8Path) -> TestCaseRecord {
        let started = self.clock.now();

        let mut record = TestCaseRecord {
            executable: executable.clone(),
            port: None,
            verdict: Verdict::Skipped,
            probes: Vec::new(),
            error: None,
            exit_status: None,
            forced_stop: false,
            output: CapturedOutput::default(),
            timing: Timing::since(started, self.clock),
        };

        if let Err(error) = self.execute(executable, model_path, &mut record).await {
            warn!(%error, "Test case did not pass");
            record.verdict = match error.severity() {
                Severity::SkipTestCase => Verdict::Skipped,
                Severity::AbortRun | Severity::FailTestCase => Verdict::Failed,
            };
            if let Some(output) = error.captured_output() {
                record.output = output.clone();
            }
            record.error = Some(error);
        } else {
            record.verdict = Verdict::Passed;
        }

        record.timing = Timing::since(started, self.clock);

        record
    }

    async fn execute(
        &self,
        executable: &ServerExecutable,
        model_path: &Utf8Path,
        record: &mut TestCaseRecord,
    ) -> Result<(), HarnessError> {
        if !executable.is_executable() {
            warn!(path = %executable.path(), "Server executable is not runnable");
            return Err(HarnessError::ArtifactNotFound {
                platform: executable.platform(),
                arch: executable.arch(),
            });
        }

        if !model_path.is_file() {
            return Err(HarnessError::ModelNotFound {
                path: model_path.to_owned(),
            });
        }

        let port = match self.conf.server.port {
            Some(port) => port,
            None => find_unused_port().map_err(|source| HarnessError::SpawnFailed {
                path: executable.path().to_owned(),
                source,
            })?,
        };

        record.port = Some(port);

        let ScopedRun { value: probes, stop } = self
            .manager
            .run_scoped(executable.path(), model_path, port, |endpoint| {
                let base_url = endpoint.base_url;
                async move { self.probe(&base_url).await }
            })
            .await?;

        record.probes = probes;

        let stopped = stop?;
        record.exit_status = stopped.exit_status;
        record.forced_stop = stopped.forced;
        record.output = stopped.output;

        // Every probe ran; the first failure decides the verdict.
        if let Some(failed) = record.probes.iter().find(|probe| !probe.is_success()) {
            failed.clone().into_result()?;
        }

        Ok(())
    }

    async fn probe(&self, base_url: &str) -> Vec<ProbeResult> {
        let mut results = Vec::with_capacity(2 + self.conf.probes.completion_prompts.len());

        results.push(self.probes.check_health(base_url).await);
        results.push(
            self.probes
                .chat_completion(base_url, &self.conf.probes.chat_prompt)
                .await,
        );

        for prompt in &self.conf.probes.completion_prompts {
            results.push(
                self.probes
                    .completion(base_url, &prompt.prompt, prompt.n_predict)
                    .await,
            );
        }

        results
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use crate::config::dto;

    fn store_with(names: &[&str]) -> (tempfile::TempDir, ArtifactStore) {
        let tempdir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tempdir.path()).unwrap();

        for name in names {
            std::fs::write(dir.join(name), "").unwrap();
        }

        let store = ArtifactStore::open(dir).unwrap();
        (tempdir, store)
    }

    fn conf() -> Conf {
        Conf::from_conf_file(&dto::ConfFile::default()).unwrap()
    }

    #[test]
    fn selection_filters_on_target_allow_list_and_substring() {
        let (_tempdir, store) = store_with(&[
            "llama-server-macos-cpu",
            "llama-server-macos-metal",
            "llama-server-linux-x86_64",
        ]);

        let mut conf = conf();
        let names = |selected: Vec<&ServerExecutable>| selected.iter().map(|e| e.name().to_owned()).collect::<Vec<_>>();

        let selected = select_executables(&conf, &store, Platform::MacOs, Arch::Arm64).unwrap();
        assert_eq!(names(selected), ["llama-server-macos-cpu", "llama-server-macos-metal"]);

        conf.filter = Some("metal".to_owned());
        let selected = select_executables(&conf, &store, Platform::MacOs, Arch::Arm64).unwrap();
        assert_eq!(names(selected), ["llama-server-macos-metal"]);

        conf.filter = None;
        conf.executables = vec!["llama-server-macos-cpu".to_owned()];
        let selected = select_executables(&conf, &store, Platform::MacOs, Arch::Arm64).unwrap();
        assert_eq!(names(selected), ["llama-server-macos-cpu"]);

        let error = select_executables(&conf, &store, Platform::Windows, Arch::X86_64).unwrap_err();
        assert_eq!(error.to_string(), "no server executable found for Windows/x86_64");
    }

    #[test]
    fn empty_suite_is_not_a_success() {
        let mut outcome = SuiteOutcome::start(Clock::utc());
        outcome.finish(Clock::utc());

        assert_eq!(outcome.passed(), 0);
        assert!(!outcome.is_success());
    }

}
