//! Compatibility test runner for llama.cpp server builds.
//!
//! A run downloads the latest server release and a model, starts every server executable built
//! for the host one after the other, probes it over HTTP, and writes a plain-text report.

#[macro_use]
extern crate tracing;

pub mod artifacts;
pub mod clock;
pub mod config;
pub mod fetch;
pub mod log;
pub mod orchestrator;
pub mod report;
pub mod system_info;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use server_harness::HarnessError;

use crate::artifacts::ArtifactStore;
use crate::clock::Clock;
use crate::config::Conf;
use crate::fetch::{ModelFetcher, ReleaseFetcher, cached_release_dir};
use crate::orchestrator::{Orchestrator, SuiteOutcome};
use crate::report::TestReport;
use crate::system_info::SystemInfo;

pub struct RunSummary {
    pub outcome: SuiteOutcome,
    pub report_path: Utf8PathBuf,
}

/// Fetches the artifacts, runs every test case and writes the report.
///
/// Failures while preparing or running the tests are recorded in the report; only a failure to
/// write the report itself is returned as an error.
pub async fn run(conf: &Conf, clock: Clock) -> anyhow::Result<RunSummary> {
    let system = SystemInfo::collect().await;

    let mut outcome = SuiteOutcome::start(clock);

    info!(started = %outcome.started, "Test suite started");

    if let Err(error) = execute(conf, clock, &mut outcome).await {
        error!("Test run aborted: {error:#}");
        outcome.fatal = Some(format!("{error:#}"));
    }

    outcome.finish(clock);

    info!(
        passed = outcome.passed(),
        failed = outcome.failed(),
        skipped = outcome.skipped(),
        "Test suite completed"
    );

    let report_path = TestReport {
        system: &system,
        outcome: &outcome,
    }
    .write(&conf.reports_dir)?;

    Ok(RunSummary { outcome, report_path })
}

async fn execute(conf: &Conf, clock: Clock, outcome: &mut SuiteOutcome) -> anyhow::Result<()> {
    let (store, model_path) = prepare(conf, clock, outcome).await?;

    let orchestrator = Orchestrator::new(conf, clock).context("failed to initialize the test harness")?;
    orchestrator.run(&store, &model_path, outcome).await;

    Ok(())
}

async fn prepare(conf: &Conf, clock: Clock, outcome: &mut SuiteOutcome) -> anyhow::Result<(ArtifactStore, Utf8PathBuf)> {
    let model_fetcher = ModelFetcher::new(conf)?;

    let (release_dir, model_path) = if conf.skip_download {
        info!("Skipping downloads");
        (cached_release_dir(&conf.artifacts_dir).await, model_fetcher.model_path())
    } else {
        let release_dir = ReleaseFetcher::new(conf, clock)?
            .fetch_latest()
            .await
            .context("failed to download the server release")?;

        let model_path = match model_fetcher.fetch().await {
            Ok(path) => path,
            // Test cases are skipped one by one for a missing local model.
            Err(error) if matches!(error.downcast_ref::<HarnessError>(), Some(HarnessError::ModelNotFound { .. })) => {
                warn!(%error, "Model is missing");
                model_fetcher.model_path()
            }
            Err(error) => return Err(error.context("failed to download the model")),
        };

        (release_dir, model_path)
    };

    outcome.release_dir = Some(release_dir.clone());
    outcome.model_path = Some(model_path.clone());

    let store = ArtifactStore::open(&release_dir)?;

    Ok((store, model_path))
}
