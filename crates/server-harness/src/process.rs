//! Server process lifecycle: spawn, readiness polling, teardown.

use core::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::error::HarnessError;
use crate::output::{CapturedOutput, OutputCapture};
use crate::tree::Descendants;

pub const READINESS_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const HEALTH_POLL_TIMEOUT: Duration = Duration::from_secs(2);
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, TypedBuilder)]
pub struct LaunchConfig {
    /// How long the server may take to answer its health endpoint.
    #[builder(default = READINESS_TIMEOUT)]
    pub readiness_timeout: Duration,
    #[builder(default = POLL_INTERVAL)]
    pub poll_interval: Duration,
    /// Timeout of each individual health request while polling.
    #[builder(default = HEALTH_POLL_TIMEOUT)]
    pub health_poll_timeout: Duration,
    /// Wait after the termination signal before escalating to a kill, and after the kill.
    #[builder(default = GRACE_PERIOD)]
    pub grace_period: Duration,
    #[builder(default = "127.0.0.1".to_owned(), setter(into))]
    pub host: String,
    #[builder(default)]
    pub extra_args: Vec<String>,
    #[builder(default)]
    pub envs: Vec<(String, String)>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    NotStarted,
    Starting,
    Ready,
    Serving,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Starting => "STARTING",
            Self::Ready => "READY",
            Self::Serving => "SERVING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Where a running server can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub base_url: String,
    pub port: u16,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct StopOutcome {
    /// `None` when the exit status could not be observed.
    pub exit_status: Option<ExitStatus>,
    /// Whether the process had to be killed after ignoring the termination signal.
    pub forced: bool,
    pub output: CapturedOutput,
}

/// Result of [`ServerProcessManager::run_scoped`].
#[derive(Debug)]
pub struct ScopedRun<T> {
    pub value: T,
    pub stop: Result<StopOutcome, HarnessError>,
}

/// One running server instance, exclusively owned by a test case.
///
/// [`ServerProcessHandle::stop`] must be awaited on every exit path. A handle dropped while its
/// process is still running kills the process as a last resort.
pub struct ServerProcessHandle {
    executable: Utf8PathBuf,
    pid: Option<u32>,
    port: u16,
    base_url: String,
    state: ServerState,
    grace_period: Duration,
    child: Option<Child>,
    descendants: Descendants,
    capture: OutputCapture,
    stopped: Option<StopOutcome>,
}

impl fmt::Debug for ServerProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerProcessHandle")
            .field("executable", &self.executable)
            .field("pid", &self.pid)
            .field("port", &self.port)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ServerProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint {
            base_url: self.base_url.clone(),
            port: self.port,
            pid: self.pid,
        }
    }

    /// Output captured so far.
    pub fn output(&self) -> CapturedOutput {
        self.capture.snapshot()
    }

    pub fn mark_serving(&mut self) {
        if self.state == ServerState::Ready {
            self.transition(ServerState::Serving);
        }
    }

    /// Terminates the process and collects its full output.
    ///
    /// Sends a termination signal to the process and its descendants, waits up to the grace
    /// period, then kills whatever is left. Calling `stop` again returns the first outcome without
    /// signaling anything.
    #[instrument(skip(self), fields(pid = ?self.pid, port = self.port))]
    pub async fn stop(&mut self) -> Result<StopOutcome, HarnessError> {
        if let Some(outcome) = &self.stopped {
            debug!("Server already stopped");
            return Ok(outcome.clone());
        }

        let Some(child) = self.child.as_mut() else {
            return Ok(StopOutcome {
                exit_status: None,
                forced: false,
                output: self.capture.snapshot(),
            });
        };

        let previous_state = self.state;
        self.state = ServerState::Stopping;
        debug!(from = %previous_state, to = %self.state, "Server state transition");

        let (exit_status, forced) = match terminate(child, &mut self.descendants, self.grace_period).await {
            Ok(terminated) => terminated,
            Err(error) => {
                self.transition(ServerState::Failed);
                return Err(error);
            }
        };

        self.child = None;

        let output = self.capture.finish(self.grace_period).await;

        if previous_state != ServerState::Failed {
            self.transition(ServerState::Stopped);
        }

        info!(?exit_status, forced, "Server stopped");

        let outcome = StopOutcome {
            exit_status,
            forced,
            output,
        };
        self.stopped = Some(outcome.clone());

        Ok(outcome)
    }

    fn transition(&mut self, next: ServerState) {
        debug!(from = %self.state, to = %next, "Server state transition");
        self.state = next;
    }

    fn poll_exit(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;

        match child.try_wait() {
            Ok(status) => status,
            Err(error) => {
                debug!(%error, "Failed to poll server process status");
                None
            }
        }
    }

    fn track_descendants(&mut self) {
        if let Some(pid) = self.pid {
            self.descendants.refresh(pid);
        }
    }

    async fn record_early_exit(&mut self, status: ExitStatus) -> CapturedOutput {
        self.child = None;

        if let Err(pid) = self.descendants.sweep(Duration::ZERO, self.grace_period).await {
            error!(pid, "A process spawned by the server survived the kill");
        }

        let output = self.capture.finish(self.grace_period).await;
        self.transition(ServerState::Failed);

        self.stopped = Some(StopOutcome {
            exit_status: Some(status),
            forced: false,
            output: output.clone(),
        });

        output
    }
}

impl Drop for ServerProcessHandle {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            warn!(pid = ?self.pid, "Server handle dropped without being stopped; killing the process");

            if let Some(pid) = self.pid {
                self.descendants.refresh(pid);
            }
            self.descendants.kill();

            if let Err(error) = child.start_kill() {
                debug!(%error, "Kill request failed");
            }
        }
    }
}

/// Starts server processes and waits for them to become ready.
#[derive(Debug, Clone)]
pub struct ServerProcessManager {
    config: LaunchConfig,
    client: reqwest::Client,
}

impl ServerProcessManager {
    pub fn new(config: LaunchConfig) -> Result<Self, HarnessError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(HarnessError::HttpClient)?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Spawns `executable` and polls its health endpoint until it answers or the readiness
    /// timeout elapses.
    ///
    /// # Errors
    ///
    /// - `SpawnFailed` when the process cannot be created at all.
    /// - `ServerExitedEarly` when the process exits before answering.
    /// - `ServerStartupTimeout` when the readiness window elapses; the process is torn down first.
    #[instrument(skip(self, executable, model_path), fields(%executable, %model_path))]
    pub async fn start(
        &self,
        executable: &Utf8Path,
        model_path: &Utf8Path,
        port: u16,
    ) -> Result<ServerProcessHandle, HarnessError> {
        let mut command = Command::new(executable);

        command
            .arg("--model")
            .arg(model_path)
            .arg("--port")
            .arg(port.to_string())
            .arg("--host")
            .arg(&self.config.host)
            .args(&self.config.extra_args)
            .envs(self.config.envs.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| HarnessError::SpawnFailed {
            path: executable.to_owned(),
            source,
        })?;

        let capture = OutputCapture::attach(&mut child);

        let mut handle = ServerProcessHandle {
            executable: executable.to_owned(),
            pid: child.id(),
            port,
            base_url: base_url(&self.config.host, port),
            state: ServerState::NotStarted,
            grace_period: self.config.grace_period,
            child: Some(child),
            descendants: Descendants::default(),
            capture,
            stopped: None,
        };

        handle.transition(ServerState::Starting);
        info!(pid = ?handle.pid, port, "Server process spawned");

        self.wait_until_ready(&mut handle).await?;

        handle.transition(ServerState::Ready);
        info!(base_url = %handle.base_url, "Server is ready");

        Ok(handle)
    }

    /// Starts the server, runs `body` against it, and stops the server whatever `body` returned.
    ///
    /// Startup failures are returned as errors. Teardown failures are reported in
    /// [`ScopedRun::stop`] so the value produced by `body` is never lost.
    pub async fn run_scoped<F, Fut, T>(
        &self,
        executable: &Utf8Path,
        model_path: &Utf8Path,
        port: u16,
        body: F,
    ) -> Result<ScopedRun<T>, HarnessError>
    where
        F: FnOnce(ServerEndpoint) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut handle = self.start(executable, model_path, port).await?;
        handle.mark_serving();

        let value = body(handle.endpoint()).await;

        let stop = handle.stop().await;

        Ok(ScopedRun { value, stop })
    }

    async fn wait_until_ready(&self, handle: &mut ServerProcessHandle) -> Result<(), HarnessError> {
        let timeout = self.config.readiness_timeout;
        let deadline = Instant::now() + timeout;
        let health_url = format!("{}/health", handle.base_url);

        loop {
            handle.track_descendants();

            if let Some(status) = handle.poll_exit() {
                warn!(%status, "Server exited before becoming ready");
                let output = handle.record_early_exit(status).await;
                return Err(HarnessError::ServerExitedEarly {
                    port: handle.port,
                    status,
                    output,
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            if self
                .is_healthy(&health_url, remaining.min(self.config.health_poll_timeout))
                .await
            {
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        }

        warn!(?timeout, "Server did not become ready in time");

        let stopped = handle.stop().await?;
        handle.transition(ServerState::Failed);

        Err(HarnessError::ServerStartupTimeout {
            port: handle.port,
            pid: handle.pid,
            timeout,
            output: stopped.output,
        })
    }

    async fn is_healthy(&self, url: &str, timeout: Duration) -> bool {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                trace!(status = %response.status(), "Server not ready yet");
                false
            }
            Err(error) => {
                trace!(%error, "Server not reachable yet");
                false
            }
        }
    }
}

/// Picks a free port on the loopback interface.
pub fn find_unused_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

fn base_url(host: &str, port: u16) -> String {
    match host {
        "0.0.0.0" => format!("http://127.0.0.1:{port}"),
        "::" | "[::]" => format!("http://[::1]:{port}"),
        host if host.contains(':') && !host.starts_with('[') => format!("http://[{host}]:{port}"),
        host => format!("http://{host}:{port}"),
    }
}

async fn terminate(
    child: &mut Child,
    descendants: &mut Descendants,
    grace: Duration,
) -> Result<(Option<ExitStatus>, bool), HarnessError> {
    let pid = child.id();

    let (exit_status, forced) = match child.try_wait() {
        Ok(Some(status)) => (Some(status), false),
        _ => {
            if let Some(pid) = pid {
                descendants.refresh(pid);
            }

            send_terminate(child);
            descendants.terminate();

            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => (Some(status), false),
                Ok(Err(error)) => {
                    warn!(%error, "Failed to wait for server process");
                    (Some(kill(child, descendants, grace, pid).await?), true)
                }
                Err(_) => {
                    warn!(?grace, "Server process ignored the termination signal; killing it");
                    (Some(kill(child, descendants, grace, pid).await?), true)
                }
            }
        }
    };

    // The server is gone; whatever it spawned gets the same grace period, then is killed.
    match descendants.sweep(grace, grace).await {
        Ok(killed) => Ok((exit_status, forced || killed)),
        Err(survivor) => Err(HarnessError::TeardownFailed { pid: survivor }),
    }
}

async fn kill(
    child: &mut Child,
    descendants: &Descendants,
    grace: Duration,
    pid: Option<u32>,
) -> Result<ExitStatus, HarnessError> {
    descendants.kill();

    if let Err(error) = child.start_kill() {
        debug!(%error, "Kill request failed");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Ok(status),
        Ok(Err(_)) | Err(_) => Err(HarnessError::TeardownFailed {
            pid: pid.unwrap_or_default(),
        }),
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };

    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };

    // SAFETY: `kill` has no memory safety preconditions. The child has not been reaped yet
    // (its id is still known), so the pid cannot have been recycled.
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };

    if ret != 0 {
        debug!(error = %std::io::Error::last_os_error(), "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    // There is no termination signal for console-less processes on Windows.
    if let Err(error) = child.start_kill() {
        debug!(%error, "Terminate request failed");
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("127.0.0.1", "http://127.0.0.1:8080")]
    #[case("0.0.0.0", "http://127.0.0.1:8080")]
    #[case("localhost", "http://localhost:8080")]
    #[case("::", "http://[::1]:8080")]
    #[case("::1", "http://[::1]:8080")]
    fn base_url_from_bind_host(#[case] host: &str, #[case] expected: &str) {
        assert_eq!(base_url(host, 8080), expected);
    }

    #[test]
    fn launch_config_defaults() {
        let config = LaunchConfig::default();
        assert_eq!(config.readiness_timeout, Duration::from_secs(10));
        assert_eq!(config.grace_period, Duration::from_secs(5));
        assert_eq!(config.host, "127.0.0.1");
        assert!(config.extra_args.is_empty());
    }

    #[test]
    fn unused_port_is_bindable() {
        let port = find_unused_port().unwrap();
        assert_ne!(port, 0);
        std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_failure() {
        let manager = ServerProcessManager::new(LaunchConfig::default()).unwrap();

        let error = manager
            .start(
                Utf8Path::new("/nonexistent/llama-server-linux-x86_64"),
                Utf8Path::new("/nonexistent/model.gguf"),
                find_unused_port().unwrap(),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, HarnessError::SpawnFailed { .. }));
        assert_eq!(error.severity(), crate::Severity::AbortRun);
    }
}
