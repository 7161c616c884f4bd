//! Processes spawned by a server, tracked so that none of them outlives it.
//!
//! Once the server itself exits, its children are reparented and can no longer be found by
//! walking the process tree, so the tree is recorded while the server is still running.

use std::time::Duration;

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tokio::time::Instant;

const SWEEP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A pid together with the start time of the process it designated when recorded.
///
/// A recycled pid has a different start time and is never signaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TrackedProcess {
    pid: Pid,
    start_time: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Descendants {
    tracked: Vec<TrackedProcess>,
}

impl Descendants {
    /// Records every process currently below `root` in the process tree.
    ///
    /// Processes recorded earlier are kept, even if they were reparented since.
    pub(crate) fn refresh(&mut self, root: u32) {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let mut frontier = vec![Pid::from_u32(root)];
        let mut visited = Vec::new();

        while let Some(parent) = frontier.pop() {
            for (pid, process) in system.processes() {
                // Threads are listed next to processes on Linux.
                if process.thread_kind().is_some() || process.parent() != Some(parent) || visited.contains(pid) {
                    continue;
                }

                visited.push(*pid);
                frontier.push(*pid);

                let tracked = TrackedProcess {
                    pid: *pid,
                    start_time: process.start_time(),
                };

                if !self.tracked.contains(&tracked) {
                    trace!(%pid, name = ?process.name(), "Tracking server descendant");
                    self.tracked.push(tracked);
                }
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Asks every tracked process still running to terminate.
    pub(crate) fn terminate(&self) {
        self.signal(Signal::Term);
    }

    /// Kills every tracked process still running.
    pub(crate) fn kill(&self) {
        self.signal(Signal::Kill);
    }

    /// Waits up to `patience` for the tracked processes to exit, then kills the survivors and
    /// waits up to `grace` for them to be gone.
    ///
    /// Returns whether a kill was needed, or the pid of a process that survived the kill.
    pub(crate) async fn sweep(&self, patience: Duration, grace: Duration) -> Result<bool, u32> {
        if self.is_empty() {
            return Ok(false);
        }

        let mut system = System::new();

        if self.wait_until_gone(&mut system, patience).await.is_empty() {
            return Ok(false);
        }

        warn!("Server descendants are still running; killing them");
        self.kill();

        match self.wait_until_gone(&mut system, grace).await.first() {
            None => Ok(true),
            Some(survivor) => Err(survivor.pid.as_u32()),
        }
    }

    fn signal(&self, signal: Signal) {
        let mut system = System::new();

        for tracked in self.alive(&mut system) {
            let Some(process) = system.process(tracked.pid) else {
                continue;
            };

            let sent = match signal {
                Signal::Kill => process.kill(),
                // Not every platform has a termination signal; the kill comes later.
                signal => process.kill_with(signal).unwrap_or(false),
            };

            if sent {
                debug!(pid = %tracked.pid, ?signal, "Signaled server descendant");
            }
        }
    }

    async fn wait_until_gone(&self, system: &mut System, timeout: Duration) -> Vec<TrackedProcess> {
        let deadline = Instant::now() + timeout;

        loop {
            let alive = self.alive(system);

            if alive.is_empty() || Instant::now() >= deadline {
                return alive;
            }

            tokio::time::sleep(SWEEP_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }

    fn alive(&self, system: &mut System) -> Vec<TrackedProcess> {
        let pids: Vec<Pid> = self.tracked.iter().map(|tracked| tracked.pid).collect();
        system.refresh_processes(ProcessesToUpdate::Some(&pids), true);

        self.tracked
            .iter()
            .copied()
            .filter(|tracked| {
                // A zombie is dead; only its parent's reaping is pending.
                system.process(tracked.pid).is_some_and(|process| {
                    process.start_time() == tracked.start_time && process.status() != ProcessStatus::Zombie
                })
            })
            .collect()
    }
}
