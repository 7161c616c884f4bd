use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use server_harness::executable::discover;
use server_harness::{Arch, HarnessError, Platform, ServerExecutable};

/// Server executables found in a release folder.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    release_dir: Utf8PathBuf,
    executables: Vec<ServerExecutable>,
}

impl ArtifactStore {
    pub fn open(release_dir: &Utf8Path) -> anyhow::Result<Self> {
        let executables =
            discover(release_dir).with_context(|| format!("failed to list server executables in {release_dir}"))?;

        debug!(%release_dir, count = executables.len(), "Discovered server executables");

        Ok(Self {
            release_dir: release_dir.to_owned(),
            executables,
        })
    }

    pub fn release_dir(&self) -> &Utf8Path {
        &self.release_dir
    }

    /// Every recognized executable, whatever its target.
    pub fn executables(&self) -> &[ServerExecutable] {
        &self.executables
    }

    /// # Errors
    ///
    /// `ArtifactNotFound` when no executable targets `platform`/`arch`.
    pub fn executables_for(&self, platform: Platform, arch: Arch) -> Result<Vec<&ServerExecutable>, HarnessError> {
        let matching: Vec<_> = self
            .executables
            .iter()
            .filter(|executable| executable.matches(platform, arch))
            .collect();

        if matching.is_empty() {
            Err(HarnessError::ArtifactNotFound { platform, arch })
        } else {
            Ok(matching)
        }
    }
}
