use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use time::OffsetDateTime;
use time::macros::format_description;

use super::{build_http_client, download_to_file};
use crate::clock::Clock;
use crate::config::Conf;

/// Records the tag of the last fully downloaded release, at the root of the artifacts folder.
pub const LATEST_FILE_NAME: &str = "latest.txt";
pub const RELEASE_METADATA_FILE_NAME: &str = "release.json";

/// Assets with these extensions are documents, not programs.
const NON_EXECUTABLE_EXTENSIONS: &[&str] = &["json", "txt", "md"];

#[derive(Deserialize)]
struct Release {
    tag_name: Option<String>,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

/// Downloads every asset of the latest GitHub release into `{artifacts_dir}/{tag}`.
pub struct ReleaseFetcher {
    client: reqwest::Client,
    api_url: String,
    repository: String,
    artifacts_dir: Utf8PathBuf,
    clock: Clock,
}

impl ReleaseFetcher {
    pub fn new(conf: &Conf, clock: Clock) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_http_client()?,
            api_url: conf.release.api_url.clone(),
            repository: conf.release.repository.clone(),
            artifacts_dir: conf.artifacts_dir.clone(),
            clock,
        })
    }

    /// Returns the folder holding the latest release, downloading it unless already cached.
    #[instrument(skip(self), fields(repository = %self.repository))]
    pub async fn fetch_latest(&self) -> anyhow::Result<Utf8PathBuf> {
        let url = format!("{}/repos/{}/releases/latest", self.api_url, self.repository);

        info!(%url, "Querying latest release");

        let metadata: serde_json::Value = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json")
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("failed to query {url}"))?
            .json()
            .await
            .with_context(|| format!("invalid release metadata from {url}"))?;

        let release = Release::deserialize(&metadata).context("unexpected release metadata layout")?;

        let tag = match release.tag_name.as_deref() {
            Some(tag) if is_valid_dir_name(tag) => tag.to_owned(),
            Some(tag) => anyhow::bail!("release tag `{tag}` can't be used as a folder name"),
            None => format_tag(self.clock.now()),
        };

        tokio::fs::create_dir_all(&self.artifacts_dir)
            .await
            .with_context(|| format!("failed to create {}", self.artifacts_dir))?;

        let release_dir = self.artifacts_dir.join(&tag);
        let latest_path = self.artifacts_dir.join(LATEST_FILE_NAME);

        let cached_tag = read_latest_tag(&latest_path).await;

        if cached_tag.as_deref() == Some(tag.as_str()) && has_entries(&release_dir).await {
            info!(%tag, %release_dir, "Using cached artifacts");
            return Ok(release_dir);
        }

        info!(%tag, assets = release.assets.len(), "Downloading release artifacts");

        // A folder without a matching `latest.txt` is left over from an interrupted download.
        if tokio::fs::try_exists(&release_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&release_dir)
                .await
                .with_context(|| format!("failed to remove stale {release_dir}"))?;
        }

        tokio::fs::create_dir_all(&release_dir)
            .await
            .with_context(|| format!("failed to create {release_dir}"))?;

        let metadata_path = release_dir.join(RELEASE_METADATA_FILE_NAME);
        let metadata = serde_json::to_string_pretty(&metadata).context("failed JSON serialization of release")?;
        tokio::fs::write(&metadata_path, metadata)
            .await
            .with_context(|| format!("failed to write {metadata_path}"))?;

        for asset in &release.assets {
            let Some(file_name) = Utf8Path::new(&asset.name).file_name() else {
                warn!(name = %asset.name, "Skipping asset with an unusable name");
                continue;
            };

            let asset_path = release_dir.join(file_name);

            download_to_file(&self.client, &asset.browser_download_url, &asset_path).await?;

            if is_executable_asset(file_name) {
                mark_executable(&asset_path).await?;
            }
        }

        tokio::fs::write(&latest_path, &tag)
            .await
            .with_context(|| format!("failed to write {latest_path}"))?;

        info!(%tag, %release_dir, "Release artifacts downloaded");

        Ok(release_dir)
    }
}

/// Folder of the last downloaded release, or the artifacts folder itself when nothing was
/// downloaded through [`ReleaseFetcher`].
pub async fn cached_release_dir(artifacts_dir: &Utf8Path) -> Utf8PathBuf {
    let latest_path = artifacts_dir.join(LATEST_FILE_NAME);

    match read_latest_tag(&latest_path).await {
        Some(tag) if is_valid_dir_name(&tag) && has_entries(&artifacts_dir.join(&tag)).await => artifacts_dir.join(tag),
        _ => artifacts_dir.to_owned(),
    }
}

async fn read_latest_tag(path: &Utf8Path) -> Option<String> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    let tag = content.trim();
    (!tag.is_empty()).then(|| tag.to_owned())
}

async fn has_entries(dir: &Utf8Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => entries.next_entry().await.ok().flatten().is_some(),
        Err(_) => false,
    }
}

fn format_tag(datetime: OffsetDateTime) -> String {
    let format = format_description!("[year][month][day][hour][minute]");
    datetime
        .format(&format)
        .unwrap_or_else(|_| datetime.unix_timestamp().to_string())
}

fn is_valid_dir_name(tag: &str) -> bool {
    !tag.is_empty() && tag != "." && tag != ".." && !tag.contains(['/', '\\'])
}

fn is_executable_asset(file_name: &str) -> bool {
    Utf8Path::new(file_name)
        .extension()
        .is_none_or(|extension| !NON_EXECUTABLE_EXTENSIONS.contains(&extension))
}

#[cfg(unix)]
async fn mark_executable(path: &Utf8Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .with_context(|| format!("failed to make {path} executable"))?;

    debug!(%path, "Made asset executable");

    Ok(())
}

#[cfg(not(unix))]
async fn mark_executable(_path: &Utf8Path) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use rstest::rstest;
    use time::macros::datetime;

    use super::*;

    #[rstest]
    #[case("llama-server-linux-x86_64", true)]
    #[case("llama-server-haswell.exe", true)]
    #[case("release.json", false)]
    #[case("NOTES.md", false)]
    #[case("checksums.txt", false)]
    fn executable_assets(#[case] name: &str, #[case] expected: bool) {
        assert_eq!(is_executable_asset(name), expected);
    }

    #[rstest]
    #[case("b4567", true)]
    #[case("build-8c63e5b9", true)]
    #[case("", false)]
    #[case("..", false)]
    #[case("a/b", false)]
    fn tag_as_folder_name(#[case] tag: &str, #[case] expected: bool) {
        assert_eq!(is_valid_dir_name(tag), expected);
    }

    #[test]
    fn fallback_tag_is_minute_timestamp() {
        assert_eq!(format_tag(datetime!(2025-02-03 04:05:06 UTC)), "202502030405");
    }

    #[tokio::test]
    async fn cached_release_dir_follows_latest_file() {
        let tempdir = tempfile::tempdir().unwrap();
        let artifacts_dir = Utf8Path::from_path(tempdir.path()).unwrap();

        assert_eq!(cached_release_dir(artifacts_dir).await.as_path(), artifacts_dir);

        std::fs::write(artifacts_dir.join(LATEST_FILE_NAME), "b100\n").unwrap();
        assert_eq!(
            cached_release_dir(artifacts_dir).await.as_path(),
            artifacts_dir,
            "release folder is missing"
        );

        std::fs::create_dir(artifacts_dir.join("b100")).unwrap();
        std::fs::write(artifacts_dir.join("b100").join("llama-server-linux-x86_64"), "").unwrap();
        assert_eq!(cached_release_dir(artifacts_dir).await, artifacts_dir.join("b100"));
    }
}
