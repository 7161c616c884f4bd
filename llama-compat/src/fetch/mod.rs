//! Downloads of the server builds and of the model they are tested with.

mod model;
mod release;

use std::time::Duration;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt as _;

pub use model::ModelFetcher;
pub use release::{LATEST_FILE_NAME, RELEASE_METADATA_FILE_NAME, ReleaseFetcher, cached_release_dir};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

fn build_http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("failed to build HTTP client")
}

/// Streams `url` into `destination`.
///
/// Data is written to a `.part` sibling file first and renamed once complete, so an interrupted
/// download never leaves a truncated file under the final name.
async fn download_to_file(client: &reqwest::Client, url: &str, destination: &Utf8Path) -> anyhow::Result<usize> {
    info!(%url, %destination, "Downloading file from network...");

    let mut response = client
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .with_context(|| format!("failed to download {url}"))?;

    let part_path = Utf8PathBuf::from(format!("{destination}.part"));

    let mut file = tokio::fs::File::create(&part_path)
        .await
        .with_context(|| format!("failed to create {part_path}"))?;

    let mut written = 0;

    while let Some(chunk) = response
        .chunk()
        .await
        .with_context(|| format!("failed to read response body from {url}"))?
    {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("failed to write {part_path}"))?;
        written += chunk.len();
    }

    file.flush().await.with_context(|| format!("failed to flush {part_path}"))?;
    drop(file);

    tokio::fs::rename(&part_path, destination)
        .await
        .with_context(|| format!("failed to move {part_path} to {destination}"))?;

    debug!(%destination, bytes = written, "Download complete");

    Ok(written)
}

async fn is_non_empty_file(path: &Utf8Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|metadata| metadata.is_file() && metadata.len() > 0)
}
