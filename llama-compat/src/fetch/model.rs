use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use server_harness::HarnessError;

use super::{build_http_client, download_to_file, is_non_empty_file};
use crate::config::{Conf, ModelConf};

/// Provides the model file every server is started with.
pub struct ModelFetcher {
    client: reqwest::Client,
    model: ModelConf,
    models_dir: Utf8PathBuf,
}

impl ModelFetcher {
    pub fn new(conf: &Conf) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_http_client()?,
            model: conf.model.clone(),
            models_dir: conf.models_dir.clone(),
        })
    }

    /// Where the downloaded model is stored: `{models_dir}/models--{owner}--{name}/{revision}/{file}`.
    pub fn cache_path(&self) -> Utf8PathBuf {
        cache_path(&self.models_dir, &self.model)
    }

    /// The configured local model file, or the download location.
    pub fn model_path(&self) -> Utf8PathBuf {
        match &self.model.path {
            Some(path) => path.clone(),
            None => self.cache_path(),
        }
    }

    /// Returns the model path, downloading the model first when it is not cached yet.
    ///
    /// A configured local model file is never downloaded.
    ///
    /// # Errors
    ///
    /// `ModelNotFound` when the configured local model file is missing.
    #[instrument(skip(self), fields(repository = %self.model.repository, file = %self.model.file))]
    pub async fn fetch(&self) -> anyhow::Result<Utf8PathBuf> {
        if let Some(path) = &self.model.path {
            return if is_non_empty_file(path).await {
                Ok(path.clone())
            } else {
                Err(HarnessError::ModelNotFound { path: path.clone() }.into())
            };
        }

        let path = self.cache_path();

        if is_non_empty_file(&path).await {
            info!(%path, "Using cached model");
            return Ok(path);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {parent}"))?;
        }

        let url = format!(
            "{}/{}/resolve/{}/{}",
            self.model.endpoint, self.model.repository, self.model.revision, self.model.file
        );

        download_to_file(&self.client, &url, &path).await?;

        info!(%path, "Model downloaded");

        Ok(path)
    }
}

fn cache_path(models_dir: &Utf8Path, model: &ModelConf) -> Utf8PathBuf {
    models_dir
        .join(format!("models--{}", model.repository.replace('/', "--")))
        .join(&model.revision)
        .join(&model.file)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use crate::config::dto;

    fn conf(models_dir: &Utf8Path, path: Option<&Utf8Path>) -> Conf {
        let mut conf = Conf::from_conf_file(&dto::ConfFile::default()).unwrap();
        conf.models_dir = models_dir.to_owned();
        conf.model.path = path.map(ToOwned::to_owned);
        conf
    }

    #[test]
    fn cache_path_mirrors_repository() {
        let fetcher = ModelFetcher::new(&conf(Utf8Path::new("models"), None)).unwrap();

        assert_eq!(
            fetcher.cache_path(),
            "models/models--unsloth--DeepSeek-R1-Distill-Qwen-1.5B-GGUF/main/DeepSeek-R1-Distill-Qwen-1.5B-Q4_K_M.gguf"
        );
    }

    #[tokio::test]
    async fn missing_local_model_is_reported() {
        let tempdir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tempdir.path()).unwrap();
        let model_path = dir.join("tiny.gguf");

        let fetcher = ModelFetcher::new(&conf(dir, Some(&model_path))).unwrap();

        let error = fetcher.fetch().await.unwrap_err();
        let error = error.downcast_ref::<HarnessError>().unwrap();
        assert!(matches!(error, HarnessError::ModelNotFound { path } if *path == model_path));

        std::fs::write(&model_path, b"GGUF").unwrap();
        assert_eq!(fetcher.fetch().await.unwrap(), model_path);
    }

    #[tokio::test]
    async fn cached_model_is_not_downloaded_again() {
        let tempdir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tempdir.path()).unwrap();

        let mut conf = conf(dir, None);
        // Any request would fail.
        conf.model.endpoint = "http://127.0.0.1:9".to_owned();
        let fetcher = ModelFetcher::new(&conf).unwrap();

        assert_eq!(fetcher.model_path(), fetcher.cache_path());

        let cached = fetcher.cache_path();
        std::fs::create_dir_all(cached.parent().unwrap()).unwrap();
        std::fs::write(&cached, b"GGUF").unwrap();

        assert_eq!(fetcher.fetch().await.unwrap(), cached);
    }
}
