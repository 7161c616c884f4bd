use std::fs::File;
use std::io::BufReader;
use std::time::Duration;

use anyhow::{Context as _, bail};
use camino::{Utf8Path, Utf8PathBuf};
use server_harness::LaunchConfig;
use server_harness::probe::{CHAT_COMPLETION_TIMEOUT, HEALTH_TIMEOUT};
use server_harness::process::{GRACE_PERIOD, POLL_INTERVAL, READINESS_TIMEOUT};
use tap::prelude::*;

pub const DEFAULT_CONF_FILE_NAME: &str = "llama-compat.json";

const DEFAULT_ARTIFACTS_DIR: &str = "artifacts";
const DEFAULT_MODELS_DIR: &str = "models";
const DEFAULT_REPORTS_DIR: &str = "reports";
const DEFAULT_LOG_FILE: &str = "logs/llama-compat";

const DEFAULT_RELEASE_REPOSITORY: &str = "BodhiSearch/llama.cpp";
const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

const DEFAULT_MODEL_REPOSITORY: &str = "unsloth/DeepSeek-R1-Distill-Qwen-1.5B-GGUF";
const DEFAULT_MODEL_FILE: &str = "DeepSeek-R1-Distill-Qwen-1.5B-Q4_K_M.gguf";
const DEFAULT_MODEL_REVISION: &str = "main";
const DEFAULT_HUGGING_FACE_ENDPOINT: &str = "https://huggingface.co";

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_CHAT_PROMPT: &str = "Say 'Hello, World!'";

#[derive(Debug, Clone)]
pub struct Conf {
    pub artifacts_dir: Utf8PathBuf,
    pub models_dir: Utf8PathBuf,
    pub reports_dir: Utf8PathBuf,
    pub log_file: Utf8PathBuf,
    pub verbosity_profile: dto::VerbosityProfile,
    pub log_filter: Option<String>,
    pub release: ReleaseConf,
    pub model: ModelConf,
    pub server: ServerConf,
    pub probes: ProbesConf,
    /// File names of the executables to test; empty means every executable matching the host.
    pub executables: Vec<String>,
    /// Substring an executable name must contain to be tested.
    pub filter: Option<String>,
    pub skip_download: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseConf {
    /// `owner/name` of the GitHub repository publishing the server builds.
    pub repository: String,
    pub api_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConf {
    /// `owner/name` of the Hugging Face repository.
    pub repository: String,
    pub file: String,
    pub revision: String,
    pub endpoint: String,
    /// Local model file used as is, bypassing the download.
    pub path: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConf {
    pub host: String,
    /// Fixed port; a free port is picked for each test case when unset.
    pub port: Option<u16>,
    pub readiness_timeout: Duration,
    pub poll_interval: Duration,
    pub grace_period: Duration,
    pub extra_args: Vec<String>,
}

impl ServerConf {
    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig::builder()
            .readiness_timeout(self.readiness_timeout)
            .poll_interval(self.poll_interval)
            .grace_period(self.grace_period)
            .host(self.host.clone())
            .extra_args(self.extra_args.clone())
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbesConf {
    pub health_timeout: Duration,
    pub chat_timeout: Duration,
    pub chat_prompt: String,
    pub completion_prompts: Vec<dto::CompletionPrompt>,
}

impl Conf {
    pub fn from_conf_file(conf_file: &dto::ConfFile) -> anyhow::Result<Self> {
        let release = conf_file.release.clone().unwrap_or_default();
        let model = conf_file.model.clone().unwrap_or_default();
        let server = conf_file.server.clone().unwrap_or_default();
        let probes = conf_file.probes.clone().unwrap_or_default();

        let release = ReleaseConf {
            repository: release
                .repository
                .unwrap_or_else(|| DEFAULT_RELEASE_REPOSITORY.to_owned())
                .pipe(|repository| check_repository_name(&repository).map(|()| repository))
                .context("invalid release repository")?,
            api_url: release
                .api_url
                .unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_owned())
                .pipe(trim_url),
        };

        let model = ModelConf {
            repository: model
                .repository
                .unwrap_or_else(|| DEFAULT_MODEL_REPOSITORY.to_owned())
                .pipe(|repository| check_repository_name(&repository).map(|()| repository))
                .context("invalid model repository")?,
            file: model.file.unwrap_or_else(|| DEFAULT_MODEL_FILE.to_owned()),
            revision: model.revision.unwrap_or_else(|| DEFAULT_MODEL_REVISION.to_owned()),
            endpoint: model
                .endpoint
                .unwrap_or_else(|| DEFAULT_HUGGING_FACE_ENDPOINT.to_owned())
                .pipe(trim_url),
            path: model.path,
        };

        let server = ServerConf {
            host: server.host.unwrap_or_else(|| DEFAULT_HOST.to_owned()),
            port: server.port,
            readiness_timeout: server.readiness_timeout.map_or(READINESS_TIMEOUT, Duration::from),
            poll_interval: server.poll_interval.map_or(POLL_INTERVAL, Duration::from),
            grace_period: server.grace_period.map_or(GRACE_PERIOD, Duration::from),
            extra_args: server.extra_args.unwrap_or_default(),
        };

        if server.port == Some(0) {
            bail!("server port must not be 0");
        }

        if server.readiness_timeout.is_zero() {
            bail!("readiness timeout must be greater than zero");
        }

        if server.poll_interval.is_zero() {
            bail!("poll interval must be greater than zero");
        }

        if server.grace_period.is_zero() {
            bail!("grace period must be greater than zero");
        }

        let probes = ProbesConf {
            health_timeout: probes.health_timeout.map_or(HEALTH_TIMEOUT, Duration::from),
            chat_timeout: probes.chat_timeout.map_or(CHAT_COMPLETION_TIMEOUT, Duration::from),
            chat_prompt: probes.chat_prompt.unwrap_or_else(|| DEFAULT_CHAT_PROMPT.to_owned()),
            completion_prompts: probes
                .completion_prompts
                .unwrap_or_else(dto::CompletionPrompt::defaults),
        };

        if probes.health_timeout.is_zero() {
            bail!("health timeout must be greater than zero");
        }

        if probes.chat_timeout.is_zero() {
            bail!("chat timeout must be greater than zero");
        }

        if probes.chat_prompt.trim().is_empty() {
            bail!("chat prompt must not be empty");
        }

        Ok(Conf {
            artifacts_dir: conf_file
                .artifacts_dir
                .clone()
                .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_ARTIFACTS_DIR)),
            models_dir: conf_file
                .models_dir
                .clone()
                .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_MODELS_DIR)),
            reports_dir: conf_file
                .reports_dir
                .clone()
                .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_REPORTS_DIR)),
            log_file: conf_file
                .log_file
                .clone()
                .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_LOG_FILE)),
            verbosity_profile: conf_file.verbosity_profile.unwrap_or_default(),
            log_filter: conf_file.log_filter.clone(),
            release,
            model,
            server,
            probes,
            executables: conf_file.executables.clone().unwrap_or_default(),
            filter: conf_file.filter.clone(),
            skip_download: conf_file.skip_download.unwrap_or(false),
        })
    }

    /// Fully populated configuration file equivalent to this configuration.
    pub fn to_conf_file(&self) -> dto::ConfFile {
        dto::ConfFile {
            artifacts_dir: Some(self.artifacts_dir.clone()),
            models_dir: Some(self.models_dir.clone()),
            reports_dir: Some(self.reports_dir.clone()),
            log_file: Some(self.log_file.clone()),
            verbosity_profile: Some(self.verbosity_profile),
            log_filter: self.log_filter.clone(),
            release: Some(dto::ReleaseConf {
                repository: Some(self.release.repository.clone()),
                api_url: Some(self.release.api_url.clone()),
            }),
            model: Some(dto::ModelConf {
                repository: Some(self.model.repository.clone()),
                file: Some(self.model.file.clone()),
                revision: Some(self.model.revision.clone()),
                endpoint: Some(self.model.endpoint.clone()),
                path: self.model.path.clone(),
            }),
            server: Some(dto::ServerConf {
                host: Some(self.server.host.clone()),
                port: self.server.port,
                readiness_timeout: Some(self.server.readiness_timeout.into()),
                poll_interval: Some(self.server.poll_interval.into()),
                grace_period: Some(self.server.grace_period.into()),
                extra_args: Some(self.server.extra_args.clone()),
            }),
            probes: Some(dto::ProbesConf {
                health_timeout: Some(self.probes.health_timeout.into()),
                chat_timeout: Some(self.probes.chat_timeout.into()),
                chat_prompt: Some(self.probes.chat_prompt.clone()),
                completion_prompts: Some(self.probes.completion_prompts.clone()),
            }),
            executables: Some(self.executables.clone()),
            filter: self.filter.clone(),
            skip_download: Some(self.skip_download),
            rest: serde_json::Map::new(),
        }
    }
}

/// Values given on the command line, taking precedence over the configuration file.
#[derive(Debug, Clone, Default)]
pub struct ConfOverrides {
    pub artifacts_dir: Option<Utf8PathBuf>,
    pub models_dir: Option<Utf8PathBuf>,
    pub reports_dir: Option<Utf8PathBuf>,
    pub model_path: Option<Utf8PathBuf>,
    pub log_file: Option<Utf8PathBuf>,
    pub readiness_timeout: Option<Duration>,
    pub filter: Option<String>,
    pub skip_download: bool,
}

impl dto::ConfFile {
    pub fn apply_overrides(&mut self, overrides: ConfOverrides) {
        if let Some(artifacts_dir) = overrides.artifacts_dir {
            self.artifacts_dir = Some(artifacts_dir);
        }

        if let Some(models_dir) = overrides.models_dir {
            self.models_dir = Some(models_dir);
        }

        if let Some(reports_dir) = overrides.reports_dir {
            self.reports_dir = Some(reports_dir);
        }

        if let Some(log_file) = overrides.log_file {
            self.log_file = Some(log_file);
        }

        if let Some(model_path) = overrides.model_path {
            self.model.get_or_insert_with(Default::default).path = Some(model_path);
        }

        if let Some(readiness_timeout) = overrides.readiness_timeout {
            self.server.get_or_insert_with(Default::default).readiness_timeout = Some(readiness_timeout.into());
        }

        if let Some(filter) = overrides.filter {
            self.filter = Some(filter);
        }

        if overrides.skip_download {
            self.skip_download = Some(true);
        }
    }
}

/// Loads the configuration file at `conf_path`, or `llama-compat.json` in the working directory.
///
/// An explicitly given file must exist. Without one, a missing default file means built-in
/// defaults; nothing is written to disk.
pub fn load_conf_file_or_default(conf_path: Option<&Utf8Path>) -> anyhow::Result<dto::ConfFile> {
    match conf_path {
        Some(conf_path) => load_conf_file(conf_path)?.with_context(|| format!("config file not found at {conf_path}")),
        None => {
            let conf_file = load_conf_file(Utf8Path::new(DEFAULT_CONF_FILE_NAME))?.unwrap_or_default();
            Ok(conf_file)
        }
    }
}

fn load_conf_file(conf_path: &Utf8Path) -> anyhow::Result<Option<dto::ConfFile>> {
    match File::open(conf_path) {
        Ok(file) => BufReader::new(file)
            .pipe(serde_json::from_reader)
            .map(Some)
            .with_context(|| format!("invalid config file at {conf_path}")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::anyhow!(e).context(format!("couldn't open config file at {conf_path}"))),
    }
}

fn check_repository_name(repository: &str) -> anyhow::Result<()> {
    match repository.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => Ok(()),
        _ => bail!("expected `owner/name`, got `{repository}`"),
    }
}

fn trim_url(url: String) -> String {
    match url.strip_suffix('/') {
        Some(trimmed) => trimmed.to_owned(),
        None => url,
    }
}

pub mod dto {
    use core::fmt;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::*;

    /// Duration written in human-readable form, such as `10s` or `250ms`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HumanDuration(Duration);

    impl From<Duration> for HumanDuration {
        fn from(value: Duration) -> Self {
            Self(value)
        }
    }

    impl From<HumanDuration> for Duration {
        fn from(value: HumanDuration) -> Self {
            value.0
        }
    }

    impl fmt::Display for HumanDuration {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", humantime::format_duration(self.0))
        }
    }

    impl Serialize for HumanDuration {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_str(self)
        }
    }

    impl<'de> Deserialize<'de> for HumanDuration {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let value = String::deserialize(deserializer)?;
            humantime::parse_duration(&value)
                .map(Self)
                .map_err(|e| serde::de::Error::custom(format!("invalid duration `{value}`: {e}")))
        }
    }

    #[derive(PartialEq, Eq, Debug, Default, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ReleaseConf {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub repository: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub api_url: Option<String>,
    }

    #[derive(PartialEq, Eq, Debug, Default, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ModelConf {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub repository: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub file: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub revision: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub endpoint: Option<String>,
        /// Local model file, used instead of downloading one
        #[serde(skip_serializing_if = "Option::is_none")]
        pub path: Option<Utf8PathBuf>,
    }

    #[derive(PartialEq, Eq, Debug, Default, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ServerConf {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub host: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub readiness_timeout: Option<HumanDuration>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub poll_interval: Option<HumanDuration>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub grace_period: Option<HumanDuration>,
        /// Additional arguments appended to the server command line
        #[serde(skip_serializing_if = "Option::is_none")]
        pub extra_args: Option<Vec<String>>,
    }

    #[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct CompletionPrompt {
        pub prompt: String,
        pub n_predict: u32,
    }

    impl CompletionPrompt {
        pub fn defaults() -> Vec<Self> {
            vec![
                Self {
                    prompt: "Hello, how are you?".to_owned(),
                    n_predict: 128,
                },
                Self {
                    prompt: "What is 2+2?".to_owned(),
                    n_predict: 32,
                },
            ]
        }
    }

    #[derive(PartialEq, Eq, Debug, Default, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ProbesConf {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub health_timeout: Option<HumanDuration>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub chat_timeout: Option<HumanDuration>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub chat_prompt: Option<String>,
        /// Prompts sent to the native `/completion` endpoint; an empty list disables the probe
        #[serde(skip_serializing_if = "Option::is_none")]
        pub completion_prompts: Option<Vec<CompletionPrompt>>,
    }

    /// Source of truth for the test runner configuration
    ///
    /// This struct represents the JSON file used for configuration as close as possible
    /// and is not trying to be too smart.
    #[derive(PartialEq, Debug, Default, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ConfFile {
        /// Folder where server releases are downloaded
        #[serde(skip_serializing_if = "Option::is_none")]
        pub artifacts_dir: Option<Utf8PathBuf>,

        /// Folder where models are downloaded
        #[serde(skip_serializing_if = "Option::is_none")]
        pub models_dir: Option<Utf8PathBuf>,

        /// Folder where test reports are written
        #[serde(skip_serializing_if = "Option::is_none")]
        pub reports_dir: Option<Utf8PathBuf>,

        /// Folder and prefix for log files
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_file: Option<Utf8PathBuf>,

        /// Verbosity profile
        #[serde(skip_serializing_if = "Option::is_none")]
        pub verbosity_profile: Option<VerbosityProfile>,

        /// Additional tracing directives, comma-separated
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_filter: Option<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub release: Option<ReleaseConf>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub model: Option<ModelConf>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub server: Option<ServerConf>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub probes: Option<ProbesConf>,

        /// File names of the server executables to test
        #[serde(skip_serializing_if = "Option::is_none")]
        pub executables: Option<Vec<String>>,

        /// Only test executables whose name contains this string
        #[serde(skip_serializing_if = "Option::is_none")]
        pub filter: Option<String>,

        /// Use the already downloaded release and model
        #[serde(skip_serializing_if = "Option::is_none")]
        pub skip_download: Option<bool>,

        /// Other unofficial options.
        /// This field is useful so that we can deserialize
        /// and then losslessly serialize back all root keys of the config file.
        #[serde(flatten)]
        pub rest: serde_json::Map<String, serde_json::Value>,
    }

    /// Verbosity profile (pre-defined tracing directives)
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize, Default)]
    pub enum VerbosityProfile {
        /// The default profile, mostly info records
        #[default]
        Default,
        /// Recommended profile for developers
        Debug,
        /// Show all traces
        All,
        /// Only show warnings and errors
        Quiet,
    }

    impl VerbosityProfile {
        pub fn to_log_filter(self) -> &'static str {
            match self {
                VerbosityProfile::Default => "info",
                VerbosityProfile::Debug => "info,server_harness=debug,llama_compat=debug",
                VerbosityProfile::All => "trace",
                VerbosityProfile::Quiet => "warn",
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let conf_file: dto::ConfFile = serde_json::from_str("{}").unwrap();
        let conf = Conf::from_conf_file(&conf_file).unwrap();

        assert_eq!(conf.artifacts_dir, "artifacts");
        assert_eq!(conf.reports_dir, "reports");
        assert_eq!(conf.release.repository, "BodhiSearch/llama.cpp");
        assert_eq!(conf.model.file, "DeepSeek-R1-Distill-Qwen-1.5B-Q4_K_M.gguf");
        assert_eq!(conf.server.host, "127.0.0.1");
        assert_eq!(conf.server.port, None);
        assert_eq!(conf.server.readiness_timeout, Duration::from_secs(10));
        assert_eq!(conf.probes.health_timeout, Duration::from_secs(10));
        assert_eq!(conf.probes.chat_timeout, Duration::from_secs(60));
        assert_eq!(conf.probes.chat_prompt, "Say 'Hello, World!'");
        assert_eq!(conf.probes.completion_prompts.len(), 2);
        assert!(conf.executables.is_empty());
        assert!(!conf.skip_download);
    }

    #[test]
    fn pascal_case_file_is_parsed() {
        let json = r#"{
            "ArtifactsDir": "/var/cache/llama/artifacts",
            "VerbosityProfile": "Debug",
            "Release": { "Repository": "ggml-org/llama.cpp", "ApiUrl": "http://127.0.0.1:9000/" },
            "Model": { "Path": "/models/tiny.gguf" },
            "Server": { "Port": 8089, "ReadinessTimeout": "30s", "PollInterval": "100ms", "ExtraArgs": ["--ctx-size", "512"] },
            "Probes": { "ChatTimeout": "2m", "CompletionPrompts": [] },
            "Executables": ["llama-server-linux-x86_64"],
            "SomethingElse": true
        }"#;

        let conf_file: dto::ConfFile = serde_json::from_str(json).unwrap();
        assert!(conf_file.rest.contains_key("SomethingElse"));

        let conf = Conf::from_conf_file(&conf_file).unwrap();

        assert_eq!(conf.artifacts_dir, "/var/cache/llama/artifacts");
        assert_eq!(conf.verbosity_profile, dto::VerbosityProfile::Debug);
        assert_eq!(conf.release.repository, "ggml-org/llama.cpp");
        assert_eq!(conf.release.api_url, "http://127.0.0.1:9000");
        assert_eq!(conf.model.path.as_deref(), Some(Utf8Path::new("/models/tiny.gguf")));
        assert_eq!(conf.server.port, Some(8089));
        assert_eq!(conf.server.readiness_timeout, Duration::from_secs(30));
        assert_eq!(conf.server.poll_interval, Duration::from_millis(100));
        assert_eq!(conf.server.extra_args, ["--ctx-size", "512"]);
        assert_eq!(conf.probes.chat_timeout, Duration::from_secs(120));
        assert!(conf.probes.completion_prompts.is_empty());
        assert_eq!(conf.executables, ["llama-server-linux-x86_64"]);

        let launch = conf.server.launch_config();
        assert_eq!(launch.readiness_timeout, Duration::from_secs(30));
        assert_eq!(launch.extra_args, ["--ctx-size", "512"]);
    }

    #[test]
    fn invalid_duration_is_rejected() {
        let error = serde_json::from_str::<dto::ConfFile>(r#"{ "Server": { "ReadinessTimeout": "soon" } }"#)
            .unwrap_err()
            .to_string();
        assert!(error.contains("invalid duration `soon`"), "{error}");
    }

    #[test]
    fn invalid_values_are_rejected() {
        for json in [
            r#"{ "Server": { "Port": 0 } }"#,
            r#"{ "Server": { "PollInterval": "0s" } }"#,
            r#"{ "Server": { "GracePeriod": "0s" } }"#,
            r#"{ "Probes": { "HealthTimeout": "0s" } }"#,
            r#"{ "Probes": { "ChatTimeout": "0s" } }"#,
            r#"{ "Release": { "Repository": "llama.cpp" } }"#,
            r#"{ "Probes": { "ChatPrompt": "  " } }"#,
        ] {
            let conf_file: dto::ConfFile = serde_json::from_str(json).unwrap();
            assert!(Conf::from_conf_file(&conf_file).is_err(), "{json}");
        }
    }

    #[test]
    fn overrides_take_precedence() {
        let mut conf_file: dto::ConfFile =
            serde_json::from_str(r#"{ "ReportsDir": "out", "Server": { "ReadinessTimeout": "30s", "Port": 9000 } }"#)
                .unwrap();

        conf_file.apply_overrides(ConfOverrides {
            reports_dir: Some(Utf8PathBuf::from("elsewhere")),
            model_path: Some(Utf8PathBuf::from("tiny.gguf")),
            readiness_timeout: Some(Duration::from_secs(3)),
            filter: Some("cpu".to_owned()),
            skip_download: true,
            ..Default::default()
        });

        let conf = Conf::from_conf_file(&conf_file).unwrap();

        assert_eq!(conf.reports_dir, "elsewhere");
        assert_eq!(conf.model.path.as_deref(), Some(Utf8Path::new("tiny.gguf")));
        assert_eq!(conf.server.readiness_timeout, Duration::from_secs(3));
        assert_eq!(conf.server.port, Some(9000));
        assert_eq!(conf.filter.as_deref(), Some("cpu"));
        assert!(conf.skip_download);
    }

    #[test]
    fn effective_configuration_serializes_durations_as_text() {
        let conf = Conf::from_conf_file(&dto::ConfFile::default()).unwrap();
        let json = serde_json::to_value(conf.to_conf_file()).unwrap();

        assert_eq!(json["Server"]["ReadinessTimeout"], "10s");
        assert_eq!(json["Server"]["PollInterval"], "250ms");
        assert_eq!(json["Probes"]["ChatTimeout"], "1m");
        assert_eq!(json["Probes"]["CompletionPrompts"][1]["NPredict"], 32);
    }

    #[test]
    fn missing_default_file_is_not_an_error() {
        let tempdir = tempfile::tempdir().unwrap();
        let missing = Utf8Path::from_path(tempdir.path()).unwrap().join("absent.json");

        assert!(load_conf_file(&missing).unwrap().is_none());
        assert!(load_conf_file_or_default(Some(&missing)).is_err());
    }
}
