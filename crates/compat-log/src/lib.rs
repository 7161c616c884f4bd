use std::io;

use anyhow::Context as _;
use camino::Utf8Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

pub trait StaticLogConfig {
    const MAX_LOG_FILES: usize;
    const LOG_FILE_PREFIX: &'static str;
}

#[derive(Debug, Clone, Copy)]
pub enum LogTarget<'a> {
    /// Standard output only.
    Term,
    /// Standard output and a daily rolling file.
    ///
    /// The path is either a folder (files are named after `LOG_FILE_PREFIX`) or a file prefix.
    File(&'a Utf8Path),
}

/// Must be held until the program exits, otherwise buffered records are lost.
pub struct LoggerGuard {
    _file_guard: Option<WorkerGuard>,
    _stdio_guard: WorkerGuard,
}

struct LogPathCfg<'a, C: StaticLogConfig> {
    folder: &'a Utf8Path,
    prefix: &'a str,
    _phantom: std::marker::PhantomData<C>,
}

impl<'a, C: StaticLogConfig> LogPathCfg<'a, C> {
    fn from_path(path: &'a Utf8Path) -> anyhow::Result<Self> {
        if path.is_dir() {
            Ok(Self {
                folder: path,
                prefix: C::LOG_FILE_PREFIX,
                _phantom: std::marker::PhantomData,
            })
        } else {
            let folder = path.parent().context("invalid log path (parent)")?;
            let folder = if folder.as_str().is_empty() {
                Utf8Path::new(".")
            } else {
                folder
            };

            Ok(Self {
                folder,
                prefix: path.file_name().context("invalid log path (file_name)")?,
                _phantom: std::marker::PhantomData,
            })
        }
    }
}

pub fn init<C: StaticLogConfig>(
    target: LogTarget<'_>,
    log_filter: &str,
    debug_filtering_directives: Option<&str>,
) -> anyhow::Result<LoggerGuard> {
    let env_filter = build_env_filter(log_filter, debug_filtering_directives)?;

    let (non_blocking_stdio, stdio_guard) = tracing_appender::non_blocking(io::stdout());
    let stdio_layer = fmt::layer().with_writer(non_blocking_stdio);

    let (file_layer, file_guard) = match target {
        LogTarget::Term => (None, None),
        LogTarget::File(path) => {
            let log_cfg = LogPathCfg::<C>::from_path(path)?;

            std::fs::create_dir_all(log_cfg.folder)
                .with_context(|| format!("couldn't create log folder {}", log_cfg.folder))?;

            let file_appender = rolling::Builder::new()
                .rotation(rolling::Rotation::DAILY)
                .filename_prefix(log_cfg.prefix)
                .filename_suffix("log")
                .max_log_files(C::MAX_LOG_FILES)
                .build(log_cfg.folder)
                .context("couldn’t create file appender")?;
            let (file_non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer().with_writer(file_non_blocking).with_ansi(false);

            (Some(file_layer), Some(file_guard))
        }
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdio_layer)
        .with(env_filter)
        .try_init()
        .context("failed to install the global logger")?;

    Ok(LoggerGuard {
        _file_guard: file_guard,
        _stdio_guard: stdio_guard,
    })
}

fn build_env_filter(log_filter: &str, debug_filtering_directives: Option<&str>) -> anyhow::Result<EnvFilter> {
    let env_filter = EnvFilter::try_new(log_filter).context("invalid built-in filtering directives (this is a bug)")?;

    // Optionally add additional debugging filtering directives
    debug_filtering_directives
        .into_iter()
        .flat_map(|directives| directives.split(','))
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .try_fold(env_filter, |env_filter, directive| {
            let directive = directive
                .parse::<Directive>()
                .with_context(|| format!("invalid log directive: {directive}"))?;
            Ok(env_filter.add_directive(directive))
        })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    struct TestLog;

    impl StaticLogConfig for TestLog {
        const MAX_LOG_FILES: usize = 1;
        const LOG_FILE_PREFIX: &'static str = "test";
    }

    #[test]
    fn directory_path_uses_default_prefix() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(tempdir.path()).unwrap();

        let cfg = LogPathCfg::<TestLog>::from_path(path).unwrap();

        assert_eq!(cfg.folder, path);
        assert_eq!(cfg.prefix, "test");
    }

    #[test]
    fn file_path_is_split_into_folder_and_prefix() {
        let cfg = LogPathCfg::<TestLog>::from_path(Utf8Path::new("reports/llama-compat")).unwrap();
        assert_eq!(cfg.folder.as_str(), "reports");
        assert_eq!(cfg.prefix, "llama-compat");

        let cfg = LogPathCfg::<TestLog>::from_path(Utf8Path::new("llama-compat")).unwrap();
        assert_eq!(cfg.folder.as_str(), ".");
    }

    #[test]
    fn debug_directives_are_validated() {
        assert!(build_env_filter("info", Some("server_harness=trace, llama_compat=debug")).is_ok());
        assert!(build_env_filter("info", Some("")).is_ok());
        assert!(build_env_filter("info", Some("server_harness=loud")).is_err());
    }
}
