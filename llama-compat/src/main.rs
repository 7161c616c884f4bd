#![allow(clippy::print_stdout, clippy::print_stderr, reason = "command line entry point")]

use std::env;
use std::future::Future;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use compat_log::{LogTarget, LoggerGuard};
use llama_compat::clock::Clock;
use llama_compat::config::{self, Conf, ConfOverrides};
use llama_compat::log::CompatLog;
use seahorse::{App, Command, Context, Flag, FlagType};
use tokio::runtime;
use tracing::{error, info};

fn main() {
    let args: Vec<String> = env::args().collect();

    let app = App::new(env!("CARGO_PKG_NAME"))
        .description(env!("CARGO_PKG_DESCRIPTION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .version(env!("CARGO_PKG_VERSION"))
        .usage(generate_usage())
        .action(run_action)
        .command(config_command());

    apply_common_flags(app).run(args);
}

fn generate_usage() -> String {
    format!(
        "{command} [flags]\n\
        \n\
        \tDownloads the latest server release and the test model, then tests every\n\
        \tserver executable built for this machine and writes a report.\n\
        \n\
        \tExample: test an already downloaded release with a local model\n\
        \n\
        \t  {command} --skip-download --model ./models/tiny.gguf --log-term\n\
        \n\
        Configuration is read from `{conf_file}` in the working directory, if present.\n\
        Exit code is 0 only when every executed test case passed.",
        command = env!("CARGO_PKG_NAME"),
        conf_file = config::DEFAULT_CONF_FILE_NAME,
    )
}

pub fn run<F: Future<Output = anyhow::Result<()>>>(f: F) -> anyhow::Result<()> {
    let rt = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("runtime build failed")?;

    match rt.block_on(f) {
        Ok(()) => info!("Terminated successfully"),
        Err(e) => {
            error!("{:#}", e);
            return Err(e);
        }
    }

    rt.shutdown_timeout(std::time::Duration::from_millis(100)); // just to be safe

    Ok(())
}

pub fn exit(res: anyhow::Result<()>) -> ! {
    match res {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{:?}", e);
            std::process::exit(1);
        }
    }
}

// default action

fn run_action(c: &Context) {
    // Read before any thread is spawned.
    let clock = Clock::local();

    let res = CommonArgs::parse(c).and_then(|args| {
        let conf = args.load_conf()?;
        let _logger_guard = setup_logger(&conf, args.log_term)?;

        info!(version = env!("CARGO_PKG_VERSION"), "Starting llama.cpp server compatibility tests");

        run(async {
            let summary = llama_compat::run(&conf, clock).await?;
            let outcome = &summary.outcome;

            println!(
                "{} passed, {} failed, {} skipped; report written to {}",
                outcome.passed(),
                outcome.failed(),
                outcome.skipped(),
                summary.report_path
            );

            if let Some(fatal) = &outcome.fatal {
                anyhow::bail!("test run aborted: {fatal}");
            }

            anyhow::ensure!(outcome.failed() == 0, "{} test case(s) failed", outcome.failed());
            anyhow::ensure!(outcome.is_success(), "no test case passed");

            Ok(())
        })
    });

    exit(res);
}

// config

const CONFIG_SUBCOMMAND: &str = "config";

fn config_command() -> Command {
    let usage = format!(
        "{command} {subcommand} [flags]\n\
        \n\
        Prints the effective configuration as JSON, after applying the command line flags.",
        command = env!("CARGO_PKG_NAME"),
        subcommand = CONFIG_SUBCOMMAND,
    );

    let cmd = Command::new(CONFIG_SUBCOMMAND)
        .description("Print the effective configuration")
        .usage(usage)
        .action(config_action);

    apply_common_flags(cmd)
}

fn config_action(c: &Context) {
    let res = CommonArgs::parse(c).and_then(|args| {
        let conf = args.load_conf()?;
        let json =
            serde_json::to_string_pretty(&conf.to_conf_file()).context("failed JSON serialization of configuration")?;
        println!("{json}");
        Ok(())
    });

    exit(res);
}

// args parsing

trait WithCommonFlags {
    fn flag(self, flag: Flag) -> Self;
}

impl WithCommonFlags for App {
    fn flag(self, flag: Flag) -> Self {
        App::flag(self, flag)
    }
}

impl WithCommonFlags for Command {
    fn flag(self, flag: Flag) -> Self {
        Command::flag(self, flag)
    }
}

fn apply_common_flags<T: WithCommonFlags>(cmd: T) -> T {
    cmd.flag(Flag::new("config", FlagType::String).description("Path to the JSON configuration file"))
        .flag(Flag::new("artifacts-dir", FlagType::String).description("Folder where server releases are downloaded"))
        .flag(Flag::new("models-dir", FlagType::String).description("Folder where models are downloaded"))
        .flag(Flag::new("reports-dir", FlagType::String).description("Folder where reports are written"))
        .flag(Flag::new("model", FlagType::String).description("Use this local model file instead of downloading one"))
        .flag(Flag::new("skip-download", FlagType::Bool).description("Use the already downloaded release and model"))
        .flag(Flag::new("filter", FlagType::String).description("Only test executables whose name contains this string"))
        .flag(
            Flag::new("readiness-timeout", FlagType::String)
                .description("How long a server may take to become ready (e.g.: 30s)"),
        )
        .flag(Flag::new("log-file", FlagType::String).description("Folder and prefix for log files"))
        .flag(Flag::new("log-term", FlagType::Bool).description("Print logs to stdout only"))
}

struct CommonArgs {
    conf_path: Option<Utf8PathBuf>,
    overrides: ConfOverrides,
    log_term: bool,
}

impl CommonArgs {
    fn parse(c: &Context) -> anyhow::Result<Self> {
        let path_flag = |name: &str| c.string_flag(name).ok().map(Utf8PathBuf::from);

        let readiness_timeout = if let Ok(timeout) = c.string_flag("readiness-timeout") {
            let timeout = humantime::parse_duration(&timeout).context("invalid value for readiness-timeout")?;
            anyhow::ensure!(!timeout.is_zero(), "readiness-timeout must be greater than zero");
            Some(timeout)
        } else {
            None
        };

        Ok(Self {
            conf_path: path_flag("config"),
            overrides: ConfOverrides {
                artifacts_dir: path_flag("artifacts-dir"),
                models_dir: path_flag("models-dir"),
                reports_dir: path_flag("reports-dir"),
                model_path: path_flag("model"),
                log_file: path_flag("log-file"),
                readiness_timeout,
                filter: c.string_flag("filter").ok(),
                skip_download: c.bool_flag("skip-download"),
            },
            log_term: c.bool_flag("log-term"),
        })
    }

    fn load_conf(&self) -> anyhow::Result<Conf> {
        let mut conf_file =
            config::load_conf_file_or_default(self.conf_path.as_deref()).context("failed to load configuration")?;

        conf_file.apply_overrides(self.overrides.clone());

        Conf::from_conf_file(&conf_file).context("invalid configuration")
    }
}

// logging

fn setup_logger(conf: &Conf, log_term: bool) -> anyhow::Result<LoggerGuard> {
    let target = if log_term {
        LogTarget::Term
    } else {
        LogTarget::File(&conf.log_file)
    };

    compat_log::init::<CompatLog>(
        target,
        conf.verbosity_profile.to_log_filter(),
        conf.log_filter.as_deref(),
    )
    .context("failed to setup logger")
}
