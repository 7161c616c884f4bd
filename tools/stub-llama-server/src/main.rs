//! Answers the few endpoints the compatibility runner probes, the way `llama-server` does.
//!
//! The behavior is selected with environment variables:
//!
//! - `STUB_LLAMA_MODE`: `ok` (default), `never-ready`, `hang`, `exit`, `empty-completion` or `ignore-sigterm`.
//! - `STUB_LLAMA_STARTUP_DELAY_MS`: delay before the listener is bound.
//! - `STUB_LLAMA_COMPLETION`: generated text (default `hello`).

#![allow(clippy::print_stdout, clippy::print_stderr, reason = "the stub mimics the server console output")]

use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context as _;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Ok,
    NeverReady,
    Hang,
    Exit,
    EmptyCompletion,
    IgnoreSigterm,
}

impl Mode {
    fn from_env() -> anyhow::Result<Self> {
        let mode = match std::env::var("STUB_LLAMA_MODE").as_deref() {
            Err(_) | Ok("ok") => Self::Ok,
            Ok("never-ready") => Self::NeverReady,
            Ok("hang") => Self::Hang,
            Ok("exit") => Self::Exit,
            Ok("empty-completion") => Self::EmptyCompletion,
            Ok("ignore-sigterm") => Self::IgnoreSigterm,
            Ok(other) => anyhow::bail!("unknown STUB_LLAMA_MODE `{other}`"),
        };

        Ok(mode)
    }
}

struct Args {
    model: String,
    port: u16,
    host: IpAddr,
}

impl Args {
    fn parse() -> anyhow::Result<Self> {
        let mut model = None;
        let mut port = 8080;
        let mut host = IpAddr::from([127, 0, 0, 1]);

        let mut args = std::env::args().skip(1);

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--model" | "-m" => model = Some(args.next().context("missing value for --model")?),
                "--port" => {
                    port = args
                        .next()
                        .context("missing value for --port")?
                        .parse()
                        .context("invalid port")?;
                }
                "--host" => {
                    host = args
                        .next()
                        .context("missing value for --host")?
                        .parse()
                        .context("invalid host")?;
                }
                // Unknown flags are accepted, like the real server accepts flags this stub does not model.
                _ => {}
            }
        }

        Ok(Self {
            model: model.context("--model is required")?,
            port,
            host,
        })
    }
}

#[derive(Clone)]
struct AppState {
    mode: Mode,
    completion: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let mode = Mode::from_env()?;
    let args = Args::parse()?;

    println!("build: stub ({})", env!("CARGO_PKG_VERSION"));
    eprintln!("llama_model_loader: loading model from {}", args.model);

    anyhow::ensure!(
        std::path::Path::new(&args.model).is_file(),
        "failed to load model '{}'",
        args.model
    );

    if let Some(delay) = std::env::var("STUB_LLAMA_STARTUP_DELAY_MS")
        .ok()
        .and_then(|value| value.parse().ok())
    {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    match mode {
        Mode::Exit => anyhow::bail!("simulated crash during model load"),
        Mode::Hang => loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        },
        _ => {}
    }

    let state = AppState {
        mode,
        completion: std::env::var("STUB_LLAMA_COMPLETION").unwrap_or_else(|_| "hello".to_owned()),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/completion", post(completion))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind((args.host, args.port))
        .await
        .with_context(|| format!("couldn't bind {}:{}", args.host, args.port))?;

    println!("main: server is listening on http://{}:{}", args.host, args.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(mode))
        .await
        .context("server failure")?;

    println!("main: server is shutting down");

    Ok(())
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    if state.mode == Mode::NeverReady {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": { "code": 503, "message": "Loading model" } })),
        )
    } else {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    }
}

async fn chat_completions(State(state): State<AppState>, Json(request): Json<Value>) -> Json<Value> {
    let content = generated(&state);

    Json(json!({
        "object": "chat.completion",
        "model": request.get("model").cloned().unwrap_or(Value::Null),
        "choices": [{
            "index": 0,
            "finish_reason": "stop",
            "message": { "role": "assistant", "content": content },
        }],
    }))
}

async fn completion(State(state): State<AppState>, Json(_request): Json<Value>) -> Json<Value> {
    Json(json!({ "content": generated(&state), "stop": true }))
}

fn generated(state: &AppState) -> &str {
    if state.mode == Mode::EmptyCompletion {
        ""
    } else {
        &state.completion
    }
}

async fn shutdown_signal(mode: Mode) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let Ok(mut terminate) = signal(SignalKind::terminate()) else {
            return std::future::pending().await;
        };

        loop {
            terminate.recv().await;

            if mode == Mode::IgnoreSigterm {
                eprintln!("main: ignoring termination signal");
                continue;
            }

            break;
        }
    }

    #[cfg(not(unix))]
    {
        let _ = mode;
        let _ = tokio::signal::ctrl_c().await;
    }
}
