//! Fixed HTTP probes against a running server.
//!
//! Every probe is a single request with a hard timeout. No retries are performed: one failed
//! request is one recorded failure.

use core::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, ProbeFailure, error_chain};

pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const CHAT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(60);

const SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const MODEL_NAME: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Health,
    ChatCompletion,
    Completion,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Health => "health",
            Self::ChatCompletion => "chat-completion",
            Self::Completion => "completion",
        };
        f.write_str(name)
    }
}

/// Outcome of one HTTP probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub kind: ProbeKind,
    pub url: String,
    /// `None` when no HTTP response was received.
    pub status: Option<u16>,
    pub latency: Duration,
    pub body: Option<String>,
    /// Generated text, for completion probes that passed.
    pub completion: Option<String>,
    pub failure: Option<ProbeFailure>,
}

impl ProbeResult {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn into_result(mut self) -> Result<Self, HarnessError> {
        let Some(source) = self.failure.take() else {
            return Ok(self);
        };

        let url = self.url;

        Err(match self.kind {
            ProbeKind::Health => HarnessError::HealthCheckFailed { url, source },
            ProbeKind::ChatCompletion => HarnessError::ChatCompletionFailed { url, source },
            ProbeKind::Completion => HarnessError::CompletionFailed { url, source },
        })
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    messages: Vec<ChatMessage<'a>>,
    model: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatChoiceMessage>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    n_predict: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProbeClient {
    client: reqwest::Client,
    health_timeout: Duration,
    chat_timeout: Duration,
}

impl ProbeClient {
    pub fn new() -> Result<Self, HarnessError> {
        Self::with_timeouts(HEALTH_TIMEOUT, CHAT_COMPLETION_TIMEOUT)
    }

    pub fn with_timeouts(health_timeout: Duration, chat_timeout: Duration) -> Result<Self, HarnessError> {
        // Servers under test always listen on a local address.
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(HarnessError::HttpClient)?;

        Ok(Self {
            client,
            health_timeout,
            chat_timeout,
        })
    }

    /// `GET /health`; any 2xx status passes.
    #[instrument(skip(self))]
    pub async fn check_health(&self, base_url: &str) -> ProbeResult {
        let url = endpoint(base_url, "/health");
        let request = self.client.get(&url);

        let (status, latency, outcome) = exchange(request, self.health_timeout).await;

        let (body, failure) = match outcome {
            Ok((code, body)) if is_success(code) => (Some(body), None),
            Ok((code, body)) => (
                Some(body.clone()),
                Some(ProbeFailure::Status { status: code, body }),
            ),
            Err(failure) => (None, Some(failure)),
        };

        finish(ProbeResult {
            kind: ProbeKind::Health,
            url,
            status,
            latency,
            body,
            completion: None,
            failure,
        })
    }

    /// `POST /v1/chat/completions` with a fixed two-message conversation.
    ///
    /// Passes on a 2xx status with a non-empty `choices[0].message.content`.
    #[instrument(skip(self))]
    pub async fn chat_completion(&self, base_url: &str, prompt: &str) -> ProbeResult {
        let url = endpoint(base_url, "/v1/chat/completions");
        let payload = ChatCompletionRequest {
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            model: MODEL_NAME,
            stream: false,
        };
        let request = self.client.post(&url).json(&payload);

        let (status, latency, outcome) = exchange(request, self.chat_timeout).await;

        let (body, completion, failure) = validate_generation(outcome, extract_chat_content);

        finish(ProbeResult {
            kind: ProbeKind::ChatCompletion,
            url,
            status,
            latency,
            body,
            completion,
            failure,
        })
    }

    /// `POST /completion`, the native llama.cpp endpoint.
    ///
    /// Passes on a 2xx status with a non-empty `content` field.
    #[instrument(skip(self))]
    pub async fn completion(&self, base_url: &str, prompt: &str, n_predict: u32) -> ProbeResult {
        let url = endpoint(base_url, "/completion");
        let request = self.client.post(&url).json(&CompletionRequest { prompt, n_predict });

        let (status, latency, outcome) = exchange(request, self.chat_timeout).await;

        let (body, completion, failure) = validate_generation(outcome, extract_completion_content);

        finish(ProbeResult {
            kind: ProbeKind::Completion,
            url,
            status,
            latency,
            body,
            completion,
            failure,
        })
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{path}", base_url.trim_end_matches('/'))
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

async fn exchange(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> (Option<u16>, Duration, Result<(u16, String), ProbeFailure>) {
    let started = Instant::now();

    let outcome = async {
        let response = request.timeout(timeout).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok::<_, reqwest::Error>((status, body))
    }
    .await
    .map_err(|error| classify(&error, timeout));

    let latency = started.elapsed();
    let status = outcome.as_ref().ok().map(|(status, _)| *status);

    (status, latency, outcome)
}

fn classify(error: &reqwest::Error, timeout: Duration) -> ProbeFailure {
    if error.is_timeout() {
        ProbeFailure::Timeout(timeout)
    } else {
        ProbeFailure::Transport(error_chain(error))
    }
}

fn validate_generation(
    outcome: Result<(u16, String), ProbeFailure>,
    extract: fn(&str) -> Result<String, ProbeFailure>,
) -> (Option<String>, Option<String>, Option<ProbeFailure>) {
    match outcome {
        Ok((status, body)) if is_success(status) => match extract(&body) {
            Ok(content) => (Some(body), Some(content), None),
            Err(failure) => (Some(body), None, Some(failure)),
        },
        Ok((status, body)) => (Some(body.clone()), None, Some(ProbeFailure::Status { status, body })),
        Err(failure) => (None, None, Some(failure)),
    }
}

fn extract_chat_content(body: &str) -> Result<String, ProbeFailure> {
    let response: ChatCompletionResponse =
        serde_json::from_str(body).map_err(|e| ProbeFailure::MalformedResponse(format!("invalid JSON: {e}")))?;

    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProbeFailure::MalformedResponse("no choices".to_owned()))?;

    let content = choice
        .message
        .ok_or_else(|| ProbeFailure::MalformedResponse("choice has no message".to_owned()))?
        .content
        .ok_or_else(|| ProbeFailure::MalformedResponse("message has no content".to_owned()))?;

    non_empty(content)
}

fn extract_completion_content(body: &str) -> Result<String, ProbeFailure> {
    let response: CompletionResponse =
        serde_json::from_str(body).map_err(|e| ProbeFailure::MalformedResponse(format!("invalid JSON: {e}")))?;

    let content = response
        .content
        .ok_or_else(|| ProbeFailure::MalformedResponse("response has no content".to_owned()))?;

    non_empty(content)
}

fn non_empty(content: String) -> Result<String, ProbeFailure> {
    if content.trim().is_empty() {
        Err(ProbeFailure::MalformedResponse("empty completion".to_owned()))
    } else {
        Ok(content)
    }
}

fn finish(result: ProbeResult) -> ProbeResult {
    match &result.failure {
        None => info!(kind = %result.kind, latency = ?result.latency, status = ?result.status, "Probe passed"),
        Some(failure) => warn!(kind = %result.kind, latency = ?result.latency, %failure, "Probe failed"),
    }

    result
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn chat_content_is_extracted() {
        let content = extract_chat_content(r#"{"choices":[{"message":{"role":"assistant","content":"hello"}}]}"#);
        assert_eq!(content, Ok("hello".to_owned()));
    }

    #[rstest]
    #[case("", "invalid JSON")]
    #[case("not json", "invalid JSON")]
    #[case(r#"{"choices":[]}"#, "no choices")]
    #[case(r#"{}"#, "no choices")]
    #[case(r#"{"choices":[{}]}"#, "choice has no message")]
    #[case(r#"{"choices":[{"message":{"role":"assistant"}}]}"#, "message has no content")]
    #[case(r#"{"choices":[{"message":{"content":""}}]}"#, "empty completion")]
    #[case(r#"{"choices":[{"message":{"content":"  \n"}}]}"#, "empty completion")]
    fn malformed_chat_bodies(#[case] body: &str, #[case] reason: &str) {
        let Err(ProbeFailure::MalformedResponse(actual)) = extract_chat_content(body) else {
            panic!("expected a malformed response for {body:?}");
        };
        assert!(actual.starts_with(reason), "{actual}");
    }

    #[rstest]
    #[case(r#"{"content":"4"}"#, Ok("4".to_owned()))]
    #[case(r#"{"content":""}"#, Err(ProbeFailure::MalformedResponse("empty completion".to_owned())))]
    #[case(r#"{"tokens":[]}"#, Err(ProbeFailure::MalformedResponse("response has no content".to_owned())))]
    fn completion_bodies(#[case] body: &str, #[case] expected: Result<String, ProbeFailure>) {
        assert_eq!(extract_completion_content(body), expected);
    }

    #[test]
    fn failed_probe_converts_to_matching_error() {
        let result = ProbeResult {
            kind: ProbeKind::ChatCompletion,
            url: "http://127.0.0.1:1/v1/chat/completions".to_owned(),
            status: Some(500),
            latency: Duration::from_millis(3),
            body: Some(String::new()),
            completion: None,
            failure: Some(ProbeFailure::Status {
                status: 500,
                body: String::new(),
            }),
        };

        let error = result.into_result().unwrap_err();
        assert!(matches!(error, HarnessError::ChatCompletionFailed { .. }));
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        assert_eq!(endpoint("http://127.0.0.1:8080/", "/health"), "http://127.0.0.1:8080/health");
        assert_eq!(endpoint("http://127.0.0.1:8080", "/health"), "http://127.0.0.1:8080/health");
    }
}
