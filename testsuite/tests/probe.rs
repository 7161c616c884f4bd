use std::time::Duration;

use server_harness::{HarnessError, LaunchConfig, ProbeClient, ProbeFailure, ProbeKind, ServerProcessManager, find_unused_port};
use testsuite::cli::{install_stub_server, utf8_tempdir, write_model};
use testsuite::mock_http::{MockHttpServer, MockResponse};

#[tokio::test]
async fn healthy_server_passes() {
    let server = MockHttpServer::start().await.unwrap();
    server.route("/health", MockResponse::json(&serde_json::json!({ "status": "ok" })));

    let result = ProbeClient::new().unwrap().check_health(&server.base_url()).await;

    assert!(result.is_success());
    assert_eq!(result.kind, ProbeKind::Health);
    assert_eq!(result.status, Some(200));
    assert_eq!(result.url, server.url("/health"));
    assert_eq!(server.hits("/health"), 1);
}

#[tokio::test]
async fn empty_health_body_passes() {
    let server = MockHttpServer::start().await.unwrap();
    server.route("/health", MockResponse::status(200, ""));

    let result = ProbeClient::new().unwrap().check_health(&server.base_url()).await;

    assert!(result.is_success(), "{result:?}");
    assert_eq!(result.status, Some(200));
    assert_eq!(result.body.as_deref(), Some(""));
    assert!(result.into_result().is_ok());
}

#[tokio::test]
async fn error_status_fails_with_body() {
    let server = MockHttpServer::start().await.unwrap();
    server.route("/health", MockResponse::status(500, "boom"));

    let result = ProbeClient::new().unwrap().check_health(&server.base_url()).await;

    assert!(!result.is_success());
    assert_eq!(result.status, Some(500));
    assert_eq!(
        result.failure,
        Some(ProbeFailure::Status {
            status: 500,
            body: "boom".to_owned()
        })
    );

    let error = result.into_result().unwrap_err();
    assert!(matches!(error, HarnessError::HealthCheckFailed { .. }), "{error:?}");
}

#[tokio::test]
async fn unreachable_server_is_a_transport_failure() {
    let port = find_unused_port().unwrap();

    let result = ProbeClient::new()
        .unwrap()
        .chat_completion(&format!("http://127.0.0.1:{port}"), "Say 'Hello, World!'")
        .await;

    assert_eq!(result.status, None);
    assert!(result.failure.as_ref().is_some_and(ProbeFailure::is_transport), "{result:?}");

    let error = result.into_result().unwrap_err();
    assert!(matches!(error, HarnessError::ChatCompletionFailed { .. }), "{error:?}");
}

#[tokio::test]
async fn slow_server_times_out() {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // Accepts connections but never answers.
    let _accept = tokio::spawn(async move {
        let mut connections = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            connections.push(stream);
        }
    });

    let probes = ProbeClient::with_timeouts(Duration::from_millis(200), Duration::from_millis(200)).unwrap();
    let result = probes.check_health(&format!("http://127.0.0.1:{port}")).await;

    assert_eq!(result.failure, Some(ProbeFailure::Timeout(Duration::from_millis(200))));
}

#[tokio::test]
async fn empty_generation_fails() {
    let (_tempdir, dir) = utf8_tempdir();
    let executable = install_stub_server(&dir);
    let model = write_model(&dir);

    let manager = ServerProcessManager::new(
        LaunchConfig::builder()
            .poll_interval(Duration::from_millis(50))
            .envs(vec![("STUB_LLAMA_MODE".to_owned(), "empty-completion".to_owned())])
            .build(),
    )
    .unwrap();

    let probes = ProbeClient::new().unwrap();

    let run = manager
        .run_scoped(&executable, &model, find_unused_port().unwrap(), |endpoint| {
            let probes = &probes;
            async move {
                let chat = probes.chat_completion(&endpoint.base_url, "Say 'Hello, World!'").await;
                let completion = probes.completion(&endpoint.base_url, "What is 2+2?", 32).await;
                (chat, completion)
            }
        })
        .await
        .unwrap();

    let (chat, completion) = run.value;
    run.stop.unwrap();

    for result in [&chat, &completion] {
        assert_eq!(result.status, Some(200));
        assert_eq!(
            result.failure,
            Some(ProbeFailure::MalformedResponse("empty completion".to_owned()))
        );
    }

    let error = chat.into_result().unwrap_err();
    assert!(matches!(error, HarnessError::ChatCompletionFailed { .. }), "{error:?}");

    let error = completion.into_result().unwrap_err();
    assert!(matches!(error, HarnessError::CompletionFailed { .. }), "{error:?}");
}
