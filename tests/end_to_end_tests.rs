mod common;

use ai_chat_proxy::{
    chat::ChatMessage,
    client::{CONNECTION_TROUBLE_MESSAGE, ChatClient, ClientConfig, ClientError, Transcript},
    config::Config,
    server::{AppState, create_app},
};
use common::{Slot, anthropic_stream, canonical_stream, config_for, sse};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

/// Run the proxy on an ephemeral port, returning its chat URL
async fn spawn_proxy(config: Config) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_app(AppState::new(config).unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/ai-chat", addr)
}

fn client(endpoint: String) -> ChatClient {
    ChatClient::new(ClientConfig::new(endpoint).with_retries(2, Duration::from_millis(10))).unwrap()
}

#[tokio::test]
async fn test_anthropic_answer_reaches_client_as_one_message() {
    let providers = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/lovable"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&providers)
        .await;
    Mock::given(method("POST"))
        .and(path("/anthropic"))
        .respond_with(sse(anthropic_stream(&["The ", "deadline is June 30."])))
        .mount(&providers)
        .await;

    let endpoint = spawn_proxy(config_for(&providers, &[Slot::Lovable, Slot::Anthropic])).await;

    let mut transcript = Transcript::with_greeting();
    let answer = assert_ok!(
        client(endpoint)
            .send(&mut transcript, "When is the deadline?", &CancellationToken::new(), |_| {})
            .await
    );

    assert_eq!(answer, "The deadline is June 30.");
    assert_eq!(
        transcript.messages().last(),
        Some(&ChatMessage::assistant("The deadline is June 30."))
    );
}

#[tokio::test]
async fn test_passthrough_answer_reaches_client() {
    let providers = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/openai"))
        .respond_with(sse(canonical_stream(&["Hello", " there"])))
        .mount(&providers)
        .await;

    let endpoint = spawn_proxy(config_for(&providers, &[Slot::OpenAi])).await;

    let mut transcript = Transcript::new();
    let answer = assert_ok!(
        client(endpoint)
            .send(&mut transcript, "hi", &CancellationToken::new(), |_| {})
            .await
    );
    assert_eq!(answer, "Hello there");
}

#[tokio::test]
async fn test_every_provider_failing_yields_single_error_bubble() {
    let providers = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&providers)
        .await;

    let endpoint = spawn_proxy(config_for(&providers, &[Slot::OpenAi, Slot::Anthropic])).await;

    let mut transcript = Transcript::new();
    let err = assert_err!(
        client(endpoint)
            .send(&mut transcript, "hi", &CancellationToken::new(), |_| {})
            .await
    );

    match err {
        ClientError::Proxy { status, code, .. } => {
            assert_eq!(status, 503);
            assert_eq!(code.as_deref(), Some("providers_unavailable"));
        }
        other => panic!("unexpected {other:?}"),
    }
    // Three whole-request attempts, each walking both providers.
    assert_eq!(providers.received_requests().await.unwrap().len(), 6);
    assert_eq!(
        transcript.messages(),
        &[ChatMessage::user("hi"), ChatMessage::error(CONNECTION_TROUBLE_MESSAGE)]
    );
}

#[tokio::test]
async fn test_unconfigured_proxy_fails_fast() {
    let endpoint = spawn_proxy(Config::default()).await;

    let mut transcript = Transcript::new();
    let err = assert_err!(
        client(endpoint)
            .send(&mut transcript, "hi", &CancellationToken::new(), |_| {})
            .await
    );
    assert!(matches!(err, ClientError::Proxy { status: 503, .. }));
    assert!(!err.is_retryable());
}
