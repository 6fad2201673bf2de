//! The OpenAI client against a local stand-in for the completion API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use askdata::completion::{CompletionClient, CompletionRequest, Credentials, OpenAiClient};
use askdata::models::Message;

#[derive(Clone, Default)]
struct Captured {
    requests: Arc<Mutex<Vec<(HeaderMap, Value)>>>,
}

async fn start_upstream(status: StatusCode, reply: Value) -> (String, Captured) {
    let captured = Captured::default();
    let app = Router::new()
        .route(
            "/v1/chat/completions",
            post(
                move |State(captured): State<Captured>, headers: HeaderMap, Json(body): Json<Value>| {
                    let reply = reply.clone();
                    async move {
                        captured.requests.lock().unwrap().push((headers, body));
                        (status, Json(reply))
                    }
                },
            ),
        )
        .with_state(captured.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), captured)
}

fn request() -> CompletionRequest {
    CompletionRequest {
        model: "gpt-4".into(),
        messages: vec![
            Message::system("You are a helpful assistant."),
            Message::user("Say hi"),
        ],
        max_tokens: 1000,
        temperature: 1.0,
        stream: false,
    }
}

#[tokio::test]
async fn test_request_shape_and_headers() {
    let (host, captured) = start_upstream(
        StatusCode::OK,
        json!({"id": "cmpl-1", "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}}]}),
    )
    .await;
    let client = OpenAiClient::new(&format!("{}/", host), Duration::from_secs(5)).unwrap();
    assert_eq!(client.endpoint(), format!("{}/v1/chat/completions", host));

    let response = client
        .complete(
            &request(),
            &Credentials {
                api_key: "sk-user".into(),
                organization: Some("org-42".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(response.first_text().as_deref(), Some("hi"));

    let requests = captured.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let (headers, body) = &requests[0];
    assert_eq!(headers["authorization"], "Bearer sk-user");
    assert_eq!(headers["openai-organization"], "org-42");
    assert_eq!(
        body,
        &json!({
            "model": "gpt-4",
            "messages": [
                {"role": "system", "content": "You are a helpful assistant."},
                {"role": "user", "content": "Say hi"}
            ],
            "max_tokens": 1000,
            "temperature": 1.0,
            "stream": false
        })
    );
}

#[tokio::test]
async fn test_organization_header_omitted_when_unset() {
    let (host, captured) = start_upstream(StatusCode::OK, json!({"choices": []})).await;
    let client = OpenAiClient::new(&host, Duration::from_secs(5)).unwrap();

    let response = client
        .complete(
            &request(),
            &Credentials {
                api_key: "sk-user".into(),
                organization: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(response.first_text(), None);

    let requests = captured.requests.lock().unwrap();
    assert!(requests[0].0.get("openai-organization").is_none());
}

#[tokio::test]
async fn test_error_status_fails_without_retry() {
    let (host, captured) = start_upstream(
        StatusCode::TOO_MANY_REQUESTS,
        json!({"error": {"message": "Rate limit reached"}}),
    )
    .await;
    let client = OpenAiClient::new(&host, Duration::from_secs(5)).unwrap();

    let err = client
        .complete(
            &request(),
            &Credentials {
                api_key: "sk-user".into(),
                organization: None,
            },
        )
        .await
        .unwrap_err();
    let message = format!("{:#}", err);
    assert!(message.contains("429"), "got {}", message);
    assert!(message.contains("Rate limit reached"), "got {}", message);
    assert_eq!(captured.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unreachable_host_is_an_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = OpenAiClient::new(&format!("http://{}", addr), Duration::from_secs(2)).unwrap();
    let result = client
        .complete(
            &request(),
            &Credentials {
                api_key: "sk-user".into(),
                organization: None,
            },
        )
        .await;
    assert!(result.is_err());
}
