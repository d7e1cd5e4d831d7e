use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use flow_gateway::credential::{Credential, DelegatedCredential, DirectCredential};
use flow_gateway::proxy::ProxyServices;
use flow_gateway::sampler::demote_key;
use flow_gateway::utils::test_support::{config_for_mock, should_skip_httpmock};
use flow_gateway::{GatewayConfig, Vendor, server};
use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use serde_json::json;
use tempfile::TempDir;
use tower::util::ServiceExt;

async fn gateway(
    upstream: &MockServer,
    state: &TempDir,
    customize: impl FnOnce(&mut GatewayConfig),
) -> Arc<ProxyServices> {
    let mut config = config_for_mock(&upstream.base_url(), &state.path().join("state.json"));
    customize(&mut config);
    let stores = server::open_stores(&config, None).await.unwrap();
    Arc::new(ProxyServices::from_parts(config, stores).unwrap())
}

fn delegated() -> Credential {
    Credential::Delegated(DelegatedCredential {
        client_id: "flow-client".to_string(),
        name: "platform".to_string(),
        agent: "simple_agent".to_string(),
        app_scope: "llm-api".to_string(),
        client_secret: "flow-secret".to_string(),
        tenant: "acme".to_string(),
    })
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("authorization", "Bearer please-ignore")
        .header("x-goog-api-key", "please-ignore")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn demoted(services: &ProxyServices, vendor: Vendor, client_id: &str) -> bool {
    services
        .stores
        .ephemeral
        .get(&demote_key(vendor.as_str(), client_id))
        .await
        .unwrap()
        .is_some()
}

#[tokio::test]
async fn gemini_direct_call_carries_key_in_query_and_applies_alias() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1beta/models/gemini-1.5-flash-002:generateContent")
                .query_param("alt", "sse")
                .query_param("key", "AIza-direct");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"candidates":[]}"#);
        })
        .await;

    let state = TempDir::new().unwrap();
    let services = gateway(&upstream, &state, |config| {
        config.gemini_aliases.insert(
            "gemini-1.5-pro-002".to_string(),
            "gemini-1.5-flash-002".to_string(),
        );
    })
    .await;
    let gemini = Credential::Direct(DirectCredential::new("g", Vendor::GoogleGemini, "AIza-direct"));
    services.credentials.set(&gemini).await.unwrap();
    services
        .credentials
        .set(&Credential::Direct(DirectCredential::new(
            "o",
            Vendor::AzureOpenai,
            "sk-other-vendor",
        )))
        .await
        .unwrap();

    let mut request = post_json(
        "/gemini/v1beta/models/gemini-1.5-pro-002:generateContent?alt=sse",
        json!({"contents": []}),
    );
    request
        .headers_mut()
        .insert("x-request-id", "req-gemini".parse().unwrap());
    let response = server::router(services.clone()).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("req-gemini")
    );
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes, r#"{"candidates":[]}"#);
    mock.assert_async().await;
    assert!(!demoted(&services, Vendor::GoogleGemini, gemini.client_id()).await);
}

#[tokio::test]
async fn openai_direct_call_uses_bearer_key_and_versioned_path() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-direct");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"id":"chatcmpl-1"}"#);
        })
        .await;

    let state = TempDir::new().unwrap();
    let services = gateway(&upstream, &state, |_| {}).await;
    services
        .credentials
        .set(&Credential::Direct(DirectCredential::new(
            "o",
            Vendor::AzureOpenai,
            "sk-direct",
        )))
        .await
        .unwrap();

    let response = server::router(services)
        .oneshot(post_json(
            "/openai/chat/completions",
            json!({"model": "gpt-4o", "messages": []}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    mock.assert_async().await;
}

#[tokio::test]
async fn bedrock_direct_call_passes_model_path_through() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/model/anthropic.claude-3/invoke")
                .header("authorization", "Bearer bedrock-key");
            then.status(200).body("{}");
        })
        .await;

    let state = TempDir::new().unwrap();
    let services = gateway(&upstream, &state, |_| {}).await;
    services
        .credentials
        .set(&Credential::Direct(DirectCredential::new(
            "b",
            Vendor::AmazonBedrock,
            "bedrock-key",
        )))
        .await
        .unwrap();

    let response = server::router(services)
        .oneshot(post_json(
            "/v1/amazon-bedrock/model/anthropic.claude-3/invoke",
            json!({"messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    mock.assert_async().await;
}

#[tokio::test]
async fn delegated_call_exchanges_once_and_augments_headers_and_body() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    let token_mock = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/auth-engine-api/v1/api-key/token")
                .header("flowtenant", "acme")
                .json_body(json!({
                    "appToAccess": "llm-api",
                    "clientId": "flow-client",
                    "clientSecret": "flow-secret"
                }));
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"tok-1","expires_in":"3600"}"#);
        })
        .await;
    let models_mock = upstream
        .mock_async(|when, then| {
            when.method(GET)
                .path("/ai-orchestration-api/v1/models")
                .header("authorization", "Bearer test-session");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"google-gemini":["gemini-pro"],"cohere":["command"]}"#);
        })
        .await;
    let backend_mock = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/ai-orchestration-api/v1/google/generateContent")
                .header("authorization", "Bearer tok-1")
                .header("flowtenant", "acme")
                .header("flowagent", "simple_agent")
                .header("cookie", "FlowToken=tok-1")
                .json_body(json!({
                    "contents": [],
                    "model": "gemini-pro",
                    "allowedModels": ["gemini-pro"]
                }));
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":true}"#);
        })
        .await;

    let state = TempDir::new().unwrap();
    let services = gateway(&upstream, &state, |_| {}).await;
    services.credentials.set(&delegated()).await.unwrap();
    let app = server::router(services.clone());

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post_json(
                "/gemini/v1beta/models/gemini-pro:generateContent",
                json!({"contents": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes, r#"{"ok":true}"#);
    }

    token_mock.assert_calls(1);
    models_mock.assert_calls(1);
    backend_mock.assert_calls(2);
}

#[tokio::test]
async fn ineligible_model_is_rejected_without_a_backend_call() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(POST).path("/auth-engine-api/v1/api-key/token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"tok-1","expires_in":3600}"#);
        })
        .await;
    upstream
        .mock_async(|when, then| {
            when.method(GET).path("/ai-orchestration-api/v1/models");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"google-gemini":["gemini-other"]}"#);
        })
        .await;
    let backend_mock = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/ai-orchestration-api/v1/google/generateContent");
            then.status(200).body("{}");
        })
        .await;

    let state = TempDir::new().unwrap();
    let services = gateway(&upstream, &state, |_| {}).await;
    services.credentials.set(&delegated()).await.unwrap();

    let response = server::router(services.clone())
        .oneshot(post_json(
            "/gemini/v1beta/models/gemini-pro:generateContent",
            json!({"contents": []}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], "no_eligible_route");
    backend_mock.assert_calls(0);
    assert!(!demoted(&services, Vendor::GoogleGemini, "flow-client").await);
}

#[tokio::test]
async fn backend_error_passes_through_and_demotes_the_credential() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1beta/models/gemini-pro:generateContent");
            then.status(500)
                .header("content-type", "text/plain")
                .header("x-upstream-trace", "t-1")
                .body("quota exhausted");
        })
        .await;

    let state = TempDir::new().unwrap();
    let services = gateway(&upstream, &state, |_| {}).await;
    let gemini = Credential::Direct(DirectCredential::new("g", Vendor::GoogleGemini, "AIza-failing"));
    services.credentials.set(&gemini).await.unwrap();

    let response = server::router(services.clone())
        .oneshot(post_json(
            "/gemini/v1beta/models/gemini-pro:generateContent",
            json!({"contents": []}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response
            .headers()
            .get("x-upstream-trace")
            .and_then(|v| v.to_str().ok()),
        Some("t-1")
    );
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes, "quota exhausted");
    assert!(demoted(&services, Vendor::GoogleGemini, gemini.client_id()).await);
}

#[tokio::test]
async fn unreachable_backend_is_a_gateway_error_and_demotes() {
    if should_skip_httpmock() {
        return;
    }
    let closed = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let dead_url = format!("http://{}", closed.local_addr().unwrap());
    drop(closed);

    let upstream = MockServer::start_async().await;
    let state = TempDir::new().unwrap();
    let services = gateway(&upstream, &state, |config| {
        config.direct.google_gemini = Some(dead_url);
    })
    .await;
    let gemini = Credential::Direct(DirectCredential::new("g", Vendor::GoogleGemini, "AIza-dead"));
    services.credentials.set(&gemini).await.unwrap();

    let response = server::router(services.clone())
        .oneshot(post_json(
            "/gemini/v1beta/models/gemini-pro:generateContent",
            json!({"contents": []}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(demoted(&services, Vendor::GoogleGemini, gemini.client_id()).await);
}

#[tokio::test]
async fn missing_model_is_rejected_before_forwarding() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    let backend_mock = upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).body("{}");
        })
        .await;

    let state = TempDir::new().unwrap();
    let services = gateway(&upstream, &state, |_| {}).await;
    let openai = Credential::Direct(DirectCredential::new("o", Vendor::AzureOpenai, "sk-direct"));
    services.credentials.set(&openai).await.unwrap();

    let response = server::router(services.clone())
        .oneshot(post_json("/openai/v1/chat/completions", json!({"messages": []})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    backend_mock.assert_calls(0);
    assert!(!demoted(&services, Vendor::AzureOpenai, openai.client_id()).await);
}

#[tokio::test]
async fn credentials_survive_a_restart_through_the_state_file() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    let state = TempDir::new().unwrap();

    let first = gateway(&upstream, &state, |_| {}).await;
    first.credentials.set(&delegated()).await.unwrap();
    drop(first);

    let second = gateway(&upstream, &state, |_| {}).await;
    assert_eq!(second.credentials.get("flow-client").await.unwrap(), delegated());
}

#[tokio::test]
async fn foundry_direct_call_carries_key_in_api_key_header() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/openai/deployments/gpt4/chat/completions")
                .query_param("api-version", "2024-06-01")
                .header("api-key", "foundry-key");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"id":"chatcmpl-f"}"#);
        })
        .await;

    let state = TempDir::new().unwrap();
    let services = gateway(&upstream, &state, |_| {}).await;
    services
        .credentials
        .set(&Credential::Direct(DirectCredential::new(
            "f",
            Vendor::AzureFoundry,
            "foundry-key",
        )))
        .await
        .unwrap();

    let response = server::router(services)
        .oneshot(post_json(
            "/v1/foundry/v1/openai/deployments/gpt4/chat/completions?api-version=2024-06-01",
            json!({"model": "gpt-4o", "messages": []}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes, r#"{"id":"chatcmpl-f"}"#);
    mock.assert_async().await;
}

#[tokio::test]
async fn slow_backend_times_out_and_demotes() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .delay(std::time::Duration::from_secs(3))
                .body("{}");
        })
        .await;

    let state = TempDir::new().unwrap();
    let services = gateway(&upstream, &state, |config| {
        config.forward_timeout_secs = 1;
    })
    .await;
    let openai = Credential::Direct(DirectCredential::new("o", Vendor::AzureOpenai, "sk-slow"));
    services.credentials.set(&openai).await.unwrap();

    let response = server::router(services.clone())
        .oneshot(post_json(
            "/openai/v1/chat/completions",
            json!({"model": "gpt-4o", "messages": []}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], "backend_timeout");
    assert!(demoted(&services, Vendor::AzureOpenai, openai.client_id()).await);
}

/// Answers one connection with a 200 that promises more body than it sends.
fn stalling_backend() -> String {
    use std::io::{Read, Write};

    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    std::thread::spawn(move || {
        let Ok((mut conn, _)) = listener.accept() else {
            return;
        };
        let mut buf = [0u8; 4096];
        let _ = conn.read(&mut buf);
        let _ = conn.write_all(
            b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncontent-length: 1000\r\n\r\npartial",
        );
        let _ = conn.flush();
        std::thread::sleep(std::time::Duration::from_secs(5));
    });
    url
}

#[tokio::test]
async fn body_stalling_after_headers_demotes_the_credential() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    let backend_url = stalling_backend();
    let state = TempDir::new().unwrap();
    let services = gateway(&upstream, &state, |config| {
        config.forward_timeout_secs = 1;
        config.direct.azure_openai = Some(backend_url);
    })
    .await;
    let openai = Credential::Direct(DirectCredential::new("o", Vendor::AzureOpenai, "sk-stall"));
    services.credentials.set(&openai).await.unwrap();

    let response = server::router(services.clone())
        .oneshot(post_json(
            "/openai/v1/chat/completions",
            json!({"model": "gpt-4o", "stream": true}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(!demoted(&services, Vendor::AzureOpenai, openai.client_id()).await);
    assert!(to_bytes(response.into_body(), usize::MAX).await.is_err());
    assert!(demoted(&services, Vendor::AzureOpenai, openai.client_id()).await);
}
