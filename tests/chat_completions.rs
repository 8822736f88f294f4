mod common;

use axum::http::StatusCode;
use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use serde_json::json;

use common::*;

fn chat_request(model: &str) -> serde_json::Value {
    json!({
        "model": model,
        "messages": [{ "role": "user", "content": "hello there" }],
    })
}

#[tokio::test]
async fn buffered_completion_translates_and_records_usage() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/api/chat");
        then.status(200)
            .header("content-type", "application/json")
            .body(ollama_chat_body("hi!", 12, 8));
    });

    let harness = spawn_app(&upstream.base_url()).await;
    let key = create_user(&harness.app, "alice").await;

    let response = send(
        &harness.app,
        "POST",
        "/v1/chat/completions",
        Some(&key),
        Some(chat_request("llama3.2:1b")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .expect("request id")
        .to_string();

    let body = body_json(response).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "hi!");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["prompt_tokens"], 12);
    assert_eq!(body["usage"]["completion_tokens"], 8);
    assert_eq!(body["usage"]["total_tokens"], 20);
    mock.assert();

    let usage = body_json(send(&harness.app, "GET", "/v1/usage", Some(&key), None).await).await;
    assert_eq!(usage["user_id"], "alice");
    assert_eq!(usage["request_count"], 1);
    assert_eq!(usage["total_tokens"], 20);
    assert_eq!(usage["by_model"]["llama3.2:1b"]["request_count"], 1);

    let history = body_json(
        send(&harness.app, "GET", "/v1/usage/history?limit=10", Some(&key), None).await,
    )
    .await;
    let rows = history["history"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["request_id"], request_id.as_str());
    assert_eq!(rows[0]["prompt_preview"], "hello there");
}

#[tokio::test]
async fn inbound_request_id_is_accepted_and_stored() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/api/chat");
        then.status(200).body(ollama_chat_body("ok", 1, 1));
    });

    let harness = spawn_app(&upstream.base_url()).await;
    let key = create_user(&harness.app, "alice").await;

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {key}"))
        .header("content-type", "application/json")
        .header("x-request-id", "trace-123")
        .body(axum::body::Body::from(chat_request("m").to_string()))
        .expect("request");
    let response = tower::util::ServiceExt::oneshot(harness.app.clone(), request)
        .await
        .expect("response");
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("trace-123")
    );

    let history = body_json(
        send(&harness.app, "GET", "/v1/usage/history", Some(&key), None).await,
    )
    .await;
    assert_eq!(history["history"][0]["request_id"], "trace-123");
}

#[tokio::test]
async fn third_request_in_a_minute_is_rejected_with_the_dimension() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/api/chat");
        then.status(200).body(ollama_chat_body("ok", 5, 5));
    });

    let harness = spawn_app(&upstream.base_url()).await;
    let key = create_user(&harness.app, "alice").await;
    put_limits(&harness.app, "alice", json!({ "requests_per_minute": 2 })).await;

    for _ in 0..2 {
        let response = send(
            &harness.app,
            "POST",
            "/v1/chat/completions",
            Some(&key),
            Some(chat_request("m")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = send(
        &harness.app,
        "POST",
        "/v1/chat/completions",
        Some(&key),
        Some(chat_request("m")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok()),
        Some("60")
    );
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "rate_limit_exceeded");
    assert!(body["error"]["message"]
        .as_str()
        .expect("message")
        .contains("requests per minute"));
}

#[tokio::test]
async fn cost_is_frozen_at_request_time() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/api/chat");
        then.status(200).body(ollama_chat_body("ok", 1_000_000, 500_000));
    });

    let harness = spawn_app(&upstream.base_url()).await;
    let key = create_user(&harness.app, "alice").await;
    set_pricing(&harness.app, "m1", 1.0, 2.0).await;

    let response = send(
        &harness.app,
        "POST",
        "/v1/chat/completions",
        Some(&key),
        Some(chat_request("m1")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let usage = body_json(send(&harness.app, "GET", "/v1/usage", Some(&key), None).await).await;
    assert!((usage["total_cost"].as_f64().expect("cost") - 2.0).abs() < 1e-9);

    // Raising the price later never rewrites the recorded row.
    let response = send(
        &harness.app,
        "PUT",
        "/admin/pricing/m1",
        Some(ADMIN_KEY),
        Some(json!({ "input_cost_per_million": 10.0, "output_cost_per_million": 20.0 })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let usage = body_json(send(&harness.app, "GET", "/v1/usage", Some(&key), None).await).await;
    assert!((usage["total_cost"].as_f64().expect("cost") - 2.0).abs() < 1e-9);

    let history = body_json(
        send(
            &harness.app,
            "GET",
            "/admin/pricing/history/m1",
            Some(ADMIN_KEY),
            None,
        )
        .await,
    )
    .await;
    assert_eq!(history["history"].as_array().expect("rows").len(), 2);
}

#[tokio::test]
async fn unpriced_model_records_zero_cost() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/api/chat");
        then.status(200).body(ollama_chat_body("ok", 100, 100));
    });

    let harness = spawn_app(&upstream.base_url()).await;
    let key = create_user(&harness.app, "alice").await;

    let response = send(
        &harness.app,
        "POST",
        "/v1/chat/completions",
        Some(&key),
        Some(chat_request("never-priced")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let usage = body_json(send(&harness.app, "GET", "/v1/usage", Some(&key), None).await).await;
    assert_eq!(usage["request_count"], 1);
    assert_eq!(usage["total_cost"].as_f64(), Some(0.0));
}

#[tokio::test]
async fn backend_errors_follow_the_taxonomy() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/api/chat");
        then.status(404).body("model not found");
    });

    let harness = spawn_app(&upstream.base_url()).await;
    let key = create_user(&harness.app, "alice").await;

    let response = send(
        &harness.app,
        "POST",
        "/v1/chat/completions",
        Some(&key),
        Some(chat_request("missing-model")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert!(body["error"]["message"]
        .as_str()
        .expect("message")
        .contains("missing-model"));

    // A dead backend surfaces as a gateway error, not a proxy crash.
    let harness = spawn_app("http://127.0.0.1:9").await;
    let key = create_user(&harness.app, "bob").await;
    let response = send(
        &harness.app,
        "POST",
        "/v1/chat/completions",
        Some(&key),
        Some(chat_request("m")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "server_error");
}

#[tokio::test]
async fn failed_requests_write_no_usage_rows() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/api/chat");
        then.status(500).body("boom");
    });

    let harness = spawn_app(&upstream.base_url()).await;
    let key = create_user(&harness.app, "alice").await;

    let response = send(
        &harness.app,
        "POST",
        "/v1/chat/completions",
        Some(&key),
        Some(chat_request("m")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let usage = body_json(send(&harness.app, "GET", "/v1/usage", Some(&key), None).await).await;
    assert_eq!(usage["request_count"], 0);
}

#[tokio::test]
async fn auth_failures_use_the_envelope() {
    let upstream = MockServer::start();
    let harness = spawn_app(&upstream.base_url()).await;
    create_user(&harness.app, "alice").await;

    // Missing header.
    let response = send(&harness.app, "GET", "/v1/usage", None, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok()),
        Some("Bearer")
    );
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "authentication_error");

    // Unknown key.
    let response = send(&harness.app, "GET", "/v1/usage", Some("sk-alice-forged"), None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // User credential on the admin surface.
    let response = send(&harness.app, "GET", "/admin/users", Some("sk-alice-forged"), None).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Health stays public.
    let response = send(&harness.app, "GET", "/health", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = send(&harness.app, "GET", "/", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn malformed_json_is_a_400_with_envelope() {
    let upstream = MockServer::start();
    let harness = spawn_app(&upstream.base_url()).await;
    let key = create_user(&harness.app, "alice").await;

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {key}"))
        .header("content-type", "application/json")
        .body(axum::body::Body::from("{not json"))
        .expect("request");
    let response = tower::util::ServiceExt::oneshot(harness.app.clone(), request)
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn models_endpoint_reshapes_backend_tags() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(GET).path("/api/tags");
        then.status(200)
            .header("content-type", "application/json")
            .body(json!({ "models": [{ "name": "llama3.2:1b" }, { "name": "moondream" }] }).to_string());
    });

    let harness = spawn_app(&upstream.base_url()).await;
    let key = create_user(&harness.app, "alice").await;

    let body = body_json(send(&harness.app, "GET", "/v1/models", Some(&key), None).await).await;
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["id"], "llama3.2:1b");
    assert_eq!(body["data"][1]["object"], "model");
    assert_eq!(body["data"][0]["owned_by"], "ollama");
}

#[tokio::test]
async fn pricing_endpoint_is_read_only_for_users() {
    let upstream = MockServer::start();
    let harness = spawn_app(&upstream.base_url()).await;
    let key = create_user(&harness.app, "alice").await;
    set_pricing(&harness.app, "m1", 1.0, 2.0).await;

    let body = body_json(send(&harness.app, "GET", "/v1/pricing", Some(&key), None).await).await;
    assert_eq!(body["pricing"][0]["model"], "m1");
    assert_eq!(body["pricing"][0]["input_cost_per_million"], 1.0);
}

#[tokio::test]
async fn concurrent_fan_in_serializes_on_the_backend_permit() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/api/chat");
        then.status(200).body(ollama_chat_body("ok", 2, 3));
    });

    let harness = spawn_app_with(&upstream.base_url(), |settings| {
        settings.ollama_max_concurrent = 1;
    })
    .await;
    let key = create_user(&harness.app, "alice").await;
    put_limits(&harness.app, "alice", json!({ "requests_per_minute": 1000 })).await;

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..50 {
        let app = harness.app.clone();
        let key = key.clone();
        tasks.spawn(async move {
            send(&app, "POST", "/v1/chat/completions", Some(&key), Some(chat_request("m"))).await
        });
    }

    let mut ok = 0;
    while let Some(result) = tasks.join_next().await {
        let response = result.expect("join");
        assert_eq!(response.status(), StatusCode::OK);
        ok += 1;
    }
    assert_eq!(ok, 50);

    let usage = body_json(send(&harness.app, "GET", "/v1/usage", Some(&key), None).await).await;
    assert_eq!(usage["request_count"], 50);
    assert_eq!(usage["total_tokens"], 50 * 5);
    assert_eq!(harness.state.backend.available_permits(), 1);
}

#[tokio::test]
async fn upload_endpoint_normalizes_images_into_the_pipeline() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/api/chat")
            .json_body_partial(r#"{ "model": "moondream" }"#);
        then.status(200).body(ollama_chat_body("a cat", 30, 6));
    });

    let harness = spawn_app(&upstream.base_url()).await;
    let key = create_user(&harness.app, "alice").await;

    let boundary = "TollgateTestBoundary";
    let mut body = Vec::new();
    for (name, value) in [
        ("model", "moondream"),
        ("messages", r#"[{"role":"user","content":"what is this"}]"#),
        ("stream", "false"),
    ] {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"files\"; filename=\"cat.png\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
    body.extend_from_slice(b"\x89PNG-fake-bytes");
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions/upload")
        .header("authorization", format!("Bearer {key}"))
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(axum::body::Body::from(body))
        .expect("request");
    let response = tower::util::ServiceExt::oneshot(harness.app.clone(), request)
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "a cat");
    mock.assert();

    let usage = body_json(send(&harness.app, "GET", "/v1/usage", Some(&key), None).await).await;
    assert_eq!(usage["by_model"]["moondream"]["total_tokens"], 36);
}

#[tokio::test]
async fn oversized_and_wrong_mime_uploads_are_rejected() {
    let upstream = MockServer::start();
    let harness = spawn_app_with(&upstream.base_url(), |settings| {
        settings.max_upload_size_mb = 1;
    })
    .await;
    let key = create_user(&harness.app, "alice").await;

    // Over the configured byte limit.
    let oversized = vec![b'x'; 1024 * 1024 + 1];
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions/upload")
        .header("authorization", format!("Bearer {key}"))
        .header("content-type", "multipart/form-data; boundary=b")
        .body(axum::body::Body::from(oversized))
        .expect("request");
    let response = tower::util::ServiceExt::oneshot(harness.app.clone(), request)
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");

    // Even past the body-limit hard ceiling the envelope holds.
    let far_oversized = vec![b'x'; 2 * 1024 * 1024 + 1024];
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions/upload")
        .header("authorization", format!("Bearer {key}"))
        .header("content-type", "multipart/form-data; boundary=b")
        .body(axum::body::Body::from(far_oversized))
        .expect("request");
    let response = tower::util::ServiceExt::oneshot(harness.app.clone(), request)
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert!(body["error"]["message"]
        .as_str()
        .expect("message")
        .contains("1 MB"));

    // Disallowed MIME type.
    let boundary = "b";
    let mut body = Vec::new();
    for (name, value) in [
        ("model", "moondream"),
        ("messages", r#"[{"role":"user","content":"hi"}]"#),
    ] {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"files\"; filename=\"cat.tiff\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: image/tiff\r\n\r\ntiff\r\n");
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions/upload")
        .header("authorization", format!("Bearer {key}"))
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(axum::body::Body::from(body))
        .expect("request");
    let response = tower::util::ServiceExt::oneshot(harness.app.clone(), request)
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}
