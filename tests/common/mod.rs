#![allow(dead_code)]

use axum::body::{to_bytes, Body};
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::util::ServiceExt;

use tollgate::{AppState, Settings, Store};

pub const ADMIN_KEY: &str = "test-admin-key";

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    _dir: tempfile::TempDir,
}

pub async fn spawn_app(backend_url: &str) -> TestApp {
    spawn_app_with(backend_url, |_| {}).await
}

pub async fn spawn_app_with(
    backend_url: &str,
    customize: impl FnOnce(&mut Settings),
) -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut settings = Settings::default();
    settings.ollama_base_url = backend_url.trim_end_matches('/').to_string();
    settings.admin_api_key = ADMIN_KEY.to_string();
    settings.database_path = dir.path().join("proxy.db");
    settings.database_pool_size = 4;
    customize(&mut settings);

    let store = Store::open(&settings.database_path, settings.database_pool_size)
        .await
        .expect("store");
    let state = AppState::new(settings, store).expect("state");
    TestApp {
        app: tollgate::router(state.clone()),
        state,
        _dir: dir,
    }
}

pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    bearer: Option<&str>,
    body: Option<Value>,
) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    };
    app.clone().oneshot(request).await.expect("response")
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

/// Creates a user through the admin surface and returns their credential.
pub async fn create_user(app: &Router, user_id: &str) -> String {
    let response = send(
        app,
        "POST",
        "/admin/users",
        Some(ADMIN_KEY),
        Some(serde_json::json!({ "user_id": user_id })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK, "create user {user_id}");
    let body = body_json(response).await;
    body["api_key"].as_str().expect("api_key").to_string()
}

pub async fn put_limits(app: &Router, user_id: &str, limits: Value) {
    let response = send(
        app,
        "PUT",
        &format!("/admin/users/{user_id}/limits"),
        Some(ADMIN_KEY),
        Some(limits),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK, "put limits {user_id}");
}

pub async fn set_pricing(app: &Router, model: &str, input: f64, output: f64) {
    let response = send(
        app,
        "POST",
        "/admin/pricing",
        Some(ADMIN_KEY),
        Some(serde_json::json!({
            "model": model,
            "input_cost_per_million": input,
            "output_cost_per_million": output,
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED, "set pricing {model}");
}

/// Buffered `/api/chat` reply with the given token counters.
pub fn ollama_chat_body(content: &str, prompt_tokens: u64, completion_tokens: u64) -> String {
    serde_json::json!({
        "model": "m",
        "created_at": "2024-01-01T00:00:00Z",
        "message": { "role": "assistant", "content": content },
        "done": true,
        "prompt_eval_count": prompt_tokens,
        "eval_count": completion_tokens,
    })
    .to_string()
}

/// NDJSON streaming `/api/chat` reply: one line per content chunk plus the
/// terminal counters line.
pub fn ollama_stream_body(
    contents: &[&str],
    prompt_tokens: u64,
    completion_tokens: u64,
) -> String {
    let mut body = String::new();
    for content in contents {
        body.push_str(
            &serde_json::json!({
                "model": "m",
                "created_at": "2024-01-01T00:00:00Z",
                "message": { "role": "assistant", "content": content },
                "done": false,
            })
            .to_string(),
        );
        body.push('\n');
    }
    body.push_str(
        &serde_json::json!({
            "model": "m",
            "created_at": "2024-01-01T00:00:00Z",
            "message": { "role": "assistant", "content": "" },
            "done": true,
            "prompt_eval_count": prompt_tokens,
            "eval_count": completion_tokens,
        })
        .to_string(),
    );
    body.push('\n');
    body
}

/// Splits a raw SSE body into its `data: ...` frames, keeping order.
pub fn sse_frames(raw: &str) -> Vec<String> {
    raw.split("\n\n")
        .filter(|frame| !frame.is_empty())
        .map(str::to_string)
        .collect()
}
