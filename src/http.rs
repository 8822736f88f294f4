//! HTTP surface: the middleware chain (correlation id, authentication) and
//! the user-facing routes.

pub mod admin;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::{Body, Bytes};
use axum::extract::rejection::{BytesRejection, JsonRejection};
use axum::extract::{DefaultBodyLimit, Extension, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::{self, AuthedUser};
use crate::backend::OllamaClient;
use crate::config::Settings;
use crate::counters::{Clock, SystemClock, WindowCounters};
use crate::error::ProxyError;
use crate::limiter::RateLimiter;
use crate::multipart;
use crate::pricing::PriceBook;
use crate::store::{ModelPricingRecord, Store, UsageRecord, UsageTotals};
use crate::tracker::{self, StreamContext, UsageTracker};
use crate::types::{ChatCompletionRequest, ModelList};

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Store,
    pub price_book: PriceBook,
    pub counters: Arc<WindowCounters>,
    pub limiter: RateLimiter,
    pub backend: Arc<OllamaClient>,
    pub tracker: UsageTracker,
}

impl AppState {
    pub fn new(settings: Settings, store: Store) -> Result<Self, ProxyError> {
        let settings = Arc::new(settings);
        let counters = Arc::new(WindowCounters::default());
        let price_book = PriceBook::new(store.clone());
        let limiter = RateLimiter::new(store.clone(), counters.clone(), settings.default_limits);
        let backend = Arc::new(OllamaClient::new(
            &settings.ollama_base_url,
            settings.ollama_max_concurrent,
        )?);
        let tracker = UsageTracker::new(store.clone(), price_book.clone(), limiter.clone());
        Ok(Self {
            settings,
            store,
            price_book,
            counters,
            limiter,
            backend,
            tracker,
        })
    }
}

pub fn router(state: AppState) -> Router {
    // Slack above the enforced limit keeps the common over-limit case in the
    // handler; bodies past the hard ceiling surface as a BytesRejection,
    // which the handler maps onto the same envelope.
    let upload_body_limit = state.settings.max_upload_bytes().saturating_add(1024 * 1024);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .route(
            "/v1/chat/completions/upload",
            post(chat_completions_upload).layer(DefaultBodyLimit::max(upload_body_limit)),
        )
        .route("/v1/models", get(list_models))
        .route("/v1/usage", get(usage))
        .route("/v1/usage/history", get(usage_history))
        .route("/v1/pricing", get(pricing))
        .nest("/admin", admin::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::authenticate,
        ))
        .layer(middleware::from_fn(assign_request_id))
        .with_state(state)
}

/// Correlation id for the request: an inbound well-formed `X-Request-Id` is
/// accepted, anything else gets a fresh one. Always echoed on the response.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

pub async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .filter(|id| is_well_formed_request_id(id))
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

fn is_well_formed_request_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 128 && id.bytes().all(|b| b.is_ascii_graphic())
}

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("req-{ts_ms}-{seq}")
}

async fn root(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tollgate",
        "backend_url": state.settings.ollama_base_url,
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn chat_completions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ProxyError> {
    let Json(request) =
        payload.map_err(|rejection| ProxyError::invalid_request(rejection.body_text()))?;
    run_completion(state, user, request_id, request).await
}

async fn chat_completions_upload(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ProxyError> {
    let body = match body {
        Ok(body) => body,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            return Err(ProxyError::PayloadTooLarge(format!(
                "upload exceeds the {} MB limit",
                state.settings.max_upload_size_mb
            )));
        }
        Err(rejection) => return Err(ProxyError::invalid_request(rejection.body_text())),
    };
    if body.len() > state.settings.max_upload_bytes() {
        return Err(ProxyError::PayloadTooLarge(format!(
            "upload exceeds the {} MB limit",
            state.settings.max_upload_size_mb
        )));
    }

    let content_type = headers
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !content_type
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
    {
        return Err(ProxyError::invalid_request(
            "expected a multipart/form-data body",
        ));
    }

    let request =
        multipart::ingest_upload(content_type, &body, &state.settings.allowed_image_types)?;
    run_completion(state, user, request_id, request).await
}

/// The chat-completion pipeline shared by the JSON and upload routes:
/// admission, forwarding, then usage capture on the way back.
async fn run_completion(
    state: AppState,
    user: AuthedUser,
    request_id: String,
    request: ChatCompletionRequest,
) -> Result<Response, ProxyError> {
    let now = SystemClock.now_epoch_seconds();
    state.limiter.check_admission(&user.id, now).await?;

    let preview = tracker::prompt_preview(&request.messages);
    tracing::info!(
        request_id = %request_id,
        user_id = %user.id,
        model = %request.model,
        stream = request.stream,
        "forwarding chat completion"
    );

    if request.stream {
        let include_usage = request.include_usage();
        let upstream = state.backend.chat_completion_stream(&request).await?;
        let ctx = StreamContext {
            user_id: user.id,
            model: request.model,
            request_id,
            prompt_preview: preview,
            include_usage,
        };
        let body = Body::from_stream(state.tracker.sse_stream(upstream, ctx));
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .header("cache-control", "no-cache")
            .header("connection", "keep-alive")
            .header("x-accel-buffering", "no")
            .body(body)
            .map_err(|err| ProxyError::Internal(err.to_string()))
    } else {
        let response = state.backend.chat_completion(&request).await?;
        if let Some(usage) = response.usage {
            state
                .tracker
                .record_completion(&user.id, &request.model, usage, &request_id, preview)
                .await?;
        }
        Ok(Json(response).into_response())
    }
}

async fn list_models(State(state): State<AppState>) -> Result<Json<ModelList>, ProxyError> {
    let models = state.backend.list_models().await?;
    Ok(Json(models))
}

#[derive(Debug, Serialize)]
pub struct UsageReport {
    pub user_id: String,
    #[serde(flatten)]
    pub totals: UsageTotals,
    pub by_model: BTreeMap<String, UsageTotals>,
}

async fn usage(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<UsageReport>, ProxyError> {
    Ok(Json(usage_report(&state, &user.id).await?))
}

pub(crate) async fn usage_report(state: &AppState, user_id: &str) -> Result<UsageReport, ProxyError> {
    let totals = state.store.usage_totals(user_id).await?;
    let by_model = state
        .store
        .usage_by_model(user_id)
        .await?
        .into_iter()
        .collect::<BTreeMap<_, _>>();
    Ok(UsageReport {
        user_id: user_id.to_string(),
        totals,
        by_model,
    })
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    user_id: String,
    limit: u32,
    offset: u32,
    history: Vec<UsageRecord>,
}

async fn usage_history(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, ProxyError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let offset = params.offset.unwrap_or(0);
    let history = state.store.usage_history(&user.id, limit, offset).await?;
    Ok(Json(HistoryResponse {
        user_id: user.id,
        limit,
        offset,
        history,
    }))
}

#[derive(Debug, Serialize)]
struct PricingList {
    pricing: Vec<ModelPricingRecord>,
}

async fn pricing(State(state): State<AppState>) -> Result<Json<PricingList>, ProxyError> {
    Ok(Json(PricingList {
        pricing: state.price_book.list().await?,
    }))
}
