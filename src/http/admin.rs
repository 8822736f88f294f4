//! Administrative surface: user CRUD, per-user limits, the price book and
//! its append-only history. Every route is guarded by the admin credential.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::require_admin;
use crate::error::ProxyError;
use crate::http::{usage_report, AppState, UsageReport};
use crate::store::{
    generate_api_key, ModelPricingRecord, PricingHistoryRecord, RateLimitPatch, RateLimitRecord,
    UserRecord,
};

const MAX_USER_ID_CHARS: usize = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/users",
            post(create_user).get(list_users).delete(delete_all_users),
        )
        .route("/users/:user_id", get(get_user).delete(delete_user))
        .route("/users/:user_id/usage", get(user_usage))
        .route("/users/:user_id/limits", get(get_limits).put(put_limits))
        .route("/pricing", post(create_pricing).get(list_pricing))
        .route("/pricing/history/all", get(all_pricing_history))
        .route("/pricing/history/:model", get(model_pricing_history))
        .route(
            "/pricing/:model",
            get(get_model_pricing)
                .put(update_model_pricing)
                .delete(delete_model_pricing),
        )
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    user_id: String,
}

#[derive(Debug, Serialize)]
struct UserResponse {
    user_id: String,
    api_key: String,
    created_at: u64,
}

impl From<UserRecord> for UserResponse {
    fn from(record: UserRecord) -> Self {
        Self {
            user_id: record.id,
            api_key: record.api_key,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct UserListResponse {
    users: Vec<UserResponse>,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Debug, Serialize)]
struct RateLimitResponse {
    user_id: String,
    #[serde(flatten)]
    limits: RateLimitRecord,
}

#[derive(Debug, Serialize)]
struct UserUsageSummary {
    user_id: String,
    usage: UsageReport,
    rate_limits: Option<RateLimitResponse>,
}

#[derive(Debug, Deserialize)]
struct PricingCreate {
    model: String,
    input_cost_per_million: f64,
    output_cost_per_million: f64,
}

#[derive(Debug, Deserialize)]
struct PricingRates {
    input_cost_per_million: f64,
    output_cost_per_million: f64,
}

#[derive(Debug, Serialize)]
struct PricingListResponse {
    pricing: Vec<ModelPricingRecord>,
}

#[derive(Debug, Serialize)]
struct PricingHistoryResponse {
    history: Vec<PricingHistoryRecord>,
}

// ----- users -----

async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateUserRequest>,
) -> Result<Json<UserResponse>, ProxyError> {
    require_admin(&headers, &state.settings.admin_api_key)?;
    validate_user_id(&body.user_id)?;

    if state.store.user_by_id(&body.user_id).await?.is_some() {
        return Err(ProxyError::Conflict("user already exists".to_string()));
    }

    let api_key = generate_api_key(&body.user_id)?;
    let record = state
        .store
        .create_user(&body.user_id, &api_key, state.settings.default_limits.into())
        .await?;
    tracing::info!(user_id = %record.id, "created user");
    Ok(Json(record.into()))
}

async fn list_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserListResponse>, ProxyError> {
    require_admin(&headers, &state.settings.admin_api_key)?;
    let users = state
        .store
        .list_users()
        .await?
        .into_iter()
        .map(UserResponse::from)
        .collect();
    Ok(Json(UserListResponse { users }))
}

async fn get_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<UserResponse>, ProxyError> {
    require_admin(&headers, &state.settings.admin_api_key)?;
    let user = state
        .store
        .user_by_id(&user_id)
        .await?
        .ok_or_else(|| ProxyError::NotFound("user not found".to_string()))?;
    Ok(Json(user.into()))
}

async fn delete_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<MessageResponse>, ProxyError> {
    require_admin(&headers, &state.settings.admin_api_key)?;
    if !state.store.delete_user(&user_id).await? {
        return Err(ProxyError::NotFound("user not found".to_string()));
    }
    tracing::info!(user_id = %user_id, "deleted user");
    Ok(Json(MessageResponse {
        message: format!("user {user_id} deleted"),
    }))
}

async fn delete_all_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MessageResponse>, ProxyError> {
    require_admin(&headers, &state.settings.admin_api_key)?;
    let count = state.store.delete_all_users().await?;
    tracing::info!(count, "deleted all users");
    Ok(Json(MessageResponse {
        message: format!("deleted {count} users and all associated data"),
    }))
}

async fn user_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<UserUsageSummary>, ProxyError> {
    require_admin(&headers, &state.settings.admin_api_key)?;
    ensure_user_exists(&state, &user_id).await?;

    let usage = usage_report(&state, &user_id).await?;
    let rate_limits = state
        .store
        .rate_limits(&user_id)
        .await?
        .map(|limits| RateLimitResponse {
            user_id: user_id.clone(),
            limits,
        });
    Ok(Json(UserUsageSummary {
        user_id,
        usage,
        rate_limits,
    }))
}

// ----- limits -----

async fn get_limits(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<RateLimitResponse>, ProxyError> {
    require_admin(&headers, &state.settings.admin_api_key)?;
    ensure_user_exists(&state, &user_id).await?;

    let limits = state
        .store
        .rate_limits(&user_id)
        .await?
        .ok_or_else(|| ProxyError::NotFound("rate limits not found".to_string()))?;
    Ok(Json(RateLimitResponse { user_id, limits }))
}

async fn put_limits(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(patch): Json<RateLimitPatch>,
) -> Result<Json<RateLimitResponse>, ProxyError> {
    require_admin(&headers, &state.settings.admin_api_key)?;
    ensure_user_exists(&state, &user_id).await?;

    if patch.is_empty() {
        return Err(ProxyError::invalid_request("no fields to update"));
    }
    state.store.update_rate_limits(&user_id, patch).await?;

    let limits = state.store.rate_limits(&user_id).await?.unwrap_or_default();
    tracing::info!(user_id = %user_id, "updated rate limits");
    Ok(Json(RateLimitResponse { user_id, limits }))
}

// ----- pricing -----

async fn create_pricing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PricingCreate>,
) -> Result<(StatusCode, Json<ModelPricingRecord>), ProxyError> {
    require_admin(&headers, &state.settings.admin_api_key)?;
    validate_rates(body.input_cost_per_million, body.output_cost_per_million)?;
    if body.model.trim().is_empty() {
        return Err(ProxyError::InvalidRequest {
            message: "model must not be empty".to_string(),
            param: Some("model".to_string()),
        });
    }

    let record = state
        .price_book
        .set(
            &body.model,
            body.input_cost_per_million,
            body.output_cost_per_million,
            "admin",
        )
        .await?;
    tracing::info!(model = %record.model, "set model pricing");
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_pricing(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<PricingListResponse>, ProxyError> {
    require_admin(&headers, &state.settings.admin_api_key)?;
    Ok(Json(PricingListResponse {
        pricing: state.price_book.list().await?,
    }))
}

async fn get_model_pricing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(model): Path<String>,
) -> Result<Json<ModelPricingRecord>, ProxyError> {
    require_admin(&headers, &state.settings.admin_api_key)?;
    let record = state
        .price_book
        .get(&model)
        .await?
        .ok_or_else(|| ProxyError::NotFound(format!("pricing not found for model: {model}")))?;
    Ok(Json(record))
}

async fn update_model_pricing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(model): Path<String>,
    Json(body): Json<PricingRates>,
) -> Result<Json<ModelPricingRecord>, ProxyError> {
    require_admin(&headers, &state.settings.admin_api_key)?;
    validate_rates(body.input_cost_per_million, body.output_cost_per_million)?;

    if state.price_book.get(&model).await?.is_none() {
        return Err(ProxyError::NotFound(format!(
            "pricing not found for model: {model}"
        )));
    }

    let record = state
        .price_book
        .set(
            &model,
            body.input_cost_per_million,
            body.output_cost_per_million,
            "admin",
        )
        .await?;
    tracing::info!(model = %record.model, "updated model pricing");
    Ok(Json(record))
}

async fn delete_model_pricing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(model): Path<String>,
) -> Result<Json<MessageResponse>, ProxyError> {
    require_admin(&headers, &state.settings.admin_api_key)?;
    if !state.store.delete_pricing(&model).await? {
        return Err(ProxyError::NotFound(format!(
            "pricing not found for model: {model}"
        )));
    }
    Ok(Json(MessageResponse {
        message: format!("pricing for model {model} deleted"),
    }))
}

async fn all_pricing_history(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<PricingHistoryResponse>, ProxyError> {
    require_admin(&headers, &state.settings.admin_api_key)?;
    Ok(Json(PricingHistoryResponse {
        history: state.store.pricing_history(None).await?,
    }))
}

async fn model_pricing_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(model): Path<String>,
) -> Result<Json<PricingHistoryResponse>, ProxyError> {
    require_admin(&headers, &state.settings.admin_api_key)?;
    Ok(Json(PricingHistoryResponse {
        history: state.store.pricing_history(Some(&model)).await?,
    }))
}

// ----- helpers -----

async fn ensure_user_exists(state: &AppState, user_id: &str) -> Result<(), ProxyError> {
    if state.store.user_by_id(user_id).await?.is_none() {
        return Err(ProxyError::NotFound("user not found".to_string()));
    }
    Ok(())
}

fn validate_user_id(user_id: &str) -> Result<(), ProxyError> {
    let valid = !user_id.is_empty()
        && user_id.chars().count() <= MAX_USER_ID_CHARS
        && user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'));
    if !valid {
        return Err(ProxyError::InvalidRequest {
            message: "user_id must be a non-empty URL-safe string".to_string(),
            param: Some("user_id".to_string()),
        });
    }
    Ok(())
}

fn validate_rates(input: f64, output: f64) -> Result<(), ProxyError> {
    if !input.is_finite() || !output.is_finite() || input < 0.0 || output < 0.0 {
        return Err(ProxyError::invalid_request(
            "costs must be non-negative numbers",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_validation() {
        assert!(validate_user_id("alice").is_ok());
        assert!(validate_user_id("team-1_2.3~x").is_ok());
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id("has space").is_err());
        assert!(validate_user_id("slash/id").is_err());
        assert!(validate_user_id(&"x".repeat(101)).is_err());
    }

    #[test]
    fn rate_validation_rejects_negatives_and_nan() {
        assert!(validate_rates(0.0, 0.0).is_ok());
        assert!(validate_rates(1.5, 2.5).is_ok());
        assert!(validate_rates(-1.0, 0.0).is_err());
        assert!(validate_rates(0.0, f64::NAN).is_err());
        assert!(validate_rates(f64::INFINITY, 0.0).is_err());
    }
}
