use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Error surface of the proxy. Every variant maps to one HTTP status and an
/// OpenAI-style error envelope at the edge.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    Unauthenticated(String),
    #[error("invalid admin API key")]
    Forbidden,
    #[error("{message}")]
    RateLimited {
        message: String,
        retry_after: Option<u64>,
    },
    #[error("{message}")]
    InvalidRequest {
        message: String,
        param: Option<String>,
    },
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0}")]
    UnsupportedMediaType(String),
    #[error("{0}")]
    BackendUnavailable(String),
    #[error("store busy, retry later")]
    StoreBusy,
    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            param: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::StoreBusy => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "authentication_error",
            Self::Forbidden => "permission_error",
            Self::RateLimited { .. } => "rate_limit_exceeded",
            Self::InvalidRequest { .. }
            | Self::NotFound(_)
            | Self::Conflict(_)
            | Self::PayloadTooLarge(_)
            | Self::UnsupportedMediaType(_) => "invalid_request_error",
            Self::BackendUnavailable(_) | Self::StoreBusy | Self::Internal(_) => "server_error",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let param = match &self {
            Self::InvalidRequest { param, .. } => param.clone(),
            _ => None,
        };
        let retry_after = match &self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        };

        let envelope = ErrorEnvelope {
            error: ErrorDetail {
                message: self.to_string(),
                kind: self.kind().to_string(),
                param,
            },
        };

        let mut response = (status, Json(envelope)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert("www-authenticate", HeaderValue::from_static("Bearer"));
        }
        if let Some(seconds) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}
