//! Client for the local Ollama backend: request/response translation, a
//! process-wide concurrency cap, and the streaming chunk reader.

use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ProxyError;
use crate::store::now_epoch_seconds;
use crate::types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, Choice, ContentPart,
    DeltaMessage, MessageContent, ModelEntry, ModelList, ResponseMessage, StopSequences,
    StreamChoice, Usage,
};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("model '{model}' not found")]
    ModelNotFound { model: String },
    #[error("invalid request to the inference backend")]
    InvalidRequest,
    #[error("failed to fetch image from {url}")]
    ImageFetch { url: String },
    #[error("unsupported image URL scheme: {url}")]
    UnsupportedImageUrl { url: String },
    #[error("inference backend returned status {status}")]
    Upstream { status: u16 },
    #[error("unable to connect to the inference backend")]
    Unavailable,
    #[error("inference backend stream interrupted")]
    Interrupted,
    #[error("invalid backend response: {0}")]
    Decode(String),
}

impl From<BackendError> for ProxyError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::ModelNotFound { model } => {
                ProxyError::NotFound(format!("model '{model}' not found"))
            }
            BackendError::InvalidRequest => {
                ProxyError::invalid_request("invalid request to the inference backend")
            }
            // The URL came from the client, so a failed fetch is their error.
            BackendError::ImageFetch { url } => ProxyError::InvalidRequest {
                message: format!("failed to fetch image from {url}"),
                param: Some("messages".to_string()),
            },
            BackendError::UnsupportedImageUrl { url } => ProxyError::InvalidRequest {
                message: format!("unsupported image URL scheme: {url}"),
                param: Some("messages".to_string()),
            },
            BackendError::Upstream { status } => {
                ProxyError::BackendUnavailable(format!("inference backend returned status {status}"))
            }
            BackendError::Unavailable | BackendError::Interrupted => {
                ProxyError::BackendUnavailable("unable to reach the inference backend".to_string())
            }
            BackendError::Decode(message) => {
                ProxyError::BackendUnavailable(format!("invalid backend response: {message}"))
            }
        }
    }
}

// ----- Ollama wire shapes -----

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OllamaMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

impl OllamaOptions {
    fn from_request(request: &ChatCompletionRequest) -> Option<Self> {
        let options = Self {
            temperature: request.temperature,
            num_predict: request.max_tokens,
            top_p: request.top_p,
            stop: request.stop.as_ref().map(|stop| match stop {
                StopSequences::One(single) => vec![single.clone()],
                StopSequences::Many(many) => many.clone(),
            }),
        };
        let empty = options.temperature.is_none()
            && options.num_predict.is_none()
            && options.top_p.is_none()
            && options.stop.is_none();
        (!empty).then_some(options)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct OllamaChatPayload {
    pub model: String,
    pub messages: Vec<OllamaMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<OllamaOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<&'static str>,
}

/// One NDJSON object from `/api/chat`. The buffered response and every
/// stream chunk share this shape; the terminal chunk carries the counters.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct OllamaChatChunk {
    #[serde(default)]
    pub message: Option<OllamaMessage>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
    #[serde(default)]
    pub eval_count: Option<u64>,
}

impl OllamaChatChunk {
    pub fn usage(&self) -> Usage {
        Usage::from_counts(
            self.prompt_eval_count.unwrap_or(0),
            self.eval_count.unwrap_or(0),
        )
    }
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaTag {
    #[serde(default)]
    name: String,
}

pub type OllamaChunkStream = BoxStream<'static, Result<OllamaChatChunk, BackendError>>;

// ----- client -----

/// The backend is compute-bound on one accelerator, so in-flight calls are
/// capped by a semaphore; extra callers wait instead of failing fast.
#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
    permits: Arc<Semaphore>,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, max_concurrent: usize) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| BackendError::Decode(format!("http client error: {err}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        })
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, BackendError> {
        let payload = self.translate_request(request, false).await?;
        let _permit = self.acquire_permit().await?;

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|_| BackendError::Unavailable)?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status(status.as_u16(), &request.model));
        }

        let chunk: OllamaChatChunk = response
            .json()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))?;
        Ok(response_to_openai(&chunk, &request.model))
    }

    /// Opens the streaming call and returns the parsed chunk stream. The
    /// backend permit rides inside the stream state, so it is released when
    /// the stream ends or is dropped, whichever comes first.
    pub async fn chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<OllamaChunkStream, BackendError> {
        let payload = self.translate_request(request, true).await?;
        let permit = self.acquire_owned_permit().await?;

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|_| BackendError::Unavailable)?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status(status.as_u16(), &request.model));
        }

        let state = ChunkStreamState {
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|_| BackendError::Interrupted))
                .boxed(),
            buffer: BytesMut::new(),
            finished: false,
            _permit: permit,
        };

        Ok(stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }
            loop {
                while let Some(line) = take_line(&mut state.buffer) {
                    if let Some(chunk) = parse_chunk_line(&line) {
                        if chunk.done {
                            state.finished = true;
                        }
                        return Some((Ok(chunk), state));
                    }
                }
                match state.body.next().await {
                    Some(Ok(bytes)) => state.buffer.extend_from_slice(&bytes),
                    Some(Err(err)) => {
                        state.finished = true;
                        return Some((Err(err), state));
                    }
                    None => {
                        let trailing = state.buffer.split().freeze();
                        state.finished = true;
                        if let Some(chunk) = parse_chunk_line(&trailing) {
                            return Some((Ok(chunk), state));
                        }
                        return None;
                    }
                }
            }
        })
        .boxed())
    }

    pub async fn list_models(&self) -> Result<ModelList, BackendError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(|_| BackendError::Unavailable)?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Upstream {
                status: status.as_u16(),
            });
        }

        let tags: OllamaTagsResponse = response
            .json()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))?;
        Ok(ModelList {
            object: "list".to_string(),
            data: tags
                .models
                .into_iter()
                .map(|tag| ModelEntry {
                    id: tag.name,
                    object: "model".to_string(),
                    created: 0,
                    owned_by: "ollama".to_string(),
                })
                .collect(),
        })
    }

    async fn acquire_permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>, BackendError> {
        self.permits
            .acquire()
            .await
            .map_err(|_| BackendError::Unavailable)
    }

    async fn acquire_owned_permit(&self) -> Result<OwnedSemaphorePermit, BackendError> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BackendError::Unavailable)
    }

    /// Copies the message array through, splitting multimodal parts into a
    /// text body plus a parallel base64 images array.
    pub(crate) async fn translate_request(
        &self,
        request: &ChatCompletionRequest,
        stream: bool,
    ) -> Result<OllamaChatPayload, BackendError> {
        let mut messages = Vec::with_capacity(request.messages.len());
        for message in &request.messages {
            match &message.content {
                MessageContent::Text(text) => messages.push(OllamaMessage {
                    role: message.role.clone(),
                    content: text.clone(),
                    images: None,
                }),
                MessageContent::Parts(parts) => {
                    let mut texts = Vec::new();
                    let mut images = Vec::new();
                    for part in parts {
                        match part {
                            ContentPart::Text { text } => {
                                if !text.is_empty() {
                                    texts.push(text.as_str());
                                }
                            }
                            ContentPart::ImageUrl { image_url } => {
                                if let Some(data) = self.image_payload(&image_url.url).await? {
                                    images.push(data);
                                }
                            }
                        }
                    }
                    messages.push(OllamaMessage {
                        role: message.role.clone(),
                        content: texts.join(" "),
                        images: (!images.is_empty()).then_some(images),
                    });
                }
            }
        }

        let format = request
            .response_format
            .as_ref()
            .filter(|format| format.kind == "json_object")
            .map(|_| "json");

        Ok(OllamaChatPayload {
            model: request.model.clone(),
            messages,
            stream,
            options: OllamaOptions::from_request(request),
            format,
        })
    }

    async fn image_payload(&self, url: &str) -> Result<Option<String>, BackendError> {
        if let Some(rest) = url.strip_prefix("data:") {
            // data:image/jpeg;base64,<payload> — malformed data URLs are
            // dropped, matching the tolerance for unusable parts.
            return Ok(rest.split_once(',').map(|(_, payload)| payload.to_string()));
        }

        if url.starts_with("http://") || url.starts_with("https://") {
            let fetch_error = || BackendError::ImageFetch {
                url: url.to_string(),
            };
            let response = self
                .client
                .get(url)
                .timeout(Duration::from_secs(30))
                .send()
                .await
                .map_err(|_| fetch_error())?
                .error_for_status()
                .map_err(|_| fetch_error())?;
            let bytes = response.bytes().await.map_err(|_| fetch_error())?;
            return Ok(Some(BASE64_STANDARD.encode(&bytes)));
        }

        Err(BackendError::UnsupportedImageUrl {
            url: url.to_string(),
        })
    }
}

struct ChunkStreamState {
    body: BoxStream<'static, Result<Bytes, BackendError>>,
    buffer: BytesMut,
    finished: bool,
    _permit: OwnedSemaphorePermit,
}

fn take_line(buffer: &mut BytesMut) -> Option<Bytes> {
    let pos = buffer.iter().position(|b| *b == b'\n')?;
    let mut line = buffer.split_to(pos + 1);
    line.truncate(pos);
    Some(line.freeze())
}

fn parse_chunk_line(line: &[u8]) -> Option<OllamaChatChunk> {
    let trimmed = line.strip_suffix(b"\r").unwrap_or(line);
    if trimmed.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }
    // Unparseable lines are skipped rather than failing the stream.
    serde_json::from_slice(trimmed).ok()
}

fn map_status(status: u16, model: &str) -> BackendError {
    match status {
        404 => BackendError::ModelNotFound {
            model: model.to_string(),
        },
        400 => BackendError::InvalidRequest,
        status => BackendError::Upstream { status },
    }
}

pub fn response_to_openai(chunk: &OllamaChatChunk, model: &str) -> ChatCompletionResponse {
    let message = chunk.message.clone().unwrap_or_default();
    ChatCompletionResponse {
        id: format!("chatcmpl-{}", chunk.created_at),
        object: "chat.completion".to_string(),
        created: now_epoch_seconds(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: if message.role.is_empty() {
                    "assistant".to_string()
                } else {
                    message.role
                },
                content: message.content,
            },
            finish_reason: chunk.done.then(|| "stop".to_string()),
        }],
        usage: Some(chunk.usage()),
    }
}

pub fn chunk_to_openai(
    chunk: &OllamaChatChunk,
    model: &str,
    include_usage: bool,
) -> ChatCompletionChunk {
    let message = chunk.message.clone().unwrap_or_default();
    let is_done = chunk.done;
    ChatCompletionChunk {
        id: format!("chatcmpl-{}", chunk.created_at),
        object: "chat.completion.chunk".to_string(),
        created: now_epoch_seconds(),
        model: model.to_string(),
        choices: vec![StreamChoice {
            index: 0,
            delta: DeltaMessage {
                role: (!is_done && !message.role.is_empty()).then_some(message.role),
                content: (!is_done).then_some(message.content),
            },
            finish_reason: is_done.then(|| "stop".to_string()),
        }],
        usage: (is_done && include_usage).then(|| chunk.usage()),
    }
}
