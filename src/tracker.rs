//! Usage capture: one immutable row per completed request, plus the SSE
//! transformer that tees frames to the client while harvesting the terminal
//! usage counters.

use std::collections::VecDeque;

use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde::Serialize;

use crate::backend::{chunk_to_openai, OllamaChunkStream};
use crate::error::{ErrorDetail, ErrorEnvelope, ProxyError};
use crate::limiter::RateLimiter;
use crate::pricing::PriceBook;
use crate::store::{now_epoch_seconds, Store, UsageInsert};
use crate::types::{ChatMessage, ContentPart, MessageContent, Usage};

pub const SSE_DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

const PROMPT_PREVIEW_MAX_CHARS: usize = 120;

#[derive(Clone)]
pub struct UsageTracker {
    store: Store,
    price_book: PriceBook,
    limiter: RateLimiter,
}

/// Per-request context threaded into the stream transformer.
#[derive(Clone, Debug)]
pub struct StreamContext {
    pub user_id: String,
    pub model: String,
    pub request_id: String,
    pub prompt_preview: Option<String>,
    pub include_usage: bool,
}

impl UsageTracker {
    pub fn new(store: Store, price_book: PriceBook, limiter: RateLimiter) -> Self {
        Self {
            store,
            price_book,
            limiter,
        }
    }

    /// Buffered path: cost is frozen at the rates current right now, the row
    /// is written once, and the minute window gets the token sample.
    pub async fn record_completion(
        &self,
        user_id: &str,
        model: &str,
        usage: Usage,
        request_id: &str,
        prompt_preview: Option<String>,
    ) -> Result<(), ProxyError> {
        let now = now_epoch_seconds();
        let cost = self
            .price_book
            .cost_for(model, usage.prompt_tokens, usage.completion_tokens)
            .await?;
        self.store
            .insert_usage(UsageInsert {
                user_id: user_id.to_string(),
                model: model.to_string(),
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                cost,
                request_id: Some(request_id.to_string()),
                prompt_preview,
                timestamp: now,
            })
            .await?;
        self.limiter.note_tokens(user_id, usage.total_tokens, now);
        Ok(())
    }

    /// Streaming path: every backend chunk is translated and forwarded as one
    /// `data: <json>\n\n` frame. The terminal chunk yields the final frame
    /// (with a usage object unless the client opted out), then the
    /// terminator, then the usage row. Interruption yields an error frame
    /// plus the terminator and persists nothing; a dropped stream persists
    /// nothing unless the terminal counters were already seen.
    pub fn sse_stream(
        &self,
        upstream: OllamaChunkStream,
        ctx: StreamContext,
    ) -> BoxStream<'static, Result<Bytes, std::io::Error>> {
        let state = MeteredState {
            upstream: Some(upstream),
            queue: VecDeque::new(),
            pending: None,
            done: false,
            tracker: self.clone(),
            ctx,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(frame) = state.queue.pop_front() {
                    return Some((Ok(frame), state));
                }
                if state.done {
                    if let Some(usage) = state.pending.take() {
                        persist_stream_usage(state.tracker.clone(), state.ctx.clone(), usage)
                            .await;
                    }
                    return None;
                }
                let Some(upstream) = state.upstream.as_mut() else {
                    state.done = true;
                    continue;
                };
                match upstream.next().await {
                    Some(Ok(chunk)) => {
                        let translated =
                            chunk_to_openai(&chunk, &state.ctx.model, state.ctx.include_usage);
                        state.queue.push_back(sse_json_frame(&translated));
                        if chunk.done {
                            state.pending = Some(chunk.usage());
                            state.queue.push_back(Bytes::from_static(SSE_DONE_FRAME));
                            state.done = true;
                            state.upstream = None;
                        }
                    }
                    Some(Err(_)) | None => {
                        // Interrupted before the terminal chunk: the stream
                        // still ends cleanly, the partial usage does not.
                        state
                            .queue
                            .push_back(sse_error_frame("stream interrupted", "server_error"));
                        state.queue.push_back(Bytes::from_static(SSE_DONE_FRAME));
                        state.pending = None;
                        state.done = true;
                        state.upstream = None;
                    }
                }
            }
        })
        .boxed()
    }
}

struct MeteredState {
    upstream: Option<OllamaChunkStream>,
    queue: VecDeque<Bytes>,
    pending: Option<Usage>,
    done: bool,
    tracker: UsageTracker,
    ctx: StreamContext,
}

impl Drop for MeteredState {
    fn drop(&mut self) {
        // The client may vanish between the terminator frame and our next
        // poll; the backend did complete, so the row still gets written.
        let Some(usage) = self.pending.take() else {
            return;
        };
        let tracker = self.tracker.clone();
        let ctx = self.ctx.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(persist_stream_usage(tracker, ctx, usage));
        }
    }
}

async fn persist_stream_usage(tracker: UsageTracker, ctx: StreamContext, usage: Usage) {
    let now = now_epoch_seconds();
    let cost = match tracker
        .price_book
        .cost_for(&ctx.model, usage.prompt_tokens, usage.completion_tokens)
        .await
    {
        Ok(cost) => cost,
        Err(err) => {
            tracing::warn!(
                request_id = %ctx.request_id,
                user_id = %ctx.user_id,
                error = %err,
                "failed to price streamed completion"
            );
            0.0
        }
    };

    let row = UsageInsert {
        user_id: ctx.user_id.clone(),
        model: ctx.model.clone(),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        cost,
        request_id: Some(ctx.request_id.clone()),
        prompt_preview: ctx.prompt_preview.clone(),
        timestamp: now,
    };
    if let Err(err) = tracker.store.insert_usage(row).await {
        tracing::warn!(
            request_id = %ctx.request_id,
            user_id = %ctx.user_id,
            error = %err,
            "failed to record streamed usage"
        );
        return;
    }
    tracker
        .limiter
        .note_tokens(&ctx.user_id, usage.total_tokens, now);
}

pub fn sse_json_frame<T: Serialize>(value: &T) -> Bytes {
    let json = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {json}\n\n"))
}

fn sse_error_frame(message: &str, kind: &str) -> Bytes {
    sse_json_frame(&ErrorEnvelope {
        error: ErrorDetail {
            message: message.to_string(),
            kind: kind.to_string(),
            param: None,
        },
    })
}

/// Truncated text of the last user message, kept on the usage row for
/// operator diagnostics.
pub fn prompt_preview(messages: &[ChatMessage]) -> Option<String> {
    let message = messages
        .iter()
        .rev()
        .find(|message| message.role == "user")
        .or_else(|| messages.last())?;

    let text = match &message.content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join(" "),
    };

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.chars().count() <= PROMPT_PREVIEW_MAX_CHARS {
        Some(trimmed.to_string())
    } else {
        Some(trimmed.chars().take(PROMPT_PREVIEW_MAX_CHARS).collect())
    }
}
