//! AI relay: streams a model's answer into a room and persists the final text.
//!
//! The model itself lives behind `AiProvider`. The relay owns ordering of the
//! `ai-*` events, cancellation through the gateway's stream registry, and
//! usage recording.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use huddle_db::queries::NewMessage;
use huddle_gateway::streams::StreamGuard;
use huddle_types::api::AiRequest;
use huddle_types::events::RoomEvent;
use huddle_types::models::{ChatMessage, Tier, UsageResource};
use huddle_types::tiers::limits_for;

use crate::error::ApiError;
use crate::identity::Caller;
use crate::state::AppState;

const MAX_PROMPT_LEN: usize = 4000;
const HISTORY_MESSAGES: u32 = 50;

/// Sender id stored on AI-authored messages.
pub const AI_SENDER: &str = "ai";

/// One piece of a streamed answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AiChunk {
    Reasoning(String),
    Content(String),
    /// The provider switched to another model mid-request.
    FallbackUsed(String),
}

#[derive(Debug, Clone)]
pub struct AiPrompt {
    pub prompt: String,
    /// Oldest first, already scoped to the thread.
    pub history: Vec<ChatMessage>,
    pub context_window_tokens: u64,
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    fn model(&self) -> &str;

    async fn stream(&self, prompt: AiPrompt) -> anyhow::Result<BoxStream<'static, anyhow::Result<AiChunk>>>;
}

/// Where a relayed answer goes.
#[derive(Debug, Clone)]
pub struct RelayTarget {
    pub room_id: String,
    pub share_code: String,
    pub thread_id: Option<Uuid>,
}

pub async fn ask_ai(
    State(state): State<AppState>,
    Path(share_code): Path<String>,
    caller: Caller,
    Json(req): Json<AiRequest>,
) -> Result<impl IntoResponse, ApiError> {
    start_ai(state, share_code, None, caller, req).await
}

pub async fn ask_ai_in_thread(
    State(state): State<AppState>,
    Path((share_code, thread_id)): Path<(String, Uuid)>,
    caller: Caller,
    Json(req): Json<AiRequest>,
) -> Result<impl IntoResponse, ApiError> {
    start_ai(state, share_code, Some(thread_id), caller, req).await
}

async fn start_ai(
    state: AppState,
    share_code: String,
    thread_id: Option<Uuid>,
    caller: Caller,
    req: AiRequest,
) -> Result<impl IntoResponse, ApiError> {
    let prompt = req.prompt.trim().to_string();
    if prompt.is_empty() || prompt.chars().count() > MAX_PROMPT_LEN {
        return Err(ApiError::bad_request("prompt must be 1-4000 characters"));
    }

    let session_id = caller.session_id();
    let room = state.open_room(&share_code, &session_id).await?;
    state.require_member(&room, &session_id).await?;
    let tier = room.tier()?;

    if let Some(thread_id) = thread_id {
        state.ensure_thread_has_room(&room, thread_id, tier).await?;
    }

    // Any answer may carry reasoning, so both quotas must have room
    for resource in [UsageResource::AiResponses, UsageResource::ReasoningMessages] {
        let check = state.limits.check_resource(&room.id, tier, resource).await;
        if !check.allowed {
            return Err(ApiError::Quota { resource, check });
        }
    }

    let provider = state.ai.clone().ok_or(ApiError::AiUnavailable)?;
    let guard = state
        .dispatcher
        .streams()
        .begin(&room.share_code, thread_id)
        .map_err(|_| ApiError::AiBusy)?;
    let stream_id = guard.stream_id;

    let room_id = room.id.clone();
    let history = state
        .db(move |db| {
            let thread = thread_id.map(|id| id.to_string());
            db.get_thread_history(&room_id, thread.as_deref(), HISTORY_MESSAGES)?
                .into_iter()
                .map(|row| row.into_message())
                .collect::<anyhow::Result<Vec<_>>>()
        })
        .await?;

    let target = RelayTarget {
        room_id: room.id.clone(),
        share_code: room.share_code.clone(),
        thread_id,
    };
    let ai_prompt = AiPrompt {
        prompt,
        history,
        context_window_tokens: limits_for(tier).context_window_tokens,
    };

    info!("{} started AI stream {} in {}", session_id, stream_id, room.share_code);
    tokio::spawn(relay_stream(state.clone(), provider, guard, target, ai_prompt, tier));

    Ok((StatusCode::ACCEPTED, Json(json!({ "stream_id": stream_id }))))
}

/// Drive one provider stream to completion, cancellation, or failure.
pub async fn relay_stream(
    state: AppState,
    provider: Arc<dyn AiProvider>,
    guard: StreamGuard,
    target: RelayTarget,
    prompt: AiPrompt,
    tier: Tier,
) {
    let stream_id = guard.stream_id;
    let share_code = target.share_code.clone();
    let thread_id = target.thread_id;
    let dispatcher = state.dispatcher.clone();
    let emit = |event: RoomEvent| dispatcher.broadcast_to_room(event);

    let mut model = provider.model().to_string();
    emit(RoomEvent::AiStreamStart {
        share_code: share_code.clone(),
        thread_id,
        stream_id,
        model: model.clone(),
    });

    let fail = |message: String| {
        warn!("AI stream {} failed: {}", stream_id, message);
        emit(RoomEvent::AiError {
            share_code: share_code.clone(),
            thread_id,
            stream_id,
            message,
        });
    };

    let mut chunks = match provider.stream(prompt).await {
        Ok(chunks) => chunks,
        Err(e) => return fail(e.to_string()),
    };

    let mut content = String::new();
    let mut content_started = false;
    let mut reasoning_open = false;
    let mut reasoning_seen = false;

    loop {
        let next = tokio::select! {
            _ = guard.token.cancelled() => {
                info!("AI stream {} stopped; discarding {} bytes", stream_id, content.len());
                emit(RoomEvent::AiStreamStopped {
                    share_code: share_code.clone(),
                    thread_id,
                    stream_id,
                });
                return;
            }
            next = chunks.next() => next,
        };

        let chunk = match next {
            None => break,
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => return fail(e.to_string()),
        };

        match chunk {
            AiChunk::Reasoning(text) => {
                if !reasoning_open {
                    reasoning_open = true;
                    reasoning_seen = true;
                    emit(RoomEvent::AiReasoningStart {
                        share_code: share_code.clone(),
                        thread_id,
                        stream_id,
                    });
                }
                emit(RoomEvent::AiReasoningChunk {
                    share_code: share_code.clone(),
                    thread_id,
                    stream_id,
                    content: text,
                });
            }
            AiChunk::Content(text) => {
                if reasoning_open {
                    reasoning_open = false;
                    emit(RoomEvent::AiReasoningEnd {
                        share_code: share_code.clone(),
                        thread_id,
                        stream_id,
                    });
                }
                if !content_started {
                    content_started = true;
                    emit(RoomEvent::AiContentStart {
                        share_code: share_code.clone(),
                        thread_id,
                        stream_id,
                    });
                }
                content.push_str(&text);
                emit(RoomEvent::AiStreamChunk {
                    share_code: share_code.clone(),
                    thread_id,
                    stream_id,
                    content: text,
                });
            }
            AiChunk::FallbackUsed(fallback) => {
                model = fallback;
                emit(RoomEvent::AiFallbackUsed {
                    share_code: share_code.clone(),
                    thread_id,
                    stream_id,
                    model: model.clone(),
                });
            }
        }
    }

    if reasoning_open {
        emit(RoomEvent::AiReasoningEnd {
            share_code: share_code.clone(),
            thread_id,
            stream_id,
        });
    }
    if content.trim().is_empty() {
        return fail("model returned an empty response".to_string());
    }

    let message_id = Uuid::new_v4();
    let created_at = Utc::now();
    let stored = {
        let room_id = target.room_id.clone();
        let content = content.clone();
        let model = model.clone();
        state
            .db(move |db| {
                db.insert_message(&NewMessage {
                    id: &message_id.to_string(),
                    room_id: &room_id,
                    thread_id: thread_id.map(|t| t.to_string()).as_deref(),
                    sender_session: AI_SENDER,
                    sender_name: &model,
                    content: &content,
                    is_ai: true,
                    created_at,
                })
            })
            .await
    };
    if let Err(e) = stored {
        return fail(format!("could not save response: {}", e));
    }

    let store = state.limits.store();
    if let Err(e) = store.record(&target.room_id, UsageResource::AiResponses).await {
        warn!("Failed to record AI usage for room {}: {}", target.room_id, e);
    }
    if reasoning_seen {
        if let Err(e) = store.record(&target.room_id, UsageResource::ReasoningMessages).await {
            warn!("Failed to record reasoning usage for room {}: {}", target.room_id, e);
        }
    }

    emit(RoomEvent::RoomMessageCreated {
        share_code: share_code.clone(),
        id: message_id,
        thread_id,
        sender_session: AI_SENDER.to_string(),
        sender_name: model,
        content,
        is_ai: true,
        created_at,
    });
    emit(RoomEvent::AiStreamEnd {
        share_code: share_code.clone(),
        thread_id,
        stream_id,
        message_id,
    });
    info!("AI stream {} finished on {} tier", stream_id, tier);
}
