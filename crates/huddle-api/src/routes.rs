use axum::{
    Json, Router,
    routing::{delete, get, post},
};
use serde_json::{Value, json};

use crate::state::AppState;
use crate::{ai, messages, rooms, threads, usage};

/// REST routes. The gateway route and HTTP layers are added by the server.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rooms", post(rooms::create_room))
        .route("/rooms/{code}", get(rooms::get_room).delete(rooms::delete_room))
        .route("/rooms/{code}/join", post(rooms::join_room))
        .route("/rooms/{code}/leave", post(rooms::leave_room))
        .route("/rooms/{code}/tier", post(rooms::upgrade_tier))
        .route("/rooms/{code}/password", post(rooms::set_password))
        .route(
            "/rooms/{code}/participants/{session_id}",
            delete(rooms::remove_participant),
        )
        .route(
            "/rooms/{code}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route(
            "/rooms/{code}/threads",
            get(threads::list_threads).post(threads::create_thread),
        )
        .route("/rooms/{code}/ai", post(ai::ask_ai))
        .route("/rooms/{code}/threads/{thread_id}/ai", post(ai::ask_ai_in_thread))
        .route("/rooms/{code}/usage", get(usage::get_usage))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
