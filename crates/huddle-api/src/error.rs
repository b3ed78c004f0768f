use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use tracing::error;

use huddle_db::join::JoinRejection;
use huddle_types::api::LimitCheck;
use huddle_types::models::UsageResource;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("room has expired")]
    RoomExpired,
    #[error("{0}")]
    BadRequest(String),
    #[error("join rejected: {}", .0.code())]
    Join(JoinRejection),
    #[error("{resource} quota exceeded")]
    Quota {
        resource: UsageResource,
        check: LimitCheck,
    },
    #[error("thread is full ({cap} messages)")]
    ThreadFull { cap: u64 },
    #[error("an AI response is already streaming in this thread")]
    AiBusy,
    #[error("no AI provider is configured")]
    AiUnavailable,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::Internal(anyhow::anyhow!("blocking task failed: {}", e))
    }
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError::BadRequest(msg.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RoomExpired => StatusCode::GONE,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Join(rejection) => match rejection {
                JoinRejection::RoomNotFound => StatusCode::NOT_FOUND,
                JoinRejection::RoomExpired => StatusCode::GONE,
                JoinRejection::InvalidPassword => StatusCode::BAD_REQUEST,
                JoinRejection::RemovedFromRoom => StatusCode::FORBIDDEN,
                JoinRejection::RoomFull | JoinRejection::AnonymousRoomLimit { .. } => {
                    StatusCode::CONFLICT
                }
            },
            ApiError::Quota { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ThreadFull { .. } | ApiError::AiBusy => StatusCode::CONFLICT,
            ApiError::AiUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> Value {
        match self {
            ApiError::Unauthorized => json!({ "error": "unauthorized" }),
            ApiError::Forbidden(code) => json!({ "error": code }),
            ApiError::NotFound(what) => json!({ "error": "not_found", "message": format!("{} not found", what) }),
            ApiError::RoomExpired => json!({ "error": "room_expired" }),
            ApiError::BadRequest(msg) => json!({ "error": "bad_request", "message": msg }),
            ApiError::Join(JoinRejection::AnonymousRoomLimit { current_room_count }) => json!({
                "error": "anonymous_room_limit",
                "current_room_count": current_room_count,
            }),
            ApiError::Join(rejection) => json!({ "error": rejection.code() }),
            ApiError::Quota { resource, check } => json!({
                "error": "quota_exceeded",
                "resource": resource,
                "current_usage": check.current_usage,
                "limit": check.limit,
                "reset_time": check.reset_time,
            }),
            ApiError::ThreadFull { cap } => json!({ "error": "thread_full", "cap": cap }),
            ApiError::AiBusy => json!({ "error": "ai_busy" }),
            ApiError::AiUnavailable => json!({ "error": "ai_unavailable" }),
            ApiError::Internal(_) => json!({ "error": "internal_error" }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(e) = &self {
            error!("Internal error: {:#}", e);
        }
        (self.status(), Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn join_rejections_map_to_statuses() {
        let cases = [
            (JoinRejection::RoomNotFound, StatusCode::NOT_FOUND),
            (JoinRejection::RoomExpired, StatusCode::GONE),
            (JoinRejection::RoomFull, StatusCode::CONFLICT),
            (JoinRejection::InvalidPassword, StatusCode::BAD_REQUEST),
            (JoinRejection::RemovedFromRoom, StatusCode::FORBIDDEN),
            (
                JoinRejection::AnonymousRoomLimit { current_room_count: 1 },
                StatusCode::CONFLICT,
            ),
        ];
        for (rejection, status) in cases {
            assert_eq!(ApiError::Join(rejection).status(), status);
        }
    }

    #[test]
    fn removed_body_uses_uppercase_code() {
        let body = ApiError::Join(JoinRejection::RemovedFromRoom).body();
        assert_eq!(body["error"], "REMOVED_FROM_ROOM");
    }

    #[test]
    fn quota_body_carries_countdown() {
        let err = ApiError::Quota {
            resource: UsageResource::Messages,
            check: LimitCheck {
                allowed: false,
                current_usage: 100,
                limit: 100,
                remaining: 0,
                reset_time: Some(Utc::now()),
            },
        };
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = err.body();
        assert_eq!(body["resource"], "messages");
        assert_eq!(body["current_usage"], 100);
        assert!(body["reset_time"].is_string());
    }

    #[test]
    fn internal_errors_hide_details() {
        let body = ApiError::Internal(anyhow::anyhow!("db path /secret")).body();
        assert_eq!(body, json!({ "error": "internal_error" }));
    }
}
