//! Who is calling: a signed-in user (Bearer JWT) or an anonymous session
//! derived from the client address.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::debug;
use uuid::Uuid;

use huddle_types::api::Claims;
use huddle_types::models::SessionId;

use crate::error::ApiError;
use crate::state::AppState;

pub fn decode_user_token(token: &str, secret: &str) -> Result<Claims, ApiError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| {
        debug!("Rejected bearer token: {}", e);
        ApiError::Unauthorized
    })
}

/// Any caller. A present but invalid Bearer token is rejected rather than
/// silently downgraded to anonymous.
#[derive(Debug, Clone)]
pub struct Caller {
    pub session: SessionId,
    /// Anonymous session this client address maps to, signed in or not.
    pub address_session: Option<SessionId>,
}

impl Caller {
    pub fn session_id(&self) -> String {
        self.session.to_string()
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.session.user_id()
    }

    /// Whether `session_id` is this caller's own session, either the current
    /// one or the anonymous one its address maps to. Only those may be
    /// migrated into the caller's identity.
    pub fn owns_session(&self, session_id: &str) -> bool {
        session_id == self.session_id()
            || self
                .address_session
                .as_ref()
                .is_some_and(|s| s.to_string() == session_id)
    }
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let address_session = ConnectInfo::<SocketAddr>::from_request_parts(parts, state)
            .await
            .ok()
            .map(|ConnectInfo(addr)| SessionId::from_address(&addr.ip().to_string()));

        match TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state).await {
            Ok(TypedHeader(Authorization(bearer))) => {
                let claims = decode_user_token(bearer.token(), &state.jwt_secret)?;
                Ok(Caller {
                    session: SessionId::User(claims.sub),
                    address_session,
                })
            }
            Err(rejection) if !rejection.is_missing() => Err(ApiError::Unauthorized),
            Err(_) => {
                let session = address_session.clone().ok_or_else(|| {
                    ApiError::Internal(anyhow::anyhow!("missing client address"))
                })?;
                Ok(Caller {
                    session,
                    address_session,
                })
            }
        }
    }
}

/// A signed-in user. Room creation and administration need one.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: Uuid,
}

impl AuthUser {
    pub fn session_id(&self) -> String {
        SessionId::User(self.user_id).to_string()
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| ApiError::Unauthorized)?;
        let claims = decode_user_token(bearer.token(), &state.jwt_secret)?;
        Ok(AuthUser { user_id: claims.sub })
    }
}
