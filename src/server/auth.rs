use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use super::AppState;
use crate::error::ChatError;

/// Caller identity, taken from the header an identity-aware proxy sets in
/// front of the service. Requests without it are rejected with 401.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub String);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ChatError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(state.auth_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|user| !user.is_empty())
            .map(|user| AuthUser(user.to_string()))
            .ok_or(ChatError::Unauthorized)
    }
}
