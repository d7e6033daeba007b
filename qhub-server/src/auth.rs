//! Caller token extraction.

use axum::{extract::FromRequestParts, http::header, http::request::Parts};
use std::convert::Infallible;

/// The bearer token of a request; empty if none was sent.
///
/// Extraction never fails. Rejecting a missing or wrong token is the hub's
/// job, so every route reports it the same way.
#[derive(Debug, Clone, Default)]
pub struct BearerToken(pub String);

impl BearerToken {
    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S> FromRequestParts<S> for BearerToken
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string())
            .unwrap_or_default();
        Ok(Self(token))
    }
}
