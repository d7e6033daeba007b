//! Caller authentication.
//!
//! The hub performs no authentication of its own; every facade call hands
//! the caller's token to an [`Authenticator`].

use crate::errors::UnauthorizedError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Subject the token was issued to.
    pub subject: String,
}

impl CallerIdentity {
    /// Creates an identity.
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }
}

/// Resolves a caller token to an identity.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authenticator: Send + Sync + std::fmt::Debug {
    /// Returns the caller behind `token`.
    async fn authenticate(&self, token: &str) -> Result<CallerIdentity, UnauthorizedError>;
}

/// Accepts a fixed set of tokens.
///
/// Tokens are kept as SHA-256 digests. An entry of the form
/// `subject:secret` authenticates as `subject`; a bare token authenticates
/// as `token-{n}`.
#[derive(Clone)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl std::fmt::Debug for StaticTokenAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenAuthenticator")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl StaticTokenAuthenticator {
    /// Creates an authenticator from configured entries.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens = entries
            .into_iter()
            .enumerate()
            .filter(|(_, entry)| !entry.as_ref().is_empty())
            .map(|(i, entry)| {
                let entry = entry.as_ref();
                let subject = entry
                    .split_once(':')
                    .map_or_else(|| format!("token-{i}"), |(subject, _)| subject.to_string());
                (digest(entry), subject)
            })
            .collect();
        Self { tokens }
    }

    /// Number of accepted tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns true if no token is accepted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<CallerIdentity, UnauthorizedError> {
        if token.is_empty() {
            return Err(UnauthorizedError::new("missing token"));
        }
        self.tokens
            .get(&digest(token))
            .map(CallerIdentity::new)
            .ok_or_else(|| UnauthorizedError::new("invalid token"))
    }
}
