//! Identity resolution for inbound requests.
//!
//! Resolution is two steps: an identity already attached to the request by
//! an upstream layer wins, otherwise a bearer credential is validated. A
//! request that yields neither is anonymous.

mod jwt;

pub use jwt::{Claims, JwtIdentityProvider};

use async_trait::async_trait;
use axum::http::{header, Extensions, HeaderMap};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::ratelimit::LimiterMetrics;

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable unique identifier; buckets are scoped to it
    pub id: String,
    /// Display name, if the credential carried one
    pub username: Option<String>,
    /// Whether this principal passed authentication
    pub authenticated: bool,
}

impl Identity {
    /// An identity that passed authentication.
    pub fn authenticated(id: impl Into<String>, username: Option<String>) -> Self {
        Self {
            id: id.into(),
            username,
            authenticated: true,
        }
    }

    /// Name to greet the principal with.
    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.id)
    }
}

/// Reasons a credential did not produce an identity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("credential validation is not configured")]
    NotConfigured,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token has expired")]
    Expired,

    #[error("token is missing the {0} claim")]
    MissingClaim(&'static str),
}

/// The identity collaborator consulted by the admission middleware.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// An identity some earlier layer already attached to the request.
    fn try_ambient_identity(&self, extensions: &Extensions) -> Option<Identity> {
        extensions
            .get::<Identity>()
            .filter(|identity| identity.authenticated)
            .cloned()
    }

    /// Validate a raw bearer credential.
    async fn try_validate_credential(&self, raw_token: &str) -> Result<Identity, AuthError>;
}

/// Extract the token from an `Authorization: Bearer <token>` header.
///
/// Other schemes are not ours to judge and yield `None`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Work out who is making the request.
///
/// On a successful credential validation the identity is attached to the
/// request extensions, so downstream handlers see it as ambient. Validation
/// failures make the request anonymous; they are counted and logged rather
/// than reported to the caller.
pub async fn resolve_identity(
    provider: &dyn IdentityProvider,
    extensions: &mut Extensions,
    headers: &HeaderMap,
    metrics: &LimiterMetrics,
) -> Option<Identity> {
    if let Some(identity) = provider.try_ambient_identity(extensions) {
        return Some(identity);
    }

    let token = bearer_token(headers)?;
    match provider.try_validate_credential(token).await {
        Ok(identity) => {
            extensions.insert(identity.clone());
            Some(identity)
        }
        Err(AuthError::NotConfigured) => {
            trace!("Bearer token present but validation is disabled");
            None
        }
        Err(e) => {
            metrics.record_identity_failure();
            debug!(error = %e, "Credential rejected, treating request as anonymous");
            None
        }
    }
}
