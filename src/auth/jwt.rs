//! Bearer token validation with HMAC-signed JWTs.

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::{AuthError, Identity, IdentityProvider};
use crate::config::AuthConfig;
use crate::error::{Result, TollgateError};

/// Claims read from an access token.
///
/// The principal id comes from `sub`, or from a `user_id` claim for issuers
/// that put it there instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

impl Claims {
    fn principal_id(&self) -> Option<String> {
        if let Some(sub) = self.sub.as_deref().filter(|s| !s.is_empty()) {
            return Some(sub.to_string());
        }
        match self.user_id.as_ref()? {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Validates HMAC-signed bearer tokens.
pub struct JwtIdentityProvider {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl JwtIdentityProvider {
    /// Create a provider for tokens signed with `secret`.
    pub fn new(secret: &str, algorithm: Algorithm, leeway_secs: u64) -> Result<Self> {
        if !matches!(
            algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(TollgateError::Config(format!(
                "unsupported token algorithm {:?}, expected an HMAC algorithm",
                algorithm
            )));
        }

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        validation.leeway = leeway_secs;

        Ok(Self {
            key: Some(DecodingKey::from_secret(secret.as_bytes())),
            validation,
        })
    }

    /// A provider that recognizes no credentials; only ambient identities
    /// get through.
    pub fn disabled() -> Self {
        Self {
            key: None,
            validation: Validation::default(),
        }
    }

    /// Build from configuration. No secret means credential validation is off.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        match &config.jwt_secret {
            Some(secret) if !secret.is_empty() => {
                Self::new(secret, config.jwt_algorithm, config.leeway_secs)
            }
            _ => Ok(Self::disabled()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentityProvider {
    async fn try_validate_credential(&self, raw_token: &str) -> std::result::Result<Identity, AuthError> {
        let key = self.key.as_ref().ok_or(AuthError::NotConfigured)?;

        let data = decode::<Claims>(raw_token, key, &self.validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::InvalidToken(e.to_string()),
        })?;

        let id = data.claims.principal_id().ok_or(AuthError::MissingClaim("sub"))?;
        Ok(Identity::authenticated(id, data.claims.username))
    }
}
