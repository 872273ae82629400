use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::domain::{Identity, UserId};

use crate::error::CoreError;

/// Resolves a connection credential into an identity before the connection
/// is admitted. Failures reject the connection outright.
pub trait Gatekeeper: Send + Sync {
    fn authenticate(&self, credential: Option<&str>) -> Result<Identity, CoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Claims {
    user_id: i64,
    username: String,
    exp: i64,
    #[serde(default)]
    iat: i64,
}

/// Verifies HS256 tokens issued by the external auth service.
#[derive(Clone)]
pub struct JwtGatekeeper {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtGatekeeper {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl Gatekeeper for JwtGatekeeper {
    fn authenticate(&self, credential: Option<&str>) -> Result<Identity, CoreError> {
        let token = credential
            .map(str::trim)
            .map(|raw| raw.strip_prefix("Bearer ").unwrap_or(raw))
            .filter(|token| !token.is_empty())
            .ok_or_else(|| CoreError::Authentication("missing credential".into()))?;

        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| CoreError::Authentication(format!("invalid credential: {e}")))?
            .claims;

        let username = claims.username.trim();
        if username.is_empty() {
            return Err(CoreError::Authentication(
                "credential carries no username".into(),
            ));
        }
        Ok(Identity::new(UserId(claims.user_id), username))
    }
}

/// Issues a token in the format [`JwtGatekeeper`] accepts. Used by local
/// tooling and tests; production tokens come from the auth service.
pub fn mint_token(
    secret: &str,
    identity: &Identity,
    ttl_seconds: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::seconds(ttl_seconds);
    let claims = Claims {
        user_id: identity.id.0,
        username: identity.display_name.clone(),
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

#[cfg(test)]
#[path = "tests/gatekeeper_tests.rs"]
mod tests;
