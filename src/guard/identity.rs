//! Caller identity resolution from bearer tokens and API keys.
//!
//! Neither source ever rejects a request. A missing, unknown, expired or
//! forged credential leaves the caller anonymous, which only affects the
//! rate limit key and tier.

use axum::http::{header, HeaderMap, HeaderName};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::ratelimit::{Identity, Tier};

/// Maps an API key header to the caller's identity.
///
/// Requests without a key, or with an unknown one, stay anonymous: this
/// only feeds rate limit keys and tiers, it never rejects.
#[derive(Debug, Clone)]
pub struct ApiKeyAuthenticator {
    header: HeaderName,
    keys: HashMap<String, Identity>,
}

impl ApiKeyAuthenticator {
    /// Falls back to `x-api-key` if the configured header name is invalid.
    pub fn from_config(config: &AuthConfig) -> Self {
        let header = HeaderName::from_bytes(config.api_key_header.trim().as_bytes())
            .unwrap_or_else(|_| {
                warn!(header = %config.api_key_header, "Invalid API key header name, using x-api-key");
                HeaderName::from_static("x-api-key")
            });

        let keys = config
            .api_keys
            .iter()
            .map(|(key, entry)| {
                (
                    key.clone(),
                    Identity {
                        user_id: entry.user_id.clone(),
                        tier: entry.tier,
                    },
                )
            })
            .collect();

        Self { header, keys }
    }

    /// The identity behind the request's API key, if any.
    pub fn authenticate(&self, headers: &HeaderMap) -> Option<Identity> {
        let key = headers.get(&self.header)?.to_str().ok()?.trim();
        match self.keys.get(key) {
            Some(identity) => {
                debug!(user_id = %identity.user_id, tier = ?identity.tier, "API key accepted");
                Some(identity.clone())
            }
            None => {
                debug!("Unknown API key, treating caller as anonymous");
                None
            }
        }
    }
}

/// Claims read from a bearer token. Everything else in the token is ignored.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: Option<String>,
    user_id: Option<String>,
    tier: Option<String>,
}

/// Resolves identities from HS256 bearer tokens.
///
/// The token comes from `Authorization: Bearer <token>`, or failing that
/// from the configured cookie. `sub` (or `user_id`) becomes the user id and
/// `tier` the tier; unknown tier names count as `free`.
#[derive(Clone)]
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
    cookie: String,
}

impl JwtAuthenticator {
    pub fn new(secret: &str, cookie: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // `exp` is checked when present but not required
        validation.required_spec_claims.clear();
        validation.validate_aud = false;

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            cookie: cookie.to_string(),
        }
    }

    /// `None` when no token secret is configured.
    pub fn from_config(config: &AuthConfig) -> Option<Self> {
        let secret = config.jwt_secret.as_deref()?;
        Some(Self::new(secret, &config.jwt_cookie))
    }

    /// The identity carried by the request's token, if it verifies.
    pub fn authenticate(&self, headers: &HeaderMap) -> Option<Identity> {
        let token = bearer_token(headers).or_else(|| cookie_value(headers, &self.cookie))?;

        let claims = match decode::<TokenClaims>(token, &self.key, &self.validation) {
            Ok(data) => data.claims,
            Err(e) => {
                debug!(error = %e, "Token rejected, treating caller as anonymous");
                return None;
            }
        };

        let Some(user_id) = claims.sub.or(claims.user_id) else {
            debug!("Token carries no subject, treating caller as anonymous");
            return None;
        };
        let tier = claims.tier.as_deref().map(Tier::parse).unwrap_or_default();
        debug!(user_id = %user_id, tier = ?tier, "Token accepted");
        Some(Identity { user_id, tier })
    }
}

impl std::fmt::Debug for JwtAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthenticator")
            .field("cookie", &self.cookie)
            .finish_non_exhaustive()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim())
        .filter(|v| !v.is_empty())
}
