//! HMAC-SHA256 request signatures.
//!
//! A signed request carries a hex signature and a Unix timestamp. The signed
//! message is `"{METHOD}:{path}:{timestamp}:{body}"`. Requests without both
//! headers pass through unverified.

use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::HeaderName;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::SignatureConfig;
use crate::error::{BulwarkError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Why a signed request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureRejection {
    /// The timestamp is further from now than the allowed age
    Expired,
    /// The signature does not match the request
    Invalid,
    /// The timestamp or body could not be read
    Unreadable,
}

/// Verifies signed requests against a shared secret.
pub struct SignatureVerifier {
    secret: Vec<u8>,
    header: HeaderName,
    timestamp_header: HeaderName,
    max_age: Duration,
    max_body_bytes: usize,
    clock: Arc<dyn Clock>,
}

impl SignatureVerifier {
    pub fn new(secret: &str, max_age: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            header: HeaderName::from_static("x-signature"),
            timestamp_header: HeaderName::from_static("x-timestamp"),
            max_age,
            max_body_bytes: 1024 * 1024,
            clock,
        }
    }

    pub fn from_config(config: &SignatureConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let secret = config
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BulwarkError::Config("signature.secret is required".into()))?;
        let header_name = |name: &str| {
            HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|_| BulwarkError::Config(format!("invalid header name '{}'", name)))
        };

        Ok(Self {
            secret: secret.as_bytes().to_vec(),
            header: header_name(&config.header)?,
            timestamp_header: header_name(&config.timestamp_header)?,
            max_age: Duration::from_secs(config.max_age_secs),
            max_body_bytes: config.max_body_bytes,
            clock,
        })
    }

    /// Verify `req` if it is signed, handing back a request whose body can
    /// still be read by the handler.
    pub async fn verify(&self, req: Request) -> std::result::Result<Request, SignatureRejection> {
        if req.uri().path().starts_with("/health") {
            return Ok(req);
        }

        let headers = req.headers();
        let (Some(signature), Some(timestamp)) =
            (headers.get(&self.header), headers.get(&self.timestamp_header))
        else {
            return Ok(req);
        };

        let timestamp = timestamp
            .to_str()
            .map_err(|_| SignatureRejection::Unreadable)?
            .trim()
            .to_string();
        let sent_at: u64 = timestamp
            .parse()
            .map_err(|_| SignatureRejection::Unreadable)?;
        let signature = signature
            .to_str()
            .ok()
            .and_then(|s| hex::decode(s.trim()).ok())
            .ok_or(SignatureRejection::Invalid)?;

        let now = self.clock.now().as_secs();
        if now.abs_diff(sent_at) > self.max_age.as_secs() {
            warn!(path = %req.uri().path(), skew_secs = now.abs_diff(sent_at), "Signed request expired");
            return Err(SignatureRejection::Expired);
        }

        let (parts, body) = req.into_parts();
        let bytes = to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|_| SignatureRejection::Unreadable)?;
        let text = std::str::from_utf8(&bytes).map_err(|_| SignatureRejection::Unreadable)?;

        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| SignatureRejection::Unreadable)?;
        mac.update(
            format!("{}:{}:{}:{}", parts.method, parts.uri.path(), timestamp, text).as_bytes(),
        );
        if mac.verify_slice(&signature).is_err() {
            warn!(path = %parts.uri.path(), "Invalid request signature");
            return Err(SignatureRejection::Invalid);
        }

        debug!(path = %parts.uri.path(), "Request signature verified");
        Ok(Request::from_parts(parts, Body::from(bytes)))
    }
}

#[cfg(test)]
pub(crate) fn sign(secret: &str, method: &str, path: &str, timestamp: u64, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{}:{}:{}:{}", method, path, timestamp, body).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
