//! Client-facing rejections and their HTTP rendering.

use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::guard::{ContentRejection, DdosRejection, SignatureRejection};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// A request the pipeline refused to pass on.
///
/// Bodies are stable JSON with an `error` field; nothing internal leaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// 429 from the rate limiter
    QuotaExceeded { limit: u64, retry_after_seconds: u64 },
    /// 503 from an open circuit
    CircuitOpen { retry_after_seconds: u64 },
    /// 413, 415 or 400 from the content guard
    PayloadRejected(ContentRejection),
    /// 403 for an address serving a block
    Blocked,
    /// 429 for an address that just tripped the flood heuristics
    Flooding { retry_after_seconds: u64 },
    /// 401 or 400 for a signed request that does not verify
    SignatureRejected(SignatureRejection),
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::QuotaExceeded { .. } | Rejection::Flooding { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Rejection::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Rejection::PayloadRejected(ContentRejection::PayloadTooLarge { .. }) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            Rejection::PayloadRejected(ContentRejection::UnsupportedMediaType { .. }) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            Rejection::PayloadRejected(ContentRejection::Malformed) => StatusCode::BAD_REQUEST,
            Rejection::Blocked => StatusCode::FORBIDDEN,
            Rejection::SignatureRejected(SignatureRejection::Unreadable) => StatusCode::BAD_REQUEST,
            Rejection::SignatureRejected(_) => StatusCode::UNAUTHORIZED,
        }
    }

    /// Seconds to put in `Retry-After`, if any.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Rejection::QuotaExceeded {
                retry_after_seconds,
                ..
            }
            | Rejection::CircuitOpen {
                retry_after_seconds,
            }
            | Rejection::Flooding {
                retry_after_seconds,
            } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    fn body(&self) -> serde_json::Value {
        match self {
            Rejection::QuotaExceeded {
                retry_after_seconds,
                ..
            } => json!({ "error": "Rate limit exceeded", "retry_after": retry_after_seconds }),
            Rejection::CircuitOpen {
                retry_after_seconds,
            } => json!({
                "error": "Service temporarily unavailable",
                "retry_after": retry_after_seconds
            }),
            Rejection::PayloadRejected(ContentRejection::PayloadTooLarge { max_size }) => {
                json!({ "error": "Payload too large", "max_size": max_size })
            }
            Rejection::PayloadRejected(ContentRejection::UnsupportedMediaType { allowed }) => {
                json!({ "error": "Unsupported media type", "allowed_types": allowed })
            }
            Rejection::PayloadRejected(ContentRejection::Malformed) => {
                json!({ "error": "Invalid request" })
            }
            Rejection::Blocked => json!({ "error": "Blocked" }),
            Rejection::Flooding {
                retry_after_seconds,
            } => json!({ "error": "Too many requests", "retry_after": retry_after_seconds }),
            Rejection::SignatureRejected(SignatureRejection::Expired) => {
                json!({ "error": "Request expired" })
            }
            Rejection::SignatureRejected(SignatureRejection::Invalid) => {
                json!({ "error": "Invalid signature" })
            }
            Rejection::SignatureRejected(SignatureRejection::Unreadable) => {
                json!({ "error": "Signature validation failed" })
            }
        }
    }
}

impl From<SignatureRejection> for Rejection {
    fn from(rejection: SignatureRejection) -> Self {
        Rejection::SignatureRejected(rejection)
    }
}

impl From<ContentRejection> for Rejection {
    fn from(rejection: ContentRejection) -> Self {
        Rejection::PayloadRejected(rejection)
    }
}

impl From<DdosRejection> for Rejection {
    fn from(rejection: DdosRejection) -> Self {
        match rejection {
            DdosRejection::Blocked => Rejection::Blocked,
            DdosRejection::Flooding {
                retry_after_seconds,
            } => Rejection::Flooding {
                retry_after_seconds,
            },
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let mut response = (self.status(), Json(self.body())).into_response();
        let headers = response.headers_mut();

        if let Some(seconds) = self.retry_after() {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        if let Rejection::QuotaExceeded { limit, .. } = self {
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from_static("0"));
        }
        response
    }
}
