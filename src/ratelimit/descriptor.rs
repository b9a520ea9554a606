//! Per-request descriptor construction.

use axum::http::{header, Method, Request};
use sha2::{Digest, Sha256};

use super::policy::Tier;

/// The authenticated caller behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub tier: Tier,
}

/// Everything the guards need to know about one inbound request.
///
/// Built at request entry and dropped once the pipeline has decided.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    /// Resolved source address, e.g. `203.0.113.7`
    pub client_addr: String,
    /// Rate limit grouping key derived from the address and identity
    pub client_key: String,
    /// `"{METHOD} {normalized path}"`
    pub route_key: String,
    pub method: Method,
    /// Raw request path
    pub path: String,
    /// Path and query as received
    pub target: String,
    /// Parsed `Content-Length`
    pub declared_size: Option<u64>,
    /// A `Content-Length` header was present but not a number
    pub malformed_length: bool,
    /// Media type without parameters, lower-cased
    pub content_type: Option<String>,
    pub identity: Option<Identity>,
    hash_client_keys: bool,
}

impl RequestDescriptor {
    /// Create a descriptor for `method target` from `client_addr`.
    pub fn new(method: Method, target: &str, client_addr: &str) -> Self {
        let path = target.split('?').next().unwrap_or(target).to_string();
        let route_key = route_key(&method, &path);
        let mut descriptor = Self {
            client_addr: client_addr.to_string(),
            client_key: String::new(),
            route_key,
            method,
            path,
            target: target.to_string(),
            declared_size: None,
            malformed_length: false,
            content_type: None,
            identity: None,
            hash_client_keys: false,
        };
        descriptor.refresh_client_key();
        descriptor
    }

    /// Build a descriptor from an HTTP request.
    pub fn from_request<B>(
        req: &Request<B>,
        client_addr: &str,
        identity: Option<Identity>,
        hash_client_keys: bool,
    ) -> Self {
        let uri = req.uri();
        let target = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| uri.path());
        let headers = req.headers();

        Self::new(req.method().clone(), target, client_addr)
            .with_hashed_client_keys(hash_client_keys)
            .with_identity(identity)
            .with_content_length(
                headers
                    .get(header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok()),
            )
            .with_content_type(
                headers
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok()),
            )
    }

    /// Attach the authenticated identity, folding it into the client key.
    pub fn with_identity(mut self, identity: Option<Identity>) -> Self {
        self.identity = identity;
        self.refresh_client_key();
        self
    }

    /// Replace the address part of the client key with a digest.
    pub fn with_hashed_client_keys(mut self, enabled: bool) -> Self {
        self.hash_client_keys = enabled;
        self.refresh_client_key();
        self
    }

    /// Record the raw `Content-Length` header value.
    pub fn with_content_length(mut self, raw: Option<&str>) -> Self {
        match raw.map(|v| v.trim().parse::<u64>()) {
            Some(Ok(size)) => {
                self.declared_size = Some(size);
                self.malformed_length = false;
            }
            Some(Err(_)) => {
                self.declared_size = None;
                self.malformed_length = true;
            }
            None => {
                self.declared_size = None;
                self.malformed_length = false;
            }
        }
        self
    }

    /// Record the raw `Content-Type` header value.
    pub fn with_content_type(mut self, raw: Option<&str>) -> Self {
        self.content_type = raw
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty());
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    /// The caller's tier; anonymous callers are always `Free`.
    pub fn tier(&self) -> Tier {
        self.identity
            .as_ref()
            .map(|i| i.tier)
            .unwrap_or(Tier::Free)
    }

    fn refresh_client_key(&mut self) {
        let addr = if self.hash_client_keys {
            hash_address(&self.client_addr)
        } else {
            self.client_addr.clone()
        };
        self.client_key = match &self.identity {
            Some(identity) => format!("{}:{}", addr, identity.user_id),
            None => addr,
        };
    }
}

/// Build the route key for a method and raw path.
pub fn route_key(method: &Method, path: &str) -> String {
    format!("{} {}", method.as_str(), normalize_path(path))
}

/// Collapse identifier-like path segments into `{id}`.
///
/// `/users/42/orders/9f1c...` becomes `/users/{id}/orders/{id}` so that
/// every resource instance shares one route key.
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.split('/')
        .map(|segment| {
            if is_identifier(segment) {
                "{id}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_identifier(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    if segment.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    if is_uuid(segment) {
        return true;
    }
    segment.len() >= 16 && segment.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_uuid(segment: &str) -> bool {
    segment.len() == 36
        && segment.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}

fn hash_address(addr: &str) -> String {
    let digest = Sha256::digest(addr.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(16);
    format!("ip:{}", encoded)
}
