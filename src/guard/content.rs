//! Request content validation.

use axum::http::Method;
use std::collections::HashMap;
use tracing::{trace, warn};

use crate::config::ContentConfig;
use crate::ratelimit::RequestDescriptor;

/// Why a request's content was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentRejection {
    /// Declared size is over the limit for the path
    PayloadTooLarge { max_size: u64 },
    /// Media type is not allowed for the method
    UnsupportedMediaType { allowed: Vec<String> },
    /// Unparsable length or NUL in the target
    Malformed,
}

/// Validates declared size, media type and target of a request.
#[derive(Debug, Clone)]
pub struct ContentGuard {
    /// (prefix, limit), longest prefix first
    size_limits: Vec<(String, u64)>,
    default_size_limit: u64,
    /// Upper-cased method to allowed media types
    allowed_types: HashMap<String, Vec<String>>,
    block_null_bytes: bool,
}

impl ContentGuard {
    pub fn from_config(config: &ContentConfig) -> Self {
        let mut size_limits: Vec<(String, u64)> = config
            .size_limits
            .iter()
            .map(|(prefix, limit)| (prefix.clone(), *limit))
            .collect();
        size_limits.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        let allowed_types = config
            .allowed_types
            .iter()
            .map(|(method, types)| {
                let mut types: Vec<String> =
                    types.iter().map(|t| t.trim().to_ascii_lowercase()).collect();
                types.sort();
                types.dedup();
                (method.trim().to_ascii_uppercase(), types)
            })
            .collect();

        Self {
            size_limits,
            default_size_limit: config.default_size_limit,
            allowed_types,
            block_null_bytes: config.block_null_bytes,
        }
    }

    /// The size limit for `path`: longest matching prefix, else the default.
    pub fn size_limit(&self, path: &str) -> u64 {
        self.size_limits
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, limit)| *limit)
            .unwrap_or(self.default_size_limit)
    }

    /// Check a request. The first failing check wins.
    pub fn validate(&self, descriptor: &RequestDescriptor) -> Result<(), ContentRejection> {
        if matches!(descriptor.method, Method::GET | Method::HEAD | Method::OPTIONS) {
            return Ok(());
        }

        if descriptor.malformed_length {
            warn!(path = %descriptor.path, "Unparsable Content-Length");
            return Err(ContentRejection::Malformed);
        }

        if let Some(size) = descriptor.declared_size {
            let limit = self.size_limit(&descriptor.path);
            if size > limit {
                warn!(
                    path = %descriptor.path,
                    client = %descriptor.client_addr,
                    size = size,
                    limit = limit,
                    "Payload too large"
                );
                return Err(ContentRejection::PayloadTooLarge { max_size: limit });
            }
        }

        if let Some(content_type) = &descriptor.content_type {
            if let Some(allowed) = self.allowed_types.get(descriptor.method.as_str()) {
                if !allowed.is_empty() && !allowed.iter().any(|t| t == content_type) {
                    warn!(
                        path = %descriptor.path,
                        method = %descriptor.method,
                        content_type = %content_type,
                        "Unsupported media type"
                    );
                    return Err(ContentRejection::UnsupportedMediaType {
                        allowed: allowed.clone(),
                    });
                }
            }
        }

        if self.block_null_bytes && has_null_byte(&descriptor.target) {
            warn!(
                path = %descriptor.path,
                client = %descriptor.client_addr,
                "NUL byte in request target"
            );
            return Err(ContentRejection::Malformed);
        }

        trace!(path = %descriptor.path, "Content accepted");
        Ok(())
    }
}

fn has_null_byte(target: &str) -> bool {
    target.contains('\0') || target.to_ascii_lowercase().contains("%00")
}
