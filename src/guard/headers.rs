//! Security response headers.

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};

use crate::config::{Environment, HeadersConfig};

const PERMISSIONS_POLICY: &str = "camera=(), microphone=(), geolocation=(), payment=(), \
usb=(), magnetometer=(), gyroscope=(), accelerometer=()";
const HSTS: &str = "max-age=31536000; includeSubDomains; preload";

/// Adds hardening headers to every response.
#[derive(Debug, Clone)]
pub struct SecurityHeaders {
    production: bool,
    enable_hsts: bool,
    /// Pre-validated CSP value, present only when enabled
    csp: Option<HeaderValue>,
}

impl SecurityHeaders {
    pub fn from_config(config: &HeadersConfig, environment: Environment) -> Self {
        let csp = if config.enable_csp {
            HeaderValue::from_str(&config.csp_policy).ok()
        } else {
            None
        };
        Self {
            production: environment == Environment::Production,
            enable_hsts: config.enable_hsts,
            csp,
        }
    }

    /// Write the headers into `headers`, replacing existing values.
    ///
    /// HSTS is only sent in production over HTTPS; CSP only in production.
    pub fn apply(&self, headers: &mut HeaderMap, https: bool) {
        headers.insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );
        headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
        headers.insert(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        );
        headers.insert(
            HeaderName::from_static("permissions-policy"),
            HeaderValue::from_static(PERMISSIONS_POLICY),
        );
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store, max-age=0"),
        );
        headers.insert(header::SERVER, HeaderValue::from_static("undisclosed"));

        if self.production && self.enable_hsts && https {
            headers.insert(
                header::STRICT_TRANSPORT_SECURITY,
                HeaderValue::from_static(HSTS),
            );
        }

        if self.production {
            if let Some(csp) = &self.csp {
                headers.insert(header::CONTENT_SECURITY_POLICY, csp.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enable_csp: bool) -> HeadersConfig {
        HeadersConfig {
            enable_hsts: true,
            enable_csp,
            csp_policy: "default-src 'self'".to_string(),
        }
    }

    #[test]
    fn test_baseline_headers_always_applied() {
        let headers_guard = SecurityHeaders::from_config(&config(false), Environment::Local);
        let mut headers = HeaderMap::new();
        headers.insert(header::SERVER, HeaderValue::from_static("axum"));
        headers_guard.apply(&mut headers, false);

        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-frame-options"], "DENY");
        assert_eq!(headers["referrer-policy"], "strict-origin-when-cross-origin");
        assert!(headers["permissions-policy"]
            .to_str()
            .unwrap()
            .starts_with("camera=()"));
        assert_eq!(headers["cache-control"], "no-store, max-age=0");
        assert_eq!(headers["server"], "undisclosed");
        assert!(!headers.contains_key("strict-transport-security"));
    }

    #[test]
    fn test_hsts_only_in_production_over_https() {
        let local = SecurityHeaders::from_config(&config(false), Environment::Local);
        let prod = SecurityHeaders::from_config(&config(false), Environment::Production);

        let mut headers = HeaderMap::new();
        local.apply(&mut headers, true);
        assert!(!headers.contains_key("strict-transport-security"));

        let mut headers = HeaderMap::new();
        prod.apply(&mut headers, false);
        assert!(!headers.contains_key("strict-transport-security"));

        let mut headers = HeaderMap::new();
        prod.apply(&mut headers, true);
        assert_eq!(headers["strict-transport-security"], HSTS);
    }

    #[test]
    fn test_csp_only_in_production_when_enabled() {
        let mut headers = HeaderMap::new();
        SecurityHeaders::from_config(&config(true), Environment::Staging).apply(&mut headers, true);
        assert!(!headers.contains_key("content-security-policy"));

        let mut headers = HeaderMap::new();
        SecurityHeaders::from_config(&config(true), Environment::Production)
            .apply(&mut headers, false);
        assert_eq!(headers["content-security-policy"], "default-src 'self'");

        let mut headers = HeaderMap::new();
        SecurityHeaders::from_config(&config(false), Environment::Production)
            .apply(&mut headers, false);
        assert!(!headers.contains_key("content-security-policy"));
    }
}
