//! Client address and scheme resolution behind reverse proxies.

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use tracing::trace;

use crate::config::ProxyConfig;

/// Where a request really came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedClient {
    /// Source address, e.g. `203.0.113.7`, or `unknown`
    pub ip: String,
    /// The original request used HTTPS
    pub https: bool,
}

/// Believes `X-Forwarded-For`, `X-Real-IP` and `X-Forwarded-Proto` only
/// from trusted peers.
#[derive(Debug, Clone)]
pub struct ProxyResolver {
    enabled: bool,
    trusted: HashSet<IpAddr>,
}

impl ProxyResolver {
    /// A resolver that ignores forwarding headers.
    pub fn direct() -> Self {
        Self {
            enabled: false,
            trusted: HashSet::new(),
        }
    }

    /// Addresses that do not parse are skipped; `validate()` has already
    /// rejected them for loaded configurations.
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            enabled: config.trust_proxy_headers,
            trusted: config
                .trusted_proxies
                .iter()
                .filter_map(|p| p.trim().parse().ok())
                .collect(),
        }
    }

    /// Resolve the client of `req` from its peer address and headers.
    pub fn resolve<B>(&self, req: &Request<B>) -> ResolvedClient {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let scheme_https = req.uri().scheme_str() == Some("https");
        self.resolve_parts(peer, req.headers(), scheme_https)
    }

    fn resolve_parts(&self, peer: Option<IpAddr>, headers: &HeaderMap, https: bool) -> ResolvedClient {
        let direct = ResolvedClient {
            ip: peer.map(|ip| ip.to_string()).unwrap_or_else(|| "unknown".to_string()),
            https,
        };

        let Some(peer) = peer else {
            return direct;
        };
        if !self.enabled || !self.trusted.contains(&peer) {
            return direct;
        }

        let forwarded_ip = header_str(headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| header_str(headers, "x-real-ip").map(str::trim))
            .filter(|v| v.parse::<IpAddr>().is_ok());

        let forwarded_https = header_str(headers, "x-forwarded-proto")
            .map(|proto| proto.trim().eq_ignore_ascii_case("https"));

        let resolved = ResolvedClient {
            ip: forwarded_ip.map(str::to_string).unwrap_or(direct.ip),
            https: forwarded_https.unwrap_or(direct.https),
        };
        trace!(peer = %peer, client = %resolved.ip, https = resolved.https, "Resolved proxied client");
        resolved
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
