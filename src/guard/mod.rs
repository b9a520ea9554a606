//! Request guards that run ahead of the handler.

mod content;
mod ddos;
mod headers;
mod identity;
mod proxy;
mod signature;

pub use content::{ContentGuard, ContentRejection};
pub use ddos::{DdosRejection, DdosShield, InFlightGuard};
pub use headers::SecurityHeaders;
pub use identity::{ApiKeyAuthenticator, JwtAuthenticator};
pub use proxy::{ProxyResolver, ResolvedClient};
pub use signature::{SignatureRejection, SignatureVerifier};

#[cfg(test)]
pub(crate) use signature::sign;
