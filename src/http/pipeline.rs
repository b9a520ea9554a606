//! Ordered composition of the guards around a handler.
//!
//! Per request, in order: request id, proxy resolution, identity (bearer
//! token, then API key), DDoS shield, rate limiter, content guard, request
//! signature, circuit breaker (protected routes only), handler. The first guard that refuses short-circuits the
//! rest. Security headers and the request id are added to every response,
//! rejections included.

use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use super::rejection::{Rejection, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING};
use crate::breaker::{CallDecision, CircuitBreaker};
use crate::clock::Clock;
use crate::config::{AuthConfig, BulwarkConfig, Environment, HeadersConfig};
use crate::error::Result;
use crate::guard::{
    ApiKeyAuthenticator, ContentGuard, DdosShield, JwtAuthenticator, ProxyResolver,
    ResolvedClient, SecurityHeaders, SignatureVerifier,
};
use crate::metrics::GuardMetrics;
use crate::ratelimit::{RateLimitDecision, RateLimiter, RequestDescriptor};

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Longest inbound request id that is echoed back.
const MAX_REQUEST_ID_LEN: usize = 128;

/// The guard pipeline. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct RequestPipeline {
    inner: Arc<Guards>,
}

struct Guards {
    proxy: ProxyResolver,
    auth: ApiKeyAuthenticator,
    jwt: Option<JwtAuthenticator>,
    headers: SecurityHeaders,
    ddos: Option<Arc<DdosShield>>,
    limiter: Option<Arc<RateLimiter>>,
    content: Option<ContentGuard>,
    signature: Option<SignatureVerifier>,
    breaker: Option<Arc<CircuitBreaker>>,
    hash_client_keys: bool,
    metrics: Arc<GuardMetrics>,
}

/// Builder for [`RequestPipeline`]. Guards left unset are skipped.
pub struct PipelineBuilder {
    guards: Guards,
}

impl PipelineBuilder {
    pub fn proxy_resolver(mut self, proxy: ProxyResolver) -> Self {
        self.guards.proxy = proxy;
        self
    }

    pub fn authenticator(mut self, auth: ApiKeyAuthenticator) -> Self {
        self.guards.auth = auth;
        self
    }

    /// Bearer tokens take precedence over API keys.
    pub fn jwt_authenticator(mut self, jwt: JwtAuthenticator) -> Self {
        self.guards.jwt = Some(jwt);
        self
    }

    pub fn security_headers(mut self, headers: SecurityHeaders) -> Self {
        self.guards.headers = headers;
        self
    }

    pub fn ddos_shield(mut self, shield: DdosShield) -> Self {
        self.guards.ddos = Some(Arc::new(shield));
        self
    }

    pub fn rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.guards.limiter = Some(Arc::new(limiter));
        self
    }

    pub fn content_guard(mut self, content: ContentGuard) -> Self {
        self.guards.content = Some(content);
        self
    }

    pub fn signature_verifier(mut self, verifier: SignatureVerifier) -> Self {
        self.guards.signature = Some(verifier);
        self
    }

    pub fn circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.guards.breaker = Some(Arc::new(breaker));
        self
    }

    pub fn hash_client_keys(mut self, enabled: bool) -> Self {
        self.guards.hash_client_keys = enabled;
        self
    }

    pub fn build(self) -> RequestPipeline {
        RequestPipeline {
            inner: Arc::new(self.guards),
        }
    }
}

impl RequestPipeline {
    /// Start a pipeline with no guards beyond headers and request ids.
    pub fn builder(metrics: Arc<GuardMetrics>) -> PipelineBuilder {
        PipelineBuilder {
            guards: Guards {
                proxy: ProxyResolver::direct(),
                auth: ApiKeyAuthenticator::from_config(&AuthConfig::default()),
                jwt: None,
                headers: SecurityHeaders::from_config(&HeadersConfig::default(), Environment::Local),
                ddos: None,
                limiter: None,
                content: None,
                signature: None,
                breaker: None,
                hash_client_keys: false,
                metrics,
            },
        }
    }

    /// Build every enabled guard from configuration.
    pub fn from_config(
        config: &BulwarkConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<GuardMetrics>,
    ) -> Result<Self> {
        let mut builder = Self::builder(metrics.clone())
            .proxy_resolver(ProxyResolver::from_config(&config.proxy))
            .authenticator(ApiKeyAuthenticator::from_config(&config.auth))
            .security_headers(SecurityHeaders::from_config(
                &config.headers,
                config.server.environment,
            ))
            .hash_client_keys(config.rate_limiting.hash_client_keys);

        if let Some(jwt) = JwtAuthenticator::from_config(&config.auth) {
            builder = builder.jwt_authenticator(jwt);
        }
        if config.ddos.enabled {
            builder = builder.ddos_shield(DdosShield::from_config(&config.ddos, clock.clone()));
        }
        if config.rate_limiting.enabled {
            builder = builder.rate_limiter(RateLimiter::from_config(
                &config.rate_limiting,
                clock.clone(),
                metrics,
            )?);
        }
        if config.content.enabled {
            builder = builder.content_guard(ContentGuard::from_config(&config.content));
        }
        if config.signature.enabled {
            builder = builder.signature_verifier(SignatureVerifier::from_config(
                &config.signature,
                clock.clone(),
            )?);
        }
        if config.circuit_breaker.enabled {
            builder = builder.circuit_breaker(CircuitBreaker::from_config(
                &config.circuit_breaker,
                clock,
            ));
        }

        Ok(builder.build())
    }

    /// Wrap every route of `router` in the pipeline.
    pub fn wrap(&self, router: Router) -> Router {
        router.layer(middleware::from_fn_with_state(self.clone(), guard))
    }

    pub fn metrics(&self) -> &Arc<GuardMetrics> {
        &self.inner.metrics
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.inner.breaker.as_ref()
    }

    /// Drop idle per-client state from the limiter and the DDoS shield.
    pub fn sweep(&self) {
        let windows = self.inner.limiter.as_ref().map(|l| l.sweep()).unwrap_or(0);
        let addresses = self.inner.ddos.as_ref().map(|d| d.sweep()).unwrap_or(0);
        debug!(windows = windows, addresses = addresses, "Swept idle guard state");
    }

    async fn process(&self, req: Request, next: Next, request_id: &str) -> Response {
        let guards = &self.inner;
        guards.metrics.record_request();

        let client = guards.proxy.resolve(&req);
        let mut response = match self.admit_and_run(req, next, &client).await {
            Ok(response) => response,
            Err(rejection) => rejection.into_response(),
        };

        guards.headers.apply(response.headers_mut(), client.https);
        if let Ok(value) = HeaderValue::from_str(request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
        debug!(status = response.status().as_u16(), "Request complete");
        response
    }

    async fn admit_and_run(
        &self,
        req: Request,
        next: Next,
        client: &ResolvedClient,
    ) -> std::result::Result<Response, Rejection> {
        let guards = &self.inner;

        let _slot = match &guards.ddos {
            Some(shield) => Some(shield.admit(&client.ip).map_err(|rejection| {
                guards.metrics.record_ddos_block();
                Rejection::from(rejection)
            })?),
            None => None,
        };

        let identity = guards
            .jwt
            .as_ref()
            .and_then(|jwt| jwt.authenticate(req.headers()))
            .or_else(|| guards.auth.authenticate(req.headers()));
        let descriptor =
            RequestDescriptor::from_request(&req, &client.ip, identity, guards.hash_client_keys);

        let mut quota: Option<RateLimitDecision> = None;
        if let Some(limiter) = &guards.limiter {
            if let Some(decision) = limiter.check(&descriptor).await {
                if !decision.allowed {
                    guards.metrics.record_rate_limited();
                    return Err(Rejection::QuotaExceeded {
                        limit: decision.limit,
                        retry_after_seconds: decision.retry_after_seconds,
                    });
                }
                quota = Some(decision);
            }
        }

        if let Some(content) = &guards.content {
            content.validate(&descriptor).map_err(|rejection| {
                guards.metrics.record_content_rejection();
                Rejection::from(rejection)
            })?;
        }

        let req = match &guards.signature {
            Some(verifier) => verifier.verify(req).await.map_err(|rejection| {
                guards.metrics.record_signature_rejection();
                Rejection::from(rejection)
            })?,
            None => req,
        };

        let mut response = match &guards.breaker {
            Some(breaker) if breaker.protects(&descriptor.path) => {
                self.call_protected(breaker, &descriptor.route_key, req, next)
                    .await?
            }
            _ => next.run(req).await,
        };

        if let Some(decision) = quota {
            let headers = response.headers_mut();
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
        }
        Ok(response)
    }

    async fn call_protected(
        &self,
        breaker: &CircuitBreaker,
        route: &str,
        req: Request,
        next: Next,
    ) -> std::result::Result<Response, Rejection> {
        let admission = breaker.admit(route);
        if let CallDecision::ShortCircuited {
            retry_after_seconds,
        } = admission.decision
        {
            self.inner.metrics.record_circuit_rejection();
            warn!(route = %route, retry_after = retry_after_seconds, "Circuit open, call short-circuited");
            return Err(Rejection::CircuitOpen {
                retry_after_seconds,
            });
        }

        let mut probe = ProbeSlot {
            breaker,
            route,
            held: admission.is_probe,
        };
        let outcome = AssertUnwindSafe(next.run(req)).catch_unwind().await;
        probe.held = false;

        match outcome {
            Ok(response) => {
                let failed = breaker.is_failure_status(response.status().as_u16());
                breaker.record_outcome(route, !failed);
                Ok(response)
            }
            Err(_) => {
                breaker.record_outcome(route, false);
                error!(route = %route, "Handler panicked");
                Ok(internal_error())
            }
        }
    }
}

/// Releases a half-open probe slot if the call is dropped before it reports.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    route: &'a str,
    held: bool,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            self.breaker.release_probe(self.route);
        }
    }
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error" })),
    )
        .into_response()
}

/// Echo a sane inbound request id or mint a new one.
fn request_id(req: &Request) -> String {
    req.headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

async fn guard(State(pipeline): State<RequestPipeline>, req: Request, next: Next) -> Response {
    let request_id = request_id(&req);
    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path()
    );
    pipeline
        .process(req, next, &request_id)
        .instrument(span)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{LimitSpec, RateLimitPolicy, TimeWindow};
    use axum::body::Body;
    use axum::routing::{get, post};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn limiter(limit: u64, clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::local(
            RateLimitPolicy::new(LimitSpec {
                limit,
                window: TimeWindow::Minute,
                burst: 0,
            }),
            clock,
        )
        .with_bypass_paths(["/health".to_string()])
    }

    fn app(pipeline: &RequestPipeline) -> Router {
        pipeline.wrap(
            Router::new()
                .route("/health", get(|| async { "ok" }))
                .route("/api/items", get(|| async { "items" }).post(|| async { "created" }))
                .route("/api/fail", get(|| async { StatusCode::BAD_GATEWAY }))
                .route("/api/missing", get(|| async { StatusCode::NOT_FOUND }))
                .route("/api/panic", get(panicking))
                .route("/api/upload", post(|| async { "stored" })),
        )
    }

    async fn panicking() -> &'static str {
        panic!("boom")
    }

    fn get_req(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_security_headers_and_request_id_on_success() {
        let pipeline = RequestPipeline::builder(Arc::new(GuardMetrics::new())).build();
        let response = app(&pipeline).oneshot(get_req("/api/items")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-frame-options"], "DENY");
        assert_eq!(response.headers()["server"], "undisclosed");
        let id = response.headers()["x-request-id"].to_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn test_inbound_request_id_echoed() {
        let pipeline = RequestPipeline::builder(Arc::new(GuardMetrics::new())).build();
        let req = Request::builder()
            .uri("/api/items")
            .header("x-request-id", "trace-abc")
            .body(Body::empty())
            .unwrap();
        let response = app(&pipeline).oneshot(req).await.unwrap();
        assert_eq!(response.headers()["x-request-id"], "trace-abc");
    }

    #[tokio::test]
    async fn test_quota_headers_and_rejection() {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(100)));
        let metrics = Arc::new(GuardMetrics::new());
        let pipeline = RequestPipeline::builder(metrics.clone())
            .rate_limiter(limiter(2, clock))
            .build();
        let app = app(&pipeline);

        let response = app.clone().oneshot(get_req("/api/items")).await.unwrap();
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "1");

        app.clone().oneshot(get_req("/api/items")).await.unwrap();
        let response = app.clone().oneshot(get_req("/api/items")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "60");
        // Rejections still carry the hardening headers
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
        assert_eq!(metrics.snapshot().rate_limited, 1);

        // Bypass paths carry no quota metadata
        let response = app.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("x-ratelimit-limit"));
    }

    #[tokio::test]
    async fn test_content_guard_runs_after_limiter() {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(100)));
        let metrics = Arc::new(GuardMetrics::new());
        let pipeline = RequestPipeline::builder(metrics.clone())
            .rate_limiter(limiter(1, clock))
            .content_guard(ContentGuard::from_config(&Default::default()))
            .build();
        let app = app(&pipeline);

        let post_xml = || {
            Request::builder()
                .method("POST")
                .uri("/api/items")
                .header("content-type", "application/xml")
                .body(Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(post_xml()).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        // The rejected request still used the quota
        let response = app.oneshot(post_xml()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.content_rejections, 1);
        assert_eq!(snapshot.rate_limited, 1);
    }

    #[tokio::test]
    async fn test_breaker_counts_server_errors_not_client_errors() {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(100)));
        let pipeline = RequestPipeline::builder(Arc::new(GuardMetrics::new()))
            .circuit_breaker(CircuitBreaker::new(2, Duration::from_secs(30), clock))
            .build();
        let app = app(&pipeline);

        for _ in 0..5 {
            let response = app.clone().oneshot(get_req("/api/missing")).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }

        for _ in 0..2 {
            let response = app.clone().oneshot(get_req("/api/fail")).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }
        let response = app.oneshot(get_req("/api/fail")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["retry-after"], "30");
    }

    #[tokio::test]
    async fn test_handler_panic_counts_as_failure() {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(100)));
        let pipeline = RequestPipeline::builder(Arc::new(GuardMetrics::new()))
            .circuit_breaker(CircuitBreaker::new(1, Duration::from_secs(30), clock))
            .build();
        let app = app(&pipeline);

        let response = app.clone().oneshot(get_req("/api/panic")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&body).unwrap(),
            json!({ "error": "Internal server error" })
        );

        let breaker = pipeline.circuit_breaker().unwrap();
        assert_eq!(
            breaker.phase("GET /api/panic"),
            crate::breaker::Phase::Open
        );
    }

    #[tokio::test]
    async fn test_unprotected_routes_bypass_breaker() {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(100)));
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30), clock)
            .with_protected_prefixes(["/api/payments".to_string()]);
        let pipeline = RequestPipeline::builder(Arc::new(GuardMetrics::new()))
            .circuit_breaker(breaker)
            .build();
        let app = app(&pipeline);

        for _ in 0..3 {
            let response = app.clone().oneshot(get_req("/api/fail")).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }
    }

    #[tokio::test]
    async fn test_ddos_shield_blocks_first() {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(100)));
        let metrics = Arc::new(GuardMetrics::new());
        let pipeline = RequestPipeline::builder(metrics.clone())
            .ddos_shield(DdosShield::new(10, 2, Duration::from_secs(60), clock.clone()))
            .rate_limiter(limiter(100, clock))
            .build();
        let app = app(&pipeline);

        for _ in 0..2 {
            let response = app.clone().oneshot(get_req("/api/items")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app.clone().oneshot(get_req("/api/items")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = app.oneshot(get_req("/api/items")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(metrics.snapshot().ddos_blocks, 2);
        assert_eq!(metrics.snapshot().rate_limited, 0);
    }

    #[tokio::test]
    async fn test_abandoned_trial_call_frees_the_slot() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let clock = Arc::new(ManualClock::new(Duration::from_secs(100)));
        let pipeline = RequestPipeline::builder(Arc::new(GuardMetrics::new()))
            .circuit_breaker(CircuitBreaker::new(1, Duration::from_secs(30), clock.clone()))
            .build();

        let hang = Arc::new(AtomicBool::new(true));
        let flag = hang.clone();
        let app = pipeline.wrap(Router::new().route(
            "/api/slow",
            get(move || {
                let flag = flag.clone();
                async move {
                    if flag.load(Ordering::SeqCst) {
                        std::future::pending::<()>().await;
                    }
                    "done"
                }
            }),
        ));

        let breaker = pipeline.circuit_breaker().unwrap();
        breaker.record_outcome("GET /api/slow", false);
        assert_eq!(breaker.phase("GET /api/slow"), crate::breaker::Phase::Open);
        clock.advance(Duration::from_secs(30));

        // The first call after the timeout is the trial call and never finishes
        let mut trial = Box::pin(app.clone().oneshot(get_req("/api/slow")));
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut trial)
            .await
            .is_err());
        assert!(breaker.state("GET /api/slow").unwrap().probe_in_flight);

        // While it is in flight, others are short-circuited
        let response = app.clone().oneshot(get_req("/api/slow")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["retry-after"], "1");

        drop(trial);
        let state = breaker.state("GET /api/slow").unwrap();
        assert_eq!(state.phase, crate::breaker::Phase::HalfOpen);
        assert!(!state.probe_in_flight);

        // The next call takes over the slot and closes the circuit
        hang.store(false, Ordering::SeqCst);
        let response = app.oneshot(get_req("/api/slow")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(breaker.phase("GET /api/slow"), crate::breaker::Phase::Closed);
    }

    #[tokio::test]
    async fn test_bearer_token_tier_scales_quota() {
        use crate::config::ApiKeyEntry;
        use crate::ratelimit::Tier;
        use jsonwebtoken::{encode, EncodingKey, Header};

        let clock = Arc::new(ManualClock::new(Duration::from_secs(100)));
        let mut auth = AuthConfig::default();
        auth.api_keys.insert(
            "k-basic".to_string(),
            ApiKeyEntry {
                user_id: "svc".to_string(),
                tier: Tier::Basic,
            },
        );
        let pipeline = RequestPipeline::builder(Arc::new(GuardMetrics::new()))
            .authenticator(ApiKeyAuthenticator::from_config(&auth))
            .jwt_authenticator(JwtAuthenticator::new("jwt-secret", "access_token"))
            .rate_limiter(limiter(2, clock))
            .build();
        let app = app(&pipeline);

        let token = encode(
            &Header::default(),
            &json!({ "sub": "alice", "tier": "pro" }),
            &EncodingKey::from_secret(b"jwt-secret"),
        )
        .unwrap();
        let with_token = |api_key: Option<&str>| {
            let mut builder = Request::builder()
                .uri("/api/items")
                .header("authorization", format!("Bearer {}", token));
            if let Some(key) = api_key {
                builder = builder.header("x-api-key", key);
            }
            builder.body(Body::empty()).unwrap()
        };

        let response = app.clone().oneshot(with_token(None)).await.unwrap();
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "9");

        // The token wins over an API key on the same request
        let response = app.clone().oneshot(with_token(Some("k-basic"))).await.unwrap();
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "8");

        // The API key alone resolves its own identity
        let req = Request::builder()
            .uri("/api/items")
            .header("x-api-key", "k-basic")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.headers()["x-ratelimit-limit"], "4");
    }

    #[tokio::test]
    async fn test_signed_requests_are_verified() {
        use crate::guard::sign;

        let clock = Arc::new(ManualClock::new(Duration::from_secs(1_700_000_000)));
        let metrics = Arc::new(GuardMetrics::new());
        let pipeline = RequestPipeline::builder(metrics.clone())
            .signature_verifier(SignatureVerifier::new(
                "shared",
                Duration::from_secs(300),
                clock,
            ))
            .build();
        let app = pipeline.wrap(Router::new().route(
            "/api/orders",
            post(|body: String| async move { body }),
        ));

        let signed = |signature: String, body: &'static str| {
            Request::builder()
                .method("POST")
                .uri("/api/orders")
                .header("content-type", "application/json")
                .header("x-signature", signature)
                .header("x-timestamp", "1700000000")
                .body(Body::from(body))
                .unwrap()
        };

        let good = sign("shared", "POST", "/api/orders", 1_700_000_000, "{}");
        let response = app.clone().oneshot(signed(good, "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        // The handler still sees the buffered body
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"{}");

        let forged = sign("wrong", "POST", "/api/orders", 1_700_000_000, "{}");
        let response = app.oneshot(signed(forged, "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()["x-frame-options"], "DENY");
        assert_eq!(metrics.snapshot().signature_rejections, 1);
    }
}
