//! Tower middleware applying admission control to HTTP services.

use crate::coordinator::{Admission, AdmissionCoordinator};
use crate::identity::IdentityExtractor;
use crate::store::BucketStore;
use crate::telemetry::{NullSink, TelemetrySink};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Tokens left in the caller's bucket after an admitted request.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Bucket capacity.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");

/// A layer that enforces per-identity admission using an [`AdmissionCoordinator`].
pub struct AdmissionLayer<S, T = NullSink> {
    coordinator: Arc<AdmissionCoordinator<S, T>>,
    identity: Arc<IdentityExtractor>,
}

impl<S, T> AdmissionLayer<S, T> {
    /// Create a layer identifying callers by `X-Forwarded-For`, then peer address.
    pub fn new(coordinator: AdmissionCoordinator<S, T>) -> Self {
        Self::from_shared(Arc::new(coordinator))
    }

    /// Create a layer around a coordinator shared with other layers or handlers.
    pub fn from_shared(coordinator: Arc<AdmissionCoordinator<S, T>>) -> Self {
        Self { coordinator, identity: Arc::new(IdentityExtractor::default()) }
    }

    pub fn with_identity(mut self, identity: IdentityExtractor) -> Self {
        self.identity = Arc::new(identity);
        self
    }
}

impl<S, T> Clone for AdmissionLayer<S, T> {
    fn clone(&self) -> Self {
        Self { coordinator: self.coordinator.clone(), identity: self.identity.clone() }
    }
}

impl<S, T> fmt::Debug for AdmissionLayer<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionLayer")
            .field("coordinator", &self.coordinator)
            .field("identity", &self.identity)
            .finish()
    }
}

impl<Svc, S, T> Layer<Svc> for AdmissionLayer<S, T> {
    type Service = AdmissionService<Svc, S, T>;

    fn layer(&self, service: Svc) -> Self::Service {
        AdmissionService {
            inner: service,
            coordinator: self.coordinator.clone(),
            identity: self.identity.clone(),
        }
    }
}

/// Middleware service that admits, rejects, or bypasses each request.
///
/// - admitted: forwarded, with `X-RateLimit-Remaining` and `X-RateLimit-Limit` set
/// - rejected: answered with `429 Too Many Requests` and a JSON body; inner is not called
/// - bypassed: forwarded untouched
pub struct AdmissionService<Svc, S, T = NullSink> {
    inner: Svc,
    coordinator: Arc<AdmissionCoordinator<S, T>>,
    identity: Arc<IdentityExtractor>,
}

impl<Svc: Clone, S, T> Clone for AdmissionService<Svc, S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            coordinator: self.coordinator.clone(),
            identity: self.identity.clone(),
        }
    }
}

impl<Svc: fmt::Debug, S, T> fmt::Debug for AdmissionService<Svc, S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionService")
            .field("inner", &self.inner)
            .field("coordinator", &self.coordinator)
            .field("identity", &self.identity)
            .finish()
    }
}

impl<Svc, S, T, ReqB, ResB> Service<Request<ReqB>> for AdmissionService<Svc, S, T>
where
    Svc: Service<Request<ReqB>, Response = Response<ResB>> + Clone + Send + 'static,
    Svc::Future: Send + 'static,
    Svc::Error: Send + 'static,
    S: BucketStore + 'static,
    T: TelemetrySink + Sync,
    T::Future: Send + 'static,
    ReqB: Send + 'static,
    ResB: From<String> + Send + 'static,
{
    type Response = Response<ResB>;
    type Error = Svc::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqB>) -> Self::Future {
        let identity = self.identity.identify(&req);
        let coordinator = self.coordinator.clone();
        // Keep the instance that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match coordinator.admit(&identity).await {
                decision @ Admission::Admit { limit, .. } => {
                    let mut response = inner.call(req).await?;
                    let remaining = decision.remaining_tokens().unwrap_or(0);
                    set_rate_limit_headers(response.headers_mut(), remaining, limit);
                    Ok(response)
                }
                Admission::Reject => Ok(too_many_requests()),
                Admission::Bypass => inner.call(req).await,
            }
        })
    }
}

fn set_rate_limit_headers(headers: &mut HeaderMap, remaining: u64, limit: f64) {
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert(X_RATELIMIT_LIMIT, value);
    }
}

fn too_many_requests<B: From<String>>() -> Response<B> {
    let body = serde_json::json!({
        "error": "Too Many Requests",
        "message": "Rate limit exceeded. Try again later.",
    });
    let mut response = Response::new(B::from(body.to_string()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_header_renders_whole_capacity_without_fraction() {
        let mut headers = HeaderMap::new();
        set_rate_limit_headers(&mut headers, 7, 10.0);
        assert_eq!(headers[X_RATELIMIT_REMAINING], "7");
        assert_eq!(headers[X_RATELIMIT_LIMIT], "10");

        set_rate_limit_headers(&mut headers, 0, 2.5);
        assert_eq!(headers[X_RATELIMIT_LIMIT], "2.5");
    }

    #[test]
    fn overload_response_is_json_429() {
        let response: Response<String> = too_many_requests();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["error"], "Too Many Requests");
        assert_eq!(body["message"], "Rate limit exceeded. Try again later.");
    }
}
