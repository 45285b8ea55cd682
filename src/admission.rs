//! Admission control for inbound HTTP requests.
//!
//! [`AdmissionLayer`] wraps the gateway's routing service. For each request it derives
//! the [`BucketKey`], resolves the [`RateLimitPolicy`](crate::policy::RateLimitPolicy)
//! and asks the [`BucketStore`] for a token. Admitted requests reach the inner service
//! untouched; rejected ones get `429 Too Many Requests` and the inner service is never
//! called.
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tollgate::admission::AdmissionLayer;
//! use tollgate::policy::{PolicyResolver, RateLimitPolicy};
//! use tollgate::store::LocalBucketStore;
//! use tower::{service_fn, ServiceBuilder, ServiceExt};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let policy = RateLimitPolicy::new(1, 1, Duration::from_secs(60)).unwrap();
//! let layer = AdmissionLayer::new(
//!     Arc::new(LocalBucketStore::new()),
//!     Arc::new(PolicyResolver::uniform(policy)),
//! );
//! let svc = ServiceBuilder::new().layer(layer).service(service_fn(|_req: http::Request<()>| async {
//!     Ok::<_, std::convert::Infallible>(http::Response::new(String::from("proxied")))
//! }));
//!
//! let request = || http::Request::builder().uri("/orders").header("X-API-Key", "k").body(()).unwrap();
//! assert_eq!(svc.clone().oneshot(request()).await.unwrap().status(), 200);
//! assert_eq!(svc.oneshot(request()).await.unwrap().status(), 429);
//! # }
//! ```

use crate::key::{route_id, BucketKey, ClientIdentity, RequestContext};
use crate::policy::{PolicyResolver, RoutePolicy};
use crate::store::BucketStore;
use http::{Request, Response, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// A token was taken; forward the request.
    Admitted { key: BucketKey },
    /// No token available (or the store could not answer).
    Rejected { key: BucketKey },
}

impl Verdict {
    /// Helper to check if admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Verdict::Admitted { .. })
    }

    /// Bucket the request was charged against.
    pub fn key(&self) -> &BucketKey {
        match self {
            Verdict::Admitted { key } | Verdict::Rejected { key } => key,
        }
    }
}

/// Key derivation, policy resolution and the store call, without any HTTP plumbing.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    store: Arc<dyn BucketStore>,
    policies: Arc<PolicyResolver>,
    route_policy: Option<Arc<RoutePolicy>>,
}

impl AdmissionControl {
    pub fn new(store: Arc<dyn BucketStore>, policies: Arc<PolicyResolver>) -> Self {
        Self { store, policies, route_policy: None }
    }

    /// Apply `policy` to every request, whatever the route table says.
    pub fn with_route_policy(mut self, policy: RoutePolicy) -> Self {
        self.route_policy = Some(Arc::new(policy));
        self
    }

    /// Decide whether the request described by `ctx` may proceed now.
    pub async fn check(&self, ctx: &RequestContext<'_>) -> Verdict {
        let route = route_id(ctx.path);
        let identity = ClientIdentity::resolve(ctx);
        let policy = self.policies.resolve(route, identity.class(), self.route_policy.as_deref());
        let key = BucketKey::new(route, &identity);

        if self.store.try_consume(&key, policy).await {
            Verdict::Admitted { key }
        } else {
            tracing::warn!(
                target: "tollgate::admission",
                route = %route,
                client = %identity,
                "rate limit exceeded"
            );
            Verdict::Rejected { key }
        }
    }
}

/// A layer that enforces per-client, per-route token buckets.
#[derive(Clone, Debug)]
pub struct AdmissionLayer {
    control: AdmissionControl,
}

impl AdmissionLayer {
    /// Create a new admission layer.
    pub fn new(store: Arc<dyn BucketStore>, policies: Arc<PolicyResolver>) -> Self {
        Self { control: AdmissionControl::new(store, policies) }
    }

    /// Pin the route policy for the services this layer wraps (e.g. one mounted route).
    pub fn with_route_policy(mut self, policy: RoutePolicy) -> Self {
        self.control = self.control.with_route_policy(policy);
        self
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService { inner: service, control: self.control.clone() }
    }
}

/// Middleware service that rejects over-limit requests with `429`.
#[derive(Clone, Debug)]
pub struct AdmissionService<S> {
    inner: S,
    control: AdmissionControl,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // the clone may not be ready; keep the one that is
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let control = self.control.clone();

        Box::pin(async move {
            let verdict = {
                let ctx = RequestContext::from_request(&req);
                control.check(&ctx).await
            };
            if verdict.is_admitted() {
                inner.call(req).await
            } else {
                Ok(too_many_requests())
            }
        })
    }
}

fn too_many_requests<B: Default>() -> Response<B> {
    let mut response = Response::new(B::default());
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    response
}
