//! Tower middleware over the throttle.
//!
//! [`ThrottleLayer`] wraps any `Service<Req, Error = BoxError>` so that every
//! `call` runs through [`Throttle::execute`]: the full admission sequence,
//! adaptive bookkeeping, and (when configured) the retry loop apply to each
//! request. The inner service sits behind an async mutex because a retrying
//! execute re-invokes it; requests must be `Clone` for the same reason.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gentlify::{Throttle, ThrottleConfig, ThrottleLayer};
//! use tower::ServiceBuilder;
//! # fn main() -> Result<(), gentlify::ThrottleError> {
//! # let my_service = tower::service_fn(|req: String| async move {
//! #     Ok::<_, gentlify::BoxError>(req)
//! # });
//! let throttle = Arc::new(Throttle::new(ThrottleConfig::default())?);
//! let service = ServiceBuilder::new()
//!     .layer(ThrottleLayer::new(throttle))
//!     .service(my_service);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::Mutex;
use tower::{Layer, Service, ServiceExt};

use crate::error::BoxError;
use crate::throttle::Throttle;

/// Layer that routes a service's calls through a shared [`Throttle`].
pub struct ThrottleLayer {
    throttle: Arc<Throttle>,
}

impl ThrottleLayer {
    pub fn new(throttle: Arc<Throttle>) -> Self {
        Self { throttle }
    }
}

impl<S> Layer<S> for ThrottleLayer {
    type Service = ThrottleService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ThrottleService {
            inner: Arc::new(Mutex::new(inner)),
            throttle: self.throttle.clone(),
        }
    }
}

/// Service produced by [`ThrottleLayer`].
pub struct ThrottleService<S> {
    inner: Arc<Mutex<S>>,
    throttle: Arc<Throttle>,
}

impl<S> Clone for ThrottleService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            throttle: self.throttle.clone(),
        }
    }
}

impl<S, Req> Service<Req> for ThrottleService<S>
where
    Req: Clone + Send + 'static,
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness is decided at admission inside execute.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.inner.clone();
        let throttle = self.throttle.clone();
        Box::pin(async move {
            throttle
                .execute(move |_slot| {
                    let inner = inner.clone();
                    let req = req.clone();
                    async move {
                        let mut guard = inner.lock().await;
                        ServiceExt::ready(&mut *guard).await?.call(req).await
                    }
                })
                .await
        })
    }
}
