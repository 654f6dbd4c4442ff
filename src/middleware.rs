//! Tower middleware wiring the breaker into a request pipeline, per
//! `spec.md` §4.3. Shaped directly after the teacher's
//! `ratelimit::{RateLimitLayer, RateLimitMiddleware}`.

use std::collections::HashSet;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use tokio::time::Instant;
use tower::{Layer, Service};

use crate::breaker::Breaker;
use crate::capture::CapturerPool;
use crate::config::BreakerSettings;

/// Tower layer that adds circuit breaker middleware.
#[derive(Clone)]
pub struct CircuitBreakerLayer {
    state: Arc<SharedState>,
}

struct SharedState {
    breaker: Breaker,
    pool: Arc<CapturerPool>,
    error_codes: HashSet<u16>,
    code_when_open: u16,
}

impl CircuitBreakerLayer {
    /// Build a layer from validated settings, spawning the breaker's
    /// background transition task.
    pub fn new(settings: &BreakerSettings) -> Self {
        Self {
            state: Arc::new(SharedState {
                breaker: Breaker::new(settings),
                pool: Arc::new(CapturerPool::new()),
                error_codes: settings.error_codes.iter().copied().collect(),
                code_when_open: settings.code_when_open,
            }),
        }
    }

    /// Stop the underlying breaker's background task. Call this during
    /// graceful shutdown; in-flight requests complete normally regardless.
    pub async fn stop(&self) {
        self.state.breaker.stop().await;
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerMiddleware {
            inner,
            state: Arc::clone(&self.state),
        }
    }
}

/// Tower service that admits or rejects requests based on breaker state and
/// feeds the observed outcome back into the breaker.
#[derive(Clone)]
pub struct CircuitBreakerMiddleware<S> {
    inner: S,
    state: Arc<SharedState>,
}

impl<S> Service<Request<Body>> for CircuitBreakerMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let state = Arc::clone(&self.state);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if !state.breaker.allow_request() {
                let mut response = Response::new(Body::empty());
                *response.status_mut() =
                    StatusCode::from_u16(state.code_when_open).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
                return Ok(response);
            }

            let guard = state.pool.acquire();
            let response = inner.call(req).await?;
            guard.write_header(response.status().as_u16());

            let now = Instant::now();
            let observed = guard.recorded().unwrap_or(200);
            if state.error_codes.contains(&observed) {
                state.breaker.add_error(now).await;
            } else {
                state.breaker.add_success(now);
            }
            drop(guard);

            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, StorageKind};
    use axum::Router;
    use axum::routing::get;
    use tower::ServiceExt;

    fn settings(max_error_rate: f64) -> BreakerSettings {
        BreakerConfig {
            max_error_rate,
            error_codes: vec![500],
            time_to_halfopen_seconds: 60,
            time_to_closed_seconds: 60,
            time_window_seconds: 60,
            code_when_open: 503,
            storage_kind: StorageKind::Tumbling,
        }
        .validate()
        .unwrap()
    }

    async fn ok_handler() -> StatusCode {
        StatusCode::OK
    }

    async fn error_handler() -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    #[tokio::test]
    async fn passes_through_while_closed() {
        let layer = CircuitBreakerLayer::new(&settings(0.5));
        let app = Router::new().route("/", get(ok_handler)).layer(layer);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn trips_and_rejects_with_code_when_open() {
        let layer = CircuitBreakerLayer::new(&settings(0.5));
        let app = Router::new()
            .route("/", get(error_handler))
            .layer(layer.clone());

        let first = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let second = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);

        layer.stop().await;
    }
}
