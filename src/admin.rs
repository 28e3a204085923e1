//! Operator endpoints: breaker health and manual reset.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::breaker::StatsSnapshot;
use crate::layer::ResilienceLayer;
use crate::registry::{BreakerRegistry, HealthDetail, ResetSummary};
use crate::state::HealthStatus;
use crate::stream::{ResourceManager, StreamStats};

/// Shared state of the admin router.
#[derive(Clone)]
pub struct AdminState {
    registry: Arc<BreakerRegistry>,
    streams: Option<Arc<ResourceManager>>,
}

impl AdminState {
    /// Admin state over a breaker registry only.
    pub fn new(registry: Arc<BreakerRegistry>) -> Self {
        Self {
            registry,
            streams: None,
        }
    }

    /// Also reports stream registry counters.
    pub fn with_streams(mut self, streams: Arc<ResourceManager>) -> Self {
        self.streams = Some(streams);
        self
    }

    /// Admin state covering a whole layer.
    pub fn from_layer(layer: &ResilienceLayer) -> Self {
        Self::new(Arc::clone(layer.registry())).with_streams(Arc::clone(layer.streams()))
    }
}

#[derive(Serialize)]
struct BreakersView {
    status: HealthStatus,
    detail: HealthDetail,
    breakers: BTreeMap<String, StatsSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    streams: Option<StreamStats>,
}

/// `GET /admin/breakers` and `POST /admin/breakers/reset`.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/breakers", get(get_breakers))
        .route("/admin/breakers/reset", post(reset_breakers))
        .with_state(state)
}

async fn get_breakers(State(state): State<AdminState>) -> (StatusCode, Json<BreakersView>) {
    let report = state.registry.get_health_status();
    let code = StatusCode::from_u16(report.status.http_status())
        .unwrap_or(StatusCode::SERVICE_UNAVAILABLE);

    let view = BreakersView {
        status: report.status,
        detail: report.detail,
        breakers: state.registry.get_all_stats(),
        streams: state.streams.as_ref().map(|streams| streams.get_stats()),
    };
    (code, Json(view))
}

async fn reset_breakers(State(state): State<AdminState>) -> Json<ResetSummary> {
    Json(state.registry.reset_all())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::error::UpstreamError;
    use crate::settings::StreamSettings;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn registry(names: &[&str]) -> Arc<BreakerRegistry> {
        let registry = Arc::new(BreakerRegistry::new());
        for name in names {
            CircuitBreaker::builder(*name)
                .failure_threshold(1)
                .register(&registry)
                .unwrap();
        }
        registry
    }

    async fn json(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn get_breakers_request() -> Request<Body> {
        Request::builder()
            .uri("/admin/breakers")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn reports_health_and_per_breaker_stats() {
        let registry = registry(&["chat", "media"]);
        let streams = Arc::new(ResourceManager::new(StreamSettings::default()));
        let app = router(AdminState::new(Arc::clone(&registry)).with_streams(streams));

        let (status, body) = json(app.clone(), get_breakers_request()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["breakers"]["chat"]["state"], "CLOSED");
        assert_eq!(body["streams"]["activeStreams"], 0);

        let _ = registry
            .get("media")
            .unwrap()
            .call(|| async { Err::<(), _>(UpstreamError::from_status(500, "down")) })
            .await;
        let (status, body) = json(app, get_breakers_request()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["detail"]["tripped"][0], "media");
        assert_eq!(body["breakers"]["media"]["healthStatus"], "unhealthy");
    }

    #[tokio::test]
    async fn all_open_is_service_unavailable() {
        let registry = registry(&["chat"]);
        registry.get("chat").unwrap().force_open();

        let (status, body) = json(router(AdminState::new(registry)), get_breakers_request()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
        assert!(body.get("streams").is_none());
    }

    #[tokio::test]
    async fn reset_endpoint_closes_everything() {
        let registry = registry(&["chat", "media"]);
        registry.get("chat").unwrap().force_open();
        let app = router(AdminState::new(Arc::clone(&registry)));

        for _ in 0..2 {
            let request = Request::builder()
                .method("POST")
                .uri("/admin/breakers/reset")
                .body(Body::empty())
                .unwrap();
            let (status, body) = json(app.clone(), request).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["resetCount"], 2);
        }
        assert_eq!(registry.get_health_status().status, HealthStatus::Healthy);
    }
}
