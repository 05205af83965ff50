use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Outcome of the most recent scheduled run, shared with the probes.
#[derive(Debug)]
pub struct Health {
    last_run_failed: AtomicBool,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            last_run_failed: AtomicBool::new(false),
        }
    }
}

impl Health {
    pub fn record_run(&self, failed: bool) {
        self.last_run_failed.store(failed, Ordering::Relaxed);
    }

    pub fn last_run_failed(&self) -> bool {
        self.last_run_failed.load(Ordering::Relaxed)
    }
}

pub async fn readiness_probe(State(health): State<Arc<Health>>) -> impl IntoResponse {
    if health.last_run_failed() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::NO_CONTENT
    }
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub fn create_app(health: Arc<Health>) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .with_state(health)
}
