use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    clients::health::HealthChecker, config::Config, daemons::retry::RetryStats,
    models::health::HealthStatus,
};

struct AppState {
    health_checker: HealthChecker,
    retry_stats: Arc<RetryStats>,
}

/// Serves `/health` (readiness, probes every dependency) and `/health/live`
/// (liveness, reports the retry daemon without touching the network).
pub async fn run_api_server(
    config: Config,
    retry_stats: Arc<RetryStats>,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = Arc::new(AppState {
        health_checker: HealthChecker::new(config.clone(), retry_stats.clone()),
        retry_stats,
    });

    let app = Router::new()
        .route("/health", get(readiness))
        .route("/health/live", get(liveness))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "Health server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Only an Unhealthy verdict maps to 503; Degraded still answers 200.
async fn readiness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_checker.check_all().await;

    let status_code = if health.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status_code, Json(health))
}

async fn liveness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.retry_stats.snapshot();

    let status_code = if snapshot.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(snapshot))
}
