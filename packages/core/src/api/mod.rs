//! Optional operational HTTP surface: `/health` and `/metrics`.

pub mod health;
pub mod metrics;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::AppError;
use crate::health::HealthReporter;
use crate::metrics::AppMetrics;

#[derive(Clone)]
pub struct ApiState {
    pub health: Arc<HealthReporter>,
    pub metrics: Arc<AppMetrics>,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(metrics::metrics))
        .layer(cors)
        .with_state(state)
}

/// Serve until `token` is cancelled.
pub async fn serve(addr: SocketAddr, state: ApiState, token: CancellationToken) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            token.cancelled().await;
            tracing::info!("HTTP server shutting down");
        })
        .await?;

    Ok(())
}
