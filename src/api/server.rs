use std::future::Future;
use std::net::SocketAddr;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{
    services::{health, upload},
    state::AppState,
};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Routes with the configured upload limit applied
pub fn router(state: AppState) -> Router {
    let body_limit = state.config.server.max_upload_bytes.as_usize();

    Router::new()
        .route("/upload", post(upload))
        .route("/health", get(health))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(body_limit)),
        )
}

/// Serve until `shutdown` resolves, then drain in-flight requests
pub async fn run<F>(state: AppState, address: SocketAddr, shutdown: F) -> Result<(), AnyError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let limit = state.config.server.max_upload_bytes;
    let app = router(state);

    let listener = TcpListener::bind(address).await?;
    info!(%address, max_upload = %limit, "Upload API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Upload API stopped");
    Ok(())
}
