use axum::{
    routing::{get, post},
    Router,
};
use gst_recon_rust::api::{self, AppState};
use gst_recon_rust::{create_pool, AppConfig, Reconciler};
use std::sync::Arc;
use tower::ServiceBuilder;
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(true)
        .with_level(true)
        .init();

    let config = AppConfig::load()?;
    info!("Starting server with config: {:?}", config);

    let pool = create_pool(&config.database).await?;
    info!("Database pool created");

    let state = AppState {
        pool,
        reconciler: Arc::new(Reconciler::new(config.match_config.clone())?),
    };

    let app = Router::new()
        .route("/health", get(api::health_check))
        .route("/api/reconcile", post(api::reconcile))
        .with_state(state)
        .layer(ServiceBuilder::new());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  POST /api/reconcile  - reconcile filing periods");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
