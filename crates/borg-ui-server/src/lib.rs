pub mod error;
pub mod routes;
pub mod state;

use axum::routing::get;
use axum::Router;
use borg_ui_core::config::AppConfig;
use borg_ui_core::{Lifecycle, Services, Supervisor, SupervisorConfig};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(supervisor: Arc<Supervisor>) -> Router {
    let app_state = state::AppState::new(supervisor);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health))
        .route("/api", get(routes::health::api_info))
        .route(
            "/api/settings/cache",
            get(routes::settings::get_cache_settings).put(routes::settings::put_cache_settings),
        )
        .route("/api/system/tasks", get(routes::system::list_tasks))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Open the stores under `config.data_dir`, run startup, serve until Ctrl-C,
/// then stop the background tasks.
pub async fn serve(
    config: AppConfig,
    port: u16,
    admin_password: Option<String>,
) -> anyhow::Result<()> {
    let services = Services::open(&config, admin_password)?;
    let supervisor = Arc::new(Supervisor::new(services, SupervisorConfig::from(&config)));

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    serve_on(supervisor, listener, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal, stopping server");
    })
    .await
}

/// Run the full lifecycle on a pre-bound listener, serving until `shutdown`
/// resolves.
///
/// Startup failures are reported and logged but never prevent the server
/// from accepting requests.
pub async fn serve_on<F>(
    supervisor: Arc<Supervisor>,
    listener: tokio::net::TcpListener,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let report = supervisor.on_process_start().await;
    if !report.is_clean() {
        for failed in report.failures() {
            tracing::warn!(step = %failed.step, outcome = ?failed.outcome, "degraded after startup");
        }
    }

    let actual_port = listener.local_addr()?.port();
    tracing::info!("Borg UI server listening on http://localhost:{actual_port}");

    let app = build_router(supervisor.clone());
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    let stopped = supervisor.on_process_stop().await;
    if !stopped.failures.is_empty() || !stopped.timed_out.is_empty() {
        tracing::warn!(
            failed = stopped.failures.len(),
            timed_out = stopped.timed_out.len(),
            "background tasks did not stop cleanly"
        );
    }
    served?;
    Ok(())
}
