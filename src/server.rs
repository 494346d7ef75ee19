use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::{self, AppState};
use crate::config::SelfHealConfig;
use crate::jobs::{Collaborators, build_scheduler};
use crate::store::{DbHandle, PipelineDb};

/// Build the full application router: API routes plus request tracing, with
/// permissive CORS in dev mode.
pub fn build_router(state: Arc<AppState>, dev_mode: bool) -> Router {
    let mut app = api::api_router().with_state(state).layer(TraceLayer::new_for_http());
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Open (creating if needed) the pipeline database at `path`.
pub fn open_database(path: &Path) -> Result<DbHandle> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = PipelineDb::new(path)
        .with_context(|| format!("Failed to initialize pipeline database at {}", path.display()))?;
    Ok(DbHandle::new(db))
}

/// Serve the HTTP API and run the scheduler until Ctrl+C.
///
/// On shutdown the listener stops accepting first, then the scheduler drains
/// in-flight runs within its grace period.
pub async fn start_server(config: SelfHealConfig) -> Result<()> {
    let db = open_database(&config.server.db_path)?;
    let collaborators = Collaborators::from_config(&config)?;
    let scheduler = Arc::new(build_scheduler(&config, db.clone(), &collaborators)?);

    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.clone().run_until(shutdown.clone()));

    let state = Arc::new(AppState {
        db,
        scheduler,
        config: Arc::new(config.clone()),
    });
    let app = build_router(state, config.server.dev_mode);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "selfheal API listening");

    let token = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            token.cancel();
        })
        .await
        .context("Server error");

    // The server may also stop on its own error; the scheduler follows it down.
    shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        tracing::error!(error = %e, "scheduler task panicked");
    }
    served?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

/// Resolves on Ctrl+C. If the handler cannot be installed the process keeps
/// running until killed.
pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown requested"),
        Err(e) => {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_router(dev_mode: bool) -> Router {
        let db = DbHandle::new(PipelineDb::new_in_memory().unwrap());
        let scheduler = Scheduler::new(db.clone(), Duration::from_secs(5), Duration::from_secs(1));
        let state = Arc::new(AppState {
            db,
            scheduler: Arc::new(scheduler),
            config: Arc::new(SelfHealConfig::default()),
        });
        build_router(state, dev_mode)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router(false);
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let app = test_router(false);
        let req = Request::builder().uri("/api/bugs").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = test_router(false);
        let req = Request::builder().uri("/dashboard").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dev_mode_answers_cors_preflight() {
        let app = test_router(true);
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/api/bugs")
            .header("origin", "http://localhost:5173")
            .header("access-control-request-method", "GET")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.headers().contains_key("access-control-allow-origin"));
    }

    #[test]
    fn test_open_database_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state/pipeline.db");
        let db = open_database(&path).unwrap();
        assert!(path.exists());
        assert!(db.lock_sync().unwrap().pipeline_stats().unwrap().bugs_by_status.is_empty());
    }
}
