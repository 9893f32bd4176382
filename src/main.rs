use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod extract;
mod git;
mod history;
mod models;
mod monitor;
mod registry;
mod results;
mod s3;
#[cfg(test)]
mod test_support;

use config::{MonitorConfig, MonitorOverrides, ServiceConfig};
use error::{ConfigError, SetupError};
use models::{ArtifactDescriptor, ChangeRecord};
use monitor::Monitor;
use registry::MonitorRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<MonitorRegistry>,
    pub defaults: Arc<MonitorConfig>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::from_env()?;
    let defaults = &config.default_monitor;
    tracing::info!(
        "Repository: {}",
        if defaults.is_remote() {
            defaults.repo_url.clone()
        } else {
            format!("working copy at {}", defaults.local_path.display())
        }
    );
    tracing::info!("Branch: {}", defaults.branch);
    tracing::info!("Monitor interval: {:?}", defaults.poll_interval);
    tracing::info!(
        "Tracked files: {}",
        defaults
            .tracked_files
            .iter()
            .map(|f| f.path.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    match &defaults.results {
        Some(results) => tracing::info!("Result store bucket: {}", results.bucket),
        None => tracing::info!("No result store configured, skipping evaluation lookups"),
    }

    let registry = Arc::new(MonitorRegistry::new());
    registry.get_or_create(defaults.clone()).await?;

    let state = AppState {
        registry: registry.clone(),
        defaults: Arc::new(config.default_monitor.clone()),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!("Prompt tracker listening on {}", config.bind_address);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.shutdown_all().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/changes", get(get_changes))
        .route("/api/refresh", get(refresh_changes).post(refresh_changes))
        .route("/api/results/:commit", get(results_for_commit))
        .route("/api/results/:commit/:usecase", get(result_report))
        .route("/api/monitors", axum::routing::delete(stop_monitor))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type ApiError = (StatusCode, String);

fn config_error(e: ConfigError) -> ApiError {
    (StatusCode::BAD_REQUEST, e.to_string())
}

fn setup_error(e: SetupError) -> ApiError {
    tracing::error!("Monitor setup failed: {}", e);
    (StatusCode::BAD_GATEWAY, e.to_string())
}

async fn monitor_for(state: &AppState, overrides: &MonitorOverrides) -> Result<Arc<Monitor>, ApiError> {
    let config = state.defaults.with_overrides(overrides).map_err(config_error)?;
    state.registry.get_or_create(config).await.map_err(setup_error)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "monitors": state.registry.len().await,
    }))
}

async fn get_changes(
    State(state): State<AppState>,
    Query(overrides): Query<MonitorOverrides>,
) -> Result<Json<Vec<ChangeRecord>>, ApiError> {
    let monitor = monitor_for(&state, &overrides).await?;
    let history = monitor.history().await;
    Ok(Json(history.as_ref().clone()))
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub status: &'static str,
    pub count: usize,
    pub results_updated: usize,
}

async fn refresh_changes(
    State(state): State<AppState>,
    Query(overrides): Query<MonitorOverrides>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let monitor = monitor_for(&state, &overrides).await?;
    let summary = monitor.trigger_refresh().await;
    Ok(Json(RefreshResponse {
        status: "refreshed",
        count: summary.refreshed_count,
        results_updated: summary.results_updated,
    }))
}

async fn results_for_commit(
    State(state): State<AppState>,
    Path(commit): Path<String>,
    Query(overrides): Query<MonitorOverrides>,
) -> Result<Json<Vec<ArtifactDescriptor>>, ApiError> {
    let monitor = monitor_for(&state, &overrides).await?;
    let artifacts = match monitor.results() {
        Some(results) => results.list_for_commit(&commit).await,
        None => Vec::new(),
    };
    Ok(Json(artifacts))
}

async fn result_report(
    State(state): State<AppState>,
    Path((commit, usecase)): Path<(String, String)>,
    Query(overrides): Query<MonitorOverrides>,
) -> Result<Response, ApiError> {
    let monitor = monitor_for(&state, &overrides).await?;
    let Some(results) = monitor.results() else {
        return Err((StatusCode::NOT_FOUND, "no result store configured".into()));
    };
    match results.report(&commit, &usecase).await {
        Some(body) => Ok(([(header::CONTENT_TYPE, "text/html; charset=utf-8")], body).into_response()),
        None => Err((
            StatusCode::NOT_FOUND,
            format!("no evaluation results for {usecase} at {commit}"),
        )),
    }
}

async fn stop_monitor(
    State(state): State<AppState>,
    Query(overrides): Query<MonitorOverrides>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let config = state.defaults.with_overrides(&overrides).map_err(config_error)?;
    let key = config.key();
    let stopped = state.registry.shutdown(&key).await;
    Ok(Json(serde_json::json!({
        "key": key,
        "status": if stopped { "stopped" } else { "not_found" },
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{commit_files, head_branch, init_repo, monitor_config};
    use axum::body::Body;
    use axum::http::Request;
    use git2::Repository;
    use tower::ServiceExt;

    struct Harness {
        _origin: tempfile::TempDir,
        _work: tempfile::TempDir,
        state: AppState,
    }

    fn harness() -> Harness {
        let origin = init_repo();
        let repo = Repository::open(origin.path()).unwrap();
        commit_files(
            &repo,
            &[(
                "chart/values-test.yaml",
                r#"{"summarize": {"model": "m1", "prompt": "p1", "enabled": true}}"#,
            )],
            1_000,
        );
        let branch = head_branch(&repo);
        let work = tempfile::tempdir().unwrap();
        let defaults = monitor_config(origin.path(), work.path(), &branch);
        Harness {
            _origin: origin,
            _work: work,
            state: AppState {
                registry: Arc::new(MonitorRegistry::new()),
                defaults: Arc::new(defaults),
            },
        }
    }

    async fn call(state: &AppState, method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app(state.clone())
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_health() {
        let harness = harness();
        let (status, body) = call(&harness.state, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_changes_and_refresh() {
        let harness = harness();
        let (status, body) = call(&harness.state, "GET", "/api/changes").await;
        assert_eq!(status, StatusCode::OK);
        let changes: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["usecase"], "summarize");
        assert_eq!(changes[0]["environment"], "test");
        assert_eq!(changes[0]["currently_enabled"], true);

        let (status, body) = call(&harness.state, "POST", "/api/refresh").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "refreshed");
        assert_eq!(json["count"], 1);
        assert_eq!(json["results_updated"], 0);

        let (status, _) = call(&harness.state, "GET", "/api/results/abc123").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&harness.state, "GET", "/api/results/abc123/summarize").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&harness.state, "DELETE", "/api/monitors").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "stopped");
    }

    #[tokio::test]
    async fn test_invalid_overrides_are_rejected() {
        let harness = harness();
        let (status, _) = call(&harness.state, "GET", "/api/changes?monitor_interval=soon").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unreachable_repository_is_bad_gateway() {
        let harness = harness();
        let (status, _) = call(
            &harness.state,
            "GET",
            "/api/changes?git_repo_url=%2Fno%2Fsuch%2Frepo",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }
}
