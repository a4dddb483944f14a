//! Axum JSON surface: run history, metrics and the on-demand property trigger.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use calsync_reconcile::{maybe_build_scheduler, AppContext, CounterMetrics, ReconciliationEngine};
use calsync_storage::RunStore;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "calsync-web";

const DEFAULT_RUNS_LIMIT: usize = 50;
const MAX_RUNS_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,
    pub runs: Arc<dyn RunStore>,
    pub metrics: Arc<CounterMetrics>,
}

impl AppState {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        runs: Arc<dyn RunStore>,
        metrics: Arc<CounterMetrics>,
    ) -> Self {
        Self {
            engine,
            runs,
            metrics,
        }
    }

    pub fn from_context(ctx: &AppContext) -> Self {
        Self::new(
            Arc::clone(&ctx.engine),
            Arc::clone(&ctx.runs),
            Arc::clone(&ctx.metrics),
        )
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/runs", get(runs_handler))
        .route("/metrics", get(metrics_handler))
        .route("/properties/{id}/reconcile", post(reconcile_property_handler))
        .with_state(Arc::new(state))
}

/// Serves the API and, when enabled, runs the reconciliation schedule in
/// the same process.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("CALSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let ctx = AppContext::from_env().await?;

    let mut scheduler = maybe_build_scheduler(Arc::clone(&ctx.engine), &ctx.config).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %ctx.config.reconcile_cron, "reconciliation scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving reconciliation API");
    axum::serve(listener, app(AppState::from_context(&ctx)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await?;
    }
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": CRATE_NAME }))
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RUNS_LIMIT)
        .clamp(1, MAX_RUNS_LIMIT);
    match state.runs.recent(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.metrics.snapshot()).into_response()
}

async fn reconcile_property_handler(
    State(state): State<Arc<AppState>>,
    Path(property_id): Path<Uuid>,
) -> Response {
    match state.engine.reconcile_property(property_id).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use axum::body::Body;
    use axum::http::{header, Request};
    use calsync_channels::{ConnectorRegistry, FixtureConnector};
    use calsync_core::{ChannelDay, ChannelMapping};
    use calsync_reconcile::{EngineConfig, Stores};
    use calsync_storage::{InMemoryCalendarStore, InMemoryMappingStore, InMemoryRunStore};
    use chrono::{Days, Utc};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Fixture {
        state: AppState,
        property_id: Uuid,
    }

    fn fixture() -> Fixture {
        let property_id = Uuid::new_v4();
        let mapping = ChannelMapping {
            id: Uuid::new_v4(),
            channel_name: "demo".into(),
            internal_property_id: property_id,
            external_id: "demo-1".into(),
            organization_id: Uuid::new_v4(),
        };
        let today = Utc::now().date_naive();
        let days = (0..5u64)
            .map(|offset| ChannelDay {
                date: today.checked_add_days(Days::new(offset)).unwrap(),
                raw_status: Some(if offset == 2 { "BOOKED" } else { "OPEN" }.into()),
                price: None,
            })
            .collect();
        let connector = FixtureConnector::new("demo", HashMap::from([("demo-1".to_string(), days)]));

        let runs = Arc::new(InMemoryRunStore::default());
        let metrics = Arc::new(CounterMetrics::default());
        let engine = ReconciliationEngine::new(
            EngineConfig::default(),
            ConnectorRegistry::new().with(Arc::new(connector)),
            Stores {
                calendars: Arc::new(InMemoryCalendarStore::default()),
                mappings: Arc::new(InMemoryMappingStore::with_mappings([mapping])),
                runs: runs.clone(),
            },
        )
        .with_sinks(
            metrics.clone(),
            Arc::new(calsync_storage::InMemoryAuditLog::default()),
            Arc::new(calsync_reconcile::LogNotifier),
        );

        Fixture {
            state: AppState::new(Arc::new(engine), runs, metrics),
            property_id,
        }
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app(fixture().state);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn property_trigger_records_a_run() {
        let fx = fixture();
        let app = app(fx.state);

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/properties/{}/reconcile", fx.property_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let outcome = body_json(resp).await;
        assert_eq!(outcome["runs"].as_array().unwrap().len(), 1);
        assert_eq!(outcome["runs"][0]["status"], "DIVERGENCE");
        assert_eq!(outcome["runs"][0]["discrepancies_fixed"], 1);

        let runs = app
            .clone()
            .oneshot(Request::builder().uri("/runs?limit=5").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(runs.status(), StatusCode::OK);
        let runs = body_json(runs).await;
        assert_eq!(runs.as_array().unwrap().len(), 1);
        assert_eq!(runs[0]["status"], "DIVERGENCE");

        let metrics = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let metrics = body_json(metrics).await;
        assert_eq!(metrics["reconciliation_runs"], 1);
        assert_eq!(metrics["reconciliation_discrepancies"], 1);
        assert_eq!(metrics["reconciliation_fixes"], 1);
    }

    #[tokio::test]
    async fn unmapped_property_is_a_noop() {
        let app = app(fixture().state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/properties/{}/reconcile", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let outcome = body_json(resp).await;
        assert_eq!(outcome["mappings"], 0);
        assert!(outcome["runs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_property_id_is_rejected() {
        let app = app(fixture().state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/properties/not-a-uuid/reconcile")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
