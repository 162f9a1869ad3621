//! Alert Manager Process
//!
//! Wires the handler, suppression, aggregation and notification engines
//! together and exposes them over a REST API.

use alert_model::{IncomingAlert, SharedCatalog, Status};
use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use handler::AlertHandler;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use notifier::{Notifier, NotifyStage, OutputRegistry};
use pipeline::{Forwarder, Pipeline, Shutdown};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use storage::{with_tx, MemoryStore, Store};
use suppression::{Inhibitor, SuppressionEngine};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod error;
mod routes;
mod settings;

pub use error::ApiError;
pub use settings::{Settings, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};

use aggregation::AggregationEngine;

/// Application state shared across handlers
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub catalog: SharedCatalog,
    pub handler: Arc<AlertHandler>,
    pub suppressor: Arc<SuppressionEngine>,
    /// Ingestion queue drained by the handler
    pub ingest: mpsc::Sender<IncomingAlert>,
    /// Prometheus recorder, when installed
    pub metrics: Option<PrometheusHandle>,
    /// Settings file re-read on reload
    pub config_path: String,
    /// Version string
    pub version: String,
    /// Start time
    pub start_time: std::time::Instant,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: i64,
    pub version: String,
    pub uptime_seconds: u64,
    pub open_alerts: usize,
    pub suppression_rules: usize,
}

/// Reload response
#[derive(Debug, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub suppression_rules: usize,
    pub new_teams: usize,
}

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/api/v1/alerts",
            get(routes::alerts::list_alerts).post(routes::alerts::post_alert),
        )
        .route("/api/v1/alerts/:id", get(routes::alerts::get_alert))
        .route("/api/v1/alerts/:id/history", get(routes::alerts::get_history))
        .route("/api/v1/alerts/:id/suppress", post(routes::alerts::suppress_alert))
        .route("/api/v1/alerts/:id/unsuppress", post(routes::alerts::unsuppress_alert))
        .route("/api/v1/alerts/:id/ack", post(routes::alerts::ack_alert))
        .route("/api/v1/alerts/:id/clear", post(routes::alerts::clear_alert))
        .route("/api/v1/alerts/:id/escalate", post(routes::alerts::escalate_alert))
        .route(
            "/api/v1/rules",
            get(routes::rules::list_rules).post(routes::rules::create_rule),
        )
        .route("/api/v1/rules/:id", delete(routes::rules::delete_rule))
        .route("/api/v1/reload", post(reload_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, ApiError> {
    let open_alerts = with_tx(state.store.as_ref(), |tx| {
        tx.alerts_by_status(&[Status::Active, Status::Suppressed])
    })?
    .len();

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now().timestamp(),
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        open_alerts,
        suppression_rules: state.suppressor.rules().len(),
    }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed".to_string()),
    }
}

/// Re-read the settings file and swap in its catalog
async fn reload_handler(State(state): State<Arc<AppState>>) -> Result<Json<ReloadResponse>, ApiError> {
    let settings = Settings::load_from(&state.config_path)
        .map_err(|e| ApiError::BadRequest(format!("invalid configuration: {}", e)))?;
    state.catalog.replace(settings.catalog);

    let suppression_rules = state.suppressor.refresh(Utc::now())?;
    let new_teams = state.handler.load_teams()?;
    info!("Configuration reloaded from {}", state.config_path);
    Ok(Json(ReloadResponse {
        suppression_rules,
        new_teams,
    }))
}

/// Initialize logging
pub fn init_logging(settings: &Settings) -> anyhow::Result<()> {
    let level: Level = settings
        .log_level
        .parse()
        .with_context(|| format!("invalid log level {:?}", settings.log_level))?;

    if settings.log_json {
        let subscriber = FmtSubscriber::builder()
            .json()
            .with_max_level(level)
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .context("failed to set tracing subscriber")?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .context("failed to set tracing subscriber")?;
    }
    Ok(())
}

/// Install the global Prometheus recorder
pub fn install_metrics() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")
}

/// Every running engine and worker of the process
pub struct Runtime {
    state: Arc<AppState>,
    shutdown: Shutdown,
    workers: Vec<JoinHandle<()>>,
    pipeline: Pipeline,
}

impl Runtime {
    /// Build the engines, load the directory and start every worker
    pub fn start(
        settings: Settings,
        config_path: impl Into<String>,
        metrics: Option<PrometheusHandle>,
    ) -> anyhow::Result<Self> {
        let now = Utc::now();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let catalog = SharedCatalog::new(settings.catalog.clone());
        let shutdown = Shutdown::new();

        let suppressor = Arc::new(SuppressionEngine::new(store.clone(), catalog.clone()));
        let rules = suppressor
            .refresh(now)
            .context("failed to load suppression rules")?;

        let notifier = Arc::new(Notifier::new(
            store.clone(),
            catalog.clone(),
            OutputRegistry::with_defaults(),
        ));
        notifier.seed(now).context("failed to seed notification state")?;

        let (events_tx, events_rx) = mpsc::channel(settings.queue_capacity.max(1));
        let handler = Arc::new(AlertHandler::new(
            store.clone(),
            catalog.clone(),
            suppressor.clone(),
            Forwarder::new(events_tx),
        ));
        handler.load_teams().context("failed to load team directory")?;

        let pipeline = Pipeline::builder()
            .stage(Arc::new(AggregationEngine::new(
                store.clone(),
                catalog.clone(),
                shutdown.clone(),
            )))
            .stage(Arc::new(Inhibitor::new(
                store.clone(),
                catalog.clone(),
                suppressor.clone(),
            )))
            .stage(Arc::new(NotifyStage::new(notifier.clone())))
            .capacity(settings.queue_capacity)
            .start(events_rx, &shutdown);

        let (ingest, ingest_rx) = mpsc::channel(settings.queue_capacity.max(1));
        let workers = vec![
            tokio::spawn(handler.clone().run(ingest_rx, shutdown.subscribe())),
            tokio::spawn(
                handler
                    .clone()
                    .run_expiry(settings.expiry_interval(), shutdown.subscribe()),
            ),
            tokio::spawn(
                handler
                    .clone()
                    .run_escalation(settings.escalation_interval(), shutdown.subscribe()),
            ),
            tokio::spawn(
                suppressor
                    .clone()
                    .run_refresh(settings.rule_refresh_interval(), shutdown.subscribe()),
            ),
            tokio::spawn(
                notifier
                    .clone()
                    .run_reminders(settings.remind_interval(), shutdown.subscribe()),
            ),
        ];
        info!(
            "Runtime started: {} suppression rules, stages {:?}",
            rules,
            pipeline.stage_names()
        );

        let state = Arc::new(AppState {
            store,
            catalog,
            handler,
            suppressor,
            ingest,
            metrics,
            config_path: config_path.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: std::time::Instant::now(),
        });

        Ok(Self {
            state,
            shutdown,
            workers,
            pipeline,
        })
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Signal shutdown and wait for every worker and pipeline stage
    pub async fn stop(self) {
        self.shutdown.trigger();
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!("Worker ended abnormally: {}", e);
            }
        }
        self.pipeline.join().await;
        info!("Runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alert_model::{Alert, AlertConfig, Catalog, SuppressionRule};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn start(catalog: Catalog) -> Runtime {
        let settings = Settings {
            catalog,
            ..Settings::default()
        };
        Runtime::start(settings, "/nonexistent/alertmgr.toml", None).unwrap()
    }

    async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn wait_for_alert(router: &Router) -> Alert {
        for _ in 0..100 {
            let (_, body) = call(router, Method::GET, "/api/v1/alerts", None).await;
            if let Some(first) = body["data"].as_array().and_then(|a| a.first()) {
                return serde_json::from_value(first.clone()).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("alert never ingested");
    }

    fn bgp_down() -> Value {
        json!({
            "name": "bgp_down",
            "entity": "peer 10.0.0.1",
            "device": "rtr1",
            "severity": "warn",
            "status": "alerting",
        })
    }

    #[tokio::test]
    async fn test_health() {
        let runtime = start(Catalog::default());
        let (status, body) = call(&runtime.router(), Method::GET, "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["open_alerts"], 0);
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let runtime = start(Catalog::default());
        let (status, _) = call(&runtime.router(), Method::GET, "/metrics", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_post_alert_is_ingested() {
        let runtime = start(Catalog::default());
        let router = runtime.router();

        let (status, _) = call(&router, Method::POST, "/api/v1/alerts", Some(bgp_down())).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let alert = wait_for_alert(&router).await;
        assert_eq!(alert.name, "bgp_down");
        assert_eq!(alert.status, Status::Active);

        let (status, body) = call(&router, Method::GET, &format!("/api/v1/alerts/{}", alert.id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["entity"], "peer 10.0.0.1");

        let (status, body) = call(
            &router,
            Method::GET,
            &format!("/api/v1/alerts/{}/history", alert.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.as_array().unwrap().is_empty());
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_post_alert_requires_identity() {
        let runtime = start(Catalog::default());
        let mut body = bgp_down();
        body["entity"] = json!("  ");
        let (status, _) = call(&runtime.router(), Method::POST, "/api/v1/alerts", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_alert_is_not_found() {
        let runtime = start(Catalog::default());
        let (status, body) = call(&runtime.router(), Method::GET, "/api/v1/alerts/42", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_suppress_ack_and_clear() {
        let runtime = start(Catalog::default());
        let router = runtime.router();
        call(&router, Method::POST, "/api/v1/alerts", Some(bgp_down())).await;
        let alert = wait_for_alert(&router).await;

        let (status, body) = call(
            &router,
            Method::POST,
            &format!("/api/v1/alerts/{}/suppress", alert.id),
            Some(json!({"creator": "ops", "reason": "maintenance", "duration_secs": 600})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "suppressed");

        let (status, body) = call(
            &router,
            Method::POST,
            &format!("/api/v1/alerts/{}/unsuppress", alert.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");

        // unsuppressing an active alert is rejected by policy
        let (status, _) = call(
            &router,
            Method::POST,
            &format!("/api/v1/alerts/{}/unsuppress", alert.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(
            &router,
            Method::POST,
            &format!("/api/v1/alerts/{}/ack", alert.id),
            Some(json!({"owner": "alice"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["owner"], "alice");

        let (status, body) = call(
            &router,
            Method::POST,
            &format!("/api/v1/alerts/{}/clear", alert.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cleared");

        let (_, body) = call(&router, Method::GET, "/api/v1/alerts?status=cleared", None).await;
        assert_eq!(body["count"], 1);
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_ack_unknown_team_conflicts() {
        let runtime = start(Catalog::default());
        let router = runtime.router();
        call(&router, Method::POST, "/api/v1/alerts", Some(bgp_down())).await;
        let alert = wait_for_alert(&router).await;

        let (status, _) = call(
            &router,
            Method::POST,
            &format!("/api/v1/alerts/{}/ack", alert.id),
            Some(json!({"owner": "alice", "team": "nobody"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_escalate() {
        let mut catalog = Catalog::default();
        catalog.alerts.push(AlertConfig::named("bgp_down"));
        let runtime = start(catalog);
        let router = runtime.router();
        call(&router, Method::POST, "/api/v1/alerts", Some(bgp_down())).await;
        let alert = wait_for_alert(&router).await;

        let (status, body) = call(
            &router,
            Method::POST,
            &format!("/api/v1/alerts/{}/escalate", alert.id),
            Some(json!({"severity": "critical"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["severity"], "critical");
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_rule_lifecycle() {
        let runtime = start(Catalog::default());
        let router = runtime.router();

        let (status, body) = call(
            &router,
            Method::POST,
            "/api/v1/rules",
            Some(json!({
                "name": "rtr1 maintenance",
                "matches": {"device": "rtr1"},
                "duration_secs": 3600,
                "creator": "ops",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let rule: SuppressionRule = serde_json::from_value(body).unwrap();
        assert!(rule.id > 0);

        // the matching alert is dropped, the one queued after it is kept
        call(&router, Method::POST, "/api/v1/alerts", Some(bgp_down())).await;
        let mut other = bgp_down();
        other["device"] = json!("rtr2");
        call(&router, Method::POST, "/api/v1/alerts", Some(other)).await;
        let alert = wait_for_alert(&router).await;
        assert_eq!(alert.device.as_deref(), Some("rtr2"));
        let (_, body) = call(&router, Method::GET, "/api/v1/alerts", None).await;
        assert_eq!(body["count"], 1);

        let (_, body) = call(&router, Method::GET, "/api/v1/rules", None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = call(&router, Method::DELETE, &format!("/api/v1/rules/{}", rule.id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, body) = call(&router, Method::GET, "/api/v1/rules", None).await;
        assert!(body.as_array().unwrap().is_empty());
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_rule_requires_matches() {
        let runtime = start(Catalog::default());
        let (status, _) = call(
            &runtime.router(),
            Method::POST,
            "/api/v1/rules",
            Some(json!({"name": "empty", "matches": {}, "duration_secs": 60})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_reload_without_file_keeps_defaults() {
        let runtime = start(Catalog::default());
        let (status, body) = call(&runtime.router(), Method::POST, "/api/v1/reload", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["suppression_rules"], 0);
        runtime.stop().await;
    }
}
