//! Axum trigger and progress surface for HOTREEL scrape jobs.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use hotreel_core::{ProgressKind, ScrapeConfig, DEFAULT_UPDATE_INTERVAL_MINUTES};
use hotreel_engine::{Orchestrator, StartError};
use hotreel_storage::{list_stored_runs, DEFAULT_PRIMARY_PREFIX};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "hotreel-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

/// Start request as sent by the scrape page.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub video_count: u32,
    #[serde(default)]
    pub headless_mode: bool,
    #[serde(default)]
    pub is_auto_update: bool,
    #[serde(default)]
    pub update_interval: Option<u32>,
}

impl From<StartRequest> for ScrapeConfig {
    fn from(req: StartRequest) -> Self {
        ScrapeConfig {
            item_count: req.video_count,
            headless: req.headless_mode,
            auto_update: req.is_auto_update,
            update_interval_minutes: req
                .update_interval
                .or_else(|| req.is_auto_update.then_some(DEFAULT_UPDATE_INTERVAL_MINUTES)),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    job_id: String,
}

#[derive(Debug, Serialize)]
struct StopResponse {
    stopping: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/scrape/start", post(start_handler))
        .route("/api/scrape/stop", post(stop_handler))
        .route("/api/scrape/status", get(status_handler))
        .route("/api/scrape/events", get(events_handler))
        .route("/api/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(orchestrator: Orchestrator) -> anyhow::Result<()> {
    let port = orchestrator.config().web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving scrape api");
    axum::serve(listener, app(AppState::new(orchestrator))).await?;
    Ok(())
}

async fn start_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartRequest>,
) -> Response {
    match state.orchestrator.start(req.into()).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(StartResponse {
                job_id: job_id.to_string(),
            }),
        )
            .into_response(),
        Err(err @ StartError::Invalid(_)) => error_response(StatusCode::BAD_REQUEST, &err),
        Err(err @ StartError::AlreadyRunning(_)) => error_response(StatusCode::CONFLICT, &err),
    }
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> Response {
    let stopping = state.orchestrator.stop().await;
    Json(StopResponse { stopping }).into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.orchestrator.status().await).into_response()
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.orchestrator.subscribe()).filter_map(|item| {
        let event = match item {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "progress subscriber lagged");
                return None;
            }
        };
        let name = match event.kind {
            ProgressKind::Update => "update_progress",
            ProgressKind::Finished { .. } => "scraping_complete",
        };
        match Event::default().event(name).json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(err) => {
                warn!(error = %err, "could not encode progress event");
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn runs_handler(State(state): State<Arc<AppState>>) -> Response {
    let data_dir = state.orchestrator.config().data_dir.clone();
    let listed =
        tokio::task::spawn_blocking(move || list_stored_runs(&data_dir, DEFAULT_PRIMARY_PREFIX))
            .await;
    match listed {
        Ok(Ok(runs)) => Json(runs).into_response(),
        Ok(Err(err)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err),
    }
}

fn error_response(status: StatusCode, err: &dyn std::fmt::Display) -> Response {
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}
