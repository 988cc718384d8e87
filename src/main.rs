mod config;
mod http;
mod llm;
mod metrics;
mod models;
mod olx;
mod pipeline;
mod source;
#[cfg(test)]
mod testing;

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderName, StatusCode, header::CONTENT_TYPE},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use config::Settings;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, Message, RunRequest};
use olx::OlxClient;
use pipeline::events::StreamModes;
use pipeline::state::PipelineState;
use pipeline::{Pipeline, PipelineError, PipelineErrorKind, RunStream};
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio_stream::StreamExt;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let settings = Settings::from_env()?;
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;

    let llm = llm::from_settings(&settings.llm, &settings.http);
    let source = Arc::new(OlxClient::new(settings.olx.clone(), &settings.http));
    let pipeline = Pipeline::new(settings.pipeline.clone(), llm, source);

    let state = AppState {
        pipeline,
        openapi: Arc::new(load_openapi()),
        prometheus_handle,
        metrics_key: settings.metrics_key.clone(),
        docs_key: settings.docs_key.clone(),
    };
    let app = router(state).layer(DefaultBodyLimit::max(settings.request_max_bytes));

    let addr: SocketAddr = ([0, 0, 0, 0], settings.port).into();
    info!(target = "deal_finder.api", "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<String>,
    docs_key: Option<String>,
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/invoke", post(invoke))
        .route("/stream", post(stream_values))
        .route("/stream/progress", post(stream_progress))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn load_openapi() -> serde_json::Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({"openapi": "3.0.3"}))
}

/// Liveness check.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "deal-finder",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Some(key) = &state.docs_key {
        if presented(&headers, "X-Docs-Key") != key.as_str() {
            return Err(AppError::Unauthorized);
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Deal Finder API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#,
    )
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key {
        if presented(&headers, "X-Metrics-Key") != secret.as_str() {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

fn presented<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

#[derive(Debug, Serialize)]
struct InvokeResponse {
    message: Option<String>,
    state: PipelineState,
}

/// Run the deal-finder pipeline to completion.
///
/// - Method: `POST`
/// - Path: `/invoke`
/// - Body: `{ "messages": [{ "role" | "type", "content" }] }`
/// - Response: the final assistant message plus the full final state
async fn invoke(
    State(state): State<AppState>,
    Json(payload): Json<RunRequest>,
) -> Result<Json<InvokeResponse>, AppError> {
    crate::metrics::inc_requests("/invoke");
    let conversation = conversation_from(payload)?;
    info!(target = "deal_finder.api", turns = conversation.len(), "invoke_requested");

    let final_state = state.pipeline.invoke(conversation).await?;
    let message = final_state
        .last_assistant_message()
        .map(|m| m.content.clone());
    Ok(Json(InvokeResponse {
        message,
        state: final_state,
    }))
}

/// NDJSON stream of full-state snapshots, one per committed stage.
async fn stream_values(
    State(state): State<AppState>,
    Json(payload): Json<RunRequest>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/stream");
    let conversation = conversation_from(payload)?;
    Ok(ndjson(
        state.pipeline.stream(conversation, StreamModes::values()),
    ))
}

/// NDJSON stream of progress notices and per-stage patches.
async fn stream_progress(
    State(state): State<AppState>,
    Json(payload): Json<RunRequest>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/stream/progress");
    let conversation = conversation_from(payload)?;
    Ok(ndjson(
        state
            .pipeline
            .stream(conversation, StreamModes::progress_and_updates()),
    ))
}

fn conversation_from(payload: RunRequest) -> Result<Vec<Message>, AppError> {
    let conversation = payload.into_conversation();
    if conversation.is_empty() {
        return Err(AppError::Pipeline(PipelineError::validation(
            "request",
            "messages must not be empty",
        )));
    }
    Ok(conversation)
}

// The body owns the run stream; a client disconnect drops it and cancels the run.
fn ndjson(run: RunStream) -> Response {
    let run_id = run.run_id();
    info!(target = "deal_finder.api", run_id = %run_id, "stream_opened");
    let lines = run.map(move |envelope| {
        if envelope.event.is_terminal() {
            debug!(
                target = "deal_finder.api",
                run_id = %run_id,
                seq = envelope.seq,
                "stream_finished"
            );
        }
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');
        Ok::<_, serde_json::Error>(line)
    });
    (
        [
            (CONTENT_TYPE, "application/x-ndjson".to_string()),
            (HeaderName::from_static("x-run-id"), run_id.to_string()),
        ],
        Body::from_stream(lines),
    )
        .into_response()
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    Unauthorized,
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        AppError::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::Validation => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Adapter => StatusCode::BAD_GATEWAY,
                    PipelineErrorKind::Aborted => StatusCode::SERVICE_UNAVAILABLE,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(ApiError {
                    error: "unauthorized".into(),
                    detail: None,
                }),
            )
                .into_response(),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .and_then(|level| EnvFilter::try_new(level).ok())
        })
        .unwrap_or_else(|| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
