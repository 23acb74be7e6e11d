use crate::config::ProxyConfig;
use crate::credentials::extract_api_key;
use crate::error::{ProxyError, Result};
use crate::fetch::{DisabledImageFetcher, HttpImageFetcher, ImageFetcher};
use crate::forwarder::{strip_hop_by_hop, Forwarder, UpstreamResponse, UpstreamStream};
use crate::logging::{RequestLogger, SharedLogger};
use crate::models::ModelResolver;
use crate::proxy::{self, ProxyResult};
use crate::translate::openai_types::{ChatCompletionRequest, ChatErrorResponse};

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: ProxyConfig,
    pub forwarder: Forwarder,
    pub images: Arc<dyn ImageFetcher>,
    pub models: ModelResolver,
    pub logger: SharedLogger,
}

impl AppState {
    /// Build the shared state once at startup. All upstream calls, image
    /// fetches included, share one connection pool.
    pub fn from_config(config: ProxyConfig, logger: SharedLogger) -> Result<Self> {
        let client = Forwarder::build_client(&config.upstream)?;
        let images: Arc<dyn ImageFetcher> = if config.images.fetch_remote {
            Arc::new(HttpImageFetcher::new(
                client.clone(),
                Duration::from_secs(config.images.timeout_secs),
            ))
        } else {
            Arc::new(DisabledImageFetcher)
        };

        Ok(Self {
            forwarder: Forwarder::new(client, &config.upstream),
            images,
            models: ModelResolver::new(&config.models),
            config,
            logger,
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = DefaultBodyLimit::max(state.config.max_body_bytes);

    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/models", get(handle_models))
        .route("/v1beta/*path", any(handle_native))
        .route("/health", get(handle_health))
        .layer(body_limit)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Response {
    let log = new_request_logger(&state);

    let req: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            log.error("server", format!("Failed to parse request: {}", e));
            return error_response(&ProxyError::malformed(format!("Invalid request body: {}", e)));
        }
    };

    let Some(api_key) = request_api_key(&state, &headers, &query) else {
        log.warn("server", "Request without API key");
        return error_response(&ProxyError::MissingCredential);
    };

    let is_streaming = req.is_streaming();

    log.info(
        "server",
        format!(
            "Request: model={} streaming={} messages={}",
            req.model,
            is_streaming,
            req.messages.len()
        ),
    );

    if is_streaming {
        handle_streaming(&state, &req, &api_key, &log).await
    } else {
        handle_non_streaming(&state, &req, &api_key, &log).await
    }
}

async fn handle_non_streaming(
    state: &AppState,
    req: &ChatCompletionRequest,
    api_key: &str,
    log: &RequestLogger,
) -> Response {
    match proxy::proxy_chat_completion(req, api_key, state, log).await {
        Ok(ProxyResult::Success(resp)) => Json(resp).into_response(),
        Ok(ProxyResult::Upstream(upstream)) => relay_buffered(upstream),
        Err(e) => {
            log.error("server", format!("Proxy error: {}", e));
            error_response(&e)
        }
    }
}

async fn handle_streaming(
    state: &AppState,
    req: &ChatCompletionRequest,
    api_key: &str,
    log: &RequestLogger,
) -> Response {
    let frames = match proxy::proxy_chat_completion_stream(req, api_key, state, log).await {
        Ok(s) => s,
        Err(e) => {
            log.error("server", format!("Streaming setup error: {}", e));
            return error_response(&e);
        }
    };

    let event_stream =
        frames.map(|frame| -> std::result::Result<Event, Infallible> { Ok(Event::default().data(frame.data())) });

    Sse::new(event_stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn handle_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
) -> Response {
    let log = new_request_logger(&state);
    let Some(api_key) = request_api_key(&state, &headers, &query) else {
        return error_response(&ProxyError::MissingCredential);
    };

    match proxy::proxy_list_models(&api_key, &state, &log).await {
        Ok(ProxyResult::Success(list)) => Json(list).into_response(),
        Ok(ProxyResult::Upstream(upstream)) => relay_buffered(upstream),
        Err(e) => {
            log.error("server", format!("Model listing error: {}", e));
            error_response(&e)
        }
    }
}

/// Native Gemini surface. `GET /v1beta/models` gets its own key handling;
/// everything else is relayed as-is.
async fn handle_native(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(path): Path<String>,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Response {
    let log = new_request_logger(&state);
    let path = path.trim_matches('/');

    let result = if method == Method::GET && path == "models" {
        let Some(api_key) = request_api_key(&state, &headers, &query) else {
            return error_response(&ProxyError::MissingCredential);
        };
        proxy::proxy_native_models(&api_key, &query, &state, &log).await
    } else {
        proxy::proxy_passthrough(method, path, &headers, &query, body, &state, &log).await
    };

    match result {
        Ok(upstream) => relay_streamed(upstream),
        Err(e) => {
            log.error("server", format!("Passthrough error: {}", e));
            error_response(&e)
        }
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn new_request_logger(state: &AppState) -> RequestLogger {
    state.logger.for_request(uuid::Uuid::new_v4().to_string())
}

fn request_api_key(state: &AppState, headers: &HeaderMap, query: &[(String, String)]) -> Option<String> {
    extract_api_key(headers, query).or_else(|| state.config.fallback_api_key())
}

/// `OpenAI`-shaped error body with the status the error maps to.
fn error_response(err: &ProxyError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ChatErrorResponse::new(err.error_type(), err.to_string());
    (status, Json(body)).into_response()
}

fn upstream_status(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
}

fn relay_buffered(upstream: UpstreamResponse) -> Response {
    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream_status(upstream.status);
    *response.headers_mut() = strip_hop_by_hop(&upstream.headers);
    response
}

fn relay_streamed(upstream: UpstreamStream) -> Response {
    let mut response = Response::new(Body::from_stream(upstream.body));
    *response.status_mut() = upstream_status(upstream.status);
    *response.headers_mut() = strip_hop_by_hop(&upstream.headers);
    response
}
