#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

//! HTTP/WebSocket gateway in front of the workbench worker process.
//!
//! Inbound requests are routed to the root page (which drives the session
//! handshake), to local resource lookups, or to the session upgrade that
//! hands the raw connection to the worker. Everything except the root page
//! sits behind the session-cookie gate.

use std::collections::hash_map::Entry;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query as UrlQuery, Request, State};
use axum::http::header::{CONNECTION, CONTENT_TYPE, HOST, SEC_WEBSOCKET_KEY, UPGRADE};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use serde_json::json;
use thiserror::Error;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use workbench_client::{
    CommandLauncher, Query, QueryValue, SessionOptions, WorkerError, WorkerSupervisor,
};

pub mod auth;
pub mod bridge;
pub mod config;
pub mod render;
pub mod settings;
pub mod start_path;

use crate::config::Config;
use crate::settings::{Settings, SettingsStore};
use crate::start_path::{StartPathCandidate, resolve_start_path};

const ROOT_PAGE_TEMPLATE: &str = "workbench.html";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub supervisor: Arc<WorkerSupervisor>,
    pub settings: Arc<SettingsStore>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication required")]
    Unauthorized { redirect_to: Option<String> },
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("{0}")]
    BadRequest(String),
    #[error("no worker available for the session bridge")]
    BridgeUnavailable,
    #[error("{message}")]
    Handshake {
        message: String,
        source: WorkerError,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthorized {
                redirect_to: Some(to),
            } => Redirect::to(&format!("/login?to={to}")).into_response(),
            Self::Unauthorized { redirect_to: None } => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "unauthorized"})),
            )
                .into_response(),
            Self::NotFound => {
                (StatusCode::NOT_FOUND, Json(json!({"error": "not_found"}))).into_response()
            }
            Self::Forbidden => {
                (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"}))).into_response()
            }
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "bad_request", "message": message})),
            )
                .into_response(),
            Self::BridgeUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "bridge_unavailable"})),
            )
                .into_response(),
            Self::Handshake { message, source } => {
                let status = match source {
                    WorkerError::HandshakeTimeout => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::BAD_GATEWAY,
                };
                (
                    status,
                    Json(json!({"error": "workbench_unavailable", "message": message})),
                )
                    .into_response()
            }
            Self::Internal(message) => {
                tracing::error!(detail = %message, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal"})),
                )
                    .into_response()
            }
        }
    }
}

/// Builds the application with a supervisor launching the configured worker
/// command.
pub fn build_router(config: Config) -> Router {
    let launcher = Arc::new(CommandLauncher::new(
        config.worker_command.clone(),
        config.worker_args.clone(),
        config.session_sock_dir.clone(),
    ));
    let supervisor = Arc::new(WorkerSupervisor::new(launcher, config.handshake_timeout));
    build_router_with_supervisor(config, supervisor)
}

pub fn build_router_with_supervisor(config: Config, supervisor: Arc<WorkerSupervisor>) -> Router {
    let settings = Arc::new(SettingsStore::new(config.settings_path.clone()));
    let state = AppState {
        config: Arc::new(config),
        supervisor,
        settings,
    };
    let auth_state = state.clone();

    let protected = Router::new()
        .route("/resource", get(resource).post(resource))
        .route("/vscode-remote-resource", get(resource).post(resource))
        .route("/webview/*path", get(webview_resource))
        .route("/session", get(session_upgrade))
        .route_layer(middleware::from_fn_with_state(auth_state, auth_gate));

    Router::new()
        .route("/", get(root_page))
        .route("/healthz", get(health))
        .merge(protected)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

async fn auth_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    if auth::authenticated(&state.config, request.headers()) {
        Ok(next.run(request).await)
    } else {
        Err(GatewayError::Unauthorized { redirect_to: None })
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Root page: resolve a start path, run the session handshake, substitute
/// the returned options into the page shell, and remember the visit.
async fn root_page(
    State(state): State<AppState>,
    UrlQuery(params): UrlQuery<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    // The root is reachable without prior authentication; it redirects to
    // the login page itself instead of failing with a bare 401.
    if !auth::authenticated(&state.config, &headers) {
        return Err(GatewayError::Unauthorized {
            redirect_to: Some("/".to_string()),
        });
    }

    let query = collect_query(params);
    let previous = state.settings.read().await;
    let start_path = resolve_start_path(vec![
        query
            .get("workspace")
            .map(|value| StartPathCandidate::workspace(query_urls(value))),
        query
            .get("folder")
            .map(|value| StartPathCandidate::folder(query_urls(value))),
        state
            .config
            .start_path_arg
            .as_ref()
            .map(|path| StartPathCandidate::path(path.display().to_string())),
        previous.last_visited.clone().map(StartPathCandidate::from),
    ])
    .await;

    let remote_authority = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let worker = state
        .supervisor
        .acquire()
        .await
        .map_err(|err| handshake_failure(&state.config, err))?;
    let options = worker
        .initialize(SessionOptions {
            args: json!({"log": state.config.log_filter}),
            remote_authority,
            start_path: start_path.clone(),
        })
        .await
        .map_err(|err| handshake_failure(&state.config, err))?;

    let template_path = state.config.static_dir.join(ROOT_PAGE_TEMPLATE);
    let template = tokio::fs::read_to_string(&template_path)
        .await
        .map_err(|err| {
            GatewayError::Internal(format!(
                "root page template {}: {err}",
                template_path.display()
            ))
        })?;
    let content = render::render_root_page(
        &template,
        &options,
        &state.config.commit,
        env!("CARGO_PKG_VERSION"),
    );

    state
        .settings
        .write(&Settings {
            // Fall back to the previous location when nothing resolved.
            last_visited: start_path.or(previous.last_visited),
            query: Some(query),
        })
        .await;

    Ok(([(CONTENT_TYPE, "text/html; charset=utf-8")], content).into_response())
}

fn handshake_failure(config: &Config, err: WorkerError) -> GatewayError {
    let dev_hint = if config.commit == "development" {
        " It might not have finished compiling."
    } else {
        ""
    };
    GatewayError::Handshake {
        message: format!("The workbench failed to load.{dev_hint} {err}"),
        source: err,
    }
}

/// `/resource` and `/vscode-remote-resource`: serve an absolute filesystem
/// path given as the `path` query parameter.
async fn resource(
    State(_state): State<AppState>,
    UrlQuery(params): UrlQuery<Vec<(String, String)>>,
) -> Result<Response, GatewayError> {
    let query = collect_query(params);
    let path = query
        .get("path")
        .and_then(QueryValue::as_str)
        .ok_or(GatewayError::NotFound)?;
    serve_file(FsPath::new(path)).await
}

/// `/webview/*`: internal resource-scheme paths are stripped to absolute
/// resources; everything else comes from the worker's preload bundle.
async fn webview_resource(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, GatewayError> {
    let request_path = format!("/{path}");
    if let Some(stripped) = strip_resource_scheme(&request_path) {
        return serve_file(FsPath::new(stripped)).await;
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(GatewayError::NotFound);
    }
    serve_file(&state.config.webview_dir.join(path)).await
}

fn strip_resource_scheme(request_path: &str) -> Option<&str> {
    let rest = request_path.strip_prefix("/vscode-resource")?;
    let rest = rest.strip_prefix("/file").unwrap_or(rest);
    rest.starts_with('/').then_some(rest)
}

/// Session upgrade: answer the WebSocket handshake and hand the raw stream
/// to the worker. No frames are parsed here.
async fn session_upgrade(
    State(state): State<AppState>,
    UrlQuery(params): UrlQuery<Vec<(String, String)>>,
    mut request: Request,
) -> Result<Response, GatewayError> {
    let upgrade_requested = request
        .headers()
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));
    if !upgrade_requested {
        return Err(GatewayError::BadRequest(
            "expected a websocket upgrade".to_string(),
        ));
    }
    let client_key = request
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| GatewayError::BadRequest("missing Sec-WebSocket-Key".to_string()))?;

    // Acquire before answering so an absent worker surfaces as 503 while
    // the response can still carry a status.
    let worker = state
        .supervisor
        .acquire()
        .await
        .map_err(|_| GatewayError::BridgeUnavailable)?;

    let on_upgrade = request
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or_else(|| GatewayError::BadRequest("connection is not upgradable".to_string()))?;

    let query = collect_query(params);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                if let Err(err) = worker.handoff_socket(query, TokioIo::new(upgraded)).await {
                    tracing::warn!(error = %err, "session handoff failed");
                }
            }
            Err(err) => tracing::debug!(error = %err, "upgrade never completed"),
        }
    });

    let accept = bridge::websocket_accept_key(&client_key);
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header("Sec-WebSocket-Accept", accept)
        .body(Body::empty())
        .map_err(|err| GatewayError::Internal(format!("upgrade response: {err}")))
}

async fn serve_file(path: &FsPath) -> Result<Response, GatewayError> {
    let bytes = tokio::fs::read(path).await.map_err(|err| {
        match err.kind() {
            std::io::ErrorKind::NotFound => GatewayError::NotFound,
            std::io::ErrorKind::PermissionDenied => GatewayError::Forbidden,
            _ => {
                tracing::warn!(error = %err, path = %path.display(), "resource read failed");
                GatewayError::NotFound
            }
        }
    })?;
    let content_type = mime_guess::from_path(path).first_or_octet_stream();
    Response::builder()
        .header(CONTENT_TYPE, content_type.as_ref())
        .body(Body::from(bytes))
        .map_err(|err| GatewayError::Internal(format!("resource response: {err}")))
}

fn collect_query(params: Vec<(String, String)>) -> Query {
    let mut query = Query::new();
    for (key, value) in params {
        match query.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(QueryValue::One(value));
            }
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                match existing {
                    QueryValue::One(first) => {
                        let first = std::mem::take(first);
                        *existing = QueryValue::Many(vec![first, value]);
                    }
                    QueryValue::Many(values) => values.push(value),
                }
            }
        }
    }
    query
}

fn query_urls(value: &QueryValue) -> Vec<String> {
    match value {
        QueryValue::One(url) => vec![url.clone()],
        QueryValue::Many(urls) => urls.clone(),
    }
}

/// Absolutized trailing CLI path, used as a start-path candidate.
pub fn absolutize_cli_path(path: PathBuf) -> std::io::Result<PathBuf> {
    std::path::absolute(path)
}

#[cfg(test)]
mod tests;
