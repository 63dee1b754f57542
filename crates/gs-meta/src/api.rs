//! The meta controller's HTTP surface: actions CRUD, scheme
//! CRUD + run/stop, and the `send_dashboard` websocket.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use gs_lang::plan::explain;
use gs_lang::Scheme;
use serde::Serialize;
use tracing::warn;

use crate::state::SchemeSummary;
use crate::{watcher, MetaError, MetaState};

pub fn router(state: Arc<MetaState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/actions", get(list_actions).post(upload_action))
        .route("/v1/actions/:name", get(get_action).delete(delete_action))
        .route("/v1/schemas", get(list_schemes).post(put_scheme))
        .route("/v1/schemas/:name", get(get_scheme).delete(delete_scheme))
        .route("/v1/schemas/:name/run", put(run_scheme))
        .route("/v1/schemas/:name/stop", put(stop_scheme))
        .route("/v1/schemas/:name/send_dashboard", get(send_dashboard))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

// ---- actions ----

async fn list_actions(State(state): State<Arc<MetaState>>) -> Response {
    match state.list_actions().await {
        Ok(names) => Json(names).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_action(State(state): State<Arc<MetaState>>, Path(name): Path<String>) -> Response {
    match state.get_action(&name).await {
        Ok(bytes) => bytes.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn upload_action(State(state): State<Arc<MetaState>>, mut multipart: Multipart) -> Response {
    let mut name: Option<String> = None;
    let mut bytes: Option<Vec<u8>> = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(err) => return MetaError::Validation(err.to_string()).into_response(),
        };
        match field.name() {
            Some("name") => {
                name = match field.text().await {
                    Ok(t) => Some(t),
                    Err(err) => return MetaError::Validation(err.to_string()).into_response(),
                }
            }
            Some("action") => {
                bytes = match field.bytes().await {
                    Ok(b) => Some(b.to_vec()),
                    Err(err) => return MetaError::Validation(err.to_string()).into_response(),
                }
            }
            _ => {}
        }
    }
    let (Some(name), Some(bytes)) = (name, bytes) else {
        return MetaError::Validation("multipart body must have a `name` field and an `action` file".into()).into_response();
    };
    match state.put_action(&name, &bytes).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn delete_action(State(state): State<Arc<MetaState>>, Path(name): Path<String>) -> Response {
    match state.delete_action(&name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

// ---- schemas ----

#[derive(Serialize)]
struct SchemeSummaryWire {
    name: String,
    status: u8,
}

async fn list_schemes(State(state): State<Arc<MetaState>>) -> Response {
    match state.list_schemes().await {
        Ok(summaries) => {
            let wire: Vec<SchemeSummaryWire> = summaries.into_iter().map(|s: SchemeSummary| SchemeSummaryWire { name: s.name, status: s.status as u8 }).collect();
            Json(wire).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn get_scheme(State(state): State<Arc<MetaState>>, Path(name): Path<String>) -> Response {
    match state.get_scheme(&name).await {
        Ok(scheme) => Json(scheme).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn put_scheme(State(state): State<Arc<MetaState>>, Json(scheme): Json<Scheme>) -> Response {
    match state.put_scheme(scheme).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn delete_scheme(State(state): State<Arc<MetaState>>, Path(name): Path<String>) -> Response {
    match state.delete_scheme(&name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn run_scheme(State(state): State<Arc<MetaState>>, Path(name): Path<String>) -> Response {
    match watcher::start_plan(&state, &name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn stop_scheme(State(state): State<Arc<MetaState>>, Path(name): Path<String>) -> Response {
    match watcher::stop_plan(&state, &name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn send_dashboard(
    State(state): State<Arc<MetaState>>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let requested_ms: u64 = params.get("send_period").and_then(|s| s.parse().ok()).unwrap_or(1_000);
    let period = std::cmp::max(std::time::Duration::from_millis(requested_ms), state.config().dashboard_min_period());
    ws.on_upgrade(move |socket| dashboard_socket(socket, state, name, period))
}

async fn dashboard_socket(mut socket: WebSocket, state: Arc<MetaState>, name: String, period: std::time::Duration) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {
                let snapshot = match render_snapshot(&state, &name).await {
                    Ok(s) => s,
                    Err(err) => {
                        warn!(scheme = name, %err, "meta: dashboard snapshot failed");
                        break;
                    }
                };
                if socket.send(Message::Text(snapshot)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

async fn render_snapshot(state: &Arc<MetaState>, name: &str) -> Result<String, MetaError> {
    let plan = state.load_plan(name).await?;
    let text = explain(&plan);
    let mut live = Vec::new();
    if state.is_running(name).await {
        let hosts: std::collections::HashSet<String> = plan.nodes.iter().map(|n| n.active_address().host.clone()).collect();
        for host in hosts {
            if let Ok(telemetry) = state.agent_client().ping(&host).await {
                live.extend(telemetry.into_iter().filter(|t| t.scheme == name));
            }
        }
    }
    Ok(serde_json::json!({ "graph": text, "telemetry": live }).to_string())
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for MetaError {
    fn into_response(self) -> Response {
        let status = match &self {
            MetaError::Validation(_) => StatusCode::BAD_REQUEST,
            MetaError::NotFound(_) => StatusCode::NOT_FOUND,
            MetaError::Conflict(_) => StatusCode::CONFLICT,
            MetaError::Machine(_) => StatusCode::BAD_GATEWAY,
            MetaError::Store(_) | MetaError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let code = match &self {
            MetaError::Validation(_) => "validation_error",
            MetaError::NotFound(_) => "not_found",
            MetaError::Conflict(_) => "conflict",
            MetaError::Machine(_) => "machine_error",
            MetaError::Store(_) => "store_error",
            MetaError::Internal(_) => "internal_error",
        };
        (status, Json(ErrorBody { code, message: self.to_string() })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use gs_kvstore::{MemActionStore, MemStore};
    use tower::ServiceExt;

    fn test_state() -> Arc<MetaState> {
        MetaState::new(crate::config::MetaConfig::default(), Arc::new(MemStore::new()), Arc::new(MemActionStore::new()))
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let app = router(test_state());
        let response = app.oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_unknown_scheme_is_404() {
        let app = router(test_state());
        let response = app.oneshot(Request::builder().uri("/v1/schemas/missing").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn put_then_list_schemes() {
        let state = test_state();
        let scheme = Scheme {
            name: "s".into(),
            dataflow: "A".into(),
            nodes: vec![gs_lang::Node {
                name: "A".into(),
                action: "gen".into(),
                addresses: vec![gs_lang::Address { host: "127.0.0.1".into(), port: 9001 }],
                argv: vec![],
                env: Default::default(),
            }],
        };
        let app = router(Arc::clone(&state));
        let body = serde_json::to_vec(&scheme).unwrap();
        let response = app
            .oneshot(Request::builder().method("POST").uri("/v1/schemas").header("content-type", "application/json").body(Body::from(body)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let app = router(state);
        let response = app.oneshot(Request::builder().uri("/v1/schemas").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
