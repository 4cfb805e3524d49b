use crate::activity::DEFAULT_TAIL;
use crate::hub::Hub;
use crate::ws::handle_socket;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/devices", get(devices))
        .route("/logs", get(logs))
        .route("/device/:id", get(device))
        .route("/blobs/*id", get(blob))
        .with_state(hub)
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, hub: Arc<Hub>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(hub).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(hub): State<Arc<Hub>>,
) -> Response {
    if let Some(denied) = deny_remote(&hub, &addr) {
        return denied;
    }
    let remote = forwarded_for(&headers).unwrap_or_else(|| addr.ip().to_string());
    ws.on_upgrade(move |socket| handle_socket(hub, socket, Some(remote)))
}

async fn devices(ConnectInfo(addr): ConnectInfo<SocketAddr>, State(hub): State<Arc<Hub>>) -> Response {
    if let Some(denied) = deny_remote(&hub, &addr) {
        return denied;
    }
    let devices = hub.roster.snapshot().await;
    Json(json!({ "ok": true, "devices": devices })).into_response()
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn logs(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<LogsQuery>,
    State(hub): State<Arc<Hub>>,
) -> Response {
    if let Some(denied) = deny_remote(&hub, &addr) {
        return denied;
    }
    let logs = hub.activity.tail(query.limit.unwrap_or(DEFAULT_TAIL)).await;
    Json(json!({ "ok": true, "logs": logs })).into_response()
}

async fn device(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    State(hub): State<Arc<Hub>>,
) -> Response {
    if let Some(denied) = deny_remote(&hub, &addr) {
        return denied;
    }
    match hub.roster.lookup(&id).await {
        Some(record) => Json(json!({ "ok": true, "device": record })).into_response(),
        None => not_found(&id),
    }
}

async fn blob(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    State(hub): State<Arc<Hub>>,
) -> Response {
    if let Some(denied) = deny_remote(&hub, &addr) {
        return denied;
    }
    let id = id.trim_start_matches('/');
    match hub.roster.blob(id).await {
        Some(value) => Json(value).into_response(),
        None => not_found(id),
    }
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "ok": false, "error": format!("{id} not found") })),
    )
        .into_response()
}

fn deny_remote(hub: &Hub, addr: &SocketAddr) -> Option<Response> {
    if hub.config.allow_remote || addr.ip().is_loopback() {
        return None;
    }
    Some(StatusCode::FORBIDDEN.into_response())
}

/// First hop of `X-Forwarded-For`, when a proxy supplied one.
fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .map(str::trim)
        .find(|hop| !hop.is_empty())
        .map(str::to_string)
}
