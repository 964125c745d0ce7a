//! Admin HTTP API
//!
//! Read-only views of a server's membership, consensus and routing state, plus
//! `POST /rpc/:method` to drive the dispatcher from outside the process.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, Result};
use crate::server::Server;

#[derive(Clone)]
pub struct AdminState {
    pub server: Arc<Server>,
}

/// Creates the admin router for `server`.
pub fn create_router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/admin/status", get(admin_status))
        .route("/admin/members/lan", get(lan_members))
        .route("/admin/members/wan", get(wan_members))
        .route("/admin/datacenters", get(datacenters))
        .route("/rpc/:method", post(rpc))
        .layer(axum::middleware::from_fn(request_tracing_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(AdminState { server })
}

/// Serve the admin API on `addr` until `token` is cancelled.
pub async fn serve(server: Arc<Server>, addr: SocketAddr, token: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("bind {}: {}", addr, e)))?;
    tracing::info!("admin API listening on {}", addr);
    axum::serve(
        listener,
        create_router(server).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { token.cancelled().await })
    .await
    .map_err(|e| Error::Internal(format!("admin API: {}", e)))
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    let server = &state.server;
    Json(json!({
        "status": "healthy",
        "node": server.name(),
        "is_leader": server.is_leader(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn admin_status(State(state): State<AdminState>) -> impl IntoResponse {
    let server = &state.server;
    let role = if server.is_leader() { "leader" } else { "follower" };
    let num_peers = match server.num_peers() {
        Ok(n) => json!(n),
        Err(e) => json!({ "error": e.to_string() }),
    };
    Json(json!({
        "node": server.name(),
        "node_id": server.node_id(),
        "datacenter": server.datacenter(),
        "lifecycle": server.lifecycle().await.to_string(),
        "role": role,
        "is_leader": server.is_leader(),
        "leader": server.leader(),
        "term": server.term(),
        "num_peers": num_peers,
        "bootstrapped": server.is_bootstrapped(),
        "encrypted": server.encrypted(),
        "lan_members": server.lan_members().len(),
        "wan_members": server.wan_members().len(),
        "datacenters": server.datacenters(),
    }))
}

async fn lan_members(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.server.lan_members())
}

async fn wan_members(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.server.wan_members())
}

async fn datacenters(State(state): State<AdminState>) -> impl IntoResponse {
    let router = state.server.router();
    Json(json!({
        "local": router.local_datacenter(),
        "datacenters": router.datacenters(),
        "routes": *router.snapshot(),
    }))
}

#[derive(Deserialize)]
struct RpcQuery {
    dc: Option<String>,
}

async fn rpc(
    State(state): State<AdminState>,
    Path(method): Path<String>,
    Query(query): Query<RpcQuery>,
    body: Option<Json<Value>>,
) -> impl IntoResponse {
    let args = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let server = &state.server;
    let result = match query.dc {
        Some(dc) => server.forward_dc(&dc, &method, args).await,
        None => server.rpc(&method, args).await,
    };
    match result {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => (e.to_http_status(), Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ServerConfig;
    use crate::server::MemoryNetwork;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn single_server() -> Arc<Server> {
        let network = MemoryNetwork::new();
        let config = ServerConfig {
            node_name: "admin".into(),
            bootstrap: true,
            ..ServerConfig::default()
        };
        Server::start_in_memory(config, &network).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_admin_status() {
        let server = single_server().await;
        let response = create_router(server.clone())
            .oneshot(Request::get("/admin/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));

        let json = body_json(response).await;
        assert_eq!(json["role"], "leader");
        assert_eq!(json["num_peers"], 1);
        assert_eq!(json["datacenters"], json!(["dc1"]));
        assert_eq!(json["lifecycle"], "running");
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_members_and_rpc() {
        let server = single_server().await;
        let app = create_router(server.clone());

        let response = app
            .clone()
            .oneshot(Request::get("/admin/members/wan").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json[0]["name"], "admin.dc1");

        let response = app
            .clone()
            .oneshot(Request::post("/rpc/Status.Peers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!(["127.0.0.1:8300"]));

        let response = app
            .clone()
            .oneshot(Request::post("/rpc/Bad.Method").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::post("/rpc/Status.Ping?dc=dc9")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        server.shutdown().await.unwrap();
    }
}
