//! HTTP API in front of the gateway facade.

use std::net::SocketAddr;

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::Space;
use crate::error::GatewayError;
use crate::facade::Gateway;

/// Body of a raw register write.
#[derive(Debug, Deserialize)]
struct RegisterWrite {
    value: u16,
}

/// Body of a named point write.
#[derive(Debug, Deserialize)]
struct PointWrite {
    value: f64,
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "err": message }))).into_response()
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::UnknownRegister { .. }
            | GatewayError::UnknownPoint(_)
            | GatewayError::UnknownGroup(_) => StatusCode::NOT_FOUND,
            GatewayError::ReadOnly { .. } | GatewayError::InvalidValue { .. } => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Store(e) => {
                warn!(error = %e, "Rejecting write, store unavailable");
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        error_body(status, self.to_string())
    }
}

fn parse_space(space: &str) -> Result<Space, Response> {
    space
        .parse()
        .map_err(|e: crate::config::ConfigError| error_body(StatusCode::BAD_REQUEST, e.to_string()))
}

/// Path of a register resource, with malformed addresses answered in the
/// API's error format.
fn register_path(
    path: Result<Path<(String, u16)>, PathRejection>,
) -> Result<(Space, u16), Response> {
    let Path((space, address)) =
        path.map_err(|e| error_body(StatusCode::BAD_REQUEST, e.body_text()))?;
    Ok((parse_space(&space)?, address))
}

fn json_payload<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    body.map(|Json(value)| value)
        .map_err(|e| error_body(StatusCode::BAD_REQUEST, e.body_text()))
}

/// Create the HTTP router.
pub fn create_router(gateway: Gateway) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/registers", get(registers_handler))
        .route(
            "/registers/:space/:address",
            get(read_register_handler)
                .put(write_register_handler)
                .post(write_register_handler),
        )
        .route(
            "/points/:name",
            get(read_point_handler)
                .put(write_point_handler)
                .post(write_point_handler),
        )
        .route("/groups", get(groups_handler))
        .route(
            "/groups/:name",
            get(read_group_handler)
                .put(write_group_handler)
                .post(write_group_handler),
        )
        .layer(CorsLayer::permissive())
        .with_state(gateway)
}

async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

async fn status_handler(State(gateway): State<Gateway>) -> Response {
    Json(gateway.status()).into_response()
}

async fn registers_handler(State(gateway): State<Gateway>) -> Response {
    Json(gateway.registers().await).into_response()
}

async fn read_register_handler(
    State(gateway): State<Gateway>,
    path: Result<Path<(String, u16)>, PathRejection>,
) -> Response {
    let (space, address) = match register_path(path) {
        Ok(key) => key,
        Err(response) => return response,
    };

    match gateway.read_register(space, address).await {
        Ok(register) => Json(register).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn write_register_handler(
    State(gateway): State<Gateway>,
    path: Result<Path<(String, u16)>, PathRejection>,
    body: Result<Json<RegisterWrite>, JsonRejection>,
) -> Response {
    let ((space, address), body) = match (register_path(path), json_payload(body)) {
        (Ok(key), Ok(body)) => (key, body),
        (Err(response), _) | (_, Err(response)) => return response,
    };

    match gateway.write_register(space, address, body.value).await {
        Ok(register) => (StatusCode::ACCEPTED, Json(register)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn read_point_handler(
    State(gateway): State<Gateway>,
    Path(name): Path<String>,
) -> Response {
    match gateway.read_point(&name).await {
        Ok(point) => Json(point).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn write_point_handler(
    State(gateway): State<Gateway>,
    Path(name): Path<String>,
    body: Result<Json<PointWrite>, JsonRejection>,
) -> Response {
    let body = match json_payload(body) {
        Ok(body) => body,
        Err(response) => return response,
    };

    match gateway.write_point(&name, body.value).await {
        Ok(point) => (StatusCode::ACCEPTED, Json(point)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn groups_handler(State(gateway): State<Gateway>) -> Response {
    Json(gateway.groups()).into_response()
}

async fn read_group_handler(
    State(gateway): State<Gateway>,
    Path(name): Path<String>,
) -> Response {
    match gateway.read_group(&name).await {
        Ok(group) => Json(group).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Body is a partial object of field values, e.g. `{"setpoint": 21.5}`.
async fn write_group_handler(
    State(gateway): State<Gateway>,
    Path(name): Path<String>,
    body: Result<Json<BTreeMap<String, f64>>, JsonRejection>,
) -> Response {
    let values = match json_payload(body) {
        Ok(values) => values,
        Err(response) => return response,
    };

    match gateway.write_group(&name, &values).await {
        Ok(group) => (StatusCode::ACCEPTED, Json(group)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// HTTP server for the gateway API.
pub struct HttpServer {
    gateway: Gateway,
    listen_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(gateway: Gateway, listen_addr: SocketAddr) -> Self {
        Self {
            gateway,
            listen_addr,
        }
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let router = create_router(self.gateway);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(addr = %self.listen_addr, "HTTP API listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
