use crate::error::StoreError;
use crate::server::Server;
use crate::types::*;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tracing::error;

pub fn create_router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/keys/:key", get(get_key).put(set_key))
        .route("/servers", get(get_servers))
        .route("/status", get(get_status))
        .route("/members", get(get_members))
        .with_state(server)
}

struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, leader) = match &self.0 {
            StoreError::NotFound(_) => (StatusCode::NOT_FOUND, None),
            StoreError::NotLeader { leader } => (StatusCode::CONFLICT, leader.clone()),
            StoreError::ApplyTimeout(_) | StoreError::LeaderTimeout(_) => {
                (StatusCode::GATEWAY_TIMEOUT, None)
            }
            StoreError::Apply(_) => (StatusCode::UNPROCESSABLE_ENTITY, None),
            other => {
                error!("Request failed: {}", other);
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                leader,
            }),
        )
            .into_response()
    }
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn get_key(
    State(server): State<Arc<Server>>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let value = server.get(key.as_bytes())?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], value).into_response())
}

async fn set_key(
    State(server): State<Arc<Server>>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    server.set(key.as_bytes(), &body).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_servers(State(server): State<Arc<Server>>) -> impl IntoResponse {
    Json(GetServersResponse {
        servers: server.get_servers(),
    })
}

async fn get_status(State(server): State<Arc<Server>>) -> impl IntoResponse {
    Json(server.status())
}

async fn get_members(State(server): State<Arc<Server>>) -> impl IntoResponse {
    Json(MembersResponse {
        members: server.members().into_iter().map(MemberInfo::from).collect(),
    })
}
