use std::convert::Infallible;
use std::str::FromStr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::host::{EndpointKey, HostCandidate, HostId, HostRecord, Protocol};
use crate::mux::SessionInfo;

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Wire shape of a host record. Passwords never leave the store; listings
/// carry only a presence flag.
#[derive(Debug, Serialize)]
pub(super) struct HostInfo {
    id: HostId,
    name: String,
    address: String,
    protocol: Protocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    has_password: bool,
}

impl From<HostRecord> for HostInfo {
    fn from(record: HostRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            address: record.address,
            protocol: record.protocol,
            username: record.username,
            has_password: record.password.is_some(),
        }
    }
}

pub(super) async fn list_hosts(State(state): State<AppState>) -> Json<Vec<HostInfo>> {
    Json(state.hosts.list().into_iter().map(HostInfo::from).collect())
}

pub(super) async fn add_host(
    State(state): State<AppState>,
    Json(candidate): Json<HostCandidate>,
) -> Result<(StatusCode, Json<HostInfo>), ApiError> {
    let record = state.hosts.add(candidate)?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

fn parse_host_id(raw: &str) -> Result<HostId, ApiError> {
    HostId::from_str(raw).map_err(|_| ApiError::HostNotFound(raw.to_string()))
}

pub(super) async fn get_host(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HostInfo>, ApiError> {
    let record = state.hosts.get(parse_host_id(&id)?)?;
    Ok(Json(record.into()))
}

pub(super) async fn delete_host(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.hosts.delete(parse_host_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub(super) struct OpenSessionRequest {
    host_id: HostId,
}

pub(super) async fn open_session(
    State(state): State<AppState>,
    Json(request): Json<OpenSessionRequest>,
) -> Result<(StatusCode, Json<SessionInfo>), ApiError> {
    let handle = state.mux.open(request.host_id)?;
    let info = state
        .mux
        .get(&handle.key)
        .ok_or_else(|| ApiError::SessionNotFound(handle.key.to_string()))?;
    Ok((StatusCode::ACCEPTED, Json(info)))
}

pub(super) async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.mux.list_active())
}

pub(super) async fn get_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let key = EndpointKey::from_str(&key).map_err(|_| ApiError::SessionNotFound(key.clone()))?;
    state
        .mux
        .get(&key)
        .map(Json)
        .ok_or_else(|| ApiError::SessionNotFound(key.to_string()))
}

/// Close is idempotent: a key that parses but names no live session, or a
/// key that does not parse at all, still yields 204.
pub(super) async fn close_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> StatusCode {
    if let Ok(key) = EndpointKey::from_str(&key) {
        state.mux.close(&key);
    }
    StatusCode::NO_CONTENT
}

pub(super) async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.mux.subscribe_events();
    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(event) => match Event::default().json_data(&event) {
            Ok(sse_event) => Some(Ok(sse_event)),
            Err(e) => {
                tracing::error!("failed to serialize session event: {}", e);
                None
            }
        },
        // A lagged receiver drops events; the client resyncs from GET /sessions.
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
