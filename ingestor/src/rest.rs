use crate::aggregate::DeviceMetrics;
use crate::errors::Error;
use crate::model::{
    Device, DeviceId, DeviceView, LocationId, NewDevice, RawReading, Reading, ReadingsResponse,
    UserId,
};
use crate::notify::ChannelHub;
use crate::pairing::{PairingOutcome, PairingService};
use crate::queue::IngestQueue;
use crate::store::{DeviceRegistry, ReadingStore};
use crate::usage::{DailyUsage, UsageService};
use crate::validate::normalize_mac;
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, warn};

const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub queue: IngestQueue,
    pub pairing: Arc<PairingService>,
    pub usage: UsageService,
    pub devices: Arc<dyn DeviceRegistry>,
    pub readings: Arc<dyn ReadingStore>,
    pub hub: ChannelHub,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    user_id: Option<UserId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    location_id: LocationId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    pairing_code: String,
    mac_address: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueuedResponse {
    status: &'static str,
    job_id: u64,
}

#[derive(Debug, Serialize)]
struct PairResponse {
    #[serde(flatten)]
    outcome: PairingOutcome,
    message: &'static str,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/readings", post(submit_reading))
        .route("/api/v1/readings/latest/:device_id", get(latest_reading))
        .route("/api/v1/readings/device/:device_id", get(reading_history))
        .route("/api/v1/devices", get(list_devices).post(create_device))
        .route("/api/v1/devices/metrics", get(device_metrics))
        .route("/api/v1/devices/daily-usage", get(daily_usage))
        .route("/api/v1/devices/pair", post(pair_device))
        .route("/api/v1/devices/by-mac/:mac", get(device_by_mac))
        .route(
            "/api/v1/devices/:id",
            patch(rename_device).delete(delete_device),
        )
        .route("/api/v1/devices/:id/location", put(move_device))
        .route("/ws/devices/:id", get(subscribe_device))
        .route("/ws/locations/:id", get(subscribe_location))
        .with_state(state)
}

async fn submit_reading(
    State(state): State<AppState>,
    payload: Result<Json<RawReading>, JsonRejection>,
) -> Result<(StatusCode, Json<QueuedResponse>), AppError> {
    let Json(reading) = payload.map_err(|e| Error::Validation(e.body_text()))?;
    let job_id = state.queue.enqueue(reading).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(QueuedResponse {
            status: "queued",
            job_id,
        }),
    ))
}

async fn latest_reading(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
) -> Result<Json<Reading>, AppError> {
    state
        .readings
        .recent(device_id, 1)
        .await?
        .pop()
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("no readings for device {}", device_id)).into())
}

async fn reading_history(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<ReadingsResponse>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);

    let data = state.readings.recent(device_id, limit).await?;

    Ok(Json(ReadingsResponse {
        total: data.len(),
        data,
        limit,
    }))
}

async fn list_devices(
    State(state): State<AppState>,
    Query(params): Query<ListQuery>,
) -> Result<Json<Vec<DeviceView>>, AppError> {
    Ok(Json(state.usage.list_devices(params.user_id).await?))
}

async fn create_device(
    State(state): State<AppState>,
    payload: Result<Json<NewDevice>, JsonRejection>,
) -> Result<(StatusCode, Json<Device>), AppError> {
    let Json(device) = payload.map_err(|e| Error::Validation(e.body_text()))?;
    let created = state.pairing.create_pending(&device).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn rename_device(
    State(state): State<AppState>,
    Path(id): Path<DeviceId>,
    payload: Result<Json<RenameRequest>, JsonRejection>,
) -> Result<Json<DeviceView>, AppError> {
    let Json(request) = payload.map_err(|e| Error::Validation(e.body_text()))?;
    let name = request.name.trim();
    if name.is_empty() {
        return Err(Error::Validation("Device name cannot be empty".to_string()).into());
    }

    state
        .usage
        .rename_device(id, name)
        .await?
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("device {}", id)).into())
}

async fn move_device(
    State(state): State<AppState>,
    Path(id): Path<DeviceId>,
    payload: Result<Json<MoveRequest>, JsonRejection>,
) -> Result<Json<Device>, AppError> {
    let Json(request) = payload.map_err(|e| Error::Validation(e.body_text()))?;

    state
        .usage
        .move_device(id, request.location_id)
        .await?
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("device {}", id)).into())
}

async fn delete_device(
    State(state): State<AppState>,
    Path(id): Path<DeviceId>,
) -> Result<StatusCode, AppError> {
    if state.usage.delete_device(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound(format!("device {}", id)).into())
    }
}

async fn device_by_mac(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> Result<Json<Device>, AppError> {
    state
        .devices
        .find_by_mac(&normalize_mac(&mac))
        .await?
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("device with MAC {}", mac)).into())
}

async fn device_metrics(
    State(state): State<AppState>,
) -> Result<Json<HashMap<DeviceId, DeviceMetrics>>, AppError> {
    Ok(Json(state.usage.windowed_metrics().await?))
}

async fn daily_usage(State(state): State<AppState>) -> Result<Json<Vec<DailyUsage>>, AppError> {
    Ok(Json(state.usage.daily_usage().await?))
}

async fn pair_device(
    State(state): State<AppState>,
    payload: Result<Json<PairRequest>, JsonRejection>,
) -> Result<Json<PairResponse>, AppError> {
    let Json(request) = payload.map_err(|e| Error::Validation(e.body_text()))?;

    let outcome = state
        .pairing
        .complete_pairing(&request.pairing_code, &request.mac_address)
        .await?;

    let message = match outcome {
        PairingOutcome::Paired { .. } => "Device paired successfully",
        PairingOutcome::AlreadyPaired { .. } => "Device already paired",
        PairingOutcome::NotFound => {
            return Err(Error::NotFound("Invalid pairing code".to_string()).into())
        }
    };

    Ok(Json(PairResponse { outcome, message }))
}

async fn subscribe_device(
    State(state): State<AppState>,
    Path(id): Path<DeviceId>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    if state.devices.find_by_id(id).await?.is_none() {
        return Err(Error::NotFound(format!("device {}", id)).into());
    }

    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        let events = hub.subscribe(id).await;
        stream_events(socket, events, format!("device {}", id)).await
    }))
}

async fn subscribe_location(
    State(state): State<AppState>,
    Path(id): Path<LocationId>,
    ws: WebSocketUpgrade,
) -> Response {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| async move {
        let events = hub.subscribe_location(id).await;
        stream_events(socket, events, format!("location {}", id)).await
    })
}

async fn stream_events<E>(mut socket: WebSocket, mut events: broadcast::Receiver<E>, topic: String)
where
    E: Clone + Serialize,
{
    debug!("WebSocket subscribed to {}", topic);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("WebSocket for {} skipped {} events", topic, skipped);
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("WebSocket for {} closed", topic);
}

async fn send_event<E: Serialize>(socket: &mut WebSocket, event: &E) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(text) => socket.send(Message::Text(text)).await,
        Err(e) => {
            error!("Failed to encode event: {}", e);
            Ok(())
        }
    }
}

pub struct AppError(Error);

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::Json(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Error::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            Error::PairingCodeTaken(_) => (StatusCode::CONFLICT, self.0.to_string()),
            Error::QueueClosed => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Ingestion is shutting down".to_string(),
            ),
            e if e.is_transient() => {
                warn!("Storage unavailable: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Storage temporarily unavailable".to_string(),
                )
            }
            e => {
                error!("API error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
