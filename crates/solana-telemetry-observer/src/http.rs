// Numan Thabit 2025
use std::{collections::BTreeSet, convert::Infallible, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use solana_telemetry_core::{
    EpochBatch, EpochCache, FailureView, HistoricalAggregate, HistoricalStore, PriceBoard,
    PriceCache, RollupBucket, StoreError, TelemetryMetrics, TransactionUpdate, UpdateBuffer,
    ValidatorDirectory, ValidatorInfo,
};
use tokio::net::TcpListener;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::state::{NetworkSnapshot, ObserverState};

const DEFAULT_BUCKET_MS: u64 = 60_000;

#[derive(Clone)]
pub struct EpochService {
    pub cache: EpochCache,
    pub max_batch: usize,
    pub max_epoch: Option<u64>,
}

#[derive(Clone)]
pub struct AppState {
    pub observer: ObserverState,
    pub metrics: TelemetryMetrics,
    pub history: Arc<HistoricalStore>,
    pub updates: UpdateBuffer<TransactionUpdate>,
    pub epochs: Option<EpochService>,
    pub prices: Option<Arc<PriceCache>>,
    pub validators: Option<Arc<ValidatorDirectory>>,
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/epochs", get(epochs_query_handler).post(epochs_body_handler))
        .route("/api/epochs/:epoch", get(epoch_handler))
        .route("/api/session", get(session_handler))
        .route("/api/history", get(history_handler))
        .route("/api/history/raw", get(history_raw_handler))
        .route("/api/prices", get(prices_handler))
        .route("/api/network", get(network_handler))
        .route("/api/validators/:identity", get(validator_handler))
        .route("/api/stream", get(stream_handler))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(bind: SocketAddr, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind http listener on {bind}"))?;
    info!(bind = %bind, "HTTP server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("terminating http server");
        })
        .await
        .context("http server failed")?;
    Ok(())
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unavailable(&'static str),
    Upstream(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::Unavailable(message) => (StatusCode::SERVICE_UNAVAILABLE, message.to_string()),
            Self::Upstream(message) => (StatusCode::BAD_GATEWAY, message),
            Self::Internal(message) => {
                tracing::error!(error = %message, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidBucket(_) => Self::BadRequest(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl AppState {
    fn epoch_service(&self) -> Result<&EpochService, ApiError> {
        self.epochs
            .as_ref()
            .ok_or(ApiError::Unavailable("epoch service not configured"))
    }

    /// Highest epoch a caller may ask for.
    fn epoch_ceiling(&self, service: &EpochService) -> Option<u64> {
        service.max_epoch.or_else(|| self.observer.current_epoch())
    }
}

fn validate_epochs(
    requested: Vec<u64>,
    max_batch: usize,
    ceiling: Option<u64>,
) -> Result<BTreeSet<u64>, ApiError> {
    if requested.is_empty() {
        return Err(ApiError::BadRequest("at least one epoch is required".into()));
    }
    if requested.len() > max_batch {
        return Err(ApiError::BadRequest(format!(
            "at most {max_batch} epochs per request"
        )));
    }
    if let Some(ceiling) = ceiling {
        if let Some(epoch) = requested.iter().find(|epoch| **epoch > ceiling) {
            return Err(ApiError::BadRequest(format!(
                "epoch {epoch} is above the newest epoch {ceiling}"
            )));
        }
    }
    Ok(requested.into_iter().collect())
}

async fn lookup_epochs(state: &AppState, requested: Vec<u64>) -> Result<Json<EpochBatch>, ApiError> {
    let service = state.epoch_service()?;
    let epochs = validate_epochs(requested, service.max_batch, state.epoch_ceiling(service))?;
    Ok(Json(service.cache.get(&epochs).await))
}

#[derive(Debug, Deserialize)]
struct EpochsQuery {
    #[serde(default)]
    epochs: Option<String>,
}

async fn epochs_query_handler(
    State(state): State<AppState>,
    Query(query): Query<EpochsQuery>,
) -> Result<Json<EpochBatch>, ApiError> {
    let raw = query.epochs.unwrap_or_default();
    let requested = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u64>()
                .map_err(|_| ApiError::BadRequest(format!("malformed epoch {part:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    lookup_epochs(&state, requested).await
}

async fn epochs_body_handler(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<EpochBatch>, ApiError> {
    let Json(body) = payload.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    let list = body
        .get("epochs")
        .and_then(Value::as_array)
        .ok_or_else(|| ApiError::BadRequest("expected {\"epochs\": [..]}".into()))?;
    let requested = list
        .iter()
        .map(|value| {
            value
                .as_u64()
                .ok_or_else(|| ApiError::BadRequest(format!("malformed epoch {value}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    lookup_epochs(&state, requested).await
}

async fn epoch_handler(
    State(state): State<AppState>,
    Path(epoch): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let service = state.epoch_service()?;
    validate_epochs(vec![epoch], service.max_batch, state.epoch_ceiling(service))?;
    service
        .cache
        .get_one(epoch)
        .await
        .map(Json)
        .map_err(|err| ApiError::NotFound(err.to_string()))
}

async fn session_handler(State(state): State<AppState>) -> Json<FailureView> {
    let view = state.observer.session().lock().accumulator.view();
    Json(view)
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    since: Option<i64>,
    #[serde(default)]
    bucket_ms: Option<u64>,
}

async fn history_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<RollupBucket>>, ApiError> {
    let store = state.history.clone();
    let since = query.since.unwrap_or(0);
    let bucket_ms = query.bucket_ms.unwrap_or(DEFAULT_BUCKET_MS);
    let buckets = tokio::task::spawn_blocking(move || store.rollup_since(since, bucket_ms))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))??;
    Ok(Json(buckets))
}

async fn history_raw_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoricalAggregate>>, ApiError> {
    let store = state.history.clone();
    let since = query.since.unwrap_or(0);
    let rows = tokio::task::spawn_blocking(move || store.query_range(since))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))??;
    Ok(Json(rows))
}

async fn prices_handler(State(state): State<AppState>) -> Result<Json<PriceBoard>, ApiError> {
    let prices = state
        .prices
        .as_ref()
        .ok_or(ApiError::Unavailable("price service not configured"))?;
    prices
        .quotes()
        .await
        .map(Json)
        .map_err(|err| ApiError::Upstream(err.to_string()))
}

async fn network_handler(State(state): State<AppState>) -> Result<Json<NetworkSnapshot>, ApiError> {
    state
        .observer
        .network()
        .map(Json)
        .ok_or(ApiError::Unavailable("network snapshot not yet available"))
}

async fn validator_handler(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Result<Json<ValidatorInfo>, ApiError> {
    let is_pubkey = bs58::decode(&identity)
        .into_vec()
        .is_ok_and(|bytes| bytes.len() == 32);
    if !is_pubkey {
        return Err(ApiError::BadRequest(format!(
            "{identity:?} is not a base58 public key"
        )));
    }
    let directory = state
        .validators
        .as_ref()
        .ok_or(ApiError::Unavailable("validator metadata not configured"))?;
    directory
        .lookup(&identity)
        .map(|info| Json(info.as_ref().clone()))
        .ok_or_else(|| ApiError::NotFound(format!("unknown validator {identity}")))
}

async fn stream_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let batches = BroadcastStream::new(state.updates.subscribe())
        .filter_map(|batch| async move {
            match batch {
                Ok(batch) => match Event::default()
                    .event("transactions")
                    .json_data(batch.as_slice())
                {
                    Ok(event) => Some(Ok(event)),
                    Err(err) => {
                        warn!(error = %err, "failed to encode update batch");
                        None
                    }
                },
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    debug!(skipped, "stream subscriber lagged");
                    None
                }
            }
        })
        .take_until(state.shutdown.clone().cancelled_owned());
    Sse::new(batches).keep_alive(KeepAlive::default())
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.gather() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
