//! HTTP ingestion and query server for sensorlog.
//!
//! Gateways push readings one at a time through the query-string endpoint or
//! in bulk as a JSON array of `[ts | null, key, value]` records. Stored series
//! can be read back by key.
//!
//! Store requests fsync, so they run on tokio's blocking pool. The periodic
//! jobs in [`jobs`] share the same store handles.

pub mod jobs;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use sensorlog_core::clock::unix_now;
use sensorlog_core::{IngestRecord, Ingestor, InsertOutcome, RawValue, Reading};

pub use jobs::{BackupJob, CalcJob, Jobs};

/// Path segment of the store endpoints; also a legal series key.
const STORE_SEGMENT: &str = "store";

/// Shared server state.
pub struct AppState {
    ingestor: Ingestor,
}

impl AppState {
    pub fn new(ingestor: Ingestor) -> Self {
        Self { ingestor }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StoreParams {
    /// Value as sent by the device: a number or a state word.
    val: Option<String>,
    /// Unix seconds; defaults to now.
    ts: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RangeParams {
    start: Option<i64>,
    end: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct LastParams {
    n: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreResponse {
    success: bool,
    accepted: usize,
    rejected: usize,
    vetoed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<InsertOutcome> for StoreResponse {
    fn from(o: InsertOutcome) -> Self {
        Self {
            success: o.rejected == 0,
            accepted: o.accepted,
            rejected: o.rejected,
            vetoed: o.vetoed,
            error: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ReadingsResponse {
    key: String,
    count: usize,
    readings: Vec<Reading>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SensorsResponse {
    sensors: Vec<String>,
    total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct HealthResponse {
    status: String,
    sensors: usize,
    transforms: usize,
    readings_last_hour: usize,
}

/// Run store work on the blocking pool.
async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> T + Send + 'static,
) -> Result<T, (StatusCode, Json<StoreResponse>)> {
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("store task failed: {e}");
        let mut body = StoreResponse::from(InsertOutcome::rejected());
        body.error = Some("internal error while storing".to_string());
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body))
    })
}

async fn handle_store_one(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(params): Query<StoreParams>,
) -> Response {
    let Some(val) = params.val else {
        // `/readings/store/last` without a value is the latest-reading query
        // for the series named `store`.
        if key == "last" {
            return handle_last(
                State(state),
                Path(STORE_SEGMENT.to_string()),
                Query(LastParams::default()),
            )
            .await
            .into_response();
        }
        let mut body = StoreResponse::from(InsertOutcome::rejected());
        body.error = Some("missing 'val' query parameter".to_string());
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    };
    let ts = params.ts;
    let outcome = {
        let key = key.clone();
        match blocking(move || state.ingestor.insert_reading(ts, &key, RawValue::Text(val))).await
        {
            Ok(outcome) => outcome,
            Err(failed) => return failed.into_response(),
        }
    };
    let status = if outcome.rejected > 0 {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    let mut body = StoreResponse::from(outcome);
    if outcome.rejected > 0 {
        body.error = Some(format!("reading for '{key}' was not stored"));
    }
    (status, Json(body)).into_response()
}

async fn handle_store_many(
    State(state): State<Arc<AppState>>,
    Json(records): Json<Vec<IngestRecord>>,
) -> (StatusCode, Json<StoreResponse>) {
    let count = records.len();
    let outcome = match blocking(move || state.ingestor.insert_many(&records)).await {
        Ok(outcome) => outcome,
        Err(failed) => return failed,
    };
    debug!("bulk store: {count} records, {} accepted", outcome.accepted);
    (StatusCode::OK, Json(StoreResponse::from(outcome)))
}

async fn handle_last(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(params): Query<LastParams>,
) -> Json<ReadingsResponse> {
    let n = params.n.unwrap_or(1).clamp(1, 10_000);
    let readings = state.ingestor.store().last(&key, n);
    Json(ReadingsResponse {
        key,
        count: readings.len(),
        readings,
    })
}

async fn handle_range(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(params): Query<RangeParams>,
) -> Json<ReadingsResponse> {
    let readings = state
        .ingestor
        .store()
        .range(&key, params.start, params.end);
    Json(ReadingsResponse {
        key,
        count: readings.len(),
        readings,
    })
}

/// `GET /api/v1/readings/store`: the range query for the series named `store`.
async fn handle_store_range(
    state: State<Arc<AppState>>,
    params: Query<RangeParams>,
) -> Json<ReadingsResponse> {
    handle_range(state, Path(STORE_SEGMENT.to_string()), params).await
}

async fn handle_sensors(State(state): State<Arc<AppState>>) -> Json<SensorsResponse> {
    let sensors = state.ingestor.store().keys();
    let total = sensors.len();
    Json(SensorsResponse { sensors, total })
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let store = state.ingestor.store();
    let recent = store.reading_count(unix_now() - 3600);
    Json(HealthResponse {
        status: if recent > 0 { "healthy" } else { "idle" }.to_string(),
        sensors: store.keys().len(),
        transforms: state.ingestor.transforms().len(),
        readings_last_hour: recent,
    })
}

async fn handle_index(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "sensorlog",
        "version": sensorlog_core::VERSION,
        "sensors": state.ingestor.store().keys().len(),
        "endpoints": {
            "/": "This API index",
            "/api/v1/readings/store/{key}": {
                "method": "GET, POST",
                "description": "Store one reading",
                "params": {
                    "val": "Reading value: a number or a state word (On, Off, Open, Closed, ...)",
                    "ts": "Unix seconds (default: now)",
                }
            },
            "/api/v1/readings/store": {
                "method": "POST",
                "description": "Store a JSON array of [ts | null, key, value] records \
                                (GET reads the series named 'store')",
            },
            "/api/v1/readings/{key}": {
                "method": "GET",
                "description": "Readings for a series, ascending",
                "params": {
                    "start": "Unix seconds, inclusive (default: open)",
                    "end": "Unix seconds, inclusive (default: open)",
                }
            },
            "/api/v1/readings/{key}/last": {
                "method": "GET",
                "description": "Most recent readings, newest first",
                "params": { "n": "Number of readings (default: 1)" }
            },
            "/api/v1/sensors": "List stored series keys",
            "/health": "Health check",
        },
        "examples": {
            "store": "/api/v1/readings/store/temp_1?val=21.5",
            "range": "/api/v1/readings/temp_1?start=1700000000",
        }
    }))
}

/// Build the axum router.
pub fn build_router(ingestor: Ingestor) -> Router {
    let state = Arc::new(AppState::new(ingestor));

    Router::new()
        .route("/", get(handle_index))
        .route(
            "/api/v1/readings/store/{key}",
            get(handle_store_one).post(handle_store_one),
        )
        .route(
            "/api/v1/readings/store",
            get(handle_store_range).post(handle_store_many),
        )
        .route("/api/v1/readings/{key}/last", get(handle_last))
        .route("/api/v1/readings/{key}", get(handle_range))
        .route("/api/v1/sensors", get(handle_sensors))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Run the HTTP server and `jobs` until the process is stopped.
pub async fn run_server(
    ingestor: Ingestor,
    jobs: Jobs,
    host: &str,
    port: u16,
) -> std::io::Result<()> {
    let app = build_router(ingestor);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("sensorlog server listening on http://{addr}");

    let handles = jobs.spawn();
    let served = axum::serve(listener, app).await;
    for handle in handles {
        handle.abort();
    }
    served
}
