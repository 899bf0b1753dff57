//! Thin HTTP surface over the control loop: status, recent metrics and the
//! manual watering override.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::db::Db;
use crate::irrigation;
use crate::relay::SharedRelays;
use crate::state::SharedState;

/// Longest manual watering accepted, in seconds.
pub const MAX_MANUAL_WATER_SECS: f64 = 300.0;

const DEFAULT_METRICS_LIMIT: i64 = 100;
const MAX_METRICS_LIMIT: i64 = 1000;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub relays: SharedRelays,
    pub db: Option<Db>,
}

#[derive(Deserialize)]
struct WaterRequest {
    seconds: f64,
}

#[derive(Deserialize)]
struct MetricsQuery {
    limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/metrics", get(api_metrics))
        .route("/api/water", post(api_water))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn api_metrics(
    State(state): State<AppState>,
    Query(q): Query<MetricsQuery>,
) -> Response {
    let Some(db) = &state.db else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "metrics storage unavailable" })),
        )
            .into_response();
    };

    let limit = q.limit.unwrap_or(DEFAULT_METRICS_LIMIT).clamp(1, MAX_METRICS_LIMIT);
    match db.recent_metric_points(limit).await {
        Ok(points) => Json(points).into_response(),
        Err(e) => {
            error!("api: recent_metric_points failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to load metrics" })),
            )
                .into_response()
        }
    }
}

async fn api_water(State(state): State<AppState>, Json(req): Json<WaterRequest>) -> Response {
    if !(req.seconds > 0.0 && req.seconds <= MAX_MANUAL_WATER_SECS) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!("seconds must be in (0, {MAX_MANUAL_WATER_SECS}], got {}", req.seconds)
            })),
        )
            .into_response();
    }

    irrigation::manual_water(state.shared.clone(), state.relays.clone(), req.seconds);

    (
        StatusCode::ACCEPTED,
        Json(json!({ "message": format!("Water turned on for {} seconds", req.seconds) })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
