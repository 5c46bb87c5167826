use std::future::ready;

use axum::{
    extract::{Path, Query, State},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::api::{AutopostResponse, HealthResponse, InvalidateResponse};
use crate::config::Config;
use crate::flags::FlagRecord;
use crate::gate::{check_kill_switch, check_platform_autopost, BlockCheck, GateContext};
use crate::metrics_utils::{setup_metrics_recorder, track_metrics};

#[derive(Debug, Default, Deserialize)]
pub struct StatusParams {
    pub platform: Option<String>,
}

pub fn router(gate: GateContext, config: &Config) -> Router {
    // liveness and health never consult a flag
    let status_router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(|| ready("ok")))
        .route("/health", get(health));

    let global_router = Router::new()
        .route("/api/autopost", post(autopost))
        .route_layer(middleware::from_fn_with_state(
            gate.clone(),
            check_kill_switch,
        ));

    // route_layer so the middleware runs after matching and can read `:platform`
    let platform_router = Router::new()
        .route("/api/autopost/:platform", post(autopost_to_platform))
        .route_layer(middleware::from_fn_with_state(
            gate.clone(),
            check_platform_autopost,
        ));

    let query_router = Router::new().route("/api/gate/status", get(gate_status));

    let admin_router = Router::new()
        .route("/admin/flags/invalidate", post(invalidate_flags))
        .route("/admin/flags/cache", get(cached_flags));

    let router = Router::new()
        .merge(status_router)
        .merge(global_router)
        .merge(platform_router)
        .merge(query_router)
        .merge(admin_router)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(track_metrics))
        .with_state(gate);

    // Global metrics recorders can play poorly with tests, so only install on request
    if *config.export_prometheus {
        match setup_metrics_recorder() {
            Ok(recorder_handle) => {
                router.route("/metrics", get(move || ready(recorder_handle.render())))
            }
            Err(e) => {
                tracing::error!("failed to install prometheus recorder: {}", e);
                router
            }
        }
    } else {
        router
    }
}

pub async fn index() -> &'static str {
    "autopost gate"
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn autopost() -> Json<AutopostResponse> {
    Json(AutopostResponse {
        success: true,
        message: "Autopost allowed".to_string(),
        platform: None,
    })
}

async fn autopost_to_platform(Path(platform): Path<String>) -> Json<AutopostResponse> {
    Json(AutopostResponse {
        success: true,
        message: "Autopost allowed".to_string(),
        platform: Some(platform.trim().to_lowercase()),
    })
}

async fn gate_status(
    State(gate): State<GateContext>,
    Query(params): Query<StatusParams>,
) -> Json<BlockCheck> {
    Json(gate.would_block(params.platform.as_deref()).await)
}

async fn invalidate_flags(State(gate): State<GateContext>) -> Json<InvalidateResponse> {
    gate.invalidate();
    Json(InvalidateResponse {
        success: true,
        message: "Flags cache invalidated".to_string(),
    })
}

async fn cached_flags(State(gate): State<GateContext>) -> Json<Vec<FlagRecord>> {
    Json(gate.cache_snapshot().await)
}
