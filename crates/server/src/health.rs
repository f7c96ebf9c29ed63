use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use concierge_agent::AgentRuntime;
use concierge_core::cache::CacheStats;
use concierge_db::{ping, DbPool};
use concierge_twilio::DelayedReplies;

#[derive(Clone)]
pub struct HealthState {
    pub db_pool: DbPool,
    pub runtime: Arc<AgentRuntime>,
    pub delayed: DelayedReplies,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct QueueHealth {
    pub depth: usize,
    pub capacity: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: HealthCheck,
    pub cache: CacheStats,
    pub deferred_queue: QueueHealth,
    pub delayed_replies: usize,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";
    let deferred = state.runtime.deferred();

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        database,
        cache: state.runtime.records().stats(),
        deferred_queue: QueueHealth {
            depth: deferred.queue_depth(),
            capacity: deferred.capacity(),
        },
        delayed_replies: state.delayed.len(),
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match ping(pool).await {
        Ok(()) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}
