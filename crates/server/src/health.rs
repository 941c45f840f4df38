use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use cadence_agent::AgentStores;
use cadence_core::monitor::{self, HealthAlert};
use cadence_core::schedule::Clock;
use cadence_db::DbPool;
use serde::Serialize;
use tracing::{error, info};

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    stores: AgentStores,
    clock: Arc<dyn Clock>,
}

impl HealthState {
    pub fn new(db_pool: DbPool, stores: AgentStores, clock: Arc<dyn Clock>) -> Self {
        Self { db_pool, stores, clock }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

/// Agent state next to the alerts the monitor raises for it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentHealth {
    pub state: &'static str,
    pub alerts: Vec<HealthAlert>,
    pub error_rate_pct: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub agent: Option<AgentHealth>,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn spawn(bind_address: &str, port: u16, state: HealthState) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "health endpoint started"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(state)).await {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

/// Readiness follows the database only; agent alerts are reported but never fail the probe.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";
    let agent = if ready { agent_check(&state).await } else { None };

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "cadence-server runtime initialized".to_string(),
        },
        database,
        agent,
        checked_at: state.clock.now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

async fn agent_check(state: &HealthState) -> Option<AgentHealth> {
    let config = match state.stores.agent.load().await {
        Ok(config) => config?,
        Err(error) => {
            error!(event_name = "system.health.agent_load_failed", error = %error);
            return None;
        }
    };

    let report = monitor::evaluate_health(&config, state.clock.now());
    let label = match (config.is_running, config.is_paused) {
        (true, false) => "running",
        (true, true) => "paused",
        (false, _) => "stopped",
    };
    Some(AgentHealth { state: label, alerts: report.alerts, error_rate_pct: report.error_rate_pct })
}
