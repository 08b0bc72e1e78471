pub mod client;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod websocket;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use actix_web::{web, HttpResponse};
use tokio_util::sync::CancellationToken;

pub use config::Settings;
pub use error::GatewayError;
pub type Result<T> = std::result::Result<T, GatewayError>;

use coordinator::ConversationCoordinator;
use dedup::DedupHandle;
use registry::RegistryHandle;

/// Gateway-wide counters, updated by connection tasks and read by the
/// status endpoint.
#[derive(Debug, Default)]
pub struct GatewayStats {
    pub connections_total: AtomicU64,
    pub messages_total: AtomicU64,
    pub accepted: AtomicU64,
    pub duplicate_ids: AtomicU64,
    pub duplicate_contents: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub downstream_errors: AtomicU64,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "connections_total": self.connections_total.load(Ordering::Relaxed),
            "messages_total": self.messages_total.load(Ordering::Relaxed),
            "accepted": self.accepted.load(Ordering::Relaxed),
            "duplicate_ids": self.duplicate_ids.load(Ordering::Relaxed),
            "duplicate_contents": self.duplicate_contents.load(Ordering::Relaxed),
            "protocol_errors": self.protocol_errors.load(Ordering::Relaxed),
            "downstream_errors": self.downstream_errors.load(Ordering::Relaxed),
        })
    }
}

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: RegistryHandle,
    pub dedup: DedupHandle,
    pub coordinator: Arc<dyn ConversationCoordinator>,
    pub stats: Arc<GatewayStats>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    /// Spawn the dedup and registry actors and wire everything together.
    /// The actors stop when `shutdown` fires.
    pub fn new(
        settings: Settings,
        coordinator: Arc<dyn ConversationCoordinator>,
        shutdown: CancellationToken,
    ) -> Self {
        let dedup = DedupHandle::spawn(settings.dedup.clone(), shutdown.clone());
        let registry = RegistryHandle::spawn(shutdown);
        Self {
            settings: Arc::new(settings),
            registry,
            dedup,
            coordinator,
            stats: Arc::new(GatewayStats::new()),
            started_at: chrono::Utc::now(),
        }
    }
}

/// Health check endpoint handler
/// Returns a JSON response with server status and timestamp
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Operational status: active sessions, dedup store footprint, and the
/// gateway counters.
pub async fn status(state: web::Data<AppState>) -> HttpResponse {
    let registry = state.registry.stats().await;
    let dedup = state.dedup.stats().await;

    match (registry, dedup) {
        (Ok(registry), Ok(dedup)) => HttpResponse::Ok().json(serde_json::json!({
            "status": "ok",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "uptime_secs": (chrono::Utc::now() - state.started_at).num_seconds(),
            "sessions": registry,
            "dedup": dedup,
            "gateway": state.stats.snapshot(),
        })),
        _ => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "degraded",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    }
}
