/**
 * API REST ROUTERWATCH - Lecture de l'état courant
 *
 * RÔLE : Exposer le dernier snapshot calculé par la boucle de monitoring et
 * la santé du process. Lecture seule, aucune erreur métier ne remonte ici :
 * avant le premier cycle l'état vaut "desconocido".
 *
 * ROUTES :
 * - GET /status  → {"ip", "port", "state"}
 * - GET /health  → {"status", "broker", "broker_reconnects", "uptime_seconds"}
 */

use crate::health::{HealthTracker, ServiceHealth};
use crate::models::StatusSnapshot;
use crate::state::StatusStore;
use axum::extract::State;
use axum::http::Method;
use axum::{routing::get, Json, Router};
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub status: StatusStore,
    pub health: HealthTracker,
}

pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/status", get(get_status))
        .route("/health", get(get_health))
        .with_state(app_state)
        .layer(cors)
}

// GET /status
async fn get_status(State(app): State<AppState>) -> Json<StatusSnapshot> {
    Json(app.status.snapshot())
}

// GET /health
async fn get_health(State(app): State<AppState>) -> Json<ServiceHealth> {
    Json(app.health.report())
}
