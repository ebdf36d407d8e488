use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::actor::Actor;
use crate::models::taxi::{Taxi, TaxiStatus, VehicleType};
use crate::models::user::{Capability, User};
use crate::state::AppState;
use crate::store::Transaction;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/taxis", post(register_taxi))
        .route("/taxis/mine", get(my_taxi))
        .route("/admin/taxis", get(list_taxis))
        .route("/admin/taxis/:id", get(get_taxi).patch(review_taxi))
}

#[derive(Deserialize)]
pub struct RegisterTaxiRequest {
    pub driver_name: String,
    pub vehicle_number: String,
    pub vehicle_model: String,
    #[serde(default)]
    pub vehicle_type: VehicleType,
    pub license_number: String,
}

#[derive(Deserialize)]
pub struct ReviewTaxiRequest {
    pub status: TaxiStatus,
    pub rejection_reason: Option<String>,
}

#[derive(Deserialize)]
pub struct TaxiFilter {
    pub status: Option<TaxiStatus>,
}

fn required(field: &str, value: &str) -> Result<String, AppError> {
    let value = value.trim();
    if value.is_empty() {
        Err(AppError::Validation(format!("{field} is required")))
    } else {
        Ok(value.to_string())
    }
}

async fn register_taxi(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<RegisterTaxiRequest>,
) -> Result<(StatusCode, Json<Taxi>), AppError> {
    let now = Utc::now();
    let taxi = Taxi {
        id: Uuid::new_v4(),
        owner_id: actor.user_id,
        driver_name: required("driver_name", &payload.driver_name)?,
        vehicle_number: required("vehicle_number", &payload.vehicle_number)?.to_uppercase(),
        vehicle_model: required("vehicle_model", &payload.vehicle_model)?,
        vehicle_type: payload.vehicle_type,
        license_number: required("license_number", &payload.license_number)?.to_uppercase(),
        status: TaxiStatus::Pending,
        rejection_reason: None,
        created_at: now,
        updated_at: now,
    };

    let taxi = state
        .store
        .transact(|tx| claim_registration(tx, taxi.clone()))?;

    info!(taxi_id = %taxi.id, owner_id = %taxi.owner_id, "taxi registered");
    Ok((StatusCode::CREATED, Json(taxi)))
}

/// Writes `taxi` unless its owner, plate or licence is already on file. The
/// scan ties the commit to the taxi collection, so two registrations racing
/// for the same plate cannot both land.
fn claim_registration(tx: &mut Transaction<'_>, taxi: Taxi) -> Result<Taxi, AppError> {
    if tx.get::<User>(taxi.owner_id).is_none() {
        return Err(AppError::NotFound(format!("user {} not found", taxi.owner_id)));
    }

    let clashing = tx.scan(|existing: &Taxi| {
        existing.owner_id == taxi.owner_id
            || existing.vehicle_number == taxi.vehicle_number
            || existing.license_number == taxi.license_number
    });
    if let Some(existing) = clashing.first() {
        let message = if existing.owner_id == taxi.owner_id {
            "a taxi is already registered for this user".to_string()
        } else if existing.vehicle_number == taxi.vehicle_number {
            format!("vehicle {} is already registered", taxi.vehicle_number)
        } else {
            format!("licence {} is already registered", taxi.license_number)
        };
        return Err(AppError::Conflict(message));
    }

    tx.put(taxi.clone());
    Ok(taxi)
}

async fn my_taxi(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Result<Json<Taxi>, AppError> {
    state
        .store
        .find(|taxi: &Taxi| taxi.owner_id == actor.user_id)
        .into_iter()
        .next()
        .map(Json)
        .ok_or_else(|| AppError::NotFound("no taxi registered".to_string()))
}

async fn list_taxis(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Query(filter): Query<TaxiFilter>,
) -> Result<Json<Vec<Taxi>>, AppError> {
    actor.require_admin()?;

    let mut taxis = state
        .store
        .find(|taxi: &Taxi| filter.status.is_none_or(|status| taxi.status == status));
    taxis.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(Json(taxis))
}

async fn get_taxi(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Taxi>, AppError> {
    actor.require_admin()?;

    state
        .store
        .get::<Taxi>(id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("taxi {id} not found")))
}

/// Approval grants the owner driver capability as a second step. The review
/// stands even if that promotion fails.
async fn review_taxi(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReviewTaxiRequest>,
) -> Result<Json<Taxi>, AppError> {
    actor.require_admin()?;

    let reason = payload
        .rejection_reason
        .map(|reason| reason.trim().to_string())
        .filter(|reason| !reason.is_empty());

    let taxi = state.store.transact(|tx| {
        let mut taxi: Taxi = tx
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("taxi {id} not found")))?;

        taxi.status = payload.status;
        taxi.rejection_reason = match payload.status {
            TaxiStatus::Rejected => reason.clone(),
            TaxiStatus::Pending | TaxiStatus::Approved => None,
        };
        taxi.updated_at = Utc::now();
        tx.put(taxi.clone());
        Ok(taxi)
    })?;

    info!(taxi_id = %taxi.id, status = ?taxi.status, "taxi reviewed");

    if taxi.status == TaxiStatus::Approved {
        if let Err(err) = promote_to_driver(&state, taxi.owner_id) {
            warn!(
                taxi_id = %taxi.id,
                owner_id = %taxi.owner_id,
                error = %err,
                "taxi approved but driver promotion failed"
            );
        }
    }

    Ok(Json(taxi))
}

fn promote_to_driver(state: &AppState, user_id: Uuid) -> Result<(), AppError> {
    state.store.transact(|tx| {
        let mut user: User = tx
            .get(user_id)
            .ok_or_else(|| AppError::NotFound(format!("user {user_id} not found")))?;

        if user.capabilities.insert(Capability::Driver) {
            tx.put(user);
        }
        Ok(())
    })
}
