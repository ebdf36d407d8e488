use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, patch, put};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::api::rest::bookings::{BookingResponse, newest_first};
use crate::engine::state_machine::{StatusChange, delete_booking, update_status};
use crate::error::AppError;
use crate::models::actor::Actor;
use crate::models::assignment::Assignment;
use crate::models::booking::{Booking, BookingStatus};
use crate::models::tour::TourPackage;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/bookings", get(list_bookings))
        .route("/admin/bookings/:id", delete(remove_booking))
        .route("/admin/bookings/:id/status", patch(override_status))
        .route("/admin/assignments", get(list_assignments))
        .route("/admin/tour-packages/:id", put(upsert_tour_package))
}

#[derive(Deserialize)]
pub struct BookingFilter {
    pub status: Option<BookingStatus>,
}

#[derive(Deserialize)]
pub struct AssignmentFilter {
    pub booking_id: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct OverrideStatusRequest {
    pub status: BookingStatus,
    pub driver_id: Option<Uuid>,
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct TourPackageRequest {
    pub title: String,
    pub price: f64,
    pub duration: String,
}

async fn list_bookings(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Query(filter): Query<BookingFilter>,
) -> Result<Json<Vec<Booking>>, AppError> {
    actor.require_admin()?;

    let mut bookings = state
        .store
        .find(|booking: &Booking| filter.status.is_none_or(|status| booking.status == status));
    newest_first(&mut bookings);
    Ok(Json(bookings))
}

async fn override_status(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<OverrideStatusRequest>,
) -> Result<Json<BookingResponse>, AppError> {
    actor.require_admin()?;

    let change = StatusChange {
        driver_id: payload.driver_id,
        reason: payload.reason,
    };
    let outcome = update_status(&state, &actor, id, payload.status, change)?;

    info!(booking_id = %id, status = %outcome.booking.status, "admin status override");
    Ok(Json(outcome.into()))
}

async fn remove_booking(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Booking>, AppError> {
    let booking = delete_booking(&state, &actor, id)?;
    Ok(Json(booking))
}

async fn list_assignments(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Query(filter): Query<AssignmentFilter>,
) -> Result<Json<Vec<Assignment>>, AppError> {
    actor.require_admin()?;

    let mut assignments = state.store.find(|assignment: &Assignment| {
        filter
            .booking_id
            .is_none_or(|booking_id| assignment.booking_id == booking_id)
    });
    assignments.sort_by(|a, b| b.assigned_at.cmp(&a.assigned_at));
    Ok(Json(assignments))
}

async fn upsert_tour_package(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<TourPackageRequest>,
) -> Result<Json<TourPackage>, AppError> {
    actor.require_admin()?;

    let title = payload.title.trim().to_string();
    if title.is_empty() {
        return Err(AppError::Validation("title is required".to_string()));
    }
    if !payload.price.is_finite() || payload.price <= 0.0 {
        return Err(AppError::Validation("price must be positive".to_string()));
    }

    let package = TourPackage {
        id,
        title,
        price: payload.price,
        duration: payload.duration.trim().to_string(),
    };
    state.store.upsert_tour_package(package.clone());

    Ok(Json(package))
}
