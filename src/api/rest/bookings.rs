use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::matching::{BookingRequest, TourRequest, create_booking, try_assign};
use crate::engine::state_machine::{Outcome, StatusChange, update_status};
use crate::error::AppError;
use crate::models::actor::Actor;
use crate::models::booking::{Booking, BookingStatus};
use crate::models::location::Location;
use crate::models::user::{Capability, DriverSummary};
use crate::realtime::session::on_driver_response;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bookings", post(create_ride).get(list_own_bookings))
        .route("/bookings/tour", post(create_tour))
        .route("/bookings/:id", get(get_booking))
        .route("/bookings/:id/accept", post(accept_booking))
        .route("/bookings/:id/reject", post(reject_booking))
        .route("/bookings/:id/status", patch(update_booking_status))
        .route("/bookings/:id/cancel", post(cancel_booking))
        .route("/bookings/:id/rematch", post(rematch_booking))
}

fn one_passenger() -> u32 {
    1
}

#[derive(Deserialize)]
pub struct CreateRideRequest {
    pub pickup: Location,
    pub drop: Option<Location>,
    #[serde(default = "one_passenger")]
    pub passengers: u32,
    pub vehicle_type: Option<String>,
    pub payment_method: Option<String>,
    pub note: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateTourRequest {
    pub package_id: Uuid,
    pub travel_date: NaiveDate,
    pub people: u32,
    pub pickup: Location,
    pub drop: Option<Location>,
    pub payment_method: Option<String>,
    pub note: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: BookingStatus,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct BookingResponse {
    #[serde(flatten)]
    pub booking: Booking,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<DriverSummary>,
}

impl From<Outcome> for BookingResponse {
    fn from(outcome: Outcome) -> Self {
        Self {
            driver: outcome
                .driver
                .as_ref()
                .filter(|_| outcome.booking.status.holds_driver())
                .map(DriverSummary::from),
            booking: outcome.booking,
        }
    }
}

async fn create_ride(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<CreateRideRequest>,
) -> Result<(StatusCode, Json<BookingResponse>), AppError> {
    actor.require(Capability::Rider)?;

    let request = BookingRequest {
        pickup: payload.pickup,
        drop: payload.drop,
        passengers: payload.passengers,
        vehicle_type: payload.vehicle_type,
        payment_method: payload.payment_method,
        note: payload.note,
        tour: None,
    };

    let outcome = create_booking(&state, actor.user_id, request)?;
    Ok((StatusCode::CREATED, Json(outcome.into())))
}

async fn create_tour(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<CreateTourRequest>,
) -> Result<(StatusCode, Json<BookingResponse>), AppError> {
    actor.require(Capability::Rider)?;

    let request = BookingRequest {
        pickup: payload.pickup,
        drop: payload.drop,
        passengers: payload.people,
        vehicle_type: None,
        payment_method: payload.payment_method,
        note: payload.note,
        tour: Some(TourRequest {
            package_id: payload.package_id,
            travel_date: payload.travel_date,
            people: payload.people,
        }),
    };

    let outcome = create_booking(&state, actor.user_id, request)?;
    Ok((StatusCode::CREATED, Json(outcome.into())))
}

async fn list_own_bookings(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Json<Vec<Booking>> {
    let mut bookings = state
        .store
        .find(|booking: &Booking| booking.rider_id == actor.user_id);
    newest_first(&mut bookings);
    Json(bookings)
}

async fn get_booking(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<BookingResponse>, AppError> {
    let booking = visible_booking(&state, &actor, id)?;
    let driver = booking
        .driver_id
        .filter(|_| booking.status.holds_driver())
        .and_then(|driver_id| state.store.user(driver_id))
        .map(|driver| DriverSummary::from(&driver));

    Ok(Json(BookingResponse { booking, driver }))
}

async fn accept_booking(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<BookingResponse>, AppError> {
    actor.require(Capability::Driver)?;
    let outcome = on_driver_response(&state, actor.user_id, id, true)?;
    Ok(Json(outcome.into()))
}

async fn reject_booking(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<BookingResponse>, AppError> {
    actor.require(Capability::Driver)?;
    let outcome = on_driver_response(&state, actor.user_id, id, false)?;
    Ok(Json(outcome.into()))
}

async fn update_booking_status(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<BookingResponse>, AppError> {
    let outcome = update_status(&state, &actor, id, payload.status, StatusChange::default())?;
    Ok(Json(outcome.into()))
}

async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    payload: Option<Json<CancelRequest>>,
) -> Result<Json<BookingResponse>, AppError> {
    let change = StatusChange {
        driver_id: None,
        reason: payload.and_then(|Json(body)| body.reason),
    };

    let outcome = update_status(&state, &actor, id, BookingStatus::Cancelled, change)?;
    Ok(Json(outcome.into()))
}

async fn rematch_booking(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<BookingResponse>, AppError> {
    let booking = visible_booking(&state, &actor, id)?;
    if booking.rider_id != actor.user_id && !actor.is_admin() {
        return Err(AppError::Forbidden(
            "only the rider or an admin can retry matching".to_string(),
        ));
    }

    let outcome = try_assign(&state, id)?;
    if outcome.booking.status == BookingStatus::NoDriversAvailable {
        return Err(AppError::NoDriversAvailable);
    }
    Ok(Json(outcome.into()))
}

/// Rider, assigned driver or admin.
fn visible_booking(state: &AppState, actor: &Actor, id: Uuid) -> Result<Booking, AppError> {
    let booking = state
        .store
        .booking(id)
        .ok_or_else(|| AppError::NotFound(format!("booking {id} not found")))?;

    if actor.is_admin() || booking.is_party(actor.user_id) {
        Ok(booking)
    } else {
        Err(AppError::Forbidden(format!("booking {id} belongs to someone else")))
    }
}

pub(crate) fn newest_first(bookings: &mut [Booking]) {
    bookings.sort_by(|a, b| {
        b.timestamps
            .requested_at
            .cmp(&a.timestamps.requested_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}
