use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::routing::{get, patch, post};
use chrono::{DateTime, Duration, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::api::rest::bookings::newest_first;
use crate::api::rest::users::UserProfile;
use crate::engine::registry;
use crate::error::AppError;
use crate::geo::round2;
use crate::models::actor::Actor;
use crate::models::booking::{Booking, BookingStatus};
use crate::models::location::GeoPoint;
use crate::models::user::{Capability, DriverSummary};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers/online", post(go_online).get(list_online))
        .route("/drivers/offline", post(go_offline))
        .route("/drivers/location", patch(update_location))
        .route("/drivers/bookings", get(list_driver_bookings))
        .route("/drivers/bookings/current", get(current_booking))
        .route("/drivers/earnings/today", get(earnings_today))
        .route("/drivers/stats", get(performance_stats))
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub location: GeoPoint,
}

#[derive(Serialize)]
pub struct EarningsResponse {
    pub date: NaiveDate,
    pub rides: usize,
    pub earnings: f64,
}

#[derive(Deserialize)]
pub struct StatsQuery {
    pub period: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub rides: usize,
    pub earnings: f64,
}

/// Reporting window for `/drivers/stats`. Anything unrecognised is a week.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsPeriod {
    Week,
    Month,
    Year,
}

impl StatsPeriod {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(p) if p.eq_ignore_ascii_case("month") => StatsPeriod::Month,
            Some(p) if p.eq_ignore_ascii_case("year") => StatsPeriod::Year,
            _ => StatsPeriod::Week,
        }
    }

    pub fn start(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let months = match self {
            StatsPeriod::Week => return now - Duration::days(7),
            StatsPeriod::Month => Months::new(1),
            StatsPeriod::Year => Months::new(12),
        };
        now.checked_sub_months(months).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Completed rides since `since`, one row per completion day, oldest first.
pub fn daily_stats(bookings: &[Booking], since: DateTime<Utc>) -> Vec<DailyStats> {
    let mut days: BTreeMap<NaiveDate, (usize, f64)> = BTreeMap::new();
    for booking in bookings {
        if booking.status != BookingStatus::Completed {
            continue;
        }
        let Some(completed_at) = booking.timestamps.completed_at else {
            continue;
        };
        if completed_at < since {
            continue;
        }
        let day = days.entry(completed_at.date_naive()).or_default();
        day.0 += 1;
        day.1 += booking.estimate.fare;
    }

    days.into_iter()
        .map(|(date, (rides, earnings))| DailyStats {
            date,
            rides,
            earnings: round2(earnings),
        })
        .collect()
}

async fn go_online(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Result<Json<UserProfile>, AppError> {
    actor.require(Capability::Driver)?;
    let driver = registry::go_online(&state, actor.user_id)?;
    Ok(Json(driver.into()))
}

async fn go_offline(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Result<Json<UserProfile>, AppError> {
    actor.require(Capability::Driver)?;
    let driver = registry::go_offline(&state, actor.user_id)?;
    Ok(Json(driver.into()))
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<UserProfile>, AppError> {
    actor.require(Capability::Driver)?;
    let driver = registry::update_location(&state, actor.user_id, payload.location)?;
    Ok(Json(driver.into()))
}

async fn list_online(State(state): State<Arc<AppState>>, _actor: Actor) -> Json<Vec<DriverSummary>> {
    let drivers = registry::online_drivers(&state)
        .iter()
        .map(DriverSummary::from)
        .collect();
    Json(drivers)
}

async fn list_driver_bookings(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Result<Json<Vec<Booking>>, AppError> {
    actor.require(Capability::Driver)?;

    let mut bookings = state
        .store
        .find(|booking: &Booking| booking.driver_id == Some(actor.user_id));
    newest_first(&mut bookings);
    Ok(Json(bookings))
}

async fn current_booking(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Result<Json<Booking>, AppError> {
    actor.require(Capability::Driver)?;

    registry::current_booking(&state, actor.user_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound("no active booking".to_string()))
}

async fn earnings_today(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Result<Json<EarningsResponse>, AppError> {
    actor.require(Capability::Driver)?;

    let today = Utc::now().date_naive();
    let completed = state.store.find(|booking: &Booking| {
        booking.driver_id == Some(actor.user_id)
            && booking.status == BookingStatus::Completed
            && booking
                .timestamps
                .completed_at
                .is_some_and(|at| at.date_naive() == today)
    });

    Ok(Json(EarningsResponse {
        date: today,
        rides: completed.len(),
        earnings: round2(completed.iter().map(|booking| booking.estimate.fare).sum()),
    }))
}

async fn performance_stats(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Vec<DailyStats>>, AppError> {
    actor.require(Capability::Driver)?;

    let since = StatsPeriod::parse(query.period.as_deref()).start(Utc::now());
    let bookings = state
        .store
        .find(|booking: &Booking| booking.driver_id == Some(actor.user_id));
    Ok(Json(daily_stats(&bookings, since)))
}
