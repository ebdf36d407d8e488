use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::registry::{count_online_drivers, find_eligible_driver};
use crate::engine::state_machine::{
    Outcome, Transition, Trigger, apply, attach_driver, detach_driver, open, settle,
};
use crate::error::AppError;
use crate::geo::{estimate_trip, round2, travel_minutes};
use crate::models::assignment::{Assignment, AssignmentOutcome};
use crate::models::booking::{
    Booking, BookingKind, BookingStatus, BookingTimestamps, TripEstimate, booking_reference,
};
use crate::models::location::Location;
use crate::models::user::User;
use crate::realtime::announce;
use crate::state::AppState;
use crate::store::Transaction;

#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub pickup: Location,
    pub drop: Option<Location>,
    pub passengers: u32,
    pub vehicle_type: Option<String>,
    pub payment_method: Option<String>,
    pub note: Option<String>,
    pub tour: Option<TourRequest>,
}

#[derive(Debug, Clone)]
pub struct TourRequest {
    pub package_id: Uuid,
    pub travel_date: NaiveDate,
    pub people: u32,
}

/// Creates a booking and, if an eligible driver exists right now, reserves
/// them in the same transaction.
pub fn create_booking(
    state: &AppState,
    rider_id: Uuid,
    request: BookingRequest,
) -> Result<Outcome, AppError> {
    let started = Instant::now();
    let now = Utc::now();
    let template = draft(state, rider_id, request, now)?;
    let window = Duration::minutes(state.config.active_booking_window_mins);

    let outcome = state.store.transact(|tx| {
        let mut rider: User = tx
            .get(rider_id)
            .ok_or_else(|| AppError::NotFound(format!("user {rider_id} not found")))?;

        let active = tx.scan(|booking: &Booking| {
            booking.rider_id == rider_id && blocks_new_request(booking, now, window)
        });
        if let Some(existing) = active.first() {
            return Err(AppError::Conflict(format!(
                "rider already has an active booking {}",
                existing.reference
            )));
        }

        let mut booking = template.clone();
        let exclude = HashSet::from([rider_id]);

        let (driver, transition) = match find_eligible_driver(tx, &exclude) {
            Some(candidate) => {
                let driver = attach_driver(tx, &mut booking, candidate.id, now, false)?;
                let transition =
                    open(&mut booking, BookingStatus::DriverAssigned, now, Trigger::Matching)?;
                (Some(driver), transition)
            }
            None => (
                None,
                open(&mut booking, BookingStatus::Pending, now, Trigger::Matching)?,
            ),
        };

        rider.last_booking_at = Some(now);
        tx.put(rider);
        tx.put(booking.clone());

        Ok(Outcome {
            booking,
            driver,
            transitions: vec![transition],
            released: None,
        })
    })?;

    let label = if outcome.driver.is_some() {
        "assigned"
    } else {
        "pending"
    };
    state
        .metrics
        .bookings_created_total
        .with_label_values(&[label])
        .inc();
    state
        .metrics
        .matching_latency_seconds
        .with_label_values(&[label])
        .observe(started.elapsed().as_secs_f64());

    info!(
        booking_id = %outcome.booking.id,
        rider_id = %rider_id,
        driver_id = ?outcome.booking.driver_id,
        status = %outcome.booking.status,
        fare = outcome.booking.estimate.fare,
        "booking created"
    );

    settle(state, &outcome);
    Ok(outcome)
}

/// Matching attempt for a booking that is still pending.
pub fn try_assign(state: &AppState, booking_id: Uuid) -> Result<Outcome, AppError> {
    let started = Instant::now();

    let result = state.store.transact(|tx| {
        let now = Utc::now();
        let mut booking = load(tx, booking_id)?;
        if booking.status != BookingStatus::Pending {
            return Err(AppError::Conflict(format!(
                "booking {booking_id} is {}, not pending",
                booking.status
            )));
        }

        let mut transitions = Vec::new();
        let driver = assign_next(tx, &mut booking, now, &mut transitions)?;
        if !transitions.is_empty() {
            tx.put(booking.clone());
        }

        Ok(Outcome {
            booking,
            driver,
            transitions,
            released: None,
        })
    });

    record_attempt(state, started, &result);
    let outcome = result?;
    settle(state, &outcome);
    Ok(outcome)
}

/// The driver declines. An assigned booking goes back to pending with the
/// driver excluded; an open request just records the refusal. Either way
/// matching runs again.
pub fn handle_rejection(
    state: &AppState,
    driver_id: Uuid,
    booking_id: Uuid,
) -> Result<Outcome, AppError> {
    let started = Instant::now();

    let result = state.store.transact(|tx| {
        let now = Utc::now();
        let driver: User = tx
            .get(driver_id)
            .ok_or_else(|| AppError::NotFound(format!("driver {driver_id} not found")))?;
        if !driver.is_driver() {
            return Err(AppError::Forbidden(format!(
                "user {driver_id} is not a driver"
            )));
        }

        let mut booking = load(tx, booking_id)?;
        let mut transitions = Vec::new();
        let mut released = None;

        match booking.status {
            BookingStatus::DriverAssigned if booking.driver_id == Some(driver_id) => {
                transitions.push(apply(
                    &mut booking,
                    BookingStatus::Pending,
                    now,
                    Trigger::DriverRejected,
                )?);
                booking.record_rejection(driver_id);
                released = detach_driver(tx, &booking, AssignmentOutcome::Rejected, now);
                booking.driver_id = None;
                booking.current_assignment = None;
            }
            BookingStatus::Pending => {
                if !driver.is_online {
                    return Err(AppError::Conflict(format!(
                        "driver {driver_id} is offline and was not offered booking {booking_id}"
                    )));
                }
                if !booking.record_rejection(driver_id) {
                    return Ok(Outcome {
                        booking,
                        driver: None,
                        transitions,
                        released,
                    });
                }
            }
            _ => {
                return Err(AppError::Conflict(format!(
                    "booking {booking_id} is not awaiting a response from driver {driver_id}"
                )));
            }
        }

        let driver = assign_next(tx, &mut booking, now, &mut transitions)?;
        tx.put(booking.clone());

        Ok(Outcome {
            booking,
            driver,
            transitions,
            released,
        })
    });

    state
        .metrics
        .assignments_total
        .with_label_values(&[if result.is_ok() { "rejected" } else { "error" }])
        .inc();
    record_attempt(state, started, &result);

    let outcome = result?;
    info!(
        booking_id = %booking_id,
        driver_id = %driver_id,
        status = %outcome.booking.status,
        rejections = outcome.booking.rejected_by.len(),
        "driver declined booking"
    );

    settle(state, &outcome);
    Ok(outcome)
}

/// The driver takes the booking. Claims an open request outright, or confirms
/// an assignment the engine already made to this driver.
pub fn accept(state: &AppState, driver_id: Uuid, booking_id: Uuid) -> Result<Outcome, AppError> {
    let outcome = state.store.transact(|tx| {
        let now = Utc::now();
        let mut booking = load(tx, booking_id)?;

        match booking.status {
            BookingStatus::Pending => {
                let driver = attach_driver(tx, &mut booking, driver_id, now, true)?;
                let transition = apply(
                    &mut booking,
                    BookingStatus::DriverAssigned,
                    now,
                    Trigger::DriverAccepted,
                )?;
                tx.put(booking.clone());

                Ok(Outcome {
                    booking,
                    driver: Some(driver),
                    transitions: vec![transition],
                    released: None,
                })
            }
            BookingStatus::DriverAssigned if booking.driver_id == Some(driver_id) => {
                if let Some(mut assignment) = booking
                    .current_assignment
                    .and_then(|id| tx.get::<Assignment>(id))
                    .filter(|assignment| assignment.accepted_at.is_none())
                {
                    assignment.accepted_at = Some(now);
                    tx.put(assignment);
                }

                Ok(Outcome {
                    driver: tx.get::<User>(driver_id),
                    booking,
                    transitions: Vec::new(),
                    released: None,
                })
            }
            _ => Err(AppError::Conflict(format!(
                "booking {booking_id} is no longer available"
            ))),
        }
    });

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(booking_id = %booking_id, driver_id = %driver_id, error = %err, "accept refused");
            return Err(err);
        }
    };

    state
        .metrics
        .assignments_total
        .with_label_values(&["accepted"])
        .inc();
    info!(booking_id = %booking_id, driver_id = %driver_id, "driver accepted booking");

    if outcome.transitions.is_empty() {
        announce::confirmed(state, &outcome.booking, outcome.driver.as_ref());
    } else {
        settle(state, &outcome);
    }
    Ok(outcome)
}

/// One matching step on a pending booking inside `tx`: assign the best
/// remaining driver, or declare the booking exhausted once every online
/// driver has declined it.
pub(crate) fn assign_next(
    tx: &mut Transaction<'_>,
    booking: &mut Booking,
    now: DateTime<Utc>,
    transitions: &mut Vec<Transition>,
) -> Result<Option<User>, AppError> {
    let mut exclude: HashSet<Uuid> = booking.rejected_by.iter().copied().collect();
    exclude.insert(booking.rider_id);

    if let Some(candidate) = find_eligible_driver(tx, &exclude) {
        let driver = attach_driver(tx, booking, candidate.id, now, false)?;
        transitions.push(apply(
            booking,
            BookingStatus::DriverAssigned,
            now,
            Trigger::Matching,
        )?);
        return Ok(Some(driver));
    }

    if !booking.rejected_by.is_empty() && count_online_drivers(tx, &exclude) == 0 {
        transitions.push(apply(
            booking,
            BookingStatus::NoDriversAvailable,
            now,
            Trigger::Exhausted,
        )?);
    }

    Ok(None)
}

fn load(tx: &mut Transaction<'_>, booking_id: Uuid) -> Result<Booking, AppError> {
    tx.get(booking_id)
        .ok_or_else(|| AppError::NotFound(format!("booking {booking_id} not found")))
}

fn blocks_new_request(booking: &Booking, now: DateTime<Utc>, window: Duration) -> bool {
    booking.status.holds_driver()
        || (booking.status == BookingStatus::Pending
            && now - booking.timestamps.requested_at < window)
}

fn record_attempt(state: &AppState, started: Instant, result: &Result<Outcome, AppError>) {
    let label = match result {
        Ok(outcome) => match outcome.booking.status {
            BookingStatus::DriverAssigned => "assigned",
            BookingStatus::NoDriversAvailable => "exhausted",
            _ => "unmatched",
        },
        Err(_) => "error",
    };

    state
        .metrics
        .assignments_total
        .with_label_values(&[label])
        .inc();
    state
        .metrics
        .matching_latency_seconds
        .with_label_values(&[label])
        .observe(started.elapsed().as_secs_f64());
}

/// Validates the request and prices it into an unsaved booking.
fn draft(
    state: &AppState,
    rider_id: Uuid,
    request: BookingRequest,
    now: DateTime<Utc>,
) -> Result<Booking, AppError> {
    request.pickup.validate("pickup")?;
    if let Some(drop) = &request.drop {
        drop.validate("drop")?;
    }

    let pricing = &state.config.pricing;
    let leg = request
        .drop
        .as_ref()
        .map(|drop| estimate_trip(&request.pickup.coordinates, &drop.coordinates, pricing));

    let (kind, passengers, estimate) = match &request.tour {
        None => {
            let estimate = leg.ok_or_else(|| {
                AppError::Validation("drop location is required for a ride".to_string())
            })?;
            if request.passengers == 0 {
                return Err(AppError::Validation(
                    "passengers must be at least 1".to_string(),
                ));
            }
            (BookingKind::Ride, request.passengers, estimate)
        }
        Some(tour) => {
            if tour.people == 0 {
                return Err(AppError::Validation("people must be at least 1".to_string()));
            }
            let package = state.store.tour_package(tour.package_id).ok_or_else(|| {
                AppError::NotFound(format!("tour package {} not found", tour.package_id))
            })?;

            let distance_km = leg.as_ref().map_or(0.0, |leg| leg.distance_km);
            let estimate = TripEstimate {
                distance_km,
                duration_minutes: travel_minutes(distance_km, pricing.average_speed_kmh),
                fare: round2(package.price * f64::from(tour.people)),
            };
            let kind = BookingKind::Tour {
                package_id: package.id,
                title: package.title,
                travel_date: tour.travel_date,
                people: tour.people,
            };
            (kind, tour.people, estimate)
        }
    };

    let id = Uuid::new_v4();
    Ok(Booking {
        id,
        reference: booking_reference(&id),
        kind,
        rider_id,
        driver_id: None,
        pickup: request.pickup,
        drop: request.drop,
        passengers,
        vehicle_type: request.vehicle_type,
        payment_method: request.payment_method,
        note: request.note,
        status: BookingStatus::Pending,
        rejected_by: Vec::new(),
        estimate,
        timestamps: BookingTimestamps {
            requested_at: now,
            assigned_at: None,
            arrived_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
        },
        cancellation_reason: None,
        current_assignment: None,
    })
}
