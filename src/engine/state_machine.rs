//! Booking lifecycle.
//!
//! [`is_allowed`] is the one table every status change goes through. The
//! helpers here only mutate a booking held by an open transaction; nothing is
//! visible until the caller commits, and [`settle`] publishes what happened.

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::queue::enqueue_pending;
use crate::engine::registry;
use crate::error::AppError;
use crate::models::actor::Actor;
use crate::models::assignment::{Assignment, AssignmentOutcome};
use crate::models::booking::{Booking, BookingStatus};
use crate::models::user::{Capability, User};
use crate::realtime::announce;
use crate::state::AppState;
use crate::store::Transaction;

use crate::models::booking::BookingStatus as S;

/// `from == None` is creation.
pub fn is_allowed(from: Option<BookingStatus>, to: BookingStatus) -> bool {
    matches!(
        (from, to),
        (None, S::Pending)
            | (None, S::DriverAssigned)
            | (Some(S::Pending), S::DriverAssigned)
            | (Some(S::Pending), S::NoDriversAvailable)
            | (Some(S::DriverAssigned), S::Pending)
            | (Some(S::DriverAssigned), S::DriverArrived)
            | (Some(S::DriverAssigned), S::Cancelled)
            | (Some(S::DriverArrived), S::InProgress)
            | (Some(S::DriverArrived), S::Cancelled)
            | (Some(S::InProgress), S::Completed)
            | (Some(S::InProgress), S::Cancelled)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Matching,
    DriverAccepted,
    DriverRejected,
    DriverUpdate,
    RiderCancel,
    Admin,
    Exhausted,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Matching => "matching",
            Trigger::DriverAccepted => "driver_accepted",
            Trigger::DriverRejected => "driver_rejected",
            Trigger::DriverUpdate => "driver_update",
            Trigger::RiderCancel => "rider_cancel",
            Trigger::Admin => "admin",
            Trigger::Exhausted => "exhausted",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub booking_id: Uuid,
    pub from: Option<BookingStatus>,
    pub to: BookingStatus,
    pub at: DateTime<Utc>,
    /// Driver holding the booking when the transition fired.
    pub driver_id: Option<Uuid>,
    pub trigger: Trigger,
}

/// Result of one committed booking operation.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub booking: Booking,
    pub driver: Option<User>,
    pub transitions: Vec<Transition>,
    /// Driver freed by this operation, if any.
    pub released: Option<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct StatusChange {
    pub driver_id: Option<Uuid>,
    pub reason: Option<String>,
}

/// Initial status of a booking being created.
pub fn open(
    booking: &mut Booking,
    to: BookingStatus,
    at: DateTime<Utc>,
    trigger: Trigger,
) -> Result<Transition, AppError> {
    if !is_allowed(None, to) {
        return Err(AppError::Internal(format!(
            "booking cannot be created as {to}"
        )));
    }

    booking.status = to;
    stamp(booking, to, at);

    Ok(Transition {
        booking_id: booking.id,
        from: None,
        to,
        at,
        driver_id: booking.driver_id,
        trigger,
    })
}

pub fn apply(
    booking: &mut Booking,
    to: BookingStatus,
    at: DateTime<Utc>,
    trigger: Trigger,
) -> Result<Transition, AppError> {
    let from = booking.status;
    if !is_allowed(Some(from), to) {
        return Err(AppError::InvalidTransition { from, to });
    }

    booking.status = to;
    stamp(booking, to, at);

    Ok(Transition {
        booking_id: booking.id,
        from: Some(from),
        to,
        at,
        driver_id: booking.driver_id,
        trigger,
    })
}

fn stamp(booking: &mut Booking, to: BookingStatus, at: DateTime<Utc>) {
    let at = at.max(booking.timestamps.requested_at);
    let timestamps = &mut booking.timestamps;

    let slot = match to {
        S::DriverAssigned => &mut timestamps.assigned_at,
        S::DriverArrived => &mut timestamps.arrived_at,
        S::InProgress => &mut timestamps.started_at,
        S::Completed => &mut timestamps.completed_at,
        S::Cancelled => &mut timestamps.cancelled_at,
        S::Pending | S::NoDriversAvailable => return,
    };

    if slot.is_none() {
        *slot = Some(at);
    }
}

/// Who may request `to` on `booking` outside the matching engine.
pub fn authorize(actor: &Actor, booking: &Booking, to: BookingStatus) -> Result<(), AppError> {
    if actor.is_admin() {
        return Ok(());
    }

    let allowed = match to {
        S::DriverArrived | S::InProgress | S::Completed => {
            actor.role == Capability::Driver && booking.driver_id == Some(actor.user_id)
        }
        S::Cancelled => booking.rider_id == actor.user_id && booking.status != S::InProgress,
        S::Pending | S::DriverAssigned | S::NoDriversAvailable => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!(
            "not allowed to move booking {} to {to}",
            booking.id
        )))
    }
}

/// Reserves the driver and opens a new assignment cycle on the booking.
pub(crate) fn attach_driver(
    tx: &mut Transaction<'_>,
    booking: &mut Booking,
    driver_id: Uuid,
    at: DateTime<Utc>,
    accepted: bool,
) -> Result<User, AppError> {
    if booking.rider_id == driver_id {
        return Err(AppError::Conflict(
            "a driver cannot take their own booking".to_string(),
        ));
    }
    if booking.has_rejected(driver_id) {
        return Err(AppError::Conflict(format!(
            "driver {driver_id} already declined booking {}",
            booking.id
        )));
    }

    let driver = registry::reserve(tx, driver_id, booking.id)?;

    let mut assignment = Assignment::open(booking.id, driver_id, at);
    if accepted {
        assignment.accepted_at = Some(at);
    }
    booking.driver_id = Some(driver_id);
    booking.current_assignment = Some(assignment.id);
    tx.put(assignment);

    Ok(driver)
}

/// Closes the open assignment and frees the driver. Leaves `booking.driver_id`
/// alone; whether the booking keeps it depends on the target status.
pub(crate) fn detach_driver(
    tx: &mut Transaction<'_>,
    booking: &Booking,
    outcome: AssignmentOutcome,
    at: DateTime<Utc>,
) -> Option<Uuid> {
    if let Some(mut assignment) = booking
        .current_assignment
        .and_then(|id| tx.get::<Assignment>(id))
        .filter(Assignment::is_open)
    {
        assignment.close(outcome, at);
        tx.put(assignment);
    }

    let driver_id = booking.driver_id?;
    registry::release(tx, driver_id, booking.id).then_some(driver_id)
}

/// Driver progression, rider cancel and admin override.
pub fn update_status(
    state: &AppState,
    actor: &Actor,
    booking_id: Uuid,
    to: BookingStatus,
    change: StatusChange,
) -> Result<Outcome, AppError> {
    let trigger = if actor.is_admin() {
        Trigger::Admin
    } else if to == S::Cancelled {
        Trigger::RiderCancel
    } else {
        Trigger::DriverUpdate
    };

    let outcome = state.store.transact(|tx| {
        let now = Utc::now();
        let mut booking: Booking = tx
            .get(booking_id)
            .ok_or_else(|| AppError::NotFound(format!("booking {booking_id} not found")))?;

        authorize(actor, &booking, to)?;

        let mut driver = None;
        let mut released = None;

        let transition = match to {
            S::DriverAssigned => {
                if booking.status != S::Pending {
                    return Err(AppError::InvalidTransition {
                        from: booking.status,
                        to,
                    });
                }
                let driver_id = change.driver_id.ok_or_else(|| {
                    AppError::Validation("driver_id is required to assign a driver".to_string())
                })?;
                driver = Some(attach_driver(tx, &mut booking, driver_id, now, false)?);
                apply(&mut booking, to, now, trigger)?
            }
            S::Pending => {
                let transition = apply(&mut booking, to, now, trigger)?;
                released = detach_driver(tx, &booking, AssignmentOutcome::Unassigned, now);
                booking.driver_id = None;
                booking.current_assignment = None;
                transition
            }
            S::Completed => {
                let transition = apply(&mut booking, to, now, trigger)?;
                released = detach_driver(tx, &booking, AssignmentOutcome::Completed, now);
                transition
            }
            S::Cancelled => {
                let transition = apply(&mut booking, to, now, trigger)?;
                released = detach_driver(tx, &booking, AssignmentOutcome::Cancelled, now);
                booking.driver_id = None;
                booking.current_assignment = None;
                booking.cancellation_reason = Some(
                    change
                        .reason
                        .clone()
                        .filter(|reason| !reason.trim().is_empty())
                        .unwrap_or_else(|| format!("cancelled by {}", actor.role)),
                );
                transition
            }
            S::DriverArrived | S::InProgress | S::NoDriversAvailable => {
                apply(&mut booking, to, now, trigger)?
            }
        };

        tx.put(booking.clone());

        Ok(Outcome {
            booking,
            driver,
            transitions: vec![transition],
            released,
        })
    })?;

    info!(
        booking_id = %booking_id,
        to = %to,
        actor = %actor.user_id,
        trigger = trigger.as_str(),
        "booking status updated"
    );

    settle(state, &outcome);
    Ok(outcome)
}

/// Admin removal. An active driver is released before the booking goes.
pub fn delete_booking(state: &AppState, actor: &Actor, booking_id: Uuid) -> Result<Booking, AppError> {
    actor.require_admin()?;

    let (booking, released) = state.store.transact(|tx| {
        let booking: Booking = tx
            .get(booking_id)
            .ok_or_else(|| AppError::NotFound(format!("booking {booking_id} not found")))?;

        let released = if booking.status.holds_driver() {
            detach_driver(tx, &booking, AssignmentOutcome::Cancelled, Utc::now())
        } else {
            None
        };

        tx.delete_booking(booking_id);
        Ok((booking, released))
    })?;

    info!(booking_id = %booking_id, status = %booking.status, "booking deleted");

    announce::removed(state, &booking, "Your booking was removed by an administrator");
    if released.is_some() {
        enqueue_pending(state);
    }

    Ok(booking)
}

/// Post-commit effects: notify the parties, then offer a released driver to
/// whatever is still waiting.
pub fn settle(state: &AppState, outcome: &Outcome) {
    announce::transitions(state, &outcome.booking, &outcome.transitions);

    if let Some(driver_id) = outcome.released {
        let queued = enqueue_pending(state);
        debug!(driver_id = %driver_id, queued, "driver released");
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::{StatusChange, apply, authorize, delete_booking, is_allowed, update_status};
    use crate::engine::fixtures;
    use crate::engine::matching::create_booking;
    use crate::engine::state_machine::Trigger;
    use crate::error::AppError;
    use crate::models::actor::Actor;
    use crate::models::assignment::{Assignment, AssignmentOutcome};
    use crate::models::booking::{Booking, BookingStatus};
    use crate::models::user::Capability;

    #[test]
    fn table_matches_the_documented_lifecycle() {
        use crate::models::booking::BookingStatus as S;

        let allowed: Vec<(Option<S>, S)> = std::iter::once(None)
            .chain(S::ALL.into_iter().map(Some))
            .flat_map(|from| S::ALL.into_iter().map(move |to| (from, to)))
            .filter(|(from, to)| is_allowed(*from, *to))
            .collect();

        assert_eq!(
            allowed,
            vec![
                (None, S::Pending),
                (None, S::DriverAssigned),
                (Some(S::Pending), S::DriverAssigned),
                (Some(S::Pending), S::NoDriversAvailable),
                (Some(S::DriverAssigned), S::Pending),
                (Some(S::DriverAssigned), S::DriverArrived),
                (Some(S::DriverAssigned), S::Cancelled),
                (Some(S::DriverArrived), S::InProgress),
                (Some(S::DriverArrived), S::Cancelled),
                (Some(S::InProgress), S::Completed),
                (Some(S::InProgress), S::Cancelled),
            ]
        );

        for terminal in [S::Completed, S::Cancelled, S::NoDriversAvailable] {
            assert!(S::ALL.iter().all(|to| !is_allowed(Some(terminal), *to)));
        }
    }

    #[test]
    fn rejected_transition_leaves_booking_untouched() {
        let mut booking = fixtures::booking(Uuid::new_v4());
        let before = booking.clone();

        let err = apply(&mut booking, BookingStatus::Completed, Utc::now(), Trigger::Admin)
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidTransition {
                from: BookingStatus::Pending,
                to: BookingStatus::Completed
            }
        ));
        assert_eq!(booking.status, before.status);
        assert_eq!(booking.timestamps, before.timestamps);
    }

    #[test]
    fn assigned_at_survives_a_reassignment() {
        let mut booking = fixtures::booking(Uuid::new_v4());
        let first = Utc::now();

        apply(&mut booking, BookingStatus::DriverAssigned, first, Trigger::Matching).unwrap();
        apply(&mut booking, BookingStatus::Pending, first, Trigger::DriverRejected).unwrap();
        let later = first + chrono::Duration::seconds(30);
        apply(&mut booking, BookingStatus::DriverAssigned, later, Trigger::Matching).unwrap();

        assert_eq!(booking.timestamps.assigned_at, Some(first));
        assert!(booking.timestamps.assigned_at.unwrap() >= booking.timestamps.requested_at);
    }

    #[test]
    fn only_the_assigned_driver_progresses_a_ride() {
        let rider = Uuid::new_v4();
        let driver = Uuid::new_v4();
        let mut booking = fixtures::booking(rider);
        booking.status = BookingStatus::DriverAssigned;
        booking.driver_id = Some(driver);

        let assigned = Actor::new(driver, Capability::Driver);
        let stranger = Actor::new(Uuid::new_v4(), Capability::Driver);
        let owner = Actor::new(rider, Capability::Rider);
        let admin = Actor::new(Uuid::new_v4(), Capability::Admin);

        assert!(authorize(&assigned, &booking, BookingStatus::DriverArrived).is_ok());
        assert!(authorize(&stranger, &booking, BookingStatus::DriverArrived).is_err());
        assert!(authorize(&owner, &booking, BookingStatus::Completed).is_err());
        assert!(authorize(&owner, &booking, BookingStatus::Cancelled).is_ok());
        assert!(authorize(&assigned, &booking, BookingStatus::Cancelled).is_err());
        assert!(authorize(&admin, &booking, BookingStatus::Pending).is_ok());

        booking.status = BookingStatus::InProgress;
        assert!(authorize(&owner, &booking, BookingStatus::Cancelled).is_err());
        assert!(authorize(&admin, &booking, BookingStatus::Cancelled).is_ok());
    }

    #[test]
    fn full_ride_walks_the_table_and_releases_once() {
        let state = fixtures::app_state();
        let rider = fixtures::rider(&state);
        let driver = fixtures::online_driver(&state);
        let as_driver = Actor::new(driver.id, Capability::Driver);

        let created = create_booking(&state, rider.id, fixtures::ride_request()).unwrap();
        let id = created.booking.id;
        assert_eq!(created.booking.status, BookingStatus::DriverAssigned);

        for to in [
            BookingStatus::DriverArrived,
            BookingStatus::InProgress,
            BookingStatus::Completed,
        ] {
            update_status(&state, &as_driver, id, to, StatusChange::default()).unwrap();
        }

        let done = state.store.booking(id).unwrap();
        assert_eq!(done.status, BookingStatus::Completed);
        assert_eq!(done.driver_id, Some(driver.id), "completed keeps its driver");
        let ts = &done.timestamps;
        for stamp in [ts.assigned_at, ts.arrived_at, ts.started_at, ts.completed_at] {
            assert!(stamp.unwrap() >= ts.requested_at);
        }
        assert!(ts.cancelled_at.is_none());

        let freed = state.store.user(driver.id).unwrap();
        assert!(freed.is_available);
        assert_eq!(freed.current_booking, None);

        let completed_at = ts.completed_at;
        let err = update_status(
            &state,
            &as_driver,
            id,
            BookingStatus::Completed,
            StatusChange::default(),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        assert_eq!(state.store.booking(id).unwrap().timestamps.completed_at, completed_at);

        let assignment: Assignment = state.store.get(done.current_assignment.unwrap()).unwrap();
        assert_eq!(assignment.outcome, Some(AssignmentOutcome::Completed));
    }

    #[test]
    fn admin_force_cancel_mid_trip_frees_the_driver() {
        let state = fixtures::app_state();
        let rider = fixtures::rider(&state);
        let driver = fixtures::online_driver(&state);
        let as_driver = Actor::new(driver.id, Capability::Driver);

        let (mut rider_sub, mut driver_sub) = fixtures::connect(&state, rider.id, driver.id);

        let id = create_booking(&state, rider.id, fixtures::ride_request())
            .unwrap()
            .booking
            .id;
        for to in [BookingStatus::DriverArrived, BookingStatus::InProgress] {
            update_status(&state, &as_driver, id, to, StatusChange::default()).unwrap();
        }
        fixtures::drain(&mut rider_sub);
        fixtures::drain(&mut driver_sub);

        let outcome = update_status(
            &state,
            &fixtures::admin(),
            id,
            BookingStatus::Cancelled,
            StatusChange {
                driver_id: None,
                reason: Some("vehicle breakdown".to_string()),
            },
        )
        .unwrap();

        assert_eq!(outcome.released, Some(driver.id));
        let booking = state.store.booking(id).unwrap();
        assert_eq!(booking.status, BookingStatus::Cancelled);
        assert_eq!(booking.driver_id, None);
        assert_eq!(booking.cancellation_reason.as_deref(), Some("vehicle breakdown"));
        assert!(state.store.user(driver.id).unwrap().is_eligible_driver());

        assert_eq!(fixtures::statuses(&mut rider_sub), vec![BookingStatus::Cancelled]);
        assert_eq!(fixtures::statuses(&mut driver_sub), vec![BookingStatus::Cancelled]);
    }

    #[test]
    fn rider_cannot_cancel_an_unmatched_request() {
        let state = fixtures::app_state();
        let rider = fixtures::rider(&state);
        let owner = Actor::new(rider.id, Capability::Rider);

        let id = create_booking(&state, rider.id, fixtures::ride_request())
            .unwrap()
            .booking
            .id;

        let err = update_status(
            &state,
            &owner,
            id,
            BookingStatus::Cancelled,
            StatusChange::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidTransition {
                from: BookingStatus::Pending,
                to: BookingStatus::Cancelled
            }
        ));
    }

    #[test]
    fn admin_unassign_returns_booking_to_pending_without_a_rejection() {
        let state = fixtures::app_state();
        let rider = fixtures::rider(&state);
        let driver = fixtures::online_driver(&state);

        let id = create_booking(&state, rider.id, fixtures::ride_request())
            .unwrap()
            .booking
            .id;

        update_status(
            &state,
            &fixtures::admin(),
            id,
            BookingStatus::Pending,
            StatusChange::default(),
        )
        .unwrap();

        let booking = state.store.booking(id).unwrap();
        assert_eq!(booking.status, BookingStatus::Pending);
        assert!(booking.rejected_by.is_empty());
        assert_eq!(booking.driver_id, None);
        assert!(state.store.user(driver.id).unwrap().is_available);

        update_status(
            &state,
            &fixtures::admin(),
            id,
            BookingStatus::DriverAssigned,
            StatusChange {
                driver_id: Some(driver.id),
                reason: None,
            },
        )
        .unwrap();

        let booking = state.store.booking(id).unwrap();
        assert_eq!(booking.driver_id, Some(driver.id));
        assert_eq!(
            state.store.user(driver.id).unwrap().current_booking,
            Some(id)
        );
    }

    #[test]
    fn deleting_an_active_booking_releases_its_driver() {
        let state = fixtures::app_state();
        let rider = fixtures::rider(&state);
        let driver = fixtures::online_driver(&state);

        let id = create_booking(&state, rider.id, fixtures::ride_request())
            .unwrap()
            .booking
            .id;

        let not_admin = Actor::new(rider.id, Capability::Rider);
        assert!(matches!(
            delete_booking(&state, &not_admin, id),
            Err(AppError::Forbidden(_))
        ));

        delete_booking(&state, &fixtures::admin(), id).unwrap();
        assert!(state.store.booking(id).is_none());
        assert!(state.store.user(driver.id).unwrap().is_eligible_driver());
        assert_eq!(state.store.count::<Booking>(), 0);
    }
}
