//! Maps committed booking changes to realtime events.

use chrono::Utc;

use crate::engine::state_machine::{Transition, Trigger};
use crate::geo::eta_minutes;
use crate::models::booking::{Booking, BookingStatus};
use crate::models::event::{
    BookingCancelled, NewRideRequest, RealtimeEvent, RideStatusUpdate, RideTaken,
};
use crate::models::user::{DriverSummary, User};
use crate::realtime::notifier::Room;
use crate::state::AppState;

pub fn transitions(state: &AppState, booking: &Booking, transitions: &[Transition]) {
    for transition in transitions {
        state
            .metrics
            .status_transitions_total
            .with_label_values(&[transition.to.as_str()])
            .inc();

        match transition.to {
            BookingStatus::DriverAssigned => assigned(state, booking, transition),
            BookingStatus::Pending => {
                status_update(state, booking, transition, None);
                if let Some(driver_id) = transition.driver_id {
                    state.notifier.publish(
                        &Room::Driver(driver_id),
                        status_event(booking, transition.to, None, None),
                    );
                }
                // Only advertise requests that are still open once the whole
                // operation has settled.
                if booking.status == BookingStatus::Pending {
                    state
                        .notifier
                        .publish(&Room::Drivers, ride_request(state, booking));
                }
            }
            _ => {
                status_update(state, booking, transition, None);
                if let Some(driver_id) = transition.driver_id {
                    state.notifier.publish(
                        &Room::Driver(driver_id),
                        status_event(booking, transition.to, None, None),
                    );
                }
            }
        }
    }
}

/// The assigned driver confirmed; the rider learns who is coming.
pub fn confirmed(state: &AppState, booking: &Booking, driver: Option<&User>) {
    let eta = driver.and_then(|driver| eta_to_pickup(state, booking, driver));
    state.notifier.publish(
        &Room::User(booking.rider_id),
        status_event(booking, booking.status, driver, eta),
    );
}

pub fn removed(state: &AppState, booking: &Booking, message: &str) {
    let event = RealtimeEvent::BookingCancelled(BookingCancelled {
        booking_id: booking.id,
        message: message.to_string(),
    });

    state
        .notifier
        .publish(&Room::User(booking.rider_id), event.clone());
    if let Some(driver_id) = booking.driver_id {
        state.notifier.publish(&Room::Driver(driver_id), event);
    }
}

fn assigned(state: &AppState, booking: &Booking, transition: &Transition) {
    let Some(driver_id) = transition.driver_id else {
        return;
    };
    let driver = state.store.user(driver_id);
    let eta = driver
        .as_ref()
        .and_then(|driver| eta_to_pickup(state, booking, driver));

    status_update(state, booking, transition, driver.as_ref().map(|d| (d, eta)));

    if transition.trigger == Trigger::DriverAccepted {
        state.notifier.publish(
            &Room::Driver(driver_id),
            status_event(booking, transition.to, None, None),
        );
        state.notifier.publish(
            &Room::Drivers,
            RealtimeEvent::RideTaken(RideTaken {
                booking_id: booking.id,
            }),
        );
    } else {
        state
            .notifier
            .publish(&Room::Driver(driver_id), ride_request(state, booking));
    }
}

fn status_update(
    state: &AppState,
    booking: &Booking,
    transition: &Transition,
    driver: Option<(&User, Option<u32>)>,
) {
    let (driver, eta) = match driver {
        Some((driver, eta)) => (Some(driver), eta),
        None => (None, None),
    };
    state.notifier.publish(
        &Room::User(booking.rider_id),
        status_event(booking, transition.to, driver, eta),
    );
}

fn status_event(
    booking: &Booking,
    status: BookingStatus,
    driver: Option<&User>,
    eta_minutes: Option<u32>,
) -> RealtimeEvent {
    RealtimeEvent::RideStatusUpdate(RideStatusUpdate {
        booking_id: booking.id,
        status,
        driver: driver.map(DriverSummary::from),
        eta_minutes,
        timestamp: Utc::now(),
    })
}

fn ride_request(state: &AppState, booking: &Booking) -> RealtimeEvent {
    RealtimeEvent::NewRideRequest(NewRideRequest {
        booking_id: booking.id,
        pickup: booking.pickup.clone(),
        drop: booking.drop.clone(),
        fare: booking.estimate.fare,
        distance: booking.estimate.distance_km,
        expires_in: state.config.ride_request_expires_in_secs,
    })
}

fn eta_to_pickup(state: &AppState, booking: &Booking, driver: &User) -> Option<u32> {
    let from = state.notifier.location_of(driver.id).or(driver.location)?;
    Some(eta_minutes(
        &from,
        &booking.pickup.coordinates,
        state.config.pricing.average_speed_kmh,
    ))
}
