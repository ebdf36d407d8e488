use chrono::Utc;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::matching::BookingRequest;
use crate::engine::registry::go_online;
use crate::models::actor::Actor;
use crate::models::booking::{
    Booking, BookingKind, BookingStatus, BookingTimestamps, TripEstimate, booking_reference,
};
use crate::models::event::RealtimeEvent;
use crate::models::location::{GeoPoint, Location};
use crate::models::user::{Capability, User};
use crate::realtime::notifier::{ConnectionRole, Subscription};
use crate::state::AppState;

pub(crate) fn app_state() -> AppState {
    AppState::new(Config::default()).0
}

pub(crate) fn rider(state: &AppState) -> User {
    let n = state.store.count::<User>();
    let user = User::new(format!("rider-{n}"), format!("rider-{n}@example.com"), None);
    state.store.insert(user.clone()).unwrap();
    user
}

/// Registered driver, offline.
pub(crate) fn driver(state: &AppState) -> User {
    let n = state.store.count::<User>();
    let mut user = User::new(
        format!("driver-{n}"),
        format!("driver-{n}@example.com"),
        Some(format!("98000000{n:02}")),
    );
    user.capabilities.insert(Capability::Driver);
    user.location = Some(GeoPoint {
        lat: 27.7100,
        lng: 85.3200,
    });
    state.store.insert(user.clone()).unwrap();
    user
}

pub(crate) fn online_driver(state: &AppState) -> User {
    let user = driver(state);
    go_online(state, user.id).unwrap()
}

pub(crate) fn admin() -> Actor {
    Actor::new(Uuid::new_v4(), Capability::Admin)
}

fn kathmandu() -> Location {
    Location {
        address: "Thamel, Kathmandu".to_string(),
        coordinates: GeoPoint {
            lat: 27.7172,
            lng: 85.3240,
        },
    }
}

fn bhaktapur() -> Location {
    Location {
        address: "Durbar Square, Bhaktapur".to_string(),
        coordinates: GeoPoint {
            lat: 27.6710,
            lng: 85.4298,
        },
    }
}

pub(crate) fn ride_request() -> BookingRequest {
    BookingRequest {
        pickup: kathmandu(),
        drop: Some(bhaktapur()),
        passengers: 1,
        vehicle_type: None,
        payment_method: Some("cash".to_string()),
        note: None,
        tour: None,
    }
}

/// Unsaved pending ride.
pub(crate) fn booking(rider_id: Uuid) -> Booking {
    let id = Uuid::new_v4();
    Booking {
        id,
        reference: booking_reference(&id),
        kind: BookingKind::Ride,
        rider_id,
        driver_id: None,
        pickup: kathmandu(),
        drop: Some(bhaktapur()),
        passengers: 1,
        vehicle_type: None,
        payment_method: None,
        note: None,
        status: BookingStatus::Pending,
        rejected_by: Vec::new(),
        estimate: TripEstimate {
            distance_km: 12.0,
            duration_minutes: 24,
            fare: 194.0,
        },
        timestamps: BookingTimestamps {
            requested_at: Utc::now(),
            assigned_at: None,
            arrived_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
        },
        cancellation_reason: None,
        current_assignment: None,
    }
}

pub(crate) fn connect(state: &AppState, rider_id: Uuid, driver_id: Uuid) -> (Subscription, Subscription) {
    (
        state.notifier.attach(rider_id, ConnectionRole::Rider),
        state.notifier.attach(driver_id, ConnectionRole::Driver),
    )
}

pub(crate) fn drain(subscription: &mut Subscription) -> Vec<RealtimeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = subscription.receiver.try_recv() {
        events.push(event);
    }
    events
}

/// Statuses carried by the `rideStatusUpdate` events waiting on the connection.
pub(crate) fn statuses(subscription: &mut Subscription) -> Vec<BookingStatus> {
    drain(subscription)
        .into_iter()
        .filter_map(|event| match event {
            RealtimeEvent::RideStatusUpdate(update) => Some(update.status),
            _ => None,
        })
        .collect()
}
