//! Driver eligibility, reservation and online status.
//!
//! The persisted `is_online` / `is_available` flags are the only source of
//! truth here; live sockets are a hint the notifier keeps for itself.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::queue::enqueue_pending;
use crate::error::AppError;
use crate::models::booking::Booking;
use crate::models::event::{DriverLocationUpdated, DriverStatusChanged, RealtimeEvent};
use crate::models::location::GeoPoint;
use crate::models::user::User;
use crate::realtime::notifier::Room;
use crate::state::AppState;
use crate::store::{Document, Transaction};

/// Most recently online first, ties broken by id. Finding nobody ties the
/// commit to the users collection, so a driver coming online meanwhile aborts it.
pub fn find_eligible_driver(tx: &mut Transaction<'_>, exclude: &HashSet<Uuid>) -> Option<User> {
    let store = tx.store();
    let seen = store.collection_version(User::COLLECTION);
    let mut candidates: Vec<User> =
        store.find(|user: &User| user.is_eligible_driver() && !exclude.contains(&user.id));

    candidates.sort_by(|a, b| {
        b.last_online
            .cmp(&a.last_online)
            .then_with(|| a.id.cmp(&b.id))
    });

    // The scan is unversioned; re-read each candidate through the transaction
    // so a concurrent reservation of the chosen driver fails our commit.
    let found = candidates
        .into_iter()
        .filter_map(|candidate| tx.get::<User>(candidate.id))
        .find(User::is_eligible_driver);

    if found.is_none() {
        tx.watch::<User>(seen);
    }
    found
}

/// Online drivers not in `exclude`, busy or not.
pub fn count_online_drivers(tx: &mut Transaction<'_>, exclude: &HashSet<Uuid>) -> usize {
    tx.scan(|user: &User| user.is_driver() && user.is_online && !exclude.contains(&user.id))
        .len()
}

pub fn reserve(
    tx: &mut Transaction<'_>,
    driver_id: Uuid,
    booking_id: Uuid,
) -> Result<User, AppError> {
    let mut driver: User = tx
        .get(driver_id)
        .ok_or_else(|| AppError::NotFound(format!("driver {driver_id} not found")))?;

    if !driver.is_driver() {
        return Err(AppError::Forbidden(format!(
            "user {driver_id} is not a driver"
        )));
    }
    if !driver.is_online {
        return Err(AppError::Conflict(format!("driver {driver_id} is offline")));
    }
    if !driver.is_available {
        return Err(AppError::Conflict(format!(
            "driver {driver_id} is already reserved"
        )));
    }

    driver.is_available = false;
    driver.current_booking = Some(booking_id);
    tx.put(driver.clone());
    Ok(driver)
}

/// Frees the driver if, and only if, `booking_id` is what holds them.
pub fn release(tx: &mut Transaction<'_>, driver_id: Uuid, booking_id: Uuid) -> bool {
    let Some(mut driver) = tx.get::<User>(driver_id) else {
        warn!(driver_id = %driver_id, booking_id = %booking_id, "release of unknown driver");
        return false;
    };

    if driver.current_booking != Some(booking_id) {
        return false;
    }

    driver.current_booking = None;
    driver.is_available = true;
    tx.put(driver);
    true
}

pub fn go_online(state: &AppState, driver_id: Uuid) -> Result<User, AppError> {
    let now = Utc::now();
    let driver = state.store.transact(|tx| {
        let mut driver = load_driver(tx, driver_id)?;
        driver.is_online = true;
        driver.is_available = driver.current_booking.is_none();
        driver.last_online = Some(now);
        tx.put(driver.clone());
        Ok(driver)
    })?;

    info!(driver_id = %driver_id, available = driver.is_available, "driver online");
    announce_status(state, &driver);

    let queued = enqueue_pending(state);
    if queued > 0 {
        info!(driver_id = %driver_id, queued, "pending bookings queued for rematch");
    }

    Ok(driver)
}

/// Leaves any reservation in place; the booking holding the driver still
/// has to finish.
pub fn go_offline(state: &AppState, driver_id: Uuid) -> Result<User, AppError> {
    let now = Utc::now();
    let driver = state.store.transact(|tx| {
        let mut driver = load_driver(tx, driver_id)?;
        driver.is_online = false;
        driver.last_online = Some(now);
        tx.put(driver.clone());
        Ok(driver)
    })?;

    info!(driver_id = %driver_id, "driver offline");
    announce_status(state, &driver);
    Ok(driver)
}

pub fn update_location(
    state: &AppState,
    driver_id: Uuid,
    location: GeoPoint,
) -> Result<User, AppError> {
    location.validate("location")?;

    let known = state
        .store
        .user(driver_id)
        .ok_or_else(|| AppError::NotFound(format!("driver {driver_id} not found")))?;
    if !known.is_driver() {
        return Err(AppError::Forbidden(format!(
            "user {driver_id} is not a driver"
        )));
    }

    let driver = state
        .store
        .set_location(driver_id, location)
        .ok_or_else(|| AppError::NotFound(format!("driver {driver_id} not found")))?;

    state.notifier.touch(driver_id, Some(location));

    if let Some(booking) = driver
        .current_booking
        .and_then(|booking_id| state.store.booking(booking_id))
    {
        state.notifier.publish(
            &Room::User(booking.rider_id),
            RealtimeEvent::DriverLocationUpdated(DriverLocationUpdated {
                driver_id,
                location,
                timestamp: Utc::now(),
            }),
        );
    }

    Ok(driver)
}

pub fn online_drivers(state: &AppState) -> Vec<User> {
    let mut drivers = state
        .store
        .find(|user: &User| user.is_driver() && user.is_online);
    drivers.sort_by(|a, b| b.last_online.cmp(&a.last_online).then_with(|| a.id.cmp(&b.id)));
    drivers
}

pub fn current_booking(state: &AppState, driver_id: Uuid) -> Option<Booking> {
    state
        .store
        .find(|booking: &Booking| {
            booking.driver_id == Some(driver_id) && booking.status.holds_driver()
        })
        .into_iter()
        .next()
}

fn load_driver(tx: &mut Transaction<'_>, driver_id: Uuid) -> Result<User, AppError> {
    let driver: User = tx
        .get(driver_id)
        .ok_or_else(|| AppError::NotFound(format!("driver {driver_id} not found")))?;

    if !driver.is_driver() {
        return Err(AppError::Forbidden(format!(
            "user {driver_id} is not a driver"
        )));
    }
    Ok(driver)
}

fn announce_status(state: &AppState, driver: &User) {
    state.notifier.publish(
        &Room::All,
        RealtimeEvent::DriverStatusChanged(DriverStatusChanged {
            driver_id: driver.id,
            is_online: driver.is_online,
            timestamp: Utc::now(),
        }),
    );
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::{count_online_drivers, find_eligible_driver, release, reserve, update_location};
    use crate::engine::fixtures::{app_state, driver as registered_driver, rider};
    use crate::error::AppError;
    use crate::models::location::GeoPoint;
    use crate::models::user::{Capability, User};
    use crate::store::{Collection, DocKey, Store, StoreError};

    fn driver(seed: u128, online_minutes_ago: i64) -> User {
        let mut user = User::new(
            format!("driver-{seed}"),
            format!("driver-{seed}@example.com"),
            None,
        );
        user.id = Uuid::from_u128(seed);
        user.capabilities.insert(Capability::Driver);
        user.is_online = true;
        user.last_online = Some(Utc::now() - Duration::minutes(online_minutes_ago));
        user
    }

    #[test]
    fn most_recently_online_driver_wins() {
        let store = Store::new();
        store.insert(driver(1, 30)).unwrap();
        store.insert(driver(2, 1)).unwrap();
        store.insert(driver(3, 10)).unwrap();

        let mut tx = store.begin();
        let found = find_eligible_driver(&mut tx, &HashSet::new()).unwrap();
        assert_eq!(found.id, Uuid::from_u128(2));
    }

    #[test]
    fn ties_break_by_id_and_exclusions_apply() {
        let store = Store::new();
        let now = Utc::now();
        for seed in [9_u128, 4, 6] {
            let mut d = driver(seed, 0);
            d.last_online = Some(now);
            store.insert(d).unwrap();
        }

        let mut tx = store.begin();
        let found = find_eligible_driver(&mut tx, &HashSet::new()).unwrap();
        assert_eq!(found.id, Uuid::from_u128(4));

        let exclude = HashSet::from([Uuid::from_u128(4)]);
        let found = find_eligible_driver(&mut tx, &exclude).unwrap();
        assert_eq!(found.id, Uuid::from_u128(6));
    }

    #[test]
    fn offline_busy_and_rider_accounts_are_skipped() {
        let store = Store::new();

        let mut offline = driver(1, 0);
        offline.is_online = false;
        let mut busy = driver(2, 0);
        busy.is_available = false;
        busy.current_booking = Some(Uuid::new_v4());
        let mut rider = driver(3, 0);
        rider.capabilities.remove(&Capability::Driver);

        for user in [offline, busy, rider] {
            store.insert(user).unwrap();
        }

        let mut tx = store.begin();
        assert!(find_eligible_driver(&mut tx, &HashSet::new()).is_none());
        // The busy one is still online and counts toward exhaustion checks.
        assert_eq!(count_online_drivers(&mut tx, &HashSet::new()), 1);
    }

    #[test]
    fn reserve_then_release_round_trip() {
        let store = Store::new();
        let d = driver(1, 0);
        let booking_id = Uuid::new_v4();
        store.insert(d.clone()).unwrap();

        let mut tx = store.begin();
        reserve(&mut tx, d.id, booking_id).unwrap();
        tx.commit().unwrap();

        let stored = store.user(d.id).unwrap();
        assert!(!stored.is_available);
        assert_eq!(stored.current_booking, Some(booking_id));

        let mut tx = store.begin();
        let err = reserve(&mut tx, d.id, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        assert!(!release(&mut tx, d.id, Uuid::new_v4()));
        assert!(release(&mut tx, d.id, booking_id));
        tx.commit().unwrap();

        let stored = store.user(d.id).unwrap();
        assert!(stored.is_available);
        assert_eq!(stored.current_booking, None);

        let mut tx = store.begin();
        assert!(!release(&mut tx, d.id, booking_id), "second release is a no-op");
    }

    #[test]
    fn concurrent_reservations_of_one_driver_conflict() {
        let store = Store::new();
        let d = driver(1, 0);
        store.insert(d.clone()).unwrap();

        let mut first = store.begin();
        let mut second = store.begin();

        let a = find_eligible_driver(&mut first, &HashSet::new()).unwrap();
        let b = find_eligible_driver(&mut second, &HashSet::new()).unwrap();
        assert_eq!(a.id, b.id);

        reserve(&mut first, a.id, Uuid::new_v4()).unwrap();
        reserve(&mut second, b.id, Uuid::new_v4()).unwrap();

        assert!(first.commit().is_ok());
        assert!(second.commit().is_err());
    }

    #[test]
    fn finding_nobody_conflicts_with_a_driver_coming_online() {
        let store = Store::new();
        let mut sleeper = driver(1, 5);
        sleeper.is_online = false;
        store.insert(sleeper.clone()).unwrap();

        let mut tx = store.begin();
        assert!(find_eligible_driver(&mut tx, &HashSet::new()).is_none());
        tx.put(driver(2, 0));

        sleeper.is_online = true;
        store.insert(sleeper).unwrap();

        assert_eq!(
            tx.commit(),
            Err(StoreError::Conflict(DocKey::Collection(Collection::Users)))
        );
        assert!(store.user(Uuid::from_u128(2)).is_none());
    }

    #[test]
    fn location_updates_do_not_invalidate_open_transactions() {
        let state = app_state();
        let d = registered_driver(&state);
        let version = state.store.version_of(&DocKey::User(d.id));
        let users = state.store.collection_version(Collection::Users);

        let mut tx = state.store.begin();
        let mut read: User = tx.get(d.id).unwrap();

        let here = GeoPoint { lat: 27.7172, lng: 85.3240 };
        let moved = update_location(&state, d.id, here).unwrap();
        assert_eq!(moved.location, Some(here));
        assert_eq!(state.store.version_of(&DocKey::User(d.id)), version);
        assert_eq!(state.store.collection_version(Collection::Users), users);

        read.is_online = true;
        tx.put(read);
        assert_eq!(tx.commit(), Ok(()));

        let stored = state.store.user(d.id).unwrap();
        assert!(stored.is_online);
        assert_eq!(stored.location, Some(here));
    }

    #[test]
    fn location_updates_need_a_known_driver() {
        let state = app_state();
        let here = GeoPoint { lat: 27.7, lng: 85.3 };

        let err = update_location(&state, Uuid::new_v4(), here).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let r = rider(&state);
        let err = update_location(&state, r.id, here).unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        assert_eq!(state.store.user(r.id).unwrap().location, None);

        let d = registered_driver(&state);
        let err = update_location(&state, d.id, GeoPoint { lat: 91.0, lng: 0.0 }).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
