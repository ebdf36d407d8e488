//! In-process durable store.
//!
//! Every document carries a version, and so does every collection. Writes only
//! happen through [`Transaction::commit`], which checks under one commit lock
//! that nothing the transaction read has moved since: two transactions that
//! read the same driver cannot both claim it, and a scan fails its commit if
//! anything in the scanned collection was written in the meantime.
//!
//! Driver positions are the one exception. They change far more often than
//! anything eligibility depends on, so [`Store::set_location`] writes them in
//! place without touching any version.

mod transaction;

use std::fmt;
use std::sync::{Mutex, PoisonError};

use dashmap::DashMap;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::assignment::Assignment;
use crate::models::booking::Booking;
use crate::models::location::GeoPoint;
use crate::models::taxi::Taxi;
use crate::models::tour::TourPackage;
use crate::models::user::User;

pub use transaction::Transaction;

/// A conflicting commit is re-run this many times in total before giving up.
pub const MAX_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Users,
    Bookings,
    Assignments,
    Taxis,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Bookings => "bookings",
            Collection::Assignments => "assignments",
            Collection::Taxis => "taxis",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocKey {
    User(Uuid),
    Booking(Uuid),
    Assignment(Uuid),
    Taxi(Uuid),
    /// Membership of a whole collection, read by scans.
    Collection(Collection),
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocKey::User(id) => write!(f, "user {id}"),
            DocKey::Booking(id) => write!(f, "booking {id}"),
            DocKey::Assignment(id) => write!(f, "assignment {id}"),
            DocKey::Taxi(id) => write!(f, "taxi {id}"),
            DocKey::Collection(collection) => write!(f, "{} collection", collection.as_str()),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("write conflict on {0}")]
    Conflict(DocKey),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::TransientStore(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub version: u64,
    pub doc: T,
}

/// A buffered write, applied at commit.
#[derive(Debug, Clone)]
pub enum Write {
    User(User),
    Booking(Booking),
    Assignment(Assignment),
    Taxi(Taxi),
    DeleteBooking(Uuid),
}

pub trait Document: Clone + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn key(id: Uuid) -> DocKey;
    fn id(&self) -> Uuid;
    fn collection(store: &Store) -> &DashMap<Uuid, Versioned<Self>>;
    /// `None` when the buffered write is not this document (or deletes it).
    fn pending(write: &Write) -> Option<&Self>;
    fn into_write(self) -> Write;
}

macro_rules! document {
    ($ty:ty, $variant:ident, $field:ident, $collection:ident) => {
        impl Document for $ty {
            const COLLECTION: Collection = Collection::$collection;

            fn key(id: Uuid) -> DocKey {
                DocKey::$variant(id)
            }

            fn id(&self) -> Uuid {
                self.id
            }

            fn collection(store: &Store) -> &DashMap<Uuid, Versioned<Self>> {
                &store.$field
            }

            fn pending(write: &Write) -> Option<&Self> {
                match write {
                    Write::$variant(doc) => Some(doc),
                    _ => None,
                }
            }

            fn into_write(self) -> Write {
                Write::$variant(self)
            }
        }
    };
}

document!(User, User, users, Users);
document!(Booking, Booking, bookings, Bookings);
document!(Assignment, Assignment, assignments, Assignments);
document!(Taxi, Taxi, taxis, Taxis);

#[derive(Default)]
pub struct Store {
    users: DashMap<Uuid, Versioned<User>>,
    bookings: DashMap<Uuid, Versioned<Booking>>,
    assignments: DashMap<Uuid, Versioned<Assignment>>,
    taxis: DashMap<Uuid, Versioned<Taxi>>,
    tour_packages: DashMap<Uuid, TourPackage>,
    collection_versions: DashMap<Collection, u64>,
    commit_lock: Mutex<()>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Runs `op` inside a transaction and commits it. A commit conflict re-runs
    /// `op` from scratch; once [`MAX_ATTEMPTS`] are spent the caller gets a
    /// retryable [`AppError::TransientStore`]. An error from `op` aborts
    /// without writing anything.
    pub fn transact<T, F>(&self, mut op: F) -> Result<T, AppError>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<T, AppError>,
    {
        let mut last_conflict = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let mut tx = self.begin();
            let value = op(&mut tx)?;

            match tx.commit() {
                Ok(()) => return Ok(value),
                Err(err) => {
                    warn!(attempt, error = %err, "transaction aborted");
                    last_conflict = Some(err);
                }
            }
        }

        Err(last_conflict
            .map(AppError::from)
            .unwrap_or_else(|| AppError::TransientStore("transaction aborted".to_string())))
    }

    /// Unconditional write of a single document.
    pub fn insert<T: Document>(&self, doc: T) -> Result<(), AppError> {
        self.transact(|tx| {
            tx.put(doc.clone());
            Ok(())
        })
    }

    pub fn get<T: Document>(&self, id: Uuid) -> Option<T> {
        T::collection(self).get(&id).map(|entry| entry.doc.clone())
    }

    pub fn version_of(&self, key: &DocKey) -> u64 {
        match key {
            DocKey::User(id) => version(&self.users, id),
            DocKey::Booking(id) => version(&self.bookings, id),
            DocKey::Assignment(id) => version(&self.assignments, id),
            DocKey::Taxi(id) => version(&self.taxis, id),
            DocKey::Collection(collection) => self.collection_version(*collection),
        }
    }

    /// Bumped by every committed write into `collection`.
    pub fn collection_version(&self, collection: Collection) -> u64 {
        self.collection_versions
            .get(&collection)
            .map(|entry| *entry)
            .unwrap_or(0)
    }

    /// Moves a user's last known position without bumping any version.
    /// Returns the updated user, or `None` if there is no such user.
    pub fn set_location(&self, id: Uuid, location: GeoPoint) -> Option<User> {
        let _guard = self
            .commit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut entry = self.users.get_mut(&id)?;
        entry.doc.location = Some(location);
        Some(entry.doc.clone())
    }

    pub fn find<T, P>(&self, predicate: P) -> Vec<T>
    where
        T: Document,
        P: Fn(&T) -> bool,
    {
        T::collection(self)
            .iter()
            .filter(|entry| predicate(&entry.doc))
            .map(|entry| entry.doc.clone())
            .collect()
    }

    pub fn count<T: Document>(&self) -> usize {
        T::collection(self).len()
    }

    pub fn user(&self, id: Uuid) -> Option<User> {
        self.get(id)
    }

    pub fn booking(&self, id: Uuid) -> Option<Booking> {
        self.get(id)
    }

    pub fn tour_package(&self, id: Uuid) -> Option<TourPackage> {
        self.tour_packages.get(&id).map(|entry| entry.clone())
    }

    pub fn upsert_tour_package(&self, package: TourPackage) {
        self.tour_packages.insert(package.id, package);
    }

    fn apply(&self, write: Write) {
        let collection = match write {
            Write::User(mut doc) => {
                // Positions are owned by `set_location`; a committed user
                // write never rolls one back.
                let stored = self.users.get(&doc.id).map(|entry| entry.doc.location);
                if let Some(location) = stored {
                    doc.location = location;
                }
                bump(&self.users, doc.id, doc);
                Collection::Users
            }
            Write::Booking(doc) => {
                bump(&self.bookings, doc.id, doc);
                Collection::Bookings
            }
            Write::Assignment(doc) => {
                bump(&self.assignments, doc.id, doc);
                Collection::Assignments
            }
            Write::Taxi(doc) => {
                bump(&self.taxis, doc.id, doc);
                Collection::Taxis
            }
            Write::DeleteBooking(id) => {
                self.bookings.remove(&id);
                Collection::Bookings
            }
        };

        *self.collection_versions.entry(collection).or_insert(0) += 1;
    }
}

fn version<T>(collection: &DashMap<Uuid, Versioned<T>>, id: &Uuid) -> u64 {
    collection.get(id).map(|entry| entry.version).unwrap_or(0)
}

fn bump<T>(collection: &DashMap<Uuid, Versioned<T>>, id: Uuid, doc: T) {
    let next = version(collection, &id) + 1;
    collection.insert(id, Versioned { version: next, doc });
}

#[cfg(test)]
mod tests {
    use super::{Collection, DocKey, Store, StoreError};
    use crate::error::AppError;
    use crate::models::location::GeoPoint;
    use crate::models::user::User;

    fn user(name: &str) -> User {
        User::new(name.to_string(), format!("{name}@example.com"), None)
    }

    #[test]
    fn committed_writes_bump_versions() {
        let store = Store::new();
        let alice = user("alice");
        let id = alice.id;

        assert_eq!(store.version_of(&DocKey::User(id)), 0);
        store.insert(alice).unwrap();
        assert_eq!(store.version_of(&DocKey::User(id)), 1);

        let mut tx = store.begin();
        let mut loaded: User = tx.get(id).unwrap();
        loaded.is_online = true;
        tx.put(loaded);
        tx.commit().unwrap();

        assert_eq!(store.version_of(&DocKey::User(id)), 2);
        assert!(store.user(id).unwrap().is_online);
    }

    #[test]
    fn second_writer_of_the_same_read_loses() {
        let store = Store::new();
        let driver = user("driver");
        let id = driver.id;
        store.insert(driver).unwrap();

        let mut first = store.begin();
        let mut second = store.begin();

        let mut a: User = first.get(id).unwrap();
        let mut b: User = second.get(id).unwrap();
        a.is_available = false;
        b.is_available = false;
        first.put(a);
        second.put(b);

        assert_eq!(first.commit(), Ok(()));
        assert_eq!(second.commit(), Err(StoreError::Conflict(DocKey::User(id))));
        assert_eq!(store.version_of(&DocKey::User(id)), 2);
    }

    #[test]
    fn aborted_transaction_writes_nothing() {
        let store = Store::new();
        let driver = user("driver");
        let id = driver.id;
        store.insert(driver).unwrap();

        let other = user("other");
        let other_id = other.id;

        let mut first = store.begin();
        let _: Option<User> = first.get(id);
        first.put(other);

        store.insert(user("bystander")).unwrap();
        let mut touch = store.user(id).unwrap();
        touch.name = "renamed".to_string();
        store.insert(touch).unwrap();

        assert!(first.commit().is_err());
        assert!(store.user(other_id).is_none());
    }

    #[test]
    fn reads_see_own_buffered_writes() {
        let store = Store::new();
        let mut tx = store.begin();
        let alice = user("alice");
        let id = alice.id;
        tx.put(alice);

        let seen: User = tx.get(id).unwrap();
        assert_eq!(seen.name, "alice");
        assert!(store.user(id).is_none());
    }

    #[test]
    fn transact_surfaces_retryable_error_after_repeated_conflicts() {
        let store = Store::new();
        let driver = user("driver");
        let id = driver.id;
        store.insert(driver).unwrap();

        let result: Result<(), AppError> = store.transact(|tx| {
            let mut loaded: User = tx.get(id).unwrap();
            // Another writer sneaks in between our read and our commit, every time.
            let mut interloper = store.user(id).unwrap();
            interloper.name.push('!');
            store.insert(interloper).unwrap();

            loaded.is_available = false;
            tx.put(loaded);
            Ok(())
        });

        let err = result.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.user(id).unwrap().is_available);
    }

    #[test]
    fn transact_recovers_when_retry_succeeds() {
        let store = Store::new();
        let driver = user("driver");
        let id = driver.id;
        store.insert(driver).unwrap();

        let mut attempts = 0;
        store
            .transact(|tx| {
                attempts += 1;
                let mut loaded: User = tx.get(id).unwrap();
                if attempts == 1 {
                    let mut interloper = store.user(id).unwrap();
                    interloper.name.push('!');
                    store.insert(interloper).unwrap();
                }
                loaded.is_online = true;
                tx.put(loaded);
                Ok(())
            })
            .unwrap();

        assert_eq!(attempts, 2);
        let stored = store.user(id).unwrap();
        assert!(stored.is_online);
        assert!(stored.name.ends_with('!'));
    }

    #[test]
    fn scan_conflicts_with_a_document_that_starts_matching() {
        let store = Store::new();
        let mut sleeper = user("sleeper");
        sleeper.is_online = false;
        let id = sleeper.id;
        store.insert(sleeper).unwrap();

        let mut tx = store.begin();
        assert!(tx.scan(|user: &User| user.is_online).is_empty());
        tx.put(user("writer"));

        let mut woken = store.user(id).unwrap();
        woken.is_online = true;
        store.insert(woken).unwrap();

        assert_eq!(
            tx.commit(),
            Err(StoreError::Conflict(DocKey::Collection(Collection::Users)))
        );
        assert_eq!(store.count::<User>(), 1);
    }

    #[test]
    fn scan_is_not_disturbed_by_other_collections() {
        let store = Store::new();
        let mut tx = store.begin();
        assert!(tx.scan(|user: &User| user.is_online).is_empty());

        let before = store.collection_version(Collection::Users);
        store.insert(crate::engine::fixtures::booking(uuid::Uuid::new_v4())).unwrap();
        assert_eq!(store.collection_version(Collection::Users), before);

        tx.put(user("writer"));
        assert_eq!(tx.commit(), Ok(()));
    }

    #[test]
    fn location_moves_without_a_version_and_survives_later_writes() {
        let store = Store::new();
        let driver = user("driver");
        let id = driver.id;
        store.insert(driver).unwrap();

        let mut tx = store.begin();
        let mut stale: User = tx.get(id).unwrap();

        let here = GeoPoint { lat: 27.70, lng: 85.31 };
        let moved = store.set_location(id, here).unwrap();
        assert_eq!(moved.location, Some(here));
        assert_eq!(store.version_of(&DocKey::User(id)), 1);
        assert_eq!(store.collection_version(Collection::Users), 1);

        stale.is_online = true;
        tx.put(stale);
        assert_eq!(tx.commit(), Ok(()));

        let stored = store.user(id).unwrap();
        assert!(stored.is_online);
        assert_eq!(stored.location, Some(here));
        assert!(store.set_location(uuid::Uuid::new_v4(), here).is_none());
    }
}
