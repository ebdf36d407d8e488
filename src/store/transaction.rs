use std::collections::HashMap;
use std::sync::PoisonError;

use uuid::Uuid;

use super::{DocKey, Document, Store, StoreError, Write};

/// Read set plus buffered writes. Dropping it without `commit` aborts.
pub struct Transaction<'a> {
    store: &'a Store,
    reads: HashMap<DocKey, u64>,
    writes: HashMap<DocKey, Write>,
}

impl<'a> Transaction<'a> {
    pub(super) fn new(store: &'a Store) -> Self {
        Self {
            store,
            reads: HashMap::new(),
            writes: HashMap::new(),
        }
    }

    /// Committed state, bypassing the read set.
    pub fn store(&self) -> &'a Store {
        self.store
    }

    pub fn get<T: Document>(&mut self, id: Uuid) -> Option<T> {
        let key = T::key(id);
        if let Some(write) = self.writes.get(&key) {
            return T::pending(write).cloned();
        }

        let (version, doc) = match T::collection(self.store).get(&id) {
            Some(entry) => (entry.version, Some(entry.doc.clone())),
            None => (0, None),
        };
        self.reads.entry(key).or_insert(version);
        doc
    }

    /// Every returned document joins the read set, and so does the collection
    /// itself: a document that starts matching before commit is a conflict.
    pub fn scan<T, P>(&mut self, predicate: P) -> Vec<T>
    where
        T: Document,
        P: Fn(&T) -> bool,
    {
        let store = self.store;
        self.watch::<T>(store.collection_version(T::COLLECTION));
        let mut matched = Vec::new();

        for entry in T::collection(store).iter() {
            let key = T::key(*entry.key());
            let doc = match self.writes.get(&key) {
                Some(write) => match T::pending(write) {
                    Some(doc) => doc.clone(),
                    None => continue,
                },
                None => entry.doc.clone(),
            };

            if predicate(&doc) {
                self.reads.entry(key).or_insert(entry.version);
                matched.push(doc);
            }
        }

        matched
    }

    /// Ties the commit to `T`'s collection as it stood at `version`, for
    /// callers that looked through committed state with [`Store::find`].
    pub fn watch<T: Document>(&mut self, version: u64) {
        self.reads
            .entry(DocKey::Collection(T::COLLECTION))
            .or_insert(version);
    }

    pub fn put<T: Document>(&mut self, doc: T) {
        self.writes.insert(T::key(doc.id()), doc.into_write());
    }

    pub fn delete_booking(&mut self, id: Uuid) {
        self.writes
            .insert(DocKey::Booking(id), Write::DeleteBooking(id));
    }

    pub fn commit(self) -> Result<(), StoreError> {
        let _guard = self
            .store
            .commit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for (key, seen) in &self.reads {
            if self.store.version_of(key) != *seen {
                return Err(StoreError::Conflict(*key));
            }
        }

        for (_, write) in self.writes {
            self.store.apply(write);
        }

        Ok(())
    }
}
