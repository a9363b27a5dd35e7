use crate::error::ShimError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

struct Table<T> {
    entries: HashMap<String, Arc<T>>,
    /// Ids claimed by an insert that is still being built.
    reserved: HashSet<String>,
}

/// Id-keyed table shared by the task service. Entries are reference counted
/// so callers can keep using one after it was removed.
pub struct Registry<T> {
    table: Mutex<Table<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            table: Mutex::new(Table {
                entries: HashMap::new(),
                reserved: HashSet::new(),
            }),
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table<T>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, id: &str, entry: Arc<T>) -> Result<(), ShimError> {
        self.reserve(id)?.fill(entry);
        Ok(())
    }

    /// Claims `id` before its entry exists. Other inserts of the same id fail
    /// with `AlreadyExists` until the reservation is filled or dropped.
    pub fn reserve(&self, id: &str) -> Result<Reservation<'_, T>, ShimError> {
        let mut table = self.lock();
        if table.entries.contains_key(id) || table.reserved.contains(id) {
            return Err(ShimError::AlreadyExists(id.to_string()));
        }
        table.reserved.insert(id.to_string());
        Ok(Reservation {
            registry: self,
            id: id.to_string(),
            filled: false,
        })
    }

    pub fn get(&self, id: &str) -> Result<Arc<T>, ShimError> {
        if id.is_empty() {
            return Err(ShimError::NotFound("empty id".to_string()));
        }
        self.lock()
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| ShimError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<T>> {
        self.lock().entries.remove(id)
    }

    /// No entries and no reservations.
    pub fn is_empty(&self) -> bool {
        let table = self.lock();
        table.entries.is_empty() && table.reserved.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn values(&self) -> Vec<Arc<T>> {
        self.lock().entries.values().cloned().collect()
    }
}

/// A claimed id. Dropping it without [`Reservation::fill`] releases the id.
pub struct Reservation<'a, T> {
    registry: &'a Registry<T>,
    id: String,
    filled: bool,
}

impl<T> Reservation<'_, T> {
    pub fn fill(mut self, entry: Arc<T>) {
        let mut table = self.registry.lock();
        table.reserved.remove(&self.id);
        table.entries.insert(self.id.clone(), entry);
        self.filled = true;
    }
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if !self.filled {
            self.registry.lock().reserved.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let registry: Registry<u32> = Registry::new();
        assert!(registry.is_empty());
        registry.insert("b", Arc::new(2)).unwrap();
        registry.insert("a", Arc::new(1)).unwrap();
        assert!(matches!(
            registry.insert("a", Arc::new(3)),
            Err(ShimError::AlreadyExists(id)) if id == "a"
        ));

        assert_eq!(*registry.get("a").unwrap(), 1);
        assert_eq!(registry.ids(), vec!["a", "b"]);
        assert_eq!(registry.len(), 2);

        let removed = registry.remove("a").unwrap();
        assert_eq!(*removed, 1);
        assert!(!registry.contains("a"));
        assert!(registry.remove("a").is_none());
    }

    #[test]
    fn test_reservation_blocks_the_id_until_released() {
        let registry: Registry<u32> = Registry::new();
        let reservation = registry.reserve("c1").unwrap();
        assert!(!registry.is_empty());
        assert!(!registry.contains("c1"));
        assert!(matches!(registry.reserve("c1"), Err(ShimError::AlreadyExists(_))));
        assert!(matches!(
            registry.insert("c1", Arc::new(1)),
            Err(ShimError::AlreadyExists(_))
        ));

        drop(reservation);
        assert!(registry.is_empty());

        registry.reserve("c1").unwrap().fill(Arc::new(7));
        assert_eq!(*registry.get("c1").unwrap(), 7);
        assert_eq!(registry.len(), 1);
        assert!(matches!(registry.reserve("c1"), Err(ShimError::AlreadyExists(_))));
    }

    #[test]
    fn test_get_unknown_or_empty() {
        let registry: Registry<u32> = Registry::new();
        assert!(matches!(registry.get(""), Err(ShimError::NotFound(_))));
        assert!(matches!(registry.get("x"), Err(ShimError::NotFound(_))));
    }
}
