//! Session registry: the single authority over the id → session mapping.
//!
//! Creation is split in two so the slow part (spawning and initializing an
//! interpreter) happens outside the lock: [`SessionRegistry::reserve`]
//! atomically claims an id, and [`Reservation::commit`] publishes the ready
//! handle. A reservation dropped without commit frees the id again, so a
//! failed initialization never leaves a half-built entry behind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::GatewayError;
use crate::session::SessionHandle;

enum Slot<H> {
    Reserved,
    Live(Arc<H>),
}

pub struct SessionRegistry<H = SessionHandle> {
    slots: Mutex<HashMap<String, Slot<H>>>,
}

impl<H> Default for SessionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> SessionRegistry<H> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot<H>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `id`. Only one caller can hold a reservation or live entry for a
    /// given id at a time.
    pub fn reserve(&self, id: &str) -> Result<Reservation<'_, H>, GatewayError> {
        let mut slots = self.slots();
        if slots.contains_key(id) {
            return Err(GatewayError::SessionAlreadyExists(id.to_string()));
        }
        slots.insert(id.to_string(), Slot::Reserved);
        Ok(Reservation {
            registry: self,
            id: id.to_string(),
            committed: false,
        })
    }

    /// Look up a live session. An id that is still initializing reports
    /// `SessionBusy`.
    pub fn get(&self, id: &str) -> Result<Arc<H>, GatewayError> {
        match self.slots().get(id) {
            Some(Slot::Live(handle)) => Ok(handle.clone()),
            Some(Slot::Reserved) => Err(GatewayError::SessionBusy(id.to_string())),
            None => Err(GatewayError::SessionNotFound(id.to_string())),
        }
    }

    /// Remove a live session and hand it back for teardown. Unknown ids and
    /// ids still being initialized are left alone and yield `None`.
    pub fn remove(&self, id: &str) -> Option<Arc<H>> {
        let mut slots = self.slots();
        if !matches!(slots.get(id), Some(Slot::Live(_))) {
            return None;
        }
        match slots.remove(id) {
            Some(Slot::Live(handle)) => Some(handle),
            _ => None,
        }
    }

    /// Remove `id` only if it still maps to `handle`. Used when a session
    /// tears itself down so a newer session under the same id is not evicted.
    pub fn remove_if_same(&self, id: &str, handle: &Arc<H>) -> bool {
        let mut slots = self.slots();
        let same = matches!(slots.get(id), Some(Slot::Live(current)) if Arc::ptr_eq(current, handle));
        if same {
            slots.remove(id);
        }
        same
    }

    pub fn contains(&self, id: &str) -> bool {
        matches!(self.slots().get(id), Some(Slot::Live(_)))
    }

    /// Live sessions, in no particular order.
    pub fn list(&self) -> Vec<(String, Arc<H>)> {
        self.slots()
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Live(handle) => Some((id.clone(), handle.clone())),
                Slot::Reserved => None,
            })
            .collect()
    }

    /// Remove every live session.
    pub fn drain(&self) -> Vec<(String, Arc<H>)> {
        let mut slots = self.slots();
        let live: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
            .map(|(id, _)| id.clone())
            .collect();
        live.into_iter()
            .filter_map(|id| match slots.remove(&id) {
                Some(Slot::Live(handle)) => Some((id, handle)),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An id claimed in the registry but not yet published.
pub struct Reservation<'a, H = SessionHandle> {
    registry: &'a SessionRegistry<H>,
    id: String,
    committed: bool,
}

impl<H> Reservation<'_, H> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Publish `handle` under the reserved id.
    pub fn commit(mut self, handle: Arc<H>) {
        self.registry
            .slots()
            .insert(self.id.clone(), Slot::Live(handle));
        self.committed = true;
    }
}

impl<H> Drop for Reservation<'_, H> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut slots = self.registry.slots();
        if matches!(slots.get(&self.id), Some(Slot::Reserved)) {
            slots.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_reserve_commit_get() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        let reservation = registry.reserve("s1").unwrap();
        assert!(matches!(registry.get("s1"), Err(GatewayError::SessionBusy(_))));
        assert!(!registry.contains("s1"));

        reservation.commit(Arc::new(7));
        assert_eq!(*registry.get("s1").unwrap(), 7);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_reservation_is_rejected() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        registry.reserve("s1").unwrap().commit(Arc::new(1));

        let err = registry.reserve("s1").err().unwrap();
        assert!(matches!(err, GatewayError::SessionAlreadyExists(id) if id == "s1"));
        assert_eq!(*registry.get("s1").unwrap(), 1);
    }

    #[test]
    fn test_dropped_reservation_frees_id() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        {
            let _reservation = registry.reserve("s1").unwrap();
        }
        assert!(matches!(registry.get("s1"), Err(GatewayError::SessionNotFound(_))));
        assert!(registry.reserve("s1").is_ok());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        registry.reserve("s1").unwrap().commit(Arc::new(1));

        assert_eq!(registry.remove("s1").map(|h| *h), Some(1));
        assert!(registry.remove("s1").is_none());
        assert!(registry.remove("never-existed").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_leaves_pending_reservation() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        let reservation = registry.reserve("s1").unwrap();
        assert!(registry.remove("s1").is_none());
        reservation.commit(Arc::new(3));
        assert_eq!(*registry.get("s1").unwrap(), 3);
    }

    #[test]
    fn test_remove_if_same_ignores_replacement() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        let old = Arc::new(1);
        registry.reserve("s1").unwrap().commit(old.clone());
        assert!(registry.remove("s1").is_some());

        let new = Arc::new(2);
        registry.reserve("s1").unwrap().commit(new.clone());
        assert!(!registry.remove_if_same("s1", &old));
        assert_eq!(*registry.get("s1").unwrap(), 2);
        assert!(registry.remove_if_same("s1", &new));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drain_skips_reservations() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        registry.reserve("a").unwrap().commit(Arc::new(1));
        registry.reserve("b").unwrap().commit(Arc::new(2));
        let pending = registry.reserve("c").unwrap();

        let mut drained: Vec<_> = registry.drain().into_iter().map(|(id, _)| id).collect();
        drained.sort();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(registry.is_empty());
        drop(pending);
    }

    #[test]
    fn test_concurrent_reserve_has_single_winner() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        let winners = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..16 {
                scope.spawn(|| {
                    if let Ok(reservation) = registry.reserve("contested") {
                        winners.fetch_add(1, Ordering::SeqCst);
                        reservation.commit(Arc::new(0));
                    }
                });
            }
        });

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }
}
