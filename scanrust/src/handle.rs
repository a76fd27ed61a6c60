//! Generation-checked device handles
//!
//! Drivers keep per-device state in a [`HandleArena`]. Callers hold a
//! [`DeviceHandle`], which cannot be copied and is consumed on close, so a
//! device is released exactly once. Lookups check the slot generation and
//! the owning arena, so a stale or foreign handle is reported as
//! `DeviceNotFound` instead of reaching another device's state.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use scanrust_types::ErrorKind;

use crate::error::{Error, Result};

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Copyable identity of a handle slot (index + generation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId {
    index: u32,
    generation: u32,
}

impl HandleId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Exclusive token for one open device
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceHandle {
    id: HandleId,
    arena: u64,
}

impl DeviceHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle {}", self.id)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<tokio::sync::Mutex<T>>>,
}

/// Slot arena for per-device driver state
pub struct HandleArena<T> {
    id: u64,
    slots: parking_lot::Mutex<Vec<Slot<T>>>,
}

impl<T> HandleArena<T> {
    pub fn new() -> Self {
        Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            slots: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Store `value`, reusing a free slot when one exists
    pub fn insert(&self, value: T) -> DeviceHandle {
        let value = Some(Arc::new(tokio::sync::Mutex::new(value)));
        let mut slots = self.slots.lock();

        let id = match slots.iter().position(|s| s.value.is_none()) {
            Some(index) => {
                let slot = &mut slots[index];
                slot.generation = slot.generation.wrapping_add(1);
                slot.value = value;
                HandleId {
                    index: index as u32,
                    generation: slot.generation,
                }
            }
            None => {
                slots.push(Slot {
                    generation: 0,
                    value,
                });
                HandleId {
                    index: (slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };

        DeviceHandle { id, arena: self.id }
    }

    /// Shared access to the state behind `handle`
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` for a handle from another arena or a slot
    /// that has been released.
    pub fn get(&self, handle: &DeviceHandle) -> Result<Arc<tokio::sync::Mutex<T>>> {
        if handle.arena != self.id {
            return Err(Error::new(
                ErrorKind::DeviceNotFound,
                format!("{handle} belongs to another driver"),
            ));
        }
        self.lookup(handle.id).ok_or_else(|| {
            Error::new(ErrorKind::DeviceNotFound, format!("{handle} is stale"))
        })
    }

    /// Release the slot, consuming the handle
    ///
    /// # Errors
    ///
    /// Same conditions as [`HandleArena::get`].
    pub fn remove(&self, handle: DeviceHandle) -> Result<Arc<tokio::sync::Mutex<T>>> {
        if handle.arena != self.id {
            return Err(Error::new(
                ErrorKind::DeviceNotFound,
                format!("{handle} belongs to another driver"),
            ));
        }
        let mut slots = self.slots.lock();
        slots
            .get_mut(handle.id.index as usize)
            .filter(|s| s.generation == handle.id.generation)
            .and_then(|s| s.value.take())
            .ok_or_else(|| Error::new(ErrorKind::DeviceNotFound, format!("{handle} is stale")))
    }

    /// Look up a slot by id, checking the generation
    pub fn lookup(&self, id: HandleId) -> Option<Arc<tokio::sync::Mutex<T>>> {
        let slots = self.slots.lock();
        slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.value.clone())
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.lookup(id).is_some()
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for HandleArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_insert_get_remove() {
        let arena = HandleArena::new();
        let handle = arena.insert(42u32);

        assert_eq!(*arena.get(&handle).unwrap().lock().await, 42);
        assert_eq!(arena.len(), 1);

        let id = handle.id();
        let value = arena.remove(handle).unwrap();
        assert_eq!(*value.lock().await, 42);
        assert!(!arena.contains(id));
        assert!(arena.is_empty());
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let arena = HandleArena::new();
        let first = arena.insert("a");
        let stale = first.id();
        arena.remove(first).unwrap();

        let second = arena.insert("b");
        assert_eq!(second.id().index(), stale.index());
        assert_ne!(second.id().generation(), stale.generation());
        assert!(arena.lookup(stale).is_none());
        assert!(arena.contains(second.id()));
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let a = HandleArena::new();
        let b = HandleArena::<u8>::new();
        let handle = a.insert(1u8);

        let err = b.get(&handle).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
        assert!(b.remove(handle).is_err());
        assert_eq!(a.len(), 1);
    }
}
