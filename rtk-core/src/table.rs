//! Object table
//!
//! Arena storage for kernel objects indexed by an object reference.
//!
//! # Design
//!
//! - Index 0 is reserved (NULL reference)
//! - Objects are stored in a flat vector with a free list
//! - Freed slots are reused, so a reference must not outlive its object
//!
//! Indexing with a reference that does not name a live object is a kernel
//! bug and panics; use [`ObjectTable::get`] where absence is expected.

use alloc::vec::Vec;
use core::marker::PhantomData;
use core::ops::{Index, IndexMut};

use crate::refs::ObjectKey;

/// One table slot.
enum Slot<T> {
    /// Free slot, linking to the next free index (0 terminates).
    Free(u32),
    /// Live object.
    Occupied(T),
}

/// Flat arena of kernel objects.
pub struct ObjectTable<K: ObjectKey, T> {
    slots: Vec<Slot<T>>,
    free_head: u32,
    len: usize,
    _key: PhantomData<K>,
}

impl<K: ObjectKey, T> ObjectTable<K, T> {
    /// Create an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: 0,
            len: 0,
            _key: PhantomData,
        }
    }

    /// Number of live objects.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check if the table holds no objects.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slot_index(key: K) -> Option<usize> {
        match key.index() {
            0 => None,
            i => Some(i as usize - 1),
        }
    }

    /// Store an object and return its reference.
    ///
    /// Returns `None` once the 32-bit index space is exhausted.
    pub fn insert(&mut self, object: T) -> Option<K> {
        self.insert_with(|_| object)
    }

    /// Store an object built from its own reference.
    ///
    /// Objects that carry a self-reference (a context's helper, a lone
    /// timeslice's ring links) need to know their index before they exist.
    pub fn insert_with<F>(&mut self, build: F) -> Option<K>
    where
        F: FnOnce(K) -> T,
    {
        let index = if self.free_head != 0 {
            let index = self.free_head;
            match self.slots[index as usize - 1] {
                Slot::Free(next) => self.free_head = next,
                Slot::Occupied(_) => unreachable!("free list points at a live slot"),
            }
            index
        } else {
            let index = u32::try_from(self.slots.len() + 1).ok()?;
            self.slots.push(Slot::Free(0));
            index
        };

        let key = K::from_index(index);
        self.slots[index as usize - 1] = Slot::Occupied(build(key));
        self.len += 1;
        Some(key)
    }

    /// Remove an object, returning it.
    pub fn remove(&mut self, key: K) -> Option<T> {
        let i = Self::slot_index(key)?;
        let slot = self.slots.get_mut(i)?;
        if matches!(slot, Slot::Free(_)) {
            return None;
        }

        let old = core::mem::replace(slot, Slot::Free(self.free_head));
        self.free_head = key.index();
        self.len -= 1;

        match old {
            Slot::Occupied(object) => Some(object),
            Slot::Free(_) => None,
        }
    }

    /// Check if `key` names a live object.
    #[inline]
    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    /// Look up an object.
    #[must_use]
    pub fn get(&self, key: K) -> Option<&T> {
        match self.slots.get(Self::slot_index(key)?)? {
            Slot::Occupied(object) => Some(object),
            Slot::Free(_) => None,
        }
    }

    /// Look up an object mutably.
    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        match self.slots.get_mut(Self::slot_index(key)?)? {
            Slot::Occupied(object) => Some(object),
            Slot::Free(_) => None,
        }
    }

    /// Iterate over all live objects.
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Occupied(object) => Some((K::from_index(i as u32 + 1), object)),
            Slot::Free(_) => None,
        })
    }
}

impl<K: ObjectKey, T> Default for ObjectTable<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ObjectKey + core::fmt::Debug, T> Index<K> for ObjectTable<K, T> {
    type Output = T;

    fn index(&self, key: K) -> &T {
        match self.get(key) {
            Some(object) => object,
            None => panic!("stale object reference {:?}", key),
        }
    }
}

impl<K: ObjectKey + core::fmt::Debug, T> IndexMut<K> for ObjectTable<K, T> {
    fn index_mut(&mut self, key: K) -> &mut T {
        match self.get_mut(key) {
            Some(object) => object,
            None => panic!("stale object reference {:?}", key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::ContextRef;

    #[test]
    fn test_insert_and_lookup() {
        let mut table: ObjectTable<ContextRef, u32> = ObjectTable::new();
        assert!(table.is_empty());

        let a = table.insert(10).unwrap();
        let b = table.insert(20).unwrap();
        assert_eq!(a.index(), 1);
        assert_eq!(b.index(), 2);
        assert_eq!(table[a], 10);
        assert_eq!(table.get(b), Some(&20));
        assert_eq!(table.get(ContextRef::NULL), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_reuses_slot() {
        let mut table: ObjectTable<ContextRef, u32> = ObjectTable::new();
        let a = table.insert(1).unwrap();
        let _b = table.insert(2).unwrap();

        assert_eq!(table.remove(a), Some(1));
        assert_eq!(table.remove(a), None);
        assert!(!table.contains(a));

        let c = table.insert(3).unwrap();
        assert_eq!(c, a);
        assert_eq!(table[c], 3);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_insert_with_sees_own_key() {
        let mut table: ObjectTable<ContextRef, ContextRef> = ObjectTable::new();
        let k = table.insert_with(|me| me).unwrap();
        assert_eq!(table[k], k);
    }

    #[test]
    #[should_panic(expected = "stale object reference")]
    fn test_index_stale_panics() {
        let mut table: ObjectTable<ContextRef, u32> = ObjectTable::new();
        let a = table.insert(1).unwrap();
        table.remove(a);
        let _ = table[a];
    }

    #[test]
    fn test_iter_skips_free() {
        let mut table: ObjectTable<ContextRef, u32> = ObjectTable::new();
        let a = table.insert(1).unwrap();
        let b = table.insert(2).unwrap();
        let c = table.insert(3).unwrap();
        table.remove(b);

        let live: Vec<_> = table.iter().map(|(k, v)| (k, *v)).collect();
        assert_eq!(live, vec![(a, 1), (c, 3)]);
    }
}
