//! Generational Arenas
//!
//! Objects are stored in a statically sized arena and referred to through handles. A handle
//! carries the generation of its slot, so a handle kept after its object was removed is detected
//! instead of silently aliasing the next object stored in the same slot.
#![cfg_attr(not(test), no_std)]

pub mod free_list;

use core::marker::PhantomData;
use core::ops::{Index, IndexMut};

use crate::free_list::{FreeList, InUseIterator};

// ——————————————————————————— Generational Arena ——————————————————————————— //

pub struct GenArena<T, const N: usize> {
    /// The backing store, `None` for free slots.
    store: [Option<T>; N],

    /// Tracks free slots.
    free_list: FreeList<N>,

    /// The generation of each slot, bumped on removal.
    gen: [u32; N],
}

impl<T, const N: usize> GenArena<T, N> {
    pub const fn new() -> Self {
        Self {
            store: [const { None }; N],
            free_list: FreeList::new(),
            gen: [0; N],
        }
    }

    /// Stores `item`, returning `None` if the arena is full.
    pub fn insert(&mut self, item: T) -> Option<Handle<T>> {
        let idx = self.free_list.allocate()?;
        self.store[idx] = Some(item);
        Some(Handle {
            idx,
            gen: self.gen[idx],
            _type: PhantomData,
        })
    }

    /// Takes the object out of the arena. This invalidates all existing handles to that object.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        if !self.is_valid(handle) {
            return None;
        }
        self.free_list.free(handle.idx);
        self.gen[handle.idx] = self.gen[handle.idx].wrapping_add(1);
        self.store[handle.idx].take()
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        if self.is_valid(handle) {
            self.store[handle.idx].as_ref()
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        if self.is_valid(handle) {
            self.store[handle.idx].as_mut()
        } else {
            None
        }
    }

    pub fn is_valid(&self, handle: Handle<T>) -> bool {
        handle.idx < N && self.gen[handle.idx] == handle.gen && !self.free_list.is_free(handle.idx)
    }

    /// Number of objects that can still be inserted.
    pub fn capacity(&self) -> usize {
        self.free_list.capacity()
    }

    pub fn len(&self) -> usize {
        self.free_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free_list.is_empty()
    }
}

impl<T, const N: usize> Default for GenArena<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

// ———————————————————————————————— Indexing ———————————————————————————————— //

impl<T, const N: usize> Index<Handle<T>> for GenArena<T, N> {
    type Output = T;

    #[inline]
    fn index(&self, handle: Handle<T>) -> &Self::Output {
        match self.get(handle) {
            Some(item) => item,
            None => panic!("Invalid handle {}, this is likely a use after free", handle),
        }
    }
}

impl<T, const N: usize> IndexMut<Handle<T>> for GenArena<T, N> {
    fn index_mut(&mut self, handle: Handle<T>) -> &mut Self::Output {
        match self.get_mut(handle) {
            Some(item) => item,
            None => panic!("Invalid handle {}, this is likely a use after free", handle),
        }
    }
}

// ————————————————————————————————— Handle ————————————————————————————————— //

/// An handle to an object of type T stored in a generational arena.
pub struct Handle<T> {
    idx: usize,
    gen: u32,
    _type: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub fn idx(self) -> usize {
        self.idx
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.idx == other.idx && self.gen == other.gen
    }
}

impl<T> Eq for Handle<T> {}

impl<T> core::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "H({}, gen {})", self.idx, self.gen)
    }
}

impl<T> core::fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "H({}, gen {})", self.idx, self.gen)
    }
}

// ———————————————————————————————— Iterator ———————————————————————————————— //

pub struct ArenaIterator<'a, T, const N: usize> {
    arena: &'a GenArena<T, N>,
    iterator: InUseIterator<'a, N>,
}

impl<'a, T, const N: usize> Iterator for ArenaIterator<'a, T, N> {
    type Item = (Handle<T>, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.iterator.next()?;
        let handle = Handle {
            idx,
            gen: self.arena.gen[idx],
            _type: PhantomData,
        };
        Some((handle, &self.arena[handle]))
    }
}

impl<'a, T, const N: usize> IntoIterator for &'a GenArena<T, N> {
    type Item = (Handle<T>, &'a T);
    type IntoIter = ArenaIterator<'a, T, N>;

    fn into_iter(self) -> Self::IntoIter {
        ArenaIterator {
            arena: self,
            iterator: self.free_list.into_iter(),
        }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
