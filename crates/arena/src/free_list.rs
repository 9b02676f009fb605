//! A free list of slot indexes.

/// Free list node.
#[derive(Clone, Copy, PartialEq, Eq)]
enum NextFree {
    /// This slot is free, and the next free slot is at the given index.
    Free(u32),

    /// This slot is in use.
    InUse,
}

/// Tracks which of the `N` slots of an arena are in use.
pub struct FreeList<const N: usize> {
    /// Where free_list[n] returns the index of the next free slot.
    free_list: [NextFree; N],

    /// The next free slot; equal to `N` when the list is exhausted.
    head: u32,

    /// Number of slots in use.
    count: u32,
}

impl<const N: usize> FreeList<N> {
    pub const fn new() -> Self {
        let mut free_list = [NextFree::InUse; N];
        let mut i = 0;
        while i < N {
            free_list[i] = NextFree::Free(i as u32 + 1);
            i += 1;
        }
        Self {
            free_list,
            head: 0,
            count: 0,
        }
    }

    /// Returns the index of the allocated slot, if any slot is left.
    pub fn allocate(&mut self) -> Option<usize> {
        let head = self.head as usize;
        if head >= N {
            return None;
        }
        match self.free_list[head] {
            NextFree::Free(next) => {
                self.head = next;
                self.free_list[head] = NextFree::InUse;
                self.count += 1;
                Some(head)
            }
            NextFree::InUse => panic!("Free list head points to a slot in use"),
        }
    }

    /// Returns a slot to the list.
    pub fn free(&mut self, idx: usize) {
        if self.free_list[idx] != NextFree::InUse {
            panic!("Trying to free an already free slot");
        }

        self.free_list[idx] = NextFree::Free(self.head);
        self.head = idx as u32;
        self.count -= 1;
    }

    pub fn is_free(&self, idx: usize) -> bool {
        self.free_list[idx] != NextFree::InUse
    }

    /// Number of slots that can still be allocated.
    pub fn capacity(&self) -> usize {
        N - self.count as usize
    }

    /// Number of slots in use.
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

// ———————————————————————————————— Iterator ———————————————————————————————— //

/// Iterates over the indexes of the slots in use.
pub struct InUseIterator<'a, const N: usize> {
    free_list: &'a FreeList<N>,
    next: usize,
}

impl<'a, const N: usize> Iterator for InUseIterator<'a, N> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < N {
            let idx = self.next;
            self.next += 1;
            if self.free_list.free_list[idx] == NextFree::InUse {
                return Some(idx);
            }
        }

        None
    }
}

impl<'a, const N: usize> IntoIterator for &'a FreeList<N> {
    type Item = usize;
    type IntoIter = InUseIterator<'a, N>;

    fn into_iter(self) -> Self::IntoIter {
        InUseIterator {
            free_list: self,
            next: 0,
        }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity() {
        let mut list: FreeList<4> = FreeList::new();
        assert_eq!(list.capacity(), 4);

        assert_eq!(list.allocate(), Some(0));
        assert_eq!(list.allocate(), Some(1));
        assert_eq!(list.allocate(), Some(2));
        assert_eq!(list.allocate(), Some(3));
        assert_eq!(list.allocate(), None);
        assert_eq!(list.capacity(), 0);

        list.free(2);
        list.free(0);
        assert_eq!(list.capacity(), 2);
        assert_eq!(list.into_iter().collect::<Vec<_>>(), vec![1, 3]);

        // Freed slots are reused last-in first-out
        assert_eq!(list.allocate(), Some(0));
        assert_eq!(list.allocate(), Some(2));
        assert_eq!(list.allocate(), None);
    }

    #[test]
    #[should_panic]
    fn double_free() {
        let mut list: FreeList<2> = FreeList::new();
        let idx = list.allocate().unwrap();
        list.free(idx);
        list.free(idx);
    }
}
