//! Arena-indexed doubly linked packet queue.
//!
//! Elements live in a slab of entries linked through `next_idx` / `prev_idx`. Freed entries are
//! recycled through a free list. Each entry carries a generation that is bumped when its element
//! is removed, so an [`ElementId`] to a removed element never resolves to a later occupant.

type EntryIndex = u32;

const NIL: EntryIndex = EntryIndex::MAX;

/// Handle to an element of a [`PacketQueue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElementId {
    idx: EntryIndex,
    generation: u32,
}

struct Entry<T> {
    next_idx: EntryIndex,
    prev_idx: EntryIndex,
    generation: u32,
    value: Option<T>,
}

/// FIFO with O(1) append, pop and arbitrary removal. Not internally synchronized.
pub struct PacketQueue<T> {
    entries: Vec<Entry<T>>,
    free_list: Vec<EntryIndex>,
    head_idx: EntryIndex,
    tail_idx: EntryIndex,
    count: usize,
}

impl<T> Default for PacketQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PacketQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            head_idx: NIL,
            tail_idx: NIL,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        debug_assert_eq!(self.head_idx == NIL, self.tail_idx == NIL);
        self.head_idx == NIL
    }

    fn alloc(&mut self, value: T) -> EntryIndex {
        if let Some(idx) = self.free_list.pop() {
            let ref mut entry = self.entries[idx as usize];
            entry.value = Some(value);
            entry.next_idx = NIL;
            entry.prev_idx = NIL;
            idx
        } else {
            let idx = self.entries.len() as EntryIndex;
            assert!(idx != NIL, "packet queue capacity exceeded");

            self.entries.push(Entry {
                next_idx: NIL,
                prev_idx: NIL,
                generation: 0,
                value: Some(value),
            });

            idx
        }
    }

    fn link_after(&mut self, idx: EntryIndex, prev_idx: EntryIndex) {
        let next_idx = if prev_idx == NIL {
            self.head_idx
        } else {
            self.entries[prev_idx as usize].next_idx
        };

        // entry.prev := prev, entry.next := next
        self.entries[idx as usize].prev_idx = prev_idx;
        self.entries[idx as usize].next_idx = next_idx;

        // prev.next := entry
        if prev_idx == NIL {
            self.head_idx = idx;
        } else {
            self.entries[prev_idx as usize].next_idx = idx;
        }

        // next.prev := entry
        if next_idx == NIL {
            self.tail_idx = idx;
        } else {
            self.entries[next_idx as usize].prev_idx = idx;
        }

        self.count += 1;
    }

    fn unlink(&mut self, idx: EntryIndex) -> T {
        let next_idx = self.entries[idx as usize].next_idx;
        let prev_idx = self.entries[idx as usize].prev_idx;

        // entry.prev.next := entry.next
        if prev_idx == NIL {
            self.head_idx = next_idx;
        } else {
            self.entries[prev_idx as usize].next_idx = next_idx;
        }

        // entry.next.prev := entry.prev
        if next_idx == NIL {
            self.tail_idx = prev_idx;
        } else {
            self.entries[next_idx as usize].prev_idx = prev_idx;
        }

        let ref mut entry = self.entries[idx as usize];
        entry.next_idx = NIL;
        entry.prev_idx = NIL;
        entry.generation = entry.generation.wrapping_add(1);
        let value = entry.value.take();

        self.free_list.push(idx);
        self.count -= 1;

        match value {
            Some(value) => value,
            None => unreachable!("linked entry without a value"),
        }
    }

    /// Appends a value to the tail of the queue.
    pub fn put(&mut self, value: T) -> ElementId {
        let idx = self.alloc(value);
        let tail_idx = self.tail_idx;
        self.link_after(idx, tail_idx);
        self.element_id(idx)
    }

    fn element_id(&self, idx: EntryIndex) -> ElementId {
        ElementId {
            idx,
            generation: self.entries[idx as usize].generation,
        }
    }

    /// Removes and returns the head of the queue.
    pub fn pick(&mut self) -> Option<T> {
        if self.head_idx == NIL {
            return None;
        }
        let head_idx = self.head_idx;
        Some(self.unlink(head_idx))
    }

    /// Returns the head of the queue without removing it.
    pub fn peek(&self) -> Option<&T> {
        if self.head_idx == NIL {
            return None;
        }
        self.entries[self.head_idx as usize].value.as_ref()
    }

    fn is_live(&self, id: ElementId) -> bool {
        match self.entries.get(id.idx as usize) {
            Some(entry) => entry.generation == id.generation && entry.value.is_some(),
            None => false,
        }
    }

    /// Unlinks an arbitrary element. Returns `None` if the handle no longer refers to a live
    /// element.
    pub fn remove(&mut self, id: ElementId) -> Option<T> {
        if !self.is_live(id) {
            return None;
        }
        Some(self.unlink(id.idx))
    }

    pub fn get(&self, id: ElementId) -> Option<&T> {
        if !self.is_live(id) {
            return None;
        }
        self.entries[id.idx as usize].value.as_ref()
    }

    pub fn get_mut(&mut self, id: ElementId) -> Option<&mut T> {
        if !self.is_live(id) {
            return None;
        }
        self.entries[id.idx as usize].value.as_mut()
    }

    /// Returns the first element, head to tail, for which `pred` holds.
    pub fn find<F>(&self, mut pred: F) -> Option<ElementId>
    where
        F: FnMut(&T) -> bool,
    {
        let mut idx = self.head_idx;

        while idx != NIL {
            let ref entry = self.entries[idx as usize];
            if let Some(ref value) = entry.value {
                if pred(value) {
                    return Some(self.element_id(idx));
                }
            }
            idx = entry.next_idx;
        }

        None
    }

    /// Inserts `value` before the first element that compares greater, keeping an ascending
    /// queue sorted. Equal elements keep their insertion order.
    pub fn insert_sorted_by<F>(&mut self, value: T, mut cmp: F) -> ElementId
    where
        F: FnMut(&T, &T) -> std::cmp::Ordering,
    {
        let mut prev_idx = NIL;
        let mut idx = self.head_idx;

        while idx != NIL {
            let ref entry = self.entries[idx as usize];
            if let Some(ref existing) = entry.value {
                if cmp(existing, &value) == std::cmp::Ordering::Greater {
                    break;
                }
            }
            prev_idx = idx;
            idx = entry.next_idx;
        }

        let new_idx = self.alloc(value);
        self.link_after(new_idx, prev_idx);
        self.element_id(new_idx)
    }

    /// Visits every element head to tail.
    pub fn walk<F>(&self, mut visitor: F)
    where
        F: FnMut(&T),
    {
        self.iter().for_each(|value| visitor(value));
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            idx: self.head_idx,
        }
    }

    /// Frees every element. Handles issued before the call stay stale.
    pub fn clear(&mut self) {
        self.free_list.clear();

        for (idx, entry) in self.entries.iter_mut().enumerate() {
            if entry.value.take().is_some() {
                entry.generation = entry.generation.wrapping_add(1);
            }
            entry.next_idx = NIL;
            entry.prev_idx = NIL;
            self.free_list.push(idx as EntryIndex);
        }

        self.head_idx = NIL;
        self.tail_idx = NIL;
        self.count = 0;
    }
}

pub struct Iter<'a, T> {
    queue: &'a PacketQueue<T>,
    idx: EntryIndex,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        while self.idx != NIL {
            let ref entry = self.queue.entries[self.idx as usize];
            self.idx = entry.next_idx;
            if let Some(ref value) = entry.value {
                return Some(value);
            }
        }
        None
    }
}
