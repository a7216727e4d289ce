// Numan Thabit 2025
//! Fixed-capacity FIFO over a preallocated slot array.

/// Circular buffer that overwrites its oldest entry once full.
#[derive(Debug, Clone)]
pub struct SnapshotRing<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> SnapshotRing<T> {
    /// Create a ring holding at most `capacity` entries (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    /// Append `value`, returning the entry it displaced when full.
    pub fn push(&mut self, value: T) -> Option<T> {
        let capacity = self.slots.len();
        let tail = (self.head + self.len) % capacity;
        if self.len < capacity {
            self.slots[tail] = Some(value);
            self.len += 1;
            None
        } else {
            let evicted = self.slots[self.head].replace(value);
            self.head = (self.head + 1) % capacity;
            evicted
        }
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let capacity = self.slots.len();
        (0..self.len).filter_map(move |offset| self.slots[(self.head + offset) % capacity].as_ref())
    }

    /// Most recent entry.
    pub fn latest(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        let capacity = self.slots.len();
        self.slots[(self.head + self.len - 1) % capacity].as_ref()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing has been pushed.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
