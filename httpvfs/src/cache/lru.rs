use rustc_hash::FxHashMap;

/// A charge-bounded LRU list.
///
/// Handles live in a slab and are linked in access order: `head` is the
/// least recently used handle and `tail` the most recently used one. The list
/// tracks the total charge of its handles but never evicts on its own, the
/// owner decides what to do with evicted values.
pub(crate) struct LRUList<V> {
    table: FxHashMap<u64, usize>,
    handles: Vec<Option<LRUHandle<V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    usage: usize,
}

struct LRUHandle<V> {
    key: u64,
    value: V,
    charge: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<V> LRUList<V> {
    pub(crate) fn new() -> Self {
        Self {
            table: FxHashMap::default(),
            handles: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            usage: 0,
        }
    }

    #[inline]
    pub(crate) fn usage(&self) -> usize {
        self.usage
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    /// Inserts a value as the most recently used one, returning the value it
    /// replaced.
    pub(crate) fn insert(&mut self, key: u64, value: V, charge: usize) -> Option<V> {
        let old = self.remove(key);
        let handle = LRUHandle {
            key,
            value,
            charge,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.handles[idx] = Some(handle);
                idx
            }
            None => {
                self.handles.push(Some(handle));
                self.handles.len() - 1
            }
        };
        self.table.insert(key, idx);
        self.lru_insert(idx);
        self.usage += charge;
        old
    }

    /// Returns the value and marks it as the most recently used one.
    pub(crate) fn lookup(&mut self, key: u64) -> Option<&mut V> {
        let idx = *self.table.get(&key)?;
        self.lru_remove(idx);
        self.lru_insert(idx);
        self.handles[idx].as_mut().map(|h| &mut h.value)
    }

    /// Returns the value without touching the access order.
    pub(crate) fn peek(&self, key: u64) -> Option<&V> {
        let idx = *self.table.get(&key)?;
        self.handles[idx].as_ref().map(|h| &h.value)
    }

    pub(crate) fn peek_mut(&mut self, key: u64) -> Option<&mut V> {
        let idx = *self.table.get(&key)?;
        self.handles[idx].as_mut().map(|h| &mut h.value)
    }

    pub(crate) fn remove(&mut self, key: u64) -> Option<V> {
        let idx = self.table.remove(&key)?;
        self.lru_remove(idx);
        let handle = self.handles[idx].take()?;
        self.free.push(idx);
        self.usage -= handle.charge;
        Some(handle.value)
    }

    /// Removes all values, from the least recently used one.
    pub(crate) fn drain(&mut self) -> Vec<(u64, V)> {
        self.evict_from_lru(1, 0)
    }

    /// Pops least recently used values until `charge` more bytes fit in
    /// `capacity` or the list is empty.
    pub(crate) fn evict_from_lru(&mut self, charge: usize, capacity: usize) -> Vec<(u64, V)> {
        let mut evicted = Vec::new();
        while self.usage + charge > capacity {
            let Some(idx) = self.head else {
                break;
            };
            let Some(key) = self.handles[idx].as_ref().map(|h| h.key) else {
                break;
            };
            if let Some(value) = self.remove(key) {
                evicted.push((key, value));
            }
        }
        evicted
    }

    fn lru_insert(&mut self, idx: usize) {
        let prev = self.tail;
        if let Some(h) = self.handles[idx].as_mut() {
            h.prev = prev;
            h.next = None;
        }
        match prev {
            Some(p) => self.link_mut(p).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn lru_remove(&mut self, idx: usize) {
        let (prev, next) = match self.handles[idx].as_mut() {
            Some(h) => (h.prev.take(), h.next.take()),
            None => return,
        };
        match prev {
            Some(p) => self.link_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.link_mut(n).prev = prev,
            None => self.tail = prev,
        }
    }

    fn link_mut(&mut self, idx: usize) -> &mut LRUHandle<V> {
        self.handles[idx]
            .as_mut()
            .unwrap_or_else(|| unreachable!("linked handle {idx} is vacant"))
    }
}
