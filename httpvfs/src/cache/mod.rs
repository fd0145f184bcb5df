//! The page cache.
//!
//! Every page of an opened file maps to one slot keyed by `(file_id, page)`:
//!
//! - [`Slot::Pending`]: a fetch of a chunk rooted at this page is in flight.
//!   Later requesters join it instead of issuing their own.
//! - [`Slot::Data`]: the bytes of a chunk rooted at this page. A chunk covers
//!   one or more consecutive pages.
//! - [`Slot::Reference`]: the page lives inside a chunk rooted at an earlier
//!   page. Roots are evicted independently of their references, so a
//!   reference may dangle. A dangling reference is a miss.
//!
//! The cache is owned by the dispatcher and never shared, so it needs no
//! synchronization. All slots are charged against a single byte budget and
//! evicted in access order.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::AbortHandle;
use log::trace;

use crate::stats::AtomicCacheStats;

mod lru;
use lru::LRUList;

/// The charge of a reference slot.
pub(crate) const REFERENCE_CHARGE: usize = 16;

#[derive(Default, PartialEq, Eq, Debug, Clone, Copy)]
pub(crate) struct Key(u64);

impl Key {
    pub(crate) fn new(file_id: u32, page: u32) -> Self {
        Self((file_id as u64) << 32 | page as u64)
    }

    pub(crate) fn file_id(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub(crate) fn page(&self) -> u32 {
        self.0 as u32
    }
}

impl From<u64> for Key {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

impl From<Key> for u64 {
    fn from(k: Key) -> Self {
        k.0
    }
}

pub(crate) enum Slot<W> {
    Pending(PendingFetch<W>),
    Data(Bytes),
    Reference(u32),
}

pub(crate) struct PendingFetch<W> {
    id: u64,
    abort: AbortHandle,
    waiters: Vec<W>,
}

/// The outcome of a lookup.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Lookup {
    /// The bytes of the page, at most `page_size` long.
    Hit(Bytes),
    /// A fetch rooted at this page is in flight.
    Pending,
    Miss,
}

/// A fetch that was registered in the cache.
pub(crate) struct Fetch<W> {
    pub(crate) id: u64,
    /// Waiters of pending fetches evicted to make room for this one.
    pub(crate) aborted: Vec<W>,
}

/// A fetch that completed while it was still registered.
pub(crate) struct Completion<W> {
    pub(crate) waiters: Vec<W>,
    pub(crate) aborted: Vec<W>,
}

pub(crate) struct PageCache<W> {
    lru: LRUList<Slot<W>>,
    capacity: usize,
    next_fetch_id: u64,
    stats: Arc<AtomicCacheStats>,
}

impl<W> PageCache<W> {
    pub(crate) fn new(capacity: usize, stats: Arc<AtomicCacheStats>) -> Self {
        Self {
            lru: LRUList::new(),
            capacity,
            next_fetch_id: 1,
            stats,
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of bytes charged, including reservations of pending fetches.
    #[cfg(test)]
    pub(crate) fn usage(&self) -> usize {
        self.lru.usage()
    }

    /// Looks up a page and marks it (and the root it refers to) as recently
    /// used.
    pub(crate) fn lookup(&mut self, key: Key, page_size: u32) -> Lookup {
        let root = match self.lru.lookup(key.into()) {
            None => None,
            Some(Slot::Pending(_)) => return Lookup::Pending,
            Some(Slot::Data(chunk)) => {
                let bytes = page_slice(chunk, 0, page_size);
                return self.hit(bytes);
            }
            Some(Slot::Reference(root)) => Some(*root),
        };
        if let Some(root) = root.filter(|root| *root < key.page()) {
            let offset = (key.page() - root) as usize * page_size as usize;
            let root_key = Key::new(key.file_id(), root);
            if let Some(Slot::Data(chunk)) = self.lru.lookup(root_key.into()) {
                if offset < chunk.len() {
                    let bytes = page_slice(chunk, offset, page_size);
                    return self.hit(bytes);
                }
            }
            trace!("reference {key:?} to root {root} dangles");
        }
        self.stats.lookup_miss.inc();
        Lookup::Miss
    }

    fn hit(&self, bytes: Bytes) -> Lookup {
        self.stats.lookup_hit.inc();
        Lookup::Hit(bytes)
    }

    /// Joins the fetch in flight for `key`, giving the waiter back if there
    /// is none.
    pub(crate) fn join(&mut self, key: Key, waiter: W) -> Result<(), W> {
        match self.lru.peek_mut(key.into()) {
            Some(Slot::Pending(pending)) => {
                pending.waiters.push(waiter);
                Ok(())
            }
            _ => Err(waiter),
        }
    }

    /// Returns the number of bytes to fetch for a miss on `key`.
    ///
    /// A miss right after the chunk containing the previous page doubles that
    /// chunk. Any other miss fetches a single page. The result is a multiple of
    /// `page_size` no larger than `limit`, leaves room in the cache for the
    /// references of the chunk, and is never smaller than one page.
    pub(crate) fn chunk_size(&self, key: Key, page_size: u32, limit: usize) -> usize {
        let page_size = page_size as usize;
        let Some(prev) = key.page().checked_sub(1) else {
            return page_size;
        };
        let prev_chunk = match self.lru.peek(Key::new(key.file_id(), prev).into()) {
            Some(Slot::Data(chunk)) => chunk.len(),
            Some(Slot::Reference(root)) => {
                match self.lru.peek(Key::new(key.file_id(), *root).into()) {
                    Some(Slot::Data(chunk)) => chunk.len(),
                    _ => 0,
                }
            }
            _ => 0,
        };
        if prev_chunk == 0 {
            return page_size;
        }
        let pages = (prev_chunk + page_size - 1) / page_size;
        let size = pages.saturating_mul(2).saturating_mul(page_size);
        let limit = limit / page_size * page_size;
        // The chunk and the references to its trailing pages must fit together.
        let fits = (self.capacity + REFERENCE_CHARGE) / (page_size + REFERENCE_CHARGE);
        size.min(limit)
            .min(fits.saturating_mul(page_size))
            .max(page_size)
    }

    /// Registers a pending fetch of `len` bytes rooted at `key`.
    ///
    /// The fetch reserves its length in the budget so that concurrent fetches
    /// can not overshoot the capacity once they complete.
    pub(crate) fn begin_fetch(&mut self, key: Key, len: usize, abort: AbortHandle, waiter: W) -> Fetch<W> {
        let id = self.next_fetch_id;
        self.next_fetch_id += 1;
        let pending = PendingFetch {
            id,
            abort,
            waiters: vec![waiter],
        };
        let charge = len.min(self.capacity);
        let aborted = self.install(key, Slot::Pending(pending), charge);
        Fetch { id, aborted }
    }

    /// Installs the chunk of a completed fetch and hands back its waiters.
    ///
    /// Returns `None` if the fetch is no longer registered: it was evicted or
    /// superseded, and its result must be discarded.
    pub(crate) fn complete_fetch(&mut self, key: Key, id: u64, page_size: u32, chunk: Bytes) -> Option<Completion<W>> {
        let pending = self.take_pending(key, id)?;
        let mut aborted = Vec::new();
        if !chunk.is_empty() && chunk.len() <= self.capacity {
            let pages = (chunk.len() + page_size as usize - 1) / page_size as usize;
            let charge = chunk.len();
            aborted.extend(self.install(key, Slot::Data(chunk), charge));
            for i in 1..pages as u32 {
                let page = key.page() + i;
                let sibling = Key::new(key.file_id(), page);
                match self.lru.peek(sibling.into()) {
                    None | Some(Slot::Reference(_)) => {
                        aborted.extend(self.install(sibling, Slot::Reference(key.page()), REFERENCE_CHARGE));
                    }
                    _ => {}
                }
            }
        }
        Some(Completion {
            waiters: pending.waiters,
            aborted,
        })
    }

    /// Removes a failed fetch and hands back its waiters.
    pub(crate) fn fail_fetch(&mut self, key: Key, id: u64) -> Vec<W> {
        self.take_pending(key, id)
            .map(|pending| pending.waiters)
            .unwrap_or_default()
    }

    /// Installs the bytes of a single page that was read out of band.
    pub(crate) fn insert_page(&mut self, key: Key, bytes: Bytes) -> Vec<W> {
        if bytes.is_empty() || bytes.len() > self.capacity {
            return Vec::new();
        }
        if self.lru.peek(key.into()).is_some() {
            return Vec::new();
        }
        let charge = bytes.len();
        self.install(key, Slot::Data(bytes), charge)
    }

    /// Removes every slot, aborting all fetches in flight.
    pub(crate) fn clear(&mut self) -> Vec<W> {
        let slots = self.lru.drain();
        self.sync_usage();
        slots
            .into_iter()
            .flat_map(|(_, slot)| self.release(slot))
            .collect()
    }

    fn take_pending(&mut self, key: Key, id: u64) -> Option<PendingFetch<W>> {
        match self.lru.peek(key.into()) {
            Some(Slot::Pending(pending)) if pending.id == id => {}
            _ => return None,
        }
        let slot = self.lru.remove(key.into());
        self.sync_usage();
        match slot {
            Some(Slot::Pending(pending)) => Some(pending),
            _ => None,
        }
    }

    fn install(&mut self, key: Key, slot: Slot<W>, charge: usize) -> Vec<W> {
        let mut aborted = Vec::new();
        if charge > self.capacity {
            return aborted;
        }
        for (evicted, slot) in self.lru.evict_from_lru(charge, self.capacity) {
            trace!("evict {:?}", Key::from(evicted));
            self.stats.passive_evict.inc();
            aborted.extend(self.release(slot));
        }
        if let Some(old) = self.lru.insert(key.into(), slot, charge) {
            aborted.extend(self.release(old));
        }
        self.stats.insert.inc();
        self.sync_usage();
        aborted
    }

    fn release(&self, slot: Slot<W>) -> Vec<W> {
        match slot {
            Slot::Pending(pending) => {
                pending.abort.abort();
                self.stats.aborted.inc();
                pending.waiters
            }
            Slot::Data(_) | Slot::Reference(_) => Vec::new(),
        }
    }

    fn sync_usage(&self) {
        self.stats.resident_bytes.set(self.lru.usage() as u64);
    }
}

fn page_slice(chunk: &Bytes, offset: usize, page_size: u32) -> Bytes {
    let end = (offset + page_size as usize).min(chunk.len());
    chunk.slice(offset.min(end)..end)
}

#[cfg(test)]
mod tests {
    use futures::{
        executor::block_on,
        future::{self, AbortRegistration, Abortable},
    };
    use quickcheck::quickcheck;

    use super::*;

    const PAGE: u32 = 1024;

    fn cache(capacity: usize) -> PageCache<u32> {
        PageCache::new(capacity, Arc::default())
    }

    fn chunk(page: u32, pages: u32) -> Bytes {
        let start = (page * PAGE) as usize;
        let end = ((page + pages) * PAGE) as usize;
        (start..end).map(|i| (i % 251) as u8).collect()
    }

    fn abort_pair() -> (AbortHandle, AbortRegistration) {
        AbortHandle::new_pair()
    }

    fn is_aborted(reg: AbortRegistration) -> bool {
        block_on(Abortable::new(future::ready(()), reg)).is_err()
    }

    /// Simulates a miss on `page`, returning the number of pages fetched.
    fn fetch(cache: &mut PageCache<u32>, page: u32, limit: usize) -> u32 {
        let key = Key::new(1, page);
        assert_eq!(cache.lookup(key, PAGE), Lookup::Miss);
        let len = cache.chunk_size(key, PAGE, limit);
        let pages = len as u32 / PAGE;
        let (abort, _) = abort_pair();
        let fetch = cache.begin_fetch(key, len, abort, page);
        let done = cache
            .complete_fetch(key, fetch.id, PAGE, chunk(page, pages))
            .unwrap();
        assert_eq!(done.waiters, vec![page]);
        pages
    }

    #[test]
    fn single_flight() {
        let mut cache = cache(1 << 20);
        let key = Key::new(1, 3);
        let (abort, _) = abort_pair();
        let fetch = cache.begin_fetch(key, PAGE as usize, abort, 1);
        assert!(fetch.aborted.is_empty());
        for waiter in 2..5 {
            assert_eq!(cache.lookup(key, PAGE), Lookup::Pending);
            assert!(cache.join(key, waiter).is_ok());
        }
        let done = cache
            .complete_fetch(key, fetch.id, PAGE, chunk(3, 1))
            .unwrap();
        assert_eq!(done.waiters, vec![1, 2, 3, 4]);
        assert_eq!(cache.lookup(key, PAGE), Lookup::Hit(chunk(3, 1)));
        assert_eq!(cache.join(key, 5), Err(5));
    }

    #[test]
    fn repeated_hits_are_identical() {
        let mut cache = cache(1 << 20);
        fetch(&mut cache, 0, 1 << 20);
        fetch(&mut cache, 1, 1 << 20);
        for page in 0..3 {
            let key = Key::new(1, page);
            let first = cache.lookup(key, PAGE);
            for _ in 0..3 {
                assert_eq!(cache.lookup(key, PAGE), first);
            }
            assert_eq!(first, Lookup::Hit(chunk(page, 1)));
        }
        assert_eq!(cache.stats.lookup_hit.get(), 12);
    }

    #[test]
    fn sequential_access_grows_chunks() {
        let mut cache = cache(1 << 20);
        assert_eq!(fetch(&mut cache, 0, 1 << 20), 1);
        assert_eq!(fetch(&mut cache, 1, 1 << 20), 2);
        assert_eq!(
            cache.lookup(Key::new(1, 2), PAGE),
            Lookup::Hit(chunk(2, 1))
        );
        assert_eq!(fetch(&mut cache, 3, 1 << 20), 4);
        assert_eq!(fetch(&mut cache, 7, 1 << 20), 8);
    }

    #[test]
    fn sequential_growth_is_limited() {
        let mut cache = cache(1 << 20);
        let limit = 3 * PAGE as usize + 100;
        assert_eq!(fetch(&mut cache, 0, limit), 1);
        assert_eq!(fetch(&mut cache, 1, limit), 2);
        assert_eq!(fetch(&mut cache, 3, limit), 3);
        assert_eq!(fetch(&mut cache, 6, limit), 3);
        assert_eq!(fetch(&mut cache, 9, 0), 1);
    }

    #[test]
    fn chunk_fits_with_its_references() {
        let mut cache = cache(4 * PAGE as usize);
        assert_eq!(fetch(&mut cache, 0, 1 << 20), 1);
        assert_eq!(fetch(&mut cache, 1, 1 << 20), 2);
        // Four pages would leave no room for three references.
        assert_eq!(fetch(&mut cache, 3, 1 << 20), 3);
        assert_eq!(cache.lookup(Key::new(1, 3), PAGE), Lookup::Hit(chunk(3, 1)));
        assert_eq!(cache.lookup(Key::new(1, 5), PAGE), Lookup::Hit(chunk(5, 1)));
        assert!(cache.usage() <= cache.capacity());

        // A single page always fits, even without room for references.
        let cache = self::cache(PAGE as usize);
        assert_eq!(cache.chunk_size(Key::new(1, 0), PAGE, 1 << 20), PAGE as usize);
    }

    #[test]
    fn random_access_fetches_single_pages() {
        let mut cache = cache(1 << 20);
        for page in [0, 5, 2] {
            assert_eq!(fetch(&mut cache, page, 1 << 20), 1);
        }
    }

    #[test]
    fn dangling_reference_is_a_miss() {
        // Room for the 2-page chunk and its reference, but not for one more
        // page on top of them.
        let mut cache = cache(3 * PAGE as usize);
        fetch(&mut cache, 0, 1 << 20);
        fetch(&mut cache, 1, 1 << 20);
        assert!(cache.lru.peek(Key::new(1, 0).into()).is_none());

        // The root of [1, 2] is older than its reference, so it goes first.
        fetch(&mut cache, 10, PAGE as usize);
        assert!(cache.lru.peek(Key::new(1, 1).into()).is_none());
        assert!(matches!(
            cache.lru.peek(Key::new(1, 2).into()),
            Some(Slot::Reference(1))
        ));
        assert_eq!(cache.lookup(Key::new(1, 2), PAGE), Lookup::Miss);

        // The dangling reference is replaced by a fresh fetch.
        assert_eq!(fetch(&mut cache, 2, PAGE as usize), 1);
        assert_eq!(
            cache.lookup(Key::new(1, 2), PAGE),
            Lookup::Hit(chunk(2, 1))
        );
        assert!(cache.usage() <= cache.capacity());
    }

    #[test]
    fn evicting_pending_fetch_aborts_it() {
        let mut cache = cache(2 * PAGE as usize);
        let (abort, reg) = abort_pair();
        let old = cache.begin_fetch(Key::new(1, 0), 2 * PAGE as usize, abort, 7);
        let (abort, _) = abort_pair();
        let new = cache.begin_fetch(Key::new(1, 9), PAGE as usize, abort, 8);
        assert_eq!(new.aborted, vec![7]);
        assert!(is_aborted(reg));
        assert_eq!(cache.stats.aborted.get(), 1);

        // A late completion of the aborted fetch is discarded.
        assert!(cache
            .complete_fetch(Key::new(1, 0), old.id, PAGE, chunk(0, 2))
            .is_none());
        assert_eq!(cache.lookup(Key::new(1, 0), PAGE), Lookup::Miss);
    }

    #[test]
    fn failed_fetch_is_removed() {
        let mut cache = cache(1 << 20);
        let key = Key::new(2, 4);
        let (abort, _) = abort_pair();
        let fetch = cache.begin_fetch(key, PAGE as usize, abort, 1);
        assert!(cache.join(key, 2).is_ok());
        assert_eq!(cache.fail_fetch(key, fetch.id), vec![1, 2]);
        assert_eq!(cache.usage(), 0);
        assert_eq!(cache.lookup(key, PAGE), Lookup::Miss);
        assert!(cache.fail_fetch(key, fetch.id).is_empty());
    }

    #[test]
    fn references_do_not_clobber_pending() {
        let mut cache = cache(1 << 20);
        fetch(&mut cache, 0, 1 << 20);
        let (abort, reg) = abort_pair();
        let pending = cache.begin_fetch(Key::new(1, 2), PAGE as usize, abort, 9);

        // [1, 2] overlaps the pending fetch of page 2.
        let key = Key::new(1, 1);
        let (abort, _) = abort_pair();
        let fetch = cache.begin_fetch(key, 2 * PAGE as usize, abort, 1);
        cache
            .complete_fetch(key, fetch.id, PAGE, chunk(1, 2))
            .unwrap();
        assert_eq!(cache.lookup(Key::new(1, 2), PAGE), Lookup::Pending);
        assert!(!is_aborted(reg));
        let done = cache
            .complete_fetch(Key::new(1, 2), pending.id, PAGE, chunk(2, 1))
            .unwrap();
        assert_eq!(done.waiters, vec![9]);
    }

    #[test]
    fn oversized_chunk_is_not_cached() {
        let mut cache = cache(PAGE as usize);
        let key = Key::new(1, 0);
        let (abort, _) = abort_pair();
        let fetch = cache.begin_fetch(key, 2 * PAGE as usize, abort, 1);
        assert_eq!(cache.usage(), PAGE as usize);
        let done = cache
            .complete_fetch(key, fetch.id, PAGE, chunk(0, 2))
            .unwrap();
        assert_eq!(done.waiters, vec![1]);
        assert_eq!(cache.usage(), 0);
        assert_eq!(cache.lookup(key, PAGE), Lookup::Miss);
    }

    #[test]
    fn clear_aborts_everything() {
        let mut cache = cache(1 << 20);
        fetch(&mut cache, 0, 1 << 20);
        let (abort, reg) = abort_pair();
        cache.begin_fetch(Key::new(1, 5), PAGE as usize, abort, 3);
        assert_eq!(cache.clear(), vec![3]);
        assert!(is_aborted(reg));
        assert_eq!(cache.usage(), 0);
        assert_eq!(cache.stats.resident_bytes.get(), 0);
    }

    quickcheck! {
        fn usage_never_exceeds_capacity(capacity: u16, pages: Vec<(u8, u8)>) -> bool {
            let capacity = capacity as usize * 16;
            let mut cache = cache(capacity);
            for (page, extra) in pages {
                let key = Key::new(1, page as u32);
                match cache.lookup(key, PAGE) {
                    Lookup::Miss => {}
                    _ => continue,
                }
                let len = cache.chunk_size(key, PAGE, capacity.max(PAGE as usize));
                let (abort, _) = abort_pair();
                let fetch = cache.begin_fetch(key, len, abort, 0);
                if cache.usage() > capacity {
                    return false;
                }
                if extra % 5 == 0 {
                    cache.fail_fetch(key, fetch.id);
                } else {
                    let pages = len as u32 / PAGE;
                    cache.complete_fetch(key, fetch.id, PAGE, chunk(page as u32, pages));
                }
                if cache.usage() > capacity || cache.stats.resident_bytes.get() as usize != cache.usage() {
                    return false;
                }
            }
            true
        }

        fn hits_match_the_source(pages: Vec<u8>) -> bool {
            let mut cache = cache(64 * PAGE as usize);
            for page in pages {
                let page = page as u32 % 32;
                let key = Key::new(1, page);
                match cache.lookup(key, PAGE) {
                    Lookup::Hit(bytes) => {
                        if bytes != chunk(page, 1) {
                            return false;
                        }
                    }
                    Lookup::Miss => {
                        let len = cache.chunk_size(key, PAGE, 8 * PAGE as usize);
                        let (abort, _) = abort_pair();
                        let fetch = cache.begin_fetch(key, len, abort, 0);
                        cache.complete_fetch(key, fetch.id, PAGE, chunk(page, len as u32 / PAGE));
                    }
                    Lookup::Pending => return false,
                }
            }
            true
        }
    }
}
