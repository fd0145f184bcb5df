use std::{fmt::Display, sync::Arc};

use crate::util::atomic::Counter;

/// Statistics of a dispatcher.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    /// Statistics of the page cache.
    pub cache: CacheStats,
    /// Statistics of network requests.
    pub fetch: FetchStats,
    /// The number of opened files.
    pub open_files: u64,
    /// The number of live consumers.
    pub consumers: u64,
}

impl Stats {
    /// Sub other stats to produce an new stats.
    ///
    /// Gauges (resident bytes, files, consumers) are taken from `self`.
    pub fn sub(&self, o: &Stats) -> Stats {
        Stats {
            cache: self.cache.sub(&o.cache),
            fetch: self.fetch.sub(&o.fetch),
            open_files: self.open_files,
            consumers: self.consumers,
        }
    }
}

impl Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "CacheStats: lookup_hit: {}, lookup_miss: {}, insert: {}, passive_evict: {}, aborted: {}, resident_bytes: {}",
            self.cache.lookup_hit, self.cache.lookup_miss, self.cache.insert, self.cache.passive_evict, self.cache.aborted, self.cache.resident_bytes)?;
        writeln!(
            f,
            "FetchStats: probes: {}, ranges: {}, bytes: {}, failures: {}",
            self.fetch.probes, self.fetch.ranges, self.fetch.bytes, self.fetch.failures
        )?;
        writeln!(
            f,
            "open_files: {}, consumers: {}",
            self.open_files, self.consumers
        )
    }
}

/// Statistics of the page cache.
#[derive(Clone, Debug, Default)]
pub struct CacheStats {
    /// Lookups answered from a resident page.
    pub lookup_hit: u64,
    /// Lookups that started a fetch.
    pub lookup_miss: u64,
    /// Entries installed: fetches in flight, chunks and references.
    pub insert: u64,
    /// Entries evicted to make room for new ones.
    pub passive_evict: u64,
    /// Fetches in flight cancelled by an eviction or a shutdown.
    pub aborted: u64,
    /// The bytes charged to the cache, a gauge.
    pub resident_bytes: u64,
}

impl CacheStats {
    fn sub(&self, o: &CacheStats) -> CacheStats {
        CacheStats {
            lookup_hit: self.lookup_hit.wrapping_sub(o.lookup_hit),
            lookup_miss: self.lookup_miss.wrapping_sub(o.lookup_miss),
            insert: self.insert.wrapping_sub(o.insert),
            passive_evict: self.passive_evict.wrapping_sub(o.passive_evict),
            aborted: self.aborted.wrapping_sub(o.aborted),
            resident_bytes: self.resident_bytes,
        }
    }
}

/// Statistics of network requests.
#[derive(Clone, Debug, Default)]
pub struct FetchStats {
    /// Metadata requests.
    pub probes: u64,
    /// Byte-range requests, including page size discovery.
    pub ranges: u64,
    /// Bytes received by byte-range requests.
    pub bytes: u64,
    /// Probes and range requests that failed.
    pub failures: u64,
}

impl FetchStats {
    fn sub(&self, o: &FetchStats) -> FetchStats {
        FetchStats {
            probes: self.probes.wrapping_sub(o.probes),
            ranges: self.ranges.wrapping_sub(o.ranges),
            bytes: self.bytes.wrapping_sub(o.bytes),
            failures: self.failures.wrapping_sub(o.failures),
        }
    }
}

#[derive(Default)]
pub(crate) struct AtomicCacheStats {
    pub(crate) lookup_hit: Counter,
    pub(crate) lookup_miss: Counter,
    pub(crate) insert: Counter,
    pub(crate) passive_evict: Counter,
    pub(crate) aborted: Counter,
    pub(crate) resident_bytes: Counter,
}

impl AtomicCacheStats {
    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            lookup_hit: self.lookup_hit.get(),
            lookup_miss: self.lookup_miss.get(),
            insert: self.insert.get(),
            passive_evict: self.passive_evict.get(),
            aborted: self.aborted.get(),
            resident_bytes: self.resident_bytes.get(),
        }
    }
}

#[derive(Default)]
pub(crate) struct AtomicStats {
    pub(crate) cache: Arc<AtomicCacheStats>,
    pub(crate) probes: Counter,
    pub(crate) ranges: Counter,
    pub(crate) bytes: Counter,
    pub(crate) failures: Counter,
    pub(crate) open_files: Counter,
    pub(crate) consumers: Counter,
}

impl AtomicStats {
    pub(crate) fn snapshot(&self) -> Stats {
        Stats {
            cache: self.cache.snapshot(),
            fetch: FetchStats {
                probes: self.probes.get(),
                ranges: self.ranges.get(),
                bytes: self.bytes.get(),
                failures: self.failures.get(),
            },
            open_files: self.open_files.get(),
            consumers: self.consumers.get(),
        }
    }
}
