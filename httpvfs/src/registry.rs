use std::mem;

use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::{fetch::Probe, Error, Result};

/// The page size assumed while the real one is unknown.
pub(crate) const BOOTSTRAP_PAGE_SIZE: u32 = 1024;

/// The number of leading bytes that make up a database header.
pub(crate) const HEADER_SIZE: usize = 100;

/// The page size field of a database header, as a big-endian u16.
const PAGE_SIZE_OFFSET: usize = 16;
const MIN_PAGE_SIZE: u32 = 512;
const MAX_PAGE_SIZE: u32 = 65536;

pub(crate) enum PageSize<W> {
    Unknown,
    Discovering(Vec<W>),
    Known(u32),
    /// The header declares a page size this dispatcher can not serve.
    Unusable(Error),
}

pub(crate) struct FileEntry<W> {
    pub(crate) id: u32,
    pub(crate) size: u64,
    pub(crate) page_size: PageSize<W>,
}

enum FileState<W> {
    Opening(Vec<W>),
    Ready(FileEntry<W>),
}

/// The outcome of an attempt to open or discover something.
pub(crate) enum Begin<W> {
    /// The work is already done, the waiter is handed back.
    Done(W),
    /// The waiter joined work in flight.
    Joined,
    /// The waiter is the first one, the caller must start the work.
    Started,
}

/// Per-URL metadata of opened files.
pub(crate) struct FileRegistry<W> {
    files: FxHashMap<String, FileState<W>>,
    next_id: u32,
}

impl<W> FileRegistry<W> {
    pub(crate) fn new() -> Self {
        Self {
            files: FxHashMap::default(),
            next_id: 1,
        }
    }

    /// The number of opened files.
    pub(crate) fn len(&self) -> usize {
        self.files
            .values()
            .filter(|state| matches!(state, FileState::Ready(_)))
            .count()
    }

    pub(crate) fn is_open(&self, url: &str) -> bool {
        matches!(self.files.get(url), Some(FileState::Ready(_)))
    }

    pub(crate) fn is_opening(&self, url: &str) -> bool {
        matches!(self.files.get(url), Some(FileState::Opening(_)))
    }

    pub(crate) fn file(&self, url: &str) -> Result<&FileEntry<W>> {
        match self.files.get(url) {
            Some(FileState::Ready(file)) => Ok(file),
            _ => Err(Error::NotOpen(url.to_owned())),
        }
    }

    fn file_mut(&mut self, url: &str) -> Option<&mut FileEntry<W>> {
        match self.files.get_mut(url) {
            Some(FileState::Ready(file)) => Some(file),
            _ => None,
        }
    }

    pub(crate) fn begin_open(&mut self, url: &str, waiter: W) -> Begin<W> {
        match self.files.get_mut(url) {
            Some(FileState::Ready(_)) => Begin::Done(waiter),
            Some(FileState::Opening(waiters)) => {
                waiters.push(waiter);
                Begin::Joined
            }
            None => {
                self.files
                    .insert(url.to_owned(), FileState::Opening(vec![waiter]));
                Begin::Started
            }
        }
    }

    pub(crate) fn complete_open(&mut self, url: &str, probe: Probe) -> Vec<W> {
        if !probe.accepts_ranges {
            warn!("{url} does not advertise byte-range support, reads may fail");
        }
        let id = self.next_id;
        self.next_id += 1;
        debug!("Open {url} as file {id} with {} bytes", probe.size);
        let file = FileEntry {
            id,
            size: probe.size,
            page_size: PageSize::Unknown,
        };
        match self.files.insert(url.to_owned(), FileState::Ready(file)) {
            Some(FileState::Opening(waiters)) => waiters,
            _ => Vec::new(),
        }
    }

    /// Forgets a failed open so that a later one probes again.
    pub(crate) fn fail_open(&mut self, url: &str) -> Vec<W> {
        match self.files.remove(url) {
            Some(FileState::Opening(waiters)) => waiters,
            Some(ready) => {
                self.files.insert(url.to_owned(), ready);
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    pub(crate) fn begin_discovery(&mut self, url: &str, waiter: W) -> Begin<W> {
        let Some(file) = self.file_mut(url) else {
            return Begin::Done(waiter);
        };
        match &mut file.page_size {
            PageSize::Unknown => {
                file.page_size = PageSize::Discovering(vec![waiter]);
                Begin::Started
            }
            PageSize::Discovering(waiters) => {
                waiters.push(waiter);
                Begin::Joined
            }
            PageSize::Known(_) | PageSize::Unusable(_) => Begin::Done(waiter),
        }
    }

    /// Resolves the page size from the leading bytes of the file.
    pub(crate) fn complete_discovery(
        &mut self,
        url: &str,
        header: &[u8],
        max_page_size: u32,
    ) -> (Result<u32>, Vec<W>) {
        let result = parse_page_size(header).and_then(|page_size| {
            if page_size > max_page_size {
                Err(Error::PageSizeExceeded {
                    page_size,
                    max: max_page_size,
                })
            } else {
                Ok(page_size)
            }
        });
        let Some(file) = self.file_mut(url) else {
            return (result, Vec::new());
        };
        let state = match &result {
            Ok(page_size) => {
                debug!("Discover page size {page_size} of {url}");
                PageSize::Known(*page_size)
            }
            Err(err) => {
                warn!("{url} is unusable: {err}");
                PageSize::Unusable(err.clone())
            }
        };
        let waiters = match mem::replace(&mut file.page_size, state) {
            PageSize::Discovering(waiters) => waiters,
            _ => Vec::new(),
        };
        (result, waiters)
    }

    /// Resets a failed discovery so that a later read tries again.
    pub(crate) fn fail_discovery(&mut self, url: &str) -> Vec<W> {
        let Some(file) = self.file_mut(url) else {
            return Vec::new();
        };
        match mem::replace(&mut file.page_size, PageSize::Unknown) {
            PageSize::Discovering(waiters) => waiters,
            other => {
                file.page_size = other;
                Vec::new()
            }
        }
    }

    /// Takes all waiters of opens and discoveries in flight.
    pub(crate) fn drain_waiters(&mut self) -> Vec<W> {
        let mut waiters = Vec::new();
        self.files.retain(|_, state| match state {
            FileState::Opening(pending) => {
                waiters.append(pending);
                false
            }
            FileState::Ready(file) => {
                if let PageSize::Discovering(pending) = &mut file.page_size {
                    waiters.append(pending);
                    file.page_size = PageSize::Unknown;
                }
                true
            }
        });
        waiters
    }
}

/// Decodes the page size stored at bytes 16..18 of the header.
///
/// Headers too short to hold the field keep the bootstrap page size.
pub(crate) fn parse_page_size(header: &[u8]) -> Result<u32> {
    let Some(field) = header.get(PAGE_SIZE_OFFSET..PAGE_SIZE_OFFSET + 2) else {
        return Ok(BOOTSTRAP_PAGE_SIZE);
    };
    let page_size = match u16::from_be_bytes([field[0], field[1]]) {
        1 => MAX_PAGE_SIZE,
        n => n as u32,
    };
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(Error::InvalidPageSize(page_size));
    }
    Ok(page_size)
}
