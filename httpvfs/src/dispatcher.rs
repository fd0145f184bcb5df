//! The dispatcher owns the file registry and the page cache.
//!
//! It runs as a single task that multiplexes two event sources: messages
//! from handles and consumers, and completions of network requests it
//! started. All registry and cache state is mutated from that task only.
//! Requests that have to wait for the network are parked inside the state
//! they wait on (an opening file, a discovery or a pending fetch) and
//! answered when that state resolves.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use bytes::Bytes;
use futures::{
    channel::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    executor::block_on,
    future::{AbortHandle, Abortable, BoxFuture},
    stream::FuturesUnordered,
    FutureExt, StreamExt,
};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::{
    cache::{Key, Lookup, PageCache},
    channel::{Consumer, Region, Responder},
    fetch::{Fetcher, Probe},
    registry::{Begin, FileRegistry, PageSize, BOOTSTRAP_PAGE_SIZE},
    stats::AtomicStats,
    util::atomic::Counter,
    Error, Options, Result, Stats,
};

/// Identifies a consumer of a dispatcher.
pub type ConsumerId = u64;

pub(crate) enum Op {
    Open(String),
    Access(String),
    Read { url: String, offset: u64, len: usize },
    FileSize(String),
}

impl Op {
    fn url(&self) -> &str {
        match self {
            Op::Open(url) | Op::Access(url) | Op::FileSize(url) => url,
            Op::Read { url, .. } => url,
        }
    }
}

pub(crate) struct Request {
    pub(crate) consumer: ConsumerId,
    pub(crate) op: Op,
    pub(crate) responder: Responder,
}

pub(crate) enum Message {
    Init(Options, oneshot::Sender<Result<()>>),
    Handshake(ConsumerId, oneshot::Sender<Result<Arc<Region>>>),
    Release(ConsumerId),
    Close,
    Data(Request),
}

/// A read parked on a pending fetch.
struct Waiter {
    responder: Responder,
    offset: usize,
    len: usize,
}

impl Waiter {
    /// Answers with the requested window of `page`.
    fn reply(self, page: &[u8]) {
        let start = self.offset.min(page.len());
        let end = (self.offset + self.len).min(page.len());
        self.responder.data(&page[start..end]);
    }
}

enum Done {
    Probe {
        url: String,
        result: Result<Probe>,
    },
    Discovery {
        url: String,
        file_id: u32,
        result: Result<Bytes>,
    },
    Chunk {
        key: Key,
        id: u64,
        page_size: u32,
        result: Result<Bytes>,
    },
}

/// The single owner of the file registry and the page cache.
pub struct Dispatcher<F: Fetcher> {
    fetcher: Arc<F>,
    options: Options,
    initialized: bool,
    registry: FileRegistry<Request>,
    cache: PageCache<Waiter>,
    consumers: FxHashMap<ConsumerId, Arc<Region>>,
    inflight: FuturesUnordered<BoxFuture<'static, Done>>,
    inbox: UnboundedReceiver<Message>,
    stats: Arc<AtomicStats>,
}

impl<F: Fetcher> Dispatcher<F> {
    /// Creates a dispatcher and a handle to talk to it.
    ///
    /// The dispatcher does nothing until [`Dispatcher::run`] is polled.
    pub fn new(fetcher: F) -> (Self, Handle) {
        let (sender, inbox) = mpsc::unbounded();
        let stats = Arc::new(AtomicStats::default());
        let options = Options::default();
        let cache = PageCache::new(options.cache_capacity, stats.cache.clone());
        let dispatcher = Self {
            fetcher: Arc::new(fetcher),
            options,
            initialized: false,
            registry: FileRegistry::new(),
            cache,
            consumers: FxHashMap::default(),
            inflight: FuturesUnordered::new(),
            inbox,
            stats: stats.clone(),
        };
        let handle = Handle {
            sender,
            stats,
            next_consumer: Arc::new(Counter::new(1)),
            thread: Arc::new(Mutex::new(None)),
        };
        (dispatcher, handle)
    }

    /// Starts a dispatcher on a dedicated thread.
    ///
    /// Fails if the runtime or the thread can not be created, before any
    /// consumer is accepted.
    pub fn spawn(fetcher: F) -> Result<Handle> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| Error::Setup(format!("runtime: {err}")))?;
        let (dispatcher, handle) = Self::new(fetcher);
        let thread = thread::Builder::new()
            .name("httpvfs-dispatcher".to_owned())
            .spawn(move || runtime.block_on(dispatcher.run()))
            .map_err(|err| Error::Setup(format!("thread: {err}")))?;
        *handle.thread.lock() = Some(thread);
        Ok(handle)
    }

    /// Serves messages until the dispatcher is closed or every handle and
    /// consumer is dropped.
    pub async fn run(mut self) {
        info!("Dispatcher started");
        loop {
            tokio::select! {
                msg = self.inbox.next() => match msg {
                    Some(Message::Close) | None => break,
                    Some(msg) => self.handle(msg),
                },
                Some(done) = self.inflight.next(), if !self.inflight.is_empty() => {
                    self.complete(done);
                }
            }
        }
        self.shutdown();
    }

    fn handle(&mut self, msg: Message) {
        match msg {
            Message::Init(options, reply) => {
                reply.send(self.init(options)).unwrap_or_default();
            }
            Message::Handshake(id, reply) => {
                reply.send(self.handshake(id)).unwrap_or_default();
            }
            Message::Release(id) => self.release(id),
            Message::Data(request) => self.dispatch(request),
            Message::Close => {}
        }
    }

    fn init(&mut self, options: Options) -> Result<()> {
        if self.initialized {
            return Err(self.protocol("init received twice".to_owned()));
        }
        if !options.max_page_size.is_power_of_two() || options.max_page_size < 512 {
            return Err(self.protocol(format!(
                "max page size {} is not a power of two of at least 512",
                options.max_page_size
            )));
        }
        let Some(fetcher) = Arc::get_mut(&mut self.fetcher) else {
            return Err(self.protocol("init received while fetches are in flight".to_owned()));
        };
        fetcher.configure(&options)?;
        info!(
            "Init with cache capacity {} and max page size {}",
            options.cache_capacity, options.max_page_size
        );
        self.cache = PageCache::new(options.cache_capacity, self.stats.cache.clone());
        self.options = options;
        self.initialized = true;
        Ok(())
    }

    fn handshake(&mut self, id: ConsumerId) -> Result<Arc<Region>> {
        if !self.initialized {
            return Err(self.protocol(format!("handshake of consumer {id} before init")));
        }
        if self.consumers.contains_key(&id) {
            return Err(self.protocol(format!("consumer {id} registered twice")));
        }
        let region = Region::new(id, self.options.max_page_size as usize);
        self.consumers.insert(id, region.clone());
        self.stats.consumers.set(self.consumers.len() as u64);
        debug!("Consumer {id} registered");
        Ok(region)
    }

    fn release(&mut self, id: ConsumerId) {
        if self.consumers.remove(&id).is_some() {
            debug!("Consumer {id} released");
        }
        self.stats.consumers.set(self.consumers.len() as u64);
    }

    fn dispatch(&mut self, request: Request) {
        if !self.initialized {
            let err = self.protocol("data message before init".to_owned());
            return fail(request.responder, &err);
        }
        if !self.consumers.contains_key(&request.consumer) {
            let err = self.protocol(format!("unknown consumer {}", request.consumer));
            return fail(request.responder, &err);
        }
        let url = request.op.url().to_owned();
        match request.op {
            Op::Open(_) => self.open(url, request),
            Op::Access(_) => {
                let exists = self.registry.is_open(&url);
                request.responder.ok(exists as u64);
            }
            Op::FileSize(_) => match self.registry.file(&url) {
                Ok(file) => request.responder.ok(file.size),
                Err(err) => self.park_on_open(url, request, err),
            },
            Op::Read { offset, len, .. } => self.read(url, offset, len, request),
        }
    }

    fn open(&mut self, url: String, request: Request) {
        match self.registry.begin_open(&url, request) {
            Begin::Done(request) => request.responder.ok(0),
            Begin::Joined => {}
            Begin::Started => {
                debug!("Probe {url}");
                self.stats.probes.inc();
                let fetcher = self.fetcher.clone();
                self.inflight.push(
                    async move {
                        let result = fetcher.probe(&url).await;
                        Done::Probe { url, result }
                    }
                    .boxed(),
                );
            }
        }
    }

    /// Parks a request on an open in flight, or fails it with `err`.
    fn park_on_open(&mut self, url: String, request: Request, err: Error) {
        if self.registry.is_opening(&url) {
            self.open(url, request);
        } else {
            fail(request.responder, &err);
        }
    }

    fn read(&mut self, url: String, offset: u64, len: usize, request: Request) {
        let (file_id, size, page_size) = match self.registry.file(&url) {
            Ok(file) => match &file.page_size {
                PageSize::Known(page_size) => (file.id, file.size, *page_size),
                PageSize::Unusable(err) => {
                    let err = err.clone();
                    return fail(request.responder, &err);
                }
                PageSize::Unknown | PageSize::Discovering(_) => {
                    let (file_id, size) = (file.id, file.size);
                    return self.discover(url, file_id, size, request);
                }
            },
            Err(err) => return self.park_on_open(url, request, err),
        };

        let (page, in_page) = match locate(offset, len, page_size) {
            Ok(location) => location,
            Err(err) => return fail(request.responder, &err),
        };
        if in_page != 0 {
            warn!("Read of {len} bytes at {offset} of {url} is not page aligned");
        }
        if page as u64 * page_size as u64 >= size {
            trace!("Read of page {page} of {url} is past the end");
            return request.responder.data(&[]);
        }

        let key = Key::new(file_id, page);
        let waiter = Waiter {
            responder: request.responder,
            offset: in_page,
            len,
        };
        match self.cache.lookup(key, page_size) {
            Lookup::Hit(bytes) => waiter.reply(&bytes),
            Lookup::Pending => {
                trace!("Join the fetch of page {page} of {url}");
                if let Err(waiter) = self.cache.join(key, waiter) {
                    waiter.responder.fail();
                }
            }
            Lookup::Miss => self.fetch(url, key, page_size, size, waiter),
        }
    }

    fn discover(&mut self, url: String, file_id: u32, size: u64, request: Request) {
        match self.registry.begin_discovery(&url, request) {
            Begin::Started => {
                let end = (BOOTSTRAP_PAGE_SIZE as u64).min(size);
                debug!("Discover the page size of {url}");
                self.stats.ranges.inc();
                let fetcher = self.fetcher.clone();
                self.inflight.push(
                    async move {
                        let result = fetcher.fetch(&url, 0..end).await;
                        Done::Discovery {
                            url,
                            file_id,
                            result,
                        }
                    }
                    .boxed(),
                );
            }
            Begin::Joined => {}
            Begin::Done(request) => fail(
                request.responder,
                &Error::Protocol(format!("discovery of {url} resolved twice")),
            ),
        }
    }

    fn fetch(&mut self, url: String, key: Key, page_size: u32, size: u64, waiter: Waiter) {
        let limit = self.options.max_super_page_size.min(self.cache.capacity());
        let chunk = self.cache.chunk_size(key, page_size, limit) as u64;
        let start = key.page() as u64 * page_size as u64;
        let end = (start + chunk).min(size);
        let (abort, registration) = AbortHandle::new_pair();
        let fetch = self
            .cache
            .begin_fetch(key, (end - start) as usize, abort, waiter);
        abort_waiters(fetch.aborted);

        trace!("Fetch {url} [{start}, {end})");
        self.stats.ranges.inc();
        let fetcher = self.fetcher.clone();
        let id = fetch.id;
        let range = Abortable::new(
            async move { fetcher.fetch(&url, start..end).await },
            registration,
        );
        self.inflight.push(
            range
                .map(move |result| Done::Chunk {
                    key,
                    id,
                    page_size,
                    result: result.unwrap_or(Err(Error::Aborted)),
                })
                .boxed(),
        );
    }

    fn complete(&mut self, done: Done) {
        match done {
            Done::Probe { url, result } => match result {
                Ok(probe) => {
                    let waiters = self.registry.complete_open(&url, probe);
                    self.stats.open_files.set(self.registry.len() as u64);
                    for request in waiters {
                        self.dispatch(request);
                    }
                }
                Err(err) => {
                    warn!("Open {url}: {err}");
                    self.stats.failures.inc();
                    for request in self.registry.fail_open(&url) {
                        fail(request.responder, &err);
                    }
                }
            },
            Done::Discovery {
                url,
                file_id,
                result,
            } => match result {
                Ok(header) => {
                    self.stats.bytes.add(header.len() as u64);
                    let max = self.options.max_page_size;
                    let (page_size, waiters) = self.registry.complete_discovery(&url, &header, max);
                    if page_size == Ok(BOOTSTRAP_PAGE_SIZE) {
                        // The header fetch is exactly the first page.
                        abort_waiters(self.cache.insert_page(Key::new(file_id, 0), header));
                    }
                    for request in waiters {
                        self.dispatch(request);
                    }
                }
                Err(err) => {
                    warn!("Discover the page size of {url}: {err}");
                    self.stats.failures.inc();
                    for request in self.registry.fail_discovery(&url) {
                        fail(request.responder, &err);
                    }
                }
            },
            Done::Chunk {
                key,
                id,
                page_size,
                result,
            } => match result {
                Ok(chunk) => {
                    self.stats.bytes.add(chunk.len() as u64);
                    let page = chunk.slice(..chunk.len().min(page_size as usize));
                    match self.cache.complete_fetch(key, id, page_size, chunk) {
                        Some(completion) => {
                            for waiter in completion.waiters {
                                waiter.reply(&page);
                            }
                            abort_waiters(completion.aborted);
                        }
                        None => debug!("Discard the result of fetch {id} for {key:?}"),
                    }
                }
                Err(err) => {
                    if err != Error::Aborted {
                        warn!("Fetch {key:?}: {err}");
                        self.stats.failures.inc();
                    }
                    for waiter in self.cache.fail_fetch(key, id) {
                        fail(waiter.responder, &err);
                    }
                }
            },
        }
    }

    fn shutdown(mut self) {
        info!("Dispatcher closing");
        abort_waiters(self.cache.clear());
        for request in self.registry.drain_waiters() {
            fail(request.responder, &Error::Closed);
        }
        self.inbox.close();
        while let Ok(msg) = self.inbox.try_recv() {
            if let Message::Data(request) = msg {
                fail(request.responder, &Error::Closed);
            }
        }
        self.consumers.clear();
        self.stats.consumers.set(0);
    }

    fn protocol(&self, msg: String) -> Error {
        error!("Protocol violation: {msg}");
        Error::Protocol(msg)
    }
}

/// Returns the page holding a read and the offset of the read within it.
fn locate(offset: u64, len: usize, page_size: u32) -> Result<(u32, usize)> {
    let in_page = (offset % page_size as u64) as usize;
    if in_page + len > page_size as usize {
        return Err(Error::CrossPageRead {
            offset,
            length: len,
            page_size,
        });
    }
    let page = u32::try_from(offset / page_size as u64)
        .map_err(|_| Error::Protocol(format!("offset {offset} is out of range")))?;
    Ok((page, in_page))
}

fn fail(responder: Responder, err: &Error) {
    match responder.consumer() {
        Some(id) => debug!("Request of consumer {id} failed: {err}"),
        None => debug!("Request failed: {err}"),
    }
    responder.fail();
}

fn abort_waiters(waiters: Vec<Waiter>) {
    for waiter in waiters {
        fail(waiter.responder, &Error::Aborted);
    }
}

/// A cloneable handle to a dispatcher.
#[derive(Clone)]
pub struct Handle {
    sender: UnboundedSender<Message>,
    stats: Arc<AtomicStats>,
    next_consumer: Arc<Counter>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Handle {
    /// Configures the dispatcher. Must precede any other message.
    pub fn init(&self, options: Options) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Init(options, reply))?;
        block_on(rx).map_err(|_| Error::Closed)?
    }

    /// Registers a new consumer and hands back its channel.
    pub fn handshake(&self) -> Result<Consumer> {
        let id = self.next_consumer.inc();
        let (reply, rx) = oneshot::channel();
        self.send(Message::Handshake(id, reply))?;
        let region = block_on(rx).map_err(|_| Error::Closed)??;
        Ok(Consumer::new(region, self.sender.clone()))
    }

    /// Returns a snapshot of the dispatcher statistics.
    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    /// Terminates the dispatcher and waits for its thread, if any.
    ///
    /// Requests in flight fail. Consumers fail fast afterwards.
    pub fn close(&self) -> Result<()> {
        self.sender.unbounded_send(Message::Close).unwrap_or_default();
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            thread
                .join()
                .map_err(|_| Error::Protocol("dispatcher thread panicked".to_owned()))?;
        }
        Ok(())
    }

    fn send(&self, msg: Message) -> Result<()> {
        self.sender
            .unbounded_send(msg)
            .map_err(|_| Error::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_reads() {
        assert_eq!(locate(0, 4096, 4096), Ok((0, 0)));
        assert_eq!(locate(3 * 4096, 4096, 4096), Ok((3, 0)));
        assert_eq!(locate(4096 + 24, 100, 4096), Ok((1, 24)));
        assert_eq!(locate(4096 + 3996, 100, 4096), Ok((1, 3996)));
        assert_eq!(locate(0, 0, 512), Ok((0, 0)));
    }

    #[test]
    fn locate_rejects_cross_page_reads() {
        assert_eq!(
            locate(100, 1024, 1024),
            Err(Error::CrossPageRead {
                offset: 100,
                length: 1024,
                page_size: 1024,
            })
        );
        assert_eq!(
            locate(4096 + 3997, 100, 4096),
            Err(Error::CrossPageRead {
                offset: 4096 + 3997,
                length: 100,
                page_size: 4096,
            })
        );
        assert_eq!(
            locate(0, 513, 512),
            Err(Error::CrossPageRead {
                offset: 0,
                length: 513,
                page_size: 512,
            })
        );
    }

    #[test]
    fn locate_rejects_huge_offsets() {
        let offset = (u32::MAX as u64 + 1) * 512;
        assert!(matches!(locate(offset, 512, 512), Err(Error::Protocol(_))));
        assert_eq!(locate(offset - 512, 512, 512), Ok((u32::MAX, 0)));
    }
}
