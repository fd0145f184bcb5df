//! Page-level access to database files served over HTTP.
//!
//! HttpVfs lets a database engine read a file that lives on a remote HTTP
//! server page by page, without downloading it in full. Pages are fetched
//! with byte-range requests and kept in a bounded page cache.
//!
//! Features:
//!
//! - Single-flight fetches: concurrent readers of a page share one request.
//! - Sequential scans are coalesced into geometrically growing range
//!   requests.
//! - Blocking consumers on top of a non-blocking dispatcher, so that engine
//!   threads can issue synchronous reads.
//!
//! A [`Dispatcher`] owns all cache and file state and runs on a thread of its
//! own. Engine threads talk to it through a [`Consumer`], obtained with a
//! [`Handle`]:
//!
//! ```no_run
//! use httpvfs::{Dispatcher, HttpFetcher, Options};
//!
//! # fn main() -> httpvfs::Result<()> {
//! let handle = Dispatcher::spawn(HttpFetcher::new()?)?;
//! handle.init(Options::default())?;
//!
//! let mut consumer = handle.handshake()?;
//! let url = "https://example.com/db.sqlite3";
//! consumer.open(url)?;
//! let mut page = vec![0u8; 4096];
//! consumer.read(url, 0, &mut page[..100])?;
//! # handle.close()
//! # }
//! ```

#![warn(missing_docs, unreachable_pub)]

mod error;
pub use error::{Error, Result};

mod options;
pub use options::Options;

pub mod fetch;
pub use fetch::{Fetcher, HttpFetcher, Probe};

mod stats;
pub use stats::{CacheStats, FetchStats, Stats};

mod channel;
pub use channel::{Consumer, STATUS_ERROR, STATUS_OK};

mod dispatcher;
pub use dispatcher::{ConsumerId, Dispatcher, Handle};

mod cache;
mod registry;
mod util;
