use thiserror::Error;

/// A list of possible errors returned by HttpVfs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The file was never opened.
    #[error("file {0} is not open")]
    NotOpen(String),
    /// The requested range spans more than one page.
    #[error("read of {length} bytes at offset {offset} crosses a {page_size}-byte page")]
    CrossPageRead {
        /// Offset of the read.
        offset: u64,
        /// Length of the read.
        length: usize,
        /// Page size of the file.
        page_size: u32,
    },
    /// The discovered page size exceeds the configured maximum.
    #[error("page size {page_size} exceeds the maximum {max}")]
    PageSizeExceeded {
        /// The discovered page size.
        page_size: u32,
        /// The configured maximum.
        max: u32,
    },
    /// The page size stored in the file header is malformed.
    #[error("invalid page size {0} in file header")]
    InvalidPageSize(u32),
    /// A network or HTTP failure.
    #[error("fetch: {0}")]
    Fetch(String),
    /// The fetch was cancelled before it completed.
    #[error("fetch aborted")]
    Aborted,
    /// A malformed or out-of-order message.
    #[error("protocol: {0}")]
    Protocol(String),
    /// The dispatcher reported a failure status.
    #[error("operation failed")]
    Failed,
    /// The dispatcher has been closed.
    #[error("dispatcher closed")]
    Closed,
    /// A local resource (runtime, thread, client or output) failed.
    #[error("setup: {0}")]
    Setup(String),
}

impl Error {
    /// Returns true if the error comes from the network and the operation may
    /// succeed when retried.
    pub fn is_fetch(&self) -> bool {
        matches!(self, Error::Fetch(_) | Error::Aborted)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Fetch(err.to_string())
    }
}

/// A specialized [`Result`] type returned by HttpVfs.
pub type Result<T, E = Error> = std::result::Result<T, E>;
