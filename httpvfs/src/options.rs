use std::time::Duration;

/// Options to configure a dispatcher.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct Options {
    /// The largest page size accepted for a file.
    ///
    /// Files whose header declares a larger page are unusable. This is also
    /// the size of the data buffer handed to each consumer.
    ///
    /// Default: 64KB
    pub max_page_size: u32,

    /// The number of bytes the page cache may keep resident.
    ///
    /// Default: 32MB
    pub cache_capacity: usize,

    /// Extra HTTP headers sent with every request, e.g. authorization.
    ///
    /// Default: empty
    pub request_headers: Vec<(String, String)>,

    /// The upper bound of a coalesced fetch.
    ///
    /// Sequential access doubles the chunk size on each miss until it reaches
    /// this limit. The effective limit never exceeds the cache capacity.
    ///
    /// Default: 1MB
    pub max_super_page_size: usize,

    /// The timeout of a single HTTP request. `None` disables it.
    ///
    /// Default: 60s
    pub fetch_timeout: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_page_size: 64 << 10,
            cache_capacity: 32 << 20,
            request_headers: Vec::new(),
            max_super_page_size: 1 << 20,
            fetch_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl Options {
    /// Adds an HTTP header sent with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.push((name.into(), value.into()));
        self
    }
}
