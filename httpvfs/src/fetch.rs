//! Byte-range sources.
//!
//! The dispatcher never talks to the network directly. It drives a
//! [`Fetcher`], which answers metadata probes and byte-range reads for a URL.
//! [`HttpFetcher`] is the production implementation on top of `reqwest`.

use std::ops::Range;

pub use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE},
    Client, StatusCode,
};

use crate::{Error, Options, Result};

/// Metadata of a remote file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Probe {
    /// The size of the file in bytes.
    pub size: u64,
    /// Whether the server advertises byte-range support.
    pub accepts_ranges: bool,
}

/// Provides byte-range access to remote files.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// Applies the dispatcher options, called once on `init`.
    fn configure(&mut self, _options: &Options) -> Result<()> {
        Ok(())
    }

    /// Returns the size of the file at `url`.
    async fn probe(&self, url: &str) -> Result<Probe>;

    /// Reads the bytes of `url` in `range`.
    ///
    /// The result may be shorter than the range if it extends past the end of
    /// the file.
    async fn fetch(&self, url: &str, range: Range<u64>) -> Result<Bytes>;
}

/// A [`Fetcher`] that issues HTTP requests with `Range` headers.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Creates a fetcher with the default options.
    pub fn new() -> Result<Self> {
        let client = build_client(&Options::default())?;
        Ok(Self { client })
    }

    async fn probe_with_range(&self, url: &str) -> Result<Probe> {
        let resp = self
            .client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await?;
        let status = resp.status();
        match status {
            StatusCode::PARTIAL_CONTENT => {
                let size = resp
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range_total)
                    .ok_or_else(|| Error::Fetch(format!("GET {url}: missing Content-Range")))?;
                Ok(Probe {
                    size,
                    accepts_ranges: true,
                })
            }
            StatusCode::OK => {
                // The server ignored the range and sent the whole file.
                let body = resp.bytes().await?;
                Ok(Probe {
                    size: body.len() as u64,
                    accepts_ranges: false,
                })
            }
            s => Err(Error::Fetch(format!("GET {url}: unexpected status {s}"))),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn configure(&mut self, options: &Options) -> Result<()> {
        self.client = build_client(options)?;
        Ok(())
    }

    async fn probe(&self, url: &str) -> Result<Probe> {
        let head = self.client.head(url).send().await?;
        let status = head.status();
        if status.is_success() {
            let size = head
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            if let Some(size) = size {
                let accepts_ranges = head
                    .headers()
                    .get(ACCEPT_RANGES)
                    .map_or(false, |v| v.as_bytes() == b"bytes");
                return Ok(Probe {
                    size,
                    accepts_ranges,
                });
            }
            debug!("HEAD {url} has no Content-Length, probe with a range request");
        } else {
            debug!("HEAD {url} returned {status}, probe with a range request");
        }
        self.probe_with_range(url).await
    }

    async fn fetch(&self, url: &str, range: Range<u64>) -> Result<Bytes> {
        if range.is_empty() {
            return Ok(Bytes::new());
        }
        let resp = self
            .client
            .get(url)
            .header(RANGE, format!("bytes={}-{}", range.start, range.end - 1))
            .send()
            .await?;
        let status = resp.status();
        match status {
            StatusCode::PARTIAL_CONTENT => {
                let mut body = resp.bytes().await?;
                body.truncate((range.end - range.start) as usize);
                Ok(body)
            }
            StatusCode::OK => {
                warn!("GET {url} ignored the range {range:?}, slice the full response");
                let body = resp.bytes().await?;
                let len = body.len() as u64;
                let start = range.start.min(len) as usize;
                let end = range.end.min(len) as usize;
                Ok(body.slice(start..end))
            }
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(Bytes::new()),
            s => Err(Error::Fetch(format!("GET {url} {range:?}: unexpected status {s}"))),
        }
    }
}

fn build_client(options: &Options) -> Result<Client> {
    let mut headers = HeaderMap::new();
    for (name, value) in &options.request_headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| Error::Setup(format!("header name {name:?}: {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| Error::Setup(format!("header value for {name}: {err}")))?;
        headers.insert(name, value);
    }
    let mut builder = Client::builder().default_headers(headers);
    if let Some(timeout) = options.fetch_timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|err| Error::Setup(format!("http client: {err}")))
}

/// Parses the total length out of `bytes 0-0/8192`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (unit, rest) = value.split_once(' ')?;
    if unit != "bytes" {
        return None;
    }
    let (_, total) = rest.split_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/8192"), Some(8192));
        assert_eq!(parse_content_range_total("bytes */100"), Some(100));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("items 0-0/10"), None);
    }

    #[tokio::test]
    async fn fetch_range() {
        let server = MockServer::start().await;
        let data = body(8192);
        Mock::given(method("GET"))
            .and(path("/db"))
            .and(header("range", "bytes=1024-2047"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(data[1024..2048].to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new().unwrap();
        let url = format!("{}/db", server.uri());
        let page = fetcher.fetch(&url, 1024..2048).await.unwrap();
        assert_eq!(&page[..], &data[1024..2048]);
    }

    #[tokio::test]
    async fn fetch_ignored_range() {
        let server = MockServer::start().await;
        let data = body(4096);
        Mock::given(method("GET"))
            .and(path("/db"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new().unwrap();
        let url = format!("{}/db", server.uri());
        let page = fetcher.fetch(&url, 3072..5120).await.unwrap();
        assert_eq!(&page[..], &data[3072..]);
    }

    #[tokio::test]
    async fn fetch_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new().unwrap();
        let url = format!("{}/db", server.uri());
        let err = fetcher.fetch(&url, 0..1024).await.unwrap_err();
        assert!(err.is_fetch());
    }

    #[tokio::test]
    async fn probe_falls_back_to_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/db"))
            .and(header("range", "bytes=0-0"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-0/8192")
                    .set_body_bytes(vec![0u8]),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new().unwrap();
        let url = format!("{}/db", server.uri());
        let probe = fetcher.probe(&url).await.unwrap();
        assert_eq!(
            probe,
            Probe {
                size: 8192,
                accepts_ranges: true
            }
        );
    }

    #[tokio::test]
    async fn probe_missing_file() {
        let server = MockServer::start().await;
        let fetcher = HttpFetcher::new().unwrap();
        let url = format!("{}/missing", server.uri());
        assert!(fetcher.probe(&url).await.unwrap_err().is_fetch());
    }

    #[tokio::test]
    async fn request_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![7u8; 16]))
            .expect(1)
            .mount(&server)
            .await;

        let mut fetcher = HttpFetcher::new().unwrap();
        let options = Options::default().with_header("Authorization", "Bearer secret");
        fetcher.configure(&options).unwrap();
        let url = format!("{}/db", server.uri());
        let bytes = fetcher.fetch(&url, 0..16).await.unwrap();
        assert_eq!(&bytes[..], &[7u8; 16]);
    }

    #[test]
    fn invalid_header() {
        let mut fetcher = HttpFetcher::new().unwrap();
        let options = Options::default().with_header("bad header", "x");
        assert!(matches!(fetcher.configure(&options), Err(Error::Setup(_))));
    }
}
