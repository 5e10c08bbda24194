//! HTTP-backed read-only artifact source.
//!
//! Reads are serviced via HTTP range requests against a single object URL,
//! e.g. an immutable blob in object storage fronted by HTTP.

use async_trait::async_trait;
use tracing::{debug, trace};
use url::Url;

use lacuna_core::{LacunaError, LacunaErrorKind, LacunaResult, RangeSource};

/// HTTP-backed read-only artifact source.
pub struct HttpRangeSource {
    url: Url,
    size_bytes: u64,
    client: reqwest::Client,
}

impl HttpRangeSource {
    /// Construct a new HTTP source. `url` must be absolute and point to the
    /// backing object; its size is probed remotely.
    pub async fn new(url: Url) -> LacunaResult<Self> {
        let client = reqwest::Client::new();
        debug!(url = %url, "http source probe");
        let size_bytes = probe_size(&client, &url)
            .await
            .map_err(map_http_err("probe size"))?;
        Ok(Self {
            url,
            size_bytes,
            client,
        })
    }

    /// Construct with an explicit size (skips the remote probe).
    pub fn new_with_size(url: Url, size_bytes: u64) -> Self {
        Self {
            url,
            size_bytes,
            client: reqwest::Client::new(),
        }
    }

    /// Total size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

#[async_trait]
impl RangeSource for HttpRangeSource {
    async fn total_len(&self) -> LacunaResult<u64> {
        Ok(self.size_bytes)
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> LacunaResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|end| *end <= self.size_bytes)
            .ok_or_else(|| {
                LacunaError::with_message(LacunaErrorKind::OutOfRange, "read exceeds object size")
            })?;
        trace!(url = %self.url, offset, end, "http read range");
        read_range(&self.client, &self.url, offset, end, buf)
            .await
            .map_err(map_http_err("read range"))
    }
}

async fn probe_size(client: &reqwest::Client, url: &Url) -> Result<u64, HttpError> {
    let head = client
        .head(url.clone())
        .send()
        .await
        .map_err(|err| HttpError::Request(err.to_string()))?;
    if head.status().is_success() {
        // parse the header directly: the body of a HEAD response is empty and
        // must not be consulted for the size
        if let Some(len) = header_content_length(head.headers()) {
            return Ok(len);
        }
    }

    // Servers without HEAD support: a one-byte ranged GET carries the total
    // size in Content-Range.
    let resp = client
        .get(url.clone())
        .header(reqwest::header::RANGE, "bytes=0-0")
        .send()
        .await
        .map_err(|err| HttpError::Request(err.to_string()))?;
    if resp.status() == reqwest::StatusCode::PARTIAL_CONTENT {
        let header = resp
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|val| val.to_str().ok())
            .ok_or(HttpError::MissingContentRange)?;
        return parse_content_range_total(header).ok_or(HttpError::MissingContentRange);
    }
    if resp.status().is_success() {
        if let Some(len) = header_content_length(resp.headers()) {
            return Ok(len);
        }
    }
    Err(HttpError::Status(resp.status().as_u16()))
}

fn header_content_length(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

async fn read_range(
    client: &reqwest::Client,
    url: &Url,
    start: u64,
    end: u64,
    buf: &mut [u8],
) -> Result<usize, HttpError> {
    let resp = client
        .get(url.clone())
        .header(reqwest::header::RANGE, format!("bytes={}-{}", start, end - 1))
        .send()
        .await
        .map_err(|err| HttpError::Request(err.to_string()))?;
    let status = resp.status();
    let body = match status {
        reqwest::StatusCode::PARTIAL_CONTENT | reqwest::StatusCode::OK => resp
            .bytes()
            .await
            .map_err(|err| HttpError::Request(err.to_string()))?,
        _ => return Err(HttpError::Status(status.as_u16())),
    };

    // A server free to ignore Range replies 200 with the whole object; slice
    // the requested window out locally.
    let slice = if status == reqwest::StatusCode::OK {
        let lo = usize::try_from(start).map_err(|_| HttpError::BodyTooLarge)?;
        let hi = usize::try_from(end).map_err(|_| HttpError::BodyTooLarge)?;
        if body.len() < hi {
            return Err(HttpError::ShortBody {
                expected: hi - lo,
                got: body.len().saturating_sub(lo),
            });
        }
        &body[lo..hi]
    } else {
        &body[..]
    };

    let copy_len = slice.len().min(buf.len());
    buf[..copy_len].copy_from_slice(&slice[..copy_len]);
    Ok(copy_len)
}

/// `Content-Range: bytes a-b/total`
fn parse_content_range_total(header: &str) -> Option<u64> {
    let (_, total) = header.strip_prefix("bytes ")?.rsplit_once('/')?;
    total.parse().ok()
}

fn map_http_err(op: &'static str) -> impl FnOnce(HttpError) -> LacunaError {
    move |err| LacunaError::with_message(LacunaErrorKind::Io, format!("{op}: {err}"))
}

#[derive(Debug, thiserror::Error)]
enum HttpError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("missing or invalid Content-Range header")]
    MissingContentRange,
    #[error("response body short: expected {expected}, got {got}")]
    ShortBody { expected: usize, got: usize },
    #[error("response body exceeds addressable memory")]
    BodyTooLarge,
}
