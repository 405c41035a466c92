//! This module provides the parallel ranged download features.

use std::io::Write;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;

pub use bytes::Bytes;
pub use reqwest::Client;
pub use url::Url;

use crate::{Sequencer, SequencerError, Stats};

static MAX_HTTP_REQUESTS: Semaphore = Semaphore::const_new(50);

/// Default size of a ranged request, in bytes.
pub const DEFAULT_PART_SIZE: u64 = 5 * 1_024 * 1_024;
/// Default number of ranged requests in flight.
pub const DEFAULT_CONCURRENCY: usize = 5;
/// Default look-ahead, in parts per request in flight.
const LOOKAHEAD_FACTOR: usize = 2;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
    #[error(transparent)]
    Task(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Acquire(#[from] tokio::sync::AcquireError),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error("unsupported URL: `{0}`")]
    UnsupportedUrl(String),
    #[error("unexpected HTTP status {status} for range {range:?}")]
    Status { status: StatusCode, range: Range<u64> },
    #[error("malformed Content-Range header: {0:?}")]
    ContentRange(String),
    #[error("expected {expected} bytes at offset {offset}, got {actual}")]
    ShortBody { offset: u64, expected: u64, actual: u64 },
}

/// A fetched part of a remote object.
#[derive(Debug)]
pub struct Part {
    /// Absolute offset of `data` in the object.
    pub offset: u64,
    pub data: Bytes,
    /// Total size of the object, as reported by the server.
    pub total: u64,
}

/// Ranged download manager.
///
/// Fetches a remote object in parts of `part_size` bytes with at most `concurrency` requests in flight, and streams it in order to a
/// sequential sink through a [`Sequencer`].
///
/// A part is only requested once it falls within `lookahead` parts of the write cursor, so that a stalled part holds at most
/// `lookahead - 1` parts in memory behind it.
///
/// Failed parts are not retried: the first error aborts the whole transfer.
#[derive(Debug, Clone)]
pub struct Manager {
    client: Client,
    part_size: u64,
    concurrency: usize,
    lookahead: Option<usize>,
}

impl Default for Manager {
    fn default() -> Self {
        Self {
            client: Client::default(),
            part_size: DEFAULT_PART_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            lookahead: None,
        }
    }
}

impl Manager {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_client(self, client: Client) -> Self {
        Self { client, ..self }
    }

    /// Build a new `Manager` fetching parts of `part_size` bytes (at least one).
    #[inline]
    pub fn with_part_size(self, part_size: u64) -> Self {
        Self {
            part_size: part_size.max(1),
            ..self
        }
    }

    /// Build a new `Manager` keeping up to `concurrency` requests in flight (at least one).
    #[inline]
    pub fn with_concurrency(self, concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            ..self
        }
    }

    /// Build a new `Manager` requesting parts up to `lookahead` parts ahead of the write cursor (at least one).
    ///
    /// Defaults to twice the concurrency.
    #[inline]
    pub fn with_lookahead(self, lookahead: usize) -> Self {
        Self {
            lookahead: Some(lookahead.max(1)),
            ..self
        }
    }

    #[inline]
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    #[inline]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    #[inline]
    pub fn lookahead(&self) -> usize {
        self.lookahead.unwrap_or(self.concurrency * LOOKAHEAD_FACTOR)
    }

    /// Stream the object at `url` to `sink`, returning the sequencer stats once the whole object went through.
    ///
    /// The first part is fetched alone to discover the object size, then the remaining parts are fetched concurrently and admitted as they
    /// complete. The sink is written from the blocking thread pool and flushed at the end.
    ///
    /// Parts take a slot of the look-ahead window in order before being requested, and slots are given back as the cursor passes their
    /// parts. The lowest part not flushed yet always holds a slot, so the window never starves.
    ///
    /// On error, the sequencer is closed so that parts still in flight are discarded, and nothing more is written to the sink.
    pub async fn cat<W: Write + Send + 'static>(&self, url: &Url, sink: W) -> Result<Stats, Error> {
        let sequencer = Arc::new(Sequencer::new(sink));

        let first = self.fetch_range(url, 0..self.part_size).await?;
        let total = first.total;
        let next = first.data.len() as u64;

        tracing::debug!("Streaming {total} bytes from `{url}` in parts of {} bytes", self.part_size);

        let result: Result<(), Error> = async {
            admit(&sequencer, first).await?;

            let sequencer = &sequencer;
            let window = &Semaphore::new(self.lookahead());
            let released = &AtomicU64::new(0);

            stream::iter(ranges(next..total, self.part_size))
                .then(|range| async move {
                    let permit = window.acquire().await?;
                    permit.forget();

                    Ok::<_, Error>(range)
                })
                .map_ok(|range| async move {
                    let part = self.fetch_range(url, range).await?;
                    let cursor = admit(sequencer, part).await?;

                    // cursor always lies on a part boundary
                    let passed = (cursor - next).div_ceil(self.part_size);
                    let previous = released.fetch_max(passed, Ordering::AcqRel);

                    if passed > previous {
                        window.add_permits((passed - previous) as usize);
                    }

                    Ok::<_, Error>(())
                })
                .try_buffer_unordered(self.concurrency)
                .try_collect::<()>()
                .await
        }
        .await;

        if let Err(err) = result {
            tracing::debug!("Aborting stream from `{url}`: {err}");

            sequencer.close();
            return Err(err);
        }

        // every admit has been awaited, so this is the last reference
        let sequencer = Arc::try_unwrap(sequencer).map_err(|_| SequencerError::Closed)?;

        let stats = sequencer.stats();
        tracing::debug!(
            "Streamed {} bytes from `{url}`, holding up to {} bytes out of order",
            stats.flushed,
            stats.peak_pending_bytes
        );

        let mut sink = sequencer.finish(Some(total))?;
        tokio::task::spawn_blocking(move || sink.flush()).await??;

        Ok(stats)
    }

    /// Fetch the `range` of the object at `url`.
    ///
    /// A server ignoring the range may answer with the whole object, which is accepted for a range starting at `0` only.
    pub async fn fetch_range(&self, url: &Url, range: Range<u64>) -> Result<Part, Error> {
        debug_assert!(!range.is_empty());

        let _permit = MAX_HTTP_REQUESTS.acquire().await?;

        tracing::trace!("Fetching range {range:?} from `{url}`");

        let resp = self
            .client
            .get(url.clone())
            .header(RANGE, format!("bytes={}-{}", range.start, range.end - 1))
            .send()
            .await?;

        let status = resp.status();
        let content_range = resp
            .headers()
            .get(CONTENT_RANGE)
            .map(|value| value.to_str().map(str::to_owned).map_err(|_| Error::ContentRange(format!("{value:?}"))))
            .transpose()?;

        match (status, content_range) {
            (StatusCode::PARTIAL_CONTENT, Some(content_range)) => {
                let (served, total) = parse_content_range(&content_range)?;
                let data = resp.bytes().await?;

                let expected = range.end.min(total).saturating_sub(range.start);
                let actual = data.len() as u64;

                if !served.is_some_and(|served| served.start == range.start) || actual != expected {
                    return Err(Error::ShortBody {
                        offset: range.start,
                        expected,
                        actual,
                    });
                }

                Ok(Part {
                    offset: range.start,
                    data,
                    total,
                })
            }
            (StatusCode::OK, _) if range.start == 0 => {
                tracing::debug!("Range ignored by server, fetching whole object from `{url}`");

                let data = resp.bytes().await?;

                Ok(Part {
                    offset: 0,
                    total: data.len() as u64,
                    data,
                })
            }
            // an empty object cannot satisfy any range
            (StatusCode::RANGE_NOT_SATISFIABLE, Some(content_range)) if range.start == 0 => match parse_content_range(&content_range)? {
                (None, 0) => Ok(Part {
                    offset: 0,
                    data: Bytes::new(),
                    total: 0,
                }),
                _ => Err(Error::Status { status, range }),
            },
            _ => Err(Error::Status { status, range }),
        }
    }
}

/// Resolve a command-line object location to an HTTP URL.
///
/// `http(s)://` URLs are kept as is, while `s3://bucket/key` locations are mapped to the public virtual-hosted URL of the object, or
/// to the path-style `{endpoint}/bucket/key` URL when an `endpoint` is given.
pub fn resolve_url(location: &str, endpoint: Option<&Url>) -> Result<Url, Error> {
    let url = Url::parse(location)?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        "s3" => {
            let bucket = url.host_str().filter(|bucket| !bucket.is_empty());
            let key = url.path().trim_start_matches('/');

            let Some(bucket) = bucket.filter(|_| !key.is_empty()) else {
                return Err(Error::UnsupportedUrl(location.to_owned()));
            };

            let url = match endpoint {
                Some(endpoint) => format!("{}/{bucket}/{key}", endpoint.as_str().trim_end_matches('/')),
                None => format!("https://{bucket}.s3.amazonaws.com/{key}"),
            };

            Ok(Url::parse(&url)?)
        }
        _ => Err(Error::UnsupportedUrl(location.to_owned())),
    }
}

/// Admit `part` from the blocking thread pool, returning the write cursor right after.
async fn admit<W: Write + Send + 'static>(sequencer: &Arc<Sequencer<W>>, part: Part) -> Result<u64, Error> {
    let sequencer = Arc::clone(sequencer);

    let cursor = tokio::task::spawn_blocking(move || sequencer.admit(part.offset, part.data).map(|()| sequencer.cursor())).await??;

    Ok(cursor)
}

/// Split `bounds` into consecutive ranges of `part_size` bytes, the last one being possibly shorter.
fn ranges(bounds: Range<u64>, part_size: u64) -> impl Iterator<Item = Range<u64>> {
    let end = bounds.end;

    bounds.step_by(part_size as usize).map(move |start| start..(start + part_size).min(end))
}

/// Parse a `Content-Range` header value as its served range (if any) and the object total size.
fn parse_content_range(value: &str) -> Result<(Option<Range<u64>>, u64), Error> {
    let malformed = || Error::ContentRange(value.to_owned());

    let (range, total) = value.strip_prefix("bytes ").and_then(|value| value.split_once('/')).ok_or_else(malformed)?;
    let total = total.parse().map_err(|_| malformed())?;

    if range == "*" {
        return Ok((None, total));
    }

    let (start, end) = range.split_once('-').ok_or_else(malformed)?;
    let start: u64 = start.parse().map_err(|_| malformed())?;
    let end: u64 = end.parse().map_err(|_| malformed())?;

    if start > end || end >= total {
        return Err(malformed());
    }

    Ok((Some(start..end + 1), total))
}
