//! End-to-end streaming tests against an in-process HTTP server serving byte ranges.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use s3cat::download::{Client, Error, Manager, Url};
use s3cat::SequencerError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PART_SIZE: u64 = 4_096;

/// How the test server answers ranged requests.
#[derive(Debug, Clone, Copy)]
enum Mode {
    /// Serve ranges, answering later parts sooner.
    Ranges,
    /// Always serve the whole object.
    IgnoreRanges,
    /// Fail the range starting at the given offset.
    FailAt(u64),
    /// Serve one byte less than announced for every part but the first.
    Truncate,
    /// Hold the range starting at the given offset for the given duration.
    Stall(u64, Duration),
}

async fn serve(data: Vec<u8>, mode: Mode) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let data = Arc::new(data);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(respond(socket, Arc::clone(&data), mode));
        }
    });

    Url::parse(&format!("http://{addr}/bucket/object")).unwrap()
}

async fn respond(mut socket: TcpStream, data: Arc<Vec<u8>>, mode: Mode) {
    let mut request = Vec::new();
    let mut buf = [0; 1_024];

    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }

    let request = String::from_utf8_lossy(&request);
    let range = request.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.eq_ignore_ascii_case("range").then(|| parse_range(value.trim())).flatten()
    });

    let total = data.len() as u64;

    let (head, body): (String, &[u8]) = match (mode, range) {
        (Mode::IgnoreRanges, _) | (_, None) => (format!("HTTP/1.1 200 OK\r\nContent-Length: {total}\r\n"), &data[..]),
        (_, Some(range)) if range.start >= total => (
            format!("HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{total}\r\nContent-Length: 0\r\n"),
            &data[..0],
        ),
        (Mode::FailAt(offset), Some(range)) if range.start == offset => {
            ("HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n".to_owned(), &data[..0])
        }
        (mode, Some(range)) => {
            let end = range.end.min(total);

            let delay = match mode {
                Mode::Stall(offset, delay) if range.start == offset => delay,
                Mode::Stall(..) => Duration::ZERO,
                _ => Duration::from_millis((total - range.start) * 20 / total),
            };
            tokio::time::sleep(delay).await;

            let mut body = &data[range.start as usize..end as usize];
            if matches!(mode, Mode::Truncate) && range.start > 0 {
                body = &body[..body.len() - 1];
            }

            (
                format!(
                    "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {}-{}/{total}\r\nContent-Length: {}\r\n",
                    range.start,
                    end - 1,
                    body.len()
                ),
                body,
            )
        }
    };

    let _ = socket.write_all(format!("{head}Connection: close\r\n\r\n").as_bytes()).await;
    let _ = socket.write_all(body).await;
    let _ = socket.shutdown().await;
}

fn parse_range(value: &str) -> Option<Range<u64>> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some(start.parse().ok()?..end.parse::<u64>().ok()? + 1)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn manager() -> Manager {
    Manager::new()
        .with_client(Client::builder().no_proxy().build().unwrap())
        .with_part_size(PART_SIZE)
        .with_concurrency(8)
}

/// A consumer whose output can be inspected after the transfer, optionally failing after `limit` bytes.
#[derive(Debug, Clone, Default)]
struct SharedSink {
    data: Arc<Mutex<Vec<u8>>>,
    limit: Option<usize>,
}

impl SharedSink {
    fn limited(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    fn output(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl io::Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.lock().unwrap();

        if self.limit.is_some_and(|limit| data.len() + buf.len() > limit) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
#[tracing_test::traced_test]
async fn test_cat_reordered_parts() {
    let data = pattern(100_000);
    let url = serve(data.clone(), Mode::Ranges).await;

    let sink = SharedSink::default();
    let stats = manager().cat(&url, sink.clone()).await.unwrap();

    assert_eq!(stats.flushed, data.len() as u64);
    assert_eq!(sink.output(), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cat_to_file() {
    let data = pattern(3 * PART_SIZE as usize);
    let url = serve(data.clone(), Mode::Ranges).await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    let stats = manager().cat(&url, file.reopen().unwrap()).await.unwrap();

    let mut output = Vec::new();
    file.read_to_end(&mut output).unwrap();

    assert_eq!(stats.flushed, data.len() as u64);
    assert_eq!(output, data);
}

#[tokio::test(flavor = "multi_thread")]
#[tracing_test::traced_test]
async fn test_cat_stalled_part_bounds_lookahead() {
    const LOOKAHEAD: usize = 4;

    let data = pattern(64 * PART_SIZE as usize);
    let url = serve(data.clone(), Mode::Stall(PART_SIZE, Duration::from_millis(500))).await;

    let sink = SharedSink::default();
    let stats = manager()
        .with_concurrency(2)
        .with_lookahead(LOOKAHEAD)
        .cat(&url, sink.clone())
        .await
        .unwrap();

    assert_eq!(stats.flushed, data.len() as u64);
    assert_eq!(sink.output(), data);

    // the stalled part keeps its own slot, the others may only wait behind it
    assert!(stats.peak_pending_bytes > 0);
    assert!(
        stats.peak_pending_bytes <= (LOOKAHEAD as u64 - 1) * PART_SIZE,
        "held {} bytes out of order",
        stats.peak_pending_bytes
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cat_ranges_ignored() {
    let data = pattern(10_000);
    let url = serve(data.clone(), Mode::IgnoreRanges).await;

    let sink = SharedSink::default();
    let stats = manager().cat(&url, sink.clone()).await.unwrap();

    assert_eq!(stats.flushed, data.len() as u64);
    assert_eq!(sink.output(), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cat_small_and_empty_objects() {
    for len in [0, 1, PART_SIZE as usize - 1, PART_SIZE as usize, PART_SIZE as usize + 1] {
        let data = pattern(len);
        let url = serve(data.clone(), Mode::Ranges).await;

        let sink = SharedSink::default();
        let stats = manager().cat(&url, sink.clone()).await.unwrap();

        assert_eq!(stats.flushed, len as u64);
        assert_eq!(sink.output(), data, "object of {len} bytes");
    }
}

#[tokio::test(flavor = "multi_thread")]
#[tracing_test::traced_test]
async fn test_cat_failed_part() {
    let data = pattern(20 * PART_SIZE as usize);
    let url = serve(data.clone(), Mode::FailAt(3 * PART_SIZE)).await;

    let sink = SharedSink::default();
    let err = manager().cat(&url, sink.clone()).await.unwrap_err();

    assert!(matches!(err, Error::Status { status, ref range } if status == 500 && range.start == 3 * PART_SIZE), "{err:?}");

    // nothing may be written past the missing part
    let output = sink.output();
    assert!(output.len() <= 3 * PART_SIZE as usize);
    assert_eq!(output, data[..output.len()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cat_truncated_part() {
    let data = pattern(4 * PART_SIZE as usize);
    let url = serve(data.clone(), Mode::Truncate).await;

    let sink = SharedSink::default();
    let err = manager().cat(&url, sink.clone()).await.unwrap_err();

    assert!(matches!(err, Error::ShortBody { expected, actual, .. } if expected == actual + 1), "{err:?}");
    assert!(sink.output().len() < data.len());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cat_sink_failure() {
    let data = pattern(10 * PART_SIZE as usize);
    let url = serve(data.clone(), Mode::Ranges).await;

    let sink = SharedSink::limited(2 * PART_SIZE as usize);
    let err = manager().cat(&url, sink.clone()).await.unwrap_err();

    assert!(
        matches!(err, Error::Sequencer(SequencerError::ConsumerWrite(_) | SequencerError::Closed)),
        "{err:?}"
    );
    assert_eq!(sink.output(), data[..2 * PART_SIZE as usize]);
}
