//! Change-feed poller
//!
//! The index feed is a newline-delimited JSON stream of `{Path, Version,
//! Timestamp}` objects, resumable with `?since=<Timestamp>`. The crawler
//! streams each round, hands every entry to the dispatcher and only then
//! moves its cursor. Busy feeds (a full page of `high_water_mark` entries)
//! are polled again immediately; quiet ones after `poll_interval`.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use modcas_common::{FeedEntry, ReleaseNotification};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::commit::CommitTracker;
use crate::error::FeedError;
use crate::store::HashStore;

/// Default change feed.
pub const DEFAULT_FEED_URL: &str = "https://index.golang.org/index";

/// Default pause between rounds on a quiet feed.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Page size the index serves; a full page means more is waiting.
pub const DEFAULT_HIGH_WATER_MARK: usize = 2000;

/// Longest feed line accepted.
const MAX_LINE_LENGTH: usize = 64 * 1024;

type FeedLines = FramedRead<Pin<Box<dyn AsyncRead + Send>>, FeedLineCodec>;

/// One line of the feed body
#[derive(Debug, PartialEq, Eq)]
enum FeedFrame {
    /// Line contents without the line ending
    Line(Bytes),
    /// A line longer than the limit; its bytes were discarded
    Oversized,
}

/// Splits the feed body on `\n` without looking at the content.
///
/// Lines over `max_length` are dropped as they stream in and reported as
/// [`FeedFrame::Oversized`] once their end is seen, so a bad line never ends
/// the stream. UTF-8 validation is left to the JSON decoder.
#[derive(Debug)]
struct FeedLineCodec {
    max_length: usize,
    next_index: usize,
    discarding: bool,
}

impl FeedLineCodec {
    fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

fn strip_line_ending(mut line: BytesMut) -> Bytes {
    if line.last() == Some(&b'\n') {
        line.truncate(line.len() - 1);
    }
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    line.freeze()
}

impl Decoder for FeedLineCodec {
    type Item = FeedFrame;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<FeedFrame>, Self::Error> {
        let newline = buf[self.next_index..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|offset| self.next_index + offset);

        match newline {
            Some(end) => {
                let line = buf.split_to(end + 1);
                self.next_index = 0;
                if std::mem::take(&mut self.discarding) || end > self.max_length {
                    return Ok(Some(FeedFrame::Oversized));
                }
                Ok(Some(FeedFrame::Line(strip_line_ending(line))))
            }
            None if self.discarding || buf.len() > self.max_length => {
                buf.clear();
                self.next_index = 0;
                self.discarding = true;
                Ok(None)
            }
            None => {
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<FeedFrame>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if std::mem::take(&mut self.discarding) {
            return Ok(Some(FeedFrame::Oversized));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let line = buf.split_to(buf.len());
        Ok(Some(FeedFrame::Line(strip_line_ending(line))))
    }
}

/// Crawler settings
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub feed_url: String,
    pub poll_interval: Duration,
    pub high_water_mark: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            feed_url: DEFAULT_FEED_URL.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

impl CrawlerConfig {
    pub fn with_feed_url(mut self, url: impl Into<String>) -> Self {
        self.feed_url = url.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }
}

/// How one polling round went
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoundSummary {
    /// Non-blank lines read, undecodable ones included
    pub received: usize,
    /// Notifications accepted by the dispatcher channel
    pub handed_off: usize,
    /// Round ended early on a transport or status error
    pub failed: bool,
    /// Cancellation or a closed channel stopped the round
    pub stopped: bool,
}

/// Where a handed-off cursor goes
enum CursorSink {
    Eager(Arc<dyn HashStore>),
    AfterCommit(Arc<CommitTracker>),
}

/// Polls the change feed and feeds the dispatcher
pub struct IndexCrawler {
    config: CrawlerConfig,
    client: reqwest::Client,
    sender: mpsc::Sender<ReleaseNotification>,
    sink: CursorSink,
    token: CancellationToken,
    cursor: String,
    next_seq: u64,
    total: u64,
}

impl IndexCrawler {
    /// Crawler that persists its cursor at the end of each round.
    pub fn eager(
        config: CrawlerConfig,
        client: reqwest::Client,
        sender: mpsc::Sender<ReleaseNotification>,
        store: Arc<dyn HashStore>,
        token: CancellationToken,
    ) -> Self {
        Self::with_sink(config, client, sender, CursorSink::Eager(store), token)
    }

    /// Crawler that leaves cursor persistence to `tracker`.
    pub fn after_commit(
        config: CrawlerConfig,
        client: reqwest::Client,
        sender: mpsc::Sender<ReleaseNotification>,
        tracker: Arc<CommitTracker>,
        token: CancellationToken,
    ) -> Self {
        Self::with_sink(config, client, sender, CursorSink::AfterCommit(tracker), token)
    }

    fn with_sink(
        config: CrawlerConfig,
        client: reqwest::Client,
        sender: mpsc::Sender<ReleaseNotification>,
        sink: CursorSink,
        token: CancellationToken,
    ) -> Self {
        Self {
            config,
            client,
            sender,
            sink,
            token,
            cursor: String::new(),
            next_seq: 0,
            total: 0,
        }
    }

    /// Cursor of the last handed-off entry.
    pub fn cursor(&self) -> &str {
        &self.cursor
    }

    /// Poll until cancelled or the dispatcher goes away, starting after
    /// `initial_cursor` (empty for the beginning of the feed).
    pub async fn run(mut self, initial_cursor: String) {
        self.cursor = initial_cursor;
        let mut persisted = self.cursor.clone();

        info!(feed = %self.config.feed_url, since = %self.cursor, "crawler started");

        loop {
            let round = self.poll_round().await;

            if round.stopped {
                break;
            }

            if let CursorSink::Eager(store) = &self.sink {
                if self.cursor != persisted {
                    match store.write_cursor(&self.cursor).await {
                        Ok(()) => persisted = self.cursor.clone(),
                        Err(err) => {
                            error!(cursor = %self.cursor, error = %err, "failed to persist cursor, retrying next round")
                        }
                    }
                }
            }

            info!(
                records = round.received,
                handed_off = round.handed_off,
                sum = self.total,
                cursor = %self.cursor,
                "feed round complete"
            );

            if round.failed || round.received < self.config.high_water_mark {
                tokio::select! {
                    _ = self.token.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(cursor = %self.cursor, sum = self.total, "crawler stopped");
    }

    /// Run a single round: request the feed since the current cursor and hand
    /// off every entry.
    pub async fn poll_round(&mut self) -> RoundSummary {
        let mut round = RoundSummary::default();

        let lines = tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                round.stopped = true;
                return round;
            }
            lines = self.open_feed() => lines,
        };
        let mut lines = match lines {
            Ok(lines) => lines,
            Err(err) => {
                warn!(error = %err, since = %self.cursor, "feed request failed");
                round.failed = true;
                return round;
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    round.stopped = true;
                    break;
                }
                next = lines.next() => next,
            };

            let frame = match next {
                None => break,
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    warn!(error = %FeedError::Stream(err), since = %self.cursor, "feed stream interrupted");
                    round.failed = true;
                    break;
                }
            };

            let line = match frame {
                FeedFrame::Line(line) => line,
                FeedFrame::Oversized => {
                    round.received += 1;
                    self.total += 1;
                    warn!(max = MAX_LINE_LENGTH, "skipping oversized feed line");
                    continue;
                }
            };

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            round.received += 1;
            self.total += 1;

            let entry: FeedEntry = match serde_json::from_slice(&line) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, line = %String::from_utf8_lossy(&line), "skipping undecodable feed entry");
                    continue;
                }
            };

            if !self.hand_off(entry).await {
                round.stopped = true;
                break;
            }
            round.handed_off += 1;
        }

        round
    }

    async fn open_feed(&self) -> Result<FeedLines, FeedError> {
        let mut request = self.client.get(&self.config.feed_url);
        if !self.cursor.is_empty() {
            request = request.query(&[("since", self.cursor.as_str())]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        let reader: Pin<Box<dyn AsyncRead + Send>> = Box::pin(StreamReader::new(body));
        Ok(FramedRead::new(reader, FeedLineCodec::new(MAX_LINE_LENGTH)))
    }

    /// Send one notification; the cursor moves only once the dispatcher has
    /// taken it off the channel. Returns `false` when the crawler should stop.
    async fn hand_off(&mut self, entry: FeedEntry) -> bool {
        let seq = self.next_seq;
        let release = ReleaseNotification::from_entry(entry, seq);
        let cursor = release.cursor.clone();

        if let CursorSink::AfterCommit(tracker) = &self.sink {
            tracker.register(seq, &cursor).await;
        }

        debug!(module = %release.module_path, version = %release.version, seq, "handing off release");

        let sent = tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            sent = self.sender.send(release) => sent.is_ok(),
        };
        // A free slot means the dispatcher received what was just sent.
        let sent = sent
            && tokio::select! {
                biased;
                _ = self.token.cancelled() => false,
                drained = self.sender.reserve() => drained.is_ok(),
            };

        if sent {
            self.next_seq += 1;
            self.cursor = cursor;
        } else if !self.token.is_cancelled() {
            warn!("release channel closed, stopping crawler");
        }
        sent
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn line(path: &str, version: &str, ts: &str) -> String {
        format!(r#"{{"Path":"{path}","Version":"{version}","Timestamp":"{ts}"}}"#)
    }

    fn crawler(
        server: &MockServer,
        store: Arc<MemoryStore>,
        capacity: usize,
    ) -> (IndexCrawler, mpsc::Receiver<ReleaseNotification>, CancellationToken) {
        let (tx, rx) = mpsc::channel(capacity);
        let token = CancellationToken::new();
        let config = CrawlerConfig::default()
            .with_feed_url(format!("{}/index", server.uri()))
            .with_poll_interval(Duration::from_millis(20))
            .with_high_water_mark(2000);
        let crawler = IndexCrawler::eager(config, reqwest::Client::new(), tx, store, token.clone());
        (crawler, rx, token)
    }

    #[tokio::test]
    async fn test_round_hands_off_in_feed_order() {
        let server = MockServer::start().await;
        let body = format!(
            "{}\n{}\n",
            line("example.com/a", "v1.0.0", "t1"),
            line("example.com/b", "v0.2.0", "t2")
        );
        Mock::given(method("GET"))
            .and(path("/index"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let (mut crawler, mut rx, _token) = crawler(&server, Arc::new(MemoryStore::new()), 8);
        let round = crawler.poll_round().await;

        assert_eq!(round.received, 2);
        assert_eq!(round.handed_off, 2);
        assert!(!round.failed);
        assert_eq!(crawler.cursor(), "t2");

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.module_path.as_str(), first.seq), ("example.com/a", 0));
        assert_eq!((second.cursor.as_str(), second.seq), ("t2", 1));
    }

    #[tokio::test]
    async fn test_resumes_with_since() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index"))
            .and(query_param("since", "2019-04-10T19:08:52.997264Z"))
            .respond_with(ResponseTemplate::new(200).set_body_string(line("example.com/c", "v1.0.0", "t3")))
            .expect(1)
            .mount(&server)
            .await;

        let (mut crawler, mut rx, _token) = crawler(&server, Arc::new(MemoryStore::new()), 8);
        crawler.cursor = "2019-04-10T19:08:52.997264Z".into();
        let round = crawler.poll_round().await;

        assert_eq!(round.handed_off, 1);
        assert_eq!(rx.recv().await.unwrap().cursor, "t3");
    }

    #[tokio::test]
    async fn test_bad_line_is_skipped() {
        let server = MockServer::start().await;
        let body = format!(
            "{}\n{{not json\n\n{}",
            line("example.com/a", "v1.0.0", "t1"),
            line("example.com/b", "v1.0.0", "t2")
        );
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let (mut crawler, _rx, _token) = crawler(&server, Arc::new(MemoryStore::new()), 8);
        let round = crawler.poll_round().await;

        assert_eq!(round.received, 3);
        assert_eq!(round.handed_off, 2);
        assert_eq!(crawler.cursor(), "t2");
    }

    #[test]
    fn test_codec_drops_overlong_line_across_chunks() {
        let mut codec = FeedLineCodec::new(8);
        let mut buf = BytesMut::from(&b"short\r\nxxxxxx"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(FeedFrame::Line(Bytes::from_static(b"short"))));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"xxxxxxxxxxxx");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());

        buf.extend_from_slice(b"xx\nnext\ntail");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(FeedFrame::Oversized));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(FeedFrame::Line(Bytes::from_static(b"next"))));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(FeedFrame::Line(Bytes::from_static(b"tail"))));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_codec_reports_overlong_line_at_eof() {
        let mut codec = FeedLineCodec::new(4);
        let mut buf = BytesMut::from(&b"ok\nunterminated"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(FeedFrame::Line(Bytes::from_static(b"ok"))));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(FeedFrame::Oversized));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_line_does_not_end_round() {
        let server = MockServer::start().await;
        let body = format!(
            "{}\n{{\"Path\":\"{}\"}}\n{}\n",
            line("example.com/a", "v1.0.0", "t1"),
            "x".repeat(70 * 1024),
            line("example.com/c", "v1.0.0", "t3")
        );
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let (mut crawler, _rx, _token) = crawler(&server, Arc::new(MemoryStore::new()), 8);
        let round = crawler.poll_round().await;

        assert!(!round.failed);
        assert_eq!(round.received, 3);
        assert_eq!(round.handed_off, 2);
        assert_eq!(crawler.cursor(), "t3");
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_skipped() {
        let server = MockServer::start().await;
        let mut body = format!("{}\n", line("example.com/a", "v1.0.0", "t1")).into_bytes();
        body.extend_from_slice(b"{\"Path\":\"example.com/\xff\xfe\",\"Version\":\"v1.0.0\",\"Timestamp\":\"t2\"}\n");
        body.extend_from_slice(line("example.com/c", "v1.0.0", "t3").as_bytes());
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let (mut crawler, mut rx, _token) = crawler(&server, Arc::new(MemoryStore::new()), 8);
        let round = crawler.poll_round().await;

        assert!(!round.failed);
        assert_eq!(round.received, 3);
        assert_eq!(round.handed_off, 2);
        assert_eq!(crawler.cursor(), "t3");
        assert_eq!(rx.recv().await.unwrap().cursor, "t1");
        assert_eq!(rx.recv().await.unwrap().cursor, "t3");
    }

    #[tokio::test]
    async fn test_error_status_fails_round_without_moving_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (mut crawler, _rx, _token) = crawler(&server, Arc::new(MemoryStore::new()), 8);
        crawler.cursor = "t0".into();
        let round = crawler.poll_round().await;

        assert!(round.failed);
        assert_eq!(round.received, 0);
        assert_eq!(crawler.cursor(), "t0");
    }

    #[tokio::test]
    async fn test_stalled_feed_fails_round() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(line("example.com/a", "v1.0.0", "t1"))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let (tx, _rx) = mpsc::channel(1);
        let client = reqwest::Client::builder()
            .read_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let config = CrawlerConfig::default().with_feed_url(format!("{}/index", server.uri()));
        let mut crawler = IndexCrawler::eager(config, client, tx, Arc::new(MemoryStore::new()), CancellationToken::new());

        let started = std::time::Instant::now();
        let round = crawler.poll_round().await;

        assert!(round.failed);
        assert_eq!(round.handed_off, 0);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_cursor_waits_for_receiver() {
        let server = MockServer::start().await;
        let body = format!(
            "{}\n{}\n",
            line("example.com/a", "v1.0.0", "t1"),
            line("example.com/b", "v1.0.0", "t2")
        );
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        // The dispatcher takes one notification and then stalls.
        let (mut crawler, mut rx, token) = crawler(&server, Arc::new(MemoryStore::new()), 1);
        let receiver = tokio::spawn(async move {
            let first = rx.recv().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
            (first, rx)
        });

        let round = crawler.poll_round().await;
        let (first, _rx) = receiver.await.unwrap();

        assert_eq!(first.cursor, "t1");
        assert!(round.stopped);
        assert_eq!(round.handed_off, 1);
        assert_eq!(crawler.cursor(), "t1");
    }

    #[tokio::test]
    async fn test_unreceived_notification_does_not_move_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(line("example.com/a", "v1.0.0", "t1")))
            .mount(&server)
            .await;

        // Nobody receives: the send lands in the buffer but is never taken.
        let (mut crawler, _rx, token) = crawler(&server, Arc::new(MemoryStore::new()), 1);
        crawler.cursor = "t0".into();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let round = crawler.poll_round().await;
        canceller.await.unwrap();

        assert!(round.stopped);
        assert_eq!(round.handed_off, 0);
        assert_eq!(crawler.cursor(), "t0");
    }

    #[tokio::test]
    async fn test_eager_run_persists_cursor_after_round() {
        let server = MockServer::start().await;
        let body = format!(
            "{}\n{}\n",
            line("example.com/a", "v1.0.0", "t1"),
            line("example.com/b", "v1.0.0", "t2")
        );
        Mock::given(method("GET"))
            .and(path("/index"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/index"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let (crawler, mut rx, token) = crawler(&server, store.clone(), 8);
        let handle = tokio::spawn(crawler.run(String::new()));

        assert_eq!(rx.recv().await.unwrap().cursor, "t1");
        assert_eq!(rx.recv().await.unwrap().cursor, "t2");

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.cursor() != "t2" {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        handle.await.unwrap();
        assert_eq!(store.cursor_history(), vec!["t2".to_string()]);
    }
}
