//! Shared fixtures for the integration tests: synthetic images with known
//! perceptual-hash relationships, a scripted transport and an in-memory sink.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use parking_lot::Mutex;
use snapcrawl_core::{
    domain_of, CrawlConfig, CrawlError, PerceptualHash, PerceptualHasher, PersistenceSink,
    SaveOutcome, SaveRequest, SavedRecord, Transport, TransportError, TransportResponse,
};

pub const SIDE: u32 = 64;

/// Eight rows of eight cells; a set bit is a white cell.
pub type Pattern = [u8; 8];

/// Route pipeline logs to the test harness; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("snapcrawl_core=debug")
        .with_test_writer()
        .try_init();
}

/// Config tuned for the 64px fixtures.
pub fn test_config() -> CrawlConfig {
    let mut config = CrawlConfig::default();
    config.image.min_side = SIDE;
    config.download.fetch_timeout_secs = 5;
    config.download.retry_initial_interval_ms = 1;
    config.download.retry_max_interval_ms = 2;
    config.download.request_delay_ms = 0;
    config
}

/// Bytes with exactly four bits set, so every row pair is balanced.
fn balanced_rows() -> Vec<u8> {
    (0u16..256)
        .map(|b| b as u8)
        .filter(|b| b.count_ones() == 4)
        .collect()
}

pub fn render(pattern: &Pattern) -> DynamicImage {
    DynamicImage::ImageRgb8(ImageBuffer::from_fn(SIDE, SIDE, |x, y| {
        let cell = SIDE / 8;
        let bit = (pattern[(y / cell) as usize] >> (x / cell)) & 1;
        if bit == 1 {
            Rgb([255, 255, 255])
        } else {
            Rgb([0, 0, 0])
        }
    }))
}

pub fn png(image: &DynamicImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn hash_of(pattern: &Pattern) -> PerceptualHash {
    PerceptualHasher.hash_image(&render(pattern))
}

/// `count` patterns whose hashes are pairwise more than `min_distance` apart.
pub fn distinct_patterns(count: usize, min_distance: u32) -> Vec<Pattern> {
    let rows = balanced_rows();
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };

    let mut kept: Vec<(Pattern, PerceptualHash)> = Vec::new();
    for _ in 0..10_000 {
        if kept.len() == count {
            break;
        }
        let mut pattern = [0u8; 8];
        for row in pattern.iter_mut() {
            *row = rows[(next() % rows.len() as u64) as usize];
        }
        let hash = hash_of(&pattern);
        if kept
            .iter()
            .all(|(_, other)| other.hamming_distance(hash) > min_distance)
        {
            kept.push((pattern, hash));
        }
    }
    assert_eq!(kept.len(), count, "could not generate enough distinct patterns");
    kept.into_iter().map(|(pattern, _)| pattern).collect()
}

/// Swap one white and one black cell in the first row.
pub fn near_variant(pattern: &Pattern) -> Pattern {
    let row = pattern[0];
    let white = (0..8).find(|c| (row >> c) & 1 == 1).unwrap();
    let black = (0..8).find(|c| (row >> c) & 1 == 0).unwrap();
    let mut out = *pattern;
    out[0] = row ^ (1 << white) ^ (1 << black);
    out
}

pub fn image_response(body: Vec<u8>) -> TransportResponse {
    TransportResponse {
        status: 200,
        content_type: Some("image/png".into()),
        retry_after: None,
        body,
    }
}

pub fn status_response(status: u16) -> TransportResponse {
    TransportResponse {
        status,
        ..Default::default()
    }
}

type Reply = Result<TransportResponse, TransportError>;

struct Route {
    reply: Reply,
    delay: Option<Duration>,
}

/// Serves canned responses by URL (404 otherwise) and records concurrency.
#[derive(Default)]
pub struct MapTransport {
    routes: HashMap<String, Route>,
    delay: Duration,
    calls: Mutex<HashMap<String, usize>>,
    counters: Arc<InFlightCounters>,
}

#[derive(Default)]
struct InFlightCounters {
    per_domain: Mutex<HashMap<String, usize>>,
    max_per_domain: Mutex<HashMap<String, usize>>,
    global: AtomicUsize,
    max_global: AtomicUsize,
}

/// Holds one request's share of the in-flight counts; released on drop, so
/// timed-out and cancelled requests are counted out too.
struct InFlight {
    counters: Arc<InFlightCounters>,
    domain: String,
}

impl InFlight {
    fn enter(counters: &Arc<InFlightCounters>, domain: String) -> Self {
        let now_global = counters.global.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_global.fetch_max(now_global, Ordering::SeqCst);
        {
            let mut per_domain = counters.per_domain.lock();
            let current = per_domain.entry(domain.clone()).or_insert(0);
            *current += 1;
            let mut max = counters.max_per_domain.lock();
            let peak = max.entry(domain.clone()).or_insert(0);
            *peak = (*peak).max(*current);
        }
        Self {
            counters: Arc::clone(counters),
            domain,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(current) = self.counters.per_domain.lock().get_mut(&self.domain) {
            *current -= 1;
        }
        self.counters.global.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MapTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, url: impl Into<String>, response: TransportResponse) -> Self {
        self.route_reply(url, Ok(response), None)
    }

    /// Serve `reply` for `url` after `delay`, or after the default delay when `None`.
    pub fn route_reply(
        mut self,
        url: impl Into<String>,
        reply: Reply,
        delay: Option<Duration>,
    ) -> Self {
        self.routes.insert(url.into(), Route { reply, delay });
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn calls_for_domain(&self, domain: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(url, _)| domain_of(url).as_deref() == Some(domain))
            .map(|(_, n)| n)
            .sum()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn max_global(&self) -> usize {
        self.counters.max_global.load(Ordering::SeqCst)
    }

    pub fn max_for_domain(&self, domain: &str) -> usize {
        self.counters
            .max_per_domain
            .lock()
            .get(domain)
            .copied()
            .unwrap_or(0)
    }

    /// Requests currently inside `get`.
    pub fn in_flight(&self) -> usize {
        self.counters.global.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MapTransport {
    async fn get(&self, url: &str, _timeout: Duration) -> Reply {
        let domain = domain_of(url).unwrap_or_default();
        *self.calls.lock().entry(url.to_string()).or_insert(0) += 1;
        let _in_flight = InFlight::enter(&self.counters, domain);

        let route = self.routes.get(url);
        let delay = route.and_then(|r| r.delay).unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match route {
            Some(route) => route.reply.clone(),
            None => Ok(status_response(404)),
        }
    }
}

/// Idempotent in-memory sink keyed by hash.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<HashMap<PerceptualHash, SavedRecord>>,
    persist_calls: AtomicUsize,
    fail: bool,
    delay: Duration,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every persist call returns an error.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Each persist call takes `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// A sink that already holds one record per hash.
    pub fn holding(hashes: impl IntoIterator<Item = PerceptualHash>) -> Self {
        let sink = Self::default();
        {
            let mut records = sink.records.lock();
            for hash in hashes {
                let id = records.len() as i64 + 1;
                records.insert(hash, record_for(id, hash, "https://earlier.test/x.png"));
            }
        }
        sink
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    pub fn hashes(&self) -> Vec<PerceptualHash> {
        self.records.lock().keys().copied().collect()
    }

    pub fn urls(&self) -> Vec<String> {
        self.records.lock().values().map(|r| r.url.clone()).collect()
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn persist(&self, request: SaveRequest) -> snapcrawl_core::Result<SaveOutcome> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(CrawlError::Persistence("disk full".into()));
        }

        let mut records = self.records.lock();
        if records.contains_key(&request.hash) {
            return Ok(SaveOutcome::AlreadyStored);
        }
        let record = SavedRecord {
            id: records.len() as i64 + 1,
            hash: request.hash,
            url: request.url,
            domain: request.domain,
            path: PathBuf::from(format!("{}.jpg", request.hash)),
            ext: "jpg".into(),
            width: request.image.width(),
            height: request.image.height(),
            bytes: request.original.len() as u64,
            score: request.score,
            content_sha3: String::new(),
        };
        records.insert(request.hash, record.clone());
        Ok(SaveOutcome::Stored(record))
    }

    async fn stored_count(&self) -> snapcrawl_core::Result<u64> {
        Ok(self.records.lock().len() as u64)
    }
}

fn record_for(id: i64, hash: PerceptualHash, url: &str) -> SavedRecord {
    SavedRecord {
        id,
        hash,
        url: url.to_string(),
        domain: domain_of(url).unwrap_or_default(),
        path: PathBuf::from(format!("{hash}.jpg")),
        ext: "jpg".into(),
        width: SIDE,
        height: SIDE,
        bytes: 0,
        score: None,
        content_sha3: String::new(),
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
