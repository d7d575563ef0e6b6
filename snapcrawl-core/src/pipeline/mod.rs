//! Pipeline orchestrator
//!
//! Pulls candidate URLs from a [`UrlSource`], keeps a bounded set of items in
//! flight, and walks each fetched image through preprocessing, optional
//! classification, the similarity index and persistence.
//!
//! # Stop conditions
//!
//! The run ends when the sink holds `target_saved_count` images (those stored
//! before the run included), when the source is exhausted and nothing is left
//! in flight, or when the external shutdown token fires. On stop, in-flight
//! items see a cancelled token and get `shutdown_grace_secs` to wind down
//! before they are aborted. Items not yet drawn from the source are never
//! attempted. Every attempted item ends saved, discarded or cancelled.
//!
//! # Serialization
//!
//! The duplicate check, the persist call and the index insert for one image
//! run as a unit under the index mutex. That critical section runs in its own
//! task, so aborting an item never interrupts a half-finished save. The run
//! takes the mutex once more before returning, which waits out any such save
//! and picks up its error.

pub mod stats;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, enabled, error, info, instrument, warn, Level};

use crate::classify::{Classifier, HeuristicClassifier};
use crate::clock::{Clock, SystemClock};
use crate::config::{CrawlConfig, DedupConfig};
use crate::error::{CrawlError, Result};
use crate::fetch::{FetchOutcome, FetchWorker, RetryPolicy, Transport};
use crate::hash::{PerceptualHash, PerceptualHasher, HASH_BITS};
use crate::index::SimilarityIndex;
use crate::preprocess::{DecodedImage, ImagePreprocessor, Preprocessor};
use crate::source::UrlSource;
use crate::store::{PersistenceSink, SaveOutcome, SaveRequest};
use crate::throttle::{domain_of, DomainThrottle};

pub use stats::{DiscardReason, PipelineStats, StatsSnapshot};

/// Radii above this make the BK-tree prune little.
const WIDE_RADIUS: u32 = HASH_BITS / 4;

/// Why [`Pipeline::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TargetReached,
    SourceExhausted,
    Shutdown,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TargetReached => "target_reached",
            Self::SourceExhausted => "source_exhausted",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub stop_reason: StopReason,
    pub stats: StatsSnapshot,
    pub elapsed: Duration,
    /// Domains whose breaker was not closed at the end of the run.
    pub open_domains: Vec<String>,
    /// Hashes in the similarity index at the end of the run.
    pub indexed: usize,
}

/// Assembles a [`Pipeline`] from a config and its collaborators.
pub struct PipelineBuilder {
    config: CrawlConfig,
    transport: Option<Arc<dyn Transport>>,
    preprocessor: Option<Arc<dyn Preprocessor>>,
    classifier: Option<Arc<dyn Classifier>>,
    sink: Option<Arc<dyn PersistenceSink>>,
    index: SimilarityIndex,
    clock: Option<Arc<dyn Clock>>,
    shutdown: Option<CancellationToken>,
}

impl PipelineBuilder {
    pub fn new(config: CrawlConfig) -> Self {
        Self {
            config,
            transport: None,
            preprocessor: None,
            classifier: None,
            sink: None,
            index: SimilarityIndex::new(),
            clock: None,
            shutdown: None,
        }
    }

    /// Fetch transport; defaults to [`HttpTransport`](crate::fetch::HttpTransport).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Defaults to [`ImagePreprocessor`] built from the `image` config.
    pub fn preprocessor(mut self, preprocessor: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    /// Used only when `classifier.enable` is set; defaults to [`HeuristicClassifier`].
    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Required.
    pub fn sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Seed the similarity index, typically from persisted hashes.
    pub fn index(mut self, index: SimilarityIndex) -> Self {
        self.index = index;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// External shutdown signal. The run stops when it is cancelled.
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        let config = self.config;

        let sink = self
            .sink
            .ok_or_else(|| CrawlError::Config("a persistence sink is required".into()))?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(&config)?,
        };
        let preprocessor = self.preprocessor.unwrap_or_else(|| {
            Arc::new(ImagePreprocessor::new(&config.image)) as Arc<dyn Preprocessor>
        });
        let classifier = config.classifier.enable.then(|| {
            self.classifier
                .unwrap_or_else(|| Arc::new(HeuristicClassifier) as Arc<dyn Classifier>)
        });
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);

        let throttle = Arc::new(DomainThrottle::with_clock(
            &config.download,
            &config.breaker,
            clock,
        ));
        let worker = FetchWorker::new(
            transport,
            Arc::clone(&throttle),
            RetryPolicy::from_config(&config.download),
        );

        Ok(Pipeline {
            shared: Arc::new(Shared {
                worker,
                preprocessor,
                classifier,
                classifier_threshold: config.classifier.threshold,
                dedup: config.deduplication.clone(),
                target: config.project.target_saved_count,
                sink,
                index: Arc::new(Mutex::new(self.index)),
                save_error: parking_lot::Mutex::new(None),
                stats: PipelineStats::new(),
                hasher: PerceptualHasher,
            }),
            throttle,
            shutdown: self.shutdown.unwrap_or_default(),
            capacity: config.download.pending_capacity().max(1),
            stats_interval: config.pipeline.stats_interval(),
            grace: config.pipeline.shutdown_grace(),
        })
    }
}

#[cfg(feature = "network")]
fn default_transport(config: &CrawlConfig) -> Result<Arc<dyn Transport>> {
    Ok(Arc::new(crate::fetch::HttpTransport::new(&config.download)?))
}

#[cfg(not(feature = "network"))]
fn default_transport(_config: &CrawlConfig) -> Result<Arc<dyn Transport>> {
    Err(CrawlError::Config(
        "no transport configured and the network feature is disabled".into(),
    ))
}

/// One crawl run.
pub struct Pipeline {
    shared: Arc<Shared>,
    throttle: Arc<DomainThrottle>,
    shutdown: CancellationToken,
    capacity: usize,
    stats_interval: Duration,
    grace: Duration,
}

impl Pipeline {
    pub fn builder(config: CrawlConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Drive `source` until a stop condition holds.
    ///
    /// Per-item failures are counted and never end the run. A persistence
    /// error does: it is returned once in-flight items have wound down.
    #[instrument(skip_all, name = "pipeline")]
    pub async fn run(self, mut source: UrlSource) -> Result<RunSummary> {
        let started = Instant::now();
        let cancel = self.shutdown.child_token();
        let shared = &self.shared;

        let stored_before = shared.sink.stored_count().await?;
        shared.stats.set_stored_before(stored_before);
        if shared.target_reached() {
            info!(
                stored = stored_before,
                target_saved = shared.target,
                "Target already met by stored images"
            );
            cancel.cancel();
        }

        if shared.dedup.enable && shared.dedup.hamming_threshold > WIDE_RADIUS {
            warn!(
                hamming_threshold = shared.dedup.hamming_threshold,
                "Wide near-duplicate radius, index lookups will approach a full scan"
            );
        }
        info!(
            target_saved = shared.target,
            stored_before,
            max_pending = self.capacity,
            indexed = shared.index.lock().await.len(),
            "Pipeline started"
        );

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        let mut exhausted = false;
        let mut fatal: Option<CrawlError> = None;
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.stats_interval,
            self.stats_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let can_pull = !exhausted && !cancel.is_cancelled() && tasks.len() < self.capacity;
            if tasks.is_empty() && !can_pull {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = tasks.join_next() => {
                    if let Err(e) = self.settle(joined) {
                        error!(error = %e, "Fatal item error, stopping");
                        fatal.get_or_insert(e);
                        cancel.cancel();
                    }
                }
                next = source.next(), if can_pull => match next {
                    Some(url) => {
                        let shared = Arc::clone(shared);
                        let cancel = cancel.clone();
                        tasks.spawn(async move { shared.process(url, cancel).await });
                    }
                    None => {
                        debug!("Source exhausted");
                        exhausted = true;
                    }
                },
                _ = heartbeat.tick() => self.log_progress(tasks.len()),
            }
        }

        if !tasks.is_empty() {
            debug!(in_flight = tasks.len(), "Waiting for in-flight items");
            let drain = async {
                while let Some(joined) = tasks.join_next().await {
                    if let Err(e) = self.settle(joined) {
                        fatal.get_or_insert(e);
                    }
                }
            };
            if tokio::time::timeout(self.grace, drain).await.is_err() {
                warn!(
                    remaining = tasks.len(),
                    "Grace period elapsed, aborting in-flight items"
                );
                tasks.abort_all();
                while let Some(joined) = tasks.join_next().await {
                    if let Err(e) = self.settle(joined) {
                        fatal.get_or_insert(e);
                    }
                }
            }
        }

        // A detached save may still hold the index.
        let indexed = shared.index.lock().await.len();
        if let Some(e) = shared.save_error.lock().take() {
            fatal.get_or_insert(e);
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        let unaccounted = shared.stats.settle_unaccounted();
        if unaccounted > 0 {
            debug!(unaccounted, "Aborted items counted as cancelled");
        }
        let stats = shared.stats.snapshot();
        let stop_reason = if shared.target_reached() {
            StopReason::TargetReached
        } else if self.shutdown.is_cancelled() {
            StopReason::Shutdown
        } else {
            StopReason::SourceExhausted
        };
        let summary = RunSummary {
            stop_reason,
            elapsed: started.elapsed(),
            open_domains: self.throttle.open_domains(),
            indexed,
            stats,
        };
        info!(
            stop_reason = stop_reason.as_str(),
            attempted = summary.stats.attempted,
            saved = summary.stats.saved,
            total_stored = summary.stats.total_stored(),
            discarded = summary.stats.discarded_total(),
            cancelled = summary.stats.cancelled,
            by_reason = %summary.stats.discard_summary(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Pipeline finished"
        );
        Ok(summary)
    }

    fn settle(&self, joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
        match joined {
            Ok(result) => result,
            // Booked by `settle_unaccounted` once saves have finished.
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => {
                warn!(error = %e, "Item task panicked");
                self.shared.stats.record_discard(DiscardReason::Internal);
                Ok(())
            }
        }
    }

    fn log_progress(&self, in_flight: usize) {
        let snap = self.shared.stats.snapshot();
        info!(
            attempted = snap.attempted,
            fetched = snap.fetched,
            saved = snap.saved,
            discarded = snap.discarded_total(),
            by_reason = %snap.discard_summary(),
            open_domains = self.throttle.open_domains().len(),
            in_flight,
            "Progress"
        );
    }
}

/// State shared by every item task.
struct Shared {
    worker: FetchWorker,
    preprocessor: Arc<dyn Preprocessor>,
    classifier: Option<Arc<dyn Classifier>>,
    classifier_threshold: f32,
    dedup: DedupConfig,
    target: u64,
    sink: Arc<dyn PersistenceSink>,
    index: Arc<Mutex<SimilarityIndex>>,
    /// First persistence failure from a save task, set while holding the index.
    save_error: parking_lot::Mutex<Option<CrawlError>>,
    stats: PipelineStats,
    hasher: PerceptualHasher,
}

/// A fetched image that passed every quality gate.
struct Candidate {
    url: String,
    domain: String,
    bytes: Vec<u8>,
    decoded: DecodedImage,
    score: Option<f32>,
    hash: PerceptualHash,
}

impl Shared {
    fn discard(&self, reason: DiscardReason) -> Result<()> {
        self.stats.record_discard(reason);
        Ok(())
    }

    fn target_reached(&self) -> bool {
        self.target > 0 && self.stats.total_stored() >= self.target
    }

    #[instrument(skip_all, fields(url = %url))]
    async fn process(self: Arc<Self>, url: String, cancel: CancellationToken) -> Result<()> {
        self.stats.record_attempted();
        let Some(domain) = domain_of(&url) else {
            debug!("Unparseable candidate URL");
            return self.discard(DiscardReason::InvalidUrl);
        };

        let report = match self.worker.fetch(&url, &domain, &cancel).await {
            Ok(report) => report,
            Err(CrawlError::Shutdown(_)) => {
                self.stats.record_cancelled();
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.stats.record_network_attempts(report.attempts);

        let bytes = match report.outcome {
            FetchOutcome::Success { bytes, .. } => bytes,
            FetchOutcome::CircuitOpen => return self.discard(DiscardReason::CircuitOpen),
            FetchOutcome::BudgetExhausted => return self.discard(DiscardReason::SiteBudget),
            FetchOutcome::SoftFail { .. } | FetchOutcome::RateLimited { .. } => {
                return self.discard(DiscardReason::FetchTransient);
            }
            FetchOutcome::HardFail { .. } => return self.discard(DiscardReason::FetchPermanent),
        };
        self.stats.record_fetched();

        let analysis = {
            let shared = Arc::clone(&self);
            tokio::task::spawn_blocking(move || shared.analyse(bytes)).await
        };
        let (bytes, decoded, score, hash) = match analysis {
            Ok(Ok(parts)) => parts,
            Ok(Err(reason)) => return self.discard(reason),
            Err(e) => {
                warn!(error = %e, "Image analysis task panicked");
                return self.discard(DiscardReason::Internal);
            }
        };

        if cancel.is_cancelled() {
            self.stats.record_cancelled();
            return Ok(());
        }

        let candidate = Candidate {
            url,
            domain,
            bytes,
            decoded,
            score,
            hash,
        };
        let mut guard = Arc::clone(&self.index).lock_owned().await;
        let shared = Arc::clone(&self);
        let save = tokio::spawn(async move {
            if let Err(e) = shared.admit(&mut guard, candidate, &cancel).await {
                error!(error = %e, "Persistence failed, stopping");
                shared.save_error.lock().get_or_insert(e);
                cancel.cancel();
            }
            drop(guard);
        });
        save.await.map_err(|e| CrawlError::Persistence(format!("Save task failed: {e}")))
    }

    /// CPU-bound stages: decode and gate, score, hash.
    fn analyse(
        &self,
        bytes: Vec<u8>,
    ) -> std::result::Result<(Vec<u8>, DecodedImage, Option<f32>, PerceptualHash), DiscardReason>
    {
        let decoded = self.preprocessor.preprocess(&bytes).map_err(|rejection| {
            debug!(%rejection, "Rejected by preprocessing");
            DiscardReason::Quality
        })?;

        let score = match &self.classifier {
            Some(classifier) => match classifier.score(&decoded) {
                Some(score) if score < self.classifier_threshold => {
                    debug!(score, threshold = self.classifier_threshold, "Rejected by classifier");
                    return Err(DiscardReason::LowScore);
                }
                score => score,
            },
            None => None,
        };

        let hash = self.hasher.hash_image(&decoded.image);
        Ok((bytes, decoded, score, hash))
    }

    /// Dedup check, persist and index insert, holding the index lock throughout.
    async fn admit(
        &self,
        index: &mut SimilarityIndex,
        candidate: Candidate,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.target_reached() {
            self.stats.record_cancelled();
            return Ok(());
        }

        let hash = candidate.hash;
        if self.dedup.enable {
            if index.has_exact_match(hash) {
                debug!(phash = %hash, "Exact duplicate");
                return self.discard(DiscardReason::ExactDuplicate);
            }
            let radius = self.dedup.hamming_threshold;
            if index.find_within_radius(hash, radius).next().is_some() {
                if enabled!(Level::DEBUG) {
                    if let Some(near) = index.nearest_within(hash, radius) {
                        debug!(
                            phash = %hash,
                            matched = %near.hash,
                            distance = near.distance,
                            "Near duplicate"
                        );
                    }
                }
                return self.discard(DiscardReason::NearDuplicate);
            }
        }

        let request = SaveRequest {
            url: candidate.url,
            domain: candidate.domain,
            hash,
            image: candidate.decoded.image,
            original: candidate.bytes,
            format: candidate.decoded.format,
            score: candidate.score,
        };
        match self.sink.persist(request).await? {
            SaveOutcome::Stored(record) => {
                index.insert(hash);
                let saved = self.stats.record_saved();
                debug!(path = %record.path.display(), saved, "Image saved");
                if self.target_reached() {
                    info!(saved, total = self.stats.total_stored(), "Target reached, stopping");
                    cancel.cancel();
                }
                Ok(())
            }
            SaveOutcome::AlreadyStored => {
                index.insert(hash);
                self.discard(DiscardReason::AlreadyStored)
            }
        }
    }
}
