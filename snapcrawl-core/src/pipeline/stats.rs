//! Aggregate run counters.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::FailureClass;

const REASON_COUNT: usize = 11;

/// Why a candidate was dropped. Each reason belongs to exactly one
/// [`FailureClass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DiscardReason {
    InvalidUrl,
    CircuitOpen,
    /// The domain used up its `max_requests_per_site` budget.
    SiteBudget,
    FetchTransient,
    FetchPermanent,
    Quality,
    LowScore,
    ExactDuplicate,
    NearDuplicate,
    AlreadyStored,
    /// The item task panicked.
    Internal,
}

impl DiscardReason {
    pub const ALL: [DiscardReason; REASON_COUNT] = [
        Self::InvalidUrl,
        Self::CircuitOpen,
        Self::SiteBudget,
        Self::FetchTransient,
        Self::FetchPermanent,
        Self::Quality,
        Self::LowScore,
        Self::ExactDuplicate,
        Self::NearDuplicate,
        Self::AlreadyStored,
        Self::Internal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid_url",
            Self::CircuitOpen => "circuit_open",
            Self::SiteBudget => "site_budget",
            Self::FetchTransient => "fetch_transient",
            Self::FetchPermanent => "fetch_permanent",
            Self::Quality => "quality",
            Self::LowScore => "low_score",
            Self::ExactDuplicate => "exact_duplicate",
            Self::NearDuplicate => "near_duplicate",
            Self::AlreadyStored => "already_stored",
            Self::Internal => "internal",
        }
    }

    pub fn class(self) -> FailureClass {
        match self {
            Self::CircuitOpen | Self::FetchTransient => FailureClass::Transient,
            Self::InvalidUrl | Self::SiteBudget | Self::FetchPermanent | Self::Internal => {
                FailureClass::Permanent
            }
            Self::Quality | Self::LowScore => FailureClass::QualityRejection,
            Self::ExactDuplicate | Self::NearDuplicate | Self::AlreadyStored => {
                FailureClass::DuplicateRejection
            }
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free counters shared by every in-flight item.
#[derive(Debug, Default)]
pub struct PipelineStats {
    stored_before: AtomicU64,
    attempted: AtomicU64,
    network_attempts: AtomicU64,
    fetched: AtomicU64,
    saved: AtomicU64,
    cancelled: AtomicU64,
    discarded: [AtomicU64; REASON_COUNT],
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Images the sink already held when the run started.
    pub(crate) fn set_stored_before(&self, count: u64) {
        self.stored_before.store(count, Ordering::SeqCst);
    }

    pub(crate) fn record_attempted(&self) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_network_attempts(&self, attempts: u32) {
        self.network_attempts
            .fetch_add(u64::from(attempts), Ordering::Relaxed);
    }

    pub(crate) fn record_fetched(&self) {
        self.fetched.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the saved count including this one.
    pub(crate) fn record_saved(&self) -> u64 {
        self.saved.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discard(&self, reason: DiscardReason) {
        self.discarded[reason.slot()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn saved(&self) -> u64 {
        self.saved.load(Ordering::SeqCst)
    }

    /// Stored images counting those present before the run.
    pub fn total_stored(&self) -> u64 {
        self.stored_before.load(Ordering::SeqCst) + self.saved()
    }

    /// Book every attempted item without a verdict as cancelled.
    ///
    /// Only meaningful once no item task or save is running.
    pub(crate) fn settle_unaccounted(&self) -> u64 {
        let snap = self.snapshot();
        let accounted = snap.saved + snap.discarded_total() + snap.cancelled;
        let missing = snap.attempted.saturating_sub(accounted);
        if missing > 0 {
            self.cancelled.fetch_add(missing, Ordering::Relaxed);
        }
        missing
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let discarded = DiscardReason::ALL
            .iter()
            .filter_map(|&reason| {
                let count = self.discarded[reason.slot()].load(Ordering::Relaxed);
                (count > 0).then_some((reason, count))
            })
            .collect();
        StatsSnapshot {
            stored_before: self.stored_before.load(Ordering::SeqCst),
            attempted: self.attempted.load(Ordering::Relaxed),
            network_attempts: self.network_attempts.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
            saved: self.saved(),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            discarded,
        }
    }
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Images the sink held before the run.
    pub stored_before: u64,
    /// Candidates taken from the source.
    pub attempted: u64,
    /// HTTP requests actually sent, retries included.
    pub network_attempts: u64,
    pub fetched: u64,
    pub saved: u64,
    /// Items stopped by shutdown before reaching a verdict.
    pub cancelled: u64,
    pub discarded: BTreeMap<DiscardReason, u64>,
}

impl StatsSnapshot {
    pub fn total_stored(&self) -> u64 {
        self.stored_before + self.saved
    }

    /// Whether every attempted item ended saved, discarded or cancelled.
    pub fn is_balanced(&self) -> bool {
        self.attempted == self.saved + self.discarded_total() + self.cancelled
    }

    pub fn discarded_total(&self) -> u64 {
        self.discarded.values().sum()
    }

    pub fn discarded(&self, reason: DiscardReason) -> u64 {
        self.discarded.get(&reason).copied().unwrap_or(0)
    }

    /// Discards summed per failure class.
    pub fn by_class(&self) -> BTreeMap<&'static str, u64> {
        let mut out = BTreeMap::new();
        for (reason, count) in &self.discarded {
            let key = match reason.class() {
                FailureClass::Transient => "transient",
                FailureClass::Permanent => "permanent",
                FailureClass::QualityRejection => "quality",
                FailureClass::DuplicateRejection => "duplicate",
            };
            *out.entry(key).or_insert(0) += count;
        }
        out
    }

    /// `reason=count` pairs for log lines.
    pub fn discard_summary(&self) -> String {
        if self.discarded.is_empty() {
            return "none".to_string();
        }
        self.discarded
            .iter()
            .map(|(reason, count)| format!("{reason}={count}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}
