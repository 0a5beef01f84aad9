use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::embedder::EmbeddingCodec;
use crate::offer::{EmbeddingEntry, Offer};
use crate::refresh::RefreshTracker;
use crate::source::{OfferSource, SourceError};
use crate::store::{EmbeddingStore, StoreError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("offer source failed: {0}")]
    Source(#[from] SourceError),
    #[error("embedding store failed: {0}")]
    Store(#[from] StoreError),
    #[error("refresh marker write failed: {0}")]
    Tracker(std::io::Error),
}

/// Outcome of one ingestion cycle.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Offers yielded by the source for this cycle.
    pub fetched: usize,
    /// Offers embedded and written to the store.
    pub embedded: usize,
    /// Offers skipped because the stored entry is already current.
    pub skipped: usize,
    /// Offers dropped on transient failures, retried next cycle.
    pub failed: usize,
    /// True when the cycle stopped at a batch boundary on cancellation.
    pub interrupted: bool,
    /// True when the refresh marker advanced.
    pub committed: bool,
}

/// Runs one incremental ingestion cycle.
///
/// Offers newer than the tracker marker are embedded and written to the
/// store in batches; the store is saved after every batch. On success the
/// marker advances to the cycle *start* time, so offers updated mid-cycle
/// are picked up next run. When individual offers fail to embed, the marker
/// instead stops just short of the earliest failed offer's `updated_at`,
/// which makes the next cycle refetch it (already-written entries skip
/// idempotently). A cycle that loses the source mid-drain, or is cancelled
/// at a batch boundary, keeps its durable writes but leaves the marker
/// untouched.
pub fn run_cycle<S, C>(
    source: &S,
    codec: &C,
    store: &mut EmbeddingStore,
    tracker: &RefreshTracker,
    store_path: &Path,
    batch_size: usize,
    cancel: &AtomicBool,
) -> Result<IngestStats, IngestError>
where
    S: OfferSource + ?Sized,
    C: EmbeddingCodec + ?Sized,
{
    if let Some(expected) = store.dimension() {
        let actual = codec.dimension();
        if actual != expected {
            return Err(IngestError::Store(StoreError::DimensionMismatch {
                expected,
                actual,
            }));
        }
    }

    let cycle_start = Utc::now();
    let since = tracker.last_refresh();
    info!(?since, "starting ingestion cycle");

    let batch_size = batch_size.max(1);
    let mut stats = IngestStats::default();
    let mut batch: Vec<Offer> = Vec::with_capacity(batch_size);
    let mut earliest_failure: Option<DateTime<Utc>> = None;
    let mut source_lost = false;

    for item in source.fetch_since(since) {
        let offer = match item {
            Ok(offer) => offer,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "transient source failure, drain stopped, retrying next cycle");
                stats.failed += 1;
                source_lost = true;
                break;
            }
            Err(e) => return Err(e.into()),
        };
        stats.fetched += 1;
        batch.push(offer);

        if batch.len() == batch_size {
            process_batch(
                codec,
                store,
                store_path,
                &mut batch,
                &mut stats,
                &mut earliest_failure,
            )?;
            if cancel.load(Ordering::Relaxed) {
                stats.interrupted = true;
                info!(?stats, "ingestion cycle interrupted, marker not advanced");
                return Ok(stats);
            }
        }
    }

    if !batch.is_empty() {
        process_batch(
            codec,
            store,
            store_path,
            &mut batch,
            &mut stats,
            &mut earliest_failure,
        )?;
    }

    if source_lost {
        // Unknown offers remain upstream; the old marker re-covers them.
        return Ok(stats);
    }

    let mut marker = cycle_start;
    if let Some(failed_at) = earliest_failure {
        marker = marker.min(failed_at - Duration::milliseconds(1));
        if let Some(previous) = since {
            marker = marker.max(previous);
        }
    }
    tracker
        .mark_refreshed(marker)
        .map_err(IngestError::Tracker)?;
    stats.committed = true;
    info!(
        fetched = stats.fetched,
        embedded = stats.embedded,
        skipped = stats.skipped,
        failed = stats.failed,
        %marker,
        "ingestion cycle committed"
    );
    Ok(stats)
}

fn process_batch<C>(
    codec: &C,
    store: &mut EmbeddingStore,
    store_path: &Path,
    batch: &mut Vec<Offer>,
    stats: &mut IngestStats,
    earliest_failure: &mut Option<DateTime<Utc>>,
) -> Result<(), IngestError>
where
    C: EmbeddingCodec + ?Sized,
{
    let mut wrote = false;
    for offer in batch.drain(..) {
        // An entry written from an equally-fresh offer is already current.
        if let Ok(existing) = store.get(&offer.id) {
            if existing.source_updated_at >= offer.updated_at {
                stats.skipped += 1;
                continue;
            }
        }

        let vector = match codec.embed(&offer.text) {
            Ok(vector) => vector,
            Err(e) => {
                warn!(offer_id = %offer.id, error = %e, "embedding failed, offer retried next cycle");
                stats.failed += 1;
                *earliest_failure = Some(match *earliest_failure {
                    Some(current) => current.min(offer.updated_at),
                    None => offer.updated_at,
                });
                continue;
            }
        };

        store.put(EmbeddingEntry::from_offer(&offer, vector, Utc::now()))?;
        stats.embedded += 1;
        wrote = true;
    }

    if wrote {
        store.save(store_path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::{EmbedError, HashingEmbedder};
    use chrono::TimeZone;
    use ndarray::Array1;
    use std::collections::HashMap;

    struct VecSource {
        offers: Vec<Offer>,
        /// When set, the drain yields this transient error after the offers.
        fail_after: bool,
    }

    impl VecSource {
        fn of(offers: Vec<Offer>) -> Self {
            VecSource {
                offers,
                fail_after: false,
            }
        }
    }

    impl OfferSource for VecSource {
        fn fetch_since(
            &self,
            since: Option<DateTime<Utc>>,
        ) -> Box<dyn Iterator<Item = Result<Offer, SourceError>> + '_> {
            let items = self
                .offers
                .iter()
                .filter(move |o| since.map_or(true, |s| o.updated_at > s))
                .cloned()
                .map(Ok);
            if self.fail_after {
                Box::new(items.chain(std::iter::once(Err(SourceError::Status {
                    status: reqwest::StatusCode::TOO_MANY_REQUESTS,
                    body: "slow down".to_string(),
                }))))
            } else {
                Box::new(items)
            }
        }
    }

    /// Fails embedding for the listed offer texts, succeeds otherwise.
    struct FlakyCodec {
        inner: HashingEmbedder,
        poisoned: Vec<String>,
    }

    impl EmbeddingCodec for FlakyCodec {
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn embed(&self, text: &str) -> Result<Array1<f32>, EmbedError> {
            if self.poisoned.iter().any(|p| p == text) {
                return Err(EmbedError::RateLimited("quota exhausted".to_string()));
            }
            self.inner.embed(text)
        }
    }

    fn offer(id: &str, updated_at: DateTime<Utc>) -> Offer {
        Offer {
            id: id.to_string(),
            text: format!("mission {id} in logistics"),
            metadata: HashMap::from([("title".to_string(), format!("Offer {id}"))]),
            updated_at,
        }
    }

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn first_cycle_ingests_everything_and_commits() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("embeddings.json");
        let tracker = RefreshTracker::new(dir.path().join("last_refresh"));
        let source = VecSource::of(vec![offer("a", ts(1)), offer("b", ts(2)), offer("c", ts(3))]);
        let codec = HashingEmbedder::new(32);
        let mut store = EmbeddingStore::new();
        let cancel = AtomicBool::new(false);

        let before = Utc::now();
        let stats = run_cycle(
            &source,
            &codec,
            &mut store,
            &tracker,
            &store_path,
            2,
            &cancel,
        )
        .unwrap();

        assert_eq!(stats.fetched, 3);
        assert_eq!(stats.embedded, 3);
        assert_eq!(stats.skipped, 0);
        assert!(stats.committed);
        assert!(!stats.interrupted);
        assert_eq!(store.len(), 3);
        assert!(tracker.last_refresh().unwrap() >= before);

        // The durable copy matches what the cycle wrote.
        assert_eq!(EmbeddingStore::load(&store_path).len(), 3);
    }

    #[test]
    fn second_cycle_with_no_changes_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("embeddings.json");
        let tracker = RefreshTracker::new(dir.path().join("last_refresh"));
        let source = VecSource::of(vec![offer("a", ts(1)), offer("b", ts(2))]);
        let codec = HashingEmbedder::new(32);
        let mut store = EmbeddingStore::new();
        let cancel = AtomicBool::new(false);

        run_cycle(&source, &codec, &mut store, &tracker, &store_path, 10, &cancel).unwrap();
        let marker = tracker.last_refresh().unwrap();

        let stats =
            run_cycle(&source, &codec, &mut store, &tracker, &store_path, 10, &cancel).unwrap();
        assert_eq!(stats.fetched, 0);
        assert_eq!(stats.embedded, 0);
        assert!(stats.committed);
        assert!(tracker.last_refresh().unwrap() >= marker);
    }

    #[test]
    fn reingesting_unchanged_offers_is_idempotent() {
        // Simulates the crash window: entries saved, marker never advanced.
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("embeddings.json");
        let tracker = RefreshTracker::new(dir.path().join("last_refresh"));
        let source = VecSource::of(vec![offer("a", ts(1)), offer("b", ts(2))]);
        let codec = HashingEmbedder::new(32);
        let cancel = AtomicBool::new(false);

        let mut store = EmbeddingStore::new();
        run_cycle(&source, &codec, &mut store, &tracker, &store_path, 10, &cancel).unwrap();
        let vectors: Vec<_> = store.iter().map(|e| e.vector.clone()).collect();
        let stored_at: Vec<_> = store.iter().map(|e| e.stored_at).collect();

        // Marker loss means the next cycle sees every offer again.
        std::fs::remove_file(dir.path().join("last_refresh")).unwrap();
        let mut store = EmbeddingStore::load(&store_path);
        let stats =
            run_cycle(&source, &codec, &mut store, &tracker, &store_path, 10, &cancel).unwrap();

        assert_eq!(stats.fetched, 2);
        assert_eq!(stats.embedded, 0);
        assert_eq!(stats.skipped, 2);
        assert_eq!(store.len(), 2);
        let vectors_after: Vec<_> = store.iter().map(|e| e.vector.clone()).collect();
        let stored_at_after: Vec<_> = store.iter().map(|e| e.stored_at).collect();
        assert_eq!(vectors, vectors_after);
        assert_eq!(stored_at, stored_at_after);
    }

    #[test]
    fn updated_offer_is_reembedded() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("embeddings.json");
        let tracker = RefreshTracker::new(dir.path().join("last_refresh"));
        let codec = HashingEmbedder::new(32);
        let cancel = AtomicBool::new(false);
        let mut store = EmbeddingStore::new();

        let source = VecSource::of(vec![offer("a", ts(1))]);
        run_cycle(&source, &codec, &mut store, &tracker, &store_path, 10, &cancel).unwrap();

        // Same offer, newer source timestamp: one replacement, no duplicate.
        std::fs::remove_file(dir.path().join("last_refresh")).unwrap();
        let mut updated = offer("a", ts(5));
        updated.text = "mission a in finance".to_string();
        let source = VecSource::of(vec![updated]);
        let stats =
            run_cycle(&source, &codec, &mut store, &tracker, &store_path, 10, &cancel).unwrap();

        assert_eq!(stats.embedded, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap().source_updated_at, ts(5));
    }

    #[test]
    fn transient_embed_failure_skips_offer_and_marker_recovers_it() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("embeddings.json");
        let tracker = RefreshTracker::new(dir.path().join("last_refresh"));
        let cancel = AtomicBool::new(false);
        let mut store = EmbeddingStore::new();

        let offers = vec![offer("a", ts(1)), offer("b", ts(2)), offer("c", ts(3))];
        let poisoned = vec![offers[1].text.clone()];
        let source = VecSource::of(offers.clone());
        let codec = FlakyCodec {
            inner: HashingEmbedder::new(32),
            poisoned,
        };

        let stats =
            run_cycle(&source, &codec, &mut store, &tracker, &store_path, 10, &cancel).unwrap();

        assert_eq!(stats.embedded, 2);
        assert_eq!(stats.failed, 1);
        assert!(stats.committed);
        assert_eq!(store.len(), 2);
        assert!(store.get("b").is_err());

        // The marker stopped short of the failed offer, so a healthy cycle
        // picks it (and only it) back up.
        let marker = tracker.last_refresh().unwrap();
        assert!(marker < ts(2));

        let source = VecSource::of(offers);
        let codec = HashingEmbedder::new(32);
        let stats =
            run_cycle(&source, &codec, &mut store, &tracker, &store_path, 10, &cancel).unwrap();
        assert_eq!(stats.embedded, 1);
        assert_eq!(stats.skipped, 1); // "c" refetched, already current
        assert_eq!(store.len(), 3);
        assert!(store.get("b").is_ok());
    }

    #[test]
    fn codec_with_wrong_dimension_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("embeddings.json");
        let tracker = RefreshTracker::new(dir.path().join("last_refresh"));
        let cancel = AtomicBool::new(false);

        let mut store = EmbeddingStore::with_dimension(64);
        let codec = HashingEmbedder::new(32);
        let source = VecSource::of(vec![offer("a", ts(1))]);

        let err = run_cycle(&source, &codec, &mut store, &tracker, &store_path, 10, &cancel)
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::Store(StoreError::DimensionMismatch {
                expected: 64,
                actual: 32
            })
        ));
        assert!(store.is_empty());
        assert_eq!(tracker.last_refresh(), None);
    }

    #[test]
    fn losing_the_source_keeps_writes_but_not_the_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("embeddings.json");
        let tracker = RefreshTracker::new(dir.path().join("last_refresh"));
        let codec = HashingEmbedder::new(32);
        let cancel = AtomicBool::new(false);
        let mut store = EmbeddingStore::new();

        let source = VecSource {
            offers: vec![offer("a", ts(1)), offer("b", ts(2))],
            fail_after: true,
        };
        let stats =
            run_cycle(&source, &codec, &mut store, &tracker, &store_path, 10, &cancel).unwrap();

        assert_eq!(stats.embedded, 2);
        assert_eq!(stats.failed, 1);
        assert!(!stats.committed);
        assert_eq!(EmbeddingStore::load(&store_path).len(), 2);
        assert_eq!(tracker.last_refresh(), None);
    }

    #[test]
    fn cancelled_cycle_stops_at_batch_boundary_without_committing() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("embeddings.json");
        let tracker = RefreshTracker::new(dir.path().join("last_refresh"));
        let codec = HashingEmbedder::new(32);
        let cancel = AtomicBool::new(true);
        let mut store = EmbeddingStore::new();

        let source = VecSource::of(vec![offer("a", ts(1)), offer("b", ts(2)), offer("c", ts(3))]);
        let stats = run_cycle(
            &source,
            &codec,
            &mut store,
            &tracker,
            &store_path,
            2,
            &cancel,
        )
        .unwrap();

        assert!(stats.interrupted);
        assert!(!stats.committed);
        assert_eq!(stats.embedded, 2);
        // Entries from the completed batch are durable, the marker is not.
        assert_eq!(EmbeddingStore::load(&store_path).len(), 2);
        assert_eq!(tracker.last_refresh(), None);
    }
}
