//! Sync entry points: one listing, or every iCal-backed listing through a
//! bounded worker pool.
//!
//! A single-listing sync either opens its own session or joins one opened by
//! a caller; only the opener completes the session. The all-listings sync
//! always owns its session and aggregates per-listing counters into it as
//! workers finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    NewSyncSession, SessionStatus, SyncCounters, SyncType, TriggeredBy,
};
use crate::repository::store::BookingStore;
use crate::services::ical::FeedFetcher;
use crate::services::notifier::Notifier;
use crate::services::session_log::SessionLogger;
use crate::services::sync::{ListingReconciler, ReconcileOutcome, SyncSettings};

const BUDGET_EXCEEDED: &str = "sync wall-clock budget exceeded";

#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn BookingStore>,
    fetcher: Arc<dyn FeedFetcher>,
    notifier: Arc<dyn Notifier>,
    settings: SyncSettings,
}

#[derive(Debug)]
pub struct ListingSyncReport {
    pub success: bool,
    pub session_id: Uuid,
    pub result: ReconcileOutcome,
}

#[derive(Debug)]
pub struct SyncAllReport {
    pub success: bool,
    pub session_id: Uuid,
    pub totals: SyncCounters,
    pub results: Vec<ReconcileOutcome>,
    pub error: Option<String>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn BookingStore>,
        fetcher: Arc<dyn FeedFetcher>,
        notifier: Arc<dyn Notifier>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            fetcher,
            notifier,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn BookingStore> {
        &self.store
    }

    /// Sync one listing. With `session_id` the run joins that session and
    /// leaves completing it to the opener; without, it opens and completes a
    /// `single` session of its own.
    pub async fn sync_listing(
        &self,
        listing_id: Uuid,
        session_id: Option<Uuid>,
        triggered_by: TriggeredBy,
    ) -> AppResult<ListingSyncReport> {
        let listing = self
            .store
            .get_listing(listing_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Listing {listing_id} not found.")))?;
        let feeds = self.store.list_feeds_for_listing(listing_id).await?;

        let logger = match session_id {
            Some(id) => SessionLogger::join(Arc::clone(&self.store), id),
            None => {
                SessionLogger::open(
                    Arc::clone(&self.store),
                    NewSyncSession {
                        sync_type: SyncType::Single,
                        target_listing_id: Some(listing.id),
                        target_listing_name: Some(listing.name.clone()),
                        triggered_by,
                        metadata: json!({}),
                    },
                )
                .await?
            }
        };

        let reconciler = ListingReconciler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.notifier),
            self.settings.clone(),
            logger.session_id(),
        );
        let mut result = reconciler.reconcile(&listing, &feeds).await;

        logger.flush_entries(result.take_entries()).await;
        if let Err(error) = logger.increment_totals(&result.counters).await {
            tracing::warn!(
                session_id = %logger.session_id(),
                error = %error.detail_message(),
                "Failed to increment session totals"
            );
        }

        let success = result.is_success();
        let status = if success {
            SessionStatus::Completed
        } else {
            SessionStatus::Error
        };
        logger
            .complete(status, Some(&result.counters), result.error.as_deref())
            .await?;

        Ok(ListingSyncReport {
            success,
            session_id: logger.session_id(),
            result,
        })
    }

    /// Sync every iCal-backed listing with bounded concurrency. Listings
    /// whose external id marks them as manual are not feed-backed and are
    /// skipped.
    pub async fn sync_all(&self, triggered_by: TriggeredBy) -> AppResult<SyncAllReport> {
        let logger = Arc::new(
            SessionLogger::open(
                Arc::clone(&self.store),
                NewSyncSession {
                    sync_type: SyncType::All,
                    target_listing_id: None,
                    target_listing_name: None,
                    triggered_by,
                    metadata: json!({}),
                },
            )
            .await?,
        );

        let listings = match self.store.list_listings().await {
            Ok(listings) => listings,
            Err(error) => {
                // Orchestrator failure before any listing ran.
                let message = error.detail_message();
                let _ = logger
                    .complete(SessionStatus::Error, None, Some(&message))
                    .await;
                return Err(error);
            }
        };
        let targets: Vec<_> = listings
            .into_iter()
            .filter(|listing| !listing.is_manual())
            .collect();
        tracing::info!(
            session_id = %logger.session_id(),
            listings = targets.len(),
            %triggered_by,
            "Starting all-listings sync"
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency));
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(targets.len());
        for listing in targets {
            let semaphore = Arc::clone(&semaphore);
            let cancelled = Arc::clone(&cancelled);
            let store = Arc::clone(&self.store);
            let fetcher = Arc::clone(&self.fetcher);
            let notifier = Arc::clone(&self.notifier);
            let settings = self.settings.clone();
            let session_id = logger.session_id();
            let listing_id = listing.id;
            let listing_name = listing.name.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("sync semaphore is never closed");
                if cancelled.load(Ordering::Relaxed) {
                    return ReconcileOutcome::failed(
                        listing.id,
                        listing.name.clone(),
                        BUDGET_EXCEEDED.to_string(),
                    );
                }
                let feeds = match store.list_feeds_for_listing(listing.id).await {
                    Ok(feeds) => feeds,
                    Err(error) => {
                        return ReconcileOutcome::failed(
                            listing.id,
                            listing.name.clone(),
                            error.detail_message(),
                        );
                    }
                };
                let reconciler =
                    ListingReconciler::new(store, fetcher, notifier, settings, session_id);
                reconciler.reconcile(&listing, &feeds).await
            });
            handles.push((handle, listing_id, listing_name));
        }

        let deadline = self
            .settings
            .wall_clock_budget
            .map(|budget| tokio::time::Instant::now() + budget);

        let mut totals = SyncCounters::default();
        let mut results = Vec::with_capacity(handles.len());
        let mut budget_hit = false;
        for (handle, listing_id, listing_name) in handles {
            let joined = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, handle).await {
                    Ok(joined) => Some(joined),
                    Err(_) => {
                        // Stop handing work to queued listings; in-flight
                        // tasks run to completion on their own.
                        cancelled.store(true, Ordering::Relaxed);
                        budget_hit = true;
                        None
                    }
                },
                None => Some(handle.await),
            };

            let mut outcome = match joined {
                Some(Ok(outcome)) => outcome,
                Some(Err(join_error)) => {
                    tracing::error!(
                        listing = %listing_name,
                        error = %join_error,
                        "Listing sync task failed"
                    );
                    ReconcileOutcome::failed(
                        listing_id,
                        listing_name,
                        format!("sync task failed: {join_error}"),
                    )
                }
                None => ReconcileOutcome::failed(
                    listing_id,
                    listing_name,
                    BUDGET_EXCEEDED.to_string(),
                ),
            };

            logger.flush_entries(outcome.take_entries()).await;
            if let Err(error) = logger.increment_totals(&outcome.counters).await {
                tracing::warn!(
                    session_id = %logger.session_id(),
                    error = %error.detail_message(),
                    "Failed to increment session totals"
                );
            }
            totals.merge(&outcome.counters);
            results.push(outcome);
        }

        let success = results.iter().all(ReconcileOutcome::is_success);
        let error = budget_hit.then(|| BUDGET_EXCEEDED.to_string());
        logger
            .complete(SessionStatus::Completed, Some(&totals), error.as_deref())
            .await?;
        tracing::info!(
            session_id = %logger.session_id(),
            completed = totals.completed_listings,
            errors = totals.errors,
            "All-listings sync finished"
        );

        Ok(SyncAllReport {
            success,
            session_id: logger.session_id(),
            totals,
            results,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CheckoutType, SyncType};
    use crate::services::ical::FeedFetcher;
    use crate::testutil::{day_from_today, raw_event, MemoryStore, RecordingNotifier, StubFetcher};
    use chrono::NaiveTime;

    struct Harness {
        store: Arc<MemoryStore>,
        fetcher: Arc<StubFetcher>,
        engine: SyncEngine,
    }

    fn harness() -> Harness {
        harness_with_budget(None)
    }

    fn harness_with_budget(budget: Option<std::time::Duration>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(StubFetcher::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let settings = SyncSettings {
            fetch_window_past_days: 90,
            fetch_window_future_days: 180,
            concurrency: 2,
            wall_clock_budget: budget,
            default_listing_hours: 2.0,
            default_checkout_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        };
        let engine = SyncEngine::new(
            Arc::clone(&store) as Arc<dyn BookingStore>,
            Arc::clone(&fetcher) as Arc<dyn FeedFetcher>,
            notifier,
            settings,
        );
        Harness {
            store,
            fetcher,
            engine,
        }
    }

    #[tokio::test]
    async fn single_sync_opens_and_completes_its_own_session() {
        let h = harness();
        let listing = h.store.add_listing("Loft 12", "airbnb-1", None);
        h.store.add_feed(&listing, "https://feed/one");
        h.fetcher.respond(
            "https://feed/one",
            vec![raw_event("e1", day_from_today(9), day_from_today(13))],
        );

        let report = h
            .engine
            .sync_listing(listing.id, None, TriggeredBy::Manual)
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.result.counters.added, 1);

        let sessions = h.store.sessions();
        assert_eq!(sessions.len(), 1);
        let session = &sessions[0];
        assert_eq!(session.id, report.session_id);
        assert_eq!(session.sync_type, SyncType::Single);
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.target_listing_name.as_deref(), Some("Loft 12"));
        assert_eq!(session.totals.added, 1);
        assert!(session.completed_at.is_some());
        assert!(session.duration_seconds.is_some());

        let entries = h.store.log_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sync_session_id, session.id);
    }

    #[tokio::test]
    async fn joined_sync_increments_without_completing_the_session() {
        let h = harness();
        let listing = h.store.add_listing("Loft 12", "airbnb-1", None);
        h.store.add_feed(&listing, "https://feed/one");
        h.fetcher.respond(
            "https://feed/one",
            vec![raw_event("e1", day_from_today(9), day_from_today(13))],
        );

        let owner = crate::services::session_log::SessionLogger::open(
            Arc::clone(&h.store) as Arc<dyn BookingStore>,
            NewSyncSession {
                sync_type: SyncType::All,
                target_listing_id: None,
                target_listing_name: None,
                triggered_by: TriggeredBy::Manual,
                metadata: serde_json::json!({}),
            },
        )
        .await
        .unwrap();

        let report = h
            .engine
            .sync_listing(listing.id, Some(owner.session_id()), TriggeredBy::Manual)
            .await
            .unwrap();

        assert_eq!(report.session_id, owner.session_id());
        let session = h
            .store
            .get_session(owner.session_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::InProgress);
        assert_eq!(session.totals.added, 1);
        assert!(session.completed_at.is_none());
    }

    #[tokio::test]
    async fn sync_unknown_listing_is_not_found() {
        let h = harness();
        let result = h
            .engine
            .sync_listing(Uuid::new_v4(), None, TriggeredBy::Manual)
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn sync_all_skips_manual_listings_and_aggregates_totals() {
        let h = harness();
        let loft = h.store.add_listing("Loft 12", "airbnb-1", None);
        let cabin = h.store.add_listing("Cabin 3", "vrbo-9", None);
        h.store.add_listing("Office", "manual-1", None);
        h.store.add_feed(&loft, "https://feed/loft");
        h.store.add_feed(&cabin, "https://feed/cabin");
        h.fetcher.respond(
            "https://feed/loft",
            vec![raw_event("e1", day_from_today(9), day_from_today(13))],
        );
        h.fetcher.respond(
            "https://feed/cabin",
            vec![
                raw_event("e2", day_from_today(10), day_from_today(12)),
                raw_event("e3", day_from_today(12), day_from_today(15)),
            ],
        );

        let report = h.engine.sync_all(TriggeredBy::Cron).await.unwrap();

        assert!(report.success);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.totals.listings, 2);
        assert_eq!(report.totals.completed_listings, 2);
        assert_eq!(report.totals.added, 3);
        assert_eq!(report.totals.errors, 0);

        // Session totals match the sum of per-listing counters.
        let session = h
            .store
            .get_session(report.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.sync_type, SyncType::All);
        assert_eq!(session.status, SessionStatus::Completed);
        let mut summed = SyncCounters::default();
        for result in &report.results {
            summed.merge(&result.counters);
        }
        assert_eq!(session.totals, summed);

        // The manual listing was never synced.
        assert!(h.store.active_bookings("Office").is_empty());
        assert!(report.results.iter().all(|r| r.listing_name != "Office"));
    }

    #[tokio::test]
    async fn sync_all_reports_partial_failure_without_aborting() {
        let h = harness();
        let loft = h.store.add_listing("Loft 12", "airbnb-1", None);
        let cabin = h.store.add_listing("Cabin 3", "vrbo-9", None);
        h.store.add_feed(&loft, "https://feed/loft");
        h.store.add_feed(&cabin, "https://feed/cabin");
        h.fetcher.respond(
            "https://feed/loft",
            vec![raw_event("e1", day_from_today(9), day_from_today(13))],
        );
        h.fetcher.respond(
            "https://feed/cabin",
            vec![raw_event("e2", day_from_today(10), day_from_today(12))],
        );
        h.store.fail_active_bookings_for("Cabin 3");

        let report = h.engine.sync_all(TriggeredBy::Manual).await.unwrap();

        assert!(!report.success);
        assert_eq!(report.totals.completed_listings, 1);
        assert!(report.totals.errors > 0);
        assert_eq!(h.store.active_bookings("Loft 12").len(), 1);

        // Partial runs still close as completed; the error counters carry
        // the signal.
        let session = h
            .store
            .get_session(report.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.totals.errors > 0);
    }

    #[tokio::test]
    async fn sync_all_fails_as_error_when_listings_cannot_be_read() {
        let h = harness();
        h.store.fail_list_listings();

        let result = h.engine.sync_all(TriggeredBy::Manual).await;

        assert!(result.is_err());
        let sessions = h.store.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, SessionStatus::Error);
        assert!(sessions[0].error_message.is_some());
    }

    #[tokio::test]
    async fn wall_clock_budget_records_outstanding_listings_as_errors() {
        let h = harness_with_budget(Some(std::time::Duration::from_millis(250)));
        let fast = h.store.add_listing("Loft 12", "airbnb-1", None);
        let slow = h.store.add_listing("Cabin 3", "vrbo-9", None);
        h.store.add_feed(&fast, "https://feed/fast");
        h.store.add_feed(&slow, "https://feed/slow");
        h.fetcher.respond(
            "https://feed/fast",
            vec![raw_event("e1", day_from_today(9), day_from_today(13))],
        );
        h.fetcher.respond(
            "https://feed/slow",
            vec![raw_event("e2", day_from_today(9), day_from_today(13))],
        );
        h.fetcher
            .delay("https://feed/slow", std::time::Duration::from_secs(5));

        let report = h.engine.sync_all(TriggeredBy::Manual).await.unwrap();

        assert!(!report.success);
        assert_eq!(report.error.as_deref(), Some(BUDGET_EXCEEDED));

        let fast_result = report
            .results
            .iter()
            .find(|r| r.listing_name == "Loft 12")
            .unwrap();
        assert!(fast_result.is_success());
        assert_eq!(fast_result.counters.added, 1);

        let slow_result = report
            .results
            .iter()
            .find(|r| r.listing_name == "Cabin 3")
            .unwrap();
        assert!(!slow_result.is_success());
        assert_eq!(slow_result.error.as_deref(), Some(BUDGET_EXCEEDED));
        assert_eq!(slow_result.counters.errors, 1);

        // The run still closes as completed; the error counters and the
        // budget message carry the signal.
        let session = h
            .store
            .get_session(report.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.error_message.as_deref(), Some(BUDGET_EXCEEDED));
        assert!(session.totals.errors > 0);
        assert_eq!(session.totals.added, 1);
    }

    #[tokio::test]
    async fn reconciled_listings_keep_unique_active_event_ids_across_runs() {
        let h = harness();
        let loft = h.store.add_listing("Loft 12", "airbnb-1", None);
        h.store.add_feed(&loft, "https://feed/loft");
        h.store.seed_booking(
            &loft,
            "e1",
            day_from_today(9),
            day_from_today(13),
            CheckoutType::Open,
        );
        h.fetcher.respond(
            "https://feed/loft",
            vec![raw_event("e1", day_from_today(10), day_from_today(14))],
        );

        for _ in 0..2 {
            h.engine.sync_all(TriggeredBy::Automatic).await.unwrap();
        }

        let active = h.store.active_bookings("Loft 12");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].event_id, "e1");
        assert_eq!(active[0].checkin_day(), day_from_today(10));
    }
}
