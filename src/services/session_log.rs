//! Sync-session bookkeeping: one row per logical run, per-decision log
//! entries flushed in batches, aggregate counters incremented as listings
//! finish.
//!
//! A logger either owns its session (opened it, will complete it) or joins an
//! existing one (increments totals only). Logging must never mask a real
//! error: a failed entry flush parks the batch in a carry-over buffer that is
//! retried at close; if that retry also fails the entries are dropped and
//! counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{NewLogEntry, NewSyncSession, SessionStatus, SyncCounters};
use crate::repository::store::BookingStore;

pub struct SessionLogger {
    store: Arc<dyn BookingStore>,
    session_id: Uuid,
    owns_session: bool,
    started_at: DateTime<Utc>,
    started: Instant,
    carryover: Mutex<Vec<NewLogEntry>>,
    dropped_entries: AtomicU64,
}

impl SessionLogger {
    /// Open a new session and mark it in progress.
    pub async fn open(
        store: Arc<dyn BookingStore>,
        session: NewSyncSession,
    ) -> AppResult<Self> {
        let row = store.create_session(session).await?;
        let started_at = Utc::now();
        store.mark_session_in_progress(row.id, started_at).await?;
        tracing::info!(session_id = %row.id, sync_type = ?row.sync_type, "Sync session opened");
        Ok(Self {
            store,
            session_id: row.id,
            owns_session: true,
            started_at,
            started: Instant::now(),
            carryover: Mutex::new(Vec::new()),
            dropped_entries: AtomicU64::new(0),
        })
    }

    /// Attach to a session opened elsewhere; totals are incremented but the
    /// session is never completed through this handle.
    pub fn join(store: Arc<dyn BookingStore>, session_id: Uuid) -> Self {
        Self {
            store,
            session_id,
            owns_session: false,
            started_at: Utc::now(),
            started: Instant::now(),
            carryover: Mutex::new(Vec::new()),
            dropped_entries: AtomicU64::new(0),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn owns_session(&self) -> bool {
        self.owns_session
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Entries dropped after both the primary flush and the close-time retry
    /// failed.
    pub fn dropped_entries(&self) -> u64 {
        self.dropped_entries.load(Ordering::Relaxed)
    }

    /// Flush one reconcile's buffered entries as a single batch.
    pub async fn flush_entries(&self, entries: Vec<NewLogEntry>) {
        if entries.is_empty() {
            return;
        }
        if let Err(error) = self.store.insert_log_entries(&entries).await {
            tracing::warn!(
                session_id = %self.session_id,
                count = entries.len(),
                error = %error.detail_message(),
                "Log entry flush failed, parking batch for close-time retry"
            );
            self.carryover.lock().await.extend(entries);
        }
    }

    pub async fn increment_totals(&self, delta: &SyncCounters) -> AppResult<()> {
        self.store
            .increment_session_totals(self.session_id, delta)
            .await
    }

    /// Complete the session. No-op unless this logger owns it.
    pub async fn complete(
        &self,
        status: SessionStatus,
        totals: Option<&SyncCounters>,
        error_message: Option<&str>,
    ) -> AppResult<()> {
        self.retry_carryover().await;
        if !self.owns_session {
            return Ok(());
        }
        let completed_at = Utc::now();
        let duration_seconds = self.started.elapsed().as_secs_f64();
        self.store
            .complete_session(
                self.session_id,
                status,
                totals,
                completed_at,
                duration_seconds,
                error_message,
            )
            .await?;
        tracing::info!(
            session_id = %self.session_id,
            %status,
            duration_seconds,
            "Sync session closed"
        );
        Ok(())
    }

    async fn retry_carryover(&self) {
        let parked = std::mem::take(&mut *self.carryover.lock().await);
        if parked.is_empty() {
            return;
        }
        if let Err(error) = self.store.insert_log_entries(&parked).await {
            self.dropped_entries
                .fetch_add(parked.len() as u64, Ordering::Relaxed);
            tracing::error!(
                session_id = %self.session_id,
                dropped = parked.len(),
                error = %error.detail_message(),
                "Dropping log entries after close-time retry failed"
            );
        }
    }
}
