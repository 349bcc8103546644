//! The store seam the sync engine reconciles against.
//!
//! Every read here is fresh: implementations must never serve results cached
//! from before the caller's latest mutation, because the per-event pass in the
//! reconciler relies on observing its own writes.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    Booking, ChangeRecord, CheckoutType, Feed, Listing, LogEntry, NewBooking, NewLogEntry,
    NewSyncSession, SessionStatus, SyncCounters, SyncSession,
};

#[async_trait]
pub trait BookingStore: Send + Sync {
    // --- Listings & feeds ---

    async fn list_listings(&self) -> AppResult<Vec<Listing>>;

    async fn get_listing(&self, listing_id: Uuid) -> AppResult<Option<Listing>>;

    async fn list_feeds_for_listing(&self, listing_id: Uuid) -> AppResult<Vec<Feed>>;

    /// Record a sync attempt on a feed. Reflects attempt, not success.
    async fn update_feed_last_synced(&self, feed_id: Uuid, ts: DateTime<Utc>) -> AppResult<()>;

    // --- Bookings ---

    /// All active iCal bookings for a listing.
    async fn list_active_bookings(&self, listing_name: &str) -> AppResult<Vec<Booking>>;

    /// At most one row: active bookings are unique per event id.
    async fn find_active_booking_by_event_id(&self, event_id: &str)
        -> AppResult<Option<Booking>>;

    /// Active bookings whose stay covers exactly `[checkin, checkout]` by
    /// calendar date. Used for replacement detection.
    async fn find_active_bookings_by_date_range(
        &self,
        listing_name: &str,
        checkin: NaiveDate,
        checkout: NaiveDate,
    ) -> AppResult<Vec<Booking>>;

    /// Active bookings checking in on the given date. Used for checkout-type
    /// derivation.
    async fn find_active_bookings_by_checkin_date(
        &self,
        listing_name: &str,
        checkin: NaiveDate,
    ) -> AppResult<Vec<Booking>>;

    async fn insert_booking(&self, booking: NewBooking) -> AppResult<Booking>;

    async fn update_booking_checkout_type(
        &self,
        uuid: Uuid,
        checkout_type: CheckoutType,
    ) -> AppResult<()>;

    async fn deactivate_bookings(&self, uuids: &[Uuid]) -> AppResult<u64>;

    async fn deactivate_assignments_for_bookings(&self, uuids: &[Uuid]) -> AppResult<u64>;

    /// Append a change record unless a byte-identical one already exists.
    /// Returns true when the record was new.
    async fn insert_change_record(&self, record: &ChangeRecord) -> AppResult<bool>;

    // --- Sessions & log entries ---

    async fn create_session(&self, session: NewSyncSession) -> AppResult<SyncSession>;

    async fn mark_session_in_progress(
        &self,
        session_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> AppResult<()>;

    /// Atomic read-modify-write on the session counters; concurrent listing
    /// reconciles increment the same shared session.
    async fn increment_session_totals(
        &self,
        session_id: Uuid,
        delta: &SyncCounters,
    ) -> AppResult<()>;

    async fn complete_session(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        totals: Option<&SyncCounters>,
        completed_at: DateTime<Utc>,
        duration_seconds: f64,
        error_message: Option<&str>,
    ) -> AppResult<()>;

    async fn get_session(&self, session_id: Uuid) -> AppResult<Option<SyncSession>>;

    async fn list_sessions(&self, limit: i64) -> AppResult<Vec<SyncSession>>;

    async fn insert_log_entries(&self, entries: &[NewLogEntry]) -> AppResult<()>;

    async fn list_log_entries(&self, session_id: Uuid, limit: i64) -> AppResult<Vec<LogEntry>>;
}
