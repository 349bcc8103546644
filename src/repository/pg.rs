//! Postgres-backed [`BookingStore`].
//!
//! Each call is one statement; the engine does not rely on cross-call
//! transactionality and recovers by re-reading state on the next pass.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    Booking, ChangeRecord, CheckoutType, Feed, Listing, LogEntry, NewBooking, NewLogEntry,
    NewSyncSession, SessionStatus, SyncCounters, SyncSession,
};
use crate::repository::store::BookingStore;

const BOOKING_COLUMNS: &str = "uuid, event_id, listing_id, listing_name, listing_hours, \
     checkin_date, checkout_date, checkout_type, checkout_time, event_type, is_active, \
     created_at, updated_at";

const SESSION_COLUMNS: &str = "id, sync_type, target_listing_id, target_listing_name, \
     triggered_by, status, started_at, completed_at, duration_seconds, listings, \
     completed_listings, events_processed, feeds_processed, added, updated, deactivated, \
     replaced, unchanged, errors, error_message, metadata, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookingStore for PgStore {
    async fn list_listings(&self) -> AppResult<Vec<Listing>> {
        let rows = sqlx::query_as::<_, Listing>(
            "SELECT id, external_id, name, hours, color, bank_account
             FROM listings
             ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_listing(&self, listing_id: Uuid) -> AppResult<Option<Listing>> {
        let row = sqlx::query_as::<_, Listing>(
            "SELECT id, external_id, name, hours, color, bank_account
             FROM listings
             WHERE id = $1",
        )
        .bind(listing_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_feeds_for_listing(&self, listing_id: Uuid) -> AppResult<Vec<Feed>> {
        let rows = sqlx::query_as::<_, Feed>(
            "SELECT id, listing_id, url, name, is_active, last_synced
             FROM feeds
             WHERE listing_id = $1
             ORDER BY created_at",
        )
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_feed_last_synced(&self, feed_id: Uuid, ts: DateTime<Utc>) -> AppResult<()> {
        sqlx::query("UPDATE feeds SET last_synced = $2 WHERE id = $1")
            .bind(feed_id)
            .bind(ts)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_active_bookings(&self, listing_name: &str) -> AppResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS}
             FROM events
             WHERE listing_name = $1 AND is_active = TRUE AND event_type = 'ical'
             ORDER BY checkin_date",
        ))
        .bind(listing_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_active_booking_by_event_id(
        &self,
        event_id: &str,
    ) -> AppResult<Option<Booking>> {
        let row = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS}
             FROM events
             WHERE event_id = $1 AND is_active = TRUE AND event_type = 'ical'
             LIMIT 1",
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_active_bookings_by_date_range(
        &self,
        listing_name: &str,
        checkin: NaiveDate,
        checkout: NaiveDate,
    ) -> AppResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS}
             FROM events
             WHERE listing_name = $1
               AND is_active = TRUE
               AND event_type = 'ical'
               AND (checkin_date AT TIME ZONE 'utc')::date = $2
               AND (checkout_date AT TIME ZONE 'utc')::date = $3
             ORDER BY created_at",
        ))
        .bind(listing_name)
        .bind(checkin)
        .bind(checkout)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_active_bookings_by_checkin_date(
        &self,
        listing_name: &str,
        checkin: NaiveDate,
    ) -> AppResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS}
             FROM events
             WHERE listing_name = $1
               AND is_active = TRUE
               AND event_type = 'ical'
               AND (checkin_date AT TIME ZONE 'utc')::date = $2
             ORDER BY created_at",
        ))
        .bind(listing_name)
        .bind(checkin)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_booking(&self, booking: NewBooking) -> AppResult<Booking> {
        let row = sqlx::query_as::<_, Booking>(&format!(
            "INSERT INTO events (uuid, event_id, listing_id, listing_name, listing_hours,
                 checkin_date, checkout_date, checkout_type, checkout_time, event_type,
                 is_active, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, TRUE, now(), now())
             RETURNING {BOOKING_COLUMNS}",
        ))
        .bind(Uuid::new_v4())
        .bind(&booking.event_id)
        .bind(booking.listing_id)
        .bind(&booking.listing_name)
        .bind(booking.listing_hours)
        .bind(booking.checkin_date)
        .bind(booking.checkout_date)
        .bind(booking.checkout_type)
        .bind(booking.checkout_time)
        .bind(booking.event_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_booking_checkout_type(
        &self,
        uuid: Uuid,
        checkout_type: CheckoutType,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE events SET checkout_type = $2, updated_at = now() WHERE uuid = $1",
        )
        .bind(uuid)
        .bind(checkout_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deactivate_bookings(&self, uuids: &[Uuid]) -> AppResult<u64> {
        if uuids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE events SET is_active = FALSE, updated_at = now() WHERE uuid = ANY($1)",
        )
        .bind(uuids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn deactivate_assignments_for_bookings(&self, uuids: &[Uuid]) -> AppResult<u64> {
        if uuids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE cleaner_assignments
             SET is_active = FALSE
             WHERE event_uuid = ANY($1) AND is_active = TRUE",
        )
        .bind(uuids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_change_record(&self, record: &ChangeRecord) -> AppResult<bool> {
        let result = sqlx::query(
            "INSERT INTO event_changes (id, listing_name, event_id, change_type,
                 old_checkin_date, old_checkout_date, new_checkin_date, new_checkout_date,
                 old_event_id, created_at)
             SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, now()
             WHERE NOT EXISTS (
                 SELECT 1 FROM event_changes
                 WHERE listing_name = $2
                   AND event_id = $3
                   AND change_type = $4
                   AND old_checkin_date = $5
                   AND old_checkout_date = $6
                   AND new_checkin_date IS NOT DISTINCT FROM $7
                   AND new_checkout_date IS NOT DISTINCT FROM $8
                   AND old_event_id IS NOT DISTINCT FROM $9
             )",
        )
        .bind(Uuid::new_v4())
        .bind(&record.listing_name)
        .bind(&record.event_id)
        .bind(record.change_type)
        .bind(record.old_checkin_date)
        .bind(record.old_checkout_date)
        .bind(record.new_checkin_date)
        .bind(record.new_checkout_date)
        .bind(&record.old_event_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_session(&self, session: NewSyncSession) -> AppResult<SyncSession> {
        let row = sqlx::query_as::<_, SyncSession>(&format!(
            "INSERT INTO sync_sessions (id, sync_type, target_listing_id,
                 target_listing_name, triggered_by, status, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5, 'pending', $6, now())
             RETURNING {SESSION_COLUMNS}",
        ))
        .bind(Uuid::new_v4())
        .bind(session.sync_type)
        .bind(session.target_listing_id)
        .bind(&session.target_listing_name)
        .bind(session.triggered_by)
        .bind(&session.metadata)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn mark_session_in_progress(
        &self,
        session_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE sync_sessions
             SET status = 'in_progress', started_at = $2
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(session_id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_session_totals(
        &self,
        session_id: Uuid,
        delta: &SyncCounters,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE sync_sessions
             SET listings = listings + $2,
                 completed_listings = completed_listings + $3,
                 events_processed = events_processed + $4,
                 feeds_processed = feeds_processed + $5,
                 added = added + $6,
                 updated = updated + $7,
                 deactivated = deactivated + $8,
                 replaced = replaced + $9,
                 unchanged = unchanged + $10,
                 errors = errors + $11
             WHERE id = $1",
        )
        .bind(session_id)
        .bind(delta.listings)
        .bind(delta.completed_listings)
        .bind(delta.events_processed)
        .bind(delta.feeds_processed)
        .bind(delta.added)
        .bind(delta.updated)
        .bind(delta.deactivated)
        .bind(delta.replaced)
        .bind(delta.unchanged)
        .bind(delta.errors)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_session(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        totals: Option<&SyncCounters>,
        completed_at: DateTime<Utc>,
        duration_seconds: f64,
        error_message: Option<&str>,
    ) -> AppResult<()> {
        if let Some(totals) = totals {
            sqlx::query(
                "UPDATE sync_sessions
                 SET status = $2, completed_at = $3, duration_seconds = $4,
                     error_message = $5,
                     listings = $6, completed_listings = $7, events_processed = $8,
                     feeds_processed = $9, added = $10, updated = $11, deactivated = $12,
                     replaced = $13, unchanged = $14, errors = $15
                 WHERE id = $1",
            )
            .bind(session_id)
            .bind(status)
            .bind(completed_at)
            .bind(duration_seconds)
            .bind(error_message)
            .bind(totals.listings)
            .bind(totals.completed_listings)
            .bind(totals.events_processed)
            .bind(totals.feeds_processed)
            .bind(totals.added)
            .bind(totals.updated)
            .bind(totals.deactivated)
            .bind(totals.replaced)
            .bind(totals.unchanged)
            .bind(totals.errors)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE sync_sessions
                 SET status = $2, completed_at = $3, duration_seconds = $4, error_message = $5
                 WHERE id = $1",
            )
            .bind(session_id)
            .bind(status)
            .bind(completed_at)
            .bind(duration_seconds)
            .bind(error_message)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> AppResult<Option<SyncSession>> {
        let row = sqlx::query_as::<_, SyncSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sync_sessions WHERE id = $1",
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_sessions(&self, limit: i64) -> AppResult<Vec<SyncSession>> {
        let rows = sqlx::query_as::<_, SyncSession>(&format!(
            "SELECT {SESSION_COLUMNS}
             FROM sync_sessions
             ORDER BY created_at DESC
             LIMIT $1",
        ))
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_log_entries(&self, entries: &[NewLogEntry]) -> AppResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut query = QueryBuilder::<Postgres>::new(
            "INSERT INTO sync_log_entries (id, sync_session_id, created_at, operation, \
             event_id, listing_name, event_details, reasoning, metadata) ",
        );
        query.push_values(entries, |mut row, entry| {
            row.push_bind(Uuid::new_v4())
                .push_bind(entry.sync_session_id)
                .push("now()")
                .push_bind(entry.operation)
                .push_bind(&entry.event_id)
                .push_bind(&entry.listing_name)
                .push_bind(&entry.event_details)
                .push_bind(&entry.reasoning)
                .push_bind(&entry.metadata);
        });
        query.build().execute(&self.pool).await.map_err(crate::error::AppError::from)?;
        Ok(())
    }

    async fn list_log_entries(&self, session_id: Uuid, limit: i64) -> AppResult<Vec<LogEntry>> {
        let rows = sqlx::query_as::<_, LogEntry>(
            "SELECT id, sync_session_id, created_at, operation, event_id, listing_name,
                 event_details, reasoning, metadata
             FROM sync_log_entries
             WHERE sync_session_id = $1
             ORDER BY created_at
             LIMIT $2",
        )
        .bind(session_id)
        .bind(limit.clamp(1, 5000))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
