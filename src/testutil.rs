//! In-memory fakes for the engine's collaborator seams. The store honors the
//! same semantics the Postgres implementation does (UTC date comparisons,
//! read-your-own-writes), so reconcile tests drive the real pass order.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    Booking, ChangeRecord, CheckoutType, CleanerAssignment, EventType, Feed, Listing, LogEntry,
    NewBooking, NewLogEntry, NewSyncSession, RawEvent, SessionStatus, SyncCounters, SyncSession,
};
use crate::repository::store::BookingStore;
use crate::services::ical::{FeedFetcher, FetchError, FetchedFeed};
use crate::services::notifier::Notifier;

pub fn day_from_today(offset: i64) -> NaiveDate {
    Utc::now().date_naive() + chrono::Duration::days(offset)
}

pub fn at_midnight(day: NaiveDate) -> DateTime<Utc> {
    day.and_hms_opt(0, 0, 0).unwrap().and_utc()
}

pub fn raw_event(id: &str, checkin: NaiveDate, checkout: NaiveDate) -> RawEvent {
    RawEvent {
        id: id.to_string(),
        title: "Reserved".to_string(),
        start: at_midnight(checkin),
        end: at_midnight(checkout),
        listing: String::new(),
    }
}

#[derive(Default)]
struct Tables {
    listings: Vec<Listing>,
    feeds: Vec<Feed>,
    bookings: Vec<Booking>,
    assignments: Vec<CleanerAssignment>,
    change_records: Vec<ChangeRecord>,
    sessions: Vec<SyncSession>,
    log_entries: Vec<LogEntry>,
    fail_log_inserts: u32,
    fail_insert_for_event_ids: Vec<String>,
    fail_list_listings: bool,
    fail_active_bookings_for: Vec<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listing(&self, name: &str, external_id: &str, hours: Option<f64>) -> Listing {
        let listing = Listing {
            id: Uuid::new_v4(),
            external_id: external_id.to_string(),
            name: name.to_string(),
            hours,
            color: None,
            bank_account: None,
        };
        self.tables.lock().unwrap().listings.push(listing.clone());
        listing
    }

    pub fn add_feed(&self, listing: &Listing, url: &str) -> Feed {
        let feed = Feed {
            id: Uuid::new_v4(),
            listing_id: listing.id,
            url: url.to_string(),
            name: format!("feed-{url}"),
            is_active: true,
            last_synced: None,
        };
        self.tables.lock().unwrap().feeds.push(feed.clone());
        feed
    }

    pub fn seed_booking(
        &self,
        listing: &Listing,
        event_id: &str,
        checkin: NaiveDate,
        checkout: NaiveDate,
        checkout_type: CheckoutType,
    ) -> Booking {
        let now = Utc::now();
        let booking = Booking {
            uuid: Uuid::new_v4(),
            event_id: event_id.to_string(),
            listing_id: listing.id,
            listing_name: listing.name.clone(),
            listing_hours: listing.hours_or(2.0),
            checkin_date: at_midnight(checkin),
            checkout_date: at_midnight(checkout),
            checkout_type,
            checkout_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            event_type: EventType::Ical,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.tables.lock().unwrap().bookings.push(booking.clone());
        booking
    }

    pub fn seed_assignment(&self, booking: &Booking) -> CleanerAssignment {
        let assignment = CleanerAssignment {
            uuid: Uuid::new_v4(),
            event_uuid: booking.uuid,
            cleaner_uuid: Uuid::new_v4(),
            hours: booking.listing_hours,
            is_active: true,
        };
        self.tables
            .lock()
            .unwrap()
            .assignments
            .push(assignment.clone());
        assignment
    }

    pub fn fail_next_log_inserts(&self, count: u32) {
        self.tables.lock().unwrap().fail_log_inserts = count;
    }

    pub fn fail_insert_for_event(&self, event_id: &str) {
        self.tables
            .lock()
            .unwrap()
            .fail_insert_for_event_ids
            .push(event_id.to_string());
    }

    pub fn fail_list_listings(&self) {
        self.tables.lock().unwrap().fail_list_listings = true;
    }

    pub fn fail_active_bookings_for(&self, listing_name: &str) {
        self.tables
            .lock()
            .unwrap()
            .fail_active_bookings_for
            .push(listing_name.to_string());
    }

    pub fn bookings(&self) -> Vec<Booking> {
        self.tables.lock().unwrap().bookings.clone()
    }

    pub fn active_bookings(&self, listing_name: &str) -> Vec<Booking> {
        self.tables
            .lock()
            .unwrap()
            .bookings
            .iter()
            .filter(|b| b.is_active && b.listing_name == listing_name)
            .cloned()
            .collect()
    }

    pub fn assignments(&self) -> Vec<CleanerAssignment> {
        self.tables.lock().unwrap().assignments.clone()
    }

    pub fn change_records(&self) -> Vec<ChangeRecord> {
        self.tables.lock().unwrap().change_records.clone()
    }

    pub fn sessions(&self) -> Vec<SyncSession> {
        self.tables.lock().unwrap().sessions.clone()
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.tables.lock().unwrap().log_entries.clone()
    }

    pub fn feeds(&self) -> Vec<Feed> {
        self.tables.lock().unwrap().feeds.clone()
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn list_listings(&self) -> AppResult<Vec<Listing>> {
        let tables = self.tables.lock().unwrap();
        if tables.fail_list_listings {
            return Err(AppError::Dependency("injected listing failure".to_string()));
        }
        Ok(tables.listings.clone())
    }

    async fn get_listing(&self, listing_id: Uuid) -> AppResult<Option<Listing>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .listings
            .iter()
            .find(|l| l.id == listing_id)
            .cloned())
    }

    async fn list_feeds_for_listing(&self, listing_id: Uuid) -> AppResult<Vec<Feed>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .feeds
            .iter()
            .filter(|f| f.listing_id == listing_id)
            .cloned()
            .collect())
    }

    async fn update_feed_last_synced(&self, feed_id: Uuid, ts: DateTime<Utc>) -> AppResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(feed) = tables.feeds.iter_mut().find(|f| f.id == feed_id) {
            feed.last_synced = Some(ts);
        }
        Ok(())
    }

    async fn list_active_bookings(&self, listing_name: &str) -> AppResult<Vec<Booking>> {
        let tables = self.tables.lock().unwrap();
        if tables
            .fail_active_bookings_for
            .iter()
            .any(|name| name == listing_name)
        {
            return Err(AppError::Dependency("injected booking failure".to_string()));
        }
        let mut rows: Vec<Booking> = tables
            .bookings
            .iter()
            .filter(|b| {
                b.is_active && b.event_type == EventType::Ical && b.listing_name == listing_name
            })
            .cloned()
            .collect();
        rows.sort_by_key(|b| b.checkin_date);
        Ok(rows)
    }

    async fn find_active_booking_by_event_id(
        &self,
        event_id: &str,
    ) -> AppResult<Option<Booking>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .bookings
            .iter()
            .find(|b| b.is_active && b.event_type == EventType::Ical && b.event_id == event_id)
            .cloned())
    }

    async fn find_active_bookings_by_date_range(
        &self,
        listing_name: &str,
        checkin: NaiveDate,
        checkout: NaiveDate,
    ) -> AppResult<Vec<Booking>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .bookings
            .iter()
            .filter(|b| {
                b.is_active
                    && b.event_type == EventType::Ical
                    && b.listing_name == listing_name
                    && b.checkin_day() == checkin
                    && b.checkout_day() == checkout
            })
            .cloned()
            .collect())
    }

    async fn find_active_bookings_by_checkin_date(
        &self,
        listing_name: &str,
        checkin: NaiveDate,
    ) -> AppResult<Vec<Booking>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .bookings
            .iter()
            .filter(|b| {
                b.is_active
                    && b.event_type == EventType::Ical
                    && b.listing_name == listing_name
                    && b.checkin_day() == checkin
            })
            .cloned()
            .collect())
    }

    async fn insert_booking(&self, booking: NewBooking) -> AppResult<Booking> {
        let mut tables = self.tables.lock().unwrap();
        if tables
            .fail_insert_for_event_ids
            .iter()
            .any(|id| *id == booking.event_id)
        {
            return Err(AppError::Dependency("injected insert failure".to_string()));
        }
        let now = Utc::now();
        let row = Booking {
            uuid: Uuid::new_v4(),
            event_id: booking.event_id,
            listing_id: booking.listing_id,
            listing_name: booking.listing_name,
            listing_hours: booking.listing_hours,
            checkin_date: booking.checkin_date,
            checkout_date: booking.checkout_date,
            checkout_type: booking.checkout_type,
            checkout_time: booking.checkout_time,
            event_type: booking.event_type,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        tables.bookings.push(row.clone());
        Ok(row)
    }

    async fn update_booking_checkout_type(
        &self,
        uuid: Uuid,
        checkout_type: CheckoutType,
    ) -> AppResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(booking) = tables.bookings.iter_mut().find(|b| b.uuid == uuid) {
            booking.checkout_type = checkout_type;
            booking.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn deactivate_bookings(&self, uuids: &[Uuid]) -> AppResult<u64> {
        let mut tables = self.tables.lock().unwrap();
        let mut affected = 0;
        for booking in tables.bookings.iter_mut() {
            if uuids.contains(&booking.uuid) && booking.is_active {
                booking.is_active = false;
                booking.updated_at = Utc::now();
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn deactivate_assignments_for_bookings(&self, uuids: &[Uuid]) -> AppResult<u64> {
        let mut tables = self.tables.lock().unwrap();
        let mut affected = 0;
        for assignment in tables.assignments.iter_mut() {
            if uuids.contains(&assignment.event_uuid) && assignment.is_active {
                assignment.is_active = false;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn insert_change_record(&self, record: &ChangeRecord) -> AppResult<bool> {
        let mut tables = self.tables.lock().unwrap();
        if tables.change_records.iter().any(|r| r == record) {
            return Ok(false);
        }
        tables.change_records.push(record.clone());
        Ok(true)
    }

    async fn create_session(&self, session: NewSyncSession) -> AppResult<SyncSession> {
        let row = SyncSession {
            id: Uuid::new_v4(),
            sync_type: session.sync_type,
            target_listing_id: session.target_listing_id,
            target_listing_name: session.target_listing_name,
            triggered_by: session.triggered_by,
            status: SessionStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            totals: SyncCounters::default(),
            error_message: None,
            metadata: session.metadata,
            created_at: Utc::now(),
        };
        self.tables.lock().unwrap().sessions.push(row.clone());
        Ok(row)
    }

    async fn mark_session_in_progress(
        &self,
        session_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(session) = tables
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id && s.status == SessionStatus::Pending)
        {
            session.status = SessionStatus::InProgress;
            session.started_at = Some(started_at);
        }
        Ok(())
    }

    async fn increment_session_totals(
        &self,
        session_id: Uuid,
        delta: &SyncCounters,
    ) -> AppResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(session) = tables.sessions.iter_mut().find(|s| s.id == session_id) {
            session.totals.merge(delta);
        }
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
        let mut tables = self.tables.lock().unwrap();
        if let Some(session) = tables.sessions.iter_mut().find(|s| s.id == session_id) {
            session.status = status;
            session.completed_at = Some(completed_at);
            session.duration_seconds = Some(duration_seconds);
            session.error_message = error_message.map(ToOwned::to_owned);
            if let Some(totals) = totals {
                session.totals = *totals;
            }
        }
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> AppResult<Option<SyncSession>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .cloned())
    }

    async fn list_sessions(&self, limit: i64) -> AppResult<Vec<SyncSession>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .sessions
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn insert_log_entries(&self, entries: &[NewLogEntry]) -> AppResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables.fail_log_inserts > 0 {
            tables.fail_log_inserts -= 1;
            return Err(AppError::Dependency("injected log failure".to_string()));
        }
        for entry in entries {
            tables.log_entries.push(LogEntry {
                id: Uuid::new_v4(),
                sync_session_id: entry.sync_session_id,
                created_at: Utc::now(),
                operation: entry.operation,
                event_id: entry.event_id.clone(),
                listing_name: entry.listing_name.clone(),
                event_details: entry.event_details.clone(),
                reasoning: entry.reasoning.clone(),
                metadata: entry.metadata.clone(),
            });
        }
        Ok(())
    }

    async fn list_log_entries(&self, session_id: Uuid, limit: i64) -> AppResult<Vec<LogEntry>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .log_entries
            .iter()
            .filter(|e| e.sync_session_id == session_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

/// Canned per-URL feed responses; unknown URLs fetch as empty calendars.
#[derive(Default)]
pub struct StubFetcher {
    responses: Mutex<HashMap<String, Result<Vec<RawEvent>, String>>>,
    delays: Mutex<HashMap<String, std::time::Duration>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, events: Vec<RawEvent>) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Ok(events));
    }

    pub fn fail(&self, url: &str, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Err(message.to_string()));
    }

    /// Make fetches of this URL sleep first, to simulate a slow feed host.
    pub fn delay(&self, url: &str, delay: std::time::Duration) {
        self.delays.lock().unwrap().insert(url.to_string(), delay);
    }
}

#[async_trait]
impl FeedFetcher for StubFetcher {
    async fn fetch(
        &self,
        feed_url: &str,
        _listing_id: Uuid,
        _window_start: DateTime<Utc>,
        _window_end: DateTime<Utc>,
    ) -> Result<FetchedFeed, FetchError> {
        let delay = self.delays.lock().unwrap().get(feed_url).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.responses.lock().unwrap().get(feed_url) {
            Some(Ok(events)) => Ok(FetchedFeed {
                events: events.clone(),
                detected_listing_name: "Stub calendar".to_string(),
            }),
            Some(Err(message)) => Err(FetchError::Network(message.clone())),
            None => Ok(FetchedFeed {
                events: Vec::new(),
                detected_listing_name: "Stub calendar".to_string(),
            }),
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, title: &str, body: &str) -> bool {
        self.sent
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string()));
        true
    }
}
