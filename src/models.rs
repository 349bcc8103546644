//! Domain types shared by the sync engine, the store and the HTTP surface.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Placeholder summary Airbnb feeds use for blocked-availability ranges.
pub const AVAILABILITY_PLACEHOLDER: &str = "Airbnb (Not available)";

/// External-id prefix marking listings that are not iCal-backed.
pub const MANUAL_LISTING_PREFIX: &str = "manual-";

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub external_id: String,
    pub name: String,
    pub hours: Option<f64>,
    pub color: Option<String>,
    pub bank_account: Option<String>,
}

impl Listing {
    pub fn is_manual(&self) -> bool {
        self.external_id.starts_with(MANUAL_LISTING_PREFIX)
    }

    /// Cleaning hours for this listing, falling back to the configured default.
    pub fn hours_or(&self, default: f64) -> f64 {
        self.hours.unwrap_or(default)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Feed {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub url: String,
    pub name: String,
    pub is_active: bool,
    pub last_synced: Option<DateTime<Utc>>,
}

/// A booking as parsed out of a feed, before any store interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub listing: String,
}

impl RawEvent {
    pub fn checkin_day(&self) -> NaiveDate {
        self.start.date_naive()
    }

    pub fn checkout_day(&self) -> NaiveDate {
        self.end.date_naive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "checkout_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckoutType {
    SameDay,
    Open,
}

impl std::fmt::Display for CheckoutType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckoutType::SameDay => write!(f, "same_day"),
            CheckoutType::Open => write!(f, "open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Ical,
    Manual,
}

/// A persisted reservation row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Booking {
    pub uuid: Uuid,
    pub event_id: String,
    pub listing_id: Uuid,
    pub listing_name: String,
    pub listing_hours: f64,
    pub checkin_date: DateTime<Utc>,
    pub checkout_date: DateTime<Utc>,
    pub checkout_type: CheckoutType,
    pub checkout_time: NaiveTime,
    pub event_type: EventType,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn checkin_day(&self) -> NaiveDate {
        self.checkin_date.date_naive()
    }

    pub fn checkout_day(&self) -> NaiveDate {
        self.checkout_date.date_naive()
    }

    /// Whether the stay's date range overlaps `[start, end)`. A stay ending on
    /// the day another starts is a turnover, not an overlap.
    pub fn overlaps_days(&self, start: NaiveDate, end: NaiveDate) -> bool {
        start < self.checkout_day() && end > self.checkin_day()
    }
}

/// Fields for inserting a booking; the store assigns uuid and timestamps.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub event_id: String,
    pub listing_id: Uuid,
    pub listing_name: String,
    pub listing_hours: f64,
    pub checkin_date: DateTime<Utc>,
    pub checkout_date: DateTime<Utc>,
    pub checkout_type: CheckoutType,
    pub checkout_time: NaiveTime,
    pub event_type: EventType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "change_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Modified,
    Cancelled,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::Modified => write!(f, "modified"),
            ChangeType::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Append-only audit row for a booking modification or cancellation.
/// Deduplicated on the full tuple of fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub listing_name: String,
    pub event_id: String,
    pub change_type: ChangeType,
    pub old_checkin_date: NaiveDate,
    pub old_checkout_date: NaiveDate,
    pub new_checkin_date: Option<NaiveDate>,
    pub new_checkout_date: Option<NaiveDate>,
    pub old_event_id: Option<String>,
}

impl ChangeRecord {
    pub fn cancelled(booking: &Booking) -> Self {
        Self {
            listing_name: booking.listing_name.clone(),
            event_id: booking.event_id.clone(),
            change_type: ChangeType::Cancelled,
            old_checkin_date: booking.checkin_day(),
            old_checkout_date: booking.checkout_day(),
            new_checkin_date: None,
            new_checkout_date: None,
            old_event_id: None,
        }
    }

    pub fn modified(old: &Booking, new: &RawEvent) -> Self {
        Self {
            listing_name: old.listing_name.clone(),
            event_id: new.id.clone(),
            change_type: ChangeType::Modified,
            old_checkin_date: old.checkin_day(),
            old_checkout_date: old.checkout_day(),
            new_checkin_date: Some(new.checkin_day()),
            new_checkout_date: Some(new.checkout_day()),
            old_event_id: Some(old.event_id.clone()),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CleanerAssignment {
    pub uuid: Uuid,
    pub event_uuid: Uuid,
    pub cleaner_uuid: Uuid,
    pub hours: f64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sync_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Single,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sync_trigger", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Manual,
    Automatic,
    Cron,
}

impl std::fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggeredBy::Manual => write!(f, "manual"),
            TriggeredBy::Automatic => write!(f, "automatic"),
            TriggeredBy::Cron => write!(f, "cron"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sync_session_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    InProgress,
    Completed,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::InProgress => write!(f, "in_progress"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

/// Aggregate counters for a sync session or a single reconcile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct SyncCounters {
    pub listings: i64,
    pub completed_listings: i64,
    pub events_processed: i64,
    pub feeds_processed: i64,
    pub added: i64,
    pub updated: i64,
    pub deactivated: i64,
    pub replaced: i64,
    pub unchanged: i64,
    pub errors: i64,
}

impl SyncCounters {
    pub fn merge(&mut self, other: &SyncCounters) {
        self.listings += other.listings;
        self.completed_listings += other.completed_listings;
        self.events_processed += other.events_processed;
        self.feeds_processed += other.feeds_processed;
        self.added += other.added;
        self.updated += other.updated;
        self.deactivated += other.deactivated;
        self.replaced += other.replaced;
        self.unchanged += other.unchanged;
        self.errors += other.errors;
    }
}

/// One logical sync run, single-listing or all-listings.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: Uuid,
    pub sync_type: SyncType,
    pub target_listing_id: Option<Uuid>,
    pub target_listing_name: Option<String>,
    pub triggered_by: TriggeredBy,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub totals: SyncCounters,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSyncSession {
    pub sync_type: SyncType,
    pub target_listing_id: Option<Uuid>,
    pub target_listing_name: Option<String>,
    pub triggered_by: TriggeredBy,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sync_operation", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Added,
    Updated,
    Replaced,
    Deactivated,
    Unchanged,
    CheckoutTypeChanged,
    Error,
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOperation::Added => write!(f, "added"),
            SyncOperation::Updated => write!(f, "updated"),
            SyncOperation::Replaced => write!(f, "replaced"),
            SyncOperation::Deactivated => write!(f, "deactivated"),
            SyncOperation::Unchanged => write!(f, "unchanged"),
            SyncOperation::CheckoutTypeChanged => write!(f, "checkout_type_changed"),
            SyncOperation::Error => write!(f, "error"),
        }
    }
}

/// One reconcile decision, recorded with enough context to replay it.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub sync_session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub operation: SyncOperation,
    pub event_id: Option<String>,
    pub listing_name: String,
    pub event_details: serde_json::Value,
    pub reasoning: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub sync_session_id: Uuid,
    pub operation: SyncOperation,
    pub event_id: Option<String>,
    pub listing_name: String,
    pub event_details: serde_json::Value,
    pub reasoning: String,
    pub metadata: serde_json::Value,
}
