//! Per-listing reconciliation: turn the current snapshot of a listing's iCal
//! feeds into booking-table mutations.
//!
//! The pass order is load-bearing. Feeds are fetched in parallel, merged and
//! normalized; the cancellation pass runs before the per-event pass; events
//! are then processed sequentially so each store lookup observes the writes
//! made for earlier events in the same run. A final sweep re-derives checkout
//! types, since replacements can add or remove same-day turnovers for
//! neighbors processed earlier.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::AppResult;
use crate::models::{
    Booking, ChangeRecord, CheckoutType, EventType, Feed, Listing, NewBooking, NewLogEntry,
    RawEvent, SyncCounters, SyncOperation, AVAILABILITY_PLACEHOLDER,
};
use crate::repository::store::BookingStore;
use crate::services::ical::FeedFetcher;
use crate::services::notifier::{
    format_cancellation_alert, format_modification_alert, Notifier,
};

/// Engine knobs, sliced out of [`AppConfig`] so the engine stays independent
/// of the HTTP surface.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub fetch_window_past_days: i64,
    pub fetch_window_future_days: i64,
    pub concurrency: usize,
    pub wall_clock_budget: Option<std::time::Duration>,
    pub default_listing_hours: f64,
    pub default_checkout_time: NaiveTime,
}

impl SyncSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let default_checkout_time = config
            .default_checkout_time
            .parse()
            .unwrap_or_else(|_| NaiveTime::from_hms_opt(10, 0, 0).expect("valid time"));
        Self {
            fetch_window_past_days: config.fetch_window_past_days,
            fetch_window_future_days: config.fetch_window_future_days,
            concurrency: config.sync_concurrency,
            wall_clock_budget: config
                .sync_wall_clock_budget_seconds
                .map(std::time::Duration::from_secs),
            default_listing_hours: config.default_listing_hours,
            default_checkout_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingSyncStatus {
    Success,
    Error,
}

/// Step F result for one listing, plus the buffered log entries for the
/// session logger to flush.
#[derive(Debug)]
pub struct ReconcileOutcome {
    pub listing_id: Uuid,
    pub listing_name: String,
    pub status: ListingSyncStatus,
    pub error: Option<String>,
    pub counters: SyncCounters,
    pub entries: Vec<NewLogEntry>,
}

impl ReconcileOutcome {
    pub fn is_success(&self) -> bool {
        self.status == ListingSyncStatus::Success
    }

    pub fn take_entries(&mut self) -> Vec<NewLogEntry> {
        std::mem::take(&mut self.entries)
    }

    pub fn failed(listing_id: Uuid, listing_name: String, message: String) -> Self {
        Self {
            listing_id,
            listing_name,
            status: ListingSyncStatus::Error,
            error: Some(message),
            counters: SyncCounters {
                listings: 1,
                errors: 1,
                ..Default::default()
            },
            entries: Vec::new(),
        }
    }
}

struct ReconcileCtx {
    counters: SyncCounters,
    entries: Vec<NewLogEntry>,
    pending_modifications: Vec<(Booking, RawEvent)>,
}

pub struct ListingReconciler {
    store: Arc<dyn BookingStore>,
    fetcher: Arc<dyn FeedFetcher>,
    notifier: Arc<dyn Notifier>,
    settings: SyncSettings,
    session_id: Uuid,
}

impl ListingReconciler {
    pub fn new(
        store: Arc<dyn BookingStore>,
        fetcher: Arc<dyn FeedFetcher>,
        notifier: Arc<dyn Notifier>,
        settings: SyncSettings,
        session_id: Uuid,
    ) -> Self {
        Self {
            store,
            fetcher,
            notifier,
            settings,
            session_id,
        }
    }

    pub async fn reconcile(&self, listing: &Listing, feeds: &[Feed]) -> ReconcileOutcome {
        let mut ctx = ReconcileCtx {
            counters: SyncCounters {
                listings: 1,
                ..Default::default()
            },
            entries: Vec::new(),
            pending_modifications: Vec::new(),
        };

        match self.run(listing, feeds, &mut ctx).await {
            Ok(()) => {
                ctx.counters.completed_listings = 1;
                ReconcileOutcome {
                    listing_id: listing.id,
                    listing_name: listing.name.clone(),
                    status: ListingSyncStatus::Success,
                    error: None,
                    counters: ctx.counters,
                    entries: ctx.entries,
                }
            }
            Err(error) => {
                let message = error.detail_message();
                tracing::error!(
                    listing = %listing.name,
                    error = %message,
                    "Listing reconcile failed"
                );
                ctx.counters.errors += 1;
                ctx.entries.push(self.entry(
                    SyncOperation::Error,
                    None,
                    &listing.name,
                    json!({}),
                    message.clone(),
                ));
                ReconcileOutcome {
                    listing_id: listing.id,
                    listing_name: listing.name.clone(),
                    status: ListingSyncStatus::Error,
                    error: Some(message),
                    counters: ctx.counters,
                    entries: ctx.entries,
                }
            }
        }
    }

    async fn run(
        &self,
        listing: &Listing,
        feeds: &[Feed],
        ctx: &mut ReconcileCtx,
    ) -> AppResult<()> {
        let today = Utc::now().date_naive();

        // Step A: fetch every active feed in parallel.
        let active_feeds: Vec<&Feed> = feeds.iter().filter(|feed| feed.is_active).collect();
        let (merged_raw, fetched_ok) = self.fetch_all(listing, &active_feeds).await;
        ctx.counters.feeds_processed = active_feeds.len() as i64;

        // last_synced reflects the attempt, not its outcome.
        let now = Utc::now();
        for feed in &active_feeds {
            if let Err(error) = self.store.update_feed_last_synced(feed.id, now).await {
                tracing::warn!(
                    feed = %feed.name,
                    error = %error.detail_message(),
                    "Failed to stamp feed last_synced"
                );
            }
        }

        // Step B: merge and normalize. Without at least one successful fetch
        // there is no trustworthy snapshot, so stop before touching bookings;
        // an empty snapshot from a healthy feed is real and flows on to the
        // cancellation pass.
        if !fetched_ok {
            tracing::warn!(listing = %listing.name, "No feed fetched successfully, skipping");
            return Ok(());
        }
        let mut merged: Vec<RawEvent> = merged_raw
            .into_iter()
            .filter(|event| event.title != AVAILABILITY_PLACEHOLDER)
            .collect();
        for event in &mut merged {
            event.listing = listing.name.clone();
        }
        ctx.counters.events_processed = merged.len() as i64;

        // Step C: deactivate future bookings that vanished from the feeds.
        self.cancellation_pass(listing, &merged, today, ctx).await?;

        // Step D: sequential per-event pass; store errors are contained to
        // the event that raised them.
        for event in &merged {
            if let Err(error) = self.process_event(listing, event, &merged, today, ctx).await {
                let message = error.detail_message();
                tracing::warn!(
                    listing = %listing.name,
                    event_id = %event.id,
                    error = %message,
                    "Event reconcile failed, continuing with next event"
                );
                ctx.counters.errors += 1;
                ctx.entries.push(self.entry(
                    SyncOperation::Error,
                    Some(&event.id),
                    &listing.name,
                    event_details(event),
                    message,
                ));
            }
        }

        if !ctx.pending_modifications.is_empty() {
            let (title, body) = format_modification_alert(&ctx.pending_modifications);
            self.notifier.send(&title, &body).await;
        }

        // Step E: replacements may have created or removed turnovers for
        // bookings handled earlier in the pass.
        self.reevaluate_checkout_types(listing, &merged, ctx).await?;

        Ok(())
    }

    /// Step A. Failed fetches collapse to "no events from this feed".
    async fn fetch_all(
        &self,
        listing: &Listing,
        feeds: &[&Feed],
    ) -> (Vec<RawEvent>, bool) {
        let window_start = Utc::now() - Duration::days(self.settings.fetch_window_past_days);
        let window_end = Utc::now() + Duration::days(self.settings.fetch_window_future_days);

        let mut handles = Vec::with_capacity(feeds.len());
        for feed in feeds {
            let fetcher = Arc::clone(&self.fetcher);
            let url = feed.url.clone();
            let feed_name = feed.name.clone();
            let listing_id = listing.id;
            handles.push(tokio::spawn(async move {
                let result = fetcher.fetch(&url, listing_id, window_start, window_end).await;
                (feed_name, result)
            }));
        }

        let mut merged = Vec::new();
        let mut fetched_ok = false;
        for handle in handles {
            match handle.await {
                Ok((_, Ok(fetched))) => {
                    fetched_ok = true;
                    merged.extend(fetched.events);
                }
                Ok((feed_name, Err(error))) => {
                    tracing::warn!(
                        listing = %listing.name,
                        feed = %feed_name,
                        error = %error,
                        "Feed fetch failed, treating as empty"
                    );
                }
                Err(join_error) => {
                    tracing::error!(
                        listing = %listing.name,
                        error = %join_error,
                        "Feed fetch task panicked, treating as empty"
                    );
                }
            }
        }
        (merged, fetched_ok)
    }

    /// Step C. Past bookings are frozen; everything else still active but
    /// absent from the snapshot is deactivated in one batch, assignments
    /// cascaded, and newly recorded cancellations notified.
    async fn cancellation_pass(
        &self,
        listing: &Listing,
        merged: &[RawEvent],
        today: NaiveDate,
        ctx: &mut ReconcileCtx,
    ) -> AppResult<()> {
        let existing = self.store.list_active_bookings(&listing.name).await?;
        let merged_ids: HashSet<&str> = merged.iter().map(|event| event.id.as_str()).collect();
        let merged_spans: HashSet<(NaiveDate, NaiveDate)> = merged
            .iter()
            .map(|event| (event.checkin_day(), event.checkout_day()))
            .collect();

        let mut to_deactivate = Vec::new();
        let mut newly_cancelled = Vec::new();
        for booking in existing {
            if booking.checkout_day() < today {
                continue;
            }
            if merged_ids.contains(booking.event_id.as_str()) {
                continue;
            }
            // An incoming event covering exactly this stay is a replacement
            // under a new event id, not a cancellation; the per-event pass
            // handles it.
            if merged_spans.contains(&(booking.checkin_day(), booking.checkout_day())) {
                continue;
            }

            let record = ChangeRecord::cancelled(&booking);
            if self.store.insert_change_record(&record).await? {
                newly_cancelled.push(booking.clone());
            }
            ctx.entries.push(self.entry(
                SyncOperation::Deactivated,
                Some(&booking.event_id),
                &listing.name,
                booking_details(&booking),
                "Event no longer exists in iCal feed".to_string(),
            ));
            ctx.counters.deactivated += 1;
            to_deactivate.push(booking.uuid);
        }

        if !to_deactivate.is_empty() {
            self.store.deactivate_bookings(&to_deactivate).await?;
            self.store
                .deactivate_assignments_for_bookings(&to_deactivate)
                .await?;
        }
        if !newly_cancelled.is_empty() {
            let (title, body) = format_cancellation_alert(&newly_cancelled);
            self.notifier.send(&title, &body).await;
        }
        Ok(())
    }

    /// Step D for one event: dispatch on the four exclusive cases.
    async fn process_event(
        &self,
        listing: &Listing,
        event: &RawEvent,
        merged: &[RawEvent],
        today: NaiveDate,
        ctx: &mut ReconcileCtx,
    ) -> AppResult<()> {
        let checkout_type = self
            .determine_checkout_type(event, &listing.name, merged)
            .await?;

        // Both lookups hit the live store so mutations made for earlier
        // events in this same pass are visible.
        let by_id = self.store.find_active_booking_by_event_id(&event.id).await?;
        let by_dates = self
            .store
            .find_active_bookings_by_date_range(
                &listing.name,
                event.checkin_day(),
                event.checkout_day(),
            )
            .await?
            .into_iter()
            .next();

        // A matched booking that already checked out is frozen: no case may
        // rewrite or replace it.
        let frozen = by_id
            .as_ref()
            .or(by_dates.as_ref())
            .is_some_and(|booking| booking.checkout_day() < today);
        if frozen {
            ctx.counters.unchanged += 1;
            ctx.entries.push(self.entry(
                SyncOperation::Unchanged,
                Some(&event.id),
                &listing.name,
                event_details(event),
                "Past booking is frozen".to_string(),
            ));
            return Ok(());
        }

        match (by_id, by_dates) {
            // Case 1: same stay, new event id. The old row is replaced
            // without a change record; its event id is simply gone.
            (None, Some(old)) if old.event_id != event.id => {
                self.deactivate_one(&old).await?;
                self.store
                    .insert_booking(self.new_booking(listing, event, checkout_type))
                    .await?;
                ctx.counters.replaced += 1;
                ctx.entries.push(self.entry(
                    SyncOperation::Replaced,
                    Some(&event.id),
                    &listing.name,
                    json!({
                        "old_event_id": old.event_id,
                        "new": event_details(event),
                    }),
                    format!(
                        "Event id changed from {} to {} for the same dates",
                        old.event_id, event.id
                    ),
                ));
            }
            // Case 2: same event id, new dates. Deactivate + reinsert, with
            // a modification record and notification when it is new.
            (Some(old), _)
                if old.checkin_day() != event.checkin_day()
                    || old.checkout_day() != event.checkout_day() =>
            {
                let record = ChangeRecord::modified(&old, event);
                if self.store.insert_change_record(&record).await? {
                    ctx.pending_modifications.push((old.clone(), event.clone()));
                }
                self.deactivate_one(&old).await?;
                self.store
                    .insert_booking(self.new_booking(listing, event, checkout_type))
                    .await?;
                ctx.counters.replaced += 1;
                ctx.entries.push(self.entry(
                    SyncOperation::Replaced,
                    Some(&event.id),
                    &listing.name,
                    json!({
                        "old_checkin": old.checkin_day().to_string(),
                        "old_checkout": old.checkout_day().to_string(),
                        "new": event_details(event),
                    }),
                    "Booking dates changed in iCal feed".to_string(),
                ));
            }
            // Case 3: same booking, same dates.
            (by_id, by_dates) if by_id.is_some() || by_dates.is_some() => {
                let existing = by_id.or(by_dates).expect("one side is present");
                if existing.checkout_type != checkout_type {
                    self.store
                        .update_booking_checkout_type(existing.uuid, checkout_type)
                        .await?;
                    ctx.counters.updated += 1;
                    ctx.entries.push(self.entry(
                        SyncOperation::CheckoutTypeChanged,
                        Some(&event.id),
                        &listing.name,
                        event_details(event),
                        format!(
                            "Checkout type changed from {} to {}",
                            existing.checkout_type, checkout_type
                        ),
                    ));
                } else {
                    ctx.counters.unchanged += 1;
                    ctx.entries.push(self.entry(
                        SyncOperation::Unchanged,
                        Some(&event.id),
                        &listing.name,
                        event_details(event),
                        "Booking already up to date".to_string(),
                    ));
                }
            }
            // Case 4: unknown booking; insert unless it overlaps an existing
            // stay (a turnover boundary is not an overlap).
            _ => {
                let active = self.store.list_active_bookings(&listing.name).await?;
                let overlaps = active.iter().any(|booking| {
                    booking.overlaps_days(event.checkin_day(), event.checkout_day())
                });
                if overlaps {
                    ctx.counters.unchanged += 1;
                    ctx.entries.push(self.entry(
                        SyncOperation::Unchanged,
                        Some(&event.id),
                        &listing.name,
                        event_details(event),
                        "Skipped: overlap with an existing active booking".to_string(),
                    ));
                } else {
                    self.store
                        .insert_booking(self.new_booking(listing, event, checkout_type))
                        .await?;
                    ctx.counters.added += 1;
                    ctx.entries.push(self.entry(
                        SyncOperation::Added,
                        Some(&event.id),
                        &listing.name,
                        event_details(event),
                        "New booking from iCal feed".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Same-day turnover derivation: the merged batch is consulted before the
    /// store so events landing in this run shape their neighbors' types
    /// before Step E's sweep.
    async fn determine_checkout_type(
        &self,
        event: &RawEvent,
        listing_name: &str,
        merged: &[RawEvent],
    ) -> AppResult<CheckoutType> {
        let day = event.checkout_day();
        let in_batch = merged.iter().any(|other| {
            other.id != event.id && other.checkin_day() == day && other.checkout_day() != day
        });
        if in_batch {
            return Ok(CheckoutType::SameDay);
        }

        let in_store = self
            .store
            .find_active_bookings_by_checkin_date(listing_name, day)
            .await?
            .iter()
            .any(|booking| booking.event_id != event.id && booking.checkout_day() != day);
        Ok(if in_store {
            CheckoutType::SameDay
        } else {
            CheckoutType::Open
        })
    }

    /// Step E. Re-derive every active booking's checkout type against the
    /// final state of this run.
    async fn reevaluate_checkout_types(
        &self,
        listing: &Listing,
        merged: &[RawEvent],
        ctx: &mut ReconcileCtx,
    ) -> AppResult<()> {
        let today = Utc::now().date_naive();
        let active = self.store.list_active_bookings(&listing.name).await?;
        for booking in active {
            if booking.checkout_day() < today {
                continue;
            }
            let day = booking.checkout_day();
            let in_batch = merged.iter().any(|event| {
                event.id != booking.event_id
                    && event.checkin_day() == day
                    && event.checkout_day() != day
            });
            let computed = if in_batch {
                CheckoutType::SameDay
            } else {
                let in_store = self
                    .store
                    .find_active_bookings_by_checkin_date(&listing.name, day)
                    .await?
                    .iter()
                    .any(|other| other.uuid != booking.uuid && other.checkout_day() != day);
                if in_store {
                    CheckoutType::SameDay
                } else {
                    CheckoutType::Open
                }
            };

            if computed != booking.checkout_type {
                self.store
                    .update_booking_checkout_type(booking.uuid, computed)
                    .await?;
                ctx.counters.updated += 1;
                ctx.entries.push(self.entry(
                    SyncOperation::CheckoutTypeChanged,
                    Some(&booking.event_id),
                    &listing.name,
                    booking_details(&booking),
                    format!(
                        "Checkout type re-evaluated from {} to {}",
                        booking.checkout_type, computed
                    ),
                ));
            }
        }
        Ok(())
    }

    async fn deactivate_one(&self, booking: &Booking) -> AppResult<()> {
        let uuids = [booking.uuid];
        self.store.deactivate_bookings(&uuids).await?;
        self.store
            .deactivate_assignments_for_bookings(&uuids)
            .await?;
        Ok(())
    }

    fn new_booking(
        &self,
        listing: &Listing,
        event: &RawEvent,
        checkout_type: CheckoutType,
    ) -> NewBooking {
        NewBooking {
            event_id: event.id.clone(),
            listing_id: listing.id,
            listing_name: listing.name.clone(),
            listing_hours: listing.hours_or(self.settings.default_listing_hours),
            checkin_date: event.start,
            checkout_date: event.end,
            checkout_type,
            checkout_time: self.settings.default_checkout_time,
            event_type: EventType::Ical,
        }
    }

    fn entry(
        &self,
        operation: SyncOperation,
        event_id: Option<&str>,
        listing_name: &str,
        event_details: serde_json::Value,
        reasoning: String,
    ) -> NewLogEntry {
        NewLogEntry {
            sync_session_id: self.session_id,
            operation,
            event_id: event_id.map(ToOwned::to_owned),
            listing_name: listing_name.to_string(),
            event_details,
            reasoning,
            metadata: json!({}),
        }
    }
}

fn event_details(event: &RawEvent) -> serde_json::Value {
    json!({
        "event_id": event.id,
        "title": event.title,
        "checkin": event.checkin_day().to_string(),
        "checkout": event.checkout_day().to_string(),
    })
}

fn booking_details(booking: &Booking) -> serde_json::Value {
    json!({
        "event_id": booking.event_id,
        "checkin": booking.checkin_day().to_string(),
        "checkout": booking.checkout_day().to_string(),
        "checkout_type": booking.checkout_type,
    })
}
