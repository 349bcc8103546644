//! Outbound alerting. Delivery is best-effort: a failed send is logged and
//! never fails the sync that produced it.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde_json::json;

use crate::models::{Booking, RawEvent};

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns whether the message was accepted by the channel.
    async fn send(&self, title: &str, body: &str) -> bool;
}

/// Posts alerts to a Slack incoming webhook.
pub struct SlackNotifier {
    client: Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(client: Client, webhook_url: String) -> Self {
        Self {
            client,
            webhook_url,
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, title: &str, body: &str) -> bool {
        let payload = json!({ "text": format!("*{title}*\n{body}") });
        match self.client.post(&self.webhook_url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "Notifier webhook rejected message");
                false
            }
            Err(error) => {
                tracing::warn!(error = %error, "Notifier webhook request failed");
                false
            }
        }
    }
}

/// Swallows alerts when notifications are disabled or unconfigured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, title: &str, _body: &str) -> bool {
        tracing::debug!(title, "Notifier disabled, dropping alert");
        false
    }
}

fn long_date(day: NaiveDate) -> String {
    day.format("%A, %B %-d, %Y").to_string()
}

pub fn format_cancellation_alert(cancelled: &[Booking]) -> (String, String) {
    let mut body = String::new();
    for booking in cancelled {
        body.push_str(&format!(
            "• {}: check-in {}, check-out {}\n",
            booking.listing_name,
            long_date(booking.checkin_day()),
            long_date(booking.checkout_day()),
        ));
    }
    body.push_str("Please review these changes and take appropriate action.");
    ("Booking cancellations detected".to_string(), body)
}

pub fn format_modification_alert(modified: &[(Booking, RawEvent)]) -> (String, String) {
    let mut body = String::new();
    for (old, new) in modified {
        body.push_str(&format!(
            "Event changed: {}, ID: {}\n\
             OLD: check-in {}, check-out {}\n\
             NEW: check-in {}, check-out {}\n\
             ---\n",
            old.listing_name,
            new.id,
            long_date(old.checkin_day()),
            long_date(old.checkout_day()),
            long_date(new.checkin_day()),
            long_date(new.checkout_day()),
        ));
    }
    ("Booking modifications detected".to_string(), body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CheckoutType, EventType};
    use chrono::{NaiveTime, TimeZone, Utc};
    use uuid::Uuid;

    fn booking() -> Booking {
        Booking {
            uuid: Uuid::new_v4(),
            event_id: "e1".to_string(),
            listing_id: Uuid::new_v4(),
            listing_name: "Loft 12".to_string(),
            listing_hours: 2.0,
            checkin_date: Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 0).unwrap(),
            checkout_date: Utc.with_ymd_and_hms(2024, 6, 14, 0, 0, 0).unwrap(),
            checkout_type: CheckoutType::Open,
            checkout_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            event_type: EventType::Ical,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn cancellation_alert_lists_each_booking_with_long_dates() {
        let (title, body) = format_cancellation_alert(&[booking()]);
        assert_eq!(title, "Booking cancellations detected");
        assert!(body.contains("• Loft 12: check-in Monday, June 10, 2024, check-out Friday, June 14, 2024"));
        assert!(body.ends_with("Please review these changes and take appropriate action."));
    }

    #[test]
    fn modification_alert_shows_old_and_new_blocks() {
        let old = booking();
        let new = RawEvent {
            id: "e1".to_string(),
            title: "Reserved".to_string(),
            start: Utc.with_ymd_and_hms(2024, 6, 11, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap(),
            listing: "Loft 12".to_string(),
        };
        let (_, body) = format_modification_alert(&[(old, new)]);
        assert!(body.contains("Event changed: Loft 12, ID: e1"));
        assert!(body.contains("OLD: check-in Monday, June 10, 2024"));
        assert!(body.contains("NEW: check-in Tuesday, June 11, 2024"));
        assert!(body.contains("---"));
    }
}
