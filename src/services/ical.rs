//! Feed fetching: HTTP retrieval of a published iCalendar feed and
//! normalization of its VEVENTs into [`RawEvent`]s.
//!
//! The engine never sees raw iCal text; it consumes the output of
//! [`FeedFetcher::fetch`] and treats any fetch failure as "no events from
//! this feed".

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use sha1::{Digest, Sha1};
use uuid::Uuid;

use crate::models::RawEvent;

pub const UNKNOWN_LISTING: &str = "Unknown listing";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("feed request failed: {0}")]
    Network(String),
    #[error("feed returned HTTP status {0}")]
    HttpStatus(u16),
    #[error("feed could not be parsed: {0}")]
    Parse(String),
}

/// A normalized feed snapshot within the requested window.
#[derive(Debug, Clone, Default)]
pub struct FetchedFeed {
    pub events: Vec<RawEvent>,
    /// Best-effort calendar name; the reconciler overwrites each event's
    /// `listing` with the owning listing's name regardless.
    pub detected_listing_name: String,
}

#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(
        &self,
        feed_url: &str,
        listing_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<FetchedFeed, FetchError>;
}

pub struct HttpFeedFetcher {
    client: Client,
    timeout: std::time::Duration,
}

impl HttpFeedFetcher {
    pub fn new(client: Client, timeout_seconds: u64) -> Self {
        Self {
            client,
            timeout: std::time::Duration::from_secs(timeout_seconds),
        }
    }

    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let url = url.trim();
        if url::Url::parse(url).is_err() {
            return Err(FetchError::Parse(format!("invalid feed URL: {url}")));
        }

        let resp = self
            .client
            .get(url)
            .timeout(self.timeout)
            .header("Accept", "text/calendar, text/plain;q=0.9, */*;q=0.1")
            .header("User-Agent", "Stayflow/1.0 (+https://stayflow.app)")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Network("feed fetch timed out".to_string())
                } else {
                    FetchError::Network(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        resp.text()
            .await
            .map_err(|e| FetchError::Network(format!("feed body read failed: {e}")))
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(
        &self,
        feed_url: &str,
        listing_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<FetchedFeed, FetchError> {
        let text = self.fetch_text(feed_url).await?;
        let calendar = parse_calendar(&text)?;

        let window_start_day = window_start.date_naive();
        let window_end_day = window_end.date_naive();
        let detected_listing_name = calendar
            .name
            .unwrap_or_else(|| UNKNOWN_LISTING.to_string());

        let events = calendar
            .events
            .into_iter()
            .filter(|event| {
                event.end_date >= window_start_day && event.start_date <= window_end_day
            })
            .map(|event| RawEvent {
                id: event.uid,
                title: event.summary,
                start: midnight_utc(event.start_date),
                end: midnight_utc(event.end_date),
                listing: detected_listing_name.clone(),
            })
            .collect();

        tracing::debug!(feed_url, %listing_id, "Fetched and parsed feed");
        Ok(FetchedFeed {
            events,
            detected_listing_name,
        })
    }
}

fn midnight_utc(day: NaiveDate) -> DateTime<Utc> {
    day.and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc()
}

// ---------------------------------------------------------------------------
// iCalendar parsing
// ---------------------------------------------------------------------------

struct ParsedCalendar {
    name: Option<String>,
    events: Vec<ParsedEvent>,
}

struct ParsedEvent {
    uid: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
    summary: String,
}

#[derive(Debug, Default)]
struct VEventProps {
    uid: Option<String>,
    dtstart: Option<String>,
    dtend: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    status: Option<String>,
}

fn parse_calendar(text: &str) -> Result<ParsedCalendar, FetchError> {
    let lines = unfold_lines(text);
    if !lines
        .iter()
        .any(|line| line.eq_ignore_ascii_case("BEGIN:VCALENDAR"))
    {
        return Err(FetchError::Parse("no VCALENDAR block".to_string()));
    }

    let mut name = None;
    let mut events = Vec::new();
    let mut current: Option<VEventProps> = None;

    for line in &lines {
        let upper = line.to_uppercase();
        if upper == "BEGIN:VEVENT" {
            current = Some(VEventProps::default());
            continue;
        }
        if upper == "END:VEVENT" {
            if let Some(props) = current.take() {
                if let Some(event) = finish_event(props) {
                    events.push(event);
                }
            }
            continue;
        }

        let Some((key, value)) = split_property(line) else {
            continue;
        };

        match current.as_mut() {
            Some(props) => {
                let slot = match key.as_str() {
                    "UID" => &mut props.uid,
                    "DTSTART" => &mut props.dtstart,
                    "DTEND" => &mut props.dtend,
                    "SUMMARY" => &mut props.summary,
                    "DESCRIPTION" => &mut props.description,
                    "STATUS" => &mut props.status,
                    _ => continue,
                };
                // First occurrence wins.
                if slot.is_none() {
                    *slot = Some(value);
                }
            }
            None => {
                if key == "X-WR-CALNAME" && name.is_none() && !value.is_empty() {
                    name = Some(value);
                }
            }
        }
    }

    Ok(ParsedCalendar { name, events })
}

fn finish_event(props: VEventProps) -> Option<ParsedEvent> {
    // A cancelled VEVENT is semantically absent from the feed.
    if props
        .status
        .as_deref()
        .is_some_and(|s| s.eq_ignore_ascii_case("CANCELLED"))
    {
        return None;
    }

    let start_date = parse_ical_date(props.dtstart.as_deref()?)?;
    let end_date = parse_ical_date(props.dtend.as_deref()?)?;
    if end_date <= start_date {
        return None;
    }

    let summary = props.summary.unwrap_or_default().trim().to_string();
    let description = props.description.unwrap_or_default();
    let uid = match props.uid.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        Some(uid) => uid.to_string(),
        None => fallback_uid(start_date, end_date, &summary, &description),
    };

    Some(ParsedEvent {
        uid,
        start_date,
        end_date,
        summary,
    })
}

/// Unfold RFC 5545 folded lines: a continuation line starts with a space or
/// tab and extends the previous content line.
fn unfold_lines(text: &str) -> Vec<String> {
    let mut unfolded: Vec<String> = Vec::new();
    for raw in text.lines() {
        let line = raw.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        }
        if (line.starts_with(' ') || line.starts_with('\t')) && !unfolded.is_empty() {
            if let Some(last) = unfolded.last_mut() {
                last.push_str(&line[1..]);
            }
        } else {
            unfolded.push(line.to_string());
        }
    }
    unfolded
}

/// Split `KEY;PARAM=X:value` into an uppercased key and the value, discarding
/// parameters. Both VALUE=DATE and date-time payloads are handled downstream
/// from the value's YYYYMMDD prefix.
fn split_property(line: &str) -> Option<(String, String)> {
    let colon = line.find(':')?;
    let key_part = &line[..colon];
    let value = line[colon + 1..].trim().to_string();
    let key = key_part
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_uppercase();
    if key.is_empty() {
        return None;
    }
    Some((key, value))
}

fn parse_ical_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.len() < 8 || !value.is_char_boundary(8) {
        return None;
    }
    let yyyymmdd = &value[..8];
    let formatted = format!(
        "{}-{}-{}",
        &yyyymmdd[0..4],
        &yyyymmdd[4..6],
        &yyyymmdd[6..8]
    );
    NaiveDate::parse_from_str(&formatted, "%Y-%m-%d").ok()
}

/// Stable synthetic UID for feeds that omit one.
fn fallback_uid(start: NaiveDate, end: NaiveDate, summary: &str, description: &str) -> String {
    let stable = format!(
        "{}|{}|{}|{}",
        start.format("%Y-%m-%d"),
        end.format("%Y-%m-%d"),
        summary,
        description
    );
    let mut hasher = Sha1::new();
    hasher.update(stable.as_bytes());
    format!("ical-{:x}", hasher.finalize())
}
