//! Grouped plain-text digests of stored hearings and meetings.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use hwatch_core::{Event, DEFAULT_STATUS};
use hwatch_storage::{EventStore, StoreError};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "hwatch-report";

/// One rendered line: `(date, committee, title, url, status)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestRow {
    pub date: String,
    pub committee: String,
    pub title: String,
    pub url: Option<String>,
    pub status: String,
}

impl DigestRow {
    pub fn new(
        date: impl Into<String>,
        committee: impl Into<String>,
        title: impl Into<String>,
        url: Option<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            date: date.into(),
            committee: committee.into(),
            title: title.into(),
            url,
            status: status.into(),
        }
    }
}

impl From<&Event> for DigestRow {
    fn from(event: &Event) -> Self {
        Self {
            date: event.date_string(),
            committee: event.committee.clone(),
            title: event.title.clone(),
            url: event.url.clone(),
            status: event.status.clone(),
        }
    }
}

/// Date headers ascending, one bullet per row, input order kept within a date.
pub fn format_grouped(rows: &[DigestRow]) -> String {
    let mut by_date: BTreeMap<&str, Vec<&DigestRow>> = BTreeMap::new();
    for row in rows {
        by_date.entry(row.date.as_str()).or_default().push(row);
    }

    let mut lines = Vec::new();
    for (date, group) in by_date {
        lines.push(date.to_string());
        for row in group {
            lines.push(format!("• {}: {} | {}", row.status, row.committee, row.title));
        }
        lines.push(String::new());
    }
    lines.join("\n").trim_end().to_string()
}

fn with_heading(heading: String, rows: &[DigestRow]) -> String {
    format!("{heading}\n{}", format_grouped(rows))
}

fn rows_of(events: &[Event]) -> Vec<DigestRow> {
    events.iter().map(DigestRow::from).collect()
}

pub fn new_events_digest(events: &[Event]) -> String {
    if events.is_empty() {
        return "No new upcoming hearings.".to_string();
    }
    with_heading(
        format!("New upcoming hearings ({}):", events.len()),
        &rows_of(events),
    )
}

pub async fn upcoming_digest(store: &dyn EventStore, today: NaiveDate) -> Result<String, StoreError> {
    let events = store.query_upcoming(today).await?;
    if events.is_empty() {
        return Ok("No upcoming hearings.".to_string());
    }
    Ok(with_heading(
        format!("Upcoming hearings ({}):", events.len()),
        &rows_of(&events),
    ))
}

/// Upcoming events from the most recent insertion batch.
pub async fn latest_digest(store: &dyn EventStore, today: NaiveDate) -> Result<String, StoreError> {
    let Some(latest) = store.latest_insertion(today).await? else {
        return Ok("No insertions found.".to_string());
    };
    let events = store
        .query_inserted_since(latest)
        .await?
        .into_iter()
        .filter(|e| e.is_upcoming(today))
        .collect::<Vec<_>>();
    let stamp = latest.format("%Y-%m-%d %H:%M UTC");
    if events.is_empty() {
        return Ok(format!("No upcoming hearings in the batch inserted {stamp}."));
    }
    Ok(with_heading(
        format!("New hearings (inserted {stamp}):"),
        &rows_of(&events),
    ))
}

/// Upcoming events whose status moved away from the default.
pub async fn changed_digest(store: &dyn EventStore, today: NaiveDate) -> Result<String, StoreError> {
    let events = store
        .query_upcoming(today)
        .await?
        .into_iter()
        .filter(|e| e.status != DEFAULT_STATUS)
        .collect::<Vec<_>>();
    if events.is_empty() {
        return Ok("No changed hearings.".to_string());
    }
    Ok(with_heading(
        format!("Changed hearings ({}):", events.len()),
        &rows_of(&events),
    ))
}
