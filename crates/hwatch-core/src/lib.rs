//! Canonical hearing/meeting event model, identifier derivation and date parsing.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "hwatch-core";

/// Committee recorded when upstream names none.
pub const UNKNOWN_COMMITTEE: &str = "Unknown";

/// Status assumed when upstream reports none.
pub const DEFAULT_STATUS: &str = "Scheduled";

/// Canonical stored date form. Lexicographic order equals calendar order.
pub const CANONICAL_DATE_FORMAT: &str = "%Y-%m-%d";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// The two upstream listings an event can come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListingKind {
    Hearing,
    Meeting,
}

impl ListingKind {
    /// Listing order used by a sync run: hearings first, then meetings.
    pub const ALL: [ListingKind; 2] = [ListingKind::Hearing, ListingKind::Meeting];

    pub fn as_str(&self) -> &'static str {
        match self {
            ListingKind::Hearing => "hearing",
            ListingKind::Meeting => "meeting",
        }
    }
}

impl fmt::Display for ListingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream identifiers arrive as either JSON strings or JSON numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalId {
    Number(i64),
    Text(String),
}

impl ExternalId {
    /// Text form of the id; `None` for blank strings.
    pub fn to_text(&self) -> Option<String> {
        match self {
            ExternalId::Number(n) => Some(n.to_string()),
            ExternalId::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
        }
    }
}

/// One entry of a hearing or committee-meeting listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawListingEntry {
    #[serde(default)]
    pub event_id: Option<ExternalId>,
    #[serde(default)]
    pub jacket_number: Option<ExternalId>,
    /// Detail reference (the upstream detail URL); empty when absent or null.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub url: String,
    #[serde(default)]
    pub chamber: Option<String>,
    #[serde(default)]
    pub congress: Option<u32>,
    #[serde(default)]
    pub update_date: Option<String>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Option::<String>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl RawListingEntry {
    /// Stable event id: the event id if present, else the jacket number as text.
    pub fn derive_id(&self) -> Option<String> {
        self.event_id
            .as_ref()
            .and_then(ExternalId::to_text)
            .or_else(|| self.jacket_number.as_ref().and_then(ExternalId::to_text))
    }
}

/// Normalized detail fields before id/reference are attached and the date is parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventShell {
    pub date_raw: Option<String>,
    pub title: String,
    pub committee: String,
    pub url: Option<String>,
    pub status: String,
}

impl EventShell {
    pub fn resolve_date(&self) -> Result<NaiveDate, DateFormatError> {
        match self.date_raw.as_deref() {
            Some(raw) => parse_event_date(raw),
            None => Err(DateFormatError::Missing),
        }
    }
}

/// Canonical persisted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub date: NaiveDate,
    pub title: String,
    pub committee: String,
    pub url: Option<String>,
    pub status: String,
    pub api_ref: String,
    pub inserted_at: DateTime<Utc>,
}

impl Event {
    pub fn from_shell(
        id: impl Into<String>,
        api_ref: impl Into<String>,
        shell: EventShell,
        date: NaiveDate,
        inserted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            date,
            title: shell.title,
            committee: shell.committee,
            url: shell.url,
            status: shell.status,
            api_ref: api_ref.into(),
            inserted_at,
        }
    }

    pub fn date_string(&self) -> String {
        format_date(self.date)
    }

    pub fn is_upcoming(&self, today: NaiveDate) -> bool {
        self.date >= today
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateFormatError {
    #[error("unrecognized date format: {0:?}")]
    Unrecognized(String),
    #[error("no date present in event detail")]
    Missing,
}

/// Parse `YYYY-MM-DDTHH:MM:SSZ` or `YYYY-MM-DD`, in that order, dropping the time of day.
pub fn parse_event_date(raw: &str) -> Result<NaiveDate, DateFormatError> {
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT) {
        return Ok(ts.date());
    }
    NaiveDate::parse_from_str(raw, CANONICAL_DATE_FORMAT)
        .map_err(|_| DateFormatError::Unrecognized(raw.to_string()))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(CANONICAL_DATE_FORMAT).to_string()
}
