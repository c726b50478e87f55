//! Upstream event sources (congress.gov API, recorded fixtures) + detail normalization.

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hwatch_core::{EventShell, ListingKind, RawListingEntry, DEFAULT_STATUS, UNKNOWN_COMMITTEE};
use hwatch_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "hwatch-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed payload: {0}")]
    Payload(String),
}

/// Detail object of a hearing or committee meeting, unwrapped from its payload envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetail {
    pub body: JsonValue,
}

impl RawDetail {
    pub fn new(body: JsonValue) -> Self {
        Self { body }
    }

    /// Picks `hearing`, else `committeeMeeting`; an empty or absent object means not found.
    pub fn from_payload(payload: &JsonValue) -> Option<Self> {
        ["hearing", "committeeMeeting"]
            .iter()
            .filter_map(|key| payload.get(*key))
            .find(|v| v.as_object().is_some_and(|o| !o.is_empty()))
            .map(|v| Self::new(v.clone()))
    }
}

#[async_trait]
pub trait EventSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_listing(&self, kind: ListingKind) -> Result<ListingPage, SourceError>;

    /// `Ok(None)` when the detail does not exist or came back empty.
    async fn fetch_detail(&self, api_ref: &str) -> Result<Option<RawDetail>, SourceError>;
}

pub fn listing_key(kind: ListingKind) -> &'static str {
    match kind {
        ListingKind::Hearing => "hearings",
        ListingKind::Meeting => "committeeMeetings",
    }
}

fn listing_path_segment(kind: ListingKind) -> &'static str {
    match kind {
        ListingKind::Hearing => "hearing",
        ListingKind::Meeting => "committee-meeting",
    }
}

/// One listing as fetched: the decodable entries plus how many were not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    pub entries: Vec<RawListingEntry>,
    pub undecodable: usize,
}

/// Decode the entries under the listing key. A payload without that array is an error;
/// entries that fail to decode are logged and counted.
pub fn decode_listing(kind: ListingKind, payload: &JsonValue) -> Result<ListingPage, SourceError> {
    let key = listing_key(kind);
    let Some(entries) = payload.get(key).and_then(|v| v.as_array()) else {
        return Err(SourceError::Payload(format!("no `{key}` array in {kind} listing")));
    };

    let mut page = ListingPage::default();
    for entry in entries {
        match serde_json::from_value::<RawListingEntry>(entry.clone()) {
            Ok(decoded) => page.entries.push(decoded),
            Err(err) => {
                warn!(kind = kind.as_str(), error_kind = "decode", error = %err, "undecodable listing entry");
                page.undecodable += 1;
            }
        }
    }
    Ok(page)
}

fn non_empty_str<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value
        .get(key)?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn entry_at<'a>(value: &'a JsonValue, array_key: &str, index: usize) -> Option<&'a JsonValue> {
    value.get(array_key)?.as_array()?.get(index)
}

fn has_entries(value: &JsonValue, array_key: &str) -> bool {
    value
        .get(array_key)
        .and_then(|v| v.as_array())
        .is_some_and(|arr| !arr.is_empty())
}

pub fn resolve_date_raw(detail: &JsonValue) -> Option<String> {
    non_empty_str(detail, "date")
        .or_else(|| entry_at(detail, "dates", 0).and_then(|d| non_empty_str(d, "date")))
        .map(ToString::to_string)
}

pub fn resolve_title(detail: &JsonValue) -> String {
    detail
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

pub fn resolve_committee(detail: &JsonValue) -> String {
    non_empty_str(detail, "committeeName")
        .or_else(|| entry_at(detail, "committees", 0).and_then(|c| non_empty_str(c, "name")))
        .unwrap_or(UNKNOWN_COMMITTEE)
        .to_string()
}

/// `meetingDocuments[0].url`, else `formats[1].url`. Index 1 of `formats` is the
/// document upstream publishes after the formatted-text rendition.
pub fn resolve_url(detail: &JsonValue) -> Option<String> {
    if has_entries(detail, "meetingDocuments") {
        return entry_at(detail, "meetingDocuments", 0)
            .and_then(|d| non_empty_str(d, "url"))
            .map(ToString::to_string);
    }
    entry_at(detail, "formats", 1)
        .and_then(|f| non_empty_str(f, "url"))
        .map(ToString::to_string)
}

pub fn resolve_status(detail: &JsonValue) -> String {
    non_empty_str(detail, "meetingStatus")
        .or_else(|| non_empty_str(detail, "status"))
        .unwrap_or(DEFAULT_STATUS)
        .to_string()
}

pub fn normalize_detail(detail: &RawDetail) -> EventShell {
    let body = &detail.body;
    EventShell {
        date_raw: resolve_date_raw(body),
        title: resolve_title(body),
        committee: resolve_committee(body),
        url: resolve_url(body),
        status: resolve_status(body),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CongressApiConfig {
    pub base_url: String,
    pub congress: u32,
    pub listing_limit: u32,
    pub meeting_status: String,
}

impl Default for CongressApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.congress.gov/v3".to_string(),
            congress: 119,
            listing_limit: 250,
            meeting_status: DEFAULT_STATUS.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct CongressApiSource {
    http: HttpFetcher,
    config: CongressApiConfig,
}

impl CongressApiSource {
    pub fn new(http: HttpFetcher, config: CongressApiConfig) -> Self {
        Self { http, config }
    }

    pub fn listing_url(&self, kind: ListingKind) -> String {
        format!(
            "{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            listing_path_segment(kind),
            self.config.congress
        )
    }
}

#[async_trait]
impl EventSource for CongressApiSource {
    fn source_id(&self) -> &'static str {
        "congress-api"
    }

    async fn fetch_listing(&self, kind: ListingKind) -> Result<ListingPage, SourceError> {
        let url = self.listing_url(kind);
        let query = [
            ("meetingStatus", self.config.meeting_status.clone()),
            ("limit", self.config.listing_limit.to_string()),
        ];
        let payload = self.http.fetch_json(&url, &query).await?;
        decode_listing(kind, &payload)
    }

    async fn fetch_detail(&self, api_ref: &str) -> Result<Option<RawDetail>, SourceError> {
        let payload = self.http.fetch_json(api_ref, &[]).await?;
        Ok(RawDetail::from_payload(&payload))
    }
}

/// Serves listings and details from a recorded bundle instead of the live API.
///
/// Bundle layout: `hearings` and `committeeMeetings` listing arrays plus a `details`
/// object mapping each detail reference to its full payload.
#[derive(Debug)]
pub struct FixtureSource {
    fixture_id: String,
    root: JsonValue,
    detail_requests: Mutex<Vec<String>>,
}

impl FixtureSource {
    pub fn from_value(root: JsonValue) -> Self {
        let fixture_id = root
            .get("fixture_id")
            .and_then(|v| v.as_str())
            .unwrap_or("inline")
            .to_string();
        Self {
            fixture_id,
            root,
            detail_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn fixture_id(&self) -> &str {
        &self.fixture_id
    }

    /// Every detail reference requested so far, in request order.
    pub fn detail_requests(&self) -> Vec<String> {
        self.detail_requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureSource> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let root: JsonValue =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    if !root.is_object() {
        anyhow::bail!("fixture bundle {} is not a JSON object", path.display());
    }
    Ok(FixtureSource::from_value(root))
}

#[async_trait]
impl EventSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_listing(&self, kind: ListingKind) -> Result<ListingPage, SourceError> {
        decode_listing(kind, &self.root)
    }

    async fn fetch_detail(&self, api_ref: &str) -> Result<Option<RawDetail>, SourceError> {
        if let Ok(mut requests) = self.detail_requests.lock() {
            requests.push(api_ref.to_string());
        }
        Ok(self
            .root
            .get("details")
            .and_then(|details| details.get(api_ref))
            .and_then(RawDetail::from_payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn sample_bundle_path() -> PathBuf {
        workspace_root()
            .join("fixtures")
            .join("congress")
            .join("sample")
            .join("bundle.json")
    }

    #[test]
    fn meeting_documents_win_over_formats() {
        let detail = json!({
            "meetingDocuments": [{ "url": "https://docs.house.gov/a.pdf" }, { "url": "https://docs.house.gov/b.pdf" }],
            "formats": [{ "url": "https://x/0.htm" }, { "url": "https://x/1.pdf" }]
        });
        assert_eq!(resolve_url(&detail).as_deref(), Some("https://docs.house.gov/a.pdf"));

        // A first document without a URL does not fall through to formats.
        let detail = json!({
            "meetingDocuments": [{ "documentType": "Witness List" }],
            "formats": [{ "url": "https://x/0.htm" }, { "url": "https://x/1.pdf" }]
        });
        assert_eq!(resolve_url(&detail), None);
    }

    #[test]
    fn formats_fallback_takes_second_entry() {
        let detail = json!({
            "meetingDocuments": [],
            "formats": [{ "type": "Formatted Text", "url": "https://x/0.htm" }, { "type": "PDF", "url": "https://x/1.pdf" }]
        });
        assert_eq!(resolve_url(&detail).as_deref(), Some("https://x/1.pdf"));

        let no_docs = json!({ "formats": [{ "url": "https://x/0.htm" }, { "url": "https://x/1.pdf" }, { "url": "https://x/2.xml" }] });
        assert_eq!(resolve_url(&no_docs).as_deref(), Some("https://x/1.pdf"));
    }

    #[test]
    fn url_absent_when_nothing_published() {
        assert_eq!(resolve_url(&json!({})), None);
        assert_eq!(resolve_url(&json!({ "formats": [{ "url": "https://x/0.htm" }] })), None);
        assert_eq!(resolve_url(&json!({ "meetingDocuments": [], "formats": [] })), None);
    }

    #[test]
    fn committee_fallback_order() {
        assert_eq!(
            resolve_committee(&json!({ "committeeName": "Rules", "committees": [{ "name": "Other" }] })),
            "Rules"
        );
        assert_eq!(
            resolve_committee(&json!({ "committeeName": "", "committees": [{ "name": "Judiciary" }] })),
            "Judiciary"
        );
        assert_eq!(resolve_committee(&json!({ "committees": [] })), UNKNOWN_COMMITTEE);
        assert_eq!(resolve_committee(&json!({ "committees": [{ "systemCode": "x" }] })), UNKNOWN_COMMITTEE);
    }

    #[test]
    fn date_title_and_status_fallbacks() {
        let meeting = json!({ "date": "2025-06-24T14:00:00Z", "dates": [{ "date": "2025-01-01" }] });
        assert_eq!(resolve_date_raw(&meeting).as_deref(), Some("2025-06-24T14:00:00Z"));

        let hearing = json!({ "dates": [{ "date": "2025-06-25" }, { "date": "2025-06-26" }] });
        assert_eq!(resolve_date_raw(&hearing).as_deref(), Some("2025-06-25"));
        assert_eq!(resolve_date_raw(&json!({ "dates": [] })), None);

        assert_eq!(resolve_title(&json!({})), "");
        assert_eq!(resolve_title(&json!({ "title": "Member Day" })), "Member Day");

        assert_eq!(resolve_status(&json!({})), DEFAULT_STATUS);
        assert_eq!(resolve_status(&json!({ "meetingStatus": "Postponed" })), "Postponed");
        assert_eq!(resolve_status(&json!({ "status": "Canceled" })), "Canceled");
    }

    #[test]
    fn payload_envelope_is_unwrapped() {
        let hearing = RawDetail::from_payload(&json!({ "hearing": { "title": "A" } })).unwrap();
        assert_eq!(hearing.body["title"], "A");

        let meeting =
            RawDetail::from_payload(&json!({ "hearing": {}, "committeeMeeting": { "title": "B" } })).unwrap();
        assert_eq!(meeting.body["title"], "B");

        assert!(RawDetail::from_payload(&json!({ "request": {} })).is_none());
        assert!(RawDetail::from_payload(&json!({ "committeeMeeting": {} })).is_none());
    }

    #[test]
    fn undecodable_listing_entries_are_counted() {
        let payload = json!({
            "committeeMeetings": [
                { "eventId": "1", "url": "https://x/1" },
                { "eventId": ["not", "an", "id"], "url": "https://x/2" },
                { "eventId": 4.5, "url": "https://x/4" },
                { "eventId": 3, "url": null }
            ]
        });
        let page = decode_listing(ListingKind::Meeting, &payload).unwrap();
        let ids = page.entries.iter().filter_map(|e| e.derive_id()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["1".to_string(), "3".to_string()]);
        assert_eq!(page.undecodable, 2);
        assert_eq!(page.entries[1].url, "");
    }

    #[test]
    fn listing_without_its_array_is_malformed() {
        let payload = json!({ "committeeMeetings": [] });
        assert!(decode_listing(ListingKind::Meeting, &payload).unwrap().entries.is_empty());

        let err = decode_listing(ListingKind::Hearing, &payload).unwrap_err();
        assert!(matches!(err, SourceError::Payload(_)));
        assert!(err.to_string().contains("`hearings`"));
    }

    #[test]
    fn listing_urls_follow_congress_endpoints() {
        let http = HttpFetcher::new(Default::default()).unwrap();
        let source = CongressApiSource::new(
            http,
            CongressApiConfig {
                base_url: "https://api.congress.gov/v3/".into(),
                ..Default::default()
            },
        );
        assert_eq!(
            source.listing_url(ListingKind::Hearing),
            "https://api.congress.gov/v3/hearing/119"
        );
        assert_eq!(
            source.listing_url(ListingKind::Meeting),
            "https://api.congress.gov/v3/committee-meeting/119"
        );
    }

    #[tokio::test]
    async fn sample_bundle_normalizes_both_shapes() {
        let source = load_fixture_bundle(sample_bundle_path()).unwrap();
        assert_eq!(source.fixture_id(), "congress-119-2025-06-18");

        let hearings = source.fetch_listing(ListingKind::Hearing).await.unwrap().entries;
        let meetings = source.fetch_listing(ListingKind::Meeting).await.unwrap().entries;
        assert_eq!(hearings.len(), 3);
        assert_eq!(meetings.len(), 6);

        let hearing = source
            .fetch_detail(&hearings[0].url)
            .await
            .unwrap()
            .expect("hearing detail");
        let shell = normalize_detail(&hearing);
        assert_eq!(shell.date_raw.as_deref(), Some("2025-06-25"));
        assert_eq!(shell.committee, "House Energy and Commerce Committee");
        assert_eq!(
            shell.url.as_deref(),
            Some("https://www.congress.gov/119/chrg/CHRG-119hhrg60447/CHRG-119hhrg60447.pdf")
        );
        assert_eq!(shell.status, DEFAULT_STATUS);

        let postponed = source
            .fetch_detail(&meetings[1].url)
            .await
            .unwrap()
            .expect("meeting detail");
        let shell = normalize_detail(&postponed);
        assert_eq!(shell.status, "Postponed");
        assert_eq!(shell.url, None);
        assert_eq!(shell.resolve_date().unwrap().to_string(), "2025-07-01");

        assert!(source.fetch_detail(&meetings[5].url).await.unwrap().is_none());
        assert_eq!(source.detail_requests().len(), 3);
    }
}
