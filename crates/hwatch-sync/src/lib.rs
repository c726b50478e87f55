//! Sync passes over the congress.gov listings: new-event ingestion, status refresh
//! and URL backfill, plus the configuration and denylist they run with.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use hwatch_adapters::{
    load_fixture_bundle, normalize_detail, CongressApiConfig, CongressApiSource, EventSource,
    SourceError,
};
use hwatch_core::{format_date, Event, EventShell, ExternalId, ListingKind};
use hwatch_report::{format_grouped, new_events_digest, DigestRow};
use hwatch_storage::{EventStore, FieldUpdate, HttpClientConfig, HttpFetcher, SqliteEventStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hwatch-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub api_key: Option<String>,
    pub api: CongressApiConfig,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub denylist_path: PathBuf,
    /// When set, each sync run writes `<dir>/<run_id>/` reports.
    pub reports_dir: Option<PathBuf>,
    /// When set, listings and details are served from this bundle instead of the API.
    pub fixtures_path: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let api_defaults = CongressApiConfig::default();

        Self {
            database_url: var("DATABASE_URL").unwrap_or_else(|| "sqlite://hearings.db".to_string()),
            api_key: var("CONGRESS_API_KEY"),
            api: CongressApiConfig {
                base_url: var("HWATCH_API_BASE").unwrap_or(api_defaults.base_url),
                congress: var("HWATCH_CONGRESS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(api_defaults.congress),
                listing_limit: var("HWATCH_LISTING_LIMIT")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(api_defaults.listing_limit),
                meeting_status: api_defaults.meeting_status,
            },
            user_agent: var("HWATCH_USER_AGENT").unwrap_or_else(|| "hwatch-bot/0.1".to_string()),
            http_timeout_secs: var("HWATCH_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            denylist_path: var("HWATCH_DENYLIST")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("denylist.yaml")),
            reports_dir: var("HWATCH_REPORTS_DIR").map(PathBuf::from),
            fixtures_path: var("HWATCH_FIXTURES").map(PathBuf::from),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            api_key: self.api_key.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DenylistFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    entries: Vec<DenylistEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct DenylistEntry {
    id: ExternalId,
    #[serde(default)]
    reason: Option<String>,
}

/// Event ids that are never fetched or stored, each with the reason it was excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Denylist {
    reasons: BTreeMap<String, String>,
}

impl Denylist {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: DenylistFile = serde_yaml::from_str(text).context("parsing denylist yaml")?;
        let mut denylist = Self::default();
        for entry in file.entries {
            let Some(id) = entry.id.to_text() else {
                warn!(error_kind = "config", "ignoring denylist entry with blank id");
                continue;
            };
            denylist.insert(id, entry.reason.unwrap_or_else(|| "unspecified".to_string()));
        }
        Ok(denylist)
    }

    /// A missing file yields an empty denylist.
    pub async fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(text) => {
                let denylist = Self::from_yaml_str(&text)
                    .with_context(|| format!("loading denylist {}", path.display()))?;
                info!(path = %path.display(), entries = denylist.len(), "denylist loaded");
                Ok(denylist)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "no denylist file; nothing excluded");
                Ok(Self::default())
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn insert(&mut self, id: impl Into<String>, reason: impl Into<String>) {
        self.reasons.insert(id.into(), reason.into());
    }

    pub fn reason(&self, id: &str) -> Option<&str> {
        self.reasons.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.reasons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reasons.is_empty()
    }
}

/// Why a single event could not be turned into a fresh detail.
#[derive(Debug, Error)]
enum EventFailure {
    #[error(transparent)]
    Fetch(#[from] SourceError),
    #[error("no detail found at {0}")]
    NotFound(String),
    #[error("listing entry carries no detail reference")]
    MissingRef,
}

impl EventFailure {
    fn kind(&self) -> &'static str {
        match self {
            EventFailure::Fetch(_) => "fetch",
            EventFailure::NotFound(_) => "not_found",
            EventFailure::MissingRef => "missing_ref",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub total_seen: usize,
    pub inserted: usize,
    pub skipped_known: usize,
    pub skipped_denylisted: usize,
    pub parse_failures: usize,
    pub fetch_failures: usize,
    pub store_failures: usize,
    pub missing_id: usize,
    /// Listing entries that could not be decoded at all; included in `total_seen`.
    pub undecodable: usize,
}

impl fmt::Display for SyncCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seen={} inserted={} known={} denylisted={} parse_failures={} fetch_failures={} store_failures={} missing_id={} undecodable={}",
            self.total_seen,
            self.inserted,
            self.skipped_known,
            self.skipped_denylisted,
            self.parse_failures,
            self.fetch_failures,
            self.store_failures,
            self.missing_id,
            self.undecodable
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: SyncCounts,
    /// Events inserted by this run dated today or later, in listing order.
    pub new_upcoming: Vec<Event>,
}

impl SyncRunSummary {
    pub fn digest(&self) -> String {
        new_events_digest(&self.new_upcoming)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub id: String,
    pub title: String,
    pub committee: String,
    pub previous_status: String,
    pub status: String,
    pub previous_date: NaiveDate,
    pub date: NaiveDate,
}

impl StatusChange {
    pub fn date_changed(&self) -> bool {
        self.previous_date != self.date
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshSummary {
    pub checked: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub fetch_failures: usize,
    pub parse_failures: usize,
    pub store_failures: usize,
    pub changes: Vec<StatusChange>,
}

impl fmt::Display for RefreshSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "checked={} changed={} unchanged={} fetch_failures={} parse_failures={} store_failures={}",
            self.checked,
            self.changed,
            self.unchanged,
            self.fetch_failures,
            self.parse_failures,
            self.store_failures
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillSummary {
    pub candidates: usize,
    pub filled: usize,
    pub still_missing: usize,
    pub fetch_failures: usize,
    pub store_failures: usize,
}

impl fmt::Display for BackfillSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidates={} filled={} still_missing={} fetch_failures={} store_failures={}",
            self.candidates, self.filled, self.still_missing, self.fetch_failures, self.store_failures
        )
    }
}

/// Status changes grouped by their current date; the status column reads `old → new`.
pub fn status_changes_digest(changes: &[StatusChange]) -> String {
    if changes.is_empty() {
        return "No status changes.".to_string();
    }
    let rows = changes
        .iter()
        .map(|c| {
            DigestRow::new(
                format_date(c.date),
                &c.committee,
                &c.title,
                None,
                format!("{} → {}", c.previous_status, c.status),
            )
        })
        .collect::<Vec<_>>();
    format!("Status changes ({}):\n{}", changes.len(), format_grouped(&rows))
}

/// Runs the three passes against one source, one store and one denylist.
pub struct Reconciler<'a> {
    source: &'a dyn EventSource,
    store: &'a dyn EventStore,
    denylist: &'a Denylist,
}

impl<'a> Reconciler<'a> {
    pub fn new(source: &'a dyn EventSource, store: &'a dyn EventStore, denylist: &'a Denylist) -> Self {
        Self {
            source,
            store,
            denylist,
        }
    }

    async fn fetch_shell(&self, api_ref: &str) -> Result<EventShell, EventFailure> {
        if api_ref.trim().is_empty() {
            return Err(EventFailure::MissingRef);
        }
        let detail = self
            .source
            .fetch_detail(api_ref)
            .await?
            .ok_or_else(|| EventFailure::NotFound(api_ref.to_string()))?;
        Ok(normalize_detail(&detail))
    }

    /// Ingests every listing entry not yet stored. Only a listing fetch failure aborts.
    pub async fn sync(&self, today: NaiveDate, now: DateTime<Utc>) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_run", %run_id, source = self.source.source_id());

        async {
            let mut counts = SyncCounts::default();
            let mut listing = Vec::new();
            for kind in ListingKind::ALL {
                let page = self
                    .source
                    .fetch_listing(kind)
                    .await
                    .with_context(|| format!("fetching {kind} listing"))?;
                info!(
                    kind = kind.as_str(),
                    entries = page.entries.len(),
                    undecodable = page.undecodable,
                    "listing fetched"
                );
                counts.total_seen += page.undecodable;
                counts.undecodable += page.undecodable;
                listing.extend(page.entries);
            }

            let mut seen: HashSet<String> = self
                .store
                .list_known_ids()
                .await
                .context("loading known event ids")?;
            let mut staged = Vec::new();

            for entry in &listing {
                counts.total_seen += 1;
                let Some(id) = entry.derive_id() else {
                    warn!(api_ref = %entry.url, error_kind = "missing_id", "listing entry has neither event id nor jacket number");
                    counts.missing_id += 1;
                    continue;
                };
                if !seen.insert(id.clone()) {
                    counts.skipped_known += 1;
                    continue;
                }
                if let Some(reason) = self.denylist.reason(&id) {
                    info!(event_id = %id, reason, "skipping denylisted event");
                    counts.skipped_denylisted += 1;
                    continue;
                }

                let shell = match self.fetch_shell(&entry.url).await {
                    Ok(shell) => shell,
                    Err(err) => {
                        warn!(event_id = %id, error_kind = err.kind(), error = %err, "detail unavailable");
                        counts.fetch_failures += 1;
                        continue;
                    }
                };
                let date = match shell.resolve_date() {
                    Ok(date) => date,
                    Err(err) => {
                        warn!(event_id = %id, error_kind = "date", raw = ?shell.date_raw, error = %err, "unparseable event date");
                        counts.parse_failures += 1;
                        continue;
                    }
                };
                staged.push(Event::from_shell(id, entry.url.clone(), shell, date, now));
            }

            let outcome = self
                .store
                .insert_events(&staged)
                .await
                .context("inserting staged events")?;
            counts.inserted = outcome.inserted;
            counts.store_failures = outcome.failed.len();

            let failed = outcome
                .failed
                .iter()
                .map(|(id, _)| id.as_str())
                .collect::<HashSet<_>>();
            let new_upcoming = staged
                .iter()
                .filter(|e| e.is_upcoming(today) && !failed.contains(e.id.as_str()))
                .cloned()
                .collect::<Vec<_>>();

            info!(%counts, new_upcoming = new_upcoming.len(), "sync run finished");
            Ok::<_, anyhow::Error>(SyncRunSummary {
                run_id,
                source: self.source.source_id().to_string(),
                started_at,
                finished_at: Utc::now(),
                counts,
                new_upcoming,
            })
        }
        .instrument(span)
        .await
    }

    /// Re-reads status for every upcoming stored event. The date only moves along
    /// with a status change, and an unparseable fresh date leaves the row untouched.
    pub async fn refresh_statuses(&self, today: NaiveDate) -> Result<RefreshSummary> {
        let span = info_span!("refresh_statuses", today = %today);
        async {
            let events = self
                .store
                .query_upcoming(today)
                .await
                .context("loading upcoming events")?;
            let mut summary = RefreshSummary::default();

            for event in events {
                summary.checked += 1;
                let shell = match self.fetch_shell(&event.api_ref).await {
                    Ok(shell) => shell,
                    Err(err) => {
                        warn!(event_id = %event.id, error_kind = err.kind(), error = %err, "refresh fetch failed");
                        summary.fetch_failures += 1;
                        continue;
                    }
                };
                if shell.status == event.status {
                    summary.unchanged += 1;
                    continue;
                }

                let fresh_date = match shell.resolve_date() {
                    Ok(date) => date,
                    Err(err) => {
                        warn!(event_id = %event.id, error_kind = "date", raw = ?shell.date_raw, error = %err, "status changed but fresh date unparseable; row left as is");
                        summary.parse_failures += 1;
                        continue;
                    }
                };
                let update = FieldUpdate {
                    status: Some(shell.status.clone()),
                    date: (format_date(fresh_date) != event.date_string()).then_some(fresh_date),
                    url: None,
                };

                match self.store.update_fields(&event.id, &update).await {
                    Ok(true) => {
                        info!(
                            event_id = %event.id,
                            from = %event.status,
                            to = %shell.status,
                            date = %fresh_date,
                            "status changed"
                        );
                        summary.changes.push(StatusChange {
                            id: event.id,
                            title: event.title,
                            committee: event.committee,
                            previous_status: event.status,
                            status: shell.status,
                            previous_date: event.date,
                            date: fresh_date,
                        });
                    }
                    Ok(false) => {
                        warn!(event_id = %event.id, error_kind = "store", "row vanished before status update");
                        summary.store_failures += 1;
                    }
                    Err(err) => {
                        warn!(event_id = %event.id, error_kind = "store", error = %err, "status update failed");
                        summary.store_failures += 1;
                    }
                }
            }

            summary.changed = summary.changes.len();
            info!(%summary, "refresh finished");
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    /// Fills `url` for upcoming stored events that were inserted without one.
    pub async fn backfill_urls(&self, today: NaiveDate) -> Result<BackfillSummary> {
        let span = info_span!("backfill_urls", today = %today);
        async {
            let candidates = self
                .store
                .query_missing_url(today)
                .await
                .context("loading events without url")?;
            let mut summary = BackfillSummary {
                candidates: candidates.len(),
                ..Default::default()
            };

            for candidate in candidates {
                let shell = match self.fetch_shell(&candidate.api_ref).await {
                    Ok(shell) => shell,
                    Err(err) => {
                        warn!(event_id = %candidate.id, error_kind = err.kind(), error = %err, "backfill fetch failed");
                        summary.fetch_failures += 1;
                        continue;
                    }
                };
                let Some(url) = shell.url else {
                    info!(event_id = %candidate.id, "still no url");
                    summary.still_missing += 1;
                    continue;
                };

                let update = FieldUpdate {
                    url: Some(url.clone()),
                    ..Default::default()
                };
                match self.store.update_fields(&candidate.id, &update).await {
                    Ok(true) => {
                        info!(event_id = %candidate.id, url = %url, "url filled");
                        summary.filled += 1;
                    }
                    Ok(false) => {
                        warn!(event_id = %candidate.id, error_kind = "store", "row vanished before url update");
                        summary.store_failures += 1;
                    }
                    Err(err) => {
                        warn!(event_id = %candidate.id, error_kind = "store", error = %err, "url update failed");
                        summary.store_failures += 1;
                    }
                }
            }

            info!(%summary, "backfill finished");
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }
}

/// Writes `summary.json` and `new_upcoming.md` under `<reports_dir>/<run_id>/`.
pub async fn write_run_report(reports_dir: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;

    let c = &summary.counts;
    let markdown = format!(
        "# Hearing sync {}\n\n- Source: {}\n- Started: {}\n- Finished: {}\n- Seen: {}\n- Inserted: {}\n- Skipped (known): {}\n- Skipped (denylisted): {}\n- Parse failures: {}\n- Fetch failures: {}\n- Store failures: {}\n- Missing id: {}\n- Undecodable: {}\n\n## New upcoming\n\n```\n{}\n```\n",
        summary.run_id,
        summary.source,
        summary.started_at,
        summary.finished_at,
        c.total_seen,
        c.inserted,
        c.skipped_known,
        c.skipped_denylisted,
        c.parse_failures,
        c.fetch_failures,
        c.store_failures,
        c.missing_id,
        c.undecodable,
        summary.digest()
    );
    fs::write(run_dir.join("new_upcoming.md"), markdown)
        .await
        .context("writing new_upcoming.md")?;

    Ok(run_dir)
}

/// Fixture bundle when configured, the live API otherwise.
pub fn build_source(config: &SyncConfig) -> Result<Box<dyn EventSource>> {
    if let Some(path) = &config.fixtures_path {
        let source = load_fixture_bundle(path)?;
        info!(fixture_id = source.fixture_id(), "serving events from fixture bundle");
        return Ok(Box::new(source));
    }
    if config.api_key.is_none() {
        anyhow::bail!("CONGRESS_API_KEY is not set (or point HWATCH_FIXTURES at a bundle)");
    }
    let http = HttpFetcher::new(config.http_client_config())?;
    Ok(Box::new(CongressApiSource::new(http, config.api.clone())))
}

pub async fn open_store(config: &SyncConfig) -> Result<SqliteEventStore> {
    SqliteEventStore::open(&config.database_url)
        .await
        .with_context(|| format!("opening store {}", config.database_url))
}

/// Everything one invocation owns: opened at start, closed at the end.
pub struct SyncRuntime {
    config: SyncConfig,
    store: SqliteEventStore,
    source: Box<dyn EventSource>,
    denylist: Denylist,
}

impl SyncRuntime {
    pub async fn open(config: SyncConfig) -> Result<Self> {
        let source = build_source(&config)?;
        let denylist = Denylist::load(&config.denylist_path).await?;
        let store = open_store(&config).await?;
        Ok(Self::with_parts(config, store, source, denylist))
    }

    pub fn with_parts(
        config: SyncConfig,
        store: SqliteEventStore,
        source: Box<dyn EventSource>,
        denylist: Denylist,
    ) -> Self {
        Self {
            config,
            store,
            source,
            denylist,
        }
    }

    pub fn store(&self) -> &SqliteEventStore {
        &self.store
    }

    pub fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(self.source.as_ref(), &self.store, &self.denylist)
    }

    /// One sync pass, followed by the on-disk report when a reports dir is configured.
    pub async fn sync(&self, today: NaiveDate) -> Result<SyncRunSummary> {
        let summary = self.reconciler().sync(today, Utc::now()).await?;
        if let Some(dir) = &self.config.reports_dir {
            let path = write_run_report(dir, &summary).await?;
            info!(path = %path.display(), "run report written");
        }
        Ok(summary)
    }

    pub async fn refresh_statuses(&self, today: NaiveDate) -> Result<RefreshSummary> {
        self.reconciler().refresh_statuses(today).await
    }

    pub async fn backfill_urls(&self, today: NaiveDate) -> Result<BackfillSummary> {
        self.reconciler().backfill_urls(today).await
    }

    pub async fn close(self) {
        self.store.close().await;
    }
}
