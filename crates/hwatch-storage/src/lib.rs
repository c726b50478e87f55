//! SQLite event store + HTTP fetch utilities for hwatch.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use hwatch_core::{format_date, parse_event_date, Event};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "hwatch-storage";

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const TIMESTAMP_STORAGE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Sent as `X-Api-Key` on every request.
    pub api_key: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            api_key: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

pub fn default_headers(api_key: Option<&str>) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(key) = api_key {
        let mut value = HeaderValue::from_str(key).context("api key is not a valid header value")?;
        value.set_sensitive(true);
        headers.insert(HeaderName::from_static("x-api-key"), value);
    }
    Ok(headers)
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(default_headers(config.api_key.as_deref())?);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    async fn pause_before_retry(&self, attempt: usize) {
        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
    }

    /// GET with bounded retries on 429/5xx, timeouts and connect failures.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let mut attempt = 0usize;
            loop {
                let can_retry = attempt < self.backoff.max_retries;
                let resp = match self.client.get(url).query(query).send().await {
                    Ok(resp) => resp,
                    Err(err)
                        if can_retry
                            && classify_reqwest_error(&err) == RetryDisposition::Retryable =>
                    {
                        warn!(error_kind = "http", error = %err, attempt, "request failed; backing off");
                        self.pause_before_retry(attempt).await;
                        attempt += 1;
                        continue;
                    }
                    Err(err) => return Err(FetchError::Request(err)),
                };

                let status = resp.status();
                let final_url = resp.url().to_string();
                if status.is_success() {
                    return match resp.bytes().await {
                        Ok(body) => Ok(FetchedResponse {
                            final_url,
                            body: body.to_vec(),
                        }),
                        Err(err) => Err(FetchError::Request(err)),
                    };
                }
                if can_retry && classify_status(status) == RetryDisposition::Retryable {
                    warn!(error_kind = "http", status = status.as_u16(), attempt, "transient status; backing off");
                    self.pause_before_retry(attempt).await;
                    attempt += 1;
                    continue;
                }
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
        }
        .instrument(span)
        .await
    }

    pub async fn fetch_json(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        let resp = self.fetch_bytes(url, query).await?;
        serde_json::from_slice(&resp.body).map_err(|source| FetchError::Json {
            url: resp.final_url,
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored row {id} is corrupt: {reason}")]
    CorruptRow { id: String, reason: String },
}

/// Mutable fields of a stored event; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldUpdate {
    pub status: Option<String>,
    pub date: Option<NaiveDate>,
    pub url: Option<String>,
}

impl FieldUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.date.is_none() && self.url.is_none()
    }
}

#[derive(Debug, Default)]
pub struct BatchInsert {
    pub inserted: usize,
    /// Rows whose id was already stored.
    pub ignored: usize,
    pub failed: Vec<(String, StoreError)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingUrl {
    pub id: String,
    pub api_ref: String,
}

/// Persistence contract consumed by the sync passes and digests.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn list_known_ids(&self) -> Result<HashSet<String>, StoreError>;

    /// Idempotent per id: rows for already stored ids are ignored, never duplicated.
    async fn insert_events(&self, batch: &[Event]) -> Result<BatchInsert, StoreError>;

    /// Returns `false` when no row matched or there was nothing to update.
    async fn update_fields(&self, id: &str, update: &FieldUpdate) -> Result<bool, StoreError>;

    async fn query_upcoming(&self, from_date: NaiveDate) -> Result<Vec<Event>, StoreError>;

    async fn query_inserted_since(&self, since: DateTime<Utc>) -> Result<Vec<Event>, StoreError>;

    async fn query_missing_url(&self, from_date: NaiveDate) -> Result<Vec<MissingUrl>, StoreError>;

    async fn latest_insertion(
        &self,
        from_date: NaiveDate,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_STORAGE_FORMAT).to_string()
}

fn parse_timestamp(id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::CorruptRow {
            id: id.to_string(),
            reason: format!("inserted_at {raw:?}: {err}"),
        })
}

fn event_from_row(row: &SqliteRow) -> Result<Event, StoreError> {
    let id: String = row.try_get("id")?;
    let date_raw: String = row.try_get("date")?;
    let date = parse_event_date(&date_raw).map_err(|err| StoreError::CorruptRow {
        id: id.clone(),
        reason: err.to_string(),
    })?;
    let inserted_raw: String = row.try_get("inserted_at")?;
    let inserted_at = parse_timestamp(&id, &inserted_raw)?;
    Ok(Event {
        date,
        title: row.try_get("title")?,
        committee: row.try_get("committee")?,
        url: row.try_get("url")?,
        status: row.try_get("status")?,
        api_ref: row.try_get("api_ref")?,
        inserted_at,
        id,
    })
}

const EVENT_COLUMNS: &str = "id, date, title, committee, url, status, api_ref, inserted_at";

/// One connection that is never recycled; an in-memory database lives only as long as it.
fn single_connection_pool() -> SqlitePoolOptions {
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .max_lifetime(None)
        .idle_timeout(None)
}

/// Event store backed by a single-connection SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    /// Open (creating if needed) the database at `database_url` and run migrations.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = single_connection_pool().connect_with(options).await?;
        Self::from_pool(pool).await
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::open("sqlite::memory:").await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        MIGRATOR.run(&pool).await?;
        info!("event store migrations applied");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    async fn fetch_events(
        &self,
        filter_sql: &str,
        bind: String,
    ) -> Result<Vec<Event>, StoreError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE {filter_sql} ORDER BY date ASC");
        let rows = sqlx::query(&sql).bind(bind).fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn list_known_ids(&self) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query("SELECT id FROM events")
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get::<String, _>("id")?);
        }
        Ok(out)
    }

    async fn insert_events(&self, batch: &[Event]) -> Result<BatchInsert, StoreError> {
        let mut outcome = BatchInsert::default();
        for event in batch {
            let result = sqlx::query(
                r#"
                INSERT INTO events (id, date, title, committee, url, status, api_ref, inserted_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(&event.id)
            .bind(event.date_string())
            .bind(&event.title)
            .bind(&event.committee)
            .bind(&event.url)
            .bind(&event.status)
            .bind(&event.api_ref)
            .bind(format_timestamp(event.inserted_at))
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) if done.rows_affected() > 0 => outcome.inserted += 1,
                Ok(_) => outcome.ignored += 1,
                Err(err) => {
                    warn!(event_id = %event.id, error_kind = "store", error = %err, "insert rejected");
                    outcome.failed.push((event.id.clone(), err.into()));
                }
            }
        }
        Ok(outcome)
    }

    async fn update_fields(&self, id: &str, update: &FieldUpdate) -> Result<bool, StoreError> {
        if update.is_empty() {
            return Ok(false);
        }

        let mut assignments = Vec::new();
        if update.status.is_some() {
            assignments.push("status = ?");
        }
        if update.date.is_some() {
            assignments.push("date = ?");
        }
        if update.url.is_some() {
            assignments.push("url = ?");
        }
        let sql = format!("UPDATE events SET {} WHERE id = ?", assignments.join(", "));

        let mut query = sqlx::query(&sql);
        if let Some(status) = &update.status {
            query = query.bind(status.clone());
        }
        if let Some(date) = update.date {
            query = query.bind(format_date(date));
        }
        if let Some(url) = &update.url {
            query = query.bind(url.clone());
        }
        let done = query.bind(id.to_string()).execute(&self.pool).await?;
        Ok(done.rows_affected() > 0)
    }

    async fn query_upcoming(&self, from_date: NaiveDate) -> Result<Vec<Event>, StoreError> {
        // Canonical dates compare correctly as text.
        self.fetch_events("date >= ?", format_date(from_date)).await
    }

    async fn query_inserted_since(&self, since: DateTime<Utc>) -> Result<Vec<Event>, StoreError> {
        self.fetch_events("inserted_at >= ?", format_timestamp(since))
            .await
    }

    async fn query_missing_url(&self, from_date: NaiveDate) -> Result<Vec<MissingUrl>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, api_ref
              FROM events
             WHERE (url IS NULL OR url = '')
               AND date >= ?
             ORDER BY date ASC
            "#,
        )
        .bind(format_date(from_date))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(MissingUrl {
                id: row.try_get("id")?,
                api_ref: row.try_get("api_ref")?,
            });
        }
        Ok(out)
    }

    async fn latest_insertion(
        &self,
        from_date: NaiveDate,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest: Option<String> =
            sqlx::query_scalar("SELECT MAX(inserted_at) FROM events WHERE date >= ?")
                .bind(format_date(from_date))
                .fetch_one(&self.pool)
                .await?;
        latest
            .map(|raw| parse_timestamp("<latest>", &raw))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hwatch_core::DEFAULT_STATUS;
    use tempfile::tempdir;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 18, h, 0, 0).single().unwrap()
    }

    fn mk_event(id: &str, date: NaiveDate, url: Option<&str>, inserted_at: DateTime<Utc>) -> Event {
        Event {
            id: id.to_string(),
            date,
            title: format!("Hearing {id}"),
            committee: "Committee on Rules".to_string(),
            url: url.map(ToString::to_string),
            status: DEFAULT_STATUS.to_string(),
            api_ref: format!("https://api.congress.gov/v3/committee-meeting/119/house/{id}"),
            inserted_at,
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent_per_id() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        let batch = vec![
            mk_event("1", ymd(2025, 6, 20), None, at(8)),
            mk_event("2", ymd(2025, 6, 21), Some("https://x/doc.pdf"), at(8)),
        ];

        let first = store.insert_events(&batch).await.unwrap();
        assert_eq!(first.inserted, 2);
        assert_eq!(first.ignored, 0);
        assert!(first.failed.is_empty());

        let second = store.insert_events(&batch).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.ignored, 2);

        let ids = store.list_known_ids().await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("1") && ids.contains("2"));
    }

    #[tokio::test]
    async fn upcoming_filters_and_orders_by_date() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        store
            .insert_events(&[
                mk_event("late", ymd(2025, 7, 1), None, at(8)),
                mk_event("past", ymd(2025, 6, 1), None, at(8)),
                mk_event("today", ymd(2025, 6, 18), None, at(8)),
            ])
            .await
            .unwrap();

        let upcoming = store.query_upcoming(ymd(2025, 6, 18)).await.unwrap();
        let ids = upcoming.iter().map(|e| e.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["today", "late"]);
        assert_eq!(upcoming[0].inserted_at, at(8));
        assert_eq!(upcoming[0].committee, "Committee on Rules");
    }

    #[tokio::test]
    async fn update_fields_touches_only_requested_columns() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        store
            .insert_events(&[mk_event("1", ymd(2025, 6, 20), None, at(8))])
            .await
            .unwrap();

        let changed = store
            .update_fields(
                "1",
                &FieldUpdate {
                    status: Some("Postponed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(changed);

        let changed = store
            .update_fields(
                "1",
                &FieldUpdate {
                    date: Some(ymd(2025, 6, 27)),
                    url: Some("https://x/new.pdf".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(changed);

        let event = store.query_upcoming(ymd(2025, 6, 1)).await.unwrap().remove(0);
        assert_eq!(event.status, "Postponed");
        assert_eq!(event.date, ymd(2025, 6, 27));
        assert_eq!(event.url.as_deref(), Some("https://x/new.pdf"));
        assert_eq!(event.title, "Hearing 1");
        assert_eq!(event.inserted_at, at(8));

        assert!(!store.update_fields("1", &FieldUpdate::default()).await.unwrap());
        let unknown = FieldUpdate {
            status: Some("Canceled".into()),
            ..Default::default()
        };
        assert!(!store.update_fields("missing", &unknown).await.unwrap());
    }

    #[tokio::test]
    async fn missing_url_query_skips_past_and_filled_rows() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        store
            .insert_events(&[
                mk_event("a", ymd(2025, 6, 25), None, at(8)),
                mk_event("b", ymd(2025, 6, 26), Some("https://x/b.pdf"), at(8)),
                mk_event("c", ymd(2025, 5, 1), None, at(8)),
                mk_event("d", ymd(2025, 6, 19), Some(""), at(8)),
            ])
            .await
            .unwrap();

        let missing = store.query_missing_url(ymd(2025, 6, 18)).await.unwrap();
        let ids = missing.iter().map(|m| m.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["d", "a"]);
        assert!(missing[1].api_ref.ends_with("/a"));
    }

    #[tokio::test]
    async fn latest_insertion_selects_most_recent_batch() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        store
            .insert_events(&[
                mk_event("old", ymd(2025, 6, 30), None, at(6)),
                mk_event("stale-past", ymd(2025, 6, 1), None, at(20)),
            ])
            .await
            .unwrap();
        store
            .insert_events(&[
                mk_event("new-1", ymd(2025, 6, 29), None, at(12)),
                mk_event("new-2", ymd(2025, 6, 19), None, at(12)),
            ])
            .await
            .unwrap();

        let latest = store.latest_insertion(ymd(2025, 6, 18)).await.unwrap();
        assert_eq!(latest, Some(at(12)));

        let since = store.query_inserted_since(at(12)).await.unwrap();
        let ids = since.iter().map(|e| e.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["stale-past", "new-2", "new-1"]);

        let empty = SqliteEventStore::in_memory().await.unwrap();
        assert_eq!(empty.latest_insertion(ymd(2025, 6, 18)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("hearings.db").display());

        let store = SqliteEventStore::open(&url).await.unwrap();
        store
            .insert_events(&[mk_event("1", ymd(2025, 6, 20), None, at(8))])
            .await
            .unwrap();
        store.close().await;

        let reopened = SqliteEventStore::open(&url).await.unwrap();
        assert!(reopened.list_known_ids().await.unwrap().contains("1"));
        reopened.close().await;
    }

    #[test]
    fn stored_timestamps_sort_lexicographically() {
        let early = format_timestamp(at(9));
        let late = format_timestamp(at(10));
        assert_eq!(early, "2025-06-18T09:00:00.000000Z");
        assert!(early < late);
    }

    #[test]
    fn retry_classification_matches_transient_statuses() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }

    #[test]
    fn store_pool_keeps_its_only_connection() {
        let options = single_connection_pool();
        assert_eq!(options.get_max_connections(), 1);
        assert_eq!(options.get_min_connections(), 1);
        assert_eq!(options.get_max_lifetime(), None);
        assert_eq!(options.get_idle_timeout(), None);
    }

    #[test]
    fn default_backoff_doubles_until_cap() {
        let policy = BackoffPolicy::default();
        let delays = (0..6)
            .map(|attempt| policy.delay_for_attempt(attempt).as_millis())
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 8000]);
        assert_eq!(policy.delay_for_attempt(40), policy.max_delay);
    }

    #[test]
    fn api_key_header_is_injected_and_validated() {
        let headers = default_headers(Some("secret-key")).unwrap();
        assert_eq!(headers["x-api-key"], "secret-key");
        assert!(headers["x-api-key"].is_sensitive());

        assert!(default_headers(None).unwrap().is_empty());
        assert!(default_headers(Some("bad\nkey")).is_err());
    }
}
