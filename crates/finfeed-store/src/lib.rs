//! Workspace-database client + retry policy for finfeed.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use finfeed_core::{FieldValue, Record};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::info_span;

pub const CRATE_NAME: &str = "finfeed-store";

/// Property names every destination database is expected to carry.
pub const TITLE_PROPERTY: &str = "Title";
pub const URL_PROPERTY: &str = "Link";

/// Opaque page identifier assigned by the destination store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoredId(pub String);

impl fmt::Display for StoredId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type FieldPatch = BTreeMap<String, FieldValue>;

/// A record as it exists in the destination, read back during index preload
/// and reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: StoredId,
    pub title: String,
    pub url: Option<String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub records: Vec<StoredRecord>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("destination unreachable: {0}")]
    Unavailable(String),
    #[error("rate limited by destination")]
    RateLimited { retry_after: Option<Duration> },
    #[error("permanent destination error ({status}): {message}")]
    Permanent { status: u16, message: String },
}

impl StoreError {
    /// Transient errors are worth retrying; permanent ones are not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Permanent { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            StoreError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// The destination store's write/read surface consumed by the sync engine.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    async fn query_page(
        &self,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<QueryPage, StoreError>;

    async fn create(&self, record: &Record) -> Result<StoredId, StoreError>;

    async fn update(&self, id: &StoredId, fields: &FieldPatch) -> Result<(), StoreError>;

    async fn archive(&self, id: &StoredId) -> Result<(), StoreError>;
}

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

/// Exponential backoff schedule for transient destination errors.
///
/// `max_attempts` bounds total tries, not retries: the default of 3 yields
/// delays of 15s and 30s between attempts, then gives up.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(60),
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
pub struct WorkspaceClientConfig {
    pub api_url: String,
    pub token: String,
    pub database_id: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

/// REST client for the workspace database holding synced records.
#[derive(Debug, Clone)]
pub struct WorkspaceClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
    database_id: String,
}

impl WorkspaceClient {
    pub fn new(config: WorkspaceClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let http = builder.build().context("building workspace http client")?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token,
            database_id: config.database_id,
        })
    }

    /// Same credentials, different database. Sources may override the
    /// destination database they write into.
    pub fn for_database(&self, database_id: &str) -> Self {
        let mut clone = self.clone();
        clone.database_id = database_id.to_string();
        clone
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    async fn send_json(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<JsonValue, StoreError> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<JsonValue>()
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Err(StoreError::RateLimited { retry_after });
        }

        let message = response.text().await.unwrap_or_default();
        let message = truncate_message(&message);
        match classify_status(status) {
            RetryDisposition::Retryable => Err(StoreError::Unavailable(format!(
                "http {status}: {message}"
            ))),
            RetryDisposition::NonRetryable => Err(StoreError::Permanent {
                status: status.as_u16(),
                message,
            }),
        }
    }
}

#[async_trait]
impl DestinationStore for WorkspaceClient {
    async fn query_page(
        &self,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<QueryPage, StoreError> {
        let span = info_span!("store_query", database_id = %self.database_id);
        let _guard = span.enter();

        let mut body = json!({ "page_size": page_size });
        if let Some(token) = page_token {
            body["start_cursor"] = json!(token);
        }

        let url = format!("{}/databases/{}/query", self.api_url, self.database_id);
        let value = self.send_json(self.http.post(&url).json(&body)).await?;
        parse_query_response(&value)
    }

    async fn create(&self, record: &Record) -> Result<StoredId, StoreError> {
        let span = info_span!("store_create", identity_key = %record.identity_key);
        let _guard = span.enter();

        let body = json!({
            "parent": { "database_id": self.database_id },
            "properties": record_properties(record),
        });
        let url = format!("{}/pages", self.api_url);
        let value = self.send_json(self.http.post(&url).json(&body)).await?;
        let id = value
            .get("id")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| StoreError::Unavailable("create response missing id".to_string()))?;
        Ok(StoredId(id.to_string()))
    }

    async fn update(&self, id: &StoredId, fields: &FieldPatch) -> Result<(), StoreError> {
        let span = info_span!("store_update", stored_id = %id);
        let _guard = span.enter();

        let body = json!({ "properties": patch_properties(fields) });
        let url = format!("{}/pages/{}", self.api_url, id.0);
        self.send_json(self.http.patch(&url).json(&body)).await?;
        Ok(())
    }

    async fn archive(&self, id: &StoredId) -> Result<(), StoreError> {
        let span = info_span!("store_archive", stored_id = %id);
        let _guard = span.enter();

        let body = json!({ "archived": true });
        let url = format!("{}/pages/{}", self.api_url, id.0);
        self.send_json(self.http.patch(&url).json(&body)).await?;
        Ok(())
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate_message(message: &str) -> String {
    const CAP: usize = 300;
    let trimmed = message.trim();
    if trimmed.chars().count() <= CAP {
        trimmed.to_string()
    } else {
        trimmed.chars().take(CAP).collect()
    }
}

/// Map a record onto destination properties: title + url columns, everything
/// else as rich-text or number columns named after the extra field.
pub fn record_properties(record: &Record) -> JsonValue {
    let mut properties = serde_json::Map::new();
    properties.insert(
        TITLE_PROPERTY.to_string(),
        json!({ "title": [{ "text": { "content": record.title } }] }),
    );
    if let Some(url) = &record.url {
        properties.insert(URL_PROPERTY.to_string(), json!({ "url": url }));
    }
    for (name, value) in &record.extra_fields {
        properties.insert(name.clone(), field_property(value));
    }
    JsonValue::Object(properties)
}

pub fn patch_properties(fields: &FieldPatch) -> JsonValue {
    let mut properties = serde_json::Map::new();
    for (name, value) in fields {
        properties.insert(name.clone(), field_property(value));
    }
    JsonValue::Object(properties)
}

fn field_property(value: &FieldValue) -> JsonValue {
    match value {
        FieldValue::Text(s) => json!({ "rich_text": [{ "text": { "content": s } }] }),
        FieldValue::Number(n) => json!({ "number": n }),
        FieldValue::Empty => json!({ "rich_text": [] }),
    }
}

pub fn parse_query_response(value: &JsonValue) -> Result<QueryPage, StoreError> {
    let results = value
        .get("results")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| StoreError::Unavailable("query response missing results".to_string()))?;

    let mut records = Vec::with_capacity(results.len());
    for entry in results {
        if let Some(record) = parse_stored_record(entry) {
            records.push(record);
        }
    }

    let next_page_token = match value.get("has_more").and_then(JsonValue::as_bool) {
        Some(true) => value
            .get("next_cursor")
            .and_then(JsonValue::as_str)
            .map(ToString::to_string),
        _ => None,
    };

    Ok(QueryPage {
        records,
        next_page_token,
    })
}

fn parse_stored_record(entry: &JsonValue) -> Option<StoredRecord> {
    let id = entry.get("id").and_then(JsonValue::as_str)?;
    let created_at = entry
        .get("created_time")
        .and_then(JsonValue::as_str)
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default();

    let properties = entry.get("properties").and_then(JsonValue::as_object)?;

    let mut title = String::new();
    let mut url = None;
    let mut fields = BTreeMap::new();

    for (name, prop) in properties {
        if let Some(parts) = prop.get("title").and_then(JsonValue::as_array) {
            title = join_plain_text(parts);
        } else if let Some(u) = prop.get("url") {
            url = u.as_str().map(ToString::to_string);
        } else if let Some(parts) = prop.get("rich_text").and_then(JsonValue::as_array) {
            let text = join_plain_text(parts);
            let value = if text.is_empty() {
                FieldValue::Empty
            } else {
                FieldValue::Text(text)
            };
            fields.insert(name.clone(), value);
        } else if let Some(n) = prop.get("number") {
            let value = n.as_f64().map(FieldValue::Number).unwrap_or(FieldValue::Empty);
            fields.insert(name.clone(), value);
        }
    }

    Some(StoredRecord {
        id: StoredId(id.to_string()),
        title,
        url,
        fields,
        created_at,
    })
}

fn join_plain_text(parts: &[JsonValue]) -> String {
    parts
        .iter()
        .filter_map(|p| {
            p.get("plain_text")
                .or_else(|| p.get("text").and_then(|t| t.get("content")))
                .and_then(JsonValue::as_str)
        })
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(60),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(15));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(60));
    }

    #[test]
    fn status_classification_retries_server_errors_and_429() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn retry_after_header_parses_whole_seconds() {
        assert_eq!(parse_retry_after("12"), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after(" 3 "), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn record_properties_map_title_url_and_extras() {
        let mut extra_fields = BTreeMap::new();
        extra_fields.insert("Source".to_string(), FieldValue::Text("VDSC".to_string()));
        extra_fields.insert("Current Price".to_string(), FieldValue::Number(31.25));

        let record = Record {
            identity_key: "https://a/1".to_string(),
            source_id: "vdsc-reports".to_string(),
            title: "Daily strategy note".to_string(),
            url: Some("https://a/1".to_string()),
            extra_fields,
            created_at: Utc::now(),
        };

        let props = record_properties(&record);
        assert_eq!(
            props[TITLE_PROPERTY]["title"][0]["text"]["content"],
            "Daily strategy note"
        );
        assert_eq!(props[URL_PROPERTY]["url"], "https://a/1");
        assert_eq!(props["Current Price"]["number"], 31.25);
        assert_eq!(
            props["Source"]["rich_text"][0]["text"]["content"],
            "VDSC"
        );
    }

    #[test]
    fn query_response_parses_records_and_cursor() {
        let body = serde_json::json!({
            "results": [
                {
                    "id": "page-1",
                    "created_time": "2026-03-02T08:30:00.000Z",
                    "properties": {
                        "Title": { "title": [{ "plain_text": "Bank sector update" }] },
                        "Link": { "url": "https://reports.example/banks" },
                        "AI Summary": { "rich_text": [] },
                        "Current Price": { "number": 18.4 }
                    }
                }
            ],
            "has_more": true,
            "next_cursor": "cursor-2"
        });

        let page = parse_query_response(&body).unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.next_page_token.as_deref(), Some("cursor-2"));

        let record = &page.records[0];
        assert_eq!(record.id, StoredId("page-1".to_string()));
        assert_eq!(record.title, "Bank sector update");
        assert_eq!(record.url.as_deref(), Some("https://reports.example/banks"));
        assert_eq!(record.fields.get("AI Summary"), Some(&FieldValue::Empty));
        assert_eq!(
            record.fields.get("Current Price"),
            Some(&FieldValue::Number(18.4))
        );
    }

    #[test]
    fn exhausted_page_has_no_token() {
        let body = serde_json::json!({
            "results": [],
            "has_more": false,
            "next_cursor": null
        });
        let page = parse_query_response(&body).unwrap();
        assert!(page.records.is_empty());
        assert!(page.next_page_token.is_none());
    }
}
