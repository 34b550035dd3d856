//! Source adapter contracts + the thin feed/table/sheet adapters.
//!
//! Adapters are deliberately shallow: they turn one upstream payload shape
//! into `RawItem`s and nothing more. Everything interesting (identity,
//! dedup, retries) happens downstream in the sync engine.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use finfeed_core::{FieldValue, RawItem};
use scraper::{Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;
use url::Url;

pub const CRATE_NAME: &str = "finfeed-adapters";

/// Field names adapters attach to items; registries reference these for
/// `by-title-and-field` identity.
pub const SOURCE_FIELD: &str = "Source";
pub const STOCK_CODE_FIELD: &str = "Stock Code";
pub const TICKER_FIELD: &str = "Ticker";
pub const PRICE_FIELD: &str = "Current Price";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("source payload unparseable: {0}")]
    Parse(String),
}

/// Produces the per-run sequence of raw items for one source.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_items(&self) -> Result<Vec<RawItem>, AdapterError>;
}

/// Shared upstream HTTP client; one per run, cloned into each adapter.
pub fn http_client(timeout: Duration, user_agent: &str) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(timeout)
        .user_agent(user_agent.to_string())
        .build()
        .context("building upstream http client")
}

async fn fetch_text(client: &reqwest::Client, url: &str) -> Result<String, AdapterError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| AdapterError::Unavailable(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(AdapterError::Unavailable(format!("http {status} for {url}")));
    }
    response
        .text()
        .await
        .map_err(|e| AdapterError::Unavailable(e.to_string()))
}

// ---------------------------------------------------------------------------
// RSS feeds

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    title: Option<String>,
    #[serde(rename = "item", default)]
    items: Vec<ChannelItem>,
}

#[derive(Debug, Deserialize)]
struct ChannelItem {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

/// News feed adapter: one RSS/Atom-ish channel per source.
pub struct RssFeedAdapter {
    source_id: String,
    feed_url: String,
    client: reqwest::Client,
}

impl RssFeedAdapter {
    pub fn new(source_id: impl Into<String>, feed_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            source_id: source_id.into(),
            feed_url: feed_url.into(),
            client,
        }
    }
}

#[async_trait]
impl SourceAdapter for RssFeedAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_items(&self) -> Result<Vec<RawItem>, AdapterError> {
        let xml = fetch_text(&self.client, &self.feed_url).await?;
        parse_rss_items(&self.source_id, &xml)
    }
}

pub fn parse_rss_items(source_id: &str, xml: &str) -> Result<Vec<RawItem>, AdapterError> {
    let rss: Rss = quick_xml::de::from_str(xml).map_err(|e| AdapterError::Parse(e.to_string()))?;
    let channel_title = rss.channel.title.unwrap_or_default();

    let mut items = Vec::with_capacity(rss.channel.items.len());
    for entry in rss.channel.items {
        let title = entry.title.unwrap_or_default().trim().to_string();
        if title.is_empty() {
            continue;
        }
        let mut fields = BTreeMap::new();
        if !channel_title.is_empty() {
            fields.insert(
                SOURCE_FIELD.to_string(),
                FieldValue::Text(channel_title.clone()),
            );
        }
        items.push(RawItem {
            source_id: source_id.to_string(),
            title,
            url: entry.link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty()),
            published_at: entry.pub_date.as_deref().and_then(parse_rfc2822),
            body: entry.description,
            fields,
        });
    }
    Ok(items)
}

fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(ts.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Research-report tables

/// Report-center adapter: a table of (date, title, source, stock code) rows,
/// each carrying a preview/download link.
pub struct ReportTableAdapter {
    source_id: String,
    page_url: String,
    source_label: String,
    client: reqwest::Client,
}

impl ReportTableAdapter {
    pub fn new(
        source_id: impl Into<String>,
        page_url: impl Into<String>,
        source_label: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            page_url: page_url.into(),
            source_label: source_label.into(),
            client,
        }
    }
}

#[async_trait]
impl SourceAdapter for ReportTableAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_items(&self) -> Result<Vec<RawItem>, AdapterError> {
        let html = fetch_text(&self.client, &self.page_url).await?;
        parse_report_table(&self.source_id, &self.page_url, &self.source_label, &html)
    }
}

pub fn parse_report_table(
    source_id: &str,
    page_url: &str,
    source_label: &str,
    html: &str,
) -> Result<Vec<RawItem>, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = parse_selector("table tbody tr")?;
    let cell_sel = parse_selector("td")?;
    let link_sel = parse_selector("a[href]")?;

    let mut items = Vec::new();
    for row in document.select(&row_sel) {
        let cells: Vec<String> = row
            .select(&cell_sel)
            .map(|c| c.text().collect::<String>().trim().to_string())
            .collect();
        if cells.len() < 2 {
            continue;
        }

        let title = cells.get(1).cloned().unwrap_or_default();
        if title.is_empty() {
            continue;
        }

        let link = row
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .and_then(|href| absolutize(page_url, href));

        let mut fields = BTreeMap::new();
        fields.insert(
            SOURCE_FIELD.to_string(),
            FieldValue::Text(source_label.to_string()),
        );
        if let Some(code) = cells.get(3).filter(|c| !c.is_empty()) {
            fields.insert(STOCK_CODE_FIELD.to_string(), FieldValue::Text(code.clone()));
        }

        items.push(RawItem {
            source_id: source_id.to_string(),
            title,
            url: link,
            published_at: cells.first().and_then(|d| parse_day_month_year(d)),
            body: None,
            fields,
        });
    }
    Ok(items)
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Parse(e.to_string()))
}

/// Resolve a possibly-relative href against the page it came from.
fn absolutize(page_url: &str, href: &str) -> Option<String> {
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    let base = Url::parse(page_url).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

/// Report listings date their rows `dd/mm/yyyy` or `dd-mm-yyyy`.
pub fn parse_day_month_year(text: &str) -> Option<DateTime<Utc>> {
    let normalized = text.trim().replace('-', "/");
    let date = NaiveDate::parse_from_str(&normalized, "%d/%m/%Y").ok()?;
    let midnight = date.and_hms_opt(0, 0, 0)?;
    Some(DateTime::from_naive_utc_and_offset(midnight, Utc))
}

// ---------------------------------------------------------------------------
// Quote sheets (CSV export)

/// Watchlist quotes exported as CSV: `ticker,price` rows with an optional
/// header line.
pub struct QuoteSheetAdapter {
    source_id: String,
    csv_url: String,
    client: reqwest::Client,
}

impl QuoteSheetAdapter {
    pub fn new(source_id: impl Into<String>, csv_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            source_id: source_id.into(),
            csv_url: csv_url.into(),
            client,
        }
    }
}

#[async_trait]
impl SourceAdapter for QuoteSheetAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_items(&self) -> Result<Vec<RawItem>, AdapterError> {
        let csv = fetch_text(&self.client, &self.csv_url).await?;
        Ok(parse_quote_rows(&self.source_id, &csv))
    }
}

pub fn parse_quote_rows(source_id: &str, csv: &str) -> Vec<RawItem> {
    let mut items = Vec::new();
    for (index, line) in csv.lines().enumerate() {
        let cells: Vec<&str> = line.split(',').map(str::trim).collect();
        let Some(ticker) = cells.first().filter(|t| !t.is_empty()) else {
            continue;
        };
        if index == 0 && matches!(*ticker, "Ticker" | "Symbol") {
            continue;
        }

        let price_text: String = cells
            .get(1)
            .copied()
            .unwrap_or_default()
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
            .collect();
        let Ok(price) = price_text.parse::<f64>() else {
            warn!(source_id, row = index + 1, "skipping unparseable quote row");
            continue;
        };

        let mut fields = BTreeMap::new();
        fields.insert(
            TICKER_FIELD.to_string(),
            FieldValue::Text((*ticker).to_string()),
        );
        fields.insert(PRICE_FIELD.to_string(), FieldValue::Number(price));

        items.push(RawItem {
            source_id: source_id.to_string(),
            title: (*ticker).to_string(),
            url: None,
            published_at: None,
            body: None,
            fields,
        });
    }
    items
}

// ---------------------------------------------------------------------------
// Enrichment

/// Optional summary hook applied to new records before commit. Failures
/// degrade; they never fail the item.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn summarize(&self, title: &str, body: &str) -> anyhow::Result<String>;
}

const SUMMARY_INSTRUCTIONS: &str = "Read the provided article text and summarize it as a \
one-sentence TL;DR followed by the key points and why the news matters.";

/// Hosted-LLM summarizer speaking a small JSON POST contract.
pub struct HostedSummarizer {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    max_input_chars: usize,
}

impl HostedSummarizer {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
            max_input_chars: 30_000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    summary: String,
}

#[async_trait]
impl Enricher for HostedSummarizer {
    async fn summarize(&self, title: &str, body: &str) -> anyhow::Result<String> {
        let input = truncate_chars(body, self.max_input_chars);
        let payload = serde_json::json!({
            "instructions": SUMMARY_INSTRUCTIONS,
            "title": title,
            "input": input,
        });

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("calling summary endpoint")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("summary endpoint returned http {status}");
        }
        let parsed: SummaryResponse = response.json().await.context("parsing summary response")?;
        Ok(parsed.summary)
    }
}

pub fn truncate_chars(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        text.to_string()
    } else {
        text.chars().take(cap).collect()
    }
}
