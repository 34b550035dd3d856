//! Dedup-and-sync core: normalize raw items into keyed records, preload the
//! destination index, and commit the delta with bounded retry/backoff.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use finfeed_adapters::{
    http_client, Enricher, HostedSummarizer, QuoteSheetAdapter, ReportTableAdapter,
    RssFeedAdapter, SourceAdapter,
};
use finfeed_core::{FieldValue, IdentitySpec, ItemFailure, RawItem, Record, SyncResult};
use finfeed_store::{
    BackoffPolicy, DestinationStore, FieldPatch, StoreError, StoredId, StoredRecord,
    WorkspaceClient, WorkspaceClientConfig,
};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tokio::fs;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "finfeed-sync";

/// Destination page size used during index preload and reconciliation scans.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Entity decoding repeats until a fixed point or this many passes.
const ENTITY_DECODE_MAX_PASSES: usize = 5;

/// Field the enrichment hook writes summaries into.
pub const DEFAULT_SUMMARY_FIELD: &str = "AI Summary";

pub const DEFAULT_REVIEW_THRESHOLD: f64 = 0.9;

// ---------------------------------------------------------------------------
// Configuration

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_url: String,
    pub api_token: String,
    pub database_id: String,
    pub sources_path: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout: Duration,
    pub freshness_window: Option<Duration>,
    pub skip_enrichment: Vec<String>,
    pub summary_api_url: Option<String>,
    pub summary_api_key: Option<String>,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .with_context(|| format!("{key} is required"))
        };

        Ok(Self {
            api_url: get("WORKSPACE_API_URL")
                .unwrap_or_else(|| "https://api.notion.com/v1".to_string()),
            api_token: required("WORKSPACE_API_TOKEN")?,
            database_id: required("WORKSPACE_DATABASE_ID")?,
            sources_path: get("FINFEED_SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            reports_dir: get("FINFEED_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            user_agent: get("FINFEED_USER_AGENT")
                .unwrap_or_else(|| "finfeed-bot/0.1".to_string()),
            http_timeout: Duration::from_secs(
                get("FINFEED_HTTP_TIMEOUT_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            ),
            freshness_window: get("FINFEED_FRESHNESS_WINDOW_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
            skip_enrichment: get("FINFEED_SKIP_ENRICHMENT")
                .map(|v| {
                    v.split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            summary_api_url: get("SUMMARY_API_URL").filter(|v| !v.trim().is_empty()),
            summary_api_key: get("SUMMARY_API_KEY").filter(|v| !v.trim().is_empty()),
        })
    }
}

// ---------------------------------------------------------------------------
// Source registry

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub kind: SourceKind,
    pub url: String,
    pub identity: IdentitySpec,
    /// Some destinations hold records whose URLs drift; those sources also
    /// treat a stored-title hit as a duplicate.
    #[serde(default)]
    pub also_match_title: bool,
    /// Stored fields the engine may fill in on existing records.
    #[serde(default)]
    pub backfill_fields: Vec<String>,
    /// Overrides the configured destination database for this source.
    #[serde(default)]
    pub database_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    RssFeed,
    ReportTable,
    QuoteSheet,
}

pub async fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

// ---------------------------------------------------------------------------
// Normalizer

/// Decode HTML/XML entities until the string stops changing. Feeds re-encode
/// titles on every hop, so single-pass decoding leaves `&amp;#38;`-style
/// nesting behind.
pub fn decode_entities(text: &str) -> String {
    let mut current = text.to_string();
    for _ in 0..ENTITY_DECODE_MAX_PASSES {
        let decoded = html_escape::decode_html_entities(&current).to_string();
        if decoded == current {
            break;
        }
        current = decoded;
    }
    current
}

pub fn normalize_title(raw: &str) -> String {
    decode_entities(raw)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonical form of a URL used as an identity key: lower-cased scheme and
/// host, default port dropped, trailing slash trimmed.
pub fn canonical_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parsed = Url::parse(trimmed).ok()?;
    if !parsed.has_host() {
        return None;
    }
    Some(parsed.to_string().trim_end_matches('/').to_string())
}

fn composite_key(title: &str, discriminator: &str) -> String {
    format!("{}::{}", title.to_lowercase(), discriminator.trim().to_lowercase())
}

/// Canonicalize a raw item into a keyed record, or `None` when the item has
/// no usable locator (unprocessable, not an error).
pub fn normalize(raw: &RawItem, spec: &IdentitySpec, now: DateTime<Utc>) -> Option<Record> {
    let title = normalize_title(&raw.title);
    let url = raw
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(ToString::to_string);

    let identity_key = match spec {
        IdentitySpec::ByUrl => canonical_url(url.as_deref()?)?,
        IdentitySpec::ByTitleAndField(field) => {
            if title.is_empty() {
                return None;
            }
            let discriminator = raw.field_text(field).map(str::trim).filter(|v| !v.is_empty())?;
            composite_key(&title, discriminator)
        }
    };

    Some(Record {
        identity_key,
        source_id: raw.source_id.clone(),
        title,
        url,
        extra_fields: raw.fields.clone(),
        created_at: now,
    })
}

fn stored_identity_key(record: &StoredRecord, spec: &IdentitySpec) -> Option<String> {
    match spec {
        IdentitySpec::ByUrl => canonical_url(record.url.as_deref()?),
        IdentitySpec::ByTitleAndField(field) => {
            let title = normalize_title(&record.title);
            if title.is_empty() {
                return None;
            }
            let discriminator = record
                .fields
                .get(field)
                .and_then(FieldValue::as_text)
                .map(str::trim)
                .filter(|v| !v.is_empty())?;
            Some(composite_key(&title, discriminator))
        }
    }
}

// ---------------------------------------------------------------------------
// Existing index

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub stored_id: StoredId,
    /// Backfill-eligible fields the stored record currently lacks.
    pub missing_fields: HashSet<String>,
}

/// Snapshot of the destination's identity keys, loaded once per run and
/// mutated in memory as commits land.
#[derive(Debug, Default)]
pub struct ExistingIndex {
    keys: HashMap<String, IndexEntry>,
    titles: HashSet<String>,
    pub scanned: usize,
}

impl ExistingIndex {
    /// Paginated full scan of the destination. An unreachable destination is
    /// fatal for the run: proceeding with a partial index would mass-insert
    /// duplicates.
    pub async fn build(
        store: &dyn DestinationStore,
        spec: &IdentitySpec,
        backfill_fields: &[String],
    ) -> Result<Self, StoreError> {
        let mut index = Self::default();
        let mut page_token: Option<String> = None;
        loop {
            let page = store
                .query_page(page_token.as_deref(), DEFAULT_PAGE_SIZE)
                .await?;
            for record in page.records {
                index.scanned += 1;
                index.absorb(record, spec, backfill_fields);
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        debug!(scanned = index.scanned, keys = index.keys.len(), "existing index built");
        Ok(index)
    }

    fn absorb(&mut self, record: StoredRecord, spec: &IdentitySpec, backfill_fields: &[String]) {
        let title = normalize_title(&record.title);
        if !title.is_empty() {
            self.titles.insert(title);
        }
        let Some(key) = stored_identity_key(&record, spec) else {
            return;
        };
        let missing_fields = backfill_fields
            .iter()
            .filter(|f| record.fields.get(*f).map_or(true, FieldValue::is_empty))
            .cloned()
            .collect();
        // Destination-side duplicates resolve to the first record scanned.
        self.keys.entry(key).or_insert(IndexEntry {
            stored_id: record.id,
            missing_fields,
        });
    }

    pub fn has(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    pub fn lookup(&self, key: &str) -> Option<&IndexEntry> {
        self.keys.get(key)
    }

    pub fn has_title(&self, title: &str) -> bool {
        self.titles.contains(title)
    }

    /// Register a record committed during this run so later items see it.
    pub fn insert_committed(&mut self, key: String, title: String, stored_id: StoredId) {
        self.keys.insert(
            key,
            IndexEntry {
                stored_id,
                missing_fields: HashSet::new(),
            },
        );
        if !title.is_empty() {
            self.titles.insert(title);
        }
    }

    fn mark_filled(&mut self, key: &str, fields: &FieldPatch) {
        if let Some(entry) = self.keys.get_mut(key) {
            for name in fields.keys() {
                entry.missing_fields.remove(name);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Sync engine

#[derive(Debug, Clone)]
pub struct SyncPolicy {
    pub backoff: BackoffPolicy,
    /// Fixed delay between destination writes; the destination allows only a
    /// few requests per second.
    pub commit_pacing: Duration,
    pub freshness_window: Option<Duration>,
    pub backfill_fields: Vec<String>,
    /// Field the enrichment hook writes; `None` disables summaries entirely.
    pub summary_field: Option<String>,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            commit_pacing: Duration::from_millis(350),
            freshness_window: None,
            backfill_fields: Vec::new(),
            summary_field: Some(DEFAULT_SUMMARY_FIELD.to_string()),
        }
    }
}

#[derive(Debug)]
enum ItemOutcome {
    Discarded,
    Duplicate,
    Created,
    Updated,
    Failed(String),
}

enum CommitOp<'b> {
    Create(&'b Record),
    Update(&'b StoredId, &'b FieldPatch),
}

/// Runs the per-item state machine:
/// `Fetched -> Normalized -> {Duplicate | New} -> {Committed | Failed}`.
pub struct SyncEngine<'a> {
    store: &'a dyn DestinationStore,
    policy: &'a SyncPolicy,
    enricher: Option<&'a dyn Enricher>,
    also_match_title: bool,
}

impl<'a> SyncEngine<'a> {
    pub fn new(store: &'a dyn DestinationStore, policy: &'a SyncPolicy) -> Self {
        Self {
            store,
            policy,
            enricher: None,
            also_match_title: false,
        }
    }

    pub fn with_enricher(mut self, enricher: Option<&'a dyn Enricher>) -> Self {
        self.enricher = enricher;
        self
    }

    pub fn match_titles(mut self, also_match_title: bool) -> Self {
        self.also_match_title = also_match_title;
        self
    }

    /// Process items strictly in source order; one item's failure never
    /// aborts the run.
    pub async fn run(
        &self,
        spec: &IdentitySpec,
        items: Vec<RawItem>,
        index: &mut ExistingIndex,
    ) -> SyncResult {
        let run_started = Utc::now();
        let mut result = SyncResult::default();

        for item in items {
            let outcome = self.process_item(spec, &item, index, run_started).await;
            let touched_store = matches!(
                &outcome,
                ItemOutcome::Created | ItemOutcome::Updated | ItemOutcome::Failed(_)
            );
            match outcome {
                ItemOutcome::Discarded => result.discarded += 1,
                ItemOutcome::Duplicate => {
                    debug!(title = %item.title, "skipping duplicate");
                    result.skipped += 1;
                }
                ItemOutcome::Created => result.created += 1,
                ItemOutcome::Updated => result.updated += 1,
                ItemOutcome::Failed(reason) => {
                    warn!(title = %item.title, %reason, "item failed");
                    result.failed += 1;
                    result.failures.push(ItemFailure {
                        source_id: item.source_id.clone(),
                        title: item.title.clone(),
                        reason,
                    });
                }
            }
            if touched_store && !self.policy.commit_pacing.is_zero() {
                tokio::time::sleep(self.policy.commit_pacing).await;
            }
        }

        result
    }

    async fn process_item(
        &self,
        spec: &IdentitySpec,
        item: &RawItem,
        index: &mut ExistingIndex,
        run_started: DateTime<Utc>,
    ) -> ItemOutcome {
        let Some(mut record) = normalize(item, spec, run_started) else {
            return ItemOutcome::Discarded;
        };

        if let Some(window) = self.policy.freshness_window {
            // Items without a timestamp are not filterable and pass through.
            if let Some(published) = item.published_at {
                let age = run_started.signed_duration_since(published).to_std();
                if matches!(age, Ok(age) if age > window) {
                    debug!(title = %record.title, "outside freshness window");
                    return ItemOutcome::Discarded;
                }
            }
        }

        if let Some(entry) = index.lookup(&record.identity_key).cloned() {
            let patch = self.backfill_patch(&entry, &record, item).await;
            if patch.is_empty() {
                return ItemOutcome::Duplicate;
            }
            return match self.commit(CommitOp::Update(&entry.stored_id, &patch)).await {
                Ok(_) => {
                    index.mark_filled(&record.identity_key, &patch);
                    ItemOutcome::Updated
                }
                Err(reason) => ItemOutcome::Failed(reason),
            };
        }

        if self.also_match_title && index.has_title(&record.title) {
            return ItemOutcome::Duplicate;
        }

        if let Some(summary_field) = self.policy.summary_field.as_deref() {
            if let (Some(enricher), Some(body)) = (self.enricher, item.body.as_deref()) {
                let summary = match enricher.summarize(&record.title, body).await {
                    Ok(summary) => summary,
                    Err(err) => {
                        warn!(title = %record.title, error = %err, "enrichment failed");
                        "Summary unavailable".to_string()
                    }
                };
                record
                    .extra_fields
                    .insert(summary_field.to_string(), FieldValue::Text(summary));
            }
        }

        match self.commit(CommitOp::Create(&record)).await {
            Ok(stored_id) => {
                index.insert_committed(record.identity_key.clone(), record.title.clone(), stored_id);
                info!(title = %record.title, "record created");
                ItemOutcome::Created
            }
            Err(reason) => ItemOutcome::Failed(reason),
        }
    }

    /// Values this item can supply for fields the stored record lacks. The
    /// enrichment hook may fill a missing summary field on the spot.
    async fn backfill_patch(
        &self,
        entry: &IndexEntry,
        record: &Record,
        item: &RawItem,
    ) -> FieldPatch {
        let mut patch = FieldPatch::new();
        for field in &self.policy.backfill_fields {
            if !entry.missing_fields.contains(field) {
                continue;
            }
            if let Some(value) = record.extra_fields.get(field) {
                if !value.is_empty() {
                    patch.insert(field.clone(), value.clone());
                    continue;
                }
            }
            if Some(field.as_str()) == self.policy.summary_field.as_deref() {
                if let (Some(enricher), Some(body)) = (self.enricher, item.body.as_deref()) {
                    match enricher.summarize(&record.title, body).await {
                        Ok(summary) => {
                            patch.insert(field.clone(), FieldValue::Text(summary));
                        }
                        Err(err) => {
                            warn!(title = %record.title, error = %err, "backfill enrichment failed")
                        }
                    }
                }
            }
        }
        patch
    }

    /// Commit with bounded exponential backoff on transient errors. A
    /// rate-limit hint from the destination stretches, never shortens, the
    /// scheduled delay.
    async fn commit(&self, op: CommitOp<'_>) -> Result<StoredId, String> {
        let max_attempts = self.policy.backoff.max_attempts.max(1);
        for attempt in 0..max_attempts {
            let result = match &op {
                CommitOp::Create(record) => self.store.create(record).await,
                CommitOp::Update(id, patch) => {
                    self.store.update(id, patch).await.map(|_| (*id).clone())
                }
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    if attempt + 1 >= max_attempts {
                        return Err(format!("retries exhausted: {err}"));
                    }
                    let scheduled = self.policy.backoff.delay_for_attempt(attempt);
                    let delay = err.retry_after().map_or(scheduled, |hint| hint.max(scheduled));
                    warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, %err, "transient commit error, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.to_string()),
            }
        }
        Err("retries exhausted".to_string())
    }
}

// ---------------------------------------------------------------------------
// Pipeline

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub discarded: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedSource {
    pub source_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
    pub failed_sources: Vec<FailedSource>,
    pub totals: SyncResult,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub failed_sources: usize,
    pub totals: SyncResult,
    pub report_path: PathBuf,
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    client: WorkspaceClient,
    http: reqwest::Client,
    enricher: Option<Box<dyn Enricher>>,
}

impl SyncPipeline {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = load_source_registry(&config.sources_path).await?;
        let client = WorkspaceClient::new(WorkspaceClientConfig {
            api_url: config.api_url.clone(),
            token: config.api_token.clone(),
            database_id: config.database_id.clone(),
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
        })?;
        let http = http_client(config.http_timeout, &config.user_agent)?;

        let enricher: Option<Box<dyn Enricher>> =
            match (&config.summary_api_url, &config.summary_api_key) {
                (Some(url), Some(key)) => Some(Box::new(HostedSummarizer::new(
                    url.as_str(),
                    key.as_str(),
                    http.clone(),
                ))),
                _ => None,
            };

        Ok(Self {
            config,
            registry,
            client,
            http,
            enricher,
        })
    }

    fn adapter_for(&self, source: &SourceConfig) -> Box<dyn SourceAdapter> {
        match source.kind {
            SourceKind::RssFeed => Box::new(RssFeedAdapter::new(
                source.source_id.as_str(),
                source.url.as_str(),
                self.http.clone(),
            )),
            SourceKind::ReportTable => Box::new(ReportTableAdapter::new(
                source.source_id.as_str(),
                source.url.as_str(),
                source.display_name.as_str(),
                self.http.clone(),
            )),
            SourceKind::QuoteSheet => Box::new(QuoteSheetAdapter::new(
                source.source_id.as_str(),
                source.url.as_str(),
                self.http.clone(),
            )),
        }
    }

    fn enrichment_skipped(&self, source_id: &str) -> bool {
        self.config
            .skip_enrichment
            .iter()
            .any(|pattern| source_id.contains(pattern.as_str()))
    }

    /// One full run: per enabled source, fetch -> preload index -> sync.
    /// Source-level fetch errors are recorded and skipped; an unreachable
    /// destination during index preload aborts the whole run.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "sync run starting");

        let enabled: Vec<&SourceConfig> =
            self.registry.sources.iter().filter(|s| s.enabled).collect();

        let mut totals = SyncResult::default();
        let mut source_reports = Vec::new();
        let mut failed_sources = Vec::new();

        for source in &enabled {
            let adapter = self.adapter_for(source);
            let items = match adapter.fetch_items().await {
                Ok(items) => items,
                Err(err) => {
                    warn!(source_id = %source.source_id, error = %err, "source failed, continuing");
                    failed_sources.push(FailedSource {
                        source_id: source.source_id.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            info!(source_id = %source.source_id, fetched = items.len(), "source fetched");

            let store = match &source.database_id {
                Some(database_id) => self.client.for_database(database_id),
                None => self.client.clone(),
            };

            let mut index =
                ExistingIndex::build(&store, &source.identity, &source.backfill_fields)
                    .await
                    .with_context(|| {
                        format!("preloading destination index for {}", source.source_id)
                    })?;

            let policy = SyncPolicy {
                freshness_window: self.config.freshness_window,
                backfill_fields: source.backfill_fields.clone(),
                ..SyncPolicy::default()
            };
            let enricher = if self.enrichment_skipped(&source.source_id) {
                None
            } else {
                self.enricher.as_deref()
            };

            let fetched = items.len();
            let result = SyncEngine::new(&store, &policy)
                .with_enricher(enricher)
                .match_titles(source.also_match_title)
                .run(&source.identity, items, &mut index)
                .await;

            info!(
                source_id = %source.source_id,
                created = result.created,
                updated = result.updated,
                skipped = result.skipped,
                failed = result.failed,
                "source synced"
            );
            source_reports.push(SourceReport {
                source_id: source.source_id.clone(),
                fetched,
                created: result.created,
                updated: result.updated,
                skipped: result.skipped,
                failed: result.failed,
                discarded: result.discarded,
            });
            totals.merge(result);
        }

        let finished_at = Utc::now();
        let report = RunReport {
            run_id,
            started_at,
            finished_at,
            sources: source_reports,
            failed_sources,
            totals: totals.clone(),
        };
        let report_path = self.write_report(&report).await?;

        info!(
            %run_id,
            created = totals.created,
            updated = totals.updated,
            skipped = totals.skipped,
            failed = totals.failed,
            report = %report_path.display(),
            "sync run finished"
        );

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            enabled_sources: enabled.len(),
            failed_sources: report.failed_sources.len(),
            totals,
            report_path,
        })
    }

    async fn write_report(&self, report: &RunReport) -> Result<PathBuf> {
        fs::create_dir_all(&self.config.reports_dir)
            .await
            .with_context(|| format!("creating {}", self.config.reports_dir.display()))?;
        let path = self
            .config
            .reports_dir
            .join(format!("{}.json", report.run_id));
        let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::from_config(config).await?;
    pipeline.run_once().await
}

// ---------------------------------------------------------------------------
// Reconciliation

#[derive(Debug, Clone, Serialize)]
pub struct ReviewPair {
    pub title_a: String,
    pub title_b: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    pub scanned: usize,
    pub duplicate_groups: usize,
    pub archived: usize,
    pub failed: usize,
    /// Near-duplicate titles left for a human to judge.
    pub review: Vec<ReviewPair>,
}

/// Destination cleanup: group stored records by identity key, keep the newest
/// of each group, archive the rest. Records whose titles are merely similar
/// are reported, not archived.
pub async fn reconcile(
    store: &dyn DestinationStore,
    spec: &IdentitySpec,
    review_threshold: f64,
) -> Result<ReconcileSummary> {
    let mut records = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let page = store
            .query_page(page_token.as_deref(), DEFAULT_PAGE_SIZE)
            .await
            .context("scanning destination for reconciliation")?;
        records.extend(page.records);
        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    let mut summary = ReconcileSummary {
        scanned: records.len(),
        ..ReconcileSummary::default()
    };

    let mut groups: HashMap<String, Vec<StoredRecord>> = HashMap::new();
    let mut unkeyed = Vec::new();
    for record in records {
        match stored_identity_key(&record, spec) {
            Some(key) => groups.entry(key).or_default().push(record),
            None => unkeyed.push(record),
        }
    }

    let mut kept = Vec::with_capacity(groups.len());
    for (key, mut members) in groups {
        if members.len() > 1 {
            summary.duplicate_groups += 1;
            members.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            info!(%key, copies = members.len(), "archiving duplicate group");
            for stale in &members[1..] {
                match store.archive(&stale.id).await {
                    Ok(()) => summary.archived += 1,
                    Err(err) => {
                        warn!(stored_id = %stale.id, %err, "archive failed");
                        summary.failed += 1;
                    }
                }
            }
        }
        kept.push(members.swap_remove(0));
    }
    kept.extend(unkeyed);

    for i in 0..kept.len() {
        for j in (i + 1)..kept.len() {
            let a = normalize_title(&kept[i].title);
            let b = normalize_title(&kept[j].title);
            if a.is_empty() || b.is_empty() || a == b {
                continue;
            }
            let score = jaro_winkler(&a.to_lowercase(), &b.to_lowercase());
            if score >= review_threshold {
                summary.review.push(ReviewPair {
                    title_a: kept[i].title.clone(),
                    title_b: kept[j].title.clone(),
                    score,
                });
            }
        }
    }

    Ok(summary)
}

/// Reconcile using env configuration. With a source id, that source's
/// identity strategy and destination override apply; otherwise the default
/// database is reconciled by URL.
pub async fn reconcile_from_env(source_id: Option<&str>) -> Result<ReconcileSummary> {
    let config = SyncConfig::from_env()?;
    let client = WorkspaceClient::new(WorkspaceClientConfig {
        api_url: config.api_url.clone(),
        token: config.api_token.clone(),
        database_id: config.database_id.clone(),
        timeout: config.http_timeout,
        user_agent: Some(config.user_agent.clone()),
    })?;

    let (store, spec) = match source_id {
        Some(source_id) => {
            let registry = load_source_registry(&config.sources_path).await?;
            let source = registry
                .sources
                .into_iter()
                .find(|s| s.source_id == source_id)
                .with_context(|| format!("unknown source {source_id}"))?;
            let store = match &source.database_id {
                Some(database_id) => client.for_database(database_id),
                None => client,
            };
            (store, source.identity)
        }
        None => (client, IdentitySpec::ByUrl),
    };

    reconcile(&store, &spec, DEFAULT_REVIEW_THRESHOLD).await
}
