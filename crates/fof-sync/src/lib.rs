//! Refresh orchestration: adapter fan-out, normalization, deduplication, the corpus cache and
//! snapshot export.

use std::any::Any;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use fof_adapters::{load_sources, AdapterRegistry, CollectContext};
use fof_core::{Corpus, Opportunity, QueryFilters, RawRecord, Taxonomy};
use fof_http::{FetcherConfig, HttpFetcher};
use fof_normalize::{FieldNormalizer, NormalizedBatch};
use fof_search::{QueryEngine, QueryOutcome};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use strsim::jaro_winkler;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fof-sync";

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub workspace_root: PathBuf,
    pub sources_file: PathBuf,
    pub search_ttl: Duration,
    pub listing_ttl: Duration,
    pub adapter_timeout: Duration,
    pub page_size: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
    pub near_duplicate_threshold: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            sources_file: PathBuf::from("sources.yaml"),
            search_ttl: Duration::from_secs(30 * 60),
            listing_ttl: Duration::from_secs(5 * 60),
            adapter_timeout: Duration::from_secs(20),
            page_size: fof_search::DEFAULT_PAGE_SIZE,
            user_agent: "fof-bot/0.1".to_string(),
            http_timeout_secs: 20,
            scheduler_enabled: false,
            refresh_cron: "0 0 6 * * *".to_string(),
            near_duplicate_threshold: DEFAULT_NEAR_DUPLICATE_THRESHOLD,
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl AggregatorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: std::env::var("FOF_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            sources_file: std::env::var("FOF_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_file),
            search_ttl: env_u64("FOF_SEARCH_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.search_ttl),
            listing_ttl: env_u64("FOF_LISTING_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.listing_ttl),
            adapter_timeout: env_u64("FOF_ADAPTER_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.adapter_timeout),
            page_size: env_u64("FOF_PAGE_SIZE")
                .map(|v| v as usize)
                .filter(|v| *v > 0)
                .unwrap_or(defaults.page_size),
            user_agent: std::env::var("FOF_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_u64("FOF_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            scheduler_enabled: std::env::var("FOF_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            refresh_cron: std::env::var("FOF_REFRESH_CRON").unwrap_or(defaults.refresh_cron),
            near_duplicate_threshold: defaults.near_duplicate_threshold,
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        if self.sources_file.is_absolute() {
            self.sources_file.clone()
        } else {
            self.workspace_root.join(&self.sources_file)
        }
    }
}

/// Builds the adapter registry from the configured source registry file.
pub fn registry_from_config(config: &AggregatorConfig) -> Result<AdapterRegistry> {
    let sources = load_sources(config.sources_path())?;
    let http = HttpFetcher::new(FetcherConfig {
        request_timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: config.user_agent.clone(),
        ..Default::default()
    })?;
    AdapterRegistry::from_sources(&sources, &config.workspace_root, Arc::new(http))
        .context("building adapter registry")
}

pub const DEFAULT_NEAR_DUPLICATE_THRESHOLD: f64 = 0.92;

/// Two distinct identity keys similar enough to deserve a human look. Never merged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearDuplicate {
    pub key_a: String,
    pub key_b: String,
    pub similarity: f64,
}

#[derive(Debug, Clone)]
pub struct DedupOutcome {
    pub corpus: Corpus,
    pub discarded: usize,
    pub near_duplicates: Vec<NearDuplicate>,
}

/// First-seen-wins deduplication on the trimmed, lower-cased name.
#[derive(Debug, Clone, Copy)]
pub struct Deduplicator {
    review_threshold: f64,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_NEAR_DUPLICATE_THRESHOLD)
    }
}

impl Deduplicator {
    pub fn new(review_threshold: f64) -> Self {
        Self { review_threshold }
    }

    pub fn similarity(a: &str, b: &str) -> f64 {
        jaro_winkler(a, b)
    }

    pub fn dedupe(&self, opportunities: Vec<Opportunity>, built_at: DateTime<Utc>) -> DedupOutcome {
        let mut corpus = Corpus::new(built_at);
        let mut discarded = 0usize;
        for opportunity in opportunities {
            if !corpus.insert_if_absent(opportunity, built_at) {
                discarded += 1;
            }
        }

        let keys: Vec<&str> = corpus.entries().iter().map(|e| e.key.as_str()).collect();
        let mut near_duplicates = Vec::new();
        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                let similarity = Self::similarity(keys[i], keys[j]);
                if similarity >= self.review_threshold {
                    near_duplicates.push(NearDuplicate {
                        key_a: keys[i].to_string(),
                        key_b: keys[j].to_string(),
                        similarity,
                    });
                }
            }
        }

        DedupOutcome {
            corpus,
            discarded,
            near_duplicates,
        }
    }
}

/// Normalize stage of a refresh.
pub trait NormalizeHook: Send + Sync {
    fn apply(&self, provider: &str, records: &[RawRecord]) -> Result<NormalizedBatch>;
}

/// Dedupe stage of a refresh.
pub trait DedupHook: Send + Sync {
    fn apply(&self, opportunities: Vec<Opportunity>, built_at: DateTime<Utc>) -> Result<DedupOutcome>;
}

impl NormalizeHook for FieldNormalizer {
    fn apply(&self, provider: &str, records: &[RawRecord]) -> Result<NormalizedBatch> {
        Ok(self.normalize_batch(provider, records))
    }
}

impl DedupHook for Deduplicator {
    fn apply(&self, opportunities: Vec<Opportunity>, built_at: DateTime<Utc>) -> Result<DedupOutcome> {
        Ok(self.dedupe(opportunities, built_at))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Error,
    Timeout,
    Panic,
}

/// One adapter that contributed nothing to a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterFailure {
    pub provider: String,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectedBatch {
    pub provider: String,
    pub records: Vec<RawRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub adapters: usize,
    pub collected_records: usize,
    pub dropped_records: usize,
    pub duplicates_discarded: usize,
    pub corpus_size: usize,
    /// Identity keys absent from the corpus this refresh replaced.
    pub added: usize,
    pub adapter_failures: Vec<AdapterFailure>,
    pub near_duplicates: Vec<NearDuplicate>,
}

impl RefreshSummary {
    /// `(new_opportunity_count, error_count)`; errors are failed adapters plus dropped records.
    pub fn counts(&self) -> (usize, usize) {
        (
            self.corpus_size,
            self.adapter_failures.len() + self.dropped_records,
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    #[error("{stage} stage failed: {message}")]
    Stage { stage: &'static str, message: String },
    #[error("refresh stage panicked: {0}")]
    Panicked(String),
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct StageOutput {
    outcome: DedupOutcome,
    dropped: usize,
}

/// One refresh: concurrent collection, then normalize and dedupe on a blocking task.
pub struct RefreshPipeline {
    registry: AdapterRegistry,
    adapter_timeout: Duration,
    normalize: Arc<dyn NormalizeHook>,
    dedup: Arc<dyn DedupHook>,
}

impl std::fmt::Debug for RefreshPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshPipeline")
            .field("registry", &self.registry)
            .field("adapter_timeout", &self.adapter_timeout)
            .finish()
    }
}

impl RefreshPipeline {
    pub fn new(registry: AdapterRegistry, adapter_timeout: Duration) -> Self {
        Self {
            registry,
            adapter_timeout,
            normalize: Arc::new(FieldNormalizer::default()),
            dedup: Arc::new(Deduplicator::default()),
        }
    }

    pub fn with_hooks(mut self, normalize: Arc<dyn NormalizeHook>, dedup: Arc<dyn DedupHook>) -> Self {
        self.normalize = normalize;
        self.dedup = dedup;
        self
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Runs every adapter on its own task and joins them in registry order against one shared
    /// deadline. A task still running at the deadline is aborted and counted as timed out, even
    /// when it blocks its worker thread and never yields.
    pub async fn collect(&self, ctx: &CollectContext) -> (Vec<CollectedBatch>, Vec<AdapterFailure>) {
        let deadline = tokio::time::Instant::now() + self.adapter_timeout;
        let handles: Vec<_> = self
            .registry
            .adapters()
            .iter()
            .map(|adapter| {
                let adapter = adapter.clone();
                let ctx = ctx.clone();
                let provider = adapter.provider().to_string();
                let handle = tokio::spawn(async move { adapter.fetch(&ctx).await });
                (provider, handle)
            })
            .collect();

        let mut batches = Vec::new();
        let mut failures = Vec::new();
        for (provider, mut handle) in handles {
            let failure = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(records))) => {
                    debug!(provider, records = records.len(), "adapter finished");
                    batches.push(CollectedBatch { provider, records });
                    continue;
                }
                Ok(Ok(Err(err))) => (FailureKind::Error, err.to_string()),
                Err(_elapsed) => {
                    handle.abort();
                    (
                        FailureKind::Timeout,
                        format!("timed out after {:?}", self.adapter_timeout),
                    )
                }
                Ok(Err(join_err)) if join_err.is_panic() => {
                    (FailureKind::Panic, panic_message(join_err.into_panic()))
                }
                Ok(Err(join_err)) => (FailureKind::Error, join_err.to_string()),
            };
            warn!(provider, kind = ?failure.0, reason = %failure.1, "adapter failed");
            failures.push(AdapterFailure {
                provider,
                kind: failure.0,
                reason: failure.1,
            });
        }
        (batches, failures)
    }

    /// Builds a fresh corpus. `previous` only feeds the `added` count.
    pub async fn build(&self, previous: Option<&Corpus>) -> Result<(Corpus, RefreshSummary), RefreshError> {
        let ctx = CollectContext::new();
        let span = info_span!("refresh", run_id = %ctx.run_id);
        self.build_with(ctx, previous).instrument(span).await
    }

    async fn build_with(
        &self,
        ctx: CollectContext,
        previous: Option<&Corpus>,
    ) -> Result<(Corpus, RefreshSummary), RefreshError> {
        let (batches, adapter_failures) = self.collect(&ctx).await;
        let collected_records = batches.iter().map(|b| b.records.len()).sum();

        let normalize = self.normalize.clone();
        let dedup = self.dedup.clone();
        let built_at = Utc::now();
        let staged = tokio::task::spawn_blocking(move || -> Result<StageOutput, RefreshError> {
            let mut opportunities = Vec::new();
            let mut dropped = 0usize;
            for batch in &batches {
                let normalized = normalize
                    .apply(&batch.provider, &batch.records)
                    .map_err(|err| RefreshError::Stage {
                        stage: "normalize",
                        message: format!("{err:#}"),
                    })?;
                dropped += normalized.dropped;
                opportunities.extend(normalized.opportunities);
            }
            let outcome = dedup
                .apply(opportunities, built_at)
                .map_err(|err| RefreshError::Stage {
                    stage: "dedupe",
                    message: format!("{err:#}"),
                })?;
            Ok(StageOutput { outcome, dropped })
        })
        .await
        .map_err(|join_err| {
            if join_err.is_panic() {
                RefreshError::Panicked(panic_message(join_err.into_panic()))
            } else {
                RefreshError::Stage {
                    stage: "blocking",
                    message: join_err.to_string(),
                }
            }
        })??;

        let corpus = staged.outcome.corpus;
        let added = corpus
            .entries()
            .iter()
            .filter(|e| !previous.is_some_and(|p| p.contains_key(&e.key)))
            .count();

        let summary = RefreshSummary {
            run_id: ctx.run_id,
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            adapters: self.registry.len(),
            collected_records,
            dropped_records: staged.dropped,
            duplicates_discarded: staged.outcome.discarded,
            corpus_size: corpus.len(),
            added,
            adapter_failures,
            near_duplicates: staged.outcome.near_duplicates,
        };
        info!(
            corpus_size = summary.corpus_size,
            added = summary.added,
            dropped = summary.dropped_records,
            duplicates = summary.duplicates_discarded,
            failed_adapters = summary.adapter_failures.len(),
            "refresh complete"
        );
        Ok((corpus, summary))
    }
}

#[derive(Debug, Clone)]
struct CachedCorpus {
    corpus: Arc<Corpus>,
    stored_at: Instant,
}

/// Single-slot corpus cache with TTL, one refresh at a time, atomic replace on success.
#[derive(Debug)]
pub struct CorpusCache {
    pipeline: RefreshPipeline,
    ttl: Duration,
    slot: RwLock<Option<CachedCorpus>>,
    last_summary: RwLock<Option<RefreshSummary>>,
    refresh_lock: Mutex<()>,
}

impl CorpusCache {
    pub fn new(pipeline: RefreshPipeline, ttl: Duration) -> Self {
        Self {
            pipeline,
            ttl,
            slot: RwLock::new(None),
            last_summary: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current corpus regardless of age, without refreshing.
    pub async fn peek(&self) -> Option<Arc<Corpus>> {
        self.slot.read().await.as_ref().map(|c| c.corpus.clone())
    }

    pub async fn age(&self) -> Option<Duration> {
        self.slot.read().await.as_ref().map(|c| c.stored_at.elapsed())
    }

    pub async fn last_summary(&self) -> Option<RefreshSummary> {
        self.last_summary.read().await.clone()
    }

    async fn fresh_within(&self, window: Duration) -> Option<Arc<Corpus>> {
        self.slot
            .read()
            .await
            .as_ref()
            .filter(|c| c.stored_at.elapsed() < window)
            .map(|c| c.corpus.clone())
    }

    pub async fn get(&self) -> Result<Arc<Corpus>, RefreshError> {
        self.get_within(self.ttl).await
    }

    /// Returns a corpus no older than `window`, refreshing when stale.
    ///
    /// With a previous corpus in place, a stale read never waits: if another refresh is in
    /// flight, or this one fails, the previous corpus is returned.
    pub async fn get_within(&self, window: Duration) -> Result<Arc<Corpus>, RefreshError> {
        if let Some(corpus) = self.fresh_within(window).await {
            debug!(entries = corpus.len(), "corpus cache hit");
            return Ok(corpus);
        }

        let Some(previous) = self.peek().await else {
            let guard = self.refresh_lock.lock().await;
            if let Some(corpus) = self.peek().await {
                return Ok(corpus);
            }
            return self.refresh_locked(guard).await.map(|(corpus, _)| corpus);
        };

        let Ok(guard) = self.refresh_lock.try_lock() else {
            debug!("refresh in flight; serving previous corpus");
            return Ok(previous);
        };
        if let Some(corpus) = self.fresh_within(window).await {
            return Ok(corpus);
        }
        match self.refresh_locked(guard).await {
            Ok((corpus, _)) => Ok(corpus),
            Err(err) => {
                warn!(error = %err, "refresh failed; keeping previous corpus");
                Ok(previous)
            }
        }
    }

    /// Rebuilds unconditionally, waiting for any in-flight refresh first.
    pub async fn force_refresh(&self) -> Result<(Arc<Corpus>, RefreshSummary), RefreshError> {
        let guard = self.refresh_lock.lock().await;
        self.refresh_locked(guard).await
    }

    async fn refresh_locked(
        &self,
        _guard: MutexGuard<'_, ()>,
    ) -> Result<(Arc<Corpus>, RefreshSummary), RefreshError> {
        let previous = self.peek().await;
        let (corpus, summary) = match self.pipeline.build(previous.as_deref()).await {
            Ok(built) => built,
            Err(err) => {
                warn!(error = %err, "refresh failed");
                return Err(err);
            }
        };

        let corpus = Arc::new(corpus);
        *self.slot.write().await = Some(CachedCorpus {
            corpus: corpus.clone(),
            stored_at: Instant::now(),
        });
        *self.last_summary.write().await = Some(summary.clone());
        Ok((corpus, summary))
    }
}

/// One exported corpus row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    pub id: String,
    pub name: String,
    pub provider_name: String,
    pub closing_date: String,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub amount_display: String,
    pub category: String,
    pub status: String,
    pub link: String,
    pub description: String,
}

impl From<&Opportunity> for ExportRow {
    fn from(o: &Opportunity) -> Self {
        Self {
            id: o.id.to_string(),
            name: o.name.clone(),
            provider_name: o.provider_name.clone(),
            closing_date: o.closing_date.format("%Y-%m-%d").to_string(),
            amount: o.amount.value(),
            currency: o.amount.currency().map(ToString::to_string),
            amount_display: o.amount.display(),
            category: o.category.clone(),
            status: o.status.to_string(),
            link: o.link.clone(),
            description: o.description.clone(),
        }
    }
}

/// Rows in corpus order.
pub fn export_rows(corpus: &Corpus) -> Vec<ExportRow> {
    corpus.iter().map(ExportRow::from).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub built_at: DateTime<Utc>,
    pub rows: usize,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn write_opportunities_parquet(path: &Path, rows: &[ExportRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("provider_name", DataType::Utf8, false),
        ArrowField::new("closing_date", DataType::Utf8, false),
        ArrowField::new("amount", DataType::Float64, true),
        ArrowField::new("currency", DataType::Utf8, true),
        ArrowField::new("amount_display", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("link", DataType::Utf8, false),
        ArrowField::new("description", DataType::Utf8, false),
    ]));

    let text_column = |f: fn(&ExportRow) -> &str| -> ArrayRef {
        Arc::new(StringArray::from(rows.iter().map(f).collect::<Vec<_>>()))
    };
    let batch = RecordBatch::try_new(
        schema,
        vec![
            text_column(|r| &r.id),
            text_column(|r| &r.name),
            text_column(|r| &r.provider_name),
            text_column(|r| &r.closing_date),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.amount).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.currency.as_deref()).collect::<Vec<_>>(),
            )),
            text_column(|r| &r.amount_display),
            text_column(|r| &r.category),
            text_column(|r| &r.status),
            text_column(|r| &r.link),
            text_column(|r| &r.description),
        ],
    )
    .context("building opportunities record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn snapshot_file(name: &str, dir: &Path, path: &Path) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Writes `opportunities.parquet` and `manifest.json` into `dir`; returns the manifest path.
pub async fn write_snapshot(dir: &Path, corpus: &Corpus) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let rows = export_rows(corpus);
    let parquet_path = dir.join("opportunities.parquet");
    write_opportunities_parquet(&parquet_path, &rows)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        built_at: corpus.built_at(),
        rows: rows.len(),
        files: vec![snapshot_file("opportunities", dir, &parquet_path)?],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

/// Owns collection, normalization, dedupe, the cache and the query engine.
#[derive(Debug)]
pub struct Aggregator {
    config: AggregatorConfig,
    cache: CorpusCache,
    engine: QueryEngine,
}

impl Aggregator {
    /// Wires the default normalizer and query engine to one shared taxonomy.
    pub fn new(config: AggregatorConfig, registry: AdapterRegistry) -> Self {
        let taxonomy = Arc::new(Taxonomy::builtin());
        let dedup = Deduplicator::new(config.near_duplicate_threshold);
        let pipeline = RefreshPipeline::new(registry, config.adapter_timeout).with_hooks(
            Arc::new(FieldNormalizer::new(taxonomy.clone())),
            Arc::new(dedup),
        );
        Self::from_parts(config, pipeline, QueryEngine::new(taxonomy))
    }

    pub fn from_parts(config: AggregatorConfig, pipeline: RefreshPipeline, engine: QueryEngine) -> Self {
        let cache = CorpusCache::new(pipeline, config.search_ttl);
        Self {
            config,
            cache,
            engine,
        }
    }

    pub fn from_config(config: AggregatorConfig) -> Result<Self> {
        let registry = registry_from_config(&config)?;
        info!(providers = ?registry.providers(), "adapter registry loaded");
        Ok(Self::new(config, registry))
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn cache(&self) -> &CorpusCache {
        &self.cache
    }

    pub async fn refresh(&self) -> Result<RefreshSummary, RefreshError> {
        self.cache.force_refresh().await.map(|(_, summary)| summary)
    }

    /// Corpus for listing callers, held to the listing window.
    pub async fn corpus(&self) -> Result<Arc<Corpus>, RefreshError> {
        self.cache.get_within(self.config.listing_ttl).await
    }

    pub async fn query(
        &self,
        text: &str,
        filters: &QueryFilters,
        page: usize,
    ) -> Result<QueryOutcome, RefreshError> {
        self.query_page(text, filters, page, self.config.page_size).await
    }

    pub async fn query_page(
        &self,
        text: &str,
        filters: &QueryFilters,
        page: usize,
        page_size: usize,
    ) -> Result<QueryOutcome, RefreshError> {
        let corpus = self.cache.get_within(self.config.search_ttl).await?;
        Ok(self.engine.query(&corpus, text, filters, page, page_size))
    }

    pub async fn export(&self) -> Result<Vec<ExportRow>, RefreshError> {
        let corpus = self.corpus().await?;
        Ok(export_rows(&corpus))
    }

    pub async fn write_snapshot(&self, dir: &Path) -> Result<PathBuf> {
        let corpus = self.corpus().await?;
        write_snapshot(dir, &corpus).await
    }

    /// Cron job that calls [`Aggregator::refresh`]; `None` unless the scheduler is enabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.refresh_cron.as_str();
        let aggregator = Arc::clone(self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let aggregator = aggregator.clone();
            Box::pin(async move {
                match aggregator.refresh().await {
                    Ok(summary) => {
                        let (count, errors) = summary.counts();
                        info!(count, errors, "scheduled refresh finished");
                    }
                    Err(err) => warn!(error = %err, "scheduled refresh failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fof_core::{unscheduled_closing_date, Amount, OpportunityStatus, GENERAL_CATEGORY};

    fn opportunity(name: &str, provider: &str) -> Opportunity {
        Opportunity {
            id: Opportunity::derive_id(provider, name),
            name: name.to_string(),
            provider_name: provider.to_string(),
            closing_date: unscheduled_closing_date(),
            amount: Amount::Unknown,
            category: GENERAL_CATEGORY.to_string(),
            status: OpportunityStatus::Unknown,
            link: String::new(),
            description: String::new(),
        }
    }

    #[test]
    fn first_seen_wins_and_duplicates_are_counted() {
        let outcome = Deduplicator::default().dedupe(
            vec![
                opportunity("Rural Water Fund", "MinAgricultura"),
                opportunity("rural water fund ", "FONTAGRO"),
                opportunity("Youth AgTech Grant", "FONTAGRO"),
            ],
            Utc::now(),
        );

        assert_eq!(outcome.corpus.len(), 2);
        assert_eq!(outcome.discarded, 1);
        let first = outcome.corpus.get("rural water fund").unwrap();
        assert_eq!(first.provider_name, "MinAgricultura");
        assert_eq!(first.name, "Rural Water Fund");
        let keys: Vec<_> = outcome.corpus.entries().iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["rural water fund", "youth agtech grant"]);
    }

    #[test]
    fn near_duplicates_are_reported_not_merged() {
        let outcome = Deduplicator::new(0.9).dedupe(
            vec![
                opportunity("Youth AgTech Grant", "A"),
                opportunity("Youth AgTech Grants", "B"),
                opportunity("Soil Carbon Monitoring Fund", "C"),
            ],
            Utc::now(),
        );

        assert_eq!(outcome.corpus.len(), 3);
        assert_eq!(outcome.near_duplicates.len(), 1);
        let pair = &outcome.near_duplicates[0];
        assert_eq!(pair.key_a, "youth agtech grant");
        assert_eq!(pair.key_b, "youth agtech grants");
        assert!(pair.similarity >= 0.9);
    }

    #[test]
    fn counts_report_corpus_size_and_errors() {
        let summary = RefreshSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            adapters: 3,
            collected_records: 6,
            dropped_records: 1,
            duplicates_discarded: 2,
            corpus_size: 3,
            added: 3,
            adapter_failures: vec![AdapterFailure {
                provider: "FAO".into(),
                kind: FailureKind::Timeout,
                reason: "timed out".into(),
            }],
            near_duplicates: Vec::new(),
        };
        assert_eq!(summary.counts(), (3, 2));
    }

    #[test]
    fn export_rows_follow_corpus_order() {
        let mut corpus = Corpus::new(Utc::now());
        corpus.insert_if_absent(opportunity("B grant", "X"), Utc::now());
        corpus.insert_if_absent(opportunity("A grant", "Y"), Utc::now());

        let rows = export_rows(&corpus);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "B grant");
        assert_eq!(rows[0].closing_date, "9999-12-31");
        assert_eq!(rows[0].amount, None);
        assert_eq!(rows[0].amount_display, "unknown");
        assert_eq!(rows[1].provider_name, "Y");
    }

    #[test]
    fn sources_path_resolves_against_workspace_root() {
        let config = AggregatorConfig {
            workspace_root: PathBuf::from("/srv/fof"),
            ..Default::default()
        };
        assert_eq!(config.sources_path(), PathBuf::from("/srv/fof/sources.yaml"));
        assert_eq!(config.search_ttl, Duration::from_secs(1800));
        assert_eq!(config.listing_ttl, Duration::from_secs(300));
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "non-string panic payload");
    }
}
