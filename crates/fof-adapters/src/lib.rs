//! Collector adapter contract, the adapter kinds FOF ships with, and the adapter registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fof_core::{fold_text, RawRecord};
use fof_http::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fof-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    JsonFixture,
    HtmlTable,
    HttpJson,
}

/// Per-refresh context handed to every adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl CollectContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

impl Default for CollectContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One provider's source of raw records.
///
/// Implementations report every internal fault through the returned error; the orchestrator
/// additionally bounds each call with a timeout and isolates panics.
#[async_trait]
pub trait CollectorAdapter: Send + Sync {
    fn provider(&self) -> &str;

    async fn fetch(&self, ctx: &CollectContext) -> Result<Vec<RawRecord>, AdapterError>;
}

/// Source registry entry, as listed in `sources.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: AdapterKind,
    /// File path (relative to the workspace root) or URL.
    pub location: String,
    #[serde(default)]
    pub records_pointer: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

async fn read_location(
    provider: &str,
    location: &str,
    http: Option<&HttpFetcher>,
) -> Result<String, AdapterError> {
    if is_remote(location) {
        let http = http.ok_or_else(|| {
            AdapterError::Message(format!("{provider}: no http client for remote location {location}"))
        })?;
        return Ok(http.get_text(provider, location).await?);
    }
    tokio::fs::read_to_string(location)
        .await
        .map_err(|source| AdapterError::Io {
            path: PathBuf::from(location),
            source,
        })
}

fn json_at<'a>(value: &'a JsonValue, path: &[String]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(segment.as_str())?;
    }
    Some(cur)
}

/// Extracts records from a JSON payload: an array at `pointer`, or an object carrying `records`.
pub fn records_from_payload(value: &JsonValue, pointer: &[String]) -> Result<Vec<RawRecord>, AdapterError> {
    let target = json_at(value, pointer).ok_or_else(|| {
        AdapterError::InvalidPayload(format!("no value at pointer /{}", pointer.join("/")))
    })?;
    let items = match target {
        JsonValue::Array(items) => items,
        JsonValue::Object(map) => match map.get("records") {
            Some(JsonValue::Array(items)) => items,
            _ => {
                return Err(AdapterError::InvalidPayload(
                    "object payload without a `records` array".to_string(),
                ))
            }
        },
        other => {
            return Err(AdapterError::InvalidPayload(format!(
                "expected array of records, found {}",
                json_kind(other)
            )))
        }
    };

    let total = items.len();
    let records = items
        .iter()
        .cloned()
        .filter_map(RawRecord::from_json)
        .collect::<Vec<_>>();
    if records.len() != total {
        debug!(skipped = total - records.len(), "skipped non-object record entries");
    }
    Ok(records)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Maps a column header to the raw field name it carries.
fn header_key(header: &str) -> String {
    let folded = fold_text(header.trim());
    let known = match folded.as_str() {
        "convocatoria" | "nombre" | "titulo" | "name" | "title" => "name",
        "entidad" | "proveedor" | "provider" => "provider",
        "fecha de cierre" | "cierre" | "deadline" | "closing date" => "closing_date",
        "monto" | "amount" | "financiamiento" | "funding" => "amount",
        "estado" | "status" => "status",
        "area" | "categoria" | "category" | "sector" => "category",
        "descripcion" | "description" | "resumen" | "summary" => "description",
        "enlace" | "link" | "url" => "link",
        _ => "",
    };
    if !known.is_empty() {
        return known.to_string();
    }
    folded
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Reads the first `<table>` of an HTML page into records keyed by header text.
pub fn parse_html_table(html: &str) -> Result<Vec<RawRecord>, AdapterError> {
    let document = Html::parse_document(html);
    let table_sel = parse_selector("table")?;
    let row_sel = parse_selector("tr")?;
    let header_sel = parse_selector("th")?;
    let cell_sel = parse_selector("td")?;
    let link_sel = parse_selector("a[href]")?;

    let Some(table) = document.select(&table_sel).next() else {
        return Err(AdapterError::InvalidPayload("no <table> in page".to_string()));
    };

    let mut headers: Vec<String> = Vec::new();
    let mut records = Vec::new();
    for row in table.select(&row_sel) {
        let header_cells = row.select(&header_sel).map(element_text).collect::<Vec<_>>();
        if headers.is_empty() && !header_cells.is_empty() {
            headers = header_cells.iter().map(|h| header_key(h)).collect();
            continue;
        }

        let cells = row.select(&cell_sel).collect::<Vec<_>>();
        if cells.is_empty() {
            continue;
        }
        let mut record = RawRecord::new();
        for (idx, cell) in cells.iter().enumerate() {
            let Some(key) = headers.get(idx) else {
                break;
            };
            let text = element_text(*cell);
            if !text.is_empty() {
                record.insert(key, text);
            }
        }
        if record.get("link").is_none() {
            if let Some(href) = row
                .select(&link_sel)
                .next()
                .and_then(|a| a.value().attr("href"))
            {
                record.insert("link", href.trim().to_string());
            }
        }
        if !record.is_empty() {
            records.push(record);
        }
    }

    if headers.is_empty() {
        return Err(AdapterError::InvalidPayload("table has no header row".to_string()));
    }
    Ok(records)
}

/// Records stored as JSON on disk (or at a URL) under an optional pointer path.
#[derive(Debug)]
pub struct JsonFeedAdapter {
    provider: String,
    location: String,
    records_pointer: Vec<String>,
    http: Option<Arc<HttpFetcher>>,
}

impl JsonFeedAdapter {
    pub fn from_file(provider: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self {
            provider: provider.into(),
            location: path.as_ref().display().to_string(),
            records_pointer: Vec::new(),
            http: None,
        }
    }

    pub fn from_url(provider: impl Into<String>, url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            provider: provider.into(),
            location: url.into(),
            records_pointer: Vec::new(),
            http: Some(http),
        }
    }

    pub fn with_records_pointer(mut self, pointer: Vec<String>) -> Self {
        self.records_pointer = pointer;
        self
    }
}

#[async_trait]
impl CollectorAdapter for JsonFeedAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn fetch(&self, _ctx: &CollectContext) -> Result<Vec<RawRecord>, AdapterError> {
        let text = read_location(&self.provider, &self.location, self.http.as_deref()).await?;
        let value: JsonValue = serde_json::from_str(&text)
            .map_err(|e| AdapterError::InvalidPayload(format!("{}: {e}", self.location)))?;
        records_from_payload(&value, &self.records_pointer)
    }
}

/// Records read from the first HTML table of a page.
#[derive(Debug)]
pub struct HtmlTableAdapter {
    provider: String,
    location: String,
    http: Option<Arc<HttpFetcher>>,
}

impl HtmlTableAdapter {
    pub fn new(provider: impl Into<String>, location: impl Into<String>, http: Option<Arc<HttpFetcher>>) -> Self {
        Self {
            provider: provider.into(),
            location: location.into(),
            http,
        }
    }
}

#[async_trait]
impl CollectorAdapter for HtmlTableAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn fetch(&self, _ctx: &CollectContext) -> Result<Vec<RawRecord>, AdapterError> {
        let html = read_location(&self.provider, &self.location, self.http.as_deref()).await?;
        parse_html_table(&html)
    }
}

/// Fixed in-memory records.
#[derive(Debug, Clone)]
pub struct StaticAdapter {
    provider: String,
    records: Vec<RawRecord>,
}

impl StaticAdapter {
    pub fn new(provider: impl Into<String>, records: Vec<RawRecord>) -> Self {
        Self {
            provider: provider.into(),
            records,
        }
    }
}

#[async_trait]
impl CollectorAdapter for StaticAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn fetch(&self, _ctx: &CollectContext) -> Result<Vec<RawRecord>, AdapterError> {
        Ok(self.records.clone())
    }
}

/// Ordered set of adapters; iteration order decides first-seen attribution on duplicates.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn CollectorAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn CollectorAdapter>) {
        self.adapters.push(adapter);
    }

    pub fn with(mut self, adapter: impl CollectorAdapter + 'static) -> Self {
        self.register(Arc::new(adapter));
        self
    }

    pub fn adapters(&self) -> &[Arc<dyn CollectorAdapter>] {
        &self.adapters
    }

    pub fn providers(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.provider()).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Builds adapters for every enabled source; local locations resolve against `workspace_root`.
    pub fn from_sources(
        sources: &[SourceConfig],
        workspace_root: &Path,
        http: Arc<HttpFetcher>,
    ) -> Result<Self> {
        let mut registry = Self::new();
        for source in sources.iter().filter(|s| s.enabled) {
            let location = if is_remote(&source.location) {
                source.location.clone()
            } else {
                workspace_root.join(&source.location).display().to_string()
            };
            let adapter: Arc<dyn CollectorAdapter> = match source.kind {
                AdapterKind::JsonFixture => Arc::new(
                    JsonFeedAdapter::from_file(&source.display_name, &location)
                        .with_records_pointer(source.records_pointer.clone()),
                ),
                AdapterKind::HttpJson => {
                    if !is_remote(&location) {
                        anyhow::bail!(
                            "source {} is http-json but location {} is not a URL",
                            source.source_id,
                            source.location
                        );
                    }
                    Arc::new(
                        JsonFeedAdapter::from_url(&source.display_name, &location, http.clone())
                            .with_records_pointer(source.records_pointer.clone()),
                    )
                }
                AdapterKind::HtmlTable => Arc::new(HtmlTableAdapter::new(
                    &source.display_name,
                    location,
                    Some(http.clone()),
                )),
            };
            registry.register(adapter);
        }
        Ok(registry)
    }
}

/// Reads and parses a YAML source registry file.
pub fn load_sources(path: impl AsRef<Path>) -> Result<Vec<SourceConfig>> {
    #[derive(Deserialize)]
    struct SourcesFile {
        sources: Vec<SourceConfig>,
    }

    let path = path.as_ref();
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: SourcesFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(parsed.sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fof_core::fields;
    use fof_http::FetcherConfig;
    use serde_json::json;

    const TABLE: &str = r#"
        <html><body>
          <h1>Convocatorias</h1>
          <table>
            <thead><tr><th>Convocatoria</th><th>Fecha de cierre</th><th>Monto</th><th>Estado</th></tr></thead>
            <tbody>
              <tr><td><a href="https://example.org/riego">Fondo de Riego Andino</a></td><td>15/03/2026</td><td>COP 120.000.000</td><td>Abierta</td></tr>
              <tr><td>Becas  de   investigación</td><td></td><td>USD</td><td>Cerrada</td></tr>
              <tr></tr>
            </tbody>
          </table>
        </body></html>
    "#;

    fn http() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(FetcherConfig::default()).unwrap())
    }

    #[test]
    fn payload_accepts_arrays_records_objects_and_pointers() {
        let array = json!([{ "name": "A" }, "junk", { "name": "B" }]);
        assert_eq!(records_from_payload(&array, &[]).unwrap().len(), 2);

        let wrapped = json!({ "provider": "FONTAGRO", "records": [{ "title": "C" }] });
        let records = records_from_payload(&wrapped, &[]).unwrap();
        assert_eq!(records[0].text(fields::NAME).as_deref(), Some("C"));

        let nested = json!({ "data": { "items": [{ "nombre": "D" }] } });
        let pointer = vec!["data".to_string(), "items".to_string()];
        assert_eq!(records_from_payload(&nested, &pointer).unwrap().len(), 1);
    }

    #[test]
    fn payload_errors_are_reported_not_panicked() {
        let err = records_from_payload(&json!({ "data": 3 }), &["data".to_string()]).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidPayload(_)));
        let err = records_from_payload(&json!({}), &["missing".to_string()]).unwrap_err();
        assert!(err.to_string().contains("/missing"));
    }

    #[test]
    fn html_table_rows_map_to_known_fields() {
        let records = parse_html_table(TABLE).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.text(fields::NAME).as_deref(), Some("Fondo de Riego Andino"));
        assert_eq!(first.text(fields::CLOSING_DATE).as_deref(), Some("15/03/2026"));
        assert_eq!(first.text(fields::LINK).as_deref(), Some("https://example.org/riego"));
        assert_eq!(first.text(fields::STATUS).as_deref(), Some("Abierta"));

        let second = &records[1];
        assert_eq!(second.text(fields::NAME).as_deref(), Some("Becas de investigación"));
        assert_eq!(second.text(fields::CLOSING_DATE), None);
        assert_eq!(second.text(fields::LINK), None);
    }

    #[test]
    fn html_without_table_is_invalid() {
        let err = parse_html_table("<html><p>maintenance</p></html>").unwrap_err();
        assert!(matches!(err, AdapterError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn missing_fixture_file_is_an_io_error() {
        let adapter = JsonFeedAdapter::from_file("ghost", "/definitely/not/here.json");
        let err = adapter.fetch(&CollectContext::new()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Io { .. }));
    }

    #[tokio::test]
    async fn static_adapter_returns_its_records() {
        let adapter = StaticAdapter::new("FAO", vec![RawRecord::new().with("name", "Fund")]);
        let records = adapter.fetch(&CollectContext::new()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(adapter.provider(), "FAO");
    }

    #[test]
    fn registry_skips_disabled_sources_and_keeps_order() {
        let sources = vec![
            SourceConfig {
                source_id: "iica".into(),
                display_name: "IICA".into(),
                enabled: true,
                kind: AdapterKind::HtmlTable,
                location: "fixtures/iica/convocatorias.html".into(),
                records_pointer: vec![],
                notes: None,
            },
            SourceConfig {
                source_id: "bid".into(),
                display_name: "BID Lab".into(),
                enabled: false,
                kind: AdapterKind::HttpJson,
                location: "https://example.org/feed.json".into(),
                records_pointer: vec![],
                notes: None,
            },
            SourceConfig {
                source_id: "fao".into(),
                display_name: "FAO".into(),
                enabled: true,
                kind: AdapterKind::JsonFixture,
                location: "fixtures/fao/feed.json".into(),
                records_pointer: vec!["data".into(), "items".into()],
                notes: None,
            },
        ];
        let registry = AdapterRegistry::from_sources(&sources, Path::new("."), http()).unwrap();
        assert_eq!(registry.providers(), vec!["IICA", "FAO"]);
    }

    #[test]
    fn http_json_source_requires_url() {
        let sources = vec![SourceConfig {
            source_id: "bad".into(),
            display_name: "Bad".into(),
            enabled: true,
            kind: AdapterKind::HttpJson,
            location: "fixtures/bad.json".into(),
            records_pointer: vec![],
            notes: None,
        }];
        assert!(AdapterRegistry::from_sources(&sources, Path::new("."), http()).is_err());
    }

    #[test]
    fn header_keys_fold_accents_and_fall_back_to_slugs() {
        assert_eq!(header_key("Descripción"), "description");
        assert_eq!(header_key("Área"), "category");
        assert_eq!(header_key("Población objetivo"), "poblacion_objetivo");
    }
}
