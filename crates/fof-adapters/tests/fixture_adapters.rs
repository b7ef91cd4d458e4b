use std::path::{Path, PathBuf};
use std::sync::Arc;

use fof_adapters::{load_sources, AdapterRegistry, CollectContext};
use fof_core::fields;
use fof_http::{FetcherConfig, HttpFetcher};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

#[tokio::test]
async fn workspace_sources_load_every_enabled_fixture() {
    let root = workspace_root();
    let sources = load_sources(root.join("sources.yaml")).expect("sources.yaml");
    assert_eq!(sources.len(), 5);

    let http = Arc::new(HttpFetcher::new(FetcherConfig::default()).expect("http"));
    let registry = AdapterRegistry::from_sources(&sources, &root, http).expect("registry");
    assert_eq!(registry.providers(), vec!["MinAgricultura", "FONTAGRO", "IICA", "FAO"]);

    let ctx = CollectContext::new();
    let mut counts = Vec::new();
    for adapter in registry.adapters() {
        let records = adapter.fetch(&ctx).await.expect("fixture fetch");
        counts.push(records.len());
    }
    assert_eq!(counts, vec![4, 3, 3, 2]);
}

#[tokio::test]
async fn html_fixture_exposes_links_and_spanish_headers() {
    let root = workspace_root();
    let sources = load_sources(root.join("sources.yaml")).expect("sources.yaml");
    let http = Arc::new(HttpFetcher::new(FetcherConfig::default()).expect("http"));
    let registry = AdapterRegistry::from_sources(&sources, &root, http).expect("registry");

    let iica = registry
        .adapters()
        .iter()
        .find(|a| a.provider() == "IICA")
        .expect("iica adapter");
    let records = iica.fetch(&CollectContext::new()).await.expect("fetch");

    assert_eq!(
        records[0].text(fields::NAME).as_deref(),
        Some("Premio Mujeres Rurales Innovadoras")
    );
    assert_eq!(
        records[0].text(fields::LINK).as_deref(),
        Some("https://iica.int/es/convocatorias/mujeres-rurales")
    );
    assert_eq!(records[0].text(fields::CATEGORY).as_deref(), Some("Género"));
    assert_eq!(records[2].text(fields::AMOUNT), None);
}
